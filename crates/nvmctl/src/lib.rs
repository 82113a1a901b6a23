//! Userspace management of NVDIMM (persistent memory) devices.
//!
//! The entry point is [`Ctx`], which enumerates buses, dimms, regions,
//! and namespaces from the platform's control filesystem. On top of the
//! object graph sit the label store operations (init/zero/read per dimm),
//! the namespace lifecycle (create/reconfigure/destroy), the BTT
//! consistency checker, and the address-range-scrub command builders.
//!
//! Enumeration is lazy and idempotent; objects are addressed through
//! their owners and carry a region `generation` stamp so that handles
//! held across a region disable surface as stale instead of dangling.

pub mod ars;
pub mod bus;
pub mod checkns;
pub mod cmd;
pub mod ctx;
pub mod dimm;
pub mod inject;
pub mod lifecycle;
pub mod region;
pub mod sysfs;
pub mod transport;

pub use ars::{ArsCap, ArsStart, ArsStatus, ClearError, ScrubType};
pub use bus::Bus;
pub use checkns::{CheckNsOpts, check_namespace};
pub use cmd::{CfgRead, CfgSize, CfgWrite};
pub use ctx::Ctx;
pub use dimm::{Dimm, DimmFlags};
pub use inject::BadRangeList;
pub use lifecycle::{CreateParams, MapLocation, NsMode};
pub use region::{Child, ChildKind, Mapping, Namespace, NsType, Region, RegionType};
pub use transport::{CtlTransport, DevTransport};

/// Everything that can go wrong while managing devices.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}: busy")]
    Busy(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("no such device: {0}")]
    NotFound(String),

    /// The OS accepted the command but firmware reported failure.
    #[error("firmware status {0:#x}")]
    Firmware(u32),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("corrupt metadata: {0}")]
    Corrupt(String),

    /// The object's region was disabled after this handle was taken.
    #[error("{0}: stale handle, region was re-enabled")]
    Stale(String),

    /// The region cannot satisfy this request; a sibling might.
    #[error("{0}: not suitable for this request")]
    Unsuitable(String),

    #[error(transparent)]
    Label(#[from] nvmctl_label::LabelError),

    #[error(transparent)]
    Btt(#[from] nvmctl_btt::BttError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Errno-style process exit code for the CLI: always negative.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => -libc::EINVAL,
            Error::Busy(_) => -libc::EBUSY,
            Error::NotSupported(_) => -libc::EOPNOTSUPP,
            Error::NotFound(_) => -libc::ENODEV,
            Error::Firmware(_) => -libc::EIO,
            Error::Io(err) => -err.raw_os_error().unwrap_or(libc::EIO),
            Error::Corrupt(_) => -libc::ENXIO,
            Error::Stale(_) => -libc::ESTALE,
            Error::Unsuitable(_) => -libc::EAGAIN,
            Error::Label(_) => -libc::ENXIO,
            Error::Btt(_) => -libc::ENXIO,
        }
    }
}
