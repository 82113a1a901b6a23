//! BTT (Block Translation Table) metadata.
//!
//! A namespace in sector-atomic mode carries a chain of BTT arenas over
//! its raw capacity, each arena holding an info block, a data area, a
//! map of external-to-internal block translations, a free-list log, and
//! a backup info block. This crate implements the on-media formats and a
//! consistency checker with targeted repair, generic over a positioned
//! I/O [`media::Media`] so it runs against raw block devices and plain
//! image files alike.

pub mod check;
pub mod media;
pub mod structures;

pub use check::{ArenaStatus, BttCheck, CheckOpts, CheckSummary};
pub use media::{Media, RamMedia};
pub use structures::info::{InfoFlags, RawBttInfo};
pub use structures::log::{LogEntry, RawLogEntry};

/// Errors produced by the arena discovery and check pipeline.
#[derive(Debug, thiserror::Error)]
pub enum BttError {
    /// The media faulted or transferred short; the check aborts cleanly.
    #[error("media error while accessing btt metadata")]
    Media(#[from] std::io::Error),

    /// Neither start offset held a valid info block and recovery failed.
    #[error("no valid BTT info block found or recovered")]
    NoInfoBlock,

    /// The info block error flag is set; the arena is beyond checking.
    #[error("arena {0}: info block error flag is set")]
    ErrorFlag(usize),

    /// Counts or sizes in a verified info block contradict each other.
    #[error("arena {0}: inconsistent info block geometry")]
    Geometry(usize),

    /// A write is required to proceed but repair was not requested.
    #[error("metadata needs to be restored; re-run with repair enabled")]
    RepairNeeded,

    /// A per-arena consistency check failed.
    #[error("arena {arena}: {status}")]
    Arena {
        arena: usize,
        status: check::ArenaStatus,
    },
}
