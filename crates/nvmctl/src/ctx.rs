//! The root enumeration context.
//!
//! A [`Ctx`] is rooted at the platform's nd control tree and lazily
//! instantiates buses on first use. The expected layout underneath the
//! root is one directory per bus:
//!
//! ```text
//! <root>/ndbus<N>/
//!     provider commands wait_probe scrub
//!     nmem<M>/    one per dimm
//!     region<R>/  one per interleave set
//! ```
//!
//! Device attributes are plain one-line text files; control nodes
//! (`ndctl<N>`, `nmem<M>`, block devices) live under the device
//! directory, `/dev` on a live system. Both roots are constructor
//! parameters so the whole graph can be pointed at a synthetic tree.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{debug, info};

use crate::bus::Bus;
use crate::transport::{CtlTransport, DevTransport};
use crate::{Error, Result};

/// Default per-operation timeout for probe/scrub waits, in milliseconds.
const DEFAULT_TIMEOUT_MS: u64 = 5000;

pub struct Ctx {
    root: PathBuf,
    dev_dir: PathBuf,
    timeout_ms: u64,
    transport: Rc<dyn CtlTransport>,
    buses: Vec<Bus>,
    buses_init: bool,
}

impl Ctx {
    /// A context over the live system tree.
    pub fn new() -> Ctx {
        Ctx::with_roots(
            Path::new("/sys/bus/nd/devices"),
            Path::new("/dev"),
            Rc::new(DevTransport),
        )
    }

    /// A context over an arbitrary tree and transport (tests, images).
    pub fn with_roots(root: &Path, dev_dir: &Path, transport: Rc<dyn CtlTransport>) -> Ctx {
        Ctx {
            root: root.to_owned(),
            dev_dir: dev_dir.to_owned(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            transport,
            buses: Vec::new(),
            buses_init: false,
        }
    }

    pub fn set_timeout_ms(&mut self, timeout_ms: u64) {
        self.timeout_ms = timeout_ms;
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Drops all cached objects; the next access re-enumerates.
    pub fn invalidate(&mut self) {
        self.buses.clear();
        self.buses_init = false;
    }

    fn init_buses(&mut self) {
        if self.buses_init {
            return;
        }
        self.buses_init = true;
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) => {
                debug!("no bus directory at {}: {err}", self.root.display());
                return;
            }
        };
        let mut ids: Vec<(u32, PathBuf)> = entries
            .flatten()
            .filter_map(|e| {
                let name = e.file_name().into_string().ok()?;
                let id: u32 = name.strip_prefix("ndbus")?.parse().ok()?;
                Some((id, e.path()))
            })
            .collect();
        ids.sort_by_key(|(id, _)| *id);

        for (id, path) in ids {
            // An id already enumerated wins; re-enumeration is idempotent.
            if self.buses.iter().any(|b| b.id() == id) {
                continue;
            }
            match Bus::probe(
                id,
                &path,
                &self.dev_dir,
                self.timeout_ms,
                Rc::clone(&self.transport),
            ) {
                Ok(bus) => {
                    info!("found bus {} ({})", bus.devname(), bus.provider());
                    self.buses.push(bus);
                }
                Err(err) => debug!("skipping {}: {err}", path.display()),
            }
        }
    }

    pub fn buses(&mut self) -> &mut [Bus] {
        self.init_buses();
        &mut self.buses
    }

    pub fn bus_first(&mut self) -> Option<&mut Bus> {
        self.buses().first_mut()
    }

    pub fn bus_by_provider(&mut self, provider: &str) -> Result<&mut Bus> {
        self.init_buses();
        self.buses
            .iter_mut()
            .find(|b| b.provider() == provider)
            .ok_or_else(|| Error::NotFound(format!("bus with provider {provider:?}")))
    }
}

impl Default for Ctx {
    fn default() -> Self {
        Self::new()
    }
}
