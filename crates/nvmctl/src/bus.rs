//! One platform-firmware source of NVDIMM devices.

use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::dimm::Dimm;
use crate::region::Region;
use crate::sysfs::{read_attr, read_attr_opt};
use crate::transport::CtlTransport;
use crate::{Error, Result};

bitflags::bitflags! {
    /// Bus-scoped command support, parsed from the `commands` attribute.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BusCmds: u32 {
        const ARS_CAP = 1 << 1;
        const ARS_START = 1 << 2;
        const ARS_STATUS = 1 << 3;
        const CLEAR_ERROR = 1 << 4;
        const CALL = 1 << 10;
    }
}

fn parse_bus_commands(text: &str) -> BusCmds {
    let mut cmds = BusCmds::empty();
    for name in text.split_whitespace() {
        cmds |= match name {
            "ars_cap" => BusCmds::ARS_CAP,
            "ars_start" => BusCmds::ARS_START,
            "ars_status" => BusCmds::ARS_STATUS,
            "clear_error" => BusCmds::CLEAR_ERROR,
            "call" => BusCmds::CALL,
            _ => BusCmds::empty(),
        };
    }
    cmds
}

pub struct Bus {
    id: u32,
    path: PathBuf,
    dev_dir: PathBuf,
    provider: String,
    cmds: BusCmds,
    wait_probe_path: PathBuf,
    scrub_path: PathBuf,
    timeout_ms: u64,
    pub(crate) transport: Rc<dyn CtlTransport>,
    pub(crate) dimms: Vec<Dimm>,
    dimms_init: bool,
    pub(crate) regions: Vec<Region>,
    regions_init: bool,
}

impl Bus {
    pub(crate) fn probe(
        id: u32,
        path: &Path,
        dev_dir: &Path,
        timeout_ms: u64,
        transport: Rc<dyn CtlTransport>,
    ) -> Result<Bus> {
        let provider = read_attr(&path.join("provider"))?;
        let cmds = parse_bus_commands(&read_attr_opt(&path.join("commands"))?.unwrap_or_default());
        Ok(Bus {
            id,
            path: path.to_owned(),
            dev_dir: dev_dir.to_owned(),
            provider,
            cmds,
            wait_probe_path: path.join("wait_probe"),
            scrub_path: path.join("scrub"),
            timeout_ms,
            transport,
            dimms: Vec::new(),
            dimms_init: false,
            regions: Vec::new(),
            regions_init: false,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn devname(&self) -> String {
        format!("ndbus{}", self.id)
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dev_dir(&self) -> &Path {
        &self.dev_dir
    }

    /// The bus control node for ARS and error-clear ioctls.
    pub fn ctl_node(&self) -> PathBuf {
        self.dev_dir.join(format!("ndctl{}", self.id))
    }

    pub fn is_cmd_supported(&self, cmd: BusCmds) -> bool {
        self.cmds.contains(cmd)
    }

    /// Blocks until the bus reports that background device probing is
    /// quiescent, or the context timeout expires. Every enumeration pass
    /// and every bind/unbind observation goes through here first.
    pub fn wait_probe(&self) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(self.timeout_ms);
        loop {
            let state = read_attr(&self.wait_probe_path)?;
            if state == "1" {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Busy(format!("{}: probe wait timed out", self.devname())));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Completed scrub passes so far.
    pub fn scrub_count(&self) -> Result<u64> {
        let text = read_attr(&self.scrub_path)?;
        let digits = text.trim_end_matches('+');
        crate::sysfs::parse_u64(digits)
            .ok_or_else(|| Error::Corrupt(format!("bad scrub count {text:?}")))
    }

    /// Whether a scrub is running right now (trailing `+` marker).
    pub fn scrub_in_progress(&self) -> Result<bool> {
        Ok(read_attr(&self.scrub_path)?.ends_with('+'))
    }

    /// Polls the scrub attribute until the in-progress marker clears.
    /// Each poll is bounded by the context timeout and the overall wait
    /// retries until the marker is gone.
    pub fn wait_for_scrub_completion(&self) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(self.timeout_ms);
        loop {
            if !self.scrub_in_progress()? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Busy(format!("{}: scrub wait timed out", self.devname())));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn init_dimms(&mut self) {
        if self.dimms_init {
            return;
        }
        self.dimms_init = true;
        let _ = self.wait_probe();
        let mut found = enumerate(&self.path, "nmem");
        found.sort_by_key(|(id, _)| *id);
        for (id, path) in found {
            if self.dimms.iter().any(|d| d.id() == id) {
                continue;
            }
            match Dimm::probe(id, &path, &self.dev_dir, Rc::clone(&self.transport)) {
                Ok(dimm) => self.dimms.push(dimm),
                Err(err) => debug!("skipping {}: {err}", path.display()),
            }
        }
        info!("{}: {} dimms", self.devname(), self.dimms.len());
    }

    pub fn dimms(&mut self) -> &mut [Dimm] {
        self.init_dimms();
        &mut self.dimms
    }

    pub fn dimm_by_id(&mut self, id: u32) -> Result<usize> {
        self.init_dimms();
        self.dimms
            .iter()
            .position(|d| d.id() == id)
            .ok_or_else(|| Error::NotFound(format!("nmem{id}")))
    }

    pub fn dimm_by_handle(&mut self, handle: u32) -> Result<usize> {
        self.init_dimms();
        self.dimms
            .iter()
            .position(|d| d.handle() == handle)
            .ok_or_else(|| Error::NotFound(format!("dimm handle {handle:#x}")))
    }

    fn init_regions(&mut self) {
        if self.regions_init {
            return;
        }
        self.regions_init = true;
        let _ = self.wait_probe();
        let mut found = enumerate(&self.path, "region");
        found.sort_by_key(|(id, _)| *id);
        for (id, path) in found {
            if self.regions.iter().any(|r| r.id() == id) {
                continue;
            }
            match Region::probe(id, &path, &self.dev_dir) {
                Ok(region) => self.regions.push(region),
                Err(err) => debug!("skipping {}: {err}", path.display()),
            }
        }
        info!("{}: {} regions", self.devname(), self.regions.len());
    }

    pub fn regions(&mut self) -> &mut [Region] {
        self.init_regions();
        &mut self.regions
    }

    pub fn region_by_id(&mut self, id: u32) -> Result<usize> {
        self.init_regions();
        self.regions
            .iter()
            .position(|r| r.id() == id)
            .ok_or_else(|| Error::NotFound(format!("region{id}")))
    }

    /// Whether any enabled region on this bus maps capacity from the
    /// named dimm.
    pub fn dimm_is_active(&mut self, dimm_name: &str) -> bool {
        self.init_regions();
        self.regions.iter().any(|r| {
            r.is_enabled() && r.mappings().iter().any(|m| m.dimm_name == dimm_name)
        })
    }
}

/// Child directories named `<prefix><id>` under `path`.
fn enumerate(path: &Path, prefix: &str) -> Vec<(u32, PathBuf)> {
    let Ok(entries) = std::fs::read_dir(path) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|e| {
            let name = e.file_name().into_string().ok()?;
            let id: u32 = name.strip_prefix(prefix)?.parse().ok()?;
            Some((id, e.path()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_names_parse_into_mask() {
        let cmds = parse_bus_commands("ars_cap ars_start ars_status clear_error call bogus");
        assert!(cmds.contains(BusCmds::ARS_CAP | BusCmds::CLEAR_ERROR | BusCmds::CALL));
        assert_eq!(parse_bus_commands(""), BusCmds::empty());
    }
}
