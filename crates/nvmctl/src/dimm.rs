//! Memory devices and their label operations.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{debug, info};
use nvmctl_label::{LabelArea, LabelVersion, Validated};

use crate::bus::Bus;
use crate::cmd::{CfgRead, CfgSize, CfgWrite};
use crate::sysfs::{parse_u64, read_attr, read_attr_opt, read_attr_u64, write_attr};
use crate::transport::CtlTransport;
use crate::{Error, Result};

bitflags::bitflags! {
    /// Health-related state bits parsed from the dimm `flags` attribute.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DimmFlags: u32 {
        const FAILED_MAP = 1 << 0;
        const FAILED_ARM = 1 << 1;
        const FAILED_SAVE = 1 << 2;
        const FAILED_FLUSH = 1 << 3;
        const SMART_EVENT = 1 << 4;
        const FAILED_RESTORE = 1 << 5;
        const NOTIFY = 1 << 6;
    }
}

bitflags::bitflags! {
    /// Dimm command support, parsed from the `commands` attribute.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DimmCmds: u32 {
        const SMART = 1 << 1;
        const SMART_THRESHOLD = 1 << 2;
        const DIMM_FLAGS = 1 << 3;
        const GET_CONFIG_SIZE = 1 << 4;
        const GET_CONFIG_DATA = 1 << 5;
        const SET_CONFIG_DATA = 1 << 6;
        const VENDOR = 1 << 9;
        const CALL = 1 << 10;
    }
}

fn parse_dimm_commands(text: &str) -> DimmCmds {
    let mut cmds = DimmCmds::empty();
    for name in text.split_whitespace() {
        cmds |= match name {
            "smart" => DimmCmds::SMART,
            "smart_thresh" => DimmCmds::SMART_THRESHOLD,
            "flags" => DimmCmds::DIMM_FLAGS,
            "get_size" | "get_config_size" => DimmCmds::GET_CONFIG_SIZE,
            "get_data" | "get_config_data" => DimmCmds::GET_CONFIG_DATA,
            "set_data" | "set_config_data" => DimmCmds::SET_CONFIG_DATA,
            "vendor" => DimmCmds::VENDOR,
            "call" => DimmCmds::CALL,
            _ => DimmCmds::empty(),
        };
    }
    cmds
}

fn parse_flags(text: &str) -> DimmFlags {
    let mut flags = DimmFlags::empty();
    for name in text.split_whitespace() {
        flags |= match name {
            "map" => DimmFlags::FAILED_MAP,
            "arm" => DimmFlags::FAILED_ARM,
            "save" => DimmFlags::FAILED_SAVE,
            "flush" => DimmFlags::FAILED_FLUSH,
            "smart" => DimmFlags::SMART_EVENT,
            "restore" => DimmFlags::FAILED_RESTORE,
            "notify" => DimmFlags::NOTIFY,
            _ => DimmFlags::empty(),
        };
    }
    flags
}

/// The label-area snapshot held after a successful config read.
pub(crate) struct LabelState {
    pub area: LabelArea,
    pub read: CfgRead,
}

pub struct Dimm {
    id: u32,
    path: PathBuf,
    dev_dir: PathBuf,
    handle: u32,
    phys_id: u16,
    vendor: u16,
    device: u16,
    revision: u16,
    subsystem_vendor: u16,
    subsystem_device: u16,
    unique_id: Option<String>,
    cmds: DimmCmds,
    flags: DimmFlags,
    transport: Rc<dyn CtlTransport>,
    pub(crate) label: Option<LabelState>,
}

impl Dimm {
    pub(crate) fn probe(
        id: u32,
        path: &Path,
        dev_dir: &Path,
        transport: Rc<dyn CtlTransport>,
    ) -> Result<Dimm> {
        let attr_u16 = |name: &str| -> Result<u16> {
            let text = read_attr_opt(&path.join(name))?.unwrap_or_default();
            Ok(parse_u64(&text).unwrap_or(0) as u16)
        };
        let handle = parse_u64(&read_attr(&path.join("handle"))?)
            .ok_or_else(|| Error::Corrupt(format!("nmem{id}: bad handle")))?
            as u32;
        let cmds =
            parse_dimm_commands(&read_attr_opt(&path.join("commands"))?.unwrap_or_default());
        let flags = parse_flags(&read_attr_opt(&path.join("flags"))?.unwrap_or_default());
        Ok(Dimm {
            id,
            path: path.to_owned(),
            dev_dir: dev_dir.to_owned(),
            handle,
            phys_id: attr_u16("phys_id")?,
            vendor: attr_u16("vendor")?,
            device: attr_u16("device")?,
            revision: attr_u16("rev_id")?,
            subsystem_vendor: attr_u16("subsystem_vendor")?,
            subsystem_device: attr_u16("subsystem_device")?,
            unique_id: read_attr_opt(&path.join("unique_id"))?,
            cmds,
            flags,
            transport,
            label: None,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn devname(&self) -> String {
        format!("nmem{}", self.id)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    // The firmware handle packs the dimm's topology coordinates.
    pub fn handle_node(&self) -> u32 {
        (self.handle >> 16) & 0xfff
    }

    pub fn handle_socket(&self) -> u32 {
        (self.handle >> 12) & 0xf
    }

    pub fn handle_imc(&self) -> u32 {
        (self.handle >> 8) & 0xf
    }

    pub fn handle_channel(&self) -> u32 {
        (self.handle >> 4) & 0xf
    }

    pub fn handle_dimm(&self) -> u32 {
        self.handle & 0xf
    }

    pub fn phys_id(&self) -> u16 {
        self.phys_id
    }

    pub fn vendor(&self) -> u16 {
        self.vendor
    }

    pub fn device(&self) -> u16 {
        self.device
    }

    pub fn revision(&self) -> u16 {
        self.revision
    }

    pub fn subsystem_vendor(&self) -> u16 {
        self.subsystem_vendor
    }

    pub fn subsystem_device(&self) -> u16 {
        self.subsystem_device
    }

    pub fn unique_id(&self) -> Option<&str> {
        self.unique_id.as_deref()
    }

    pub fn flags(&self) -> DimmFlags {
        self.flags
    }

    pub fn is_cmd_supported(&self, cmd: DimmCmds) -> bool {
        self.cmds.contains(cmd)
    }

    /// The dimm control node for config-area ioctls.
    pub fn ctl_node(&self) -> PathBuf {
        self.dev_dir.join(self.devname())
    }

    pub fn is_enabled(&self) -> bool {
        read_attr(&self.path.join("state")).is_ok_and(|s| s == "enabled")
    }

    pub fn enable(&self) -> Result<()> {
        write_attr(&self.path.join("state"), "enabled")?;
        Ok(())
    }

    pub fn disable(&self) -> Result<()> {
        write_attr(&self.path.join("state"), "disabled")?;
        Ok(())
    }

    /// Driver-reported count of unallocated label slots. The driver
    /// keeps one slot back as scratch for atomic updates, so a freshly
    /// initialized store reports one less than its slot count.
    pub fn available_labels(&self) -> Result<u32> {
        Ok(read_attr_u64(&self.path.join("available_slots"))? as u32)
    }

    pub fn label_area(&self) -> Option<&LabelArea> {
        self.label.as_ref().map(|l| &l.area)
    }
}

impl Bus {
    /// Snapshots the dimm's config area through the transfer commands.
    pub fn dimm_read_labels(&mut self, idx: usize) -> Result<&LabelArea> {
        self.dimms();
        self.wait_probe()?;
        let dimm = &mut self.dimms[idx];
        if !dimm.is_cmd_supported(DimmCmds::GET_CONFIG_SIZE)
            || !dimm.is_cmd_supported(DimmCmds::GET_CONFIG_DATA)
        {
            return Err(Error::NotSupported(format!(
                "{}: config transfer commands",
                dimm.devname()
            )));
        }
        let node = dimm.ctl_node();
        let size = CfgSize::submit(dimm.transport.as_ref(), &node)?;
        let read = CfgRead::submit(dimm.transport.as_ref(), &node, &size)?;
        debug!("{}: config area {} bytes", dimm.devname(), size.config_size);
        let area = LabelArea::new(read.data().to_vec());
        dimm.label = Some(LabelState { area, read });
        Ok(&dimm.label.as_ref().unwrap().area)
    }

    /// Validates the snapshot taken by [`Bus::dimm_read_labels`] and
    /// reports the current index geometry.
    pub fn dimm_validate_labels(&mut self, idx: usize) -> Result<Validated> {
        let dimm = &self.dimms[idx];
        let state = dimm.label.as_ref().ok_or_else(|| {
            Error::InvalidArgument(format!("{}: labels not read yet", dimm.devname()))
        })?;
        Ok(state.area.validate()?)
    }

    /// Writes a fresh pair of index blocks at `version` and returns the
    /// slot count. The non-current block lands first so a torn write
    /// leaves a valid store.
    ///
    /// No region over this dimm may be active; the namespace lifecycle
    /// enforces that before calling.
    pub fn dimm_init_labels(&mut self, idx: usize, version: LabelVersion) -> Result<u32> {
        let dimm = &mut self.dimms[idx];
        if !dimm.is_cmd_supported(DimmCmds::SET_CONFIG_DATA) {
            return Err(Error::NotSupported(format!(
                "{}: set_config_data",
                dimm.devname()
            )));
        }
        let devname = dimm.devname();
        let node = dimm.ctl_node();
        let state = dimm.label.as_mut().ok_or_else(|| {
            Error::InvalidArgument(format!("{devname}: labels not read yet"))
        })?;

        // Stage the two blocks: the non-current one (seq 1) lands first,
        // so an interrupted init still leaves a valid store with a
        // single current index.
        let write = CfgWrite::from_read(&state.read);
        let (nslot, _) = state.area.format_index(1, 1, version)?;
        write.submit(dimm.transport.as_ref(), &node, state.area.data())?;
        state.area.format_index(0, 3, version)?;
        write.submit(dimm.transport.as_ref(), &node, state.area.data())?;

        info!("{devname}: initialized {nslot} label slots");
        Ok(nslot)
    }

    /// Clears the entire config area, then bounces the dimm's bind state
    /// so the driver drops its cached copy. A disabled dimm holds no
    /// cache and needs no bounce.
    pub fn dimm_zero_labels(&mut self, idx: usize) -> Result<()> {
        self.dimm_read_labels(idx)?;
        let devname = self.dimms[idx].devname();
        if self.dimm_is_active(&devname) {
            debug!("{devname}: regions active, abort label write");
            return Err(Error::Busy(devname));
        }
        let dimm = &mut self.dimms[idx];
        if !dimm.is_cmd_supported(DimmCmds::SET_CONFIG_DATA) {
            return Err(Error::NotSupported(format!("{devname}: set_config_data")));
        }
        let node = dimm.ctl_node();
        let state = dimm.label.as_mut().unwrap();
        state.area.zero();
        CfgWrite::from_read(&state.read).submit(dimm.transport.as_ref(), &node, state.area.data())?;

        if !dimm.is_enabled() {
            return Ok(());
        }
        dimm.disable()?;
        dimm.enable()?;
        Ok(())
    }

    /// Enumerates live labels from the current snapshot.
    pub fn dimm_labels(&mut self, idx: usize) -> Result<Vec<nvmctl_label::Label>> {
        let v = self.dimm_validate_labels(idx)?;
        let dimm = &self.dimms[idx];
        let state = dimm.label.as_ref().unwrap();
        Ok(state.area.labels(&v).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_and_flag_parsing() {
        let cmds = parse_dimm_commands("get_size get_data set_data smart bogus");
        assert!(cmds.contains(
            DimmCmds::GET_CONFIG_SIZE | DimmCmds::GET_CONFIG_DATA | DimmCmds::SET_CONFIG_DATA
        ));
        assert!(!cmds.contains(DimmCmds::VENDOR));

        let flags = parse_flags("save flush");
        assert_eq!(flags, DimmFlags::FAILED_SAVE | DimmFlags::FAILED_FLUSH);
    }

    #[test]
    fn handle_field_decoding() {
        // node 1, socket 2, imc 3, channel 4, dimm 5
        let handle = (1 << 16) | (2 << 12) | (3 << 8) | (4 << 4) | 5;
        let dimm = Dimm {
            id: 0,
            path: PathBuf::new(),
            dev_dir: PathBuf::new(),
            handle,
            phys_id: 0,
            vendor: 0,
            device: 0,
            revision: 0,
            subsystem_vendor: 0,
            subsystem_device: 0,
            unique_id: None,
            cmds: DimmCmds::empty(),
            flags: DimmFlags::empty(),
            transport: Rc::new(crate::transport::DevTransport),
            label: None,
        };
        assert_eq!(dimm.handle_node(), 1);
        assert_eq!(dimm.handle_socket(), 2);
        assert_eq!(dimm.handle_imc(), 3);
        assert_eq!(dimm.handle_channel(), 4);
        assert_eq!(dimm.handle_dimm(), 5);
    }
}
