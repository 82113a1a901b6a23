//! Address Range Scrub command builders.
//!
//! ARS is a three-step protocol against the bus control node: query the
//! capability for a range, start a scrub, poll status. Each later step
//! is constructed from a completed capability command, which is where
//! the validation lives.

use std::path::PathBuf;
use std::rc::Rc;

use log::debug;
use nvmctl_common::size::is_power_of_two;

use crate::bus::{Bus, BusCmds};
use crate::transport::{CtlTransport, ioctl_rw};
use crate::{Error, Result};

/// Bus command numbers.
const CMD_ARS_CAP: u64 = 1;
const CMD_ARS_START: u64 = 2;
const CMD_ARS_STATUS: u64 = 3;
const CMD_CLEAR_ERROR: u64 = 4;

/// Low half of the firmware status word; the high half is the extended
/// status (supported scrub types for ars_cap, progress for ars_status).
const ARS_STATUS_MASK: u32 = 0xffff;
const ARS_EXT_STATUS_SHIFT: u32 = 16;

/// Scrub types a platform can advertise and start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrubType {
    Volatile,
    Persistent,
}

impl ScrubType {
    fn bit(self) -> u32 {
        match self {
            ScrubType::Volatile => 1 << 0,
            ScrubType::Persistent => 1 << 1,
        }
    }
}

#[repr(C, packed)]
#[derive(Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
struct ArsCapWire {
    address: u64,
    length: u64,
    status: u32,
    max_ars_out: u32,
    clear_err_unit: u32,
    flags: u16,
    reserved: u16,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
struct ArsStartWire {
    address: u64,
    length: u64,
    scrub_type: u16,
    flags: u8,
    reserved: [u8; 5],
    status: u32,
    scrub_time: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
struct ArsStatusWire {
    status: u32,
    out_length: u32,
    address: u64,
    length: u64,
    restart_address: u64,
    restart_length: u64,
    scrub_type: u16,
    flags: u16,
    num_records: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
struct ArsRecordWire {
    handle: u32,
    reserved: u32,
    err_address: u64,
    length: u64,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
struct ClearErrorWire {
    address: u64,
    length: u64,
    status: u32,
    reserved: u32,
    cleared: u64,
}

/// A completed (or not yet submitted) ARS capability query.
pub struct ArsCap {
    node: PathBuf,
    transport: Rc<dyn CtlTransport>,
    wire: ArsCapWire,
    completed: bool,
}

impl ArsCap {
    pub fn new(bus: &Bus, address: u64, length: u64) -> Result<ArsCap> {
        if !bus.is_cmd_supported(BusCmds::ARS_CAP) {
            return Err(Error::NotSupported(format!("{}: ars_cap", bus.devname())));
        }
        Ok(ArsCap {
            node: bus.ctl_node(),
            transport: Rc::clone(&bus.transport),
            wire: ArsCapWire {
                address,
                length,
                ..Default::default()
            },
            completed: false,
        })
    }

    pub fn submit(&mut self) -> Result<()> {
        let op = ioctl_rw(CMD_ARS_CAP, size_of::<ArsCapWire>());
        self.transport
            .submit(&self.node, op, bytemuck::bytes_of_mut(&mut self.wire))?;
        let status = self.wire.status;
        if status & ARS_STATUS_MASK != 0 {
            return Err(Error::Firmware(status));
        }
        self.completed = true;
        Ok(())
    }

    /// Completed successfully, with a sane clear-error granularity.
    fn is_valid(&self) -> bool {
        self.completed
            && self.wire.status & ARS_STATUS_MASK == 0
            && is_power_of_two(self.wire.clear_err_unit as u64)
    }

    pub fn address(&self) -> u64 {
        self.wire.address
    }

    pub fn length(&self) -> u64 {
        self.wire.length
    }

    /// Output buffer size an ars_status for this range needs.
    pub fn max_ars_out(&self) -> u32 {
        if self.completed { self.wire.max_ars_out } else { 0 }
    }

    pub fn clear_err_unit(&self) -> u32 {
        self.wire.clear_err_unit
    }

    fn supported_types(&self) -> u32 {
        self.wire.status >> ARS_EXT_STATUS_SHIFT
    }
}

/// Starts a scrub over a validated capability range.
pub struct ArsStart {
    node: PathBuf,
    transport: Rc<dyn CtlTransport>,
    wire: ArsStartWire,
}

impl ArsStart {
    pub fn new(bus: &Bus, cap: &ArsCap, scrub_type: ScrubType) -> Result<ArsStart> {
        if !bus.is_cmd_supported(BusCmds::ARS_START) {
            return Err(Error::NotSupported(format!("{}: ars_start", bus.devname())));
        }
        if !cap.is_valid() {
            return Err(Error::InvalidArgument(
                "ars_start requires a successfully completed ars_cap".into(),
            ));
        }
        if cap.supported_types() & scrub_type.bit() == 0 {
            debug!("ars_cap does not show {scrub_type:?} as supported");
            return Err(Error::NotSupported(format!("{scrub_type:?} scrub")));
        }
        Ok(ArsStart {
            node: bus.ctl_node(),
            transport: Rc::clone(&bus.transport),
            wire: ArsStartWire {
                address: cap.address(),
                length: cap.length(),
                scrub_type: scrub_type.bit() as u16,
                ..Default::default()
            },
        })
    }

    pub fn submit(&mut self) -> Result<()> {
        let op = ioctl_rw(CMD_ARS_START, size_of::<ArsStartWire>());
        self.transport
            .submit(&self.node, op, bytemuck::bytes_of_mut(&mut self.wire))?;
        let status = self.wire.status;
        if status & ARS_STATUS_MASK != 0 {
            return Err(Error::Firmware(status));
        }
        Ok(())
    }

    /// Firmware's estimate of the scrub duration, seconds.
    pub fn scrub_time(&self) -> u32 {
        self.wire.scrub_time
    }
}

/// Polls scrub progress and reads back error records.
pub struct ArsStatus {
    node: PathBuf,
    transport: Rc<dyn CtlTransport>,
    buf: Vec<u8>,
    completed: bool,
}

impl ArsStatus {
    pub fn new(bus: &Bus, cap: &ArsCap) -> Result<ArsStatus> {
        if !bus.is_cmd_supported(BusCmds::ARS_STATUS) {
            return Err(Error::NotSupported(format!("{}: ars_status", bus.devname())));
        }
        if !cap.is_valid() {
            return Err(Error::InvalidArgument(
                "ars_status requires a successfully completed ars_cap".into(),
            ));
        }
        let max_out = cap.max_ars_out() as usize;
        if max_out == 0 {
            return Err(Error::InvalidArgument("ars_cap reports no output room".into()));
        }
        // The output buffer is sized by the capability, never smaller
        // than the fixed header.
        let len = max_out.max(size_of::<ArsStatusWire>());
        let mut status = ArsStatus {
            node: bus.ctl_node(),
            transport: Rc::clone(&bus.transport),
            buf: vec![0u8; len],
            completed: false,
        };
        status.hdr_mut().out_length = len as u32;
        Ok(status)
    }

    fn hdr(&self) -> &ArsStatusWire {
        bytemuck::from_bytes(&self.buf[..size_of::<ArsStatusWire>()])
    }

    fn hdr_mut(&mut self) -> &mut ArsStatusWire {
        bytemuck::from_bytes_mut(&mut self.buf[..size_of::<ArsStatusWire>()])
    }

    pub fn submit(&mut self) -> Result<()> {
        let op = ioctl_rw(CMD_ARS_STATUS, self.buf.len());
        let rc = self.transport.submit(&self.node, op, &mut self.buf)?;
        // A positive OS result is an underrun; the firmware rarely
        // fills the whole capability-sized buffer.
        let status = self.hdr().status;
        if rc < 0 || status & ARS_STATUS_MASK != 0 {
            return Err(Error::Firmware(status));
        }
        self.completed = true;
        Ok(())
    }

    /// Whether the scrub is still running. Detecting in-progress
    /// invalidates this command so a stale answer cannot be re-polled.
    pub fn in_progress(&mut self) -> bool {
        if !self.completed {
            return false;
        }
        if self.hdr().status >> ARS_EXT_STATUS_SHIFT == 1 {
            self.completed = false;
            return true;
        }
        false
    }

    pub fn num_records(&self) -> u32 {
        if self.completed { self.hdr().num_records } else { 0 }
    }

    /// The `idx`th error record as (address, length).
    pub fn record(&self, idx: u32) -> Result<(u64, u64)> {
        if !self.completed || idx >= self.num_records() {
            return Err(Error::InvalidArgument(format!("record index {idx}")));
        }
        let base = size_of::<ArsStatusWire>() + idx as usize * size_of::<ArsRecordWire>();
        let record: &ArsRecordWire =
            bytemuck::from_bytes(&self.buf[base..base + size_of::<ArsRecordWire>()]);
        Ok((record.err_address, record.length))
    }
}

/// Clears poisoned media within a validated capability range.
pub struct ClearError {
    node: PathBuf,
    transport: Rc<dyn CtlTransport>,
    wire: ClearErrorWire,
    completed: bool,
}

impl ClearError {
    pub fn new(bus: &Bus, address: u64, length: u64, cap: &ArsCap) -> Result<ClearError> {
        if !bus.is_cmd_supported(BusCmds::CLEAR_ERROR) {
            return Err(Error::NotSupported(format!("{}: clear_error", bus.devname())));
        }
        if !cap.is_valid() {
            return Err(Error::InvalidArgument(
                "clear_error requires a successfully completed ars_cap".into(),
            ));
        }
        let start = cap.address();
        let end = cap.address() + cap.length();
        if address < start || address > end || address + length > end {
            return Err(Error::InvalidArgument(
                "clear request out of range relative to ars_cap".into(),
            ));
        }
        let mask = cap.clear_err_unit() as u64 - 1;
        if (address | length) & mask != 0 {
            return Err(Error::InvalidArgument(format!(
                "clear request not aligned to clear_err_unit {}",
                cap.clear_err_unit()
            )));
        }
        Ok(ClearError {
            node: bus.ctl_node(),
            transport: Rc::clone(&bus.transport),
            wire: ClearErrorWire {
                address,
                length,
                ..Default::default()
            },
            completed: false,
        })
    }

    pub fn submit(&mut self) -> Result<()> {
        let op = ioctl_rw(CMD_CLEAR_ERROR, size_of::<ClearErrorWire>());
        self.transport
            .submit(&self.node, op, bytemuck::bytes_of_mut(&mut self.wire))?;
        let status = self.wire.status;
        if status & ARS_STATUS_MASK != 0 {
            return Err(Error::Firmware(status));
        }
        self.completed = true;
        Ok(())
    }

    pub fn cleared(&self) -> u64 {
        if self.completed { self.wire.cleared } else { 0 }
    }
}
