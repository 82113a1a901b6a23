//! Config-area transfer commands.
//!
//! The label config area moves in and out of a dimm in firmware-sized
//! chunks. A read is derived from a completed size query, and a write
//! can only be derived from a completed read, so every label update is a
//! read-modify-write of the full area by construction.

use std::path::Path;

use log::{debug, error};

use crate::transport::{CtlTransport, ioctl_rw};
use crate::{Error, Result};

/// Dimm command numbers, as accepted by the control node.
pub const CMD_GET_CONFIG_SIZE: u64 = 4;
pub const CMD_GET_CONFIG_DATA: u64 = 5;
pub const CMD_SET_CONFIG_DATA: u64 = 6;

/// Response of the one-shot config-size command.
#[repr(C, packed)]
#[derive(Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CfgSizeOut {
    pub status: u32,
    pub config_size: u32,
    pub max_xfer: u32,
}

/// Header of one config-read chunk; `max_xfer` output bytes follow.
#[repr(C, packed)]
#[derive(Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CfgReadHdr {
    pub in_offset: u32,
    pub in_length: u32,
    pub status: u32,
}

/// Header of one config-write chunk; `max_xfer` input bytes follow, then
/// a trailing status word.
#[repr(C, packed)]
#[derive(Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CfgWriteHdr {
    pub in_offset: u32,
    pub in_length: u32,
}

/// Completed config-size query.
#[derive(Debug, Clone, Copy)]
pub struct CfgSize {
    pub config_size: u32,
    pub max_xfer: u32,
}

impl CfgSize {
    pub fn submit(transport: &dyn CtlTransport, node: &Path) -> Result<CfgSize> {
        let mut out = CfgSizeOut::default();
        let op = ioctl_rw(CMD_GET_CONFIG_SIZE, size_of::<CfgSizeOut>());
        transport.submit(node, op, bytemuck::bytes_of_mut(&mut out))?;
        let status = out.status;
        if status != 0 {
            return Err(Error::Firmware(status));
        }
        if out.config_size == 0 || out.max_xfer == 0 {
            return Err(Error::NotSupported(format!(
                "{}: zero-sized config area",
                node.display()
            )));
        }
        Ok(CfgSize {
            config_size: out.config_size,
            max_xfer: out.max_xfer,
        })
    }
}

/// A completed full read of the config area.
pub struct CfgRead {
    pub config_size: u32,
    pub max_xfer: u32,
    buf: Vec<u8>,
}

impl CfgRead {
    /// Pulls the whole config area through the node in `max_xfer`
    /// slices. A firmware error or short transfer halts the iterator;
    /// the already-copied prefix length is reported with the error.
    pub fn submit(transport: &dyn CtlTransport, node: &Path, size: &CfgSize) -> Result<CfgRead> {
        let hdr_len = size_of::<CfgReadHdr>();
        let mut cmd = vec![0u8; hdr_len + size.max_xfer as usize];
        let mut buf = vec![0u8; size.config_size as usize];
        let op = ioctl_rw(CMD_GET_CONFIG_DATA, cmd.len());

        let mut offset = 0u32;
        while offset < size.config_size {
            let xfer = size.max_xfer.min(size.config_size - offset);
            {
                let hdr: &mut CfgReadHdr = bytemuck::from_bytes_mut(&mut cmd[..hdr_len]);
                hdr.in_offset = offset;
                hdr.in_length = xfer;
                hdr.status = 0;
            }
            let rc = transport.submit(node, op, &mut cmd)?;
            let status = bytemuck::from_bytes::<CfgReadHdr>(&cmd[..hdr_len]).status;
            if status != 0 || rc > 0 {
                error!(
                    "{}: config read halted at offset {:#x} (fw {status:#x}, rc {rc})",
                    node.display(),
                    offset
                );
                return Err(if status != 0 {
                    Error::Firmware(status)
                } else {
                    Error::Io(std::io::ErrorKind::UnexpectedEof.into())
                });
            }
            buf[offset as usize..(offset + xfer) as usize]
                .copy_from_slice(&cmd[hdr_len..hdr_len + xfer as usize]);
            offset += xfer;
        }
        debug!(
            "{}: read {} config bytes in {}-byte slices",
            node.display(),
            size.config_size,
            size.max_xfer
        );
        Ok(CfgRead {
            config_size: size.config_size,
            max_xfer: size.max_xfer,
            buf,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_data(self) -> Vec<u8> {
        self.buf
    }
}

/// A config write, derived from a completed read so it carries the same
/// total size and chunking and cannot be re-sized.
pub struct CfgWrite<'a> {
    config_size: u32,
    max_xfer: u32,
    _source: &'a CfgRead,
}

impl<'a> CfgWrite<'a> {
    pub fn from_read(source: &'a CfgRead) -> CfgWrite<'a> {
        CfgWrite {
            config_size: source.config_size,
            max_xfer: source.max_xfer,
            _source: source,
        }
    }

    /// Pushes `data` (the full config area) through the node.
    ///
    /// A firmware error halts the iterator immediately: some slices have
    /// landed and some have not, so the on-dimm store must be treated as
    /// possibly inconsistent until rewritten.
    pub fn submit(&self, transport: &dyn CtlTransport, node: &Path, data: &[u8]) -> Result<()> {
        if data.len() != self.config_size as usize {
            return Err(Error::InvalidArgument(format!(
                "config write of {} bytes against a {}-byte area",
                data.len(),
                self.config_size
            )));
        }
        let hdr_len = size_of::<CfgWriteHdr>();
        // Trailing firmware status word after the payload.
        let mut cmd = vec![0u8; hdr_len + self.max_xfer as usize + 4];
        let op = ioctl_rw(CMD_SET_CONFIG_DATA, cmd.len());

        let mut offset = 0u32;
        while offset < self.config_size {
            let xfer = self.max_xfer.min(self.config_size - offset);
            {
                let hdr: &mut CfgWriteHdr = bytemuck::from_bytes_mut(&mut cmd[..hdr_len]);
                hdr.in_offset = offset;
                hdr.in_length = xfer;
            }
            cmd[hdr_len..hdr_len + xfer as usize]
                .copy_from_slice(&data[offset as usize..(offset + xfer) as usize]);
            let status_off = hdr_len + self.max_xfer as usize;
            cmd[status_off..status_off + 4].fill(0);

            let rc = transport.submit(node, op, &mut cmd)?;
            let status =
                u32::from_ne_bytes(cmd[status_off..status_off + 4].try_into().unwrap());
            if status != 0 || rc > 0 {
                error!(
                    "{}: config write halted at offset {:#x} (fw {status:#x}, rc {rc}); \
                     label store is possibly inconsistent",
                    node.display(),
                    offset
                );
                return Err(if status != 0 {
                    Error::Firmware(status)
                } else {
                    Error::Io(std::io::ErrorKind::WriteZero.into())
                });
            }
            offset += xfer;
        }
        debug!("{}: wrote {} config bytes", node.display(), self.config_size);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::io;

    /// Interprets the wire format against an in-memory config area.
    struct FakeDimm {
        area: RefCell<Vec<u8>>,
        max_xfer: u32,
        fail_write_at: Option<u32>,
    }

    impl CtlTransport for FakeDimm {
        fn submit(&self, _node: &Path, op: u64, buf: &mut [u8]) -> io::Result<i32> {
            let area_len = self.area.borrow().len() as u32;
            if op == ioctl_rw(CMD_GET_CONFIG_SIZE, size_of::<CfgSizeOut>()) {
                let out: &mut CfgSizeOut = bytemuck::from_bytes_mut(&mut buf[..12]);
                out.status = 0;
                out.config_size = area_len;
                out.max_xfer = self.max_xfer;
                return Ok(0);
            }
            let hdr_len = size_of::<CfgReadHdr>();
            if op == ioctl_rw(CMD_GET_CONFIG_DATA, hdr_len + self.max_xfer as usize) {
                let (offset, length) = {
                    let hdr: &CfgReadHdr = bytemuck::from_bytes(&buf[..hdr_len]);
                    (hdr.in_offset, hdr.in_length)
                };
                assert!(offset + length <= area_len);
                let area = self.area.borrow();
                buf[hdr_len..hdr_len + length as usize]
                    .copy_from_slice(&area[offset as usize..(offset + length) as usize]);
                return Ok(0);
            }
            let whdr_len = size_of::<CfgWriteHdr>();
            if op == ioctl_rw(CMD_SET_CONFIG_DATA, whdr_len + self.max_xfer as usize + 4) {
                let (offset, length) = {
                    let hdr: &CfgWriteHdr = bytemuck::from_bytes(&buf[..whdr_len]);
                    (hdr.in_offset, hdr.in_length)
                };
                let status_off = whdr_len + self.max_xfer as usize;
                if Some(offset) == self.fail_write_at {
                    buf[status_off..status_off + 4]
                        .copy_from_slice(&0xbad_u32.to_ne_bytes());
                    return Ok(0);
                }
                let mut area = self.area.borrow_mut();
                area[offset as usize..(offset + length) as usize]
                    .copy_from_slice(&buf[whdr_len..whdr_len + length as usize]);
                return Ok(0);
            }
            panic!("unexpected op {op:#x}");
        }
    }

    fn node() -> &'static Path {
        Path::new("/dev/nmem0")
    }

    #[test]
    fn read_assembles_all_chunks() {
        let pattern: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
        let dimm = FakeDimm {
            area: RefCell::new(pattern.clone()),
            max_xfer: 96,
            fail_write_at: None,
        };
        let size = CfgSize::submit(&dimm, node()).unwrap();
        assert_eq!(size.config_size, 1024);
        let read = CfgRead::submit(&dimm, node(), &size).unwrap();
        assert_eq!(read.data(), &pattern[..]);
    }

    #[test]
    fn write_round_trips_through_a_read() {
        let dimm = FakeDimm {
            area: RefCell::new(vec![0; 512]),
            max_xfer: 100,
            fail_write_at: None,
        };
        let size = CfgSize::submit(&dimm, node()).unwrap();
        let read = CfgRead::submit(&dimm, node(), &size).unwrap();

        let new_contents: Vec<u8> = (0..512u32).map(|i| (i % 7) as u8).collect();
        CfgWrite::from_read(&read)
            .submit(&dimm, node(), &new_contents)
            .unwrap();
        assert_eq!(&*dimm.area.borrow(), &new_contents);
    }

    #[test]
    fn write_size_mismatch_is_rejected() {
        let dimm = FakeDimm {
            area: RefCell::new(vec![0; 512]),
            max_xfer: 100,
            fail_write_at: None,
        };
        let size = CfgSize::submit(&dimm, node()).unwrap();
        let read = CfgRead::submit(&dimm, node(), &size).unwrap();
        let err = CfgWrite::from_read(&read)
            .submit(&dimm, node(), &[0u8; 100])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn firmware_error_halts_the_write() {
        let dimm = FakeDimm {
            area: RefCell::new(vec![0xff; 512]),
            max_xfer: 128,
            fail_write_at: Some(256),
        };
        let size = CfgSize::submit(&dimm, node()).unwrap();
        let read = CfgRead::submit(&dimm, node(), &size).unwrap();
        let err = CfgWrite::from_read(&read)
            .submit(&dimm, node(), &vec![0u8; 512])
            .unwrap_err();
        assert!(matches!(err, Error::Firmware(0xbad)));
        // The slices before the failure landed, the rest did not.
        assert_eq!(&dimm.area.borrow()[..256], &[0u8; 256][..]);
        assert_eq!(&dimm.area.borrow()[256..], &[0xffu8; 256][..]);
    }
}
