//! Positioned I/O over the raw namespace.
//!
//! The checker never seeks; every access names its absolute offset, and
//! every mutation is followed by an explicit durability point. A media
//! error (EIO from a poisoned page, a short transfer) surfaces as an
//! `io::Error` and aborts the check cleanly.

use std::fs::File;
use std::io;

/// Byte-addressed storage holding BTT arenas.
pub trait Media {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;
    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()>;
    /// Makes preceding writes durable.
    fn sync(&mut self) -> io::Result<()>;
}

impl Media for File {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        std::os::unix::fs::FileExt::read_exact_at(self, buf, offset)
    }

    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()> {
        std::os::unix::fs::FileExt::write_all_at(self, buf, offset)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

/// Memory-backed media for synthesized arenas in tests and tooling.
#[derive(Debug, Clone)]
pub struct RamMedia {
    data: Vec<u8>,
}

impl RamMedia {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Media for RamMedia {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let offset = offset as usize;
        let end = offset.checked_add(buf.len()).ok_or(io::ErrorKind::InvalidInput)?;
        if end > self.data.len() {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        buf.copy_from_slice(&self.data[offset..end]);
        Ok(())
    }

    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()> {
        let offset = offset as usize;
        let end = offset.checked_add(buf.len()).ok_or(io::ErrorKind::InvalidInput)?;
        if end > self.data.len() {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        self.data[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_media_bounds() {
        let mut m = RamMedia::new(16);
        m.write_all_at(&[1, 2, 3], 4).unwrap();
        let mut buf = [0u8; 3];
        m.read_exact_at(&mut buf, 4).unwrap();
        assert_eq!(buf, [1, 2, 3]);
        assert!(m.read_exact_at(&mut buf, 15).is_err());
        assert!(m.write_all_at(&buf, 14).is_err());
    }
}
