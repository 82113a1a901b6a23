//! Small text attributes in the control filesystem.
//!
//! Paths are constructed by the object graph; this module neither knows
//! nor cares what an attribute means. Reads return the first line with
//! the trailing newline removed, matching how the kernel emits device
//! attributes.

use std::fs;
use std::io;
use std::path::Path;

use log::debug;

pub fn read_attr(path: &Path) -> io::Result<String> {
    let raw = fs::read_to_string(path)?;
    let line = raw.lines().next().unwrap_or("").to_owned();
    debug!("read {} -> {line:?}", path.display());
    Ok(line)
}

/// Like [`read_attr`] but absence is not an error.
pub fn read_attr_opt(path: &Path) -> io::Result<Option<String>> {
    match read_attr(path) {
        Ok(line) => Ok(Some(line)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

pub fn write_attr(path: &Path, text: &str) -> io::Result<()> {
    debug!("write {} <- {text:?}", path.display());
    fs::write(path, text)
}

/// Writes an attribute that older kernels may not expose; absence is
/// swallowed so opportunistic writes cannot fail an operation.
pub fn write_attr_quiet(path: &Path, text: &str) -> io::Result<bool> {
    match write_attr(path, text) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

pub fn read_attr_u64(path: &Path) -> io::Result<u64> {
    let line = read_attr(path)?;
    parse_u64(&line)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("bad integer {line:?}")))
}

/// Accepts decimal or 0x-prefixed hex, the two forms device attributes
/// come in.
pub fn parse_u64(text: &str) -> Option<u64> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_first_line_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("size");
        fs::write(&path, "4096\nsecond line\n").unwrap();
        assert_eq!(read_attr(&path).unwrap(), "4096");
        assert_eq!(read_attr_u64(&path).unwrap(), 4096);
    }

    #[test]
    fn hex_and_decimal() {
        assert_eq!(parse_u64("0x1000"), Some(4096));
        assert_eq!(parse_u64("  42 "), Some(42));
        assert_eq!(parse_u64("forty"), None);
    }

    #[test]
    fn optional_and_quiet_paths() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert_eq!(read_attr_opt(&missing).unwrap(), None);
        assert!(!write_attr_quiet(&missing.join("deep"), "x").unwrap());

        let path = dir.path().join("mode");
        fs::write(&path, "raw\n").unwrap();
        assert_eq!(read_attr_opt(&path).unwrap().as_deref(), Some("raw"));
        assert!(write_attr_quiet(&path, "safe").unwrap());
        assert_eq!(read_attr(&path).unwrap(), "safe");
    }
}
