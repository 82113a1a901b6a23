//! Free-list log entries.

use nvmctl_common::Le32;
use nvmctl_common::alg::seq::inc_seq;

/// One 16-byte log entry. Each lane owns a pair; the pair's sequence
/// numbers decide which entry is live.
#[repr(C)]
#[derive(Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct RawLogEntry {
    pub lba: Le32,
    pub old_map: Le32,
    pub new_map: Le32,
    /// 1..=3 on the sequence ring; 0 marks a never-written slot.
    pub seq: Le32,
}

/// A decoded log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntry {
    pub lba: u32,
    pub old_map: u32,
    pub new_map: u32,
    pub seq: u32,
}

impl From<&RawLogEntry> for LogEntry {
    fn from(raw: &RawLogEntry) -> Self {
        LogEntry {
            lba: raw.lba.get(),
            old_map: raw.old_map.get(),
            new_map: raw.new_map.get(),
            seq: raw.seq.get(),
        }
    }
}

/// Index of the newer entry in a lane's pair.
///
/// The newer entry is the one whose sequence is the successor of its
/// peer's; an unwritten (seq 0) entry always loses.
pub fn newer_of(seq0: u32, seq1: u32) -> usize {
    if seq0 == 0 {
        1
    } else if seq1 == 0 {
        0
    } else if inc_seq(seq0) == seq1 {
        1
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;
    use static_assertions::const_assert_eq;

    const_assert_eq!(size_of::<RawLogEntry>(), 16);

    #[test]
    fn newer_entry_selection() {
        // Successor wins in either slot order.
        assert_eq!(newer_of(1, 3), 1);
        assert_eq!(newer_of(3, 1), 0);
        assert_eq!(newer_of(3, 2), 1);
        assert_eq!(newer_of(2, 1), 1);
        // Unwritten slots lose.
        assert_eq!(newer_of(0, 1), 1);
        assert_eq!(newer_of(2, 0), 0);
    }
}
