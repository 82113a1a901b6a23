//! The 4 KiB arena info block.

use nvmctl_common::alg::fletcher::{checksum_with_hole, fletcher64};
use nvmctl_common::{Guid, Le16, Le32, Le64};

use super::{BTT_INFO_SIZE, BTT_SIGNATURE, BTT1_START_OFFSET, BTT2_START_OFFSET};

bitflags::bitflags! {
    /// Info-block flags word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InfoFlags: u32 {
        /// The arena hit an unrecoverable error; checking is pointless.
        const ERROR = 1 << 0;
    }
}

/// On-media layout of the primary and backup info blocks.
///
/// All offsets (`nextoff` through `info2off`) are relative to the start
/// of this arena.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct RawBttInfo {
    /// "BTT_ARENA_INFO\0\0"
    pub sig: [u8; 16],
    pub uuid: Guid,
    /// Uuid of the namespace this btt sits on; nil when unrecorded.
    pub parent_uuid: Guid,
    pub flags: Le32,
    pub major: Le16,
    pub minor: Le16,
    pub external_lbasize: Le32,
    pub external_nlba: Le32,
    pub internal_lbasize: Le32,
    pub internal_nlba: Le32,
    pub nfree: Le32,
    pub infosize: Le32,
    /// Relative offset of the next arena; 0 for the last arena.
    pub nextoff: Le64,
    pub dataoff: Le64,
    pub mapoff: Le64,
    pub logoff: Le64,
    pub info2off: Le64,
    pub unused: [u8; 3968],
    /// fletcher64 over the whole block with this field zeroed.
    pub checksum: Le64,
}

/// Offset of the checksum field inside the block.
const CHECKSUM_OFF: usize = BTT_INFO_SIZE - 8;

impl RawBttInfo {
    pub fn from_bytes(bytes: &[u8]) -> &RawBttInfo {
        bytemuck::from_bytes(&bytes[..BTT_INFO_SIZE])
    }

    pub fn from_bytes_mut(bytes: &mut [u8]) -> &mut RawBttInfo {
        bytemuck::from_bytes_mut(&mut bytes[..BTT_INFO_SIZE])
    }

    pub fn has_signature(&self) -> bool {
        self.sig == BTT_SIGNATURE
    }

    pub fn flags(&self) -> InfoFlags {
        InfoFlags::from_bits_truncate(self.flags.get())
    }

    /// Recomputes and stores the checksum.
    pub fn update_checksum(&mut self) {
        self.checksum.set(0);
        let sum = fletcher64(bytemuck::bytes_of(self));
        self.checksum.set(sum);
    }

    /// Verifies the stored checksum without mutating the block.
    pub fn checksum_ok(&self) -> bool {
        checksum_with_hole(bytemuck::bytes_of(self), CHECKSUM_OFF) == self.checksum.get()
    }

    /// Full verification: signature, parent uuid (when the block records
    /// one and the caller knows the expected value), and checksum.
    pub fn verify(&self, parent_uuid: &Guid) -> bool {
        if !self.has_signature() {
            return false;
        }
        if !self.parent_uuid.is_null() && !parent_uuid.is_null() && self.parent_uuid != *parent_uuid
        {
            return false;
        }
        self.checksum_ok()
    }

    /// The arena start offset this block's version implies.
    pub fn expected_start_offset(&self) -> Option<u64> {
        match (self.major.get(), self.minor.get()) {
            (1, 1) => Some(BTT1_START_OFFSET),
            (1, 2) => Some(BTT2_START_OFFSET),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::Zeroable;
    use core::mem::{align_of, offset_of, size_of};
    use static_assertions::const_assert_eq;

    const_assert_eq!(size_of::<RawBttInfo>(), BTT_INFO_SIZE);
    const_assert_eq!(align_of::<RawBttInfo>(), 1);

    const_assert_eq!(offset_of!(RawBttInfo, sig), 0);
    const_assert_eq!(offset_of!(RawBttInfo, uuid), 16);
    const_assert_eq!(offset_of!(RawBttInfo, parent_uuid), 32);
    const_assert_eq!(offset_of!(RawBttInfo, flags), 48);
    const_assert_eq!(offset_of!(RawBttInfo, major), 52);
    const_assert_eq!(offset_of!(RawBttInfo, minor), 54);
    const_assert_eq!(offset_of!(RawBttInfo, external_lbasize), 56);
    const_assert_eq!(offset_of!(RawBttInfo, external_nlba), 60);
    const_assert_eq!(offset_of!(RawBttInfo, internal_lbasize), 64);
    const_assert_eq!(offset_of!(RawBttInfo, internal_nlba), 68);
    const_assert_eq!(offset_of!(RawBttInfo, nfree), 72);
    const_assert_eq!(offset_of!(RawBttInfo, infosize), 76);
    const_assert_eq!(offset_of!(RawBttInfo, nextoff), 80);
    const_assert_eq!(offset_of!(RawBttInfo, dataoff), 88);
    const_assert_eq!(offset_of!(RawBttInfo, mapoff), 96);
    const_assert_eq!(offset_of!(RawBttInfo, logoff), 104);
    const_assert_eq!(offset_of!(RawBttInfo, info2off), 112);
    const_assert_eq!(offset_of!(RawBttInfo, checksum), 4088);

    #[test]
    fn checksum_round_trip() {
        let mut info = RawBttInfo::zeroed();
        info.sig = BTT_SIGNATURE;
        info.major.set(1);
        info.minor.set(1);
        info.external_nlba.set(4);
        info.update_checksum();
        assert!(info.checksum_ok());
        assert!(info.verify(&Guid::default()));

        info.external_nlba.set(5);
        assert!(!info.checksum_ok());
    }

    #[test]
    fn parent_uuid_gates_verification() {
        let parent = Guid::generate();
        let other = Guid::generate();
        let mut info = RawBttInfo::zeroed();
        info.sig = BTT_SIGNATURE;
        info.parent_uuid = parent;
        info.update_checksum();

        assert!(info.verify(&parent));
        assert!(!info.verify(&other));
        // A nil recorded parent matches anything.
        info.parent_uuid = Guid::default();
        info.update_checksum();
        assert!(info.verify(&other));
    }

    #[test]
    fn version_implies_start_offset() {
        let mut info = RawBttInfo::zeroed();
        info.major.set(1);
        info.minor.set(1);
        assert_eq!(info.expected_start_offset(), Some(0));
        info.minor.set(2);
        assert_eq!(info.expected_start_offset(), Some(4096));
        info.major.set(9);
        assert_eq!(info.expected_start_offset(), None);
    }
}
