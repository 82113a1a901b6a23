//! The namespace index block header.

use nvmctl_common::{Le16, Le32, Le64};

use super::{INDEX_HEADER_SIZE, INDEX_SIGNATURE};

/// Fixed-layout head of an index block. The free bitmap (one bit per
/// label slot, 1 = free) follows immediately and runs to the block's
/// padded size, so it is addressed separately by the store.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct RawIndexBlock {
    /// "NAMESPACE_INDEX\0"
    pub sig: [u8; 16],
    pub flags: [u8; 3],
    /// 0 for 128-byte labels, otherwise labels are `1 << (7 + code)` bytes.
    pub labelsize: u8,
    pub seq: Le32,
    /// Offset of this block from the start of the config area.
    pub myoff: Le64,
    pub mysize: Le64,
    /// Offset of the other index block.
    pub otheroff: Le64,
    /// Offset of the first label slot.
    pub labeloff: Le64,
    pub nslot: Le32,
    pub major: Le16,
    pub minor: Le16,
    /// fletcher64 over the whole padded block with this field zeroed.
    pub checksum: Le64,
}

impl RawIndexBlock {
    pub fn from_bytes(bytes: &[u8]) -> &RawIndexBlock {
        bytemuck::from_bytes(&bytes[..INDEX_HEADER_SIZE])
    }

    pub fn from_bytes_mut(bytes: &mut [u8]) -> &mut RawIndexBlock {
        bytemuck::from_bytes_mut(&mut bytes[..INDEX_HEADER_SIZE])
    }

    pub fn has_signature(&self) -> bool {
        self.sig == INDEX_SIGNATURE
    }

    /// The label size this block claims, from version and labelsize code.
    pub fn label_size(&self) -> usize {
        let version = self.major.get() as u32 * 100 + self.minor.get() as u32;
        if version >= 102 {
            1usize << (7 + self.labelsize as usize)
        } else {
            128
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::Zeroable;
    use core::mem::{align_of, offset_of, size_of};
    use static_assertions::const_assert_eq;

    const_assert_eq!(size_of::<RawIndexBlock>(), INDEX_HEADER_SIZE);
    const_assert_eq!(align_of::<RawIndexBlock>(), 1);

    const_assert_eq!(offset_of!(RawIndexBlock, sig), 0);
    const_assert_eq!(offset_of!(RawIndexBlock, flags), 16);
    const_assert_eq!(offset_of!(RawIndexBlock, labelsize), 19);
    const_assert_eq!(offset_of!(RawIndexBlock, seq), 20);
    const_assert_eq!(offset_of!(RawIndexBlock, myoff), 24);
    const_assert_eq!(offset_of!(RawIndexBlock, mysize), 32);
    const_assert_eq!(offset_of!(RawIndexBlock, otheroff), 40);
    const_assert_eq!(offset_of!(RawIndexBlock, labeloff), 48);
    const_assert_eq!(offset_of!(RawIndexBlock, nslot), 56);
    const_assert_eq!(offset_of!(RawIndexBlock, major), 60);
    const_assert_eq!(offset_of!(RawIndexBlock, minor), 62);
    const_assert_eq!(offset_of!(RawIndexBlock, checksum), 64);

    #[test]
    fn label_size_codes() {
        let mut raw = RawIndexBlock::zeroed();
        raw.major.set(1);
        raw.minor.set(1);
        raw.labelsize = 0;
        assert_eq!(raw.label_size(), 128);

        raw.minor.set(2);
        raw.labelsize = 1;
        assert_eq!(raw.label_size(), 256);

        // Pre-1.2 blocks ignore the labelsize code entirely.
        raw.minor.set(1);
        assert_eq!(raw.label_size(), 128);
    }
}
