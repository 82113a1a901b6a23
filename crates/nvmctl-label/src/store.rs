//! The buffer-backed label store engine.
//!
//! Operates on an owned snapshot of a dimm's config area. Mutating
//! operations return [`WriteExtent`]s describing which byte ranges must be
//! flushed back through the config-write command, in order; the ordering is
//! what keeps a torn update recoverable (at least one index block stays
//! valid at every point).

use log::debug;
use nvmctl_common::alg::fletcher::{checksum_with_hole, fletcher64};

use crate::LabelError;
use crate::structures::index::RawIndexBlock;
use crate::structures::label::Label;
use crate::structures::{
    INDEX_ALIGN, INDEX_HEADER_SIZE, INDEX_MIN_SIZE, INDEX_SIGNATURE, LABEL_SIZE_V1_1,
    LABEL_SIZE_V1_2, SEQ_MASK, best_seq,
};

/// Offset of the checksum field within an index block.
const CHECKSUM_OFF: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelVersion {
    V1_1,
    V1_2,
}

impl LabelVersion {
    pub const fn label_size(self) -> usize {
        match self {
            LabelVersion::V1_1 => LABEL_SIZE_V1_1,
            LabelVersion::V1_2 => LABEL_SIZE_V1_2,
        }
    }
}

/// Result of a successful [`LabelArea::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validated {
    /// Which of the two index blocks is current (0 or 1).
    pub current: usize,
    pub label_size: usize,
    pub index_size: usize,
    pub nslot: u32,
}

/// A byte range of the config area that must be written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteExtent {
    pub offset: usize,
    pub len: usize,
}

/// The write-back schedule produced by [`LabelArea::init`].
///
/// The extents must land in array order: the non-current block first, so a
/// transfer cut short after the first write still leaves a valid store
/// with a single current index.
#[derive(Debug, Clone, Copy)]
pub struct InitPlan {
    pub nslot: u32,
    pub writes: [WriteExtent; 2],
}

/// Geometry for a given config size and label size.
///
/// One byte of index overhead is assumed per label slot, then the index
/// is rounded to the format's 256-byte alignment with a 512-byte floor,
/// and the slot count is whatever label payload fits after the two blocks.
pub fn area_geometry(config_size: usize, label_size: usize) -> Result<(u32, usize), LabelError> {
    let tentative = config_size / (label_size + 1);
    let index_size = (INDEX_HEADER_SIZE + tentative.div_ceil(8))
        .next_multiple_of(INDEX_ALIGN)
        .max(INDEX_MIN_SIZE);
    if config_size < 2 * index_size + label_size {
        return Err(LabelError::AreaTooSmall(config_size));
    }
    let nslot = (config_size - 2 * index_size) / label_size;
    Ok((nslot as u32, index_size))
}

/// An owned snapshot of a dimm's config area.
#[derive(Clone)]
pub struct LabelArea {
    data: Vec<u8>,
}

impl LabelArea {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn zeroed(config_size: usize) -> Self {
        Self {
            data: vec![0; config_size],
        }
    }

    pub fn config_size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    fn index_bytes(&self, index_size: usize, i: usize) -> &[u8] {
        &self.data[i * index_size..(i + 1) * index_size]
    }

    /// Best-effort label-size probe for stores that have not been
    /// validated yet: look at both candidate index headers and prefer 256
    /// bytes only when the blocks agree they are v1.2.
    pub fn probe_label_size(&self) -> usize {
        let mut v1 = 0;
        let mut v2 = 0;
        for off in [0, INDEX_ALIGN] {
            if off + INDEX_HEADER_SIZE > self.data.len() {
                break;
            }
            let raw = RawIndexBlock::from_bytes(&self.data[off..off + INDEX_HEADER_SIZE]);
            if raw.major.get() == 1 {
                match raw.minor.get() {
                    1 => v1 += 1,
                    2 => v2 += 1,
                    _ => {}
                }
            }
        }
        if v2 > v1 { LABEL_SIZE_V1_2 } else { LABEL_SIZE_V1_1 }
    }

    fn validate_at(&self, label_size: usize) -> Result<Validated, LabelError> {
        let config_size = self.data.len();
        let (_, index_size) = area_geometry(config_size, label_size)?;
        if config_size < 2 * index_size {
            return Err(LabelError::AreaTooSmall(config_size));
        }

        let mut valid = [false; 2];
        let mut seqs = [0u32; 2];
        let mut nslots = [0u32; 2];
        for i in 0..2 {
            let bytes = self.index_bytes(index_size, i);
            let raw = RawIndexBlock::from_bytes(bytes);
            if !raw.has_signature() {
                debug!("nsindex{i}: signature invalid");
                continue;
            }
            if raw.label_size() != label_size {
                debug!("nsindex{i}: labelsize {} invalid", raw.labelsize);
                continue;
            }
            let sum = checksum_with_hole(bytes, CHECKSUM_OFF);
            if sum != raw.checksum.get() {
                debug!("nsindex{i}: checksum invalid");
                continue;
            }
            let seq = raw.seq.get();
            if seq & SEQ_MASK == 0 {
                debug!("nsindex{i}: sequence {seq:#x} invalid");
                continue;
            }
            if raw.myoff.get() != (i * index_size) as u64 {
                debug!("nsindex{i}: myoff {:#x} invalid", raw.myoff.get());
                continue;
            }
            if raw.otheroff.get() != ((1 - i) * index_size) as u64 {
                debug!("nsindex{i}: otheroff {:#x} invalid", raw.otheroff.get());
                continue;
            }
            let mysize = raw.mysize.get() as usize;
            if mysize > index_size || mysize < INDEX_HEADER_SIZE {
                debug!("nsindex{i}: mysize {mysize:#x} invalid");
                continue;
            }
            let nslot = raw.nslot.get() as usize;
            if nslot * label_size + 2 * index_size > config_size {
                debug!("nsindex{i}: nslot {nslot} invalid for config size {config_size:#x}");
                continue;
            }
            valid[i] = true;
            seqs[i] = seq;
            nslots[i] = nslot as u32;
        }

        let current = match (valid[0], valid[1]) {
            (false, false) => return Err(LabelError::Unformatted),
            (true, false) => 0,
            (false, true) => 1,
            (true, true) => {
                if best_seq(seqs[0], seqs[1]) == seqs[1] & SEQ_MASK {
                    1
                } else {
                    0
                }
            }
        };

        Ok(Validated {
            current,
            label_size,
            index_size,
            nslot: nslots[current],
        })
    }

    /// Probes the label-size candidates and returns the current index.
    ///
    /// The label size cannot be trusted until an index block validates,
    /// and an index block cannot be located without the label size, so
    /// both known sizes are simply tried in turn.
    pub fn validate(&self) -> Result<Validated, LabelError> {
        for label_size in [LABEL_SIZE_V1_1, LABEL_SIZE_V1_2] {
            if let Ok(v) = self.validate_at(label_size) {
                return Ok(v);
            }
        }
        Err(LabelError::Unformatted)
    }

    /// Whether the current index marks `slot` free.
    pub fn is_slot_free(&self, v: &Validated, slot: u32) -> Result<bool, LabelError> {
        if slot >= v.nslot {
            return Err(LabelError::SlotOutOfRange {
                slot,
                nslot: v.nslot,
            });
        }
        let bitmap = &self.index_bytes(v.index_size, v.current)[INDEX_HEADER_SIZE..];
        Ok(bitmap[slot as usize / 8] & (1u8 << (slot % 8)) != 0)
    }

    /// Free slots according to the current index bitmap.
    pub fn free_slots(&self, v: &Validated) -> u32 {
        (0..v.nslot)
            .filter(|s| self.is_slot_free(v, *s).unwrap_or(false))
            .count() as u32
    }

    /// Live labels in ascending slot order.
    ///
    /// A slot whose free bit is set holds no label; a label whose on-media
    /// `slot` field disagrees with its position is a stale leftover from a
    /// torn update and is skipped.
    pub fn labels<'a>(&'a self, v: &'a Validated) -> impl Iterator<Item = Label> + 'a {
        let label_off = 2 * v.index_size;
        (0..v.nslot).filter_map(move |s| {
            if self.is_slot_free(v, s).unwrap_or(true) {
                return None;
            }
            let off = label_off + s as usize * v.label_size;
            let label = Label::decode(&self.data[off..off + v.label_size]);
            if label.slot != s {
                debug!("slot {s}: stale label (claims slot {})", label.slot);
                return None;
            }
            Some(label)
        })
    }

    pub fn active_count(&self, v: &Validated) -> u32 {
        self.labels(v).count() as u32
    }

    /// Reads the raw bytes of slot `s` (for callers that want v1.2
    /// extension fields or stale contents).
    pub fn slot_bytes(&self, v: &Validated, slot: u32) -> Result<&[u8], LabelError> {
        if slot >= v.nslot {
            return Err(LabelError::SlotOutOfRange {
                slot,
                nslot: v.nslot,
            });
        }
        let off = 2 * v.index_size + slot as usize * v.label_size;
        Ok(&self.data[off..off + v.label_size])
    }

    fn write_index(
        &mut self,
        i: usize,
        seq: u32,
        version: LabelVersion,
        nslot: u32,
        index_size: usize,
    ) {
        let label_size = version.label_size();
        let bytes = &mut self.data[i * index_size..(i + 1) * index_size];
        bytes.fill(0);
        {
            let raw = RawIndexBlock::from_bytes_mut(bytes);
            raw.sig = INDEX_SIGNATURE;
            raw.flags = [0; 3];
            raw.labelsize = (label_size >> 8) as u8;
            raw.seq.set(seq);
            raw.myoff.set((i * index_size) as u64);
            raw.mysize.set(index_size as u64);
            raw.otheroff.set(((1 - i) * index_size) as u64);
            raw.labeloff.set((2 * index_size) as u64);
            raw.nslot.set(nslot);
            raw.major.set(1);
            raw.minor.set(match version {
                LabelVersion::V1_1 => 1,
                LabelVersion::V1_2 => 2,
            });
        }
        // Every slot starts free.
        let bitmap_len = (nslot as usize).div_ceil(8);
        bytes[INDEX_HEADER_SIZE..INDEX_HEADER_SIZE + bitmap_len].fill(0xff);

        let sum = fletcher64(bytes);
        RawIndexBlock::from_bytes_mut(bytes).checksum.set(sum);
    }

    /// Builds one fresh index block for `version` with the given
    /// sequence number, returning the extent that must be written back.
    ///
    /// Callers that persist the area stage the two blocks through this
    /// so the intermediate on-dimm state (one new block, one old) is
    /// itself a valid store.
    pub fn format_index(
        &mut self,
        i: usize,
        seq: u32,
        version: LabelVersion,
    ) -> Result<(u32, WriteExtent), LabelError> {
        let (nslot, index_size) = area_geometry(self.data.len(), version.label_size())?;
        self.write_index(i, seq, version, nslot, index_size);
        Ok((
            nslot,
            WriteExtent {
                offset: i * index_size,
                len: index_size,
            },
        ))
    }

    /// Builds a fresh pair of index blocks for `version`.
    ///
    /// Block 0 carries sequence 3 and block 1 sequence 1, so block 0 is
    /// current once both land. The returned plan writes block 1 before
    /// block 0.
    pub fn init(&mut self, version: LabelVersion) -> Result<InitPlan, LabelError> {
        let (nslot, w1) = self.format_index(1, 1, version)?;
        let (_, w0) = self.format_index(0, 3, version)?;
        Ok(InitPlan {
            nslot,
            writes: [w1, w0],
        })
    }

    /// Clears the whole config area. The returned extent covers it all.
    pub fn zero(&mut self) -> WriteExtent {
        self.data.fill(0);
        WriteExtent {
            offset: 0,
            len: self.data.len(),
        }
    }

    /// Stores `label` into `slot` and marks the slot allocated in the
    /// current index bitmap, recomputing the index checksum.
    ///
    /// Used by tests and by the repair tooling; the driver performs its
    /// own slot writes during normal namespace creation.
    pub fn put_label(
        &mut self,
        v: &Validated,
        slot: u32,
        label: &Label,
    ) -> Result<[WriteExtent; 2], LabelError> {
        if slot >= v.nslot {
            return Err(LabelError::SlotOutOfRange {
                slot,
                nslot: v.nslot,
            });
        }
        let off = 2 * v.index_size + slot as usize * v.label_size;
        let mut stored = label.clone();
        stored.slot = slot;
        stored.encode(&mut self.data[off..off + v.label_size]);

        let index_base = v.current * v.index_size;
        let bytes = &mut self.data[index_base..index_base + v.index_size];
        bytes[INDEX_HEADER_SIZE + slot as usize / 8] &= !(1u8 << (slot % 8));
        RawIndexBlock::from_bytes_mut(bytes).checksum.set(0);
        let sum = fletcher64(bytes);
        RawIndexBlock::from_bytes_mut(bytes).checksum.set(sum);

        Ok([
            WriteExtent {
                offset: off,
                len: v.label_size,
            },
            WriteExtent {
                offset: index_base,
                len: v.index_size,
            },
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG_SIZE: usize = 128 * 1024;

    #[test]
    fn geometry_totals_never_exceed_config_size() {
        for (config, label) in [
            (CONFIG_SIZE, 128),
            (CONFIG_SIZE, 256),
            (64 * 1024, 128),
            (64 * 1024, 256),
            (4096, 128),
        ] {
            let (nslot, index) = area_geometry(config, label).unwrap();
            assert!(2 * index + nslot as usize * label <= config);
            assert!(index >= INDEX_MIN_SIZE);
            assert_eq!(index % INDEX_ALIGN, 0);
            assert!(index - INDEX_HEADER_SIZE >= (nslot as usize).div_ceil(8));
        }
    }

    #[test]
    fn geometry_is_exact_for_the_stock_config_size() {
        // A fully-formatted 128K area wastes nothing at either label size.
        let (nslot, index) = area_geometry(CONFIG_SIZE, 128).unwrap();
        assert_eq!((nslot, index), (1016, 512));
        assert_eq!(2 * index + nslot as usize * 128, CONFIG_SIZE);

        let (nslot, index) = area_geometry(CONFIG_SIZE, 256).unwrap();
        assert_eq!((nslot, index), (508, 512));
        assert_eq!(2 * index + nslot as usize * 256, CONFIG_SIZE);
    }

    #[test]
    fn too_small_for_labels() {
        assert!(matches!(
            area_geometry(1024, 256),
            Err(LabelError::AreaTooSmall(_))
        ));
    }

    #[test]
    fn init_produces_a_valid_current_index_zero() {
        let mut area = LabelArea::zeroed(CONFIG_SIZE);
        let plan = area.init(LabelVersion::V1_2).unwrap();
        assert_eq!(plan.nslot, 508);
        // Non-current block is scheduled first.
        assert_eq!(plan.writes[0].offset, 512);
        assert_eq!(plan.writes[1].offset, 0);

        let v = area.validate().unwrap();
        assert_eq!(v.current, 0);
        assert_eq!(v.label_size, 256);
        assert_eq!(v.index_size, 512);
        assert_eq!(v.nslot, 508);
        assert_eq!(area.free_slots(&v), 508);
        assert_eq!(area.active_count(&v), 0);
    }

    #[test]
    fn torn_init_with_only_block_one_still_validates() {
        let mut whole = LabelArea::zeroed(CONFIG_SIZE);
        let plan = whole.init(LabelVersion::V1_1).unwrap();

        // Apply only the first scheduled write to a blank area.
        let mut torn = LabelArea::zeroed(CONFIG_SIZE);
        let w = plan.writes[0];
        torn.data[w.offset..w.offset + w.len]
            .copy_from_slice(&whole.data()[w.offset..w.offset + w.len]);

        let v = torn.validate().unwrap();
        assert_eq!(v.current, 1);
        assert_eq!(v.label_size, 128);
    }

    #[test]
    fn validate_picks_newer_sequence() {
        let mut area = LabelArea::zeroed(CONFIG_SIZE);
        area.init(LabelVersion::V1_2).unwrap();
        // Block 0 holds seq 3, block 1 seq 1: inc(1) == 3, so 0 wins.
        let v = area.validate().unwrap();
        assert_eq!(v.current, 0);

        // Rewrite block 1 with the successor of 3 and it takes over.
        let (nslot, index_size) = area_geometry(CONFIG_SIZE, 256).unwrap();
        area.write_index(1, 2, LabelVersion::V1_2, nslot, index_size);
        let v = area.validate().unwrap();
        assert_eq!(v.current, 1);
    }

    #[test]
    fn corrupt_checksum_invalidates_block() {
        let mut area = LabelArea::zeroed(CONFIG_SIZE);
        area.init(LabelVersion::V1_2).unwrap();
        // Flip a byte inside block 0's bitmap.
        area.data[100] ^= 0xff;
        let v = area.validate().unwrap();
        assert_eq!(v.current, 1);

        // Corrupt block 1 as well and the store is unformatted.
        area.data[512 + 100] ^= 0xff;
        assert!(matches!(area.validate(), Err(LabelError::Unformatted)));
    }

    #[test]
    fn zeroed_store_is_unformatted() {
        let area = LabelArea::zeroed(CONFIG_SIZE);
        assert!(matches!(area.validate(), Err(LabelError::Unformatted)));
    }

    #[test]
    fn put_label_round_trip_and_stale_slot_skip() {
        let mut area = LabelArea::zeroed(CONFIG_SIZE);
        area.init(LabelVersion::V1_2).unwrap();
        let v = area.validate().unwrap();

        let label = Label {
            uuid: nvmctl_common::Guid::generate(),
            name: "pool0".into(),
            flags: 0,
            nlabel: 1,
            position: 0,
            isetcookie: 0x1122_3344,
            lbasize: 512,
            dpa: 0x4000_0000,
            rawsize: 1 << 28,
            slot: 0,
            type_guid: None,
            abstraction_guid: None,
        };
        area.put_label(&v, 3, &label).unwrap();

        let found: Vec<_> = area.labels(&v).collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].slot, 3);
        assert_eq!(found[0].uuid, label.uuid);
        assert_eq!(area.free_slots(&v), v.nslot - 1);

        // A label whose slot field disagrees with its position is stale.
        let raw_off = 2 * v.index_size + 4 * v.label_size;
        let mut bad = label.clone();
        bad.slot = 9;
        bad.encode(&mut area.data[raw_off..raw_off + v.label_size]);
        let index_base = 0;
        let bytes = &mut area.data[index_base..v.index_size];
        bytes[INDEX_HEADER_SIZE] &= !(1u8 << 4);
        RawIndexBlock::from_bytes_mut(bytes).checksum.set(0);
        let sum = fletcher64(bytes);
        RawIndexBlock::from_bytes_mut(bytes).checksum.set(sum);

        let found: Vec<_> = area.labels(&v).collect();
        assert_eq!(found.len(), 1, "stale slot must be skipped");
    }

    #[test]
    fn probe_prefers_v1_2_only_when_both_blocks_agree() {
        let mut area = LabelArea::zeroed(CONFIG_SIZE);
        assert_eq!(area.probe_label_size(), 128);
        area.init(LabelVersion::V1_2).unwrap();
        // Index blocks are 512 bytes here but the probe looks at the two
        // 256-byte candidate offsets; only the first header is real.
        assert_eq!(area.probe_label_size(), 256);
    }
}
