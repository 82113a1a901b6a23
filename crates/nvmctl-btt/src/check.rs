//! Arena discovery, verification, and targeted repair.
//!
//! The pipeline mirrors the on-media dependency order: find a trustworthy
//! info block (recovering the primary from a backup when necessary), walk
//! the arena chain, then check each arena's log, map, log/map agreement,
//! backup info block, and finally the block-reference bitmap. The bitmap
//! test runs last so that a repaired log/map divergence does not read as a
//! double reference.

use bytemuck::Zeroable;
use log::{debug, error, info, warn};
use nvmctl_common::Guid;
use nvmctl_common::alg::bitmap::Bitmap;
use nvmctl_common::size::{SZ_4K, align_down};

use crate::BttError;
use crate::media::Media;
use crate::structures::info::{InfoFlags, RawBttInfo};
use crate::structures::log::{LogEntry, RawLogEntry, newer_of};
use crate::structures::{
    ARENA_MAX_SIZE, ARENA_MIN_SIZE, BTT_INFO_SIZE, BTT1_START_OFFSET, BTT2_START_OFFSET,
    MAP_ENT_NORMAL, map_lookup,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct CheckOpts {
    pub verbose: bool,
    pub repair: bool,
}

/// What a successful check covered and touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckSummary {
    pub arenas: usize,
    /// Total external blocks across the chain.
    pub total_nlba: u64,
    /// Metadata writes performed (repair mode only).
    pub repairs: usize,
    /// Repairs that were needed but only reported.
    pub advisories: usize,
}

/// Per-arena consistency failures, named by the failing field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ArenaStatus {
    #[error("log lane {lane}: both entries carry the same sequence number")]
    LogSeqEqual { lane: u32 },
    #[error("log lane {lane}: sequence number out of bounds")]
    LogSeqOutOfBounds { lane: u32 },
    #[error("log lane {lane}: lba {lba:#x} out of bounds")]
    LogLbaOutOfBounds { lane: u32, lba: u32 },
    #[error("log lane {lane}: old mapping {old_map:#x} out of bounds")]
    LogOldOutOfBounds { lane: u32, old_map: u32 },
    #[error("log lane {lane}: new mapping {new_map:#x} out of bounds")]
    LogNewOutOfBounds { lane: u32, new_map: u32 },
    #[error("map[{lba:#x}]: mapping {mapping:#x} out of bounds")]
    MapOutOfBounds { lba: u32, mapping: u32 },
    #[error("internal block {block:#x} is referenced twice")]
    BitmapDoubleRef { block: u32 },
    #[error("internal block {block:#x} is never referenced")]
    BitmapOrphan { block: u32 },
}

/// One arena's geometry with all offsets made absolute.
#[derive(Debug, Clone)]
struct Arena {
    num: usize,
    size: u64,
    external_nlba: u32,
    internal_nlba: u32,
    nfree: u32,
    /// Absolute offset of the next arena's info block, 0 for the last.
    nextoff: u64,
    infooff: u64,
    mapoff: u64,
    logoff: u64,
    info2off: u64,
}

/// The check driver for one namespace's worth of raw capacity.
pub struct BttCheck<'a, M: Media> {
    media: &'a mut M,
    rawsize: u64,
    parent_uuid: Guid,
    opts: CheckOpts,
    start_off: u64,
    arenas: Vec<Arena>,
    repairs: usize,
    advisories: usize,
}

impl<'a, M: Media> BttCheck<'a, M> {
    pub fn new(media: &'a mut M, rawsize: u64, parent_uuid: Guid, opts: CheckOpts) -> Self {
        Self {
            media,
            rawsize,
            parent_uuid,
            opts,
            start_off: 0,
            arenas: Vec::new(),
            repairs: 0,
            advisories: 0,
        }
    }

    /// Runs the full pipeline.
    pub fn run(&mut self) -> Result<CheckSummary, BttError> {
        let mut start = None;
        for off in [BTT1_START_OFFSET, BTT2_START_OFFSET] {
            if off + BTT_INFO_SIZE as u64 > self.rawsize {
                break;
            }
            let block = self.read_info(off)?;
            if block.verify(&self.parent_uuid) {
                start = Some(off);
                break;
            }
        }

        self.start_off = match start {
            Some(off) => off,
            None => {
                error!("primary info block missing or corrupt at both start offsets");
                self.recover_first_info()?
            }
        };

        self.discover_arenas()?;
        self.check_arenas()?;

        Ok(CheckSummary {
            arenas: self.arenas.len(),
            total_nlba: self
                .arenas
                .iter()
                .map(|a| a.external_nlba as u64)
                .sum(),
            repairs: self.repairs,
            advisories: self.advisories,
        })
    }

    fn read_info(&self, off: u64) -> Result<Box<RawBttInfo>, BttError> {
        let mut block = Box::new(RawBttInfo::zeroed());
        self.media
            .read_exact_at(bytemuck::bytes_of_mut(block.as_mut()), off)?;
        Ok(block)
    }

    fn read_verified(&self, off: u64) -> Result<Box<RawBttInfo>, BttError> {
        let block = self.read_info(off)?;
        if block.verify(&self.parent_uuid) {
            Ok(block)
        } else {
            Err(BttError::NoInfoBlock)
        }
    }

    fn write_info(&mut self, block: &RawBttInfo, off: u64) -> Result<(), BttError> {
        if !self.opts.repair {
            error!("BTT info block at offset {off:#x} needs to be restored");
            return Err(BttError::RepairNeeded);
        }
        info!("restoring BTT info block at offset {off:#x}");
        self.media.write_all_at(bytemuck::bytes_of(block), off)?;
        self.media.sync()?;
        self.repairs += 1;
        Ok(())
    }

    /// Estimated arena count for capacity starting at `off`, and the
    /// leftover tail too small to hold an arena of its own.
    fn estimate_arenas(&self, off: u64) -> Result<(u64, u64), BttError> {
        let mut remaining = self.rawsize - off;
        let mut est = 0u64;
        loop {
            if remaining < ARENA_MIN_SIZE && est == 0 {
                return Err(BttError::NoInfoBlock);
            }
            if remaining > ARENA_MAX_SIZE {
                remaining -= ARENA_MAX_SIZE;
                est += 1;
                continue;
            }
            if remaining < ARENA_MIN_SIZE {
                break;
            }
            remaining = 0;
            est += 1;
            break;
        }
        debug!("estimated arenas: {est}, loose tail: {remaining:#x}");
        Ok((est, remaining))
    }

    /// Three-strategy recovery of the primary info block at `off`.
    fn recover_at(&mut self, off: u64) -> Result<(), BttError> {
        let (est_arenas, tail) = self.estimate_arenas(off)?;
        let primary = self.read_info(off)?;

        // Strategy 1: the backup at the expected end of the first arena.
        let backup_off = if est_arenas == 1 {
            align_down(self.rawsize - tail, SZ_4K) - BTT_INFO_SIZE as u64
        } else {
            off + ARENA_MAX_SIZE - BTT_INFO_SIZE as u64
        };
        info!("attempting recovery from end-of-arena offset {backup_off:#x}");
        if let Ok(block) = self.read_verified(backup_off) {
            // A backup found at the end of an arena verifies for any
            // start offset; its version field says which one it was
            // formatted for.
            return match block.expected_start_offset() {
                Some(expected) if expected == off => self.write_info(&block, off),
                _ => Err(BttError::NoInfoBlock),
            };
        }

        // Strategy 2: stitch the arena0-specific fields onto the backup
        // of the very last arena. Only those fields (and the checksum)
        // differ between arenas, so a clean stitch re-verifies.
        if est_arenas > 1 {
            let last_off = align_down(self.rawsize - tail, SZ_4K) - BTT_INFO_SIZE as u64;
            info!("attempting recovery from end offset {last_off:#x}");
            let mut block = self.read_verified(last_off)?;
            block.flags = primary.flags;
            block.external_nlba = primary.external_nlba;
            block.internal_nlba = primary.internal_nlba;
            block.nextoff = primary.nextoff;
            block.dataoff = primary.dataoff;
            block.mapoff = primary.mapoff;
            block.logoff = primary.logoff;
            block.info2off = primary.info2off;
            block.checksum = primary.checksum;
            if block.verify(&self.parent_uuid) {
                return self.write_info(&block, off);
            }
        }

        // Strategy 3: trust the corrupt primary's info2off pointer if it
        // stays inside the first arena.
        let info2off = primary.info2off.get();
        let limit = (self.rawsize - BTT_INFO_SIZE as u64)
            .min(off + ARENA_MAX_SIZE - BTT_INFO_SIZE as u64);
        if info2off == 0 || info2off + off > limit {
            return Err(BttError::NoInfoBlock);
        }
        info!("attempting recovery from info2 offset {:#x}", info2off + off);
        let block = self.read_verified(info2off + off)?;
        self.write_info(&block, off)
    }

    /// Tries recovery at both known start offsets; the one that succeeds
    /// becomes the arena chain's start.
    fn recover_first_info(&mut self) -> Result<u64, BttError> {
        let mut last = BttError::NoInfoBlock;
        for off in [BTT1_START_OFFSET, BTT2_START_OFFSET] {
            if off + BTT_INFO_SIZE as u64 > self.rawsize {
                break;
            }
            match self.recover_at(off) {
                Ok(()) => return Ok(off),
                Err(err) => {
                    // A found-but-unwritable block is worth reporting
                    // over plain absence.
                    if !matches!(last, BttError::RepairNeeded) {
                        last = err;
                    }
                }
            }
        }
        error!("unable to recover any BTT info block");
        Err(last)
    }

    fn parse_arena(&self, num: usize, block: &RawBttInfo, arena_off: u64) -> Result<Arena, BttError> {
        let external_nlba = block.external_nlba.get();
        let internal_nlba = block.internal_nlba.get();
        let nfree = block.nfree.get();

        if internal_nlba.wrapping_sub(external_nlba) != nfree {
            return Err(BttError::Geometry(num));
        }
        if block.internal_lbasize.get() != block.external_lbasize.get() {
            return Err(BttError::Geometry(num));
        }
        if block.flags().contains(InfoFlags::ERROR) {
            error!("arena {num}: info block error flag is set, aborting");
            return Err(BttError::ErrorFlag(num));
        }

        let rel_next = block.nextoff.get();
        let info2off = arena_off + block.info2off.get();
        Ok(Arena {
            num,
            size: if rel_next > 0 {
                rel_next
            } else {
                info2off - arena_off + BTT_INFO_SIZE as u64
            },
            external_nlba,
            internal_nlba,
            nfree,
            nextoff: if rel_next == 0 { 0 } else { arena_off + rel_next },
            infooff: arena_off,
            mapoff: arena_off + block.mapoff.get(),
            logoff: arena_off + block.logoff.get(),
            info2off,
        })
    }

    /// Walks the arena chain from `start_off`, restoring a corrupt
    /// primary from its own backup along the way.
    fn discover_arenas(&mut self) -> Result<(), BttError> {
        let mut remaining = self.rawsize - self.start_off;
        let mut cur_off = self.start_off;
        let mut num = 0;

        while remaining >= BTT_INFO_SIZE as u64 {
            let mut block = self.read_info(cur_off)?;
            if !block.verify(&self.parent_uuid) {
                let backup_off = if remaining <= ARENA_MAX_SIZE {
                    align_down(self.rawsize, SZ_4K) - BTT_INFO_SIZE as u64
                } else {
                    cur_off + ARENA_MAX_SIZE - BTT_INFO_SIZE as u64
                };
                info!("arena {num}: attempting recovery using the backup info block");
                block = self.read_info(backup_off)?;
                if !block.verify(&self.parent_uuid) {
                    error!("arena {num}: backup info block at {backup_off:#x} is also invalid");
                    return Err(BttError::NoInfoBlock);
                }
                self.write_info(&block, cur_off)?;
            }

            let arena = self.parse_arena(num, &block, cur_off)?;
            remaining = remaining.saturating_sub(arena.size);
            cur_off += arena.size;
            num += 1;
            let next = arena.nextoff;
            self.arenas.push(arena);
            if next == 0 {
                break;
            }
        }

        info!(
            "found {} BTT arena{}",
            self.arenas.len(),
            if self.arenas.len() == 1 { "" } else { "s" }
        );
        Ok(())
    }

    fn map_raw(&self, arena: &Arena, lba: u32) -> Result<u32, BttError> {
        let mut buf = [0u8; 4];
        self.media
            .read_exact_at(&mut buf, arena.mapoff + lba as u64 * 4)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn map_lookup(&self, arena: &Arena, lba: u32) -> Result<u32, BttError> {
        Ok(map_lookup(self.map_raw(arena, lba)?, lba))
    }

    /// Stores a normal-encoded mapping, or reports what would change when
    /// repair is off.
    fn map_write(&mut self, arena: &Arena, lba: u32, mapping: u32) -> Result<(), BttError> {
        if !self.opts.repair {
            warn!(
                "arena {}: map[{lba:#x}] needs to be updated to {mapping:#x}",
                arena.num
            );
            self.advisories += 1;
            return Ok(());
        }
        info!(
            "arena {}: updating map[{lba:#x}] to {mapping:#x}",
            arena.num
        );
        let bytes = (mapping | MAP_ENT_NORMAL).to_le_bytes();
        self.media
            .write_all_at(&bytes, arena.mapoff + lba as u64 * 4)?;
        self.media.sync()?;
        self.repairs += 1;
        Ok(())
    }

    fn log_pair(&self, arena: &Arena, lane: u32) -> Result<[LogEntry; 2], BttError> {
        let mut raw = [RawLogEntry::zeroed(); 2];
        self.media.read_exact_at(
            bytemuck::cast_slice_mut(&mut raw),
            arena.logoff + lane as u64 * 32,
        )?;
        Ok([LogEntry::from(&raw[0]), LogEntry::from(&raw[1])])
    }

    fn log_newer(&self, arena: &Arena, lane: u32) -> Result<LogEntry, BttError> {
        let pair = self.log_pair(arena, lane)?;
        Ok(pair[newer_of(pair[0].seq, pair[1].seq)])
    }

    /// Both slots of every lane must disagree in sequence and stay on the
    /// ring; the live entry's fields must be in range.
    fn check_log_entries(&self, arena: &Arena) -> Result<(), BttError> {
        let fail = |status| BttError::Arena {
            arena: arena.num,
            status,
        };
        for lane in 0..arena.nfree {
            let pair = self.log_pair(arena, lane)?;
            if pair[0].seq == pair[1].seq {
                return Err(fail(ArenaStatus::LogSeqEqual { lane }));
            }
            if pair[0].seq > 3 || pair[1].seq > 3 {
                return Err(fail(ArenaStatus::LogSeqOutOfBounds { lane }));
            }
        }
        for lane in 0..arena.nfree {
            let log = self.log_newer(arena, lane)?;
            if log.lba >= arena.external_nlba {
                return Err(fail(ArenaStatus::LogLbaOutOfBounds { lane, lba: log.lba }));
            }
            if log.old_map >= arena.internal_nlba {
                return Err(fail(ArenaStatus::LogOldOutOfBounds {
                    lane,
                    old_map: log.old_map,
                }));
            }
            if log.new_map >= arena.internal_nlba {
                return Err(fail(ArenaStatus::LogNewOutOfBounds {
                    lane,
                    new_map: log.new_map,
                }));
            }
        }
        Ok(())
    }

    /// Every post-map block must be inside the arena.
    fn check_map_entries(&self, arena: &Arena) -> Result<(), BttError> {
        const CHUNK: usize = 16384;
        let mut buf = vec![0u8; CHUNK * 4];
        let mut lba = 0u32;
        while lba < arena.external_nlba {
            let count = CHUNK.min((arena.external_nlba - lba) as usize);
            self.media
                .read_exact_at(&mut buf[..count * 4], arena.mapoff + lba as u64 * 4)?;
            for i in 0..count {
                let raw = u32::from_le_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap());
                let cur = lba + i as u32;
                let mapping = map_lookup(raw, cur);
                if mapping >= arena.internal_nlba {
                    return Err(BttError::Arena {
                        arena: arena.num,
                        status: ArenaStatus::MapOutOfBounds { lba: cur, mapping },
                    });
                }
            }
            lba += count as u32;
        }
        Ok(())
    }

    /// The live log entry of each lane must agree with the map: either
    /// the update committed (`new_map` is in the map) or it never started
    /// (`old_map` still there). The latter means the log landed but the
    /// map write was lost; a single map write makes them agree again.
    fn check_log_map(&mut self, arena: &Arena) -> Result<(), BttError> {
        for lane in 0..arena.nfree {
            let log = self.log_newer(arena, lane)?;
            let mapping = self.map_lookup(arena, log.lba)?;
            if log.new_map != mapping && log.old_map == mapping {
                info!(
                    "arena {}: log[{lane}].new_map ({:#x}) does not match map[{:#x}] ({:#x})",
                    arena.num, log.new_map, log.lba, mapping
                );
                self.map_write(arena, log.lba, log.new_map)?;
            }
        }
        Ok(())
    }

    /// The backup info block must equal the (already verified) primary.
    fn check_info2(&mut self, arena: &Arena) -> Result<(), BttError> {
        let primary = self.read_info(arena.infooff)?;
        let backup = self.read_info(arena.info2off)?;
        if bytemuck::bytes_of(primary.as_ref()) == bytemuck::bytes_of(backup.as_ref()) {
            return Ok(());
        }
        if !self.opts.repair {
            warn!("arena {}: info2 needs to be restored", arena.num);
            self.advisories += 1;
            return Ok(());
        }
        info!("arena {}: restoring info2", arena.num);
        self.media
            .write_all_at(bytemuck::bytes_of(primary.as_ref()), arena.info2off)?;
        self.media.sync()?;
        self.repairs += 1;
        Ok(())
    }

    /// Between the map and the free list, every internal block must be
    /// referenced exactly once.
    fn check_bitmap(&self, arena: &Arena) -> Result<(), BttError> {
        let mut bm = Bitmap::new(arena.internal_nlba as usize);

        const CHUNK: usize = 16384;
        let mut buf = vec![0u8; CHUNK * 4];
        let mut lba = 0u32;
        while lba < arena.external_nlba {
            let count = CHUNK.min((arena.external_nlba - lba) as usize);
            self.media
                .read_exact_at(&mut buf[..count * 4], arena.mapoff + lba as u64 * 4)?;
            for i in 0..count {
                let raw = u32::from_le_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap());
                let mapping = map_lookup(raw, lba + i as u32);
                if bm.test_and_set(mapping as usize) {
                    info!(
                        "arena {}: internal block {mapping:#x} referenced by two map entries",
                        arena.num
                    );
                    return Err(BttError::Arena {
                        arena: arena.num,
                        status: ArenaStatus::BitmapDoubleRef { block: mapping },
                    });
                }
            }
            lba += count as u32;
        }

        for lane in 0..arena.nfree {
            let log = self.log_newer(arena, lane)?;
            if bm.test_and_set(log.old_map as usize) {
                info!(
                    "arena {}: internal block {:#x} referenced by two map/log entries",
                    arena.num, log.old_map
                );
                return Err(BttError::Arena {
                    arena: arena.num,
                    status: ArenaStatus::BitmapDoubleRef { block: log.old_map },
                });
            }
        }

        if let Some(block) = bm.first_clear() {
            return Err(BttError::Arena {
                arena: arena.num,
                status: ArenaStatus::BitmapOrphan {
                    block: block as u32,
                },
            });
        }
        Ok(())
    }

    fn check_arenas(&mut self) -> Result<(), BttError> {
        for i in 0..self.arenas.len() {
            let arena = self.arenas[i].clone();
            info!("checking arena {}", arena.num);
            self.check_log_entries(&arena)?;
            self.check_map_entries(&arena)?;
            self.check_log_map(&arena)?;
            self.check_info2(&arena)?;
            self.check_bitmap(&arena)?;
        }
        Ok(())
    }
}
