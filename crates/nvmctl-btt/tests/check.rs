use bytemuck::Zeroable;
use nvmctl_btt::structures::{
    BTT_INFO_SIZE, MAP_ENT_NORMAL, MAP_LBA_MASK,
};
use nvmctl_btt::{ArenaStatus, BttCheck, BttError, CheckOpts, Media, RamMedia, RawBttInfo};
use nvmctl_btt::{LogEntry, RawLogEntry};
use nvmctl_common::Guid;

/// Smallest capacity the recovery estimator accepts as one arena.
const RAWSIZE: u64 = 1 << 24;

const DATA_OFF: u64 = 4096;
const MAP_OFF: u64 = 8192;
const LOG_OFF: u64 = 12288;

struct ArenaImage {
    media: RamMedia,
    parent: Guid,
}

/// Builds a single consistent v1.1 arena: identity map, one log lane per
/// free block parked on the tail of the internal space, backup info block
/// at the end of the raw capacity.
fn build_arena(external_nlba: u32, internal_nlba: u32) -> ArenaImage {
    let nfree = internal_nlba - external_nlba;
    let parent = Guid::generate();
    let mut media = RamMedia::new(RAWSIZE as usize);
    let info2off = RAWSIZE - BTT_INFO_SIZE as u64;

    let mut info = RawBttInfo::zeroed();
    info.sig = *b"BTT_ARENA_INFO\0\0";
    info.uuid = Guid::generate();
    info.parent_uuid = parent;
    info.major.set(1);
    info.minor.set(1);
    info.external_lbasize.set(512);
    info.internal_lbasize.set(512);
    info.external_nlba.set(external_nlba);
    info.internal_nlba.set(internal_nlba);
    info.nfree.set(nfree);
    info.infosize.set(BTT_INFO_SIZE as u32);
    info.nextoff.set(0);
    info.dataoff.set(DATA_OFF);
    info.mapoff.set(MAP_OFF);
    info.logoff.set(LOG_OFF);
    info.info2off.set(info2off);
    info.update_checksum();

    media.write_all_at(bytemuck::bytes_of(&info), 0).unwrap();
    media
        .write_all_at(bytemuck::bytes_of(&info), info2off)
        .unwrap();

    for lba in 0..external_nlba {
        write_map_entry(&mut media, lba, lba | MAP_ENT_NORMAL);
    }
    for lane in 0..nfree {
        write_log_lane(
            &mut media,
            lane,
            LogEntry {
                lba: lane % external_nlba,
                old_map: external_nlba + lane,
                new_map: lane % external_nlba,
                seq: 1,
            },
        );
    }

    ArenaImage { media, parent }
}

fn write_map_entry(media: &mut RamMedia, lba: u32, raw: u32) {
    media
        .write_all_at(&raw.to_le_bytes(), MAP_OFF + lba as u64 * 4)
        .unwrap();
}

fn read_map_entry(media: &RamMedia, lba: u32) -> u32 {
    let mut buf = [0u8; 4];
    media.read_exact_at(&mut buf, MAP_OFF + lba as u64 * 4).unwrap();
    u32::from_le_bytes(buf)
}

/// Stores `entry` in slot 0 of `lane` and leaves slot 1 unused (seq 0).
fn write_log_lane(media: &mut RamMedia, lane: u32, entry: LogEntry) {
    let mut raw = [RawLogEntry::zeroed(); 2];
    raw[0].lba.set(entry.lba);
    raw[0].old_map.set(entry.old_map);
    raw[0].new_map.set(entry.new_map);
    raw[0].seq.set(entry.seq);
    media
        .write_all_at(bytemuck::cast_slice(&raw), LOG_OFF + lane as u64 * 32)
        .unwrap();
}

fn check(image: &mut ArenaImage, repair: bool) -> Result<nvmctl_btt::CheckSummary, BttError> {
    let parent = image.parent;
    let opts = CheckOpts {
        verbose: false,
        repair,
    };
    BttCheck::new(&mut image.media, RAWSIZE, parent, opts).run()
}

#[test]
fn consistent_arena_passes() {
    let mut image = build_arena(4, 5);
    let summary = check(&mut image, false).unwrap();
    assert_eq!(summary.arenas, 1);
    assert_eq!(summary.total_nlba, 4);
    assert_eq!(summary.repairs, 0);
    assert_eq!(summary.advisories, 0);
}

#[test]
fn uncommitted_log_update_is_repaired() {
    // Lane 0 recorded a 2 -> 4 move for external lba 2, but the map still
    // points at the old block.
    let mut image = build_arena(4, 5);
    write_log_lane(
        &mut image.media,
        0,
        LogEntry {
            lba: 2,
            old_map: 2,
            new_map: 4,
            seq: 1,
        },
    );

    // Read-only: the divergence is advisory, and the stale map then trips
    // the bitmap test as a double reference.
    let err = check(&mut image, false).unwrap_err();
    assert!(matches!(
        err,
        BttError::Arena {
            arena: 0,
            status: ArenaStatus::BitmapDoubleRef { block: 2 },
        }
    ));

    // Repair commits the map write and the arena is whole again.
    let summary = check(&mut image, true).unwrap();
    assert!(summary.repairs >= 1);
    assert_eq!(read_map_entry(&image.media, 2), 4 | MAP_ENT_NORMAL);
    assert_eq!(read_map_entry(&image.media, 2) & MAP_LBA_MASK, 4);

    let summary = check(&mut image, false).unwrap();
    assert_eq!(summary.repairs, 0);
    assert_eq!(summary.advisories, 0);

    // Both info blocks still verify.
    let mut buf = vec![0u8; BTT_INFO_SIZE];
    image.media.read_exact_at(&mut buf, 0).unwrap();
    assert!(RawBttInfo::from_bytes(&buf).verify(&image.parent));
    image
        .media
        .read_exact_at(&mut buf, RAWSIZE - BTT_INFO_SIZE as u64)
        .unwrap();
    assert!(RawBttInfo::from_bytes(&buf).verify(&image.parent));
}

#[test]
fn zeroed_primary_recovers_from_backup() {
    let mut image = build_arena(4, 5);
    image
        .media
        .write_all_at(&[0u8; BTT_INFO_SIZE], 0)
        .unwrap();

    // Read-only mode finds the backup but may not write it.
    let err = check(&mut image, false).unwrap_err();
    assert!(matches!(err, BttError::RepairNeeded));

    // Repair restores the primary from the end-of-arena backup; a
    // subsequent read-only check passes silently.
    check(&mut image, true).unwrap();
    let summary = check(&mut image, false).unwrap();
    assert_eq!(summary.arenas, 1);

    let mut primary = vec![0u8; BTT_INFO_SIZE];
    let mut backup = vec![0u8; BTT_INFO_SIZE];
    image.media.read_exact_at(&mut primary, 0).unwrap();
    image
        .media
        .read_exact_at(&mut backup, RAWSIZE - BTT_INFO_SIZE as u64)
        .unwrap();
    assert_eq!(primary, backup);
}

#[test]
fn equal_log_sequences_are_rejected() {
    let mut image = build_arena(4, 5);
    // Slot 1 of lane 0 gets the same sequence as slot 0.
    let entry = LogEntry {
        lba: 0,
        old_map: 4,
        new_map: 0,
        seq: 1,
    };
    let mut raw = [RawLogEntry::zeroed(); 2];
    for slot in &mut raw {
        slot.lba.set(entry.lba);
        slot.old_map.set(entry.old_map);
        slot.new_map.set(entry.new_map);
        slot.seq.set(entry.seq);
    }
    image
        .media
        .write_all_at(bytemuck::cast_slice(&raw), LOG_OFF)
        .unwrap();

    let err = check(&mut image, false).unwrap_err();
    assert!(matches!(
        err,
        BttError::Arena {
            arena: 0,
            status: ArenaStatus::LogSeqEqual { lane: 0 },
        }
    ));
}

#[test]
fn out_of_bounds_map_entry_is_rejected() {
    let mut image = build_arena(4, 5);
    write_map_entry(&mut image.media, 1, 9 | MAP_ENT_NORMAL);
    let err = check(&mut image, false).unwrap_err();
    assert!(matches!(
        err,
        BttError::Arena {
            arena: 0,
            status: ArenaStatus::MapOutOfBounds { lba: 1, mapping: 9 },
        }
    ));
}

#[test]
fn double_referenced_block_is_rejected() {
    let mut image = build_arena(4, 5);
    write_map_entry(&mut image.media, 1, 0 | MAP_ENT_NORMAL);
    let err = check(&mut image, false).unwrap_err();
    assert!(matches!(
        err,
        BttError::Arena {
            arena: 0,
            status: ArenaStatus::BitmapDoubleRef { block: 0 },
        }
    ));
}

#[test]
fn stale_info2_is_advisory_then_repaired() {
    let mut image = build_arena(4, 5);
    // Flip a byte in the backup's padding so only the backup is corrupt.
    let off = RAWSIZE - BTT_INFO_SIZE as u64 + 1000;
    image.media.write_all_at(&[0xa5], off).unwrap();

    let summary = check(&mut image, false).unwrap();
    assert_eq!(summary.advisories, 1);
    assert_eq!(summary.repairs, 0);

    let summary = check(&mut image, true).unwrap();
    assert_eq!(summary.repairs, 1);

    let mut primary = vec![0u8; BTT_INFO_SIZE];
    let mut backup = vec![0u8; BTT_INFO_SIZE];
    image.media.read_exact_at(&mut primary, 0).unwrap();
    image
        .media
        .read_exact_at(&mut backup, RAWSIZE - BTT_INFO_SIZE as u64)
        .unwrap();
    assert_eq!(primary, backup);
}

#[test]
fn error_flag_aborts_the_check() {
    let mut image = build_arena(4, 5);
    let mut buf = vec![0u8; BTT_INFO_SIZE];
    image.media.read_exact_at(&mut buf, 0).unwrap();
    {
        let info = RawBttInfo::from_bytes_mut(&mut buf);
        info.flags.set(1);
        info.update_checksum();
    }
    image.media.write_all_at(&buf, 0).unwrap();
    image
        .media
        .write_all_at(&buf, RAWSIZE - BTT_INFO_SIZE as u64)
        .unwrap();

    let err = check(&mut image, false).unwrap_err();
    assert!(matches!(err, BttError::ErrorFlag(0)));
}

#[test]
fn two_arena_chain_is_discovered() {
    let parent = Guid::generate();
    let mut media = RamMedia::new(RAWSIZE as usize);
    let arena1_off: u64 = 8 << 20;

    for (base, nextoff, info2_rel) in [
        (0u64, arena1_off, arena1_off - BTT_INFO_SIZE as u64),
        (arena1_off, 0, RAWSIZE - arena1_off - BTT_INFO_SIZE as u64),
    ] {
        let mut info = RawBttInfo::zeroed();
        info.sig = *b"BTT_ARENA_INFO\0\0";
        info.parent_uuid = parent;
        info.major.set(1);
        info.minor.set(1);
        info.external_lbasize.set(512);
        info.internal_lbasize.set(512);
        info.external_nlba.set(4);
        info.internal_nlba.set(5);
        info.nfree.set(1);
        info.infosize.set(BTT_INFO_SIZE as u32);
        info.nextoff.set(nextoff);
        info.dataoff.set(DATA_OFF);
        info.mapoff.set(MAP_OFF);
        info.logoff.set(LOG_OFF);
        info.info2off.set(info2_rel);
        info.update_checksum();
        media.write_all_at(bytemuck::bytes_of(&info), base).unwrap();
        media
            .write_all_at(bytemuck::bytes_of(&info), base + info2_rel)
            .unwrap();

        for lba in 0..4u32 {
            media
                .write_all_at(
                    &(lba | MAP_ENT_NORMAL).to_le_bytes(),
                    base + MAP_OFF + lba as u64 * 4,
                )
                .unwrap();
        }
        let mut raw = [RawLogEntry::zeroed(); 2];
        raw[0].lba.set(0);
        raw[0].old_map.set(4);
        raw[0].new_map.set(0);
        raw[0].seq.set(1);
        media
            .write_all_at(bytemuck::cast_slice(&raw), base + LOG_OFF)
            .unwrap();
    }

    let opts = CheckOpts::default();
    let summary = BttCheck::new(&mut media, RAWSIZE, parent, opts).run().unwrap();
    assert_eq!(summary.arenas, 2);
    assert_eq!(summary.total_nlba, 8);
}
