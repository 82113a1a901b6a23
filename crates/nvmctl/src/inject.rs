//! Per-namespace media-error injection and its status tracking.
//!
//! Platforms that support injection take system-physical-address ranges;
//! namespaces speak in 512-byte blocks. The translation goes through the
//! namespace's (or its holder's) resource base, and the status tracker
//! coalesces what firmware reports into a sorted list of extents.

use log::debug;

use crate::region::{ChildKind, Region};
use crate::{Error, Result};

/// Injection granularity: namespaces count media in 512-byte blocks.
const BLOCK_SIZE: u64 = 512;

/// One injected extent, in namespace blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BadRange {
    pub block: u64,
    pub count: u64,
}

impl BadRange {
    fn end(&self) -> u64 {
        self.block + self.count - 1
    }
}

/// A sorted list of coalesced bad-block extents.
#[derive(Debug, Default)]
pub struct BadRangeList {
    ranges: Vec<BadRange>,
}

impl BadRangeList {
    pub fn new() -> BadRangeList {
        BadRangeList::default()
    }

    /// Inserts `(block, count)` keeping the list sorted, then merges
    /// overlapping and adjacent neighbors. One insertion can cascade
    /// through several merges.
    pub fn add(&mut self, block: u64, count: u64) {
        if count == 0 {
            return;
        }
        let range = BadRange { block, count };
        let pos = self
            .ranges
            .partition_point(|r| r.block <= range.block);
        self.ranges.insert(pos, range);

        let mut i = 0;
        while i + 1 < self.ranges.len() {
            let cur = self.ranges[i];
            let next = self.ranges[i + 1];
            if next.block <= cur.end() + 1 {
                // Overlapping or adjoining; next may extend cur or be
                // contained in it.
                let end = cur.end().max(next.end());
                self.ranges[i].count = end - cur.block + 1;
                self.ranges.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }

    pub fn ranges(&self) -> &[BadRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// The SPA window injection operates in: the enabled holder's resource
/// when one claims the namespace, the namespace's own otherwise.
fn injection_bounds(region: &mut Region, ns_idx: usize) -> Result<(u64, u64)> {
    let ns = region.namespace(ns_idx)?.clone();
    let devname = ns.devname().to_owned();
    if let Some(child) = region.holder_of(&devname) {
        if matches!(child.kind(), ChildKind::Pfn | ChildKind::Dax) {
            let base = crate::sysfs::read_attr_u64(&child.path().join("resource"))?;
            let size = crate::sysfs::read_attr_u64(&child.path().join("size"))?;
            return Ok((base, size));
        }
    }
    let base = ns.resource();
    if base == u64::MAX {
        return Err(Error::NotSupported(format!("{devname}: no resource")));
    }
    Ok((base, ns.size()))
}

/// Translates a block extent to an SPA extent, rejecting requests that
/// leave the namespace.
pub fn block_to_spa(
    region: &mut Region,
    ns_idx: usize,
    block: u64,
    count: u64,
) -> Result<(u64, u64)> {
    let (base, size) = injection_bounds(region, ns_idx)?;
    let offset = base + block * BLOCK_SIZE;
    let length = count * BLOCK_SIZE;
    if offset + length > base + size {
        debug!("block {block:#x} count {count:#x} out of bounds");
        return Err(Error::InvalidArgument(format!(
            "block {block:#x}, count {count:#x} out of bounds"
        )));
    }
    Ok((offset, length))
}

/// Folds firmware-reported SPA records that intersect the namespace
/// back into block extents.
pub fn spa_to_blocks(
    region: &mut Region,
    ns_idx: usize,
    records: &[(u64, u64)],
) -> Result<BadRangeList> {
    let (base, size) = injection_bounds(region, ns_idx)?;
    let mut list = BadRangeList::new();
    for &(addr, len) in records {
        if addr + len <= base || addr >= base + size {
            continue;
        }
        let start = addr.max(base);
        let end = (addr + len).min(base + size);
        list.add((start - base) / BLOCK_SIZE, (end - start).div_ceil(BLOCK_SIZE));
    }
    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(list: &BadRangeList) -> Vec<(u64, u64)> {
        list.ranges().iter().map(|r| (r.block, r.count)).collect()
    }

    #[test]
    fn keeps_disjoint_ranges_sorted() {
        let mut list = BadRangeList::new();
        list.add(100, 4);
        list.add(10, 2);
        list.add(50, 1);
        assert_eq!(collect(&list), vec![(10, 2), (50, 1), (100, 4)]);
    }

    #[test]
    fn merges_overlap_and_adjacency() {
        let mut list = BadRangeList::new();
        list.add(10, 4); // 10..=13
        list.add(14, 2); // adjoining -> 10..=15
        assert_eq!(collect(&list), vec![(10, 6)]);

        list.add(12, 2); // contained
        assert_eq!(collect(&list), vec![(10, 6)]);

        list.add(15, 10); // overlaps tail -> 10..=24
        assert_eq!(collect(&list), vec![(10, 15)]);
    }

    #[test]
    fn one_insertion_can_cascade() {
        let mut list = BadRangeList::new();
        list.add(10, 2);
        list.add(20, 2);
        list.add(30, 2);
        // Bridges all three.
        list.add(12, 19);
        assert_eq!(collect(&list), vec![(10, 22)]);
    }

    #[test]
    fn zero_count_is_ignored() {
        let mut list = BadRangeList::new();
        list.add(5, 0);
        assert!(list.is_empty());
    }
}
