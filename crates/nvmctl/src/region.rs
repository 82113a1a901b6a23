//! Interleave sets and their capacity children.
//!
//! A region owns mappings (dimm contributions), namespaces, and the
//! btt/pfn/dax children that can claim a namespace. Disabling a region
//! invalidates every child: they move to per-kind stale lists, the
//! region's `generation` is bumped, and handles that captured the old
//! generation fail with [`Error::Stale`] instead of touching reaped
//! state. A later `cleanup` drops the stale objects for good.

use std::path::{Path, PathBuf};

use log::{debug, info};
use nvmctl_common::Guid;

use crate::sysfs::{parse_u64, read_attr, read_attr_opt, read_attr_u64, write_attr, write_attr_quiet};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionType {
    Pmem,
    Blk,
}

/// One dimm's contribution to a region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub dimm_name: String,
    pub offset: u64,
    pub length: u64,
    pub position: u32,
}

impl Mapping {
    /// Parses the `mapping<N>` attribute form `nmemX,offset,length,position`.
    fn parse(text: &str) -> Option<Mapping> {
        let mut parts = text.split(',');
        let dimm_name = parts.next()?.trim().to_owned();
        let offset = parse_u64(parts.next()?.trim())?;
        let length = parse_u64(parts.next()?.trim())?;
        let position = parse_u64(parts.next().unwrap_or("0").trim())? as u32;
        Some(Mapping {
            dimm_name,
            offset,
            length,
            position,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NsType {
    Io,
    Pmem,
    Blk,
}

/// A capacity subdivision of a region.
#[derive(Debug, Clone)]
pub struct Namespace {
    name: String,
    path: PathBuf,
    ntype: NsType,
    generation: u64,
}

impl Namespace {
    fn probe(path: &Path, generation: u64) -> Result<Namespace> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_owned();
        let ntype = match read_attr_opt(&path.join("devtype"))?.as_deref() {
            Some("namespace_pmem") => NsType::Pmem,
            Some("namespace_blk") => NsType::Blk,
            _ => NsType::Io,
        };
        Ok(Namespace {
            name,
            path: path.to_owned(),
            ntype,
            generation,
        })
    }

    pub fn devname(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ntype(&self) -> NsType {
        self.ntype
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether this handle still belongs to the region's current
    /// generation.
    pub fn is_valid(&self, region: &Region) -> bool {
        self.generation == region.generation
    }

    pub fn size(&self) -> u64 {
        read_attr_u64(&self.path.join("size")).unwrap_or(0)
    }

    pub fn set_size(&self, size: u64) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidArgument(format!(
                "{}: zero size is the delete protocol, use delete()",
                self.name
            )));
        }
        if self.is_enabled() {
            return Err(Error::Busy(self.name.clone()));
        }
        write_attr(&self.path.join("size"), &size.to_string())?;
        Ok(())
    }

    /// The "zero byte" delete protocol: the driver reclaims the capacity
    /// when size is set to zero. Never removes the device node itself.
    pub fn delete(&self) -> Result<()> {
        if self.is_enabled() {
            return Err(Error::Busy(self.name.clone()));
        }
        write_attr(&self.path.join("size"), "0")?;
        Ok(())
    }

    pub fn uuid(&self) -> Option<Guid> {
        let text = read_attr_opt(&self.path.join("uuid")).ok()??;
        Guid::parse(&text).ok().filter(|g| !g.is_null())
    }

    pub fn set_uuid(&self, uuid: &Guid) -> Result<()> {
        write_attr(&self.path.join("uuid"), &uuid.to_string())?;
        Ok(())
    }

    pub fn alt_name(&self) -> String {
        read_attr_opt(&self.path.join("alt_name"))
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    pub fn set_alt_name(&self, name: &str) -> Result<()> {
        if name.len() > 63 {
            return Err(Error::InvalidArgument(format!(
                "{}: alt_name longer than 63 bytes",
                self.name
            )));
        }
        write_attr(&self.path.join("alt_name"), name)?;
        Ok(())
    }

    /// System physical address, or `u64::MAX` when unmapped.
    pub fn resource(&self) -> u64 {
        read_attr_opt(&self.path.join("resource"))
            .ok()
            .flatten()
            .and_then(|t| parse_u64(&t))
            .unwrap_or(u64::MAX)
    }

    pub fn sector_size(&self) -> Option<u64> {
        read_attr_opt(&self.path.join("sector_size"))
            .ok()
            .flatten()
            .and_then(|t| parse_u64(&t))
    }

    pub fn set_sector_size(&self, size: u64) -> Result<()> {
        write_attr(&self.path.join("sector_size"), &size.to_string())?;
        Ok(())
    }

    pub fn supported_sector_sizes(&self) -> Vec<u64> {
        read_attr_opt(&self.path.join("supported_sector_sizes"))
            .ok()
            .flatten()
            .map(|t| t.split_whitespace().filter_map(parse_u64).collect())
            .unwrap_or_default()
    }

    /// Current mode as the driver reports it.
    pub fn mode(&self) -> String {
        read_attr_opt(&self.path.join("mode"))
            .ok()
            .flatten()
            .unwrap_or_else(|| "raw".to_owned())
    }

    /// Communicates the chosen mode to the driver. Kernels without the
    /// attribute ignore the write; that must not fail the operation.
    pub fn set_enforce_mode(&self, mode: &str) -> Result<()> {
        write_attr_quiet(&self.path.join("enforce_mode"), mode)?;
        Ok(())
    }

    pub fn raw_mode(&self) -> bool {
        read_attr_opt(&self.path.join("force_raw"))
            .ok()
            .flatten()
            .is_some_and(|t| t == "1")
    }

    pub fn set_raw_mode(&self, raw: bool) -> Result<()> {
        write_attr(&self.path.join("force_raw"), if raw { "1" } else { "0" })?;
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        read_attr(&self.path.join("state")).is_ok_and(|s| s == "enabled")
    }

    pub fn enable(&self) -> Result<()> {
        write_attr(&self.path.join("state"), "enabled")?;
        Ok(())
    }

    pub fn disable(&self) -> Result<()> {
        write_attr(&self.path.join("state"), "disabled")?;
        Ok(())
    }

    /// Devname of the claiming btt/pfn/dax, if one holds this namespace.
    pub fn holder(&self) -> Option<String> {
        read_attr_opt(&self.path.join("holder"))
            .ok()
            .flatten()
            .filter(|h| !h.is_empty())
    }

    /// Block device name once enabled.
    pub fn block_device(&self) -> Option<String> {
        read_attr_opt(&self.path.join("bdev"))
            .ok()
            .flatten()
            .filter(|b| !b.is_empty())
    }

    /// Enabled, or claimed by an enabled holder.
    pub fn is_active(&self) -> bool {
        self.is_enabled() || self.holder().is_some()
    }
}

/// Kind tag for the stacked claiming devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    Btt,
    Pfn,
    Dax,
}

impl ChildKind {
    pub fn prefix(self) -> &'static str {
        match self {
            ChildKind::Btt => "btt",
            ChildKind::Pfn => "pfn",
            ChildKind::Dax => "dax",
        }
    }
}

/// A btt, pfn, or dax device stacked over a namespace.
#[derive(Debug, Clone)]
pub struct Child {
    kind: ChildKind,
    name: String,
    path: PathBuf,
    generation: u64,
}

impl Child {
    fn probe(kind: ChildKind, path: &Path, generation: u64) -> Child {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_owned();
        Child {
            kind,
            name,
            path: path.to_owned(),
            generation,
        }
    }

    pub fn kind(&self) -> ChildKind {
        self.kind
    }

    pub fn devname(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_valid(&self, region: &Region) -> bool {
        self.generation == region.generation
    }

    pub fn uuid(&self) -> Option<Guid> {
        let text = read_attr_opt(&self.path.join("uuid")).ok()??;
        Guid::parse(&text).ok().filter(|g| !g.is_null())
    }

    pub fn set_uuid(&self, uuid: &Guid) -> Result<()> {
        write_attr(&self.path.join("uuid"), &uuid.to_string())?;
        Ok(())
    }

    pub fn sector_size(&self) -> Option<u64> {
        read_attr_opt(&self.path.join("sector_size"))
            .ok()
            .flatten()
            .and_then(|t| parse_u64(&t))
    }

    pub fn set_sector_size(&self, size: u64) -> Result<()> {
        write_attr(&self.path.join("sector_size"), &size.to_string())?;
        Ok(())
    }

    pub fn supported_sector_sizes(&self) -> Vec<u64> {
        read_attr_opt(&self.path.join("supported_sector_sizes"))
            .ok()
            .flatten()
            .map(|t| t.split_whitespace().filter_map(parse_u64).collect())
            .unwrap_or_default()
    }

    /// Whether the kernel exposes an alignment knob on this device.
    pub fn has_align(&self) -> bool {
        self.path.join("align").exists()
    }

    pub fn align(&self) -> Option<u64> {
        read_attr_opt(&self.path.join("align"))
            .ok()
            .flatten()
            .and_then(|t| parse_u64(&t))
    }

    pub fn set_align(&self, align: u64) -> Result<()> {
        write_attr(&self.path.join("align"), &align.to_string())?;
        Ok(())
    }

    /// memmap location for pfn/dax devices: "pmem" or "ram".
    pub fn location(&self) -> Option<String> {
        read_attr_opt(&self.path.join("mode")).ok().flatten()
    }

    pub fn set_location(&self, loc: &str) -> Result<()> {
        write_attr(&self.path.join("mode"), loc)?;
        Ok(())
    }

    /// The claimed namespace's devname.
    pub fn namespace(&self) -> Option<String> {
        read_attr_opt(&self.path.join("namespace"))
            .ok()
            .flatten()
            .filter(|n| !n.is_empty())
    }

    pub fn set_namespace(&self, ns_devname: &str) -> Result<()> {
        write_attr(&self.path.join("namespace"), ns_devname)?;
        Ok(())
    }

    pub fn block_device(&self) -> Option<String> {
        read_attr_opt(&self.path.join("bdev"))
            .ok()
            .flatten()
            .filter(|b| !b.is_empty())
    }

    /// Char device name for dax children.
    pub fn char_device(&self) -> Option<String> {
        read_attr_opt(&self.path.join("chardev"))
            .ok()
            .flatten()
            .filter(|c| !c.is_empty())
    }

    pub fn is_enabled(&self) -> bool {
        read_attr(&self.path.join("state")).is_ok_and(|s| s == "enabled")
    }

    pub fn enable(&self) -> Result<()> {
        write_attr(&self.path.join("state"), "enabled")?;
        Ok(())
    }

    pub fn disable(&self) -> Result<()> {
        write_attr(&self.path.join("state"), "disabled")?;
        Ok(())
    }

    /// Unbinds and releases the claimed namespace, returning the device
    /// to seed duty.
    pub fn delete(&self) -> Result<()> {
        self.disable()?;
        write_attr(&self.path.join("namespace"), "")?;
        Ok(())
    }

    pub fn is_idle(&self) -> bool {
        !self.is_enabled() && self.namespace().is_none()
    }
}

pub struct Region {
    id: u32,
    path: PathBuf,
    dev_dir: PathBuf,
    rtype: RegionType,
    size: u64,
    read_only: bool,
    set_cookie: u64,
    mappings: Vec<Mapping>,
    pub(crate) generation: u64,
    namespaces: Vec<Namespace>,
    ns_init: bool,
    children: Vec<Child>,
    children_init: bool,
    stale_namespaces: Vec<Namespace>,
    stale_children: Vec<Child>,
}

impl Region {
    pub(crate) fn probe(id: u32, path: &Path, dev_dir: &Path) -> Result<Region> {
        let rtype = match read_attr(&path.join("devtype"))?.as_str() {
            "pmem" => RegionType::Pmem,
            "blk" => RegionType::Blk,
            other => {
                return Err(Error::Corrupt(format!("region{id}: bad devtype {other:?}")));
            }
        };
        let size = read_attr_u64(&path.join("size"))?;
        let read_only = read_attr_opt(&path.join("read_only"))?.as_deref() == Some("1");
        let set_cookie = read_attr_opt(&path.join("set_cookie"))?
            .and_then(|t| parse_u64(&t))
            .unwrap_or(0);
        let count = read_attr_opt(&path.join("mappings"))?
            .and_then(|t| parse_u64(&t))
            .unwrap_or(0);
        let mut mappings = Vec::new();
        for i in 0..count {
            if let Some(text) = read_attr_opt(&path.join(format!("mapping{i}")))? {
                if let Some(mapping) = Mapping::parse(&text) {
                    mappings.push(mapping);
                }
            }
        }
        Ok(Region {
            id,
            path: path.to_owned(),
            dev_dir: dev_dir.to_owned(),
            rtype,
            size,
            read_only,
            set_cookie,
            mappings,
            generation: 0,
            namespaces: Vec::new(),
            ns_init: false,
            children: Vec::new(),
            children_init: false,
            stale_namespaces: Vec::new(),
            stale_children: Vec::new(),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn devname(&self) -> String {
        format!("region{}", self.id)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dev_dir(&self) -> &Path {
        &self.dev_dir
    }

    pub fn rtype(&self) -> RegionType {
        self.rtype
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn set_cookie(&self) -> u64 {
        self.set_cookie
    }

    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    pub fn interleave_ways(&self) -> u32 {
        self.mappings.len().max(1) as u32
    }

    /// Unclaimed capacity; re-read on every call because namespace
    /// operations change it behind our back.
    pub fn available_size(&self) -> u64 {
        read_attr_u64(&self.path.join("available_size")).unwrap_or(0)
    }

    /// Base system physical address of the interleave set.
    pub fn resource(&self) -> Option<u64> {
        read_attr_opt(&self.path.join("resource"))
            .ok()
            .flatten()
            .and_then(|t| parse_u64(&t))
    }

    /// Namespace type the region currently produces; autolabel flips an
    /// `io` region to `pmem` once labels exist.
    pub fn nstype(&self) -> String {
        read_attr_opt(&self.path.join("nstype"))
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_enabled(&self) -> bool {
        read_attr(&self.path.join("state")).is_ok_and(|s| s == "enabled")
    }

    pub fn enable(&self) -> Result<()> {
        write_attr(&self.path.join("state"), "enabled")?;
        Ok(())
    }

    /// Unbinds the region and invalidates all children: they move to the
    /// stale lists and the generation advances, so outstanding handles
    /// resolve as stale rather than touching rebuilt devices.
    pub fn disable(&mut self) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        write_attr(&self.path.join("state"), "disabled")?;
        self.invalidate_children();
        info!("{}: disabled", self.devname());
        Ok(())
    }

    pub(crate) fn invalidate_children(&mut self) {
        self.stale_namespaces.append(&mut self.namespaces);
        self.stale_children.append(&mut self.children);
        self.ns_init = false;
        self.children_init = false;
        self.generation += 1;
    }

    /// Drops objects invalidated by earlier disables.
    pub fn cleanup(&mut self) {
        let dropped = self.stale_namespaces.len() + self.stale_children.len();
        if dropped > 0 {
            debug!("{}: reaped {dropped} stale objects", self.devname());
        }
        self.stale_namespaces.clear();
        self.stale_children.clear();
    }

    pub fn stale_namespaces(&self) -> &[Namespace] {
        &self.stale_namespaces
    }

    fn init_namespaces(&mut self) {
        if self.ns_init {
            return;
        }
        self.ns_init = true;
        let prefix = format!("namespace{}.", self.id);
        for path in child_dirs(&self.path, &prefix) {
            let name = dir_name(&path);
            if self.namespaces.iter().any(|n| n.devname() == name) {
                continue;
            }
            if let Ok(ns) = Namespace::probe(&path, self.generation) {
                self.namespaces.push(ns);
            }
        }
        self.namespaces
            .sort_by_key(|n| ns_ordinal(n.devname()));
    }

    pub fn namespaces(&mut self) -> &[Namespace] {
        self.init_namespaces();
        &self.namespaces
    }

    pub fn namespace_by_name(&mut self, devname: &str) -> Result<usize> {
        self.init_namespaces();
        self.namespaces
            .iter()
            .position(|n| n.devname() == devname)
            .ok_or_else(|| Error::NotFound(devname.to_owned()))
    }

    pub fn namespace(&self, idx: usize) -> Result<&Namespace> {
        let ns = self
            .namespaces
            .get(idx)
            .ok_or_else(|| Error::NotFound(format!("{} namespace {idx}", self.devname())))?;
        if !ns.is_valid(self) {
            return Err(Error::Stale(ns.devname().to_owned()));
        }
        Ok(ns)
    }

    fn init_children(&mut self) {
        if self.children_init {
            return;
        }
        self.children_init = true;
        for kind in [ChildKind::Btt, ChildKind::Pfn, ChildKind::Dax] {
            let prefix = format!("{}{}.", kind.prefix(), self.id);
            for path in child_dirs(&self.path, &prefix) {
                let name = dir_name(&path);
                if self.children.iter().any(|c| c.devname() == name) {
                    continue;
                }
                self.children.push(Child::probe(kind, &path, self.generation));
            }
        }
    }

    pub fn children(&mut self) -> &[Child] {
        self.init_children();
        &self.children
    }

    /// The idle namespace to configure next: the 0th if idle, otherwise
    /// the driver-designated seed.
    pub fn namespace_seed(&mut self) -> Option<usize> {
        self.init_namespaces();
        let zeroth = format!("namespace{}.0", self.id);
        if let Some(idx) = self
            .namespaces
            .iter()
            .position(|n| n.devname() == zeroth && !n.is_active())
        {
            return Some(idx);
        }
        let seed = read_attr_opt(&self.path.join("namespace_seed")).ok().flatten();
        match seed {
            Some(name) => self.namespaces.iter().position(|n| n.devname() == name),
            None => self.namespaces.iter().position(|n| !n.is_active()),
        }
    }

    /// The idle child of `kind` the driver exposes for configuration.
    pub fn child_seed(&mut self, kind: ChildKind) -> Option<usize> {
        self.init_children();
        let attr = format!("{}_seed", kind.prefix());
        if let Some(name) = read_attr_opt(&self.path.join(attr)).ok().flatten() {
            if let Some(idx) = self
                .children
                .iter()
                .position(|c| c.kind() == kind && c.devname() == name)
            {
                return Some(idx);
            }
        }
        self.children
            .iter()
            .position(|c| c.kind() == kind && c.is_idle())
    }

    pub fn child(&self, idx: usize) -> Result<&Child> {
        let child = self
            .children
            .get(idx)
            .ok_or_else(|| Error::NotFound(format!("{} child {idx}", self.devname())))?;
        if !child.is_valid(self) {
            return Err(Error::Stale(child.devname().to_owned()));
        }
        Ok(child)
    }

    /// The enabled holder claiming `ns_devname`, if any.
    pub fn holder_of(&mut self, ns_devname: &str) -> Option<&Child> {
        self.init_children();
        self.children
            .iter()
            .find(|c| c.namespace().as_deref() == Some(ns_devname))
    }
}

fn child_dirs(path: &Path, prefix: &str) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(path) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .filter(|e| {
            e.file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(prefix))
                && e.path().is_dir()
        })
        .map(|e| e.path())
        .collect();
    dirs.sort();
    dirs
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_owned()
}

/// The `<N>` in `namespace<R>.<N>`.
fn ns_ordinal(devname: &str) -> u32 {
    devname
        .rsplit('.')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_attr_parses() {
        let m = Mapping::parse("nmem0,0x1000,0x8000000,1").unwrap();
        assert_eq!(m.dimm_name, "nmem0");
        assert_eq!(m.offset, 0x1000);
        assert_eq!(m.length, 0x8000000);
        assert_eq!(m.position, 1);
        assert!(Mapping::parse("garbage").is_none());
    }

    #[test]
    fn namespace_ordinal_sorting() {
        assert_eq!(ns_ordinal("namespace0.3"), 3);
        assert_eq!(ns_ordinal("namespace12.10"), 10);
        assert_eq!(ns_ordinal("weird"), u32::MAX);
    }
}
