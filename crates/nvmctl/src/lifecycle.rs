//! Namespace creation, reconfiguration, and destruction.

use std::fs::OpenOptions;
use std::os::unix::fs::{FileExt, OpenOptionsExt};

use log::{debug, info, warn};
use nvmctl_common::size::{SZ_1G, SZ_2M, SZ_4K, display_size};
use nvmctl_common::Guid;
use nvmctl_label::LabelVersion;

use crate::bus::Bus;
use crate::dimm::DimmCmds;
use crate::region::{Child, ChildKind, NsType, Region, RegionType};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NsMode {
    Raw,
    Safe,
    Memory,
    Dax,
}

impl NsMode {
    pub fn as_attr(self) -> &'static str {
        match self {
            NsMode::Raw => "raw",
            NsMode::Safe => "safe",
            NsMode::Memory => "memory",
            NsMode::Dax => "dax",
        }
    }

    /// Accepts the spellings users write; `sector` is an alias of `safe`
    /// and `fsdax` of `memory`.
    pub fn parse(text: &str) -> Result<NsMode> {
        match text {
            "raw" => Ok(NsMode::Raw),
            "safe" | "sector" => Ok(NsMode::Safe),
            "memory" | "fsdax" => Ok(NsMode::Memory),
            "dax" | "devdax" => Ok(NsMode::Dax),
            other => Err(Error::InvalidArgument(format!("invalid mode {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapLocation {
    /// memmap array in regular memory.
    Mem,
    /// memmap array reserved out of the pmem capacity itself.
    Dev,
}

impl MapLocation {
    pub fn as_attr(self) -> &'static str {
        match self {
            MapLocation::Mem => "ram",
            MapLocation::Dev => "pmem",
        }
    }

    pub fn parse(text: &str) -> Result<MapLocation> {
        match text {
            "mem" => Ok(MapLocation::Mem),
            "dev" => Ok(MapLocation::Dev),
            other => Err(Error::InvalidArgument(format!(
                "invalid map location {other:?}"
            ))),
        }
    }
}

/// The user's request, before validation against a region.
#[derive(Debug, Clone)]
pub struct CreateParams {
    pub rtype: Option<RegionType>,
    pub mode: Option<NsMode>,
    /// Set when `mode` came from a default rather than the user.
    pub mode_default: bool,
    pub map: Option<MapLocation>,
    pub align: Option<u64>,
    /// Set when `align` came from a default rather than the user.
    pub align_default: bool,
    pub size: Option<u64>,
    /// Unit the size was expressed in; diagnostics quote recommendations
    /// in these terms.
    pub size_units: u64,
    pub sector_size: Option<u64>,
    pub uuid: Option<Guid>,
    pub name: Option<String>,
    pub autolabel: bool,
    pub force: bool,
}

impl Default for CreateParams {
    fn default() -> Self {
        CreateParams {
            rtype: None,
            mode: None,
            mode_default: false,
            map: None,
            align: None,
            align_default: false,
            size: None,
            size_units: 1,
            sector_size: None,
            uuid: None,
            name: None,
            autolabel: true,
            force: false,
        }
    }
}

impl CreateParams {
    /// Fills unset options with the create-time defaults and rejects
    /// impossible combinations before any device is touched.
    pub fn normalize(mut self, reconfig: bool) -> Result<CreateParams> {
        if self.rtype.is_none() && !reconfig {
            self.rtype = Some(RegionType::Pmem);
        }
        if self.mode.is_none() && !reconfig {
            self.mode = Some(match self.rtype {
                Some(RegionType::Blk) => NsMode::Safe,
                _ => NsMode::Memory,
            });
            self.mode_default = true;
        }
        if self.map.is_some() {
            if !reconfig && !matches!(self.mode, Some(NsMode::Memory) | Some(NsMode::Dax)) {
                return Err(Error::InvalidArgument(
                    "--map is only valid for a memory or dax mode pmem namespace".into(),
                ));
            }
        } else if !reconfig {
            self.map = Some(MapLocation::Dev);
        }
        if self.rtype == Some(RegionType::Blk) && self.mode == Some(NsMode::Memory) {
            return Err(Error::InvalidArgument(
                "only pmem namespaces can be placed into memory mode".into(),
            ));
        }
        if self.align.is_none() {
            self.align = Some(SZ_2M);
            self.align_default = true;
        }
        if self.sector_size.is_none()
            && !reconfig
            && (self.rtype == Some(RegionType::Blk) || self.mode == Some(NsMode::Safe))
        {
            self.sector_size = Some(4096);
        }
        Ok(self)
    }
}

/// Parameters after validation against a concrete region.
#[derive(Debug, Clone)]
struct Parsed {
    size: u64,
    uuid: Guid,
    name: String,
    mode: NsMode,
    align: u64,
    /// `None` means the kernel offers no sector-size knob here.
    sector_size: Option<u64>,
    loc: MapLocation,
    autolabel: bool,
}

fn do_setup_pfn(ndns_mode: Option<NsMode>, p: &Parsed) -> bool {
    if p.mode != NsMode::Memory {
        return false;
    }
    // A dynamically allocated namespace always needs the pfn instance,
    // as does placing the memmap array in device memory.
    match ndns_mode {
        None => true,
        Some(mode) if mode != NsMode::Memory => true,
        _ => p.loc == MapLocation::Dev,
    }
}

/// Validates `params` against `region` (and the namespace being
/// reconfigured, if any), producing the concrete setup plan.
fn validate_options(
    region: &mut Region,
    ndns_idx: Option<usize>,
    params: &CreateParams,
) -> Result<Parsed> {
    let region_name = region.devname();
    if !region.is_enabled() {
        debug!("{region_name}: disabled, skipping");
        return Err(Error::Unsuitable(region_name));
    }
    if let Some(rtype) = params.rtype {
        if rtype != region.rtype() {
            return Err(Error::Unsuitable(region_name));
        }
    }

    let ndns = ndns_idx
        .map(|idx| region.namespace(idx).map(|n| n.clone()))
        .transpose()?;

    let size = match params.size {
        Some(size) => size,
        None => ndns.as_ref().map(|n| n.size()).unwrap_or(0),
    };

    let uuid = params.uuid.unwrap_or_else(Guid::generate);

    let name = match &params.name {
        Some(name) => {
            if name.len() > 63 {
                return Err(Error::InvalidArgument("name longer than 63 bytes".into()));
            }
            name.clone()
        }
        None => ndns.as_ref().map(|n| n.alt_name()).unwrap_or_default(),
    };

    let mode = match params.mode {
        Some(mode) => {
            if region.rtype() != RegionType::Pmem
                && matches!(mode, NsMode::Memory | NsMode::Dax)
            {
                debug!("blk {region_name} does not support {} mode", mode.as_attr());
                return Err(Error::Unsuitable(region_name));
            }
            mode
        }
        None => match ndns.as_ref().map(|n| n.mode()).as_deref() {
            Some("safe") => NsMode::Safe,
            Some("memory") => NsMode::Memory,
            Some("dax") => NsMode::Dax,
            _ => NsMode::Raw,
        },
    };

    let mut align = params.align.unwrap_or(SZ_2M);
    let mut size_align = SZ_4K;
    if params.align.is_some() {
        let pfn_seed = region.child_seed(ChildKind::Pfn);
        let dax_seed = region.child_seed(ChildKind::Dax);
        let seed_has_align = |idx: Option<usize>, region: &Region| {
            idx.and_then(|i| region.child(i).ok().map(|c| c.has_align()))
                .unwrap_or(false)
        };

        if mode == NsMode::Memory && align != SZ_2M && !seed_has_align(pfn_seed, region) {
            // Early pfn support implies a fixed 2M alignment.
            debug!("{region_name}: no align support for memory mode");
            return Err(Error::Unsuitable(region_name));
        } else if mode == NsMode::Dax && !seed_has_align(dax_seed, region) {
            debug!("{region_name}: no align support for dax mode");
            return Err(Error::Unsuitable(region_name));
        } else if !params.align_default && matches!(mode, NsMode::Safe | NsMode::Raw) {
            return Err(Error::InvalidArgument(format!(
                "{} mode does not support setting an alignment",
                if mode == NsMode::Safe { "sector" } else { "raw" }
            )));
        }

        // A region base that is not itself 2M aligned cannot host 2M
        // data offsets; fall back quietly when the user did not ask.
        if params.align_default
            && region.resource().is_some_and(|r| r & (SZ_2M - 1) != 0)
        {
            debug!("{region_name}: falling back to a 4K alignment");
            align = SZ_4K;
        }

        if !matches!(align, SZ_4K | SZ_2M | SZ_1G) {
            return Err(Error::InvalidArgument(format!("unsupported align {align}")));
        }

        if matches!(mode, NsMode::Memory | NsMode::Dax) {
            size_align = align;
        }
    }

    let ways = region.interleave_ways() as u64;
    if size % (size_align * ways) != 0 {
        // Quote the recommendation in the units the caller used.
        let units = params.size_units.max(1);
        let rec_align = units.max(size_align) * ways;
        let recommended = (size / rec_align + 1) * rec_align;
        let quoted = match units {
            1 => display_size(recommended),
            _ => format!(
                "{}{}",
                recommended / units,
                match units {
                    nvmctl_common::size::SZ_1K => "K",
                    nvmctl_common::size::SZ_1M => "M",
                    SZ_1G => "G",
                    nvmctl_common::size::SZ_1T => "T",
                    _ => "",
                }
            ),
        };
        return Err(Error::InvalidArgument(format!(
            "size must align to interleave-width {ways} and alignment {size_align}; \
             did you intend --size={quoted}?"
        )));
    }

    let sector_size = if let Some(requested) = params.sector_size {
        if mode == NsMode::Safe {
            let btt_seed = region
                .child_seed(ChildKind::Btt)
                .ok_or_else(|| {
                    debug!("{region_name}: does not support sector mode");
                    Error::InvalidArgument(format!("{region_name}: no btt support"))
                })?;
            let supported = region.child(btt_seed)?.supported_sector_sizes();
            if !supported.contains(&requested) {
                return Err(Error::InvalidArgument(format!(
                    "{region_name}: btt sector size {requested} not supported"
                )));
            }
        } else {
            let supported = match &ndns {
                Some(ns) => ns.supported_sector_sizes(),
                None => {
                    let seed = region.namespace_seed().ok_or_else(|| {
                        Error::NotFound(format!("{region_name}: no namespace seed"))
                    })?;
                    region.namespace(seed)?.supported_sector_sizes()
                }
            };
            // 512 is the kernel default for pmem and always accepted.
            if !supported.contains(&requested)
                && !(requested == 512 && region.rtype() == RegionType::Pmem)
            {
                return Err(Error::InvalidArgument(format!(
                    "{region_name}: sector size {requested} not supported"
                )));
            }
        }
        Some(requested)
    } else if let Some(ns) = &ndns {
        // Carry the btt's sector size forward while the mode stays
        // safe, otherwise whatever the namespace reports.
        let holder = region.holder_of(ns.devname()).cloned();
        match holder {
            Some(child) if child.kind() == ChildKind::Btt && mode == NsMode::Safe => {
                child.sector_size()
            }
            _ => ns.sector_size(),
        }
    } else {
        let seed = region
            .namespace_seed()
            .ok_or_else(|| Error::NotFound(format!("{region_name}: no namespace seed")))?;
        let seed_ns = region.namespace(seed)?;
        if seed_ns.ntype() == NsType::Blk {
            debug!("{region_name}: blk seed without an explicit sector size");
        }
        if seed_ns.supported_sector_sizes().is_empty() {
            // Pre-v1.2 label support exposes no sector-size knob.
            None
        } else {
            Some(512)
        }
    };

    let loc = match params.map {
        Some(loc) => {
            if ndns.is_some() && !matches!(mode, NsMode::Memory | NsMode::Dax) {
                return Err(Error::InvalidArgument(
                    "--map is only valid for a memory or dax mode namespace".into(),
                ));
            }
            loc
        }
        // The memmap default for memory and dax modes is device memory.
        None => MapLocation::Dev,
    };

    let mut parsed = Parsed {
        size,
        uuid,
        name,
        mode,
        align,
        sector_size,
        loc,
        autolabel: params.autolabel,
    };

    let ndns_mode = ndns.as_ref().map(|n| match n.mode().as_str() {
        "safe" => NsMode::Safe,
        "memory" => NsMode::Memory,
        "dax" => NsMode::Dax,
        _ => NsMode::Raw,
    });
    if do_setup_pfn(ndns_mode, &parsed) {
        if region.child_seed(ChildKind::Pfn).is_none() {
            if params.mode_default {
                debug!("{region_name}: memory mode not available");
                parsed.mode = NsMode::Raw;
            } else {
                return Err(Error::InvalidArgument(format!(
                    "{region_name}: memory mode not available"
                )));
            }
        }
    }
    if parsed.mode == NsMode::Dax && region.child_seed(ChildKind::Dax).is_none() {
        return Err(Error::InvalidArgument(format!(
            "{region_name}: dax mode not available"
        )));
    }

    Ok(parsed)
}

/// Whether the namespace is in use: enabled, or claimed by a holder.
fn is_namespace_active(region: &mut Region, idx: usize) -> bool {
    let Ok(ns) = region.namespace(idx) else {
        return false;
    };
    let devname = ns.devname().to_owned();
    ns.is_enabled() || region.holder_of(&devname).is_some()
}

/// Stamps the seed namespace (and holder seed, for stacked modes) and
/// enables the result. Returns the namespace devname.
fn setup_namespace(region: &mut Region, ns_idx: usize, p: &Parsed) -> Result<String> {
    let ns = region.namespace(ns_idx)?.clone();
    let devname = ns.devname().to_owned();

    if ns.ntype() != NsType::Io {
        ns.set_uuid(&p.uuid)?;
        ns.set_alt_name(&p.name)?;
        ns.set_size(p.size)?;
    }

    if let Some(sector_size) = p.sector_size {
        let supported = ns.supported_sector_sizes();
        if supported.contains(&sector_size) {
            ns.set_sector_size(sector_size)?;
        } else if p.mode == NsMode::Safe {
            // The btt's sector size will take precedence anyway.
        } else if sector_size != 512 {
            return Err(Error::InvalidArgument(format!(
                "{devname}: sector size {sector_size} not supported"
            )));
        }
    }

    ns.set_enforce_mode(p.mode.as_attr())?;

    let holder_uuid = Guid::generate();
    let ndns_mode = Some(match ns.mode().as_str() {
        "safe" => NsMode::Safe,
        "memory" => NsMode::Memory,
        "dax" => NsMode::Dax,
        _ => NsMode::Raw,
    });

    let enable_result = if do_setup_pfn(ndns_mode, p) {
        let idx = region
            .child_seed(ChildKind::Pfn)
            .ok_or_else(|| Error::NotFound(format!("{}: no pfn seed", region.devname())))?;
        let pfn = region.child(idx)?.clone();
        pfn.set_uuid(&holder_uuid)?;
        pfn.set_location(p.loc.as_attr())?;
        if pfn.has_align() {
            pfn.set_align(p.align)?;
        }
        pfn.set_namespace(&devname)?;
        pfn.enable()
    } else if p.mode == NsMode::Dax {
        let idx = region
            .child_seed(ChildKind::Dax)
            .ok_or_else(|| Error::NotFound(format!("{}: no dax seed", region.devname())))?;
        let dax = region.child(idx)?.clone();
        dax.set_uuid(&holder_uuid)?;
        dax.set_location(p.loc.as_attr())?;
        // Device-dax always carries the align attribute.
        dax.set_align(p.align)?;
        dax.set_namespace(&devname)?;
        dax.enable()
    } else if p.mode == NsMode::Safe {
        let idx = region
            .child_seed(ChildKind::Btt)
            .ok_or_else(|| Error::NotFound(format!("{}: no btt seed", region.devname())))?;
        let btt = region.child(idx)?.clone();
        // Pre-v1.2 label support has no namespace sector-size knob; the
        // btt then defaults to 4K.
        btt.set_uuid(&holder_uuid)?;
        btt.set_sector_size(p.sector_size.unwrap_or(4096))?;
        btt.set_namespace(&devname)?;
        btt.enable()
    } else {
        ns.enable()
    };

    if let Err(err) = enable_result {
        warn!("{devname}: failed to enable: {err}");
        return Err(err);
    }
    info!("{devname}: created ({} mode)", p.mode.as_attr());
    Ok(devname)
}

/// The idle namespace to configure: the 0th if idle, else the region's
/// seed.
fn region_get_namespace(region: &mut Region) -> Result<usize> {
    let idx = region
        .namespace_seed()
        .ok_or_else(|| Error::NotFound(format!("{}: no namespace seed", region.devname())))?;
    if is_namespace_active(region, idx) {
        return Err(Error::NotFound(format!(
            "{}: no idle namespace seed",
            region.devname()
        )));
    }
    Ok(idx)
}

/// Creates a namespace in `region` per `params`.
pub fn create(bus: &mut Bus, region_idx: usize, params: &CreateParams) -> Result<String> {
    bus.regions();
    let region = &mut bus.regions[region_idx];
    let p = validate_options(region, None, params)?;

    if region.read_only() {
        debug!("{}: read-only, ineligible for namespace creation", region.devname());
        return Err(Error::Unsuitable(region.devname()));
    }

    let available = region.available_size();
    if available == 0 || p.size > available {
        debug!(
            "{}: insufficient capacity, size {:#x} avail {available:#x}",
            region.devname(),
            p.size
        );
        return Err(Error::Unsuitable(region.devname()));
    }
    let p = Parsed {
        size: if p.size == 0 { available } else { p.size },
        ..p
    };

    let ns_idx = region_get_namespace(region)?;
    setup_namespace(region, ns_idx, &p)
}

/// Clears the 4 KiB info-block slot at offset 4 KiB of the raw device,
/// so a destroyed namespace leaves no stale btt/pfn/dax metadata for a
/// future configuration to trip over.
fn zero_info_block(region: &Region, ns_idx: usize) -> Result<()> {
    let ns = region.namespace(ns_idx)?;
    let devname = ns.devname().to_owned();

    ns.set_raw_mode(true)?;
    if ns.enable().is_err() {
        debug!("{devname}: failed to enable for zeroing, continuing");
        ns.set_raw_mode(false)?;
        return Ok(());
    }

    let result = (|| -> Result<()> {
        let bdev = ns
            .block_device()
            .ok_or_else(|| Error::NotFound(format!("{devname}: no block device")))?;
        let path = region.dev_dir().join(bdev);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_EXCL)
            .open(&path)?;
        file.write_all_at(&[0u8; 4096], 4096)?;
        file.sync_data()?;
        Ok(())
    })();

    ns.set_raw_mode(false)?;
    ns.disable()?;
    result
}

/// Deletes the holders claiming `ns`, then disables it.
fn disable_invalidate(region: &mut Region, ns_idx: usize) -> Result<()> {
    let devname = region.namespace(ns_idx)?.devname().to_owned();
    let holder: Option<Child> = region.holder_of(&devname).cloned();
    if let Some(child) = holder {
        child.delete()?;
    }
    region.namespace(ns_idx)?.disable()
}

/// Disables a namespace behind an exclusive open of its block device,
/// serializing against concurrent mounts. The window between the open
/// and the unbind cannot be closed from userspace; it is accepted.
pub fn disable_safe(region: &mut Region, ns_idx: usize) -> Result<()> {
    let ns = region.namespace(ns_idx)?.clone();
    let devname = ns.devname().to_owned();

    let holder = region.holder_of(&devname).cloned();
    let bdev = match &holder {
        Some(child) if child.is_enabled() => child.block_device(),
        _ if ns.is_enabled() => ns.block_device(),
        _ => None,
    };

    match bdev {
        Some(bdev) => {
            let path = region.dev_dir().join(&bdev);
            match OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_EXCL)
                .open(&path)
            {
                Ok(_guard) => {
                    // Hold the device pinned while unbinding to block
                    // new mounts.
                    disable_invalidate(region, ns_idx)?;
                }
                Err(err) => {
                    debug!("{devname}: {bdev} failed exclusive open: {err}");
                    return Err(err.into());
                }
            }
        }
        None => disable_invalidate(region, ns_idx)?,
    }
    Ok(())
}

/// Destroys a namespace: optional forced disable, stale-metadata zeroing
/// when a holder was attached, then the zero-size delete protocol.
pub fn destroy(bus: &mut Bus, region_idx: usize, ns_idx: usize, force: bool) -> Result<()> {
    bus.regions();
    let region = &mut bus.regions[region_idx];
    let devname = region.namespace(ns_idx)?.devname().to_owned();

    if region.read_only() {
        return Err(Error::InvalidArgument(format!(
            "{devname}: region is read-only, re-configuration disabled"
        )));
    }

    let had_holder = region.holder_of(&devname).is_some();

    if is_namespace_active(region, ns_idx) && !force {
        return Err(Error::Busy(format!(
            "{devname} is active, specify force for re-configuration"
        )));
    }
    disable_safe(region, ns_idx)?;

    region.namespace(ns_idx)?.set_enforce_mode("raw")?;

    if had_holder {
        zero_info_block(region, ns_idx)?;
    }

    region.namespace(ns_idx)?.delete()?;
    info!("{devname}: destroyed");
    Ok(())
}

/// Destroys and re-creates in one shot, preserving the seed slot.
pub fn reconfig(
    bus: &mut Bus,
    region_idx: usize,
    ns_idx: usize,
    params: &CreateParams,
) -> Result<String> {
    bus.regions();
    let p = validate_options(&mut bus.regions[region_idx], Some(ns_idx), params)?;

    destroy(bus, region_idx, ns_idx, params.force)?;

    // A region that has never been labelled produces io namespaces;
    // labels turn it into a pmem-namespace region with real seeds.
    if bus.regions[region_idx].nstype() == "io" && p.autolabel {
        if let Err(err) = enable_labels(bus, region_idx) {
            debug!("autolabel failed, continuing label-less: {err}");
        }
    }

    let region = &mut bus.regions[region_idx];
    let ns_idx = region_get_namespace(region)?;
    setup_namespace(region, ns_idx, &p)
}

/// Initializes labels on every dimm backing `region`, newest label
/// version first.
///
/// The only signal that a kernel did not understand v1.2 labels is the
/// reported available-slot count disagreeing with the initialized count
/// (plus the driver's one reserved slot); on disagreement the whole
/// region is re-initialized at v1.1.
pub fn enable_labels(bus: &mut Bus, region_idx: usize) -> Result<()> {
    bus.regions();
    let mappings = bus.regions[region_idx].mappings().to_vec();
    if mappings.is_empty() {
        return Ok(());
    }

    bus.dimms();
    let mut dimm_idxs = Vec::new();
    for mapping in &mappings {
        let Some(idx) = bus
            .dimms
            .iter()
            .position(|d| d.devname() == mapping.dimm_name)
        else {
            return Ok(());
        };
        let dimm = &bus.dimms[idx];
        if !dimm.is_cmd_supported(DimmCmds::GET_CONFIG_SIZE)
            || !dimm.is_cmd_supported(DimmCmds::GET_CONFIG_DATA)
            || !dimm.is_cmd_supported(DimmCmds::SET_CONFIG_DATA)
        {
            // All dimms must support labeling or none are touched.
            return Ok(());
        }
        dimm_idxs.push(idx);
    }

    bus.regions[region_idx].disable()?;

    let mut busy = false;
    for idx in &dimm_idxs {
        let devname = bus.dimms[*idx].devname();
        if bus.dimm_is_active(&devname) {
            warn!(
                "{devname} is active in another region, failing autolabel"
            );
            busy = true;
        }
    }

    if !busy {
        let mut version = LabelVersion::V1_2;
        'retry: loop {
            for idx in &dimm_idxs {
                bus.dimm_read_labels(*idx)?;
                let nslot = bus.dimm_init_labels(*idx, version)?;

                let dimm = &bus.dimms[*idx];
                dimm.disable()?;
                dimm.enable()?;

                // One slot stays reserved in the driver for atomic
                // updates.
                let avail = dimm.available_labels()? + 1;
                if avail != nslot && version == LabelVersion::V1_2 {
                    version = LabelVersion::V1_1;
                    continue 'retry;
                }
            }
            break;
        }
    }

    let region = &mut bus.regions[region_idx];
    region.enable()?;
    if region.nstype() != "pmem" {
        debug!("{}: failed to initialize labels", region.devname());
        return Err(Error::Busy(region.devname()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_and_map_spellings() {
        assert_eq!(NsMode::parse("sector").unwrap(), NsMode::Safe);
        assert_eq!(NsMode::parse("fsdax").unwrap(), NsMode::Memory);
        assert_eq!(NsMode::parse("devdax").unwrap(), NsMode::Dax);
        assert!(NsMode::parse("other").is_err());
        assert_eq!(MapLocation::parse("mem").unwrap().as_attr(), "ram");
        assert_eq!(MapLocation::parse("dev").unwrap().as_attr(), "pmem");
        assert!(MapLocation::parse("disk").is_err());
    }

    #[test]
    fn defaults_fill_in_for_create() {
        let p = CreateParams::default().normalize(false).unwrap();
        assert_eq!(p.rtype, Some(RegionType::Pmem));
        assert_eq!(p.mode, Some(NsMode::Memory));
        assert!(p.mode_default);
        assert_eq!(p.map, Some(MapLocation::Dev));
        assert_eq!(p.align, Some(SZ_2M));
        assert!(p.align_default);
        assert_eq!(p.sector_size, None);
    }

    #[test]
    fn blk_memory_combination_is_impossible() {
        let params = CreateParams {
            rtype: Some(RegionType::Blk),
            mode: Some(NsMode::Memory),
            ..Default::default()
        };
        assert!(matches!(
            params.normalize(false),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn map_requires_memory_or_dax() {
        let params = CreateParams {
            mode: Some(NsMode::Raw),
            map: Some(MapLocation::Mem),
            ..Default::default()
        };
        assert!(matches!(
            params.normalize(false),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn safe_mode_defaults_to_4k_sectors() {
        let params = CreateParams {
            mode: Some(NsMode::Safe),
            ..Default::default()
        };
        let p = params.normalize(false).unwrap();
        assert_eq!(p.sector_size, Some(4096));
    }
}
