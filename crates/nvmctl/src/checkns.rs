//! Drives the BTT metadata check over a namespace.
//!
//! The namespace is briefly forced into raw mode so the btt metadata is
//! visible through its block device, checked, and then put back exactly
//! as found. Every exit path restores the raw-mode flag and the enabled
//! state.

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;

use log::{error, info};
use nvmctl_btt::{BttCheck, CheckOpts, CheckSummary};

use crate::lifecycle;
use crate::region::Region;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct CheckNsOpts {
    pub verbose: bool,
    /// Disable an active namespace instead of refusing.
    pub force: bool,
    pub repair: bool,
}

/// Checks (and optionally repairs) the BTT arenas of `ns_idx`.
pub fn check_namespace(
    region: &mut Region,
    ns_idx: usize,
    opts: CheckNsOpts,
) -> Result<CheckSummary> {
    let ns = region.namespace(ns_idx)?.clone();
    let devname = ns.devname().to_owned();
    info!("checking {devname}");

    let mut disabled_here = false;
    if ns.is_enabled() || region.holder_of(&devname).is_some() {
        if !opts.force {
            error!("{devname}: check aborted, namespace online");
            return Err(Error::Busy(devname));
        }
        lifecycle::disable_safe(region, ns_idx)?;
        disabled_here = true;
    }

    // Typical usage has raw mode off; remember whatever it was.
    let saved_raw_mode = ns.raw_mode();

    let result = (|| -> Result<CheckSummary> {
        ns.set_raw_mode(true)?;
        ns.enable()?;

        let bdev = ns
            .block_device()
            .ok_or_else(|| Error::NotFound(format!("{devname}: no raw block device")))?;
        let path = region.dev_dir().join(&bdev);
        let mut file = OpenOptions::new()
            .read(true)
            .write(opts.repair)
            .custom_flags(libc::O_EXCL)
            .open(&path)?;

        let rawsize = ns.size();
        let parent_uuid = ns.uuid().unwrap_or_default();
        let check_opts = CheckOpts {
            verbose: opts.verbose,
            repair: opts.repair,
        };
        let summary = BttCheck::new(&mut file, rawsize, parent_uuid, check_opts).run()?;
        info!(
            "{devname}: {} arena{} ok",
            summary.arenas,
            if summary.arenas == 1 { "" } else { "s" }
        );
        Ok(summary)
    })();

    // Unwind in reverse: raw-mode flag back, device offline, and back
    // online only if this call took it down.
    let _ = ns.set_raw_mode(saved_raw_mode);
    let _ = ns.disable();
    if disabled_here && ns.enable().is_err() {
        error!("{devname}: failed to re-enable namespace");
    }

    result
}
