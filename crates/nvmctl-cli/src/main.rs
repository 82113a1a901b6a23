use clap::Parser;
use nvmctl::{CheckNsOpts, CreateParams, Ctx, MapLocation, NsMode, RegionType, check_namespace};
use nvmctl_common::size::parse_size;
use nvmctl_label::LabelVersion;

#[derive(Debug, Parser)]
#[command(name = "nvmctl", about = "Manage NVDIMM namespaces, labels, and BTT metadata")]
struct Arguments {
    /// Limit to the bus with this provider name
    #[arg(long, global = true)]
    bus: Option<String>,
    /// Verbose command output
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
enum Subcommand {
    /// Summarize buses, dimms, regions, and namespaces
    List,
    /// Allocate a namespace out of region capacity
    CreateNamespace {
        #[arg(long)]
        region: Option<String>,
        #[arg(long, value_parser = NsMode::parse)]
        mode: Option<NsMode>,
        #[arg(long, value_parser = MapLocation::parse)]
        map: Option<MapLocation>,
        #[arg(long)]
        size: Option<String>,
        #[arg(long)]
        align: Option<String>,
        #[arg(long)]
        sector_size: Option<u64>,
        #[arg(long)]
        uuid: Option<String>,
        #[arg(long)]
        name: Option<String>,
        /// Do not initialize labels on unlabelled regions
        #[arg(long)]
        no_autolabel: bool,
    },
    /// Reclaim a namespace's capacity
    DestroyNamespace {
        namespace: String,
        #[arg(short, long)]
        force: bool,
    },
    /// Verify (and optionally repair) a namespace's BTT metadata
    CheckNamespace {
        namespace: String,
        #[arg(short, long)]
        force: bool,
        #[arg(short, long)]
        repair: bool,
    },
    EnableNamespace {
        namespace: String,
    },
    DisableNamespace {
        namespace: String,
    },
    /// Write a fresh label index onto idle dimms
    InitLabels {
        dimm: String,
        #[arg(long, default_value = "1.2")]
        version: String,
    },
    /// Clear the entire label area of idle dimms
    ZeroLabels {
        dimm: String,
    },
    /// Validate the label index and enumerate labels
    CheckLabels {
        dimm: String,
    },
    /// Block until a running address-range scrub completes
    WaitScrub,
}

fn find_region(ctx: &mut Ctx, provider: Option<&str>, name: &str) -> anyhow::Result<(usize, usize)> {
    for (bi, bus) in ctx.buses().iter_mut().enumerate() {
        if provider.is_some_and(|p| p != bus.provider()) {
            continue;
        }
        for (ri, region) in bus.regions().iter().enumerate() {
            if region.devname() == name {
                return Ok((bi, ri));
            }
        }
    }
    anyhow::bail!("no such region: {name}")
}

fn find_namespace(
    ctx: &mut Ctx,
    provider: Option<&str>,
    name: &str,
) -> anyhow::Result<(usize, usize, usize)> {
    for (bi, bus) in ctx.buses().iter_mut().enumerate() {
        if provider.is_some_and(|p| p != bus.provider()) {
            continue;
        }
        for (ri, region) in bus.regions().iter_mut().enumerate() {
            for (ni, ns) in region.namespaces().iter().enumerate() {
                if ns.devname() == name {
                    return Ok((bi, ri, ni));
                }
            }
        }
    }
    anyhow::bail!("no such namespace: {name}")
}

fn find_dimm(ctx: &mut Ctx, provider: Option<&str>, name: &str) -> anyhow::Result<(usize, usize)> {
    for (bi, bus) in ctx.buses().iter_mut().enumerate() {
        if provider.is_some_and(|p| p != bus.provider()) {
            continue;
        }
        for (di, dimm) in bus.dimms().iter().enumerate() {
            if dimm.devname() == name {
                return Ok((bi, di));
            }
        }
    }
    anyhow::bail!("no such dimm: {name}")
}

fn run(args: Arguments) -> anyhow::Result<i32> {
    let mut ctx = Ctx::new();
    let provider = args.bus.as_deref();

    match args.subcommand {
        Subcommand::List => {
            for bus in ctx.buses() {
                println!("{} provider={}", bus.devname(), bus.provider());
                for dimm in bus.dimms() {
                    println!(
                        "  {} handle={:#x} phys_id={:#x}",
                        dimm.devname(),
                        dimm.handle(),
                        dimm.phys_id()
                    );
                }
                for region in bus.regions() {
                    println!(
                        "  {} type={} size={} available={}",
                        region.devname(),
                        match region.rtype() {
                            RegionType::Pmem => "pmem",
                            RegionType::Blk => "blk",
                        },
                        region.size(),
                        region.available_size()
                    );
                    for ns in region.namespaces() {
                        println!(
                            "    {} mode={} size={} enabled={}",
                            ns.devname(),
                            ns.mode(),
                            ns.size(),
                            ns.is_enabled()
                        );
                    }
                }
            }
            Ok(0)
        }
        Subcommand::CreateNamespace {
            region,
            mode,
            map,
            size,
            align,
            sector_size,
            uuid,
            name,
            no_autolabel,
        } => {
            let (size, size_units) = match size.as_deref() {
                Some(text) => {
                    let (bytes, units) =
                        parse_size(text).ok_or_else(|| anyhow::anyhow!("bad size {text:?}"))?;
                    (Some(bytes), units)
                }
                None => (None, 1),
            };
            let align = match align.as_deref() {
                Some(text) => Some(
                    parse_size(text)
                        .ok_or_else(|| anyhow::anyhow!("bad align {text:?}"))?
                        .0,
                ),
                None => None,
            };
            let uuid = match uuid.as_deref() {
                Some(text) => Some(
                    nvmctl_common::Guid::parse(text)
                        .map_err(|_| anyhow::anyhow!("bad uuid {text:?}"))?,
                ),
                None => None,
            };
            let params = CreateParams {
                mode,
                map,
                size,
                size_units,
                align,
                align_default: align.is_none(),
                sector_size,
                uuid,
                name,
                autolabel: !no_autolabel,
                ..Default::default()
            }
            .normalize(false)?;

            // Try the named region, or walk every region until one
            // accepts the request.
            let created = match region.as_deref() {
                Some(name) => {
                    let (bi, ri) = find_region(&mut ctx, provider, name)?;
                    nvmctl::lifecycle::create(&mut ctx.buses()[bi], ri, &params)?
                }
                None => {
                    let mut created = None;
                    'outer: for bus in ctx.buses() {
                        if provider.is_some_and(|p| p != bus.provider()) {
                            continue;
                        }
                        let count = bus.regions().len();
                        for ri in 0..count {
                            match nvmctl::lifecycle::create(bus, ri, &params) {
                                Ok(devname) => {
                                    created = Some(devname);
                                    break 'outer;
                                }
                                Err(nvmctl::Error::Unsuitable(_)) => continue,
                                Err(err) => return Err(err.into()),
                            }
                        }
                    }
                    created.ok_or_else(|| anyhow::anyhow!("no region suits this request"))?
                }
            };
            println!("{created}");
            Ok(0)
        }
        Subcommand::DestroyNamespace { namespace, force } => {
            let (bi, ri, ni) = find_namespace(&mut ctx, provider, &namespace)?;
            nvmctl::lifecycle::destroy(&mut ctx.buses()[bi], ri, ni, force)?;
            println!("destroyed {namespace}");
            Ok(1)
        }
        Subcommand::CheckNamespace {
            namespace,
            force,
            repair,
        } => {
            let (bi, ri, ni) = find_namespace(&mut ctx, provider, &namespace)?;
            let region = &mut ctx.buses()[bi].regions()[ri];
            let opts = CheckNsOpts {
                verbose: args.verbose,
                force,
                repair,
            };
            let summary = check_namespace(region, ni, opts)?;
            println!(
                "{namespace}: {} arena(s) ok, {} repair(s), {} advisory",
                summary.arenas, summary.repairs, summary.advisories
            );
            Ok(1)
        }
        Subcommand::EnableNamespace { namespace } => {
            let (bi, ri, ni) = find_namespace(&mut ctx, provider, &namespace)?;
            let region = &mut ctx.buses()[bi].regions()[ri];
            region.namespace(ni)?.enable()?;
            Ok(1)
        }
        Subcommand::DisableNamespace { namespace } => {
            let (bi, ri, ni) = find_namespace(&mut ctx, provider, &namespace)?;
            let region = &mut ctx.buses()[bi].regions()[ri];
            nvmctl::lifecycle::disable_safe(region, ni)?;
            Ok(1)
        }
        Subcommand::InitLabels { dimm, version } => {
            let version = match version.as_str() {
                "1.1" | "v1.1" => LabelVersion::V1_1,
                "1.2" | "v1.2" => LabelVersion::V1_2,
                other => anyhow::bail!("unknown label version {other:?}"),
            };
            let (bi, di) = find_dimm(&mut ctx, provider, &dimm)?;
            let bus = &mut ctx.buses()[bi];
            if bus.dimm_is_active(&dimm) {
                anyhow::bail!("{dimm}: active regions, refusing to initialize labels");
            }
            bus.dimm_read_labels(di)?;
            let nslot = bus.dimm_init_labels(di, version)?;
            println!("{dimm}: initialized {nslot} label slots");
            Ok(1)
        }
        Subcommand::ZeroLabels { dimm } => {
            let (bi, di) = find_dimm(&mut ctx, provider, &dimm)?;
            ctx.buses()[bi].dimm_zero_labels(di)?;
            println!("{dimm}: zeroed label area");
            Ok(1)
        }
        Subcommand::CheckLabels { dimm } => {
            let (bi, di) = find_dimm(&mut ctx, provider, &dimm)?;
            let bus = &mut ctx.buses()[bi];
            bus.dimm_read_labels(di)?;
            let v = bus.dimm_validate_labels(di)?;
            println!(
                "{dimm}: index {} current, {} byte labels, {} slots",
                v.current, v.label_size, v.nslot
            );
            for label in bus.dimm_labels(di)? {
                println!(
                    "  slot {}: {} {:?} position {} dpa {:#x} rawsize {:#x}",
                    label.slot, label.uuid, label.name, label.position, label.dpa, label.rawsize
                );
            }
            Ok(0)
        }
        Subcommand::WaitScrub => {
            let bus = match provider {
                Some(p) => ctx.bus_by_provider(p)?,
                None => ctx
                    .bus_first()
                    .ok_or_else(|| anyhow::anyhow!("no buses found"))?,
            };
            bus.wait_for_scrub_completion()?;
            println!("{}: scrub complete, count {}", bus.devname(), bus.scrub_count()?);
            Ok(0)
        }
    }
}

fn main() {
    let args = Arguments::parse();
    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            tracing_subscriber::filter::LevelFilter::DEBUG
        } else {
            tracing_subscriber::filter::LevelFilter::WARN
        })
        .init();

    match run(args) {
        Ok(count) => std::process::exit(count),
        Err(err) => {
            eprintln!("error: {err}");
            let code = err
                .downcast_ref::<nvmctl::Error>()
                .map(|e| e.exit_code())
                .unwrap_or(-1);
            std::process::exit(code);
        }
    }
}
