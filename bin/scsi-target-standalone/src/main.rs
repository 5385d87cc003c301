// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::Rng;
use slog::{debug, info, o, warn, Drain, Logger};

use scsi_target::backend::{Backend, InMemoryBackend, NoopBackend};
use scsi_target::cmd::{Cdb, ScsiIo, TagType};
use scsi_target::common::{
    LunId, Nexus, PortId, MAX_INIT_PER_PORT, MAX_PORTS,
};
use scsi_target::frontend::LoopbackPort;
use scsi_target::ha::{HaMode, LoopbackLink};
use scsi_target::lun::{LunOpts, SyncPolicy};
use scsi_target::pool::PoolOpts;
use scsi_target::sense::key;
use scsi_target::usdt::register_probes;
use scsi_target::{CmdPool, Controller, ControllerOpts, PoolError};
use scsi_target_config as config;

const DEFAULT_BACKEND_WORKERS: usize = 2;

/// Ports of the in-process partner are numbered from here, so that the
/// initiators behind them stay distinct from ours on the primary.
const PARTNER_PORT_BASE: PortId = (MAX_PORTS / 2) as PortId;

/// Port id under which a configured port is registered.
fn port_id(configured: PortId, partner: bool) -> Result<PortId> {
    if !partner {
        return Ok(configured);
    }
    if configured >= PARTNER_PORT_BASE {
        bail!(
            "port id {configured} collides with partner ports; \
            --pair needs ids below {PARTNER_PORT_BASE}"
        );
    }
    Ok(configured + PARTNER_PORT_BASE)
}

#[derive(clap::Parser)]
/// Run a SCSI target controller against a synthetic initiator workload.
struct Args {
    /// Controller config file
    #[clap(value_name = "CONFIG", action)]
    config: String,

    /// Run a second controller in-process, joined over an HA link
    #[clap(short, long, action)]
    pair: bool,

    /// Commands kept in flight per LUN
    #[clap(long, default_value_t = 8)]
    io_depth: usize,

    /// Blocks per READ/WRITE
    #[clap(long, default_value_t = 8)]
    io_blocks: u16,

    /// Stop after this many seconds, rather than waiting for Ctrl-C
    #[clap(long)]
    duration: Option<u64>,

    #[clap(
        long,
        default_value = "info",
        value_parser = parse_level,
        env = "SCSI_TARGET_LOG"
    )]
    log_level: slog::Level,
}

fn parse_level(s: &str) -> Result<slog::Level, String> {
    slog::Level::from_str(s).map_err(|_| format!("invalid log level {s:?}"))
}

fn build_log(level: slog::Level) -> Logger {
    let main_drain = if atty::is(atty::Stream::Stdout) {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::CompactFormat::new(decorator).build().fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    } else {
        let drain =
            slog_bunyan::with_name("scsi-target-standalone", std::io::stdout())
                .build()
                .fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    };

    let filtered_main = slog::LevelFilter::new(main_drain, level);
    Logger::root(filtered_main.fuse(), o!())
}

/// One controller built from the config, with the pieces the workload needs
struct Target {
    ctl: Controller,
    pool: Arc<CmdPool>,
    port: PortId,
}

fn lun_backend(
    name: &str,
    lun: &config::Lun,
) -> Result<Arc<dyn Backend>> {
    let block_size = lun.block_size.unwrap_or(512);
    Ok(match lun.lun_type {
        config::LunType::Mem => {
            let workers = lun.workers.unwrap_or(
                NonZeroUsize::new(DEFAULT_BACKEND_WORKERS).unwrap(),
            );
            InMemoryBackend::create(
                vec![0u8; lun.size as usize],
                block_size,
                lun.read_only,
                workers,
            )
            .with_context(|| format!("creating backend for lun {name:?}"))?
        }
        config::LunType::Noop => {
            NoopBackend::with_block_size(lun.size, block_size)
        }
    })
}

fn build_target(
    log: &Logger,
    config: &config::Config,
    partner: bool,
) -> Result<Target> {
    let (ha_mode, ha_id, segment) = match &config.ha {
        Some(ha) => (
            match ha.mode {
                config::HaMode::SerializeOnly => HaMode::SerializeOnly,
                config::HaMode::FullTransfer => HaMode::FullTransfer,
            },
            ha.id,
            ha.segment_size,
        ),
        None => (HaMode::default(), 0, None),
    };
    let mut opts = ControllerOpts {
        name: config.main.name.clone(),
        workers: config.main.workers,
        ha_id,
        ha_mode,
        ..Default::default()
    };
    if let Some(segment) = segment {
        opts.xfer_segment = segment;
    }
    if partner {
        opts.name = format!("{}-partner", opts.name);
        opts.ha_id += 1;
    }
    let log = log.new(o!("controller" => opts.name.clone()));
    let ctl = Controller::new(&log, opts).context("starting controller")?;

    let emergency = match config.main.emergency_pool {
        Some(cap) => {
            Some(ctl.create_pool("emergency", cap, PoolOpts::default())?)
        }
        None => None,
    };
    let pool = ctl.create_pool(
        "main",
        config.main.pool_capacity,
        PoolOpts { emergency, heap_fallback: config.main.heap_fallback },
    )?;

    for (name, lun) in config.luns.iter() {
        let backend = lun_backend(name, lun)?;
        let opts = LunOpts {
            // The partner prefers whatever this controller does not
            primary: lun.primary != partner,
            sync_policy: match lun.sync_cache {
                config::SyncCache::Always => SyncPolicy::Always,
                config::SyncCache::Never => SyncPolicy::Never,
            },
            ..Default::default()
        };
        ctl.add_lun(lun.id, backend, &opts)?;
        ctl.enable_lun(lun.id)?;
    }

    let mut first_port = None;
    for (name, port) in config.ports.iter() {
        let id = port_id(port.id, partner)?;
        ctl.add_port(id, name, Arc::new(LoopbackPort::new()))?;
        if port.enabled {
            ctl.enable_port(id)?;
            first_port.get_or_insert(id);
        }
    }
    let Some(port) = first_port else {
        bail!("config must enable at least one port");
    };

    Ok(Target { ctl, pool, port })
}

struct Timer {
    log: Logger,
    count: usize,
    errors: usize,
    time: Instant,
}

impl Timer {
    fn tick(&mut self, ok: bool) {
        self.count += 1;
        if !ok {
            self.errors += 1;
        }

        let now = Instant::now();

        if (now - self.time) >= Duration::from_secs(5) {
            info!(self.log, "{} requests/second", self.count / 5;
                "errors" => self.errors);
            self.count = 0;
            self.errors = 0;
            self.time = now;
        }
    }
}

/// Random READ/WRITE traffic against one LUN, from one initiator
struct RandSpew {
    log: Logger,
    target: Arc<Target>,
    lun: LunId,
    initiator: u32,
    io_blocks: u16,
    timer: Arc<Mutex<Timer>>,
}

impl RandSpew {
    fn run(&self, stop: &AtomicBool) {
        let Some(lun) = self.target.ctl.lun(self.lun) else {
            return;
        };
        let info = lun.info();
        let span = info.num_blocks.saturating_sub(u64::from(self.io_blocks));
        let len = usize::from(self.io_blocks) * info.block_size as usize;
        let nexus = Nexus::new(self.target.port, self.initiator, 0, self.lun);
        let mut rng = rand::thread_rng();
        let mut tag = 0;

        while !stop.load(Ordering::Relaxed) {
            let mut cmd = match self.target.pool.acquire() {
                Ok(cmd) => cmd,
                Err(PoolError::Busy) => {
                    std::thread::sleep(Duration::from_micros(100));
                    continue;
                }
                Err(e) => {
                    warn!(self.log, "pool unusable"; "error" => %e);
                    return;
                }
            };
            let lba = rng.gen_range(0..=span);
            let blocks = u32::from(self.io_blocks);
            tag += 1;
            let io = if rng.gen_bool(0.5) && !info.read_only {
                let mut data = vec![0u8; len];
                rng.fill(&mut data[..]);
                ScsiIo::new(Cdb::write16(lba, blocks), tag, TagType::Simple)
                    .with_data(data)
            } else {
                ScsiIo::new(Cdb::read16(lba, blocks), tag, TagType::Simple)
                    .with_xfer_len(len)
            };
            cmd.setup_scsi(nexus, io);

            let done = match self.target.ctl.submit_wait(cmd) {
                Ok(done) => done,
                Err(e) => {
                    debug!(self.log, "submission refused"; "error" => %e);
                    return;
                }
            };
            let ok = done.status.is_good();
            if !ok {
                // Unit attentions are expected after startup and failover
                let ua = done.status.sense().map(|s| s.key)
                    == Some(key::UNIT_ATTENTION);
                if !ua {
                    warn!(self.log, "command failed";
                        "status" => ?done.status);
                }
            }
            self.timer.lock().unwrap().tick(ok);
        }
    }
}

fn spawn_workload(
    log: &Logger,
    target: &Arc<Target>,
    config: &config::Config,
    args: &Args,
    stop: &Arc<AtomicBool>,
) -> Result<Vec<std::thread::JoinHandle<()>>> {
    let mut jobs = Vec::new();
    for (name, lun) in config.luns.iter() {
        let log = log.new(o!("lun" => name.clone()));
        let timer = Arc::new(Mutex::new(Timer {
            log: log.clone(),
            count: 0,
            errors: 0,
            time: Instant::now(),
        }));
        for n in 0..args.io_depth {
            let spew = RandSpew {
                log: log.new(o!("spew" => n)),
                target: target.clone(),
                lun: lun.id,
                initiator: n as u32,
                io_blocks: args.io_blocks,
                timer: timer.clone(),
            };
            let stop = stop.clone();
            let job = std::thread::Builder::new()
                .name(format!("spew {name} {n}"))
                .spawn(move || spew.run(&stop))?;
            jobs.push(job);
        }
        info!(log, "started workload"; "depth" => args.io_depth);
    }
    Ok(jobs)
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Ensure proper setup of USDT probes
    register_probes().context("Failed to setup USDT probes")?;

    let log = build_log(args.log_level);

    let config = config::parse(&args.config)
        .with_context(|| format!("reading config {}", args.config))?;
    if args.io_depth == 0 || args.io_depth > MAX_INIT_PER_PORT {
        bail!("--io-depth must be between 1 and {MAX_INIT_PER_PORT}");
    }
    if args.pair && config.ha.is_none() {
        bail!("--pair requires an [ha] section in the config");
    }

    let mut targets = vec![Arc::new(build_target(&log, &config, false)?)];
    if args.pair {
        let partner = Arc::new(build_target(&log, &config, true)?);
        let (link_a, link_b) = LoopbackLink::pair();
        targets[0].ctl.ha_attach(link_a.clone());
        partner.ctl.ha_attach(link_b.clone());
        link_a.attach(targets[0].ctl.ha_receiver())?;
        link_b.attach(partner.ctl.ha_receiver())?;
        targets[0].ctl.ha_link_up()?;
        partner.ctl.ha_link_up()?;
        info!(log, "HA pair established");
        targets.push(partner);
    }

    let stop = Arc::new(AtomicBool::new(false));
    let signal_log = log.clone();
    let signal_stop = stop.clone();
    ctrlc::set_handler(move || {
        if !signal_stop.swap(true, Ordering::Relaxed) {
            info!(signal_log, "Stopping workload...");
        }
    })
    .context("Failed to register Ctrl-C signal handler.")?;

    let mut jobs = Vec::new();
    for (n, target) in targets.iter().enumerate() {
        let log = log.new(o!("target" => n));
        jobs.extend(spawn_workload(&log, target, &config, &args, &stop)?);
    }

    match args.duration {
        Some(secs) => {
            let deadline = Instant::now() + Duration::from_secs(secs);
            while Instant::now() < deadline && !stop.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(100));
            }
            stop.store(true, Ordering::Relaxed);
        }
        None => {
            while !stop.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }

    for job in jobs {
        let _ = job.join();
    }
    for target in targets.iter() {
        target.ctl.shutdown();
    }
    info!(log, "all controllers halted");
    Ok(())
}
