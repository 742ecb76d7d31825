//! CLI entry point for acq-shot
//!
//! Provides command-line access to:
//! - Building and verifying a trigger chain
//! - Single shots and looped captures across the chain
//! - Continuous streaming from one unit or a group to disk
//! - Simulated units for trying the above without hardware
//!
//! # Usage
//!
//! ```bash
//! acq-shot loop --count 5 --post 1024 acq2106_001 acq2106_002 acq2106_003
//! acq-shot chain --topology hdmi-daisy --trigger fp --clk 2000000 acq2106_001 acq2106_002
//! acq-shot stream acq2106_001 acq2106_002 --runtime 30s --out /data
//! acq-shot sim --count 3 --base-port 5220
//! ```
//!
//! Exit status is 0 only when every shot completed and every stream ended cleanly.

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use acq_shot::capture::{CaptureConfig, LoopCount, LoopSummary, ShotReport, TriggerMode};
use acq_shot::chain::{RootClock, RootTrigger, Topology};
use acq_shot::config::AppConfig;
use acq_shot::logging::{self, TracingConfig};
use acq_shot::sim::{SimCluster, SimConfig};
use acq_shot::stream::StreamSummary;
use acq_shot::uut::UutId;
use acq_shot::{LayoutRequest, LoopOptions, Orchestrator, StreamOutput};

#[derive(Parser)]
#[command(name = "acq-shot", version)]
#[command(about = "Shot-based capture and streaming for networked acquisition units", long_about = None)]
struct Cli {
    /// Configuration file (default: config/acq_shot.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More output (repeatable)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Less output (repeatable)
    #[arg(short, long, action = ArgAction::Count, global = true, conflicts_with = "verbose")]
    quiet: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum TopologyArg {
    Standalone,
    MasterSlaves,
    HdmiDaisy,
}

impl From<TopologyArg> for Topology {
    fn from(arg: TopologyArg) -> Self {
        match arg {
            TopologyArg::Standalone => Topology::Standalone,
            TopologyArg::MasterSlaves => Topology::MasterSlaves,
            TopologyArg::HdmiDaisy => Topology::HdmiDaisy,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum TriggerArg {
    /// Soft trigger command
    Soft,
    /// Front-panel trigger input
    Fp,
}

impl From<TriggerArg> for RootTrigger {
    fn from(arg: TriggerArg) -> Self {
        match arg {
            TriggerArg::Soft => RootTrigger::Soft,
            TriggerArg::Fp => RootTrigger::FrontPanel,
        }
    }
}

#[derive(Args)]
struct CaptureArgs {
    /// Pre-trigger samples (default from config)
    #[arg(long)]
    pre: Option<u64>,

    /// Post-trigger samples (default from config)
    #[arg(long)]
    post: Option<u64>,

    /// Wait for an external trigger instead of soft-triggering the root
    #[arg(long)]
    external: bool,

    /// Root clock: fp (or 0) for front panel, int, or an internal rate in Hz
    #[arg(long, default_value = "int")]
    clk: RootClock,

    /// Capture simulated data
    #[arg(long)]
    simulate: bool,

    /// Chain topology (default: standalone for one unit, hdmi-daisy otherwise)
    #[arg(long, value_enum)]
    topology: Option<TopologyArg>,

    /// Units, chain root first
    #[arg(required = true)]
    uuts: Vec<String>,
}

#[derive(Args)]
struct LayoutArgs {
    /// Channel count (probed from the unit if omitted)
    #[arg(long)]
    channels: Option<u16>,

    /// 32-bit samples, 1 or 0 (probed from the unit if omitted)
    #[arg(long, value_parser = clap::builder::BoolishValueParser::new())]
    data32: Option<bool>,

    /// Frames per stored block
    #[arg(long)]
    frames_per_block: Option<usize>,

    /// One file per channel
    #[arg(long)]
    demux: bool,

    /// Output root directory
    #[arg(long)]
    out: Option<PathBuf>,
}

impl LayoutArgs {
    fn request(&self) -> LayoutRequest {
        LayoutRequest {
            channels: self.channels,
            data32: self.data32,
            frames_per_block: self.frames_per_block,
            demux: self.demux.then_some(true),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Build and verify a trigger chain
    Chain {
        /// Chain topology
        #[arg(long, value_enum)]
        topology: TopologyArg,

        /// Root trigger source
        #[arg(long, value_enum, default_value = "soft")]
        trigger: TriggerArg,

        /// Root clock: fp (or 0) for front panel, int, or an internal rate in Hz
        #[arg(long, default_value = "int")]
        clk: RootClock,

        /// Units, chain root first
        #[arg(required = true)]
        uuts: Vec<String>,
    },

    /// Run one shot across the chain
    Shot(CaptureArgs),

    /// Run a capture loop across the chain
    Loop {
        #[command(flatten)]
        capture: CaptureArgs,

        /// Number of shots
        #[arg(long, conflicts_with = "forever")]
        count: Option<u64>,

        /// Run until interrupted
        #[arg(long)]
        forever: bool,

        /// Unit soft-triggered to fire the root's front-panel trigger; implies --external
        #[arg(long)]
        trigger_uut: Option<String>,

        /// Stop at the first shot that does not complete
        #[arg(long)]
        stop_on_error: bool,

        /// Directory holding the shot-number file
        #[arg(long)]
        shot_file: Option<PathBuf>,

        /// Stream from this unit while the loop runs
        #[arg(long)]
        stream: Option<String>,

        /// Channel count of the streamed unit
        #[arg(long)]
        channels: Option<u16>,

        /// Output root directory for the stream
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Stream continuously from one or more units to disk
    Stream {
        /// Units to stream from, one session each
        #[arg(required = true)]
        uuts: Vec<String>,

        #[command(flatten)]
        layout: LayoutArgs,

        /// Count blocks without writing them
        #[arg(long, conflicts_with = "out")]
        nowrite: bool,

        /// Stop after this many bytes
        #[arg(long)]
        max_bytes: Option<u64>,

        /// Stop after this long (e.g. "30s", "5m")
        #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
        runtime: Option<Duration>,
    },

    /// Start simulated units on local ports
    Sim {
        /// Number of units
        #[arg(long, default_value_t = 3)]
        count: usize,

        /// First port; 0 picks free ports
        #[arg(long, default_value_t = 0)]
        base_port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    }
    .context("loading configuration")?;

    let tracing = TracingConfig::from_app_config(&config).map_err(anyhow::Error::msg)?;
    let level = logging::adjust_level(tracing.level, cli.verbose, cli.quiet);
    logging::init(tracing.with_level(level)).map_err(anyhow::Error::msg)?;

    let cancel = CancellationToken::new();
    spawn_ctrl_c(cancel.clone());

    let clean = match cli.command {
        Commands::Chain {
            topology,
            trigger,
            clk,
            uuts,
        } => {
            let root = ChainRoot {
                topology: topology.into(),
                trigger: trigger.into(),
                clock: clk,
            };
            run_chain(config, cancel, root, &ids(&uuts)).await?
        }
        Commands::Shot(args) => run_shot(config, cancel, &args).await?,
        Commands::Loop {
            capture,
            count,
            forever,
            trigger_uut,
            stop_on_error,
            shot_file,
            stream,
            channels,
            out,
        } => {
            let count = if forever {
                LoopCount::Forever
            } else {
                LoopCount::Finite(count.unwrap_or(1))
            };
            let options = LoopOptions {
                trigger_uut: trigger_uut.map(UutId::new),
                shot_dir: shot_file,
                stop_on_error,
            };
            let stream = stream.map(|id| {
                (
                    UutId::new(id),
                    LayoutRequest {
                        channels,
                        ..Default::default()
                    },
                    out,
                )
            });
            run_loop(config, cancel, &capture, count, options, stream).await?
        }
        Commands::Stream {
            uuts,
            layout,
            nowrite,
            max_bytes,
            runtime,
        } => {
            let mut config = config;
            if max_bytes.is_some() {
                config.stream.max_bytes = max_bytes;
            }
            if runtime.is_some() {
                config.stream.runtime = runtime;
            }
            let output = if nowrite {
                StreamOutput::Discard
            } else {
                StreamOutput::Directory(layout.out.clone())
            };
            run_stream(config, cancel, &ids(&uuts), &layout, &output).await?
        }
        Commands::Sim { count, base_port } => run_sim(config, cancel, count, base_port).await?,
    };

    Ok(if clean {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping");
            cancel.cancel();
        }
    });
}

fn ids(names: &[String]) -> Vec<UutId> {
    names.iter().map(UutId::new).collect()
}

fn default_topology(count: usize) -> Topology {
    if count > 1 {
        Topology::HdmiDaisy
    } else {
        Topology::Standalone
    }
}

fn capture_config(config: &AppConfig, args: &CaptureArgs, remote: bool) -> Result<CaptureConfig> {
    let trigger = if args.external || remote {
        TriggerMode::External
    } else {
        TriggerMode::Soft
    };
    Ok(CaptureConfig::new(
        args.pre.unwrap_or(config.capture.pre),
        args.post.unwrap_or(config.capture.post),
        trigger,
        args.simulate,
    )?)
}

/// How the chain is laid out and how its root is driven.
#[derive(Clone, Copy)]
struct ChainRoot {
    topology: Topology,
    trigger: RootTrigger,
    clock: RootClock,
}

impl ChainRoot {
    /// `--trigger-uut` fires the root's front-panel input, so it implies `--external`.
    fn for_capture(args: &CaptureArgs, ids: &[UutId], remote: bool) -> Self {
        Self {
            topology: args
                .topology
                .map_or_else(|| default_topology(ids.len()), Topology::from),
            trigger: if args.external || remote {
                RootTrigger::FrontPanel
            } else {
                RootTrigger::Soft
            },
            clock: args.clk,
        }
    }
}

/// Build the chain over `ids`, already registered on `orch`.
async fn build(orch: &Orchestrator, root: ChainRoot, ids: &[UutId]) -> Result<()> {
    let chain = orch
        .setup_chain_with_clock(ids, root.topology, root.trigger, root.clock)
        .await?;
    for member in chain.members() {
        println!("  {:<16} {}", member.handle.id().to_string(), member.role);
    }
    Ok(())
}

/// Register `ids` and build the chain over them.
async fn open_session(
    config: AppConfig,
    cancel: CancellationToken,
    root: ChainRoot,
    ids: &[UutId],
) -> Result<Orchestrator> {
    let mut orch = Orchestrator::new(config, cancel)?;
    for id in ids {
        orch.add_uut(id)?;
    }
    build(&orch, root, ids).await?;
    Ok(orch)
}

async fn run_chain(
    config: AppConfig,
    cancel: CancellationToken,
    root: ChainRoot,
    ids: &[UutId],
) -> Result<bool> {
    println!(
        "Building {} chain over {} unit(s), clock {}",
        root.topology,
        ids.len(),
        root.clock
    );
    let orch = open_session(config, cancel, root, ids).await?;
    println!("✅ Chain verified");
    orch.shutdown().await;
    Ok(true)
}

async fn run_shot(config: AppConfig, cancel: CancellationToken, args: &CaptureArgs) -> Result<bool> {
    let capture = capture_config(&config, args, false)?;
    let ids = ids(&args.uuts);
    let root = ChainRoot::for_capture(args, &ids, false);

    let orch = open_session(config, cancel, root, &ids).await?;
    let result = orch.single_shot(&capture).await;
    orch.shutdown().await;

    let report = result?;
    println!("{report}");
    Ok(report.is_complete())
}

async fn run_loop(
    config: AppConfig,
    cancel: CancellationToken,
    args: &CaptureArgs,
    count: LoopCount,
    options: LoopOptions,
    stream: Option<(UutId, LayoutRequest, Option<PathBuf>)>,
) -> Result<bool> {
    let remote = options.trigger_uut.is_some();
    let capture = capture_config(&config, args, remote)?;
    let ids = ids(&args.uuts);
    let root = ChainRoot::for_capture(args, &ids, remote);

    let mut orch = Orchestrator::new(config, cancel.clone())?;
    if let Some(id) = &options.trigger_uut {
        orch.add_uut(id)?;
    }
    if let Some((id, _, _)) = &stream {
        orch.add_uut(id)?;
    }
    for id in &ids {
        orch.add_uut(id)?;
    }
    build(&orch, root, &ids).await?;

    let print = |report: &ShotReport| println!("{report}");
    let clean = match stream {
        None => {
            let result = orch.capture_loop(&capture, count, &options, print).await;
            loop_clean(result)
        }
        Some((id, request, out)) => {
            let result = orch
                .loop_with_stream(&capture, count, &options, &id, &request, out, print)
                .await;
            let capture_ok = loop_clean(result.capture);
            let stream_ok = stream_clean(result.stream);
            capture_ok && stream_ok
        }
    };

    orch.shutdown().await;
    Ok(clean)
}

async fn run_stream(
    config: AppConfig,
    cancel: CancellationToken,
    ids: &[UutId],
    layout: &LayoutArgs,
    output: &StreamOutput,
) -> Result<bool> {
    let mut orch = Orchestrator::new(config, cancel)?;
    for id in ids {
        orch.add_uut(id)?;
    }
    let results = orch.stream_many(ids, &layout.request(), output).await;
    orch.shutdown().await;

    let mut clean = true;
    for (_, result) in results? {
        clean &= stream_clean(result);
    }
    Ok(clean)
}

async fn run_sim(
    config: AppConfig,
    cancel: CancellationToken,
    count: usize,
    base_port: u16,
) -> Result<bool> {
    let cluster = SimCluster::start(SimConfig {
        count,
        base_port,
        vocabulary: config.firmware.clone(),
        ..Default::default()
    })
    .await
    .context("starting simulated units")?;

    println!("Simulated units (Ctrl+C to stop):");
    for unit in cluster.units() {
        println!(
            "  {:<8} control {}  data {}",
            unit.id().to_string(),
            unit.endpoint().control_addr(),
            unit.endpoint().data_addr()
        );
    }

    cancel.cancelled().await;
    cluster.shutdown();
    info!("simulated units stopped");
    Ok(true)
}

fn loop_clean(result: acq_shot::AcqResult<LoopSummary>) -> bool {
    match result {
        Ok(summary) => {
            println!(
                "{} shot(s): {} complete, {} partial, {} failed{}",
                summary.shots,
                summary.complete,
                summary.partial,
                summary.failed,
                if summary.cancelled { ", cancelled" } else { "" }
            );
            summary.all_complete()
        }
        Err(e) => {
            eprintln!("❌ Capture failed: {e}");
            false
        }
    }
}

fn stream_clean(result: acq_shot::AcqResult<StreamSummary>) -> bool {
    match result {
        Ok(summary) => {
            println!(
                "{}: {} bytes in {} block(s) over {:.1}s, ended {:?}",
                summary.uut,
                summary.bytes,
                summary.blocks,
                summary.elapsed.as_secs_f64(),
                summary.end
            );
            true
        }
        Err(e) => {
            eprintln!("❌ Stream failed: {e}");
            false
        }
    }
}
