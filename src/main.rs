//! filter-chain - Main Entry Point
//!
//! Builds the chain from the built-in stages, validates it against the
//! configured block geometry and runs a fixed number of blocks on the block
//! runner thread.

use anyhow::{bail, Context};
use clap::Parser;
use filter_chain::{
    config::EngineConfig,
    pipeline::{
        BlockRunner, Chain, ChannelVisualizationSink, Diagnostic, Environment,
        NullVisualizationSink, ParamValue, RunnerMessage, Severity, SignalShape,
        VisMessage, VisualizationSink,
    },
    stages::register_builtin_stages,
    Registry,
};
use std::path::PathBuf;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Blocks processed when neither the config nor `--blocks` limit the run.
const DEFAULT_BLOCKS: u64 = 100;

#[derive(Parser, Debug)]
#[command(name = "filter-chain")]
#[command(version, about = "Run a block-synchronous filter chain", long_about = None)]
struct Cli {
    /// Engine configuration file (.json or .toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of blocks to process
    #[arg(short = 'n', long)]
    blocks: Option<u64>,

    /// Override a parameter, e.g. `--set Gain=2.5` (repeatable)
    #[arg(short, long = "set", value_name = "NAME=VALUE")]
    set: Vec<String>,

    /// Record per-stage execution times and print a report
    #[arg(long)]
    profile: bool,

    /// Process blocks as fast as possible instead of at the sampling rate
    #[arg(long)]
    no_realtime: bool,

    /// Enable the visualization tap of every stage
    #[arg(long)]
    visualize: bool,

    /// Write the effective configuration to this file and exit
    #[arg(long, value_name = "PATH")]
    save_config: Option<PathBuf>,

    /// Also write logs to daily rotated files in this directory
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Verbose output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8, log_dir: Option<&PathBuf>) -> anyhow::Result<Option<WorkerGuard>> {
    let default_filter = match verbose {
        0 => "info,filter_chain=debug",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("filter-chain")
                .filename_suffix("log")
                .build(dir)
                .context("Failed to create log file appender")?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    Ok(guard)
}

/// Parse `NAME=VALUE`; the value is an int, a float, or else a string.
fn parse_assignment(raw: &str) -> anyhow::Result<(String, ParamValue)> {
    let Some((name, value)) = raw.split_once('=') else {
        bail!("expected NAME=VALUE, got {:?}", raw);
    };
    let name = name.trim();
    if name.is_empty() {
        bail!("empty parameter name in {:?}", raw);
    }
    let value = value.trim();
    let value = if let Ok(v) = value.parse::<i64>() {
        ParamValue::Int(v)
    } else if let Ok(v) = value.parse::<f64>() {
        ParamValue::Float(v)
    } else {
        ParamValue::from(value)
    };
    Ok((name.to_string(), value))
}

/// Count tap messages until the sink is dropped.
fn spawn_vis_consumer(
    rx: crossbeam_channel::Receiver<VisMessage>,
) -> std::io::Result<JoinHandle<u64>> {
    std::thread::Builder::new()
        .name("vis-consumer".into())
        .spawn(move || {
            let mut blocks = 0u64;
            for message in rx {
                if let VisMessage::Signal { .. } = message {
                    blocks += 1;
                }
            }
            blocks
        })
}

fn report(diagnostic: &Diagnostic, errors: &mut usize, warnings: &mut usize) {
    match diagnostic.severity {
        Severity::Error => *errors += 1,
        Severity::Warning => *warnings += 1,
        Severity::Info => {}
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.verbose, cli.log_dir.as_ref())?;

    tracing::info!("Starting filter-chain v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    for raw in &cli.set {
        let (name, value) = parse_assignment(raw)?;
        config.set_parameter(name, value);
    }
    if let Some(blocks) = cli.blocks {
        config.runner.max_blocks = blocks;
    }
    if config.runner.max_blocks == 0 {
        config.runner.max_blocks = DEFAULT_BLOCKS;
    }
    if cli.no_realtime {
        config.runner.realtime = false;
    }
    if cli.profile {
        config.timing.profiling = true;
    }
    config.validate()?;

    if let Some(path) = &cli.save_config {
        config.save(path)?;
        tracing::info!("Configuration written to {}", path.display());
        return Ok(());
    }

    {
        let mut registry = Registry::lock_global()?;
        register_builtin_stages(&mut registry);
    }

    let (vis, vis_consumer) = if cli.visualize {
        let (sink, rx) = ChannelVisualizationSink::bounded(config.visualization.channel_capacity);
        (
            Box::new(sink) as Box<dyn VisualizationSink>,
            Some(spawn_vis_consumer(rx)?),
        )
    } else {
        (Box::new(NullVisualizationSink) as Box<dyn VisualizationSink>, None)
    };

    let mut env = Environment::from_config(&config);
    let mut chain = {
        let registry = Registry::lock_global()?;
        Chain::instantiate(&registry, vis)?
    };
    println!("Chain: {}", chain.info());

    chain.declare(&mut env)?;
    if cli.visualize {
        for name in chain.info().names() {
            env.set_parameter(format!("Visualize{}", name), 1i64);
        }
    }

    let input = SignalShape::new(config.block.input_channels, config.block.sample_block_size);
    let output = match chain.validate(&input, &mut env) {
        Ok(shape) => shape,
        Err(e) => {
            for diagnostic in env.diagnostics.errors() {
                eprintln!("{}", diagnostic);
            }
            return Err(e.into());
        }
    };
    for (i, shape) in chain.stage_shapes().iter().enumerate() {
        tracing::debug!("stage {} output: {}", i, shape);
    }
    println!("Output signal: {} at {} Hz", output, config.block.sampling_rate);

    chain.allocate(&mut env)?;
    chain.set_profiling(config.timing.profiling);

    let (bridge, handle) = BlockRunner::spawn(chain, env, &config.runner)?;
    bridge.start();

    let mut errors = 0;
    let mut warnings = 0;
    let mut fault = None;
    let mut shutdown_seen = false;
    loop {
        match bridge.recv_timeout(Duration::from_secs(1)) {
            Some(RunnerMessage::Diagnostic(d)) => report(&d, &mut errors, &mut warnings),
            Some(RunnerMessage::Faulted(message)) => fault = Some(message),
            Some(RunnerMessage::RunStopped { blocks }) => {
                println!("Processed {} blocks", blocks);
                break;
            }
            Some(RunnerMessage::Shutdown) => {
                shutdown_seen = true;
                break;
            }
            Some(RunnerMessage::BlockProcessed { .. }) => {}
            None if handle.is_finished() => break,
            None => {}
        }
    }

    // Drain until the runner confirms shutdown.
    bridge.shutdown();
    while !shutdown_seen && !handle.is_finished() {
        match bridge.recv_timeout(Duration::from_millis(100)) {
            Some(RunnerMessage::Diagnostic(d)) => report(&d, &mut errors, &mut warnings),
            Some(RunnerMessage::Faulted(message)) => fault = Some(message),
            Some(RunnerMessage::Shutdown) => shutdown_seen = true,
            _ => {}
        }
    }
    for message in bridge.drain() {
        match message {
            RunnerMessage::Diagnostic(d) => report(&d, &mut errors, &mut warnings),
            RunnerMessage::Faulted(message) => fault = Some(message),
            _ => {}
        }
    }

    let (mut chain, mut env) = handle
        .join()
        .map_err(|_| anyhow::anyhow!("block runner thread panicked"))?;

    if config.timing.profiling {
        println!("{:<24} {:>8} {:>12} {:>12} {:>12} {:>8}", "Stage", "Calls", "Mean", "Min", "Max", "Load");
        for entry in chain.performance() {
            let data = entry.data;
            println!(
                "{:<24} {:>8} {:>12.3?} {:>12.3?} {:>12.3?} {:>7.2}%",
                format!("{} {}", entry.position, entry.name),
                data.count,
                data.mean(),
                data.min_or_zero(),
                data.max,
                data.load() * 100.0
            );
        }
    }

    chain.release(&mut env)?;
    drop(chain);
    if let Some(consumer) = vis_consumer {
        let snapshots = consumer
            .join()
            .map_err(|_| anyhow::anyhow!("visualization consumer panicked"))?;
        println!("Visualization snapshots: {}", snapshots);
    }

    println!("Diagnostics: {} error(s), {} warning(s)", errors, warnings);
    if let Some(message) = fault {
        bail!("chain faulted: {}", message);
    }
    Ok(())
}
