//! CLI entry point for trigger-dump.
//!
//! Attaches to the input ring (created by the upstream producer), creates
//! the output ring, and runs one observation: drain the stream, serve UDP
//! triggers, exit successfully on stream exhaustion.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::IpAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;
use trigger_dump::app::Observation;
use trigger_dump::config::Settings;
use trigger_dump::transport::shm::ShmBlockRing;
use trigger_dump::{affinity, error::TriggerError};

#[derive(Parser)]
#[command(name = "trigger-dump")]
#[command(about = "Capture blocks from a streaming ring on external trigger", long_about = None)]
struct Cli {
    /// Optional TOML configuration file
    #[arg(long)]
    config: Option<String>,

    /// Address to listen on for control commands
    #[arg(short = 'i', long)]
    listen: Option<IpAddr>,

    /// CPU core to bind the process to
    #[arg(short = 'c', long)]
    core: Option<usize>,

    /// Block size in bytes
    #[arg(short = 'b', long)]
    block_size: Option<u64>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(addr) = cli.listen {
        settings.control.listen_address = addr;
    }
    if let Some(size) = cli.block_size {
        settings.capture.block_size = size;
    }
    if let Some(core) = cli.core {
        settings.application.core = Some(core);
    }
    settings.validate()?;

    init_tracing(&settings.application.log_level);

    // Pin before the runtime spawns its worker threads.
    if let Some(core) = settings.application.core {
        affinity::bind_to_core(core)?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    runtime.block_on(run(settings))
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(settings: Settings) -> Result<()> {
    info!(
        input = %settings.transport.input_path.display(),
        output = %settings.transport.output_path.display(),
        control = %settings.listen_addr(),
        "trigger-dump starting"
    );

    let source = ShmBlockRing::open(&settings.transport.input_path)
        .context("failed to attach to input ring")?;
    if source.block_size() != settings.capture.block_size {
        return Err(TriggerError::Configuration(format!(
            "input ring block size {} does not match configured {}",
            source.block_size(),
            settings.capture.block_size
        ))
        .into());
    }

    let sink = ShmBlockRing::create(
        &settings.transport.output_path,
        settings.capture.block_size,
        settings.transport.output_blocks,
    )
    .context("failed to create output ring")?;

    let observation = Observation::prepare(&settings, source, sink).await?;
    let outcome = observation.run().await?;

    info!(
        blocks = outcome.blocks_drained,
        final_position = outcome.final_position,
        triggers = outcome.triggers,
        dumps = outcome.dumps,
        "observation complete"
    );
    Ok(())
}
