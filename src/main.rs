//! vnic CLI: create a TUN/TAP interface and log the frames it receives.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vnic::{Config, DeviceType};

#[derive(Parser)]
#[command(name = "vnic")]
#[command(about = "Create a TUN/TAP interface and watch its traffic")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// JSON configuration file; flags below override it
    #[arg(short, long)]
    config: Option<String>,

    /// Create a TUN device (default)
    #[arg(long)]
    tun: bool,

    /// Create a TAP device
    #[arg(long)]
    tap: bool,

    /// Interface name or template (e.g. "tun%d")
    #[arg(short, long)]
    name: Option<String>,

    /// Interface MTU
    #[arg(short, long)]
    mtu: Option<u32>,

    /// Keep the interface after exit
    #[arg(long)]
    persist: bool,

    /// Enable multi-queue mode
    #[arg(long)]
    multi_queue: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn to_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("Failed to load configuration from: {path}"))?,
            None => Config::default(),
        };

        if self.tun || self.tap {
            config.device_type = DeviceType::from_flags(self.tun, self.tap)?;
        }
        if let Some(name) = &self.name {
            config.name = Some(name.clone());
        }
        if let Some(mtu) = self.mtu {
            config.mtu = Some(mtu);
        }
        config.persist |= self.persist;
        config.multi_queue |= self.multi_queue;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Priority: RUST_LOG, then --verbose flag
    let fallback = if cli.verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).without_time())
        .try_init()
        .ok();

    let config = cli.to_config()?;
    run(config).await
}

#[cfg(target_os = "linux")]
async fn run(config: Config) -> Result<()> {
    let mtu = config.mtu.unwrap_or(vnic::DEFAULT_MTU) as usize;
    let iface = Arc::new(vnic::Interface::new(config).context("Failed to create interface")?);
    info!("Interface {} ready, press Ctrl-C to stop", iface.name());

    let reader = tokio::task::spawn_blocking({
        let iface = iface.clone();
        move || {
            let mut buf = vec![0u8; mtu + 64];
            let mut frames: u64 = 0;
            loop {
                match iface.read(&mut buf, 0) {
                    Ok(n) => {
                        frames += 1;
                        debug!(len = n, "frame {}", frames);
                    }
                    Err(e) if e.is_closed() => break,
                    Err(e) => {
                        error!("Read failed on {}: {}", iface.name(), e);
                        break;
                    }
                }
            }
            frames
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    iface.close()?;

    let frames = reader.await.context("Reader task failed")?;
    info!("Received {} frames", frames);
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn run(_config: Config) -> Result<()> {
    anyhow::bail!("TUN/TAP devices are only supported on Linux")
}
