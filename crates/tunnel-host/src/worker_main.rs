//! Tunnel Link demo worker.
//!
//! Speaks the process transport's line protocol on stdin/stdout; logs go to
//! stderr. Normally launched by `tunnel-host` with a `process` transport.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tunnel_client::START_OPTIONS_ENV;
use tunnel_core::StartOptions;
use tunnel_host::config::HostConfig;
use tunnel_host::demo::DemoWorker;
use tunnel_sim::Delivery;

#[derive(Parser)]
#[command(name = "tunnel-worker", version, about = "Tunnel Link demo worker")]
struct Cli {
    /// Config file whose `[worker]` section configures this worker.
    #[arg(long, env = "TUNNEL_CONFIG")]
    config: Option<PathBuf>,

    /// Answer raw messages directly instead of through the router.
    #[arg(long)]
    direct: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("tunnel_host=info".parse()?)
                .add_directive("tunnel_sim=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = HostConfig::load(cli.config.as_deref())?;

    let options: StartOptions = match std::env::var(START_OPTIONS_ENV) {
        Ok(raw) => serde_json::from_str(&raw)?,
        Err(_) => StartOptions::new(),
    };
    let delivery = if cli.direct {
        Delivery::Direct
    } else {
        Delivery::Routed
    };

    tunnel_sim::stdio::serve(
        Arc::new(DemoWorker::new()),
        Some(config.worker.to_user_config()?),
        delivery,
        options,
        tokio::io::stdin(),
        tokio::io::stdout(),
    )
    .await?;
    Ok(())
}
