//! Tunnel Link host CLI.
//!
//! Starts a worker (simulated in-process, or a child process) and talks to it:
//!   tunnel-host ping --count 3
//!   tunnel-host echo "hello"
//!   tunnel-host poll --count 5
//!   tunnel-host --config host.toml status

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use tunnel_client::CommunicationMonitor;
use tunnel_core::protocol::{Echo, Ping, Pong, ServiceInfo};
use tunnel_core::{Observer, StartOptions, StatusLog, Transport};
use tunnel_host::LogObserver;
use tunnel_host::config::HostConfig;

#[derive(Parser)]
#[command(name = "tunnel-host", version, about = "Talk to a Tunnel Link worker")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, env = "TUNNEL_CONFIG")]
    config: Option<PathBuf>,

    /// Start option passed to the worker, as KEY=JSON (repeatable).
    #[arg(long = "option", value_name = "KEY=JSON")]
    options: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send pings and print the round trips.
    Ping {
        #[arg(long, default_value_t = 1)]
        count: u64,
    },
    /// Send text and print what comes back.
    Echo { text: String },
    /// Poll the worker's service state.
    Poll {
        /// Stop after this many answers (default: run until interrupted).
        #[arg(long)]
        count: Option<u64>,
        /// Override the configured poll interval.
        #[arg(long)]
        interval_ms: Option<u64>,
    },
    /// Start and stop the worker, printing every status transition.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("tunnel_host=info".parse()?)
                .add_directive("tunnel_client=info".parse()?)
                .add_directive("tunnel_sim=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = HostConfig::load(cli.config.as_deref())?;
    let options = parse_options(&cli.options)?;

    let transport = tunnel_host::build_transport(&config)?;
    transport.subscribe(Arc::new(LogObserver));
    let transitions = StatusLog::new();
    transport.subscribe(transitions.clone());

    let monitor = CommunicationMonitor::new(config.monitor.monitor_config());

    transport
        .start(options)
        .await
        .context("worker failed to start")?;
    monitor.bind(transport.clone());

    let result = run(&cli.command, &config, &monitor, transport.clone()).await;

    monitor.stop_monitoring();
    transport.stop().await;

    if matches!(cli.command, Command::Status) {
        for status in transitions.snapshot() {
            println!("{status}");
        }
    }
    result
}

async fn run(
    command: &Command,
    config: &HostConfig,
    monitor: &CommunicationMonitor,
    transport: Arc<dyn Transport>,
) -> anyhow::Result<()> {
    match command {
        Command::Ping { count } => {
            for nonce in 0..*count {
                let started = std::time::Instant::now();
                let pong: Pong = monitor.send(&Ping { nonce }).await?;
                println!("pong nonce={} time={:?}", pong.nonce, started.elapsed());
            }
        }

        Command::Echo { text } => {
            let echo: Echo = monitor.send(&Echo { text: text.clone() }).await?;
            println!("{}", echo.text);
        }

        Command::Poll { count, interval_ms } => {
            let interval = interval_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.monitor.interval());

            let (tx, mut rx) = mpsc::unbounded_channel();
            monitor.watch_service(transport, Arc::new(Forward(tx)), interval);

            let mut received = 0u64;
            loop {
                tokio::select! {
                    info = rx.recv() => {
                        let Some(info) = info else { break };
                        LogObserver.service_state_changed(&info);
                        println!("{}", serde_json::to_string(&info)?);
                        received += 1;
                        if count.is_some_and(|limit| received >= limit) {
                            break;
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("interrupted");
                        break;
                    }
                }
            }
        }

        Command::Status => {}
    }

    Ok(())
}

/// Forwards service state to the CLI loop.
struct Forward(mpsc::UnboundedSender<ServiceInfo>);

impl Observer for Forward {
    fn service_state_changed(&self, info: &ServiceInfo) {
        let _ = self.0.send(info.clone());
    }
}

fn parse_options(raw: &[String]) -> anyhow::Result<StartOptions> {
    let mut options = StartOptions::new();
    for entry in raw {
        let (key, value) = entry
            .split_once('=')
            .with_context(|| format!("option must be KEY=JSON, got: {entry}"))?;
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        options.insert(key.to_string(), value);
    }
    Ok(options)
}
