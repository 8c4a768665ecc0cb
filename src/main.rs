use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::gate::Gate;
use turnstile::ratelimit::{RecordStore, RequestMeta, RouteClass, Sweeper};

/// Adaptive request throttling engine.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the effective policy catalog
    Policies,

    /// Replay a burst of requests from one client and print each verdict
    Simulate {
        /// Route class to evaluate against
        #[arg(long, value_enum)]
        route: RouteClass,

        /// Number of requests to send
        #[arg(long, default_value_t = 10)]
        requests: u32,

        /// Pause between requests in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,

        /// X-Forwarded-For value
        #[arg(long)]
        forwarded_for: Option<String>,

        /// Direct peer address
        #[arg(long)]
        peer: Option<IpAddr>,

        /// User-Agent value
        #[arg(long)]
        user_agent: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = TurnstileConfig::load(cli.config.as_deref())?;
    let catalog = config.catalog()?;
    info!(
        sweep_interval_secs = config.engine.sweep_interval_secs,
        "Configuration loaded"
    );

    let store = Arc::new(RecordStore::new());
    let gate = Gate::new(store.clone(), catalog);

    match cli.command {
        Command::Policies => {
            println!("{}", serde_json::to_string_pretty(gate.catalog())?);
        }
        Command::Simulate {
            route,
            requests,
            interval_ms,
            forwarded_for,
            peer,
            user_agent,
        } => {
            let sweeper = Sweeper::spawn(store, &config.engine);

            let mut meta = RequestMeta {
                peer_addr: peer.map(|ip| ip.to_string()),
                user_agent,
                ..RequestMeta::default()
            };
            if let Some(header) = forwarded_for.as_deref() {
                meta = meta.with_forwarded_for(header);
            }

            info!(route = %route, requests = requests, "Starting simulation");

            tokio::select! {
                result = simulate(&gate, route, &meta, requests, interval_ms) => result?,
                _ = shutdown_signal() => warn!("Simulation interrupted"),
            }

            let stats = gate.store().stats();
            info!(
                records = stats.records,
                allowed = stats.allowed_total,
                denied = stats.denied_total,
                "Simulation finished"
            );
            sweeper.shutdown().await;
        }
    }

    Ok(())
}

async fn simulate(
    gate: &Gate,
    route: RouteClass,
    meta: &RequestMeta,
    requests: u32,
    interval_ms: u64,
) -> anyhow::Result<()> {
    for n in 1..=requests {
        let verdict = gate.check(route, meta);
        let headers: serde_json::Map<String, serde_json::Value> = verdict
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    serde_json::Value::from(value.to_str().unwrap_or_default()),
                )
            })
            .collect();

        let line = serde_json::json!({
            "request": n,
            "status": verdict.status().as_u16(),
            "headers": headers,
            "verdict": verdict,
        });
        println!("{}", serde_json::to_string(&line)?);

        if interval_ms > 0 && n < requests {
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
        }
    }
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
