//! Intercepting Multi-Protocol Proxy
//!
//! Terminates HTTP, FTP, DNS and Telnet clients, relays their traffic to an
//! upstream server and lets an operator pause and resume individual packets.
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌────────────────────────────────────────────────────────┐
//!                 │                   PROTOCOL PROXY                       │
//!                 │                                                        │
//!   Client        │  ┌──────────┐   ┌────────────┐   ┌─────────────────┐   │
//!   ──────────────┼─▶│   net    │──▶│ protocols  │──▶│ session::relay  │───┼──▶ Upstream
//!                 │  │listeners │   │ registry + │   │ pumps + framers │   │
//!                 │  │ + pool   │   │  handlers  │   └────────┬────────┘   │
//!                 │  └──────────┘   └────────────┘            │            │
//!                 │                                           ▼            │
//!                 │                                  ┌─────────────────┐   │
//!   Operator      │  ┌──────────┐                    │     inspect     │   │
//!   ──────────────┼─▶│  admin   │───pause/resume────▶│ capture + hold  │   │
//!                 │  └──────────┘                    └────────┬────────┘   │
//!                 │                                           ▼            │
//!                 │                               packet store, telemetry  │
//!                 │                                                        │
//!                 │   config (+ hot reload) · observability · lifecycle    │
//!                 └────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;

use protocol_proxy::admin::{self, AdminState};
use protocol_proxy::config::watcher::{run_reload_loop, ConfigWatcher};
use protocol_proxy::config::{load_config, ProxyConfig};
use protocol_proxy::inspect::InspectionServices;
use protocol_proxy::lifecycle::{signals, Shutdown};
use protocol_proxy::net::ProxyServer;
use protocol_proxy::observability::{logging, metrics};
use protocol_proxy::protocols::HandlerRegistry;
use protocol_proxy::telemetry;

/// Upper bound on the final telemetry flush during shutdown.
const TELEMETRY_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "protocol-proxy", version)]
#[command(about = "Intercepting proxy for HTTP, FTP, DNS and Telnet", long_about = None)]
struct Args {
    /// TOML configuration file. Built-in defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    logging::init_logging(&config.observability)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?args.config,
        max_connections = config.server.max_connections,
        "protocol-proxy starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let shutdown = Shutdown::new();

    let mut services = InspectionServices::new(config.inspection.clone());
    let telemetry_task = if config.telemetry.enabled {
        let (handle, sink) = telemetry::channel(config.telemetry.clone());
        services = services.with_telemetry(handle);
        Some(tokio::spawn(sink.run(shutdown.subscribe())))
    } else {
        None
    };

    let registry = HandlerRegistry::from_config(&config.protocols);
    tracing::info!(protocols = ?registry.protocols(), "Handlers registered");
    let server = ProxyServer::new(config.clone(), registry, services.clone());

    if config.admin.enabled {
        let listener = TcpListener::bind(&config.admin.bind_address).await?;
        let state = AdminState {
            server: server.clone(),
            api_key: config.admin.api_key.as_str().into(),
        };
        let signal = shutdown.subscribe();
        tokio::spawn(async move {
            if let Err(e) = admin::serve(listener, state, signal).await {
                tracing::error!(error = %e, "Admin API failed");
            }
        });
    }

    // Kept alive for the process lifetime; dropping it stops the watch.
    let _watcher = match &args.config {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            tokio::spawn(run_reload_loop(
                config.clone(),
                updates,
                services.settings.clone(),
                shutdown.subscribe(),
            ));
            match watcher.run() {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    tracing::error!(error = %e, "Config hot reload disabled");
                    None
                }
            }
        }
        None => None,
    };

    let listeners = server.bind().await?;
    let serving = tokio::spawn({
        let server = server.clone();
        let signal = shutdown.subscribe();
        async move { server.serve(listeners, signal).await }
    });

    signals::wait_for_signal().await;
    tracing::info!(
        active_sessions = server.active_sessions(),
        held_packets = server.holds().len(),
        "Shutting down"
    );
    shutdown.trigger();

    if let Err(e) = serving.await {
        tracing::error!(error = %e, "Dispatcher task failed");
    }
    if let Some(task) = telemetry_task {
        if tokio::time::timeout(TELEMETRY_DRAIN_TIMEOUT, task).await.is_err() {
            tracing::warn!("Telemetry flush did not finish before shutdown");
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
