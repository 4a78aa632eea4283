//! Desktop bridge: one command station behind the HTTP API, MQTT and
//! UDP discovery.
//!
//! # Usage
//!
//! Virtual station, web API only:
//! ```sh
//! cargo run --example desktop_bridge --features web,mqtt,discovery
//! ```
//!
//! A CS2 over TCP, settings from a JSON file, with MQTT:
//! ```sh
//! cargo run --example desktop_bridge --features web,mqtt,discovery -- \
//!     --backend cs2 --config bridge.json --mqtt
//! ```
//!
//! Logging follows `RUST_LOG` (default `info`).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use rs_trainz_bridge::config::{BackendKind, BridgeConfig};
use rs_trainz_bridge::discovery::DiscoveryResponder;
use rs_trainz_bridge::fanout::EventFanout;
use rs_trainz_bridge::services::{
    run_server, MqttHandler, MqttRuntimeConfig, SharedStation, WebServerConfig,
};
use rs_trainz_bridge::station::CommandStation;
use rs_trainz_bridge::CommandStationController;

#[derive(Debug, Parser)]
#[command(name = "desktop_bridge", about = "Command station protocol bridge")]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backend override: legacy, cs2, dcc-ex or virtual
    #[arg(short, long)]
    backend: Option<String>,

    /// HTTP port override
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable the MQTT client
    #[arg(long)]
    mqtt: bool,

    /// Enable the UDP discovery responder
    #[arg(long)]
    discovery: bool,
}

fn load_config(args: &Args) -> anyhow::Result<BridgeConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            BridgeConfig::from_json_str(&text)?
        }
        None => BridgeConfig::default(),
    };
    if let Some(name) = &args.backend {
        let kind = BackendKind::from_text(name)
            .with_context(|| format!("unknown backend {name:?}"))?;
        config = config.with_backend(kind);
    }
    if let Some(port) = args.port {
        config.web.port = port;
    }
    config.mqtt.enabled |= args.mqtt;
    config.discovery.enabled |= args.discovery;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let station = CommandStation::from_config(&config, Arc::new(EventFanout::new()))?;
    tracing::info!(backend = ?station.kind(), "starting bridge");
    let station: Arc<dyn CommandStationController> = Arc::new(station);
    let shared = Arc::new(SharedStation::new(station));

    // =========================================================================
    // Connect (blocking: probes the hardware)
    // =========================================================================
    let connecting = Arc::clone(&shared);
    if tokio::task::spawn_blocking(move || connecting.connect()).await? {
        tracing::info!("station connected");
    } else {
        tracing::warn!("station not reachable, connect later via POST /api/connect");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // =========================================================================
    // Web server
    // =========================================================================
    let web_config = WebServerConfig::from_config(&config.web);
    let web = config.web.enabled.then(|| {
        let mut rx = shutdown_rx.clone();
        let state = Arc::clone(&shared);
        let web_config = web_config.clone();
        tokio::spawn(async move {
            let shutdown = async move {
                let _ = rx.changed().await;
            };
            if let Err(e) = run_server(state, web_config, shutdown).await {
                tracing::error!(error = %e, "web server failed");
            }
        })
    });

    // =========================================================================
    // MQTT
    // =========================================================================
    let mqtt = config.mqtt.enabled.then(|| {
        let handler = MqttHandler::new(
            Arc::clone(&shared),
            MqttRuntimeConfig::from_config(&config.mqtt),
        );
        tokio::spawn(async move {
            if let Err(e) = handler.run().await {
                tracing::error!(error = %e, "mqtt handler failed");
            }
        })
    });

    // =========================================================================
    // Discovery
    // =========================================================================
    let discovery = if config.discovery.enabled {
        Some(
            DiscoveryResponder::new(&config.discovery, web_config.addr.port())
                .spawn()
                .await?,
        )
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    let _ = shutdown_tx.send(true);
    if let Some(web) = web {
        let _ = web.await;
    }
    if let Some(mqtt) = mqtt {
        mqtt.abort();
    }
    if let Some(discovery) = discovery {
        discovery.shutdown().await;
    }

    tokio::task::spawn_blocking(move || shared.disconnect()).await?;
    Ok(())
}
