//! Desktop runner for the knob cab.
//!
//! Connects to a JMRI server, keeps both connections alive and, with the
//! `web` feature, serves the virtual knob panel.
//!
//! # Usage
//!
//! ```sh
//! knobcab --host 192.168.1.10
//! knobcab --config ~/.knobcab.json --power-manager DCC++
//! cargo run --features web -- --host 192.168.1.10 --web-port 8080
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rs_knobcab::config::{Config, JsonFileConfigStore};
use rs_knobcab::AppContext;

#[derive(Parser, Debug)]
#[command(name = "knobcab")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Settings file (flat JSON object), created on first save
    #[arg(long, default_value = "knobcab.json")]
    config: PathBuf,

    /// JMRI server host, overrides the stored one
    #[arg(long)]
    host: Option<String>,

    /// WiThrottle port, overrides the stored one
    #[arg(long)]
    port: Option<u16>,

    /// Power manager to track, overrides the stored one
    #[arg(long)]
    power_manager: Option<String>,

    /// Serve the virtual knob panel on this port
    #[cfg(feature = "web")]
    #[arg(long)]
    web_port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let store = Arc::new(
        JsonFileConfigStore::open(&cli.config)
            .with_context(|| format!("opening settings {}", cli.config.display()))?,
    );
    let config = apply_overrides(Config::load_from(store.as_ref()), &cli);
    let ctx = Arc::new(AppContext::new(config.clone(), store));

    if cli.host.is_some() || cli.port.is_some() || cli.power_manager.is_some() {
        ctx.update_server(config.server.clone())
            .context("saving server settings")?;
    }

    tracing::info!(
        host = %config.server.host,
        port = config.server.withrottle_port,
        power_manager = %config.server.power_manager,
        "knobcab starting"
    );

    if let Err(e) = ctx.connect().await {
        tracing::warn!(error = %e, "initial connect failed, supervisor will retry");
    }
    ctx.start();

    #[cfg(feature = "web")]
    if let Some(port) = cli.web_port {
        use rs_knobcab::services::{run_server, WebServerConfig, WebState};

        let web = config.web.clone().with_port(port).with_enabled(true);
        let state = Arc::new(WebState::new(
            Arc::clone(ctx.controller()),
            Arc::clone(ctx.json()),
        ));
        tokio::spawn(async move {
            if let Err(e) = run_server(state, WebServerConfig::from_config(&web)).await {
                tracing::error!(error = %e, "web panel stopped");
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    tracing::info!("stopping");
    ctx.shutdown().await;
    Ok(())
}

fn apply_overrides(mut config: Config, cli: &Cli) -> Config {
    let mut server = config.server.clone();
    if let Some(host) = &cli.host {
        server = server.with_host(host);
    }
    if let Some(port) = cli.port {
        server = server.with_withrottle_port(port);
    }
    if let Some(name) = &cli.power_manager {
        server = server.with_power_manager(name);
    }
    config.server = server;
    config
}
