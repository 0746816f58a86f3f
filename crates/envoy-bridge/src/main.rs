//! envoy-bridge - Enphase Envoy to MQTT bridge
//!
//! Runs the polling service, writes a starter config, or checks gateway
//! credentials.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use envoy_bridge::{check_auth, run_service, BridgeConfig, ShutdownTx};
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "envoy-bridge")]
#[command(about = "Publishes Enphase Envoy telemetry to MQTT")]
#[command(version)]
struct Cli {
    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, env = "ENVOY_BRIDGE_LOG", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge
    Run {
        /// Path to config file
        #[arg(short, long, env = "ENVOY_BRIDGE_CONFIG", default_value = "/etc/envoy-bridge/config.toml")]
        config: PathBuf,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "/etc/envoy-bridge/config.toml")]
        output: PathBuf,
    },

    /// Authenticate against the gateway once and exit
    CheckAuth {
        /// Path to config file
        #[arg(short, long, env = "ENVOY_BRIDGE_CONFIG", default_value = "/etc/envoy-bridge/config.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&cli.log_level))?;
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Run { config } => run(config).await?,
        Commands::InitConfig { output } => init_config(&output)?,
        Commands::CheckAuth { config } => {
            let config = BridgeConfig::load(&config)?;
            check_auth(&config).await?;
            println!("Gateway accepted the credentials for {}", config.envoy.serial_number);
        }
    }

    Ok(())
}

async fn run(config_path: PathBuf) -> anyhow::Result<()> {
    info!(config = %config_path.display(), version = env!("CARGO_PKG_VERSION"), "starting envoy-bridge");

    let config = BridgeConfig::load(&config_path)?;
    info!(
        envoy = %config.envoy.host,
        broker = %config.mqtt.host,
        base_topic = %config.mqtt.base_topic,
        "loaded config"
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
    tokio::spawn(forward_signals(shutdown_tx.clone()));

    if let Err(e) = run_service(&config, &shutdown_tx, shutdown_rx).await {
        error!(error = %e, "bridge failed");
        return Err(e.into());
    }
    Ok(())
}

/// Sends shutdown on Ctrl+C or SIGTERM.
async fn forward_signals(shutdown: ShutdownTx) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received Ctrl+C"),
                    _ = terminate.recv() => info!("received SIGTERM"),
                }
            }
            Err(e) => {
                error!(error = %e, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
                info!("received Ctrl+C");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received Ctrl+C");
    }

    let _ = shutdown.send(());
}

fn init_config(output: &Path) -> anyhow::Result<()> {
    let config = BridgeConfig::sample();
    config.save(output)?;

    println!("Config written to {}", output.display());
    println!();
    println!("Fill in the gateway address and Enlighten credentials, then run:");
    println!("  envoy-bridge check-auth --config {}", output.display());
    println!("  envoy-bridge run --config {}", output.display());

    Ok(())
}
