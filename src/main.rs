//! Sensor Relay - Main Entry Point

use sensor_relay::config::RelayConfig;
use sensor_relay::observability::{init_default_logging, init_logging, LogFormat};
use sensor_relay::protocol::JsonObject;
use sensor_relay::service::RelayService;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{error, info, Level};

/// MQTT telemetry ingestion router with task hand-off and real-time fan-out
#[derive(Parser)]
#[command(name = "sensor-relay")]
#[command(about = "MQTT telemetry ingestion router with task hand-off and real-time fan-out")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "SENSOR_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the broker and relay messages until interrupted
    Run,
    /// Validate configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
    /// Publish a single command to a device and exit
    SendCommand {
        /// Target device identifier
        device: String,
        /// Command name
        command: String,
        /// Command parameters as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        verbose => {
            let level = if verbose == 1 { Level::DEBUG } else { Level::TRACE };
            let format = std::env::var("LOG_FORMAT")
                .map(|format| LogFormat::parse(&format))
                .unwrap_or(LogFormat::Compact);
            init_logging(level, format, false);
        }
    }

    info!("Starting sensor-relay v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_relay(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
        Commands::SendCommand {
            device,
            command,
            params,
        } => send_command(config, &device, &command, &params).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<RelayConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(RelayConfig::load_from_file(path)?);
    }

    for path_str in ["sensor-relay.toml", "config/sensor-relay.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(RelayConfig::load_from_file(&path)?);
        }
    }

    info!("No configuration file found, using defaults and environment");
    Ok(RelayConfig::from_env()?)
}

async fn run_relay(config: RelayConfig) -> Result<(), Box<dyn std::error::Error>> {
    let server_enabled = config.server.enabled;
    let mut service = RelayService::new(config)?;

    let (server_stop_tx, server_stop_rx) = oneshot::channel::<()>();
    let server_task = if server_enabled {
        let (address, handle) = service.server().spawn(async move {
            let _ = server_stop_rx.await;
        })?;
        info!("HTTP server listening on {}", address);
        Some(handle)
    } else {
        None
    };

    service.start().await?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Relay is running");

    let connection_lost = service.connection_lost();
    let lost = tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
            false
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
            false
        }
        _ = connection_lost => {
            error!("MQTT connection lost, shutting down relay...");
            true
        }
    };

    service.stop().await?;

    let _ = server_stop_tx.send(());
    if let Some(handle) = server_task {
        let _ = handle.await;
    }

    if lost {
        return Err("broker connection lost".into());
    }
    Ok(())
}

fn handle_config_command(config: &RelayConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", toml::to_string_pretty(config)?);
        for binding in config.topic_bindings()? {
            println!("# {} -> {}", binding.pattern, binding.handler);
        }
    }

    info!("Configuration validation complete");
    Ok(())
}

async fn send_command(
    config: RelayConfig,
    device: &str,
    command: &str,
    params: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let parameters: JsonObject = serde_json::from_str(params)
        .map_err(|e| format!("--params must be a JSON object: {e}"))?;

    let mut service = RelayService::new(config)?;
    service.start().await?;
    let outcome = service
        .publisher()
        .send_command(device, command, parameters)
        .await;
    service.stop().await?;

    outcome?;
    info!(device = %device, command = %command, "Command sent");
    Ok(())
}
