//! Headless MQTT session client - main entry point.

use clap::{Parser, Subcommand};
use mqtt_session::config::ClientConfig;
use mqtt_session::observability::{init_default_logging, metrics};
use mqtt_session::session::{Session, SessionEvent, SessionState};
use mqtt_session::transport::MqttTransport;
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Headless MQTT session client
#[derive(Parser)]
#[command(name = "mqtt-session")]
#[command(about = "Client-side MQTT session manager")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the broker and run until interrupted
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting mqtt-session v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_client(config).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Shutdown complete");
}

fn load_configuration(config_path: &Option<PathBuf>) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(ClientConfig::load_from_file(path)?)
        }
        None => {
            // Try default locations
            let default_paths = vec!["session.toml", "config/session.toml"];

            for path_str in default_paths {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(ClientConfig::load_from_file(&path)?);
                }
            }

            error!(
                "No configuration file found. Please provide one with -c/--config or create session.toml"
            );
            process::exit(1);
        }
    }
}

async fn run_client(config: ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    let session = Session::spawn(config.session.clone(), MqttTransport::new());
    let handle = session.handle();
    let mut events = handle.events();

    handle.connect(config.connection.clone()).await?;
    for entry in &config.subscriptions {
        handle.subscribe(entry.filter.clone(), entry.qos).await?;
    }

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Session is running; waiting for messages...");

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if !report_event(event) {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event consumer lagged, {skipped} events skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    session.shutdown().await;

    match serde_json::to_string(&metrics().snapshot()) {
        Ok(snapshot) => info!(metrics = %snapshot, "final session metrics"),
        Err(e) => warn!("Failed to serialize metrics: {}", e),
    }

    Ok(())
}

/// Log one session event. Returns false once the session has failed
/// terminally and the process should exit.
fn report_event(event: SessionEvent) -> bool {
    match event {
        SessionEvent::ConnectionStateChanged(SessionState::Failed(reason)) => {
            error!(reason = %reason, "session failed terminally, exiting");
            return false;
        }
        SessionEvent::ConnectionStateChanged(state) => {
            info!(state = %state, "connection state changed");
        }
        SessionEvent::ConnectionFailed { reason } => {
            warn!(reason = %reason, "connect attempt failed");
        }
        SessionEvent::ConnectionLost { reason } => {
            warn!(reason = %reason, "connection lost");
        }
        SessionEvent::SubscriptionConfirmed { filter } => {
            info!(filter = %filter, "subscription confirmed");
        }
        SessionEvent::SubscriptionFailed { filter, reason } => {
            warn!(filter = %filter, reason = %reason, "subscription failed");
        }
        SessionEvent::PublishFailed { topic, reason } => {
            warn!(topic = %topic, reason = %reason, "publish failed");
        }
        SessionEvent::QueueOverflow { dropped_topic } => {
            warn!(topic = %dropped_topic, "publish queue overflow, oldest message dropped");
        }
        SessionEvent::MessageReceived(message) => {
            info!(
                topic = %message.topic,
                qos = u8::from(message.qos),
                received_at = %message.received_at,
                payload = %message.payload_text(),
                "message received"
            );
        }
    }
    true
}

fn handle_config_command(
    config: ClientConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
