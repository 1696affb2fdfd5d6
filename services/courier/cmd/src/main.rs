//! Courier session orchestrator binary.
//!
//! Restores every persisted session, then serves an operator console on
//! stdin until SIGINT/SIGTERM or `quit`.

use anyhow::bail;
use clap::Parser;
use courier_session::{
    ConnectionConfig, LoopbackOptions, LoopbackTransport, ReconnectionPolicy, ServiceConfig,
    SessionService, Transport, TransportConfig,
};
use courier_storage::{Storage, StorageMode};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod console;
mod logging;

use config::CourierConfig;
use console::{Command, Console};
use logging::CourierLogFormatter;

/// Keeps messaging sessions paired, connected and dispatching
#[derive(Parser, Debug)]
#[command(name = "courier", version, about = "Session lifecycle orchestrator")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Storage mode: memory, file (overrides the config file)
    #[arg(long)]
    storage_mode: Option<String>,

    /// Session snapshot file (overrides the config file)
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Credentials directory (overrides the config file)
    #[arg(long)]
    credentials_dir: Option<PathBuf>,

    /// Connection establishment timeout, e.g. 2m
    #[arg(long)]
    connect_timeout: Option<humantime::Duration>,

    /// How long a login waits for its pairing outcome, e.g. 3m
    #[arg(long)]
    login_timeout: Option<humantime::Duration>,

    /// Delay before the loopback transport confirms a pairing code
    #[arg(long, default_value = "5s")]
    loopback_confirm_delay: humantime::Duration,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("courier={}", args.log_level).parse()?)
        .add_directive(format!("courier_session={}", args.log_level).parse()?)
        .add_directive(format!("courier_storage={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .event_format(CourierLogFormatter::new("courier"))
        .init();

    info!("Starting courier v{}", env!("CARGO_PKG_VERSION"));

    let mut config = CourierConfig::load_from_file(&args.config)?;
    if let Some(mode) = args.storage_mode {
        config.storage_mode = mode;
    }
    if let Some(state_file) = args.state_file {
        config.state_file = state_file;
    }
    if let Some(credentials_dir) = args.credentials_dir {
        config.credentials_dir = credentials_dir;
    }
    if let Some(timeout) = args.connect_timeout {
        config.connect_timeout = Duration::from(timeout).as_secs();
    }
    if let Some(timeout) = args.login_timeout {
        config.login_timeout = Duration::from(timeout).as_secs();
    }

    let storage_mode = match config.storage_mode.as_str() {
        "memory" => StorageMode::InMemory,
        "file" => StorageMode::File {
            state_file: config.state_file.clone(),
            credentials_dir: config.credentials_dir.clone(),
        },
        other => bail!("Invalid storage mode: {}. Use 'memory' or 'file'", other),
    };
    info!("Storage: {:?}", storage_mode);
    let storage = Storage::from_mode(storage_mode).await?;

    let transport: Arc<dyn Transport> = match config.transport.as_str() {
        "loopback" => Arc::new(LoopbackTransport::new(LoopbackOptions {
            pairing_confirm_delay: Duration::from(args.loopback_confirm_delay),
            ..LoopbackOptions::automatic()
        })),
        other => bail!("Unsupported transport: {}", other),
    };

    let service_config = ServiceConfig {
        connection: ConnectionConfig {
            transport: TransportConfig {
                connect_timeout: Duration::from_secs(config.connect_timeout),
                keepalive_interval: Duration::from_secs(config.keepalive_interval),
                ..TransportConfig::default()
            },
            policy: ReconnectionPolicy {
                base: Duration::from_millis(config.reconnect_base_ms),
                cap: Duration::from_millis(config.reconnect_cap_ms),
                fallback: Duration::from_millis(config.reconnect_fallback_ms),
            },
            pairing_delay: Duration::from_secs(config.pairing_delay),
        },
        login_timeout: Duration::from_secs(config.login_timeout),
    };
    let service = Arc::new(SessionService::new(storage, transport, service_config));

    let restored = service.restore().await?;
    component_info!("bootstrap", "Restored {} sessions", restored);

    let console = Console::new(service.clone(), config.default_interval);
    println!("courier ready, type `help` for commands");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGINT handler: {}", e))?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM signal, shutting down");
                break;
            }

            _ = sigint.recv() => {
                info!("Received SIGINT signal, shutting down");
                break;
            }

            line = lines.next_line(), if stdin_open => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        component_info!("console", "stdin closed, console disabled");
                        stdin_open = false;
                        continue;
                    }
                    Err(e) => {
                        component_warn!("console", "Failed to read stdin: {}", e);
                        stdin_open = false;
                        continue;
                    }
                };

                match Command::parse(&line) {
                    Ok(None) => {}
                    Ok(Some(Command::Quit)) => {
                        info!("Quit requested, shutting down");
                        break;
                    }
                    Ok(Some(command)) => {
                        // Logins can wait minutes for pairing; keep reading input
                        let console = console.clone();
                        tokio::spawn(async move {
                            match console.execute(command).await {
                                Ok(output) => println!("{}", output),
                                Err(e) => {
                                    component_error!("console", "Command failed: {:#}", e);
                                    println!("error: {:#}", e);
                                }
                            }
                        });
                    }
                    Err(e) => println!("error: {}", e),
                }
            }
        }
    }

    service.shutdown().await;
    info!("courier stopped");
    Ok(())
}
