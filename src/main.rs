//! Waylay - intercepting HTTP(S) proxy for web security testing

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use waylay::app::{open_authority, App, Config};

/// Intercepting HTTP(S) proxy
#[derive(Parser, Debug)]
#[command(name = "waylay")]
#[command(author, version, about = "Intercepting HTTP(S) proxy for web security testing", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "WAYLAY_CONFIG")]
    config: Option<String>,

    /// Proxy listen port (overrides the configuration file)
    #[arg(short, long, env = "WAYLAY_PORT")]
    port: Option<u16>,

    /// Proxy listen address (overrides the configuration file)
    #[arg(long, env = "WAYLAY_LISTEN")]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "WAYLAY_LOG_LEVEL")]
    log_level: String,

    /// Log file path (enables file logging)
    #[arg(long, env = "WAYLAY_LOG_FILE")]
    log_file: Option<String>,

    /// Enable JSON structured logging
    #[arg(long, env = "WAYLAY_LOG_JSON")]
    log_json: bool,

    /// Generate default configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate_config: bool,

    /// Write the root CA certificate (PEM) to this path and exit
    #[arg(long, value_name = "PATH")]
    export_ca: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls ring crypto provider (required for rustls 0.23+)
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        tracing::debug!("rustls crypto provider already installed");
    }

    let cli = Cli::parse();

    if cli.generate_config {
        return generate_default_config();
    }

    init_logging(&cli)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Waylay");

    let config = load_config(&cli)?;

    if cli.validate_config {
        tracing::info!("Configuration is valid");
        return Ok(());
    }

    if let Some(path) = &cli.export_ca {
        return export_ca(&config, path);
    }

    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
    let shutdown_flag = Arc::new(AtomicBool::new(false));

    let shutdown_flag_clone = shutdown_flag.clone();
    tokio::spawn(async move {
        handle_signals(shutdown_tx, shutdown_flag_clone).await;
    });

    let mut app = App::new(config).context("Failed to initialise Waylay")?;
    app.run(async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    tracing::info!(
        interrupted = shutdown_flag.load(Ordering::SeqCst),
        "Waylay shutting down gracefully"
    );
    Ok(())
}

/// Initialize the logging system
fn init_logging(cli: &Cli) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let subscriber = tracing_subscriber::registry().with(env_filter);

    if let Some(log_path) = &cli.log_file {
        // File-based logging with daily rotation
        let path = std::path::Path::new(log_path);
        let file_appender = match (path.parent(), path.file_name()) {
            (Some(dir), Some(name)) if !dir.as_os_str().is_empty() => {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create log directory {:?}", dir))?;
                RollingFileAppender::new(Rotation::DAILY, dir, name)
            }
            _ => {
                let log_dir = Config::data_dir()
                    .map(|d| d.join("logs"))
                    .unwrap_or_else(|_| PathBuf::from("."));
                std::fs::create_dir_all(&log_dir).ok();
                RollingFileAppender::new(Rotation::DAILY, log_dir, log_path)
            }
        };

        if cli.log_json {
            let file_layer = fmt::layer()
                .json()
                .with_writer(file_appender)
                .with_ansi(false);
            subscriber.with(file_layer).init();
        } else {
            let file_layer = fmt::layer().with_writer(file_appender).with_ansi(false);
            subscriber.with(file_layer).init();
        }
    } else if cli.log_json {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer()).init();
    }

    Ok(())
}

/// Load configuration with CLI overrides
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;

    if let Some(port) = cli.port {
        config.proxy.port = port;
    }
    if let Some(listen) = &cli.listen {
        config.proxy.listen_addr = listen.clone();
    }

    config
        .validate()
        .map_err(|e| anyhow::anyhow!(waylay::WaylayError::from(e).user_message()))?;

    Ok(config)
}

/// Generate default configuration file
fn generate_default_config() -> Result<()> {
    let config = Config::default();
    let toml = toml::to_string_pretty(&config).context("Failed to serialize configuration")?;

    println!("{}", toml);
    Ok(())
}

/// Write the root certificate for installation in a browser
fn export_ca(config: &Config, path: &std::path::Path) -> Result<()> {
    let ca_dir = config.resolved_data_dir()?.join("ca");
    let ca = open_authority(&ca_dir).map_err(|e| anyhow::anyhow!(e.user_message()))?;
    let (_, pem) = ca
        .export_root()
        .map_err(|e| anyhow::anyhow!(waylay::WaylayError::from(e).user_message()))?;

    std::fs::write(path, pem)
        .with_context(|| format!("Failed to write root certificate to {:?}", path))?;
    tracing::info!("Root certificate written to {:?}", path);
    Ok(())
}

/// Handle shutdown signals
async fn handle_signals(shutdown_tx: broadcast::Sender<()>, shutdown_flag: Arc<AtomicBool>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {
                        tracing::info!("Received SIGINT, initiating shutdown");
                    }
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, initiating shutdown");
                    }
                }
            }
            _ => {
                tracing::warn!("Signal handlers unavailable, falling back to Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Received Ctrl+C, initiating shutdown");
    }

    shutdown_flag.store(true, Ordering::SeqCst);
    let _ = shutdown_tx.send(());
}
