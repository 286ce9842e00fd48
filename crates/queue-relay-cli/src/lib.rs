//! # Queue-Relay CLI
//!
//! Command-line interface for relaying messages from an error queue back to
//! the destination queue they were meant for.
//!
//! This module provides CLI commands for:
//! - Running the relay until a stop is requested
//! - Validating and showing the resolved configuration

use clap::{Parser, Subcommand};
use queue_relay_core::{ConfigError, Relay, RelayConfig, RelayReport, SecretString};
use queue_runtime::{
    AzureServiceBusConfig, ProviderConfig, QueueClient, QueueClientFactory, QueueConfig,
    QueueError,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

// ============================================================================
// CLI Structure
// ============================================================================

/// Queue-Relay CLI - Return dead-lettered messages to their destination queue
#[derive(Parser)]
#[command(name = "queue-relay")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Relay messages from an error queue back to its destination queue")]
#[command(
    long_about = "Queue-Relay receives messages from '<destination>_error', forwards them unchanged to '<destination>' and completes or abandons each source message"
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "QUEUE_RELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level, overriding the configured level
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Relay messages until Ctrl+C, SIGTERM or Enter
    Run,

    /// Validate configuration
    Config {
        /// Show resolved configuration with secrets redacted
        #[arg(short, long)]
        show: bool,
    },
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Failed to create {endpoint} queue client: {source}")]
    ClientConstruction {
        endpoint: String,
        #[source]
        source: QueueError,
    },

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("Logging initialization failed: {message}")]
    Logging { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Logging { .. } => 1,
            Self::InvalidArgument { .. } => 2,
            Self::Configuration(_) => 3,
            Self::ClientConstruction { .. } => 4,
            Self::Io(_) => 5,
        }
    }
}

// ============================================================================
// Entry Points
// ============================================================================

/// Parse the command line and execute it
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();
    execute(cli).await
}

/// Execute a parsed command line
pub async fn execute(cli: Cli) -> Result<(), CliError> {
    let config = RelayConfig::load(cli.config.as_deref())?;

    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    initialize_logging(&level, cli.json_logs || config.logging.json)?;

    match cli.command {
        Commands::Run => execute_run_command(&config).await.map(|_| ()),
        Commands::Config { show } => execute_config_command(&config, show),
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// Initialize logging to stderr; `RUST_LOG` takes precedence over `level`
pub fn initialize_logging(level: &str, json: bool) -> Result<(), CliError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).map_err(|e| CliError::InvalidArgument {
            arg: "log-level".to_string(),
            message: e.to_string(),
        })?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };

    result.map_err(|e| CliError::Logging {
        message: e.to_string(),
    })
}

/// Validate configuration and optionally print it
pub fn execute_config_command(config: &RelayConfig, show: bool) -> Result<(), CliError> {
    config.validate()?;

    println!("Configuration is valid");
    println!("Source queue: {}", config.source_queue_name()?);
    println!("Destination queue: {}", config.destination_queue_name()?);

    if show {
        println!();
        print!("{}", config.to_redacted_yaml()?);
    }

    Ok(())
}

/// Run the relay until a stop is requested and print its report
pub async fn execute_run_command(config: &RelayConfig) -> Result<RelayReport, CliError> {
    config.validate()?;
    let source_queue = config.source_queue_name()?;
    let destination_queue = config.destination_queue_name()?;

    let source = build_client(&config.source.connection_string, "source").await?;
    let destination = build_client(&config.destination.connection_string, "destination").await?;

    let relay = Relay::new(
        source,
        source_queue.clone(),
        destination,
        destination_queue.clone(),
        config.relay_options(),
    );

    let shutdown = CancellationToken::new();
    spawn_enter_listener(shutdown.clone());
    let signals = tokio::spawn(stop_on_signal(shutdown.clone()));

    println!(
        "Relaying '{}' -> '{}'. Press Enter or Ctrl+C to stop.",
        source_queue, destination_queue
    );

    let report = relay.run(shutdown).await;
    signals.abort();

    println!("{}", report);
    Ok(report)
}

/// Build a Service Bus client for one endpoint
pub async fn build_client(
    connection_string: &SecretString,
    endpoint: &str,
) -> Result<Arc<dyn QueueClient>, CliError> {
    let config = QueueConfig {
        provider: ProviderConfig::AzureServiceBus(AzureServiceBusConfig::from_connection_string(
            connection_string.expose_secret(),
        )),
    };

    let client = QueueClientFactory::create_client(config)
        .await
        .map_err(|source| CliError::ClientConstruction {
            endpoint: endpoint.to_string(),
            source,
        })?;

    info!(endpoint = endpoint, provider = %client.provider_type(), "Created queue client");
    Ok(Arc::from(client))
}

/// Cancel `shutdown` when a line (or just Enter) is read from stdin
///
/// Reads on a plain thread so a pending read never holds up process exit.
/// End of input does not stop the relay, so it can run detached from a
/// terminal.
fn spawn_enter_listener(shutdown: CancellationToken) {
    std::thread::spawn(move || {
        let mut line = String::new();
        match std::io::stdin().read_line(&mut line) {
            Ok(0) => {}
            Ok(_) => {
                info!("Enter pressed, stopping relay");
                shutdown.cancel();
            }
            Err(e) => warn!(error = %e, "Cannot read stdin; stop with Ctrl+C or SIGTERM"),
        }
    });
}

/// Cancel `shutdown` on Ctrl+C or SIGTERM
async fn stop_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
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
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C), stopping relay"),
        _ = terminate => info!("Received SIGTERM, stopping relay"),
        _ = shutdown.cancelled() => return,
    }

    shutdown.cancel();
}
