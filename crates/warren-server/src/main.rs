// ============================================
// File: crates/warren-server/src/main.rs
// ============================================
//! # Warren Server Entry Point
//!
//! ## Creation Reason
//! Main entry point for the warren-server binary. Handles CLI parsing,
//! logging setup, configuration loading and server execution.
//!
//! ## Usage
//! ```bash
//! # Start with the default configuration path
//! warren-server start
//!
//! # Start with an explicit configuration file
//! warren-server start --config /etc/warren/server.toml
//!
//! # Validate a configuration file
//! warren-server validate --config /etc/warren/server.toml
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - The server requires root or CAP_NET_ADMIN for the interface
//! - Use systemd (or equivalent) for production deployments; on a
//!   fatal error the process exits and is restarted externally

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use warren_server::{Server, ServerConfig};

// ============================================
// CLI Definition
// ============================================

/// Warren tunneling server
#[derive(Parser, Debug)]
#[command(name = "warren-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the server
    Start {
        /// Path to the configuration file
        #[arg(short, long, default_value = "/etc/warren/server.toml")]
        config: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        #[arg(short, long, default_value = "/etc/warren/server.toml")]
        config: PathBuf,
    },
}

// ============================================
// Main
// ============================================

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_logging("info");

    let result = match cli.command {
        Commands::Start { config } => cmd_start(config).await,
        Commands::Validate { config } => cmd_validate(config).await,
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

// ============================================
// Commands
// ============================================

/// Starts the server.
async fn cmd_start(config_path: PathBuf) -> anyhow::Result<()> {
    let config = if config_path.exists() {
        ServerConfig::load(&config_path).await?
    } else {
        info!("config file not found, using defaults");
        ServerConfig::default()
    };

    // Re-initialize logging with the configured level
    init_logging(&config.logging.level);

    let server = Server::new(config);
    server.run().await?;

    Ok(())
}

/// Validates a configuration file.
async fn cmd_validate(config_path: PathBuf) -> anyhow::Result<()> {
    if !config_path.exists() {
        println!("config file not found: {}", config_path.display());
        println!("the server would start with default values");
        return Ok(());
    }

    let config = ServerConfig::load(&config_path).await?;

    println!("configuration is valid");
    println!();
    println!("network:");
    println!("  listen:   {} ({})", config.network.listen_addr, config.network.proto);
    println!();
    println!("tunnel:");
    println!("  device:   {} ({} mode)", config.tunnel.device_name, config.tunnel.mode);
    println!("  range:    {}", config.tunnel.address_range);
    println!("  gateway:  {}", config.tunnel.gateway_ip);
    println!("  mtu:      {}", config.tunnel.mtu);
    println!();
    println!("limits:");
    println!("  max clients:      {}", config.limits.max_clients);
    println!("  tcp queue limit:  {}", config.limits.tcp_queue_limit);
    println!("  session timeout:  {}s", config.limits.session_timeout_secs);
    println!();
    println!("routing:");
    println!("  client-to-client: {}", config.routing.enable_c2c);
    println!("  route ttl:        {}s", config.routing.mroute_ageable_ttl_secs);

    Ok(())
}

// ============================================
// Helper Functions
// ============================================

/// Initializes the tracing subscriber.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .ok();
}
