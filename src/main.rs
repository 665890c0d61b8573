//! fullcone - full-cone NAT for nginx via conntrack

use anyhow::{Context, Result};
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fullcone_lib::{Daemon, DaemonConfig};

/// Keep nginx stream forwarding rules in sync with NAT mappings
#[derive(Parser, Debug)]
#[command(name = "fullcone")]
#[command(about = "Full-cone NAT for TCP through conntrack-driven nginx stream rules", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(long_version = concat!(env!("CARGO_PKG_VERSION"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Generated nginx configuration file
    #[arg(short = 'n', long, env = "FULLCONE_PROXY_CONF")]
    proxy_conf: Option<PathBuf>,

    /// Command that reloads nginx after the file changes
    #[arg(short, long, env = "FULLCONE_RELOAD_COMMAND")]
    reload_command: Option<String>,

    /// Path to the conntrack binary
    #[arg(short = 'c', long, env = "FULLCONE_CONNTRACK_BIN")]
    conntrack_bin_path: Option<PathBuf>,

    /// Internal network allowed to get full-cone mappings (repeatable)
    #[arg(short = 'i', long = "allowed-network", value_name = "CIDR")]
    allowed_networks: Vec<String>,

    /// Extra directives added to every generated server block
    #[arg(short, long)]
    additional_conf: Option<String>,

    /// Listen on this address instead of the translated one
    #[arg(long)]
    listen_address: Option<IpAddr>,

    /// External port pool (START-END)
    #[arg(long)]
    port_range: Option<String>,

    /// Do not seed state from the current conntrack table
    #[arg(long)]
    no_bootstrap: bool,

    /// YAML configuration file; flags override its values
    #[arg(long, env = "FULLCONE_CONFIG")]
    config: Option<PathBuf>,

    /// Print the effective configuration as YAML and exit
    #[arg(long)]
    print_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    /// Merge the config file (if any) with command-line overrides
    fn daemon_config(&self) -> Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::load(path)
                .with_context(|| format!("Failed to load config file {:?}", path))?,
            None => DaemonConfig::default(),
        };

        if let Some(proxy_conf) = &self.proxy_conf {
            config.proxy_conf = Some(proxy_conf.clone());
        }
        if let Some(reload_command) = &self.reload_command {
            config.reload_command = Some(reload_command.clone());
        }
        if let Some(bin) = &self.conntrack_bin_path {
            config.conntrack_bin = bin.clone();
        }
        if !self.allowed_networks.is_empty() {
            config.allowed_networks = self.allowed_networks.clone();
        }
        if let Some(additional_conf) = &self.additional_conf {
            config.additional_conf = additional_conf.clone();
        }
        if self.listen_address.is_some() {
            config.listen_address = self.listen_address;
        }
        if let Some(port_range) = &self.port_range {
            config.port_range = port_range.clone();
        }
        if self.no_bootstrap {
            config.bootstrap = false;
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let config = cli.daemon_config()?;
    if cli.print_config {
        print!(
            "{}",
            serde_yaml::to_string(&config).context("Failed to serialize configuration")?
        );
        return Ok(());
    }

    info!(
        "fullcone {} ({}, built {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIME")
    );

    let daemon = Daemon::new(config)
        .context("Invalid configuration")?
        .start()
        .await
        .context("Failed to start")?;

    match wait_for_shutdown().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(err) => error!("Error listening for shutdown signal: {}", err),
    }

    daemon.shutdown().await;
    Ok(())
}

/// Resolve on SIGINT or SIGTERM
async fn wait_for_shutdown() -> Result<()> {
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for SIGINT")?,
        _ = terminate.recv() => {}
    }

    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
