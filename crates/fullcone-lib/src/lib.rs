//! Full-cone NAT reconciler - public API
//!
//! Watches kernel connection tracking for translated TCP flows and keeps an
//! nginx `stream` include file forwarding each internal endpoint's external
//! port back to it, reloading nginx when the rule set changes.
//!
//! # Quick Start
//!
//! ```ignore
//! use fullcone_lib::{Daemon, DaemonConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DaemonConfig {
//!         proxy_conf: Some("/etc/nginx/fullcone.conf".into()),
//!         reload_command: Some("nginx -s reload".to_string()),
//!         allowed_networks: vec!["192.168.25.0/24".to_string()],
//!         ..Default::default()
//!     };
//!
//!     let daemon = Daemon::new(config)?.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     daemon.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod daemon;

pub use config::{ConfigError, DaemonConfig, Timings};
pub use daemon::{Daemon, DaemonError, DaemonReport, RunningDaemon};

// Re-export the building blocks
pub use fullcone_conntrack::{
    ConntrackCli, FlowMonitor, MonitorStats, RestartPolicy, SourceError,
};
pub use fullcone_control::{
    Acquisition, AllocationError, AllocationTable, Engine, EngineStats, FlowStore, PortPool,
};
pub use fullcone_proto::{
    AllowedNetworks, ConfigSnapshot, FlowEvent, FlowKey, FlowState, ForwardRule,
};
pub use fullcone_reload::{
    AtomicWriter, CommandReload, NginxRenderer, ReloadAction, ReloadController, ReloadError,
    ReloadSettings, ReloadStatus,
};
