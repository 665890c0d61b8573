//! Daemon assembly and lifecycle
//!
//! Startup runs the fatal checks first (proxy config path writable,
//! conntrack reachable and subscribed before the table is listed), then
//! spawns three tasks:
//!
//! - monitor: conntrack lines -> `FlowEvent`s on an mpsc channel
//! - engine: the single writer for flows and allocations
//! - controller: debounced render, write and reload
//!
//! Shutdown flows down the same chain. The monitor stops on the shutdown
//! signal and drops its sender, the engine drains the channel and drops the
//! snapshot sender, and the controller finishes its current cycle.

use crate::config::{ConfigError, DaemonConfig};
use fullcone_conntrack::{ConntrackCli, FlowMonitor, MonitorStats, SourceError};
use fullcone_control::{AllocationTable, Engine, EngineStats, FlowStore};
use fullcone_reload::{
    AtomicWriter, CommandReload, NginxRenderer, ReloadAction, ReloadController, ReloadStatus,
    WriteError,
};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Capacity of the monitor -> engine queue
const EVENT_QUEUE: usize = 1024;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Proxy configuration path is not writable: {0}")]
    ProxyConf(#[source] WriteError),

    #[error("conntrack event source unavailable: {0}")]
    EventSource(#[source] SourceError),
}

/// Final counters collected at shutdown
#[derive(Debug, Clone, Default)]
pub struct DaemonReport {
    pub monitor: MonitorStats,
    pub engine: EngineStats,
    pub reload: ReloadStatus,
}

pub struct Daemon<A = CommandReload> {
    config: DaemonConfig,
    action: A,
}

impl Daemon<CommandReload> {
    /// Validate the configuration and build the reload command from it
    pub fn new(config: DaemonConfig) -> Result<Self, DaemonError> {
        config.validate()?;
        let action = config.reload_action()?;
        Ok(Self { config, action })
    }
}

impl<A: ReloadAction + 'static> Daemon<A> {
    /// Use a custom reload action instead of the configured command
    pub fn with_action(config: DaemonConfig, action: A) -> Result<Self, DaemonError> {
        config.validate()?;
        Ok(Self { config, action })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Run the startup checks and spawn the daemon tasks
    pub async fn start(self) -> Result<RunningDaemon, DaemonError> {
        let Self { config, action } = self;
        let timings = &config.timings;

        let writer = AtomicWriter::new(config.proxy_conf()?);
        writer.probe().await.map_err(DaemonError::ProxyConf)?;

        let networks = config.networks()?;
        let pool = config.port_pool()?;
        let (start, end) = pool.range();
        info!(
            "Full-cone NAT for {} network(s), external ports {}-{}",
            networks.len(),
            start,
            end
        );

        let store = FlowStore::new(
            AllocationTable::new(pool, timings.allocation_cooldown()),
            timings.flow_grace(),
            timings.stale_after(),
        );
        let engine = Engine::new(store, timings.sweep_interval());
        let snapshots = engine.subscribe();

        // The engine must be draining before seeding, or a large table would
        // fill the queue
        let (tx, events) = mpsc::channel(EVENT_QUEUE);
        let engine_task = tokio::spawn(engine.run(events));

        let source = ConntrackCli::new(&config.conntrack_bin);
        let mut monitor = FlowMonitor::new(networks);

        // Subscribe before listing so a flow that ends in between is still
        // seen closing; its events wait in the pipe until the monitor runs
        let stream = source.subscribe().map_err(DaemonError::EventSource)?;
        if config.bootstrap {
            monitor
                .bootstrap(&source, &tx)
                .await
                .map_err(DaemonError::EventSource)?;
        } else {
            source.dump().await.map_err(DaemonError::EventSource)?;
        }
        info!("Watching conntrack events via {:?}", source.bin_path());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor_task = tokio::spawn(monitor.run(source, stream, tx, shutdown_rx));

        let renderer = NginxRenderer::new(config.additional_conf.clone())
            .with_listen_address(config.listen_address);
        let controller = ReloadController::new(
            renderer,
            writer,
            action,
            timings.reload_settings(),
        );
        let status = controller.status();
        let controller_task = tokio::spawn(controller.run(snapshots));

        Ok(RunningDaemon {
            shutdown_tx,
            status,
            monitor: monitor_task,
            engine: engine_task,
            controller: controller_task,
        })
    }
}

/// Handle to the spawned daemon tasks
pub struct RunningDaemon {
    shutdown_tx: watch::Sender<bool>,
    status: watch::Receiver<ReloadStatus>,
    monitor: JoinHandle<MonitorStats>,
    engine: JoinHandle<EngineStats>,
    controller: JoinHandle<ReloadStatus>,
}

impl RunningDaemon {
    /// Latest reload outcome
    pub fn status(&self) -> watch::Receiver<ReloadStatus> {
        self.status.clone()
    }

    /// Stop ingesting events and wait for the pipeline to drain
    pub async fn shutdown(self) -> DaemonReport {
        info!("Shutting down");
        let _ = self.shutdown_tx.send(true);

        let monitor = self.monitor.await.unwrap_or_else(|e| {
            error!("Flow monitor task failed: {}", e);
            MonitorStats::default()
        });
        let engine = self.engine.await.unwrap_or_else(|e| {
            error!("Engine task failed: {}", e);
            EngineStats::default()
        });
        let reload = self.controller.await.unwrap_or_else(|e| {
            error!("Reload controller task failed: {}", e);
            ReloadStatus::default()
        });

        if reload.consecutive_failures > 0 {
            warn!(
                "Exiting with {} consecutive reload failure(s); last error: {}",
                reload.consecutive_failures,
                reload.last_error.as_deref().unwrap_or("unknown")
            );
        }
        info!(
            "Processed {} event(s) ({} filtered, {} malformed), {} reload(s) applied",
            engine.events, monitor.filtered, monitor.malformed, reload.applied
        );

        DaemonReport {
            monitor,
            engine,
            reload,
        }
    }
}
