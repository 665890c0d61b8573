//! Single-writer reconciliation engine
//!
//! The engine task is the only code that mutates flows and allocations. It
//! consumes monitor events and periodic reaper ticks, and publishes the
//! current rule snapshot on a watch channel whenever the allocation
//! generation moves. The watch channel is the coalesced dirty signal: a
//! slow reader only ever sees the latest snapshot.

use crate::allocation::{Acquisition, AllocationError};
use crate::store::{Applied, FlowStore};
use fullcone_proto::{ConfigSnapshot, FlowEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Counters kept by the engine loop
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub events: u64,
    pub registered: u64,
    pub dropped: u64,
    pub reaped: u64,
    /// Live flows closed because a table dump no longer listed them
    pub resynced: u64,
    pub ports_freed: u64,
    pub published: u64,
}

pub struct Engine {
    store: FlowStore,
    sweep_interval: Duration,
    published_generation: u64,
    snapshot_tx: watch::Sender<Arc<ConfigSnapshot>>,
    stats: EngineStats,
}

impl Engine {
    pub fn new(store: FlowStore, sweep_interval: Duration) -> Self {
        let published_generation = store.generation();
        let (snapshot_tx, _) = watch::channel(Arc::new(store.snapshot()));

        Self {
            store,
            sweep_interval,
            published_generation,
            snapshot_tx,
            stats: EngineStats::default(),
        }
    }

    /// Receiver for the coalesced snapshot signal
    pub fn subscribe(&self) -> watch::Receiver<Arc<ConfigSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    pub fn store(&self) -> &FlowStore {
        &self.store
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Apply one event and publish if the rule set changed
    pub fn handle(&mut self, event: FlowEvent, now: Instant) {
        self.stats.events += 1;
        let key = match event.key() {
            Some(key) => key.to_string(),
            None => "conntrack table".to_string(),
        };

        match self.store.apply(event, now) {
            Ok(Applied::Registered { port, how }) => {
                self.stats.registered += 1;
                if how == Acquisition::Created {
                    debug!("New mapping for {} on external port {}", key, port);
                }
            }
            Ok(Applied::Unknown) => {
                debug!("Ignoring close for untracked flow {}", key);
            }
            Ok(Applied::Resynced { closed }) => {
                self.stats.resynced += closed as u64;
                if closed > 0 {
                    info!("Closed {} flow(s) missing from the conntrack table", closed);
                }
            }
            Ok(_) => {}
            Err(e @ AllocationError::PortSpaceExhausted { .. }) => {
                self.stats.dropped += 1;
                warn!("Dropping flow {}: {}", key, e);
            }
            Err(e) => {
                warn!("Failed to apply event for {}: {}", key, e);
            }
        }

        self.publish();
    }

    /// Run one reaper sweep and publish if the rule set changed
    pub fn sweep(&mut self, now: Instant) {
        let report = self.store.reap(now);
        if !report.is_empty() {
            debug!(
                "Reaper: {} stale, {} reaped, {} port(s) freed",
                report.stale,
                report.reaped,
                report.freed_ports.len()
            );
        }
        self.stats.reaped += report.reaped as u64;
        self.stats.ports_freed += report.freed_ports.len() as u64;

        self.publish();
    }

    fn publish(&mut self) {
        let generation = self.store.generation();
        if generation == self.published_generation {
            return;
        }

        self.published_generation = generation;
        self.stats.published += 1;
        self.snapshot_tx.send_replace(Arc::new(self.store.snapshot()));
    }

    /// Consume events until the monitor hangs up
    ///
    /// Dropping the engine on return closes the snapshot channel, which tells
    /// the reload controller to finish up.
    pub async fn run(mut self, mut events: mpsc::Receiver<FlowEvent>) -> EngineStats {
        let mut ticker = tokio::time::interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Reconciliation engine started (sweep every {:?})",
            self.sweep_interval
        );

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle(event, Instant::now()),
                    None => break,
                },
                _ = ticker.tick() => self.sweep(Instant::now()),
            }
        }

        info!(
            "Reconciliation engine stopped: {} flow(s), {} allocation(s)",
            self.store.len(),
            self.store.table().len()
        );
        self.stats
    }
}
