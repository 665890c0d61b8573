//! Flow state store and lifecycle reaper
//!
//! The store owns every tracked flow and keeps the allocation table in
//! lockstep with flow transitions. Closing a flow never releases its
//! allocation directly: the flow sits in `Destroyed` for a grace period and
//! only [`FlowStore::reap`] drops the reference. A close followed quickly by
//! a reconnect therefore never touches the rule set.

use crate::allocation::{Acquisition, AllocationError, AllocationTable};
use fullcone_proto::{ConfigSnapshot, FlowEvent, FlowKey, FlowState};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A tracked NAT-translated TCP connection
#[derive(Debug, Clone)]
pub struct FlowRecord {
    pub key: FlowKey,
    pub translated: SocketAddr,
    pub external_port: u16,
    pub state: FlowState,
    pub last_seen: Instant,
    /// Kernel-reported lifetime at the last observation
    pub kernel_timeout: Option<Duration>,
    pub destroyed_at: Option<Instant>,
}

/// Result of applying one event to the store
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// New flow registered against an allocation
    Registered { port: u16, how: Acquisition },
    /// Known flow changed state or was refreshed
    Updated,
    /// Flow observed again while waiting to be reaped
    Revived,
    /// Flow moved to `Destroyed`
    Closed,
    /// Close for a flow the store never registered
    Unknown,
    /// Table dump reconciled; this many live flows were missing from it
    Resynced { closed: usize },
}

/// Outcome of one reaper sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Live flows declared dead for lack of kernel updates
    pub stale: usize,
    /// Destroyed flows removed from the store
    pub reaped: usize,
    /// External ports returned to the pool
    pub freed_ports: Vec<u16>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.stale == 0 && self.reaped == 0 && self.freed_ports.is_empty()
    }
}

pub struct FlowStore {
    flows: HashMap<FlowKey, FlowRecord>,
    table: AllocationTable,
    flow_grace: Duration,
    stale_after: Duration,
}

impl FlowStore {
    pub fn new(table: AllocationTable, flow_grace: Duration, stale_after: Duration) -> Self {
        Self {
            flows: HashMap::new(),
            table,
            flow_grace,
            stale_after,
        }
    }

    pub fn table(&self) -> &AllocationTable {
        &self.table
    }

    pub fn flow(&self, key: &FlowKey) -> Option<&FlowRecord> {
        self.flows.get(key)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn live_flows(&self) -> usize {
        self.flows.values().filter(|f| f.state.is_live()).count()
    }

    /// Generation of the underlying allocation table
    pub fn generation(&self) -> u64 {
        self.table.generation()
    }

    pub fn snapshot(&self) -> ConfigSnapshot {
        self.table.snapshot()
    }

    /// Apply one normalized event
    ///
    /// On `PortSpaceExhausted` the flow is not registered; a later event for
    /// the same identity tries again.
    pub fn apply(&mut self, event: FlowEvent, now: Instant) -> Result<Applied, AllocationError> {
        match event {
            FlowEvent::Observed {
                key,
                translated,
                state,
                timeout,
            } => {
                if state == FlowState::Destroyed {
                    return Ok(self.close(&key, now));
                }
                self.observe(key, translated, state, timeout, now)
            }
            FlowEvent::Closed { key } => Ok(self.close(&key, now)),
            FlowEvent::Resync { live } => Ok(Applied::Resynced {
                closed: self.resync(&live, now),
            }),
        }
    }

    pub fn observe(
        &mut self,
        key: FlowKey,
        translated: SocketAddr,
        state: FlowState,
        timeout: Option<Duration>,
        now: Instant,
    ) -> Result<Applied, AllocationError> {
        if let Some(flow) = self.flows.get_mut(&key) {
            let revived = flow.state == FlowState::Destroyed;
            flow.state = state;
            flow.last_seen = now;
            flow.kernel_timeout = timeout;
            flow.destroyed_at = None;

            if revived {
                debug!("Flow {} revived as {}", key, state);
                return Ok(Applied::Revived);
            }
            debug!("Flow {} now {}", key, state);
            return Ok(Applied::Updated);
        }

        let (port, how) = self.table.acquire(key.internal, translated)?;
        debug!("Flow {} registered on external port {} ({})", key, port, state);

        self.flows.insert(
            key,
            FlowRecord {
                key,
                translated,
                external_port: port,
                state,
                last_seen: now,
                kernel_timeout: timeout,
                destroyed_at: None,
            },
        );

        Ok(Applied::Registered { port, how })
    }

    pub fn close(&mut self, key: &FlowKey, now: Instant) -> Applied {
        match self.flows.get_mut(key) {
            Some(flow) => {
                if flow.state != FlowState::Destroyed {
                    flow.state = FlowState::Destroyed;
                    flow.destroyed_at = Some(now);
                    debug!("Flow {} destroyed", key);
                }
                Applied::Closed
            }
            None => Applied::Unknown,
        }
    }

    /// Close every live flow that is not in `live`
    ///
    /// Closed flows go through the normal grace period, so one that shows up
    /// again in the event stream is revived. Returns the number closed.
    pub fn resync(&mut self, live: &HashSet<FlowKey>, now: Instant) -> usize {
        let gone: Vec<FlowKey> = self
            .flows
            .values()
            .filter(|flow| flow.state.is_live() && !live.contains(&flow.key))
            .map(|flow| flow.key)
            .collect();

        for key in &gone {
            debug!("Flow {} missing from conntrack table", key);
            self.close(key, now);
        }
        gone.len()
    }

    fn is_stale(&self, flow: &FlowRecord, now: Instant) -> bool {
        let threshold = flow
            .kernel_timeout
            .map_or(self.stale_after, |t| t.max(self.stale_after));
        now.saturating_duration_since(flow.last_seen) >= threshold
    }

    /// One reaper sweep
    ///
    /// Marks silent flows as destroyed, removes destroyed flows past the
    /// grace period and releases their references, then expires allocations
    /// whose cool-down has run out.
    pub fn reap(&mut self, now: Instant) -> ReapReport {
        let mut report = ReapReport::default();

        let stale: Vec<FlowKey> = self
            .flows
            .values()
            .filter(|flow| flow.state.is_live() && self.is_stale(flow, now))
            .map(|flow| flow.key)
            .collect();
        for key in stale {
            debug!("Flow {} went stale", key);
            self.close(&key, now);
            report.stale += 1;
        }

        let grace = self.flow_grace;
        let expired: Vec<FlowKey> = self
            .flows
            .values()
            .filter(|flow| {
                flow.destroyed_at
                    .is_some_and(|at| now.saturating_duration_since(at) >= grace)
            })
            .map(|flow| flow.key)
            .collect();
        for key in expired {
            if self.flows.remove(&key).is_some() {
                if let Err(e) = self.table.release(&key.internal, now) {
                    warn!("Reaped flow {} had no allocation: {}", key, e);
                }
                report.reaped += 1;
            }
        }

        report.freed_ports = self
            .table
            .expire(now)
            .into_iter()
            .map(|allocation| allocation.port())
            .collect();

        report
    }
}
