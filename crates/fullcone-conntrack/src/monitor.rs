//! Flow event monitor
//!
//! Turns raw conntrack lines into normalized [`FlowEvent`]s and pushes them
//! onto the engine channel. The monitor holds no NAT state of its own: it
//! filters, normalizes and forwards.

use crate::parser::{parse_line, ConntrackEvent, EventKind};
use crate::source::{ConntrackCli, EventStream, SourceError};
use fullcone_proto::{AllowedNetworks, FlowEvent, FlowKey, FlowState};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Counters kept by the monitor loop
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorStats {
    pub forwarded: u64,
    pub filtered: u64,
    pub malformed: u64,
    pub restarts: u64,
}

impl MonitorStats {
    /// Every line read, whatever became of it
    pub fn lines(&self) -> u64 {
        self.forwarded + self.filtered + self.malformed
    }
}

/// Why a stream of lines stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The producer closed its output
    Eof,
    /// The engine dropped its receiver
    ReceiverClosed,
    /// Shutdown was requested
    Shutdown,
}

/// Delays between event source restarts
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

pub struct FlowMonitor {
    networks: AllowedNetworks,
    restart: RestartPolicy,
    stats: MonitorStats,
}

impl FlowMonitor {
    pub fn new(networks: AllowedNetworks) -> Self {
        Self {
            networks,
            restart: RestartPolicy::default(),
            stats: MonitorStats::default(),
        }
    }

    pub fn with_restart_policy(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    pub fn stats(&self) -> &MonitorStats {
        &self.stats
    }

    /// Decide whether a raw entry is a full-cone candidate and normalize it
    ///
    /// Returns `None` for non-TCP entries, entries without ports, internal
    /// hosts outside the allowed networks, and entries the kernel did not
    /// translate.
    pub fn classify(&self, event: &ConntrackEvent) -> Option<FlowEvent> {
        if event.protocol != "tcp" {
            return None;
        }

        let (Some(sport), Some(dport)) = (event.original.sport, event.original.dport) else {
            return None;
        };
        let Some(translated_port) = event.reply.dport else {
            return None;
        };

        let internal = SocketAddr::new(event.original.src, sport);
        if !self.networks.contains_socket(&internal) {
            return None;
        }

        // The reply goes back to the internal host itself: no NAT was performed
        if event.reply.dst == event.original.src {
            return None;
        }

        let key = FlowKey::new(internal, SocketAddr::new(event.original.dst, dport));

        if event.kind == EventKind::Destroy {
            return Some(FlowEvent::Closed { key });
        }

        let state = event
            .tcp_state
            .as_deref()
            .and_then(FlowState::from_tcp_state)
            .unwrap_or(FlowState::New);

        Some(FlowEvent::Observed {
            key,
            translated: SocketAddr::new(event.reply.dst, translated_port),
            state,
            timeout: event.timeout,
        })
    }

    /// Parse and classify one raw line, counting what was dropped
    fn accept_line(&mut self, line: &str) -> Option<FlowEvent> {
        if line.trim().is_empty() {
            return None;
        }

        let raw = match parse_line(line) {
            Ok(raw) => raw,
            Err(e) => {
                self.stats.malformed += 1;
                warn!("Skipping malformed conntrack line ({}): {}", e, line.trim());
                return None;
            }
        };

        match self.classify(&raw) {
            Some(event) => {
                self.stats.forwarded += 1;
                Some(event)
            }
            None => {
                self.stats.filtered += 1;
                None
            }
        }
    }

    /// Parse, classify and forward one raw line
    ///
    /// Returns `false` once the receiver is gone.
    async fn forward_line(&mut self, line: &str, tx: &mpsc::Sender<FlowEvent>) -> bool {
        match self.accept_line(line) {
            Some(event) => {
                trace!("Forwarding flow event: {:?}", event);
                tx.send(event).await.is_ok()
            }
            None => true,
        }
    }

    /// Forward every line of `reader` until it ends or the receiver closes
    pub async fn forward_lines<R>(
        &mut self,
        reader: R,
        tx: &mpsc::Sender<FlowEvent>,
    ) -> std::io::Result<StreamEnd>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            if !self.forward_line(&line, tx).await {
                return Ok(StreamEnd::ReceiverClosed);
            }
        }
        Ok(StreamEnd::Eof)
    }

    /// Seed the engine with the entries currently in the kernel table
    ///
    /// Every listed flow is forwarded, followed by a [`FlowEvent::Resync`]
    /// naming them all so the engine can close flows that ended while no
    /// subscription was running. Call this after `subscribe` so that no
    /// event falls between the dump and the stream.
    pub async fn bootstrap(
        &mut self,
        source: &ConntrackCli,
        tx: &mpsc::Sender<FlowEvent>,
    ) -> Result<usize, SourceError> {
        let lines = source.dump().await?;
        let mut live = HashSet::new();

        for line in &lines {
            let Some(event) = self.accept_line(line) else {
                continue;
            };
            if let FlowEvent::Observed { key, .. } = &event {
                live.insert(*key);
            }
            if tx.send(event).await.is_err() {
                return Ok(live.len());
            }
        }

        let seeded = live.len();
        info!(
            "Seeded {} flow(s) from {} conntrack entries",
            seeded,
            lines.len()
        );
        if tx.send(FlowEvent::Resync { live }).await.is_err() {
            debug!("Engine gone before the table dump was reconciled");
        }
        Ok(seeded)
    }

    async fn pump(
        &mut self,
        stream: &mut EventStream,
        tx: &mpsc::Sender<FlowEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> StreamEnd {
        loop {
            tokio::select! {
                _ = shutdown.changed() => return StreamEnd::Shutdown,
                line = stream.next_line() => match line {
                    Ok(Some(line)) => {
                        if !self.forward_line(&line, tx).await {
                            return StreamEnd::ReceiverClosed;
                        }
                    }
                    Ok(None) => return StreamEnd::Eof,
                    Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                        // Non-UTF-8 line; the pipe itself is still usable
                        self.stats.malformed += 1;
                        warn!("Skipping unreadable conntrack line: {}", e);
                    }
                    Err(e) => {
                        error!("Failed to read conntrack events: {}", e);
                        return StreamEnd::Eof;
                    }
                },
            }
        }
    }

    /// Run the monitor until shutdown or until the engine stops listening
    ///
    /// `stream` is the subscription opened during startup. When the
    /// conntrack process exits on its own, the subscription is reopened with
    /// capped exponential backoff and the table is re-seeded.
    pub async fn run(
        mut self,
        source: ConntrackCli,
        stream: EventStream,
        tx: mpsc::Sender<FlowEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> MonitorStats {
        let mut current = Some(stream);
        let mut delay = self.restart.initial;

        loop {
            if let Some(mut stream) = current.take() {
                let started = Instant::now();
                let lines_before = self.stats.lines();
                let end = self.pump(&mut stream, &tx, &mut shutdown).await;
                stream.stop().await;

                match end {
                    StreamEnd::Shutdown | StreamEnd::ReceiverClosed => {
                        info!("Flow monitor stopping ({:?})", end);
                        break;
                    }
                    StreamEnd::Eof => {
                        // Only a stream that delivered something, or stayed up
                        // for a while, earns a fresh backoff
                        if self.stats.lines() > lines_before
                            || started.elapsed() >= self.restart.max
                        {
                            delay = self.restart.initial;
                        }
                        warn!(
                            "conntrack event stream ended unexpectedly, restarting in {:?}",
                            delay
                        );
                    }
                }
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(self.restart.max);
            self.stats.restarts += 1;

            match source.subscribe() {
                Ok(stream) => {
                    if let Err(e) = self.bootstrap(&source, &tx).await {
                        warn!("Failed to re-seed flows after restart: {}", e);
                    }
                    current = Some(stream);
                }
                Err(e) => {
                    error!("Failed to restart conntrack event stream: {}", e);
                }
            }
        }

        debug!("Flow monitor stats: {:?}", self.stats);
        self.stats
    }
}
