//! Debounced reload controller
//!
//! Reconciliation cycle:
//!
//! ```text
//! IDLE --dirty--> DEBOUNCING --quiet--> RENDERING --same--> IDLE
//!                                           |
//!                                         changed
//!                                           v
//!                                WRITING --> RELOADING --> IDLE
//! ```
//!
//! The controller only reads snapshots. A failed write or reload leaves the
//! previously applied document as the live one and schedules a retry with
//! exponential backoff; dirty signals arriving before the retry deadline are
//! folded into that retry.

use crate::action::{ReloadAction, ReloadError};
use crate::render::NginxRenderer;
use crate::writer::AtomicWriter;
use chrono::{DateTime, Utc};
use fullcone_proto::ConfigSnapshot;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct ReloadSettings {
    /// Quiet period required after the last dirty signal
    pub debounce: Duration,
    /// Upper bound on how long a steady stream of signals can defer a cycle
    pub max_debounce: Duration,
    pub retry_initial: Duration,
    pub retry_max: Duration,
}

impl Default for ReloadSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(200),
            max_debounce: Duration::from_secs(2),
            retry_initial: Duration::from_secs(1),
            retry_max: Duration::from_secs(60),
        }
    }
}

/// Outcome of the reconciliation cycles so far
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReloadStatus {
    pub applied: u64,
    pub unchanged: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_applied_at: Option<DateTime<Utc>>,
    /// Rule count of the live document
    pub live_rules: usize,
}

/// Result of a single reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    Unchanged,
    Applied,
    Failed,
}

pub struct ReloadController<A> {
    renderer: NginxRenderer,
    writer: AtomicWriter,
    action: A,
    settings: ReloadSettings,
    /// Document the running proxy is known to have loaded
    live: Option<String>,
    /// Document currently on disk
    on_disk: Option<String>,
    backoff: Duration,
    retry_at: Option<Instant>,
    status_tx: watch::Sender<ReloadStatus>,
}

impl<A: ReloadAction> ReloadController<A> {
    pub fn new(
        renderer: NginxRenderer,
        writer: AtomicWriter,
        action: A,
        settings: ReloadSettings,
    ) -> Self {
        let (status_tx, _) = watch::channel(ReloadStatus::default());
        Self {
            renderer,
            writer,
            action,
            backoff: settings.retry_initial,
            settings,
            live: None,
            on_disk: None,
            retry_at: None,
            status_tx,
        }
    }

    pub fn status(&self) -> watch::Receiver<ReloadStatus> {
        self.status_tx.subscribe()
    }

    /// Render, compare, write and reload once
    pub async fn reconcile(&mut self, snapshot: &ConfigSnapshot) -> Cycle {
        let document = self.renderer.render(snapshot);

        if self.live.as_deref() == Some(document.as_str()) {
            // A failed cycle may have left a newer file behind; put the live one back
            if self.on_disk != self.live {
                match self.writer.write(&document).await {
                    Ok(()) => self.on_disk = Some(document),
                    Err(e) => warn!("Failed to restore live configuration: {}", e),
                }
            }
            self.retry_at = None;
            self.backoff = self.settings.retry_initial;
            self.status_tx.send_modify(|s| s.unchanged += 1);
            debug!("Configuration unchanged ({} rules), skipping reload", snapshot.len());
            return Cycle::Unchanged;
        }

        match self.write_and_reload(&document).await {
            Ok(()) => {
                info!(
                    "Applied proxy configuration with {} rule(s) to {:?}",
                    snapshot.len(),
                    self.writer.path()
                );
                self.live = Some(document);
                self.retry_at = None;
                self.backoff = self.settings.retry_initial;
                self.status_tx.send_modify(|s| {
                    s.applied += 1;
                    s.consecutive_failures = 0;
                    s.last_error = None;
                    s.last_applied_at = Some(Utc::now());
                    s.live_rules = snapshot.len();
                });
                Cycle::Applied
            }
            Err(e) => {
                let delay = self.backoff;
                self.retry_at = Some(Instant::now() + delay);
                self.backoff = (self.backoff * 2).min(self.settings.retry_max);

                let message = e.to_string();
                self.status_tx.send_modify(|s| {
                    s.failures += 1;
                    s.consecutive_failures += 1;
                    s.last_error = Some(message);
                });
                error!(
                    "Reload via '{}' failed, keeping previous configuration live; retrying in {:?}: {}",
                    self.action.describe(),
                    delay,
                    e
                );
                Cycle::Failed
            }
        }
    }

    async fn write_and_reload(&mut self, document: &str) -> Result<(), ReloadError> {
        self.writer.write(document).await?;
        self.on_disk = Some(document.to_string());
        self.action.apply().await
    }

    /// Wait for the signal to go quiet; returns `false` if the sender is gone
    async fn debounce(&self, rx: &mut watch::Receiver<Arc<ConfigSnapshot>>) -> bool {
        let cap = Instant::now() + self.settings.max_debounce;
        let mut deadline = (Instant::now() + self.settings.debounce).min(cap);

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                changed = rx.changed() => match changed {
                    Ok(()) => deadline = (Instant::now() + self.settings.debounce).min(cap),
                    Err(_) => return false,
                },
            }
        }
    }

    /// Hold until the retry deadline, absorbing signals meanwhile
    async fn hold_until(&self, at: Instant, rx: &mut watch::Receiver<Arc<ConfigSnapshot>>) -> bool {
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(at) => return true,
                changed = rx.changed() => if changed.is_err() {
                    return false;
                },
            }
        }
    }

    /// Drive reconciliation cycles until the snapshot sender is dropped
    ///
    /// The first cycle runs unconditionally so that rules left behind by a
    /// previous process are replaced. A cycle already past its debounce
    /// window completes during shutdown; a pending backoff retry does not.
    pub async fn run(mut self, mut rx: watch::Receiver<Arc<ConfigSnapshot>>) -> ReloadStatus {
        let mut pending = true;
        let mut open = true;

        info!(
            "Reload controller started for {:?} (debounce {:?})",
            self.writer.path(),
            self.settings.debounce
        );

        loop {
            if !pending {
                if !open {
                    break;
                }

                match self.retry_at {
                    Some(at) => {
                        tokio::select! {
                            changed = rx.changed() => match changed {
                                Ok(()) => pending = true,
                                Err(_) => open = false,
                            },
                            _ = tokio::time::sleep_until(at) => pending = true,
                        }
                    }
                    None => match rx.changed().await {
                        Ok(()) => pending = true,
                        Err(_) => open = false,
                    },
                }
                continue;
            }

            if open {
                open = self.debounce(&mut rx).await;
            }

            if let Some(at) = self.retry_at {
                if !open || !self.hold_until(at, &mut rx).await {
                    debug!("Shutting down with a reload retry pending");
                    break;
                }
            }

            let snapshot = rx.borrow_and_update().clone();
            pending = false;
            self.reconcile(&snapshot).await;
        }

        let status = self.status_tx.borrow().clone();
        info!(
            "Reload controller stopped: {} applied, {} failed",
            status.applied, status.failures
        );
        status
    }
}
