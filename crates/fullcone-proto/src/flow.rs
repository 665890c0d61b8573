//! Normalized flow lifecycle events

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// Identity of one NAT-translated TCP connection
///
/// `internal` is the pre-NAT source endpoint on the LAN side, `peer` is the
/// remote endpoint the internal host connected to. Two connections from the
/// same internal endpoint to different peers are different flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey {
    pub internal: SocketAddr,
    pub peer: SocketAddr,
}

impl FlowKey {
    pub fn new(internal: SocketAddr, peer: SocketAddr) -> Self {
        Self { internal, peer }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.internal, self.peer)
    }
}

/// Lifecycle state of a tracked flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowState {
    New,
    Established,
    Closing,
    Destroyed,
}

impl FlowState {
    /// Map a kernel TCP conntrack state name onto the flow lifecycle
    ///
    /// Unknown names return `None`; the caller decides the fallback.
    pub fn from_tcp_state(name: &str) -> Option<Self> {
        match name {
            "NONE" | "SYN_SENT" | "SYN_SENT2" | "SYN_RECV" => Some(FlowState::New),
            "ESTABLISHED" => Some(FlowState::Established),
            "FIN_WAIT" | "CLOSE_WAIT" | "LAST_ACK" | "TIME_WAIT" | "CLOSE" => {
                Some(FlowState::Closing)
            }
            _ => None,
        }
    }

    pub fn is_live(&self) -> bool {
        !matches!(self, FlowState::Destroyed)
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlowState::New => "new",
            FlowState::Established => "established",
            FlowState::Closing => "closing",
            FlowState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// A normalized event emitted by the flow monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowEvent {
    /// Flow created or its state changed
    Observed {
        key: FlowKey,
        /// Post-NAT endpoint the kernel picked for this flow
        translated: SocketAddr,
        state: FlowState,
        /// Remaining lifetime of the kernel entry, when reported
        timeout: Option<Duration>,
    },
    /// Flow torn down (close, reset or kernel timeout)
    Closed { key: FlowKey },
    /// Complete set of flows in a fresh table dump
    ///
    /// Sent after the dump's `Observed` events. Any live flow not in `live`
    /// ended while nobody was listening and is closed.
    Resync { live: HashSet<FlowKey> },
}

impl FlowEvent {
    /// The flow this event is about; `None` for table-wide events
    pub fn key(&self) -> Option<&FlowKey> {
        match self {
            FlowEvent::Observed { key, .. } => Some(key),
            FlowEvent::Closed { key } => Some(key),
            FlowEvent::Resync { .. } => None,
        }
    }
}
