//! Kernel connection-tracking event monitor
//!
//! Subscribes to `conntrack -E`, keeps only translated TCP flows from the
//! allowed networks, and emits normalized [`fullcone_proto::FlowEvent`]s.

pub mod monitor;
pub mod parser;
pub mod source;

pub use monitor::{FlowMonitor, MonitorStats, RestartPolicy, StreamEnd};
pub use parser::{parse_line, ConntrackEvent, EventKind, ParseError, Tuple};
pub use source::{ConntrackCli, EventStream, SourceError};
