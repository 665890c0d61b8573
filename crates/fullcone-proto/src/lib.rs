//! Shared flow types for the full-cone NAT reconciler
//!
//! Everything that crosses a crate boundary lives here: the normalized flow
//! events produced by the conntrack monitor, the allowed-network filter that
//! bounds which internal hosts may consume external ports, and the derived
//! rule snapshot handed from the engine to the reload controller.

pub mod flow;
pub mod networks;
pub mod snapshot;

pub use flow::{FlowEvent, FlowKey, FlowState};
pub use networks::{AllowedNetworks, NetworkError};
pub use snapshot::{ConfigSnapshot, ForwardRule};
