//! Flow state and allocation control plane
//!
//! Owns the mutable NAT state: the allocation table mapping internal
//! endpoints to external ports, the flow store that references it, and the
//! single-writer engine task that applies monitor events and reaper sweeps.
pub mod allocation;
pub mod engine;
pub mod store;

pub use allocation::{
    Acquisition, Allocation, AllocationError, AllocationState, AllocationTable, PortPool,
    PortRangeError,
};
pub use engine::{Engine, EngineStats};
pub use store::{Applied, FlowRecord, FlowStore, ReapReport};
