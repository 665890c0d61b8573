//! Proxy configuration reconciliation
//!
//! Turns rule snapshots into an nginx include file, writes it atomically and
//! asks the proxy to reload. Bursts of snapshot changes are debounced into a
//! single write and reload.

pub mod action;
pub mod controller;
pub mod render;
pub mod writer;

pub use action::{CommandReload, ReloadAction, ReloadError};
pub use controller::{Cycle, ReloadController, ReloadSettings, ReloadStatus};
pub use render::NginxRenderer;
pub use writer::{AtomicWriter, WriteError};
