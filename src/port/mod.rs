//! Port layer - host-specific implementations
//!
//! This module provides the host abstraction the simulation runs on:
//! processor discovery and affinity, thread naming and priorities, and the
//! task switch performed by the dispatcher, backed by asynchronous
//! suspension of task threads.

pub mod host;
pub(crate) mod preempt;

pub use host::*;
