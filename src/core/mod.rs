//! Core simulation modules
//!
//! Contains the interrupt lock, dispatcher, task threads, tick source and
//! the reference task-selection policy.

pub mod config;
pub mod critical;
pub mod error;
pub mod isr;
pub mod kernel;
pub mod prio;
pub mod types;
pub mod task;
pub mod sched;
pub mod time;
