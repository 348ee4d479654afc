//! μC/OS-III host simulation port
//!
//! Runs the preemptive task model on a general purpose OS:
//! - Each task executes on its own native thread, started suspended
//! - Hardware interrupts are simulated through a pending register
//! - A dispatcher thread services pending lines in ascending order and
//!   performs task switches on behalf of the task-selection policy
//! - A tick thread raises the tick line periodically
//! - Critical sections mask simulated interrupts by holding a single lock

#![deny(unsafe_op_in_unsafe_fn)]

// ============ Logging backend ============

#[cfg(feature = "log")]
#[doc(hidden)]
pub use ::log as __log;

// ============ Modules ============

pub mod log;

pub mod core;
pub mod port;

// ============ Re-exports ============

pub use self::core::config;
pub use self::core::config::*;
pub use self::core::critical;
pub use self::core::critical::{critical_section, CriticalSection};
pub use self::core::error;
pub use self::core::error::{OsError, OsResult};
pub use self::core::isr;
pub use self::core::isr::{IntRegister, IsrHandler};
pub use self::core::kernel;
pub use self::core::kernel::Port;
pub use self::core::prio;
pub use self::core::types;
pub use self::core::types::*;
pub use self::core::task;
pub use self::core::task::{TaskHandle, TaskThread};
pub use self::core::sched;
pub use self::core::sched::{RoundRobin, TaskSelector};
pub use self::core::time;
