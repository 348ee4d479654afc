//! Error types for the host simulation
//!
//! Uses Rust's Result pattern instead of C-style error returns. Broken
//! simulation invariants (raising an out of range line, raising before the
//! scheduler runs) are not errors: they panic.

use thiserror::Error;

/// Port error type
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum OsError {
    // ============ Interrupt errors ============
    /// Interrupt line outside the pending register
    #[error("interrupt line out of range")]
    IntLineInvalid = 11001,

    // ============ Host errors ============
    /// Host reports a single logical processor
    #[error("the simulation port can only be used on multi-core hosts")]
    SingleCoreHost = 12001,
    /// Native thread could not be created
    #[error("native thread creation failed")]
    ThreadCreate = 12002,

    // ============ OS state errors ============
    /// OS is not running
    #[error("scheduler is not running")]
    OsNotRunning = 24201,
    /// OS is already running
    #[error("scheduler is already running")]
    OsRunning = 24202,
    /// Task-selection policy has nothing to run
    #[error("no task ready to run")]
    NoReadyTask = 24203,

    // ============ Priority errors ============
    /// Invalid priority
    #[error("invalid priority")]
    PrioInvalid = 25203,

    // ============ Task errors ============
    /// A task tried to delete itself through the cross-task path
    #[error("task cannot delete itself through delete_other")]
    TaskDelSelf = 29004,
}

/// Result type alias for port operations
pub type OsResult<T> = Result<T, OsError>;

impl OsError {
    /// Numeric error code
    #[inline]
    pub fn code(self) -> u16 {
        self as u16
    }
}
