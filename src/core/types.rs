//! Core type definitions for the host simulation
//!
//! These types provide strong typing for port primitives.

/// Simulated interrupt line index (bit position in the pending register)
pub type IntLine = u32;

/// Task priority for the reference policy (0 = highest priority)
pub type OsPrio = u8;

/// Tick counter type
pub type OsTick = u32;

/// Critical section nesting counter
pub type OsNestingCtr = u32;

/// Identifier assigned to every task thread by its port
pub type TaskId = u32;

/// Logical priority of a thread created by the port
///
/// The host scheduler cannot be told about these levels portably; they
/// document the intended ordering and are reported through logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ThreadPriority {
    /// Ordinary task threads
    Task = 0,
    /// Tick source thread
    Timer = 1,
    /// Dispatcher thread, above everything that runs tasks
    Interrupts = 2,
    /// A task tearing itself down must not be switched out
    DeleteSelf = 3,
}

/// Lifecycle state of a task thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadStatus {
    /// Created, or switched out by the dispatcher
    Suspended = 0,
    /// Allowed to run
    Running = 1,
    /// Deleting itself; the thread never returns to task code
    Terminating = 2,
    /// Thread has finished or was killed
    Deleted = 3,
}

impl ThreadStatus {
    /// Still able to execute task code
    #[inline]
    pub fn is_alive(self) -> bool {
        matches!(self, ThreadStatus::Suspended | ThreadStatus::Running)
    }
}
