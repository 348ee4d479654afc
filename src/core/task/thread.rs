//! Task thread record
//!
//! Each task runs on its own native thread. The record pairs the thread
//! handle with a gate: the dispatcher closes the gate to switch the task
//! out, opens it to switch the task in, and posts the resume signal once a
//! scheduling decision is made. Closing the gate also parks the native
//! thread wherever it is running; port entries check the gate as well.

use std::fmt;
use std::ops::Deref;
use std::panic;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use portable_atomic::{AtomicBool, Ordering};

use crate::port::preempt::{self, Locked, NativeThread};
use crate::types::{TaskId, ThreadPriority, ThreadStatus};

/// Unwind payload ending a task thread
pub(crate) struct TaskExit;

/// Unwind the calling task thread back to its trampoline
pub(crate) fn exit_thread() -> ! {
    preempt::detach();
    panic::resume_unwind(Box::new(TaskExit))
}

#[derive(Debug)]
struct Gate {
    status: ThreadStatus,
    priority: ThreadPriority,
    /// Switched out; the thread stops at its next checkpoint
    suspended: bool,
    /// Resume signal: binary, auto-reset
    resume: bool,
    /// Terminated by another thread
    killed: bool,
    /// Native thread, known once it started
    native: Option<NativeThread>,
    /// Thread left its trampoline; it must not be signalled any more
    exited: bool,
}

impl Gate {
    /// Native thread that may still be signalled, other than the caller
    fn signal_target(&self) -> Option<NativeThread> {
        self.native
            .filter(|native| !self.exited && !native.is_current())
    }
}

/// Native thread backing one task
pub struct TaskThread {
    id: TaskId,
    name: String,
    thread: Mutex<Option<JoinHandle<()>>>,
    gate: Mutex<Gate>,
    cond: Condvar,
    /// Switched out or killed; read by the suspend signal handler
    halted: AtomicBool,
}

impl TaskThread {
    pub(crate) fn new(id: TaskId, name: &str) -> Self {
        Self {
            id,
            name: name.to_owned(),
            thread: Mutex::new(None),
            gate: Mutex::new(Gate {
                status: ThreadStatus::Suspended,
                priority: ThreadPriority::Task,
                suspended: true,
                resume: false,
                killed: false,
                native: None,
                exited: false,
            }),
            cond: Condvar::new(),
            halted: AtomicBool::new(true),
        }
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ThreadStatus {
        self.gate().status
    }

    pub fn priority(&self) -> ThreadPriority {
        self.gate().priority
    }

    /// Native handle still owned by the record
    ///
    /// False once the task deleted itself or was deleted.
    pub fn is_valid(&self) -> bool {
        preempt::lock(&self.thread).is_some()
    }

    fn gate(&self) -> Locked<'_, Gate> {
        preempt::lock(&self.gate)
    }

    fn wait_gate<'a, F>(&self, guard: Locked<'a, Gate>, condition: F) -> Locked<'a, Gate>
    where
        F: FnMut(&mut Gate) -> bool,
    {
        guard.wait_while(&self.cond, condition)
    }

    // ============ Native handle ============

    pub(crate) fn set_thread(&self, handle: JoinHandle<()>) {
        *preempt::lock(&self.thread) = Some(handle);
    }

    /// Take the native handle, invalidating the record
    pub(crate) fn take_thread(&self) -> Option<JoinHandle<()>> {
        preempt::lock(&self.thread).take()
    }

    /// Called first thing on the task's own thread
    pub(crate) fn attach_native(&self) {
        preempt::attach(&self.halted);
        self.gate().native = Some(NativeThread::current());
    }

    /// Called last thing on the task's own thread
    pub(crate) fn finish(&self) {
        preempt::detach();
        let mut gate = self.gate();
        gate.exited = true;
        gate.status = ThreadStatus::Deleted;
    }

    // ============ State changes ============

    pub(crate) fn set_status(&self, status: ThreadStatus) {
        self.gate().status = status;
    }

    /// Switched out or terminated; must not run task code
    pub(crate) fn is_switched_out(&self) -> bool {
        let gate = self.gate();
        gate.suspended || gate.killed
    }

    pub(crate) fn set_priority(&self, priority: ThreadPriority) {
        self.gate().priority = priority;
    }

    /// Switch out
    ///
    /// The thread is parked wherever it runs outside port code; inside port
    /// code it stops on leaving it, or at its next checkpoint.
    pub(crate) fn suspend(&self) {
        let mut gate = self.gate();
        gate.suspended = true;
        self.halted.store(true, Ordering::SeqCst);
        if gate.status == ThreadStatus::Running {
            gate.status = ThreadStatus::Suspended;
        }
        // Under the gate: the thread cannot exit meanwhile
        if let Some(native) = gate.signal_target() {
            native.post_suspend();
        }
    }

    /// Switch in
    pub(crate) fn resume(&self) {
        let mut gate = self.gate();
        gate.suspended = false;
        if gate.killed {
            return;
        }
        if gate.status == ThreadStatus::Suspended {
            gate.status = ThreadStatus::Running;
        }
        self.halted.store(false, Ordering::SeqCst);
        if let Some(native) = gate.signal_target() {
            native.post_resume();
        }
        drop(gate);
        self.cond.notify_all();
    }

    /// Terminate from another thread
    ///
    /// A thread waiting in port code unwinds; one running task code is
    /// parked for good, abandoning whatever it held.
    pub(crate) fn kill(&self) {
        let mut gate = self.gate();
        gate.killed = true;
        gate.status = ThreadStatus::Deleted;
        self.halted.store(true, Ordering::SeqCst);
        if let Some(native) = gate.signal_target() {
            native.post_suspend();
        }
        drop(gate);
        self.cond.notify_all();
    }

    // ============ Resume signal ============

    pub(crate) fn signal(&self) {
        self.gate().resume = true;
        self.cond.notify_all();
    }

    pub(crate) fn reset_signal(&self) {
        self.gate().resume = false;
    }

    /// Block until the dispatcher posts the resume signal to this task
    ///
    /// Must be called on the task's own thread.
    pub(crate) fn wait_signal(&self) {
        let guard = self.gate();
        let mut gate = self.wait_gate(guard, |g| !g.killed && (g.suspended || !g.resume));
        if gate.killed {
            // The suspend signal held back by the mask must not park us
            preempt::detach();
            drop(gate);
            exit_thread();
        }
        gate.resume = false;
    }

    /// Stop here while switched out
    ///
    /// Must be called on the task's own thread.
    pub(crate) fn checkpoint(&self) {
        let guard = self.gate();
        let gate = self.wait_gate(guard, |g| !g.killed && g.suspended);
        if gate.killed {
            // The suspend signal held back by the mask must not park us
            preempt::detach();
            drop(gate);
            exit_thread();
        }
    }
}

impl fmt::Debug for TaskThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskThread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("gate", &*self.gate())
            .finish()
    }
}

/// Shared handle to a task thread record
///
/// Handed to the task-selection policy; two handles are equal when they
/// refer to the same task.
#[derive(Clone)]
pub struct TaskHandle(pub(crate) Arc<TaskThread>);

impl TaskHandle {
    pub(crate) fn new(id: TaskId, name: &str) -> Self {
        TaskHandle(Arc::new(TaskThread::new(id, name)))
    }
}

impl Deref for TaskHandle {
    type Target = TaskThread;

    fn deref(&self) -> &TaskThread {
        &self.0
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for TaskHandle {}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskHandle({}, '{}')", self.id(), self.name())
    }
}
