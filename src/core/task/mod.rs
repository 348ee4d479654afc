//! Task management
//!
//! Creating task threads, and deleting them either from another task or
//! from the task's own thread.

mod thread;

pub use thread::{TaskHandle, TaskThread};

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use portable_atomic::{AtomicBool, Ordering};

use crate::error::{OsError, OsResult};
use crate::kernel::{self, Port, PortShared};
use crate::port;
use crate::types::{ThreadPriority, ThreadStatus};
use thread::TaskExit;

/// Task owning the calling thread, if any
pub fn this_task() -> Option<TaskHandle> {
    kernel::bound_task()
}

/// Point where a pending switch-out of the calling task takes effect
///
/// On unix a switched-out task is parked by a signal wherever it runs. Other
/// hosts cannot stop a thread from outside, so there the task keeps running
/// until it reaches a checkpoint. Every port entry (critical sections,
/// raising interrupts) is one; long computations should call this
/// periodically. No-op on threads that are not tasks.
#[inline]
pub fn preemption_point() {
    kernel::checkpoint_this();
}

impl Port {
    /// Create the native thread for a task
    ///
    /// The thread starts suspended and runs `entry` only once the dispatcher
    /// switches the task in.
    ///
    /// # Returns
    /// * `Ok(handle)` - Thread created
    /// * `Err(OsError::ThreadCreate)` - Host refused to create the thread
    pub fn create_task_thread<F>(&self, name: &str, entry: F) -> OsResult<TaskHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let task = TaskHandle::new(self.next_task_id(), name);
        let port = Arc::downgrade(&self.inner);
        let runner = task.clone();

        let handle = std::thread::Builder::new()
            .name(port::thread_name(self.config().prefix(), name))
            .spawn(move || task_main(port, runner, entry))
            .map_err(|err| {
                crate::error!("failed to create thread for task '{}': {}", name, err);
                OsError::ThreadCreate
            })?;
        task.set_thread(handle);
        port::set_thread_priority(task.name(), ThreadPriority::Task);

        {
            let mut st = self.state();
            st.prune_tasks();
            st.tasks.push(Arc::downgrade(&task.0));
        }

        crate::debug!("created task '{}' (id {})", task.name(), task.id());
        Ok(task)
    }

    /// Delete a task from another task
    ///
    /// The target's thread is terminated and its handle closed. On unix the
    /// thread is parked for good at once; elsewhere it unwinds at its next
    /// checkpoint. Anything it held is abandoned, so
    /// deleting tasks this way leaks resources. A task that already deleted
    /// itself is left alone.
    ///
    /// # Returns
    /// * `Ok(())` - Task deleted, or nothing left to delete
    /// * `Err(OsError::TaskDelSelf)` - `task` is the calling task
    pub fn delete_other(&self, task: &TaskHandle) -> OsResult<()> {
        if this_task().as_ref() == Some(task) {
            return Err(OsError::TaskDelSelf);
        }

        let Some(thread) = task.take_thread() else {
            return Ok(());
        };

        let st = self.lock_interrupts(std::thread::current().id());
        task.kill();
        drop(thread);
        drop(st);
        self.notify();

        crate::warn!(
            "task '{}' terminated by another task; its thread resources are leaked",
            task.name()
        );
        Ok(())
    }

    /// Delete the calling task from its own thread
    ///
    /// Sets `pend_yield` so the next tick switches away, invalidates the
    /// task's handle (a later [`Port::delete_other`] is a no-op), releases
    /// any critical section held and ends the thread. Never returns.
    ///
    /// # Panics
    /// If called on any thread other than `task`'s own.
    pub fn delete_self(&self, task: &TaskHandle, pend_yield: &AtomicBool) -> ! {
        assert!(
            this_task().as_ref() == Some(task),
            "delete_self called from outside task '{}'",
            task.name()
        );

        task.set_priority(ThreadPriority::DeleteSelf);
        port::set_thread_priority(task.name(), ThreadPriority::DeleteSelf);
        pend_yield.store(true, Ordering::SeqCst);

        // A thread cannot reclaim itself: the handle is detached, not joined
        drop(task.take_thread());
        task.set_status(ThreadStatus::Terminating);

        self.abandon_critical();
        crate::info!("task '{}' deleted itself", task.name());
        thread::exit_thread()
    }
}

/// Task thread trampoline
fn task_main<F>(port: Weak<PortShared>, task: TaskHandle, entry: F)
where
    F: FnOnce(),
{
    task.attach_native();
    kernel::bind(port.clone(), Some(task.clone()));
    let _pinned = port::pin_to_simulation_core();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        task.checkpoint();
        entry();
    }));

    // Never leave simulated interrupts masked behind a dead thread
    if let Some(inner) = port.upgrade() {
        Port { inner }.abandon_critical();
    }
    kernel::unbind();
    task.finish();

    match outcome {
        Ok(()) => crate::error!("task '{}' returned from its entry function", task.name()),
        Err(payload) if payload.is::<TaskExit>() => {
            crate::debug!("task '{}' thread exited", task.name());
        }
        Err(payload) => panic::resume_unwind(payload),
    }
}
