//! Global port state and scheduler start/stop
//!
//! Everything the simulated interrupt controller shares between threads
//! (pending register, handler table, critical nesting counter, current
//! task) lives in one [`PortState`] behind one mutex. The "interrupt lock"
//! that masks simulated interrupts is an ownership record inside that same
//! state, so no second lock ever exists to be taken in the wrong order.

use std::cell::RefCell;
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::thread::{self, ThreadId};

use portable_atomic::{AtomicU32, Ordering};

use crate::config::{PortConfig, CFG_CRITICAL_NESTING_INIT, CFG_INT_TICK, CFG_INT_YIELD};
use crate::error::{OsError, OsResult};
use crate::isr::{HandlerTable, IntRegister};
use crate::port;
use crate::port::preempt::{self, Locked};
use crate::sched::TaskSelector;
use crate::task::{TaskHandle, TaskThread};
use crate::types::{OsNestingCtr, TaskId, ThreadPriority};

// ============ Interrupt lock ============

/// Owner record of the simulated interrupt lock
///
/// Reentrant for the owning thread, like the host mutex it stands in for:
/// a handler running on the dispatcher may enter a critical section.
#[derive(Debug)]
pub(crate) struct LockOwner {
    owner: Option<ThreadId>,
    depth: u32,
}

impl LockOwner {
    pub(crate) const fn new() -> Self {
        Self { owner: None, depth: 0 }
    }

    #[inline]
    pub(crate) fn is_free(&self) -> bool {
        self.owner.is_none()
    }

    #[inline]
    pub(crate) fn is_held_by(&self, me: ThreadId) -> bool {
        self.owner == Some(me)
    }

    #[inline]
    pub(crate) fn can_acquire(&self, me: ThreadId) -> bool {
        self.is_free() || self.is_held_by(me)
    }

    pub(crate) fn acquire(&mut self, me: ThreadId) {
        debug_assert!(self.can_acquire(me));
        self.owner = Some(me);
        self.depth += 1;
    }

    /// Drop one level; returns true once the lock is free
    pub(crate) fn release(&mut self, me: ThreadId) -> bool {
        debug_assert!(self.is_held_by(me));
        self.depth = self.depth.saturating_sub(1);
        if self.depth == 0 {
            self.owner = None;
        }
        self.owner.is_none()
    }

    pub(crate) fn release_all(&mut self, me: ThreadId) {
        if self.is_held_by(me) {
            self.owner = None;
            self.depth = 0;
        }
    }
}

// ============ Port State ============

/// State shared by every thread of one simulation
pub(crate) struct PortState {
    /// Owner of the interrupt lock (critical sections, dispatcher pass)
    pub(crate) lock: LockOwner,
    /// Simulated interrupts waiting to be processed
    pub(crate) pending: IntRegister,
    /// Handlers for each line
    pub(crate) handlers: HandlerTable,
    /// Process-wide critical nesting
    pub(crate) nesting: OsNestingCtr,
    /// Interrupt event: wakes the dispatcher, auto-reset
    pub(crate) event: bool,
    /// Dispatcher is running handlers
    pub(crate) inside_interrupt: bool,
    /// Dispatcher loop has been entered
    pub(crate) running: bool,
    /// Stop requested by [`Port::end_scheduler`]
    pub(crate) shutdown: bool,
    /// Task selected to run
    pub(crate) current: Option<TaskHandle>,
    /// Task threads created by this port
    pub(crate) tasks: Vec<Weak<TaskThread>>,
}

impl PortState {
    fn new() -> Self {
        Self {
            lock: LockOwner::new(),
            pending: IntRegister::new(),
            handlers: HandlerTable::new(),
            nesting: CFG_CRITICAL_NESTING_INIT,
            event: false,
            inside_interrupt: false,
            running: false,
            shutdown: false,
            current: None,
            tasks: Vec::new(),
        }
    }

    pub(crate) fn prune_tasks(&mut self) {
        self.tasks.retain(|t| t.strong_count() > 0);
    }
}

pub(crate) struct PortShared {
    state: Mutex<PortState>,
    cond: Condvar,
    config: PortConfig,
    next_id: AtomicU32,
}

impl Drop for PortShared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        kill_tasks(&mut state.tasks);
    }
}

fn kill_tasks(tasks: &mut Vec<Weak<TaskThread>>) {
    for task in tasks.drain(..).filter_map(|t| t.upgrade()) {
        task.kill();
        drop(task.take_thread());
    }
}

/// Handle to one host simulation
///
/// Cheap to clone; every clone refers to the same simulated machine.
#[derive(Clone)]
pub struct Port {
    pub(crate) inner: Arc<PortShared>,
}

// ============ Thread binding ============

struct Binding {
    port: Weak<PortShared>,
    task: Option<TaskHandle>,
}

thread_local! {
    static BINDING: RefCell<Option<Binding>> = const { RefCell::new(None) };
}

/// Attach the calling thread to a port (and optionally a task)
pub(crate) fn bind(port: Weak<PortShared>, task: Option<TaskHandle>) {
    BINDING.with(|b| *b.borrow_mut() = Some(Binding { port, task }));
}

pub(crate) fn unbind() {
    BINDING.with(|b| b.borrow_mut().take());
}

/// Task owning the calling thread, if it is a task thread
pub(crate) fn bound_task() -> Option<TaskHandle> {
    BINDING.with(|b| b.borrow().as_ref().and_then(|b| b.task.clone()))
}

/// Honour a pending suspension or kill of the calling task thread
pub(crate) fn checkpoint_this() {
    if let Some(task) = bound_task() {
        task.checkpoint();
    }
}

// ============ Public API ============

impl Port {
    /// Create a simulation; nothing runs until [`Port::start`]
    pub fn new(config: PortConfig) -> Self {
        preempt::install();
        Self {
            inner: Arc::new(PortShared {
                state: Mutex::new(PortState::new()),
                cond: Condvar::new(),
                config,
                next_id: AtomicU32::new(0),
            }),
        }
    }

    /// Port the calling thread belongs to (task, tick or dispatcher thread)
    pub fn current() -> Option<Port> {
        BINDING.with(|b| {
            b.borrow()
                .as_ref()
                .and_then(|b| b.port.upgrade())
                .map(|inner| Port { inner })
        })
    }

    #[inline]
    pub fn config(&self) -> &PortConfig {
        &self.inner.config
    }

    /// Check if the dispatcher loop is running
    pub fn is_running(&self) -> bool {
        self.state().running
    }

    /// Snapshot of the pending register
    pub fn pending(&self) -> IntRegister {
        self.state().pending
    }

    /// Current critical nesting count
    pub fn critical_nesting(&self) -> OsNestingCtr {
        self.state().nesting
    }

    /// Task most recently selected to run
    pub fn current_task(&self) -> Option<TaskHandle> {
        self.state().current.clone()
    }

    /// Start the scheduler
    ///
    /// Installs the tick and yield handlers, starts the tick thread, resumes
    /// the first selected task and then services simulated interrupts on the
    /// calling thread, which becomes the dispatcher. Does not return until
    /// [`Port::end_scheduler`] is called. The calling thread is pinned to the
    /// simulation processor meanwhile.
    ///
    /// # Returns
    /// * `Ok(())` - Scheduler was stopped
    /// * `Err(OsError::SingleCoreHost)` - Host has one logical processor
    /// * `Err(OsError::OsRunning)` - Scheduler already running
    /// * `Err(OsError::NoReadyTask)` - Policy has no task to run
    /// * `Err(OsError::ThreadCreate)` - Tick thread could not be created
    pub fn start<S: TaskSelector>(&self, selector: Arc<S>) -> OsResult<()> {
        let processors = self
            .config()
            .processor_override()
            .map(|n| n.get())
            .unwrap_or_else(port::logical_processors);
        if processors <= 1 {
            crate::error!("the simulation port can only be used on multi-core hosts");
            return Err(OsError::SingleCoreHost);
        }

        if self.is_running() {
            return Err(OsError::OsRunning);
        }

        port::raise_process_priority();

        let policy: Arc<dyn TaskSelector> = selector;
        let tick_policy = Arc::clone(&policy);
        self.register_handler(CFG_INT_YIELD, || true)?;
        self.register_handler(CFG_INT_TICK, move || tick_policy.increment_tick())?;

        let Some(first) = policy.select_next() else {
            crate::error!("no task ready to run, scheduler not started");
            return Err(OsError::NoReadyTask);
        };

        let _pinned = port::pin_to_simulation_core();
        port::set_thread_priority("dispatcher", ThreadPriority::Interrupts);
        bind(Arc::downgrade(&self.inner), None);

        {
            let mut st = self.state();
            st.current = Some(first.clone());
            st.nesting = 0;
            st.shutdown = false;
            // Pend a tick so the first task's scheduling is settled at once
            st.pending.set(CFG_INT_TICK);
            st.event = true;
            st.running = true;
        }

        let tick = match self.spawn_tick_thread() {
            Ok(handle) => handle,
            Err(err) => {
                self.reset();
                unbind();
                return Err(err);
            }
        };

        port::context_switch(None, &first);
        crate::info!("scheduler started, first task '{}'", first.name());

        self.process_simulated_interrupts(policy.as_ref());

        {
            // Never terminate a task inside a critical section
            let me = thread::current().id();
            let mut st = self.wait_while(self.state(), |s| !s.lock.can_acquire(me));
            kill_tasks(&mut st.tasks);
        }
        if tick.join().is_err() {
            crate::error!("tick thread panicked");
        }
        self.reset();
        unbind();
        crate::info!("scheduler stopped");
        Ok(())
    }

    /// Stop the scheduler
    ///
    /// The dispatcher leaves its loop, the tick thread stops and every task
    /// thread is terminated. When called from a task thread the calling task
    /// does not return.
    ///
    /// # Returns
    /// * `Ok(())` - Stop requested
    /// * `Err(OsError::OsNotRunning)` - Scheduler not started, or already stopping
    pub fn end_scheduler(&self) -> OsResult<()> {
        {
            let mut st = self.state();
            if !st.running || st.shutdown {
                return Err(OsError::OsNotRunning);
            }
            st.shutdown = true;
        }
        self.notify();
        crate::debug!("scheduler stop requested");

        if let Some(task) = bound_task() {
            if self.owns(&task) {
                self.abandon_critical();
                task.suspend();
                task.checkpoint();
            }
        }
        Ok(())
    }

    /// Allocate the next task id
    pub(crate) fn next_task_id(&self) -> TaskId {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn owns(&self, task: &TaskHandle) -> bool {
        self.state()
            .tasks
            .iter()
            .any(|t| std::ptr::eq(t.as_ptr(), Arc::as_ptr(&task.0)))
    }

    fn reset(&self) {
        let mut st = self.state();
        st.running = false;
        st.shutdown = false;
        st.event = false;
        st.inside_interrupt = false;
        st.current = None;
        st.pending = IntRegister::new();
        st.nesting = CFG_CRITICAL_NESTING_INIT;
        st.lock = LockOwner::new();
    }

    // ============ State access ============

    pub(crate) fn state(&self) -> Locked<'_, PortState> {
        preempt::lock(&self.inner.state)
    }

    pub(crate) fn wait_while<'a, F>(
        &self,
        guard: Locked<'a, PortState>,
        condition: F,
    ) -> Locked<'a, PortState>
    where
        F: FnMut(&mut PortState) -> bool,
    {
        guard.wait_while(&self.inner.cond, condition)
    }

    pub(crate) fn notify(&self) {
        self.inner.cond.notify_all();
    }

    /// Wait until the calling thread may touch the interrupt state
    ///
    /// A task thread first honours any suspension requested for it, and
    /// checks again once the lock is free, so a switched-out task never
    /// masks interrupts. Returns with the lock free or already held by the
    /// caller; it is not taken.
    pub(crate) fn lock_interrupts(&self, me: ThreadId) -> Locked<'_, PortState> {
        let task = bound_task();
        loop {
            let st = self.state();
            if st.lock.is_held_by(me) {
                return st;
            }
            drop(st);

            if let Some(task) = &task {
                task.checkpoint();
            }
            let st = self.wait_while(self.state(), |s| !s.lock.can_acquire(me));
            match &task {
                // Switched out while waiting: stop before touching anything
                Some(task) if task.is_switched_out() => continue,
                _ => return st,
            }
        }
    }

    /// Release the interrupt lock entirely if the calling thread holds it
    ///
    /// Used by threads leaving task code for good. Pending interrupts are
    /// handed to the dispatcher without waiting for them.
    pub(crate) fn abandon_critical(&self) {
        let me = thread::current().id();
        let mut st = self.state();
        if !st.lock.is_held_by(me) {
            return;
        }
        st.nesting = 0;
        st.lock.release_all(me);
        if !st.pending.is_empty() {
            st.event = true;
        }
        drop(st);
        self.notify();
    }
}
