//! Critical section handling for the host simulation
//!
//! A critical section masks simulated interrupts by holding the interrupt
//! lock: the dispatcher cannot start a pass while a task holds it. Nested
//! sections coalesce into one hold. Leaving the outermost section with an
//! interrupt pending hands control to the dispatcher before the caller
//! continues.

use std::marker::PhantomData;
use std::thread;

use crate::kernel::{self, Port};

impl Port {
    /// Enter a critical section
    ///
    /// Before the scheduler starts only the nesting counter moves; the lock
    /// is not engaged yet.
    pub fn enter_critical(&self) {
        let me = thread::current().id();
        {
            let mut st = self.state();
            if !st.running {
                st.nesting += 1;
                return;
            }
        }

        let mut st = self.lock_interrupts(me);
        st.lock.acquire(me);
        st.nesting += 1;
    }

    /// Exit a critical section
    ///
    /// # Panics
    /// If the scheduler is running and the calling thread does not hold the
    /// interrupt lock.
    pub fn exit_critical(&self) {
        let me = thread::current().id();
        let mut st = self.state();
        if !st.running {
            st.nesting = st.nesting.saturating_sub(1);
            return;
        }

        assert!(
            st.lock.is_held_by(me),
            "exit_critical called outside a critical section"
        );

        if st.nesting > 0 {
            st.nesting -= 1;

            // Interrupts pended while masked run before the caller resumes
            if st.nesting == 0 && !st.inside_interrupt && !st.pending.is_empty() {
                st.event = true;
                let waiter = kernel::bound_task();
                if let Some(task) = &waiter {
                    task.reset_signal();
                }
                st.lock.release(me);
                drop(st);
                self.notify();

                if let Some(task) = waiter {
                    task.wait_signal();
                }
                return;
            }
        }

        let released = st.lock.release(me);
        drop(st);
        self.notify();

        if released {
            kernel::checkpoint_this();
        }
    }

    /// Enter a critical section, exited when the guard drops
    pub fn critical(&self) -> CriticalSection<'_> {
        self.enter_critical();
        CriticalSection {
            port: self,
            _not_send: PhantomData,
        }
    }
}

/// RAII guard for critical sections
///
/// Must be dropped on the thread that created it.
pub struct CriticalSection<'a> {
    port: &'a Port,
    _not_send: PhantomData<*const ()>,
}

impl CriticalSection<'_> {
    /// Port whose interrupts are masked
    #[inline]
    pub fn port(&self) -> &Port {
        self.port
    }
}

impl Drop for CriticalSection<'_> {
    #[inline]
    fn drop(&mut self) {
        self.port.exit_critical();
    }
}

/// Execute a closure with simulated interrupts masked
#[inline]
pub fn critical_section<F, R>(port: &Port, f: F) -> R
where
    F: FnOnce(&CriticalSection<'_>) -> R,
{
    let cs = port.critical();
    f(&cs)
}

// ============ critical-section implementation ============

/// Backs `critical_section::with` for the whole process
///
/// On a thread bound to a port (task, tick or dispatcher thread) the
/// section masks that port's simulated interrupts. Any other thread falls
/// back to a process-wide reentrant host lock.
#[cfg(feature = "cs-impl")]
mod cs_impl {
    use std::sync::{Condvar, Mutex, PoisonError};
    use std::thread;

    use critical_section::{set_impl, Impl, RawRestoreState};

    use crate::kernel::{LockOwner, Port};

    static HOST_LOCK: Mutex<LockOwner> = Mutex::new(LockOwner::new());
    static HOST_COND: Condvar = Condvar::new();

    struct SimulatedCriticalSection;
    set_impl!(SimulatedCriticalSection);

    unsafe impl Impl for SimulatedCriticalSection {
        unsafe fn acquire() -> RawRestoreState {
            match Port::current() {
                Some(port) => {
                    port.enter_critical();
                    true
                }
                None => {
                    let me = thread::current().id();
                    let guard = HOST_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
                    let mut guard = HOST_COND
                        .wait_while(guard, |l| !l.can_acquire(me))
                        .unwrap_or_else(PoisonError::into_inner);
                    guard.acquire(me);
                    false
                }
            }
        }

        unsafe fn release(on_port: RawRestoreState) {
            if on_port {
                if let Some(port) = Port::current() {
                    port.exit_critical();
                }
            } else {
                let me = thread::current().id();
                let mut guard = HOST_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
                if guard.release(me) {
                    HOST_COND.notify_all();
                }
            }
        }
    }
}
