//! Simulated interrupts
//!
//! Pending register, handler table, the `raise` entry point and the
//! dispatcher loop that services pending lines and performs task switches.

use std::fmt;
use std::sync::Arc;
use std::thread;

use crate::config::{CFG_INT_MAX, CFG_INT_YIELD};
use crate::error::{OsError, OsResult};
use crate::kernel::{self, Port};
use crate::port;
use crate::sched::TaskSelector;
use crate::types::IntLine;

/// Interrupt handler; returns true when a task switch is required
pub type IsrHandler = Arc<dyn Fn() -> bool + Send + Sync>;

// ============ Pending register ============

/// Bit mask of pending simulated interrupts, one bit per line
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct IntRegister(u32);

impl IntRegister {
    pub const fn new() -> Self {
        IntRegister(0)
    }

    /// Mark a line pending; returns false if it already was
    #[inline]
    pub fn set(&mut self, line: IntLine) -> bool {
        let was_set = self.is_set(line);
        self.0 |= 1 << line;
        !was_set
    }

    #[inline]
    pub fn clear(&mut self, line: IntLine) {
        self.0 &= !(1 << line);
    }

    #[inline]
    pub fn is_set(&self, line: IntLine) -> bool {
        (self.0 & (1 << line)) != 0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Pending lines, lowest index (highest precedence) first
    pub fn lines(&self) -> impl Iterator<Item = IntLine> {
        let mut bits = self.0;
        std::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let line = bits.trailing_zeros();
            bits &= bits - 1;
            Some(line)
        })
    }
}

impl fmt::Debug for IntRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IntRegister({:#010x})", self.0)
    }
}

// ============ Handler table ============

pub(crate) struct HandlerTable {
    handlers: [Option<IsrHandler>; CFG_INT_MAX],
}

impl HandlerTable {
    pub(crate) fn new() -> Self {
        Self {
            handlers: std::array::from_fn(|_| None),
        }
    }

    #[inline]
    pub(crate) fn get(&self, line: IntLine) -> Option<IsrHandler> {
        self.handlers[line as usize].clone()
    }

    #[inline]
    pub(crate) fn set(&mut self, line: IntLine, handler: IsrHandler) {
        self.handlers[line as usize] = Some(handler);
    }
}

// ============ Public API ============

impl Port {
    /// Install the handler for a simulated interrupt line
    ///
    /// Replaces any handler already installed on the line. The interrupt
    /// lock is held for the update, so a handler is never invoked while it
    /// is being replaced.
    ///
    /// # Returns
    /// * `Ok(())` - Handler installed
    /// * `Err(OsError::IntLineInvalid)` - Line outside the pending register
    pub fn register_handler<F>(&self, line: IntLine, handler: F) -> OsResult<()>
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        if line as usize >= CFG_INT_MAX {
            return Err(OsError::IntLineInvalid);
        }

        let mut st = self.lock_interrupts(thread::current().id());
        st.handlers.set(line, Arc::new(handler));
        Ok(())
    }

    /// Raise a simulated interrupt
    ///
    /// Outside a critical section the calling task blocks until the
    /// dispatcher has serviced the interrupt and made its scheduling
    /// decision. Inside one the line is left pending and the call returns at
    /// once; the interrupt is serviced when the outermost section exits.
    ///
    /// # Panics
    /// If `line` is outside the pending register or the scheduler has not
    /// been started.
    pub fn raise(&self, line: IntLine) {
        assert!(
            (line as usize) < CFG_INT_MAX,
            "interrupt line {} out of range",
            line
        );
        assert!(
            self.is_running(),
            "interrupt {} raised before the scheduler started",
            line
        );

        let me = thread::current().id();
        let mut st = self.lock_interrupts(me);
        st.pending.set(line);

        // Handlers raising interrupts are picked up by the next pass
        let from_isr = st.inside_interrupt && st.lock.is_held_by(me);
        let unmasked = st.nesting == 0;
        let waiter = if unmasked && !from_isr {
            kernel::bound_task()
        } else {
            None
        };

        if unmasked {
            st.event = true;
            if let Some(task) = &waiter {
                task.reset_signal();
            }
        }
        drop(st);
        self.notify();

        if let Some(task) = waiter {
            task.wait_signal();
        }
    }

    /// Request a reschedule through the yield line
    #[inline]
    pub fn yield_now(&self) {
        self.raise(CFG_INT_YIELD);
    }

    // ============ Dispatcher ============

    /// Dispatcher loop, run on the thread that started the scheduler
    pub(crate) fn process_simulated_interrupts(&self, selector: &dyn TaskSelector) {
        let me = thread::current().id();
        let mut st = self.state();

        loop {
            st.inside_interrupt = false;
            st = self.wait_while(st, |s| !s.shutdown && !(s.event && s.lock.is_free()));
            if st.shutdown {
                break;
            }

            // Cannot be in a critical section to get here
            st.event = false;
            st.lock.acquire(me);
            st.inside_interrupt = true;

            // Lines raised by the handlers themselves wait for the next pass
            let mut switch_required = IntRegister::new();
            let snapshot = st.pending;
            for line in snapshot.lines() {
                if !st.pending.is_set(line) {
                    continue;
                }

                if let Some(handler) = st.handlers.get(line) {
                    drop(st);
                    let switch = handler();
                    st = self.state();
                    if switch {
                        switch_required.set(line);
                    }
                }

                st.pending.clear(line);
            }

            if !switch_required.is_empty() {
                drop(st);
                let next = selector.select_next();
                if let Some(next) = &next {
                    crate::trace!("switch {:?} -> task '{}'", switch_required, next.name());
                }
                st = self.state();

                if let Some(next) = next {
                    let old = st.current.replace(next.clone());
                    if old.as_ref() != Some(&next) {
                        port::context_switch(old.as_ref(), &next);
                    }
                }
            }

            if !st.pending.is_empty() {
                st.event = true;
            }

            // Benign when the current task is not waiting on it
            if let Some(task) = &st.current {
                task.signal();
            }

            st.lock.release(me);
            self.notify();
        }

        st.inside_interrupt = false;
    }
}
