//! Scheduler module
//!
//! The port never decides which task runs next. It asks a [`TaskSelector`]
//! whenever a simulated interrupt handler requests a switch. [`RoundRobin`]
//! is a reference policy: priority-based with round-robin for tasks of the
//! same priority.

mod rdy_list;

pub use rdy_list::ReadyList;

use std::sync::Mutex;

use portable_atomic::{AtomicBool, AtomicU32, Ordering};

use crate::config::{CFG_PRIO_MAX, CFG_TIME_QUANTA_DEFAULT};
use crate::error::{OsError, OsResult};
use crate::port::preempt::{self, Locked};
use crate::prio::PrioTable;
use crate::task::TaskHandle;
use crate::types::{OsPrio, OsTick};

/// Task-selection policy consumed by the dispatcher
pub trait TaskSelector: Send + Sync + 'static {
    /// Process one tick; true requests a task switch
    ///
    /// Runs on the dispatcher thread as the tick line's handler.
    fn increment_tick(&self) -> bool;

    /// Task that should run next
    ///
    /// Called after any handler requested a switch, and once at start to
    /// pick the first task. May return the task already running; `None`
    /// keeps the current task, or refuses to start without one.
    fn select_next(&self) -> Option<TaskHandle>;
}

/// Scheduler state
struct SchedState {
    prio_tbl: PrioTable,
    rdy_list: Vec<ReadyList>,
    current: Option<(TaskHandle, OsPrio)>,
    time_quanta: OsTick,
    quanta_ctr: OsTick,
}

impl SchedState {
    fn remove(&mut self, task: &TaskHandle) -> bool {
        let mut found = false;
        for prio in 0..CFG_PRIO_MAX {
            if self.rdy_list[prio].remove(task) {
                found = true;
                if self.rdy_list[prio].is_empty() {
                    self.prio_tbl.remove(prio as OsPrio);
                }
            }
        }
        found
    }
}

/// Priority round-robin policy
pub struct RoundRobin {
    state: Mutex<SchedState>,
    tick_counter: AtomicU32,
    yield_pending: AtomicBool,
}

impl RoundRobin {
    /// Create a policy giving each task `time_quanta` ticks (0 = default)
    pub fn new(time_quanta: OsTick) -> Self {
        let time_quanta = if time_quanta == 0 {
            CFG_TIME_QUANTA_DEFAULT
        } else {
            time_quanta
        };

        Self {
            state: Mutex::new(SchedState {
                prio_tbl: PrioTable::new(),
                rdy_list: (0..CFG_PRIO_MAX).map(|_| ReadyList::new()).collect(),
                current: None,
                time_quanta,
                quanta_ctr: time_quanta,
            }),
            tick_counter: AtomicU32::new(0),
            yield_pending: AtomicBool::new(false),
        }
    }

    fn state(&self) -> Locked<'_, SchedState> {
        preempt::lock(&self.state)
    }

    /// Make a task ready at `prio`
    ///
    /// # Returns
    /// * `Ok(())` - Task is ready
    /// * `Err(OsError::PrioInvalid)` - Priority out of range
    pub fn add(&self, task: TaskHandle, prio: OsPrio) -> OsResult<()> {
        if prio as usize >= CFG_PRIO_MAX {
            return Err(OsError::PrioInvalid);
        }

        let mut st = self.state();
        st.rdy_list[prio as usize].insert_tail(task);
        st.prio_tbl.insert(prio);
        Ok(())
    }

    /// Remove a task from the ready lists
    pub fn remove(&self, task: &TaskHandle) -> bool {
        self.state().remove(task)
    }

    /// Ticks processed so far
    #[inline]
    pub fn tick_get(&self) -> OsTick {
        self.tick_counter.load(Ordering::Relaxed)
    }

    /// Flag forcing a switch on the next tick
    ///
    /// Pass it to [`Port::delete_self`](crate::Port::delete_self).
    #[inline]
    pub fn yield_pending(&self) -> &AtomicBool {
        &self.yield_pending
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new(CFG_TIME_QUANTA_DEFAULT)
    }
}

impl TaskSelector for RoundRobin {
    fn increment_tick(&self) -> bool {
        self.tick_counter.fetch_add(1, Ordering::Relaxed);

        if self.yield_pending.swap(false, Ordering::SeqCst) {
            return true;
        }

        let mut st = self.state();
        let Some((cur, prio)) = st.current.clone() else {
            return !st.prio_tbl.is_empty();
        };

        if !cur.status().is_alive() {
            return true;
        }
        if st.prio_tbl.highest().is_some_and(|high| high < prio) {
            return true;
        }

        st.quanta_ctr = st.quanta_ctr.saturating_sub(1);
        if st.quanta_ctr == 0 {
            st.quanta_ctr = st.time_quanta;
            // Only rotate if more than one task at this priority
            return st.rdy_list[prio as usize].len() > 1;
        }
        false
    }

    fn select_next(&self) -> Option<TaskHandle> {
        let mut st = self.state();

        loop {
            let Some(prio) = st.prio_tbl.highest() else {
                // Nothing ready: keep whatever is running
                return st.current.as_ref().map(|(cur, _)| cur.clone());
            };

            let list = &mut st.rdy_list[prio as usize];
            let Some(head) = list.head().cloned() else {
                st.prio_tbl.remove(prio);
                continue;
            };

            if !head.status().is_alive() {
                st.remove(&head);
                continue;
            }

            if st.current.as_ref().is_some_and(|(cur, _)| *cur == head) {
                let list = &mut st.rdy_list[prio as usize];
                list.rotate();
                let next = list.head().cloned().unwrap_or(head);
                if !next.status().is_alive() {
                    st.remove(&next);
                    continue;
                }
                st.current = Some((next.clone(), prio));
                st.quanta_ctr = st.time_quanta;
                return Some(next);
            }

            st.current = Some((head.clone(), prio));
            st.quanta_ctr = st.time_quanta;
            return Some(head);
        }
    }
}
