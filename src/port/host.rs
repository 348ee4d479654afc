//! General purpose host port
//!
//! Context switching suspends the old task thread and resumes the new one.
//! Suspension of a native thread is asynchronous here: the old thread is
//! parked by a signal (the `preempt` module) or stops at its
//! next checkpoint. It does not matter if that happens a little late, the
//! new task only runs past its own checkpoint once the dispatcher has
//! signalled it.
//!
//! Every thread of a simulation is pinned to the same logical processor so
//! that only one of them executes at a time.

use std::marker::PhantomData;
use std::thread;

use crate::task::TaskHandle;
use crate::types::ThreadPriority;

/// Logical processors reported by the host
pub fn logical_processors() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// Ask for the highest scheduling class for the simulation process
///
/// Portable Rust has no such request; it is reported so the intended
/// configuration shows up in the log.
pub fn raise_process_priority() {
    crate::debug!("simulation process requests realtime priority class");
}

/// Record the logical priority of a port thread
pub fn set_thread_priority(thread: &str, priority: ThreadPriority) {
    crate::trace!("thread '{}' priority {:?}", thread, priority);
}

/// Affinity of a thread before it was pinned, restored on drop
pub struct PinnedThread {
    previous: Option<affinity::CpuSet>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for PinnedThread {
    fn drop(&mut self) {
        if let Some(previous) = &self.previous {
            affinity::apply(previous);
        }
    }
}

/// Pin the calling thread to the simulation processor
///
/// The simulation processor is the first one the process may run on. Hosts
/// without an affinity interface leave the thread where it is.
pub fn pin_to_simulation_core() -> PinnedThread {
    PinnedThread {
        previous: affinity::pin(),
        _not_send: PhantomData,
    }
}

/// Processor every simulation thread is pinned to, if the host supports it
pub fn simulation_core() -> Option<usize> {
    affinity::simulation_core()
}

#[cfg(target_os = "linux")]
mod affinity {
    use std::mem;
    use std::sync::OnceLock;

    pub(super) type CpuSet = libc::cpu_set_t;

    const SET_SIZE: usize = mem::size_of::<libc::cpu_set_t>();

    fn current() -> Option<libc::cpu_set_t> {
        // SAFETY: the set is a plain bitmap owned by this frame
        unsafe {
            let mut set: libc::cpu_set_t = mem::zeroed();
            (libc::sched_getaffinity(0, SET_SIZE, &mut set) == 0).then_some(set)
        }
    }

    pub(super) fn apply(set: &libc::cpu_set_t) -> bool {
        // SAFETY: affects the calling thread only
        unsafe { libc::sched_setaffinity(0, SET_SIZE, set) == 0 }
    }

    pub(super) fn simulation_core() -> Option<usize> {
        static CORE: OnceLock<Option<usize>> = OnceLock::new();
        *CORE.get_or_init(|| {
            let set = current()?;
            // SAFETY: reads a bit of a local set
            (0..libc::CPU_SETSIZE as usize).find(|&cpu| unsafe { libc::CPU_ISSET(cpu, &set) })
        })
    }

    /// Pin the calling thread; returns its previous affinity
    pub(super) fn pin() -> Option<libc::cpu_set_t> {
        let core = simulation_core()?;
        let previous = current()?;

        // SAFETY: builds a local set
        let set = unsafe {
            let mut set: libc::cpu_set_t = mem::zeroed();
            libc::CPU_ZERO(&mut set);
            libc::CPU_SET(core, &mut set);
            set
        };
        if apply(&set) {
            crate::trace!("thread pinned to processor {}", core);
            Some(previous)
        } else {
            crate::warn!("could not pin thread to processor {}", core);
            None
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod affinity {
    pub(super) type CpuSet = ();

    pub(super) fn apply(_: &CpuSet) -> bool {
        false
    }

    pub(super) fn simulation_core() -> Option<usize> {
        None
    }

    pub(super) fn pin() -> Option<CpuSet> {
        crate::trace!("processor affinity not supported on this host");
        None
    }
}

/// Name for a thread created by the port
pub fn thread_name(prefix: &str, role: &str) -> String {
    format!("{}-{}", prefix, role)
}

/// Switch from `old` to `new`
///
/// # Panics
/// If `new` was deleted; a deleted task must never be selected.
pub fn context_switch(old: Option<&TaskHandle>, new: &TaskHandle) {
    if let Some(old) = old {
        old.suspend();
    }

    assert!(
        new.status().is_alive(),
        "task '{}' selected after it was deleted",
        new.name()
    );
    new.resume();
}
