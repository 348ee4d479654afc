//! Asynchronous suspension of task threads
//!
//! A switched-out task has to stop even when it never calls into the port.
//! On unix the dispatcher sends the task's thread a suspend signal; the
//! handler parks the thread until the task's halt flag clears, which is
//! announced with a resume signal. A killed task's flag never clears, so its
//! thread stays parked for good.
//!
//! Port code runs with the suspend signal blocked ([`SuspendMask`]): a
//! thread is only ever parked outside port code, never while it holds port
//! state. A signal arriving inside is delivered when the outermost mask is
//! dropped.
//!
//! Other hosts have no such mechanism; tasks stop at their next
//! checkpoint only.

use std::cell::Cell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use portable_atomic::AtomicBool;

pub(crate) use sys::NativeThread;

thread_local! {
    /// Thread runs task code and may be parked
    static TASK_THREAD: Cell<bool> = const { Cell::new(false) };
    static MASK_DEPTH: Cell<u32> = const { Cell::new(0) };
    /// Halt flag of the task owning this thread, null once detached
    static HALTED: Cell<*const AtomicBool> = const { Cell::new(ptr::null()) };
}

/// Install the signal handlers (once per process)
pub(crate) fn install() {
    sys::install();
}

/// Make the calling thread parkable on `halted`
///
/// `halted` must outlive the attachment; the task trampoline keeps its
/// record alive until it detaches.
pub(crate) fn attach(halted: &AtomicBool) {
    TASK_THREAD.with(|t| t.set(true));
    HALTED.with(|h| h.set(halted));
}

/// The calling thread leaves task code; suspend signals are ignored from now
pub(crate) fn detach() {
    HALTED.with(|h| h.set(ptr::null()));
}

// ============ Suspend mask ============

/// Blocks the suspend signal on a task thread while alive
///
/// Nests; only the outermost mask touches the signal mask. No-op on threads
/// that never ran task code.
pub(crate) struct SuspendMask {
    engaged: bool,
    _not_send: PhantomData<*const ()>,
}

impl SuspendMask {
    pub(crate) fn new() -> Self {
        let engaged = TASK_THREAD.with(Cell::get);
        if engaged {
            MASK_DEPTH.with(|depth| {
                if depth.get() == 0 {
                    sys::block();
                }
                depth.set(depth.get() + 1);
            });
        }
        Self {
            engaged,
            _not_send: PhantomData,
        }
    }
}

impl Drop for SuspendMask {
    fn drop(&mut self) {
        if !self.engaged {
            return;
        }
        MASK_DEPTH.with(|depth| {
            let left = depth.get().saturating_sub(1);
            depth.set(left);
            if left == 0 {
                // A suspend request made meanwhile parks the thread here
                sys::unblock();
            }
        });
    }
}

// ============ Masked lock ============

/// Mutex guard holding the suspend signal off
///
/// The mask is taken before the mutex and released after it, so a task
/// thread is never parked holding port state.
pub(crate) struct Locked<'a, T> {
    guard: MutexGuard<'a, T>,
    _mask: SuspendMask,
}

/// Lock `mutex`, recovering it if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> Locked<'_, T> {
    let mask = SuspendMask::new();
    let guard = mutex.lock().unwrap_or_else(PoisonError::into_inner);
    Locked { guard, _mask: mask }
}

impl<'a, T> Locked<'a, T> {
    /// Wait on `cond` while `condition` holds, keeping the mask
    pub(crate) fn wait_while<F>(self, cond: &Condvar, condition: F) -> Self
    where
        F: FnMut(&mut T) -> bool,
    {
        let Locked { guard, _mask } = self;
        let guard = cond
            .wait_while(guard, condition)
            .unwrap_or_else(PoisonError::into_inner);
        Locked { guard, _mask }
    }
}

impl<T> Deref for Locked<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for Locked<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

// ============ Host signals ============

#[cfg(unix)]
mod sys {
    use std::cell::Cell;
    use std::mem;
    use std::ptr;
    use std::sync::Once;

    use libc::c_int;
    use portable_atomic::Ordering;

    use super::HALTED;

    const SIG_SUSPEND: c_int = libc::SIGUSR1;
    const SIG_RESUME: c_int = libc::SIGUSR2;

    static INSTALL: Once = Once::new();

    pub(super) fn install() {
        INSTALL.call_once(|| {
            // Resume stays blocked inside the suspend handler until it parks
            set_handler(SIG_SUSPEND, on_suspend, Some(SIG_RESUME));
            set_handler(SIG_RESUME, on_resume, None);
        });
    }

    fn set_handler(sig: c_int, handler: extern "C" fn(c_int), also_block: Option<c_int>) {
        // SAFETY: the action is fully initialised and both handlers only
        // touch async-signal-safe state
        let rc = unsafe {
            let mut action: libc::sigaction = mem::zeroed();
            action.sa_sigaction = handler as libc::sighandler_t;
            action.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            if let Some(extra) = also_block {
                libc::sigaddset(&mut action.sa_mask, extra);
            }
            libc::sigaction(sig, &action, ptr::null_mut())
        };
        if rc != 0 {
            crate::error!("failed to install the handler for signal {}", sig);
        }
    }

    extern "C" fn on_suspend(_: c_int) {
        let halted = HALTED.try_with(Cell::get).unwrap_or(ptr::null());
        if halted.is_null() {
            return;
        }
        // SAFETY: attached flags outlive the attachment
        let halted = unsafe { &*halted };

        let saved = errno::get();
        // SAFETY: plain signal-mask calls on a local set
        let mask = unsafe {
            let mut mask: libc::sigset_t = mem::zeroed();
            libc::pthread_sigmask(libc::SIG_SETMASK, ptr::null(), &mut mask);
            libc::sigdelset(&mut mask, SIG_RESUME);
            mask
        };
        while halted.load(Ordering::SeqCst) {
            // SAFETY: sigsuspend only waits for a signal
            unsafe { libc::sigsuspend(&mask) };
        }
        errno::set(saved);
    }

    extern "C" fn on_resume(_: c_int) {}

    fn suspend_set() -> libc::sigset_t {
        // SAFETY: initialising a local set
        unsafe {
            let mut set: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, SIG_SUSPEND);
            set
        }
    }

    pub(super) fn block() {
        let set = suspend_set();
        // SAFETY: changes the calling thread's mask only
        unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, ptr::null_mut()) };
    }

    pub(super) fn unblock() {
        let set = suspend_set();
        // SAFETY: changes the calling thread's mask only
        unsafe { libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, ptr::null_mut()) };
    }

    /// Native thread of a task, target of suspend and resume signals
    #[derive(Clone, Copy, Debug)]
    pub(crate) struct NativeThread(libc::pthread_t);

    // SAFETY: a pthread_t is an identifier, valid from any thread while the
    // target has not exited; callers check that under the task's gate
    unsafe impl Send for NativeThread {}
    unsafe impl Sync for NativeThread {}

    impl NativeThread {
        pub(crate) fn current() -> Self {
            // SAFETY: always valid
            NativeThread(unsafe { libc::pthread_self() })
        }

        pub(crate) fn is_current(&self) -> bool {
            // SAFETY: both ids refer to live threads
            unsafe { libc::pthread_equal(self.0, libc::pthread_self()) != 0 }
        }

        pub(crate) fn post_suspend(&self) {
            self.post(SIG_SUSPEND);
        }

        pub(crate) fn post_resume(&self) {
            self.post(SIG_RESUME);
        }

        fn post(&self, sig: c_int) {
            // SAFETY: the caller guarantees the thread has not exited
            let rc = unsafe { libc::pthread_kill(self.0, sig) };
            if rc != 0 {
                crate::warn!("signal {} not delivered: error {}", sig, rc);
            }
        }
    }

    mod errno {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        unsafe fn location() -> *mut libc::c_int {
            unsafe { libc::__errno_location() }
        }

        #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
        unsafe fn location() -> *mut libc::c_int {
            unsafe { libc::__error() }
        }

        #[cfg(any(
            target_os = "linux",
            target_os = "android",
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd"
        ))]
        pub(super) fn get() -> libc::c_int {
            // SAFETY: the thread's errno slot
            unsafe { *location() }
        }

        #[cfg(any(
            target_os = "linux",
            target_os = "android",
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd"
        ))]
        pub(super) fn set(value: libc::c_int) {
            // SAFETY: the thread's errno slot
            unsafe { *location() = value }
        }

        #[cfg(not(any(
            target_os = "linux",
            target_os = "android",
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd"
        )))]
        pub(super) fn get() -> libc::c_int {
            0
        }

        #[cfg(not(any(
            target_os = "linux",
            target_os = "android",
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd"
        )))]
        pub(super) fn set(_: libc::c_int) {}
    }
}

#[cfg(not(unix))]
mod sys {
    pub(super) fn install() {
        crate::debug!("no asynchronous suspension on this host; tasks stop at checkpoints");
    }

    pub(super) fn block() {}

    pub(super) fn unblock() {}

    #[derive(Clone, Copy, Debug)]
    pub(crate) struct NativeThread;

    impl NativeThread {
        pub(crate) fn current() -> Self {
            NativeThread
        }

        pub(crate) fn is_current(&self) -> bool {
            false
        }

        pub(crate) fn post_suspend(&self) {}

        pub(crate) fn post_resume(&self) {}
    }
}
