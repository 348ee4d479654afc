//! Time management module
//!
//! The tick source: a thread standing in for the timer peripheral, raising
//! the tick line once per tick period.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::CFG_INT_TICK;
use crate::error::{OsError, OsResult};
use crate::kernel::{self, Port};
use crate::port;
use crate::types::ThreadPriority;

impl Port {
    /// Period the tick thread actually sleeps for
    #[inline]
    pub fn tick_period(&self) -> Duration {
        self.config().effective_tick_period()
    }

    pub(crate) fn spawn_tick_thread(&self) -> OsResult<JoinHandle<()>> {
        let port = self.clone();
        let period = self.tick_period();

        thread::Builder::new()
            .name(port::thread_name(self.config().prefix(), "tick"))
            .spawn(move || port.simulated_peripheral_timer(period))
            .map_err(|err| {
                crate::error!("failed to create tick thread: {}", err);
                OsError::ThreadCreate
            })
    }

    /// Tick thread body
    ///
    /// The next wake time is relative to the end of the previous sleep, not
    /// to the previous wake time, so an overrun delays ticks instead of
    /// bunching them up. Holds the interrupt state only while setting its bit.
    fn simulated_peripheral_timer(&self, period: Duration) {
        kernel::bind(std::sync::Arc::downgrade(&self.inner), None);
        port::set_thread_priority("tick", ThreadPriority::Timer);
        let _pinned = port::pin_to_simulation_core();
        crate::debug!("tick thread started, period {:?}", period);

        loop {
            thread::sleep(period);

            // Can't proceed while a task is in a critical section
            let st = self.state();
            let mut st = self.wait_while(st, |s| !s.shutdown && !s.lock.is_free());
            if st.shutdown {
                break;
            }
            assert!(st.running, "tick raised before the scheduler started");

            st.pending.set(CFG_INT_TICK);
            debug_assert_eq!(st.nesting, 0);
            st.event = true;
            drop(st);
            self.notify();
        }

        kernel::unbind();
        crate::debug!("tick thread stopped");
    }
}
