//! Configuration for the host simulation
//!
//! Compile-time constants control the fixed resources of the port. The
//! runtime [`PortConfig`] carries the values supplied by the surrounding
//! clock configuration.

use std::num::NonZeroUsize;
use std::time::Duration;

use crate::types::IntLine;

/// Number of simulated interrupt lines (bits in the pending register)
pub const CFG_INT_MAX: usize = u32::BITS as usize;

/// Line reserved for the tick interrupt, serviced first
pub const CFG_INT_TICK: IntLine = 0;

/// Line reserved for the yield interrupt
pub const CFG_INT_YIELD: IntLine = 1;

/// System tick rate in Hz
pub const CFG_TICK_RATE_HZ: u32 = 1000;

/// Host sleep granularity assumed when nothing better is configured (ms)
pub const CFG_MIN_BLOCK_MS: u64 = 20;

/// Critical nesting value held until the scheduler starts
pub const CFG_CRITICAL_NESTING_INIT: u32 = 9999;

/// Maximum number of priority levels for the reference policy
pub const CFG_PRIO_MAX: usize = 64;

/// Default time quanta for round-robin scheduling
pub const CFG_TIME_QUANTA_DEFAULT: u32 = 10;

/// Runtime configuration of a [`Port`](crate::Port)
#[derive(Debug, Clone)]
pub struct PortConfig {
    tick_period: Duration,
    min_block_time: Duration,
    processors: Option<NonZeroUsize>,
    thread_prefix: String,
}

impl PortConfig {
    /// Defaults derived from [`CFG_TICK_RATE_HZ`] and [`CFG_MIN_BLOCK_MS`]
    pub fn new() -> Self {
        Self {
            tick_period: Duration::from_micros(1_000_000 / CFG_TICK_RATE_HZ as u64),
            min_block_time: Duration::from_millis(CFG_MIN_BLOCK_MS),
            processors: None,
            thread_prefix: String::from("sim"),
        }
    }

    /// Requested period between simulated ticks
    pub fn tick_period(mut self, period: Duration) -> Self {
        self.tick_period = period;
        self
    }

    /// Smallest sleep the host honours reliably
    pub fn min_block_time(mut self, granularity: Duration) -> Self {
        self.min_block_time = granularity;
        self
    }

    /// Override the logical processor count reported by the host
    pub fn processors(mut self, count: usize) -> Self {
        self.processors = NonZeroUsize::new(count);
        self
    }

    /// Prefix for the names of every thread the port creates
    pub fn thread_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_prefix = prefix.into();
        self
    }

    /// Tick period actually used by the tick thread
    ///
    /// Never shorter than the host granularity, so callers must tolerate a
    /// coarser tick than they asked for.
    pub fn effective_tick_period(&self) -> Duration {
        self.tick_period.max(self.min_block_time)
    }

    #[inline]
    pub fn processor_override(&self) -> Option<NonZeroUsize> {
        self.processors
    }

    #[inline]
    pub fn prefix(&self) -> &str {
        &self.thread_prefix
    }
}

impl Default for PortConfig {
    fn default() -> Self {
        Self::new()
    }
}
