//! Logging macros for the host simulation
//!
//! Provides logging macros that work with or without the log feature.

/// Debug message
#[cfg(feature = "log")]
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => { $crate::__log::debug!($($arg)*) };
}

/// Info message
#[cfg(feature = "log")]
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => { $crate::__log::info!($($arg)*) };
}

/// Error message
#[cfg(feature = "log")]
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => { $crate::__log::error!($($arg)*) };
}

/// Trace message
#[cfg(feature = "log")]
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => { $crate::__log::trace!($($arg)*) };
}

/// Warning message
#[cfg(feature = "log")]
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => { $crate::__log::warn!($($arg)*) };
}

// No-op versions when logging is disabled
#[cfg(not(feature = "log"))]
#[macro_export]
macro_rules! debug { ($($arg:tt)*) => {}; }
#[cfg(not(feature = "log"))]
#[macro_export]
macro_rules! info { ($($arg:tt)*) => {}; }
#[cfg(not(feature = "log"))]
#[macro_export]
macro_rules! error { ($($arg:tt)*) => {}; }
#[cfg(not(feature = "log"))]
#[macro_export]
macro_rules! trace { ($($arg:tt)*) => {}; }
#[cfg(not(feature = "log"))]
#[macro_export]
macro_rules! warn { ($($arg:tt)*) => {}; }
