//! # Slipstream Common
//!
//! Shared utilities for the Slipstream offline delivery layer:
//!
//! - Logging configuration and setup
//! - Wall-clock helpers for capture timestamps

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Used for capture timestamps on cached entries and as the key space for
/// queued requests. Clock regressions are clamped to zero rather than
/// panicking.
pub fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
