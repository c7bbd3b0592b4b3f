//! Utility functions and helpers.

pub mod env;

pub use env::{get_env_with_prefix, parse_flag};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as Unix seconds.
///
/// A clock set before 1970 reads as 0.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
