//! Tuning constants and segment-sizing limits.
//!
//! These are the compiled-in defaults; [`crate::config::Config`] overrides
//! them from a TOML file or environment variables at runtime.

use std::time::Duration;

/// Minimum shared segment size in bytes (one page).
pub const SHM_MIN_SIZE: usize = 4096;

/// Maximum shared segment size in bytes.
pub const SHM_MAX_SIZE: usize = 1_073_741_824;

/// CPU cache line size, used to align the segment header and hot records.
pub const CACHE_LINE_SIZE: usize = 64;

/// Default absolute deadline for a single module lock acquisition.
pub const DEFAULT_MODULE_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of retries while a module's `applying_changes` flag blocks
/// another commit from proceeding.
pub const DEFAULT_COMMIT_STEP_COUNT: u32 = 50;

/// Default sleep between `applying_changes` contention retries.
pub const DEFAULT_COMMIT_STEP_SLEEP: Duration = Duration::from_millis(10);

/// Default initial size of a freshly created segment.
pub const DEFAULT_INITIAL_SEGMENT_SIZE: usize = SHM_MIN_SIZE * 4;

/// Default growth increment applied by `remap` when more room is needed.
pub const DEFAULT_SEGMENT_GROWTH: usize = SHM_MIN_SIZE * 4;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_bounds_are_sane() {
        assert!(SHM_MIN_SIZE < SHM_MAX_SIZE);
        assert!(DEFAULT_INITIAL_SEGMENT_SIZE >= SHM_MIN_SIZE);
    }

    #[test]
    fn commit_step_budget_is_nonzero() {
        assert!(DEFAULT_COMMIT_STEP_COUNT > 0);
        assert!(DEFAULT_COMMIT_STEP_SLEEP.as_millis() > 0);
    }
}
