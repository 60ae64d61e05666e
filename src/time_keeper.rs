//! Process-wide logical clock.
//!
//! Every public dictionary entry point refreshes the clock; writers read it
//! when stamping historical counters so that one call observes one "now".
//! The value tracks wall-clock seconds but never moves backwards within a
//! run, even if the system clock does.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static CURRENT: AtomicU64 = AtomicU64::new(0);

fn wall_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Advance the clock to wall time, clamped to be monotonic.
pub fn set_current_time() {
    let now = wall_seconds();
    CURRENT.fetch_max(now, Ordering::Relaxed);
}

/// The timestamp observed by the current public call, as a 32-bit value
/// matching the on-disk counter width.
pub fn current_time() -> u32 {
    CURRENT.load(Ordering::Relaxed).min(u32::MAX as u64) as u32
}

/// Pin the clock to a known value. Test-only.
#[cfg(test)]
pub fn set_for_test(seconds: u64) {
    CURRENT.store(seconds, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        set_for_test(1_000_000);
        assert_eq!(current_time(), 1_000_000);
        // A refresh never moves the clock backwards.
        set_current_time();
        let t0 = current_time();
        set_current_time();
        assert!(current_time() >= t0);
        assert!(t0 >= 1_000_000 || t0 == 1_000_000);
    }
}
