// ============================================
// File: crates/warren-common/src/time.rs
// ============================================
//! # Time Utilities
//!
//! ## Creation Reason
//! Provides time-related utilities including atomic timestamps for
//! lock-free last-activity tracking on client instances.
//!
//! ## Main Functionality
//! - `AtomicInstant`: Thread-safe wrapper around `Instant`
//! - `unix_timestamp`: Current wall-clock time in whole seconds
//!
//! ## Main Logical Flow
//! 1. Instances store `AtomicInstant` for last activity tracking
//! 2. The reaper and per-second housekeeping read these for expiry decisions
//! 3. Packet paths update atomically without locks
//!
//! ## ⚠️ Important Note for Next Developer
//! - `AtomicInstant` uses `AtomicU64` internally (nanoseconds since start)
//! - Be aware of potential overflow after ~584 years of uptime
//! - Wall-clock seconds are used only for status rows and route aging

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// ============================================
// AtomicInstant
// ============================================

/// Thread-safe wrapper around [`Instant`] for concurrent access.
///
/// # Purpose
/// Allows multiple tasks to read/write timestamps without locks,
/// essential for hot-path activity tracking on client instances.
///
/// # Implementation
/// Stores nanoseconds elapsed since a reference instant (program start).
/// Uses `AtomicU64` with relaxed ordering for performance.
///
/// # Example
/// ```
/// use warren_common::time::AtomicInstant;
/// use std::time::Instant;
///
/// let atomic = AtomicInstant::now();
/// let instant = atomic.load();
///
/// // Update from another task
/// atomic.store(Instant::now());
/// ```
#[derive(Debug)]
pub struct AtomicInstant {
    /// Nanoseconds since the reference instant
    nanos: AtomicU64,
}

impl AtomicInstant {
    /// Reference instant (lazily initialized at program start).
    fn reference() -> Instant {
        use std::sync::OnceLock;
        static REFERENCE: OnceLock<Instant> = OnceLock::new();
        *REFERENCE.get_or_init(Instant::now)
    }

    /// Creates a new `AtomicInstant` set to the current time.
    #[must_use]
    pub fn now() -> Self {
        Self::from_instant(Instant::now())
    }

    /// Creates a new `AtomicInstant` from an `Instant`.
    #[must_use]
    pub fn from_instant(instant: Instant) -> Self {
        let reference = Self::reference();
        let nanos = instant
            .checked_duration_since(reference)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self {
            nanos: AtomicU64::new(nanos),
        }
    }

    /// Loads the stored instant.
    ///
    /// Uses `Relaxed` ordering for best performance.
    #[must_use]
    pub fn load(&self) -> Instant {
        let nanos = self.nanos.load(Ordering::Relaxed);
        Self::reference() + Duration::from_nanos(nanos)
    }

    /// Stores a new instant.
    ///
    /// Uses `Relaxed` ordering for best performance.
    pub fn store(&self, instant: Instant) {
        let reference = Self::reference();
        let nanos = instant
            .checked_duration_since(reference)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        self.nanos.store(nanos, Ordering::Relaxed);
    }

    /// Updates to the current time and returns the previous value.
    pub fn touch(&self) -> Instant {
        let old = self.load();
        self.store(Instant::now());
        old
    }

    /// Returns the elapsed time since the stored instant.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.load().elapsed()
    }

    /// Checks if more than `duration` has elapsed since the stored instant.
    #[must_use]
    pub fn has_elapsed(&self, duration: Duration) -> bool {
        self.elapsed() > duration
    }
}

impl Default for AtomicInstant {
    fn default() -> Self {
        Self::now()
    }
}

impl Clone for AtomicInstant {
    fn clone(&self) -> Self {
        Self {
            nanos: AtomicU64::new(self.nanos.load(Ordering::Relaxed)),
        }
    }
}

// ============================================
// Wall-Clock Helpers
// ============================================

/// Returns the current Unix timestamp in seconds.
///
/// Used for status rows ("connected since") and route aging, where a
/// wall-clock second granularity matches the housekeeping cadence.
#[must_use]
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System time before Unix epoch")
        .as_secs() as i64
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_atomic_instant_basic() {
        let atomic = AtomicInstant::now();
        let loaded = atomic.load();

        // Should be very close to now
        assert!(loaded.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_atomic_instant_store() {
        let atomic = AtomicInstant::now();
        thread::sleep(Duration::from_millis(10));

        let before = atomic.load();
        atomic.store(Instant::now());
        let after = atomic.load();

        assert!(after > before);
    }

    #[test]
    fn test_atomic_instant_elapsed() {
        let atomic = AtomicInstant::now();
        thread::sleep(Duration::from_millis(10));

        assert!(atomic.elapsed() >= Duration::from_millis(10));
        assert!(atomic.has_elapsed(Duration::from_millis(5)));
    }

    #[test]
    fn test_unix_timestamp_sane() {
        let ts = unix_timestamp();
        // After 2020, before 2100
        assert!(ts > 1_577_836_800);
        assert!(ts < 4_102_444_800);
    }
}
