// ============================================
// File: crates/warren-server/src/engine/reaper.rs
// ============================================
//! # Route-Table Reaper
//!
//! ## Creation Reason
//! The route table can be large, so dead entries are not collected in
//! one sweep: the reaper walks a bounded window of buckets per wall
//! second, wrapping around, so no pass dominates the loop.
//!
//! ## Main Functionality
//! - `Reaper`: per-second budgeted sweep state
//! - `ReapParams`: tuning knobs with the canonical defaults
//!
//! ## Budget
//! `buckets_per_pass = max(min, min(max, bucket_count / divisor))`,
//! sized so the full table is covered within the wake-up cap.
//!
//! ## ⚠️ Important Note for Next Developer
//! - `process` must be called from the housekeeping path at least once
//!   per `max_wakeup_secs`; the event-loop timeout is capped to
//!   guarantee that

use tracing::trace;

use super::routes::RouteTable;

// ============================================
// ReapParams
// ============================================

/// Reaper tuning parameters.
#[derive(Debug, Clone, Copy)]
pub struct ReapParams {
    /// Reap at least once per this many seconds; also the event-loop
    /// timeout cap.
    pub max_wakeup_secs: u64,
    /// How many passes cover the whole table.
    pub divisor: usize,
    /// Minimum buckets per pass.
    pub min: usize,
    /// Maximum buckets per pass.
    pub max: usize,
}

impl Default for ReapParams {
    fn default() -> Self {
        Self {
            max_wakeup_secs: 10,
            divisor: 256,
            min: 16,
            max: 1024,
        }
    }
}

impl ReapParams {
    /// Buckets scanned per pass for a table of `bucket_count` buckets.
    #[must_use]
    pub fn buckets_per_pass(&self, bucket_count: usize) -> usize {
        (bucket_count / self.divisor).clamp(self.min, self.max)
    }
}

// ============================================
// Reaper
// ============================================

/// Budgeted background sweep over the route table.
#[derive(Debug)]
pub struct Reaper {
    bucket_base: usize,
    buckets_per_pass: usize,
    last_call: i64,
}

impl Reaper {
    /// Creates a reaper for a table of `bucket_count` buckets.
    #[must_use]
    pub fn new(bucket_count: usize, params: ReapParams) -> Self {
        Self {
            bucket_base: 0,
            buckets_per_pass: params.buckets_per_pass(bucket_count),
            last_call: 0,
        }
    }

    /// Buckets scanned each pass.
    #[must_use]
    pub const fn buckets_per_pass(&self) -> usize {
        self.buckets_per_pass
    }

    /// Next bucket window start.
    #[must_use]
    pub const fn bucket_base(&self) -> usize {
        self.bucket_base
    }

    /// Runs one pass if none ran during this wall second.
    ///
    /// Returns the number of routes removed, or `None` when gated.
    pub fn process(&mut self, routes: &mut RouteTable, now: i64) -> Option<usize> {
        if self.last_call == now {
            return None;
        }
        self.last_call = now;

        let removed = routes.reap_pass(self.bucket_base, self.buckets_per_pass, now);
        self.bucket_base = (self.bucket_base + self.buckets_per_pass) % routes.bucket_count();

        trace!(
            "reap pass done, base now {}, removed {}",
            self.bucket_base,
            removed
        );
        Some(removed)
    }
}

// ============================================
// Tests
// ============================================
