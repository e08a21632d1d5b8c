// ============================================
// File: crates/warren-server/src/engine/instance.rs
// ============================================
//! # Client Instances and Registry
//!
//! ## Creation Reason
//! Represents one logical peer connection and the three views the
//! engine keeps over the set of live connections: by outer (real)
//! address, by inner (virtual) address, and an iteration-friendly map.
//!
//! ## Main Functionality
//! - `ClientInstance`: per-peer state (pipeline, counters, deferred
//!   output, lifecycle flags)
//! - `InstanceRegistry`: the three registry views
//! - `InstanceState`: lifecycle state machine
//!
//! ## Instance Lifecycle
//! ```text
//! ┌────────────┐ first link  ┌────────────────┐ pipeline ready ┌─────────────┐
//! │ Unassigned │ ──────────► │ Authenticating │ ─────────────► │ Established │
//! └────────────┘   packet    └────────────────┘                └──────┬──────┘
//!                                                                     │
//!                    hard-fail / signal / disconnect / eviction       │
//!                                     ▼                               │
//!                               ┌──────────┐ ◄───────────────────────┘
//!                               │ Halting  │  freed when the last
//!                               └──────────┘  strong reference drops
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Instances are shared (`Arc`) between registry views, routes and
//!   the scheduler; the halt flag is what lookups filter on
//! - A halted instance is never returned from any lookup
//! - Counters are atomic so the packet paths stay lock-free

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard, RwLock};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use warren_common::time::{unix_timestamp, AtomicInstant};
use warren_core::addr::{InnerAddr, OuterAddr};
use warren_core::pipeline::PacketPipeline;

// ============================================
// Constants
// ============================================

/// Hard bound factor: a deferred queue may grow to this multiple of
/// `tcp_queue_limit` before the instance is halted outright.
pub const DEFERRED_HARD_FACTOR: usize = 4;

/// Read-interest bit of the stream rwflags mask.
pub const RW_READ: u8 = 1 << 0;

/// Write-interest bit of the stream rwflags mask.
pub const RW_WRITE: u8 = 1 << 1;

// ============================================
// InstanceId
// ============================================

/// Monotonic identifier of a client instance within one engine.
pub type InstanceId = u64;

// ============================================
// InstanceState
// ============================================

/// Lifecycle states of a client instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Created; no inner address yet.
    Unassigned,
    /// Pipeline performing its handshake.
    Authenticating,
    /// Data flowing.
    Established,
    /// Halt set; draining references.
    Halting,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unassigned => write!(f, "Unassigned"),
            Self::Authenticating => write!(f, "Authenticating"),
            Self::Established => write!(f, "Established"),
            Self::Halting => write!(f, "Halting"),
        }
    }
}

// ============================================
// InstanceStats
// ============================================

/// Per-instance traffic and error counters.
#[derive(Debug, Default)]
pub struct InstanceStats {
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub packets_in: AtomicU64,
    pub packets_out: AtomicU64,
    pub format_errors: AtomicU64,
    pub dropped_frames: AtomicU64,
}

impl InstanceStats {
    pub fn record_in(&self, bytes: u64) {
        self.bytes_in.fetch_add(bytes, Ordering::Relaxed);
        self.packets_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_out(&self, bytes: u64) {
        self.bytes_out.fetch_add(bytes, Ordering::Relaxed);
        self.packets_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_format_error(&self) {
        self.format_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            packets_in: self.packets_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            format_errors: self.format_errors.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`InstanceStats`].
#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub packets_in: u64,
    pub packets_out: u64,
    pub format_errors: u64,
    pub dropped_frames: u64,
}

// ============================================
// DeferredPush
// ============================================

/// Outcome of queueing a frame on an instance's deferred buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredPush {
    /// Frame queued for a later flush.
    Queued,
    /// Queue beyond the soft limit; frame dropped, instance continues.
    Dropped,
    /// Queue beyond the hard bound; the instance must be halted.
    Overflow,
}

// ============================================
// ClientInstance
// ============================================

/// One logical peer connection.
pub struct ClientInstance {
    /// Registry identifier.
    pub id: InstanceId,
    /// Peer outer address; primary key of the real view.
    pub real: OuterAddr,
    /// Log prefix identifying this instance.
    msg_prefix: String,
    /// Identity shown in status rows (peer address until known better).
    common_name: RwLock<String>,
    state: RwLock<InstanceState>,
    halt: AtomicBool,
    /// Wall-clock creation time, for status rows.
    pub created_unix: i64,
    /// Last packet activity, for the keepalive window.
    pub last_activity: AtomicInstant,
    vaddr: RwLock<Option<InnerAddr>>,
    pipeline: Mutex<Box<dyn PacketPipeline>>,
    /// Traffic counters.
    pub stats: InstanceStats,
    /// Outbound wire buffers awaiting a writable stream socket.
    deferred: Mutex<VecDeque<Bytes>>,
    /// Wakes the stream driver when deferred output appears.
    outbound_notify: Notify,
    /// Requested stream read/write interest mask.
    rwflags: AtomicU8,
    /// Pipeline context opened.
    pub did_open_context: AtomicBool,
    /// Present in the real view.
    pub did_real_hash: AtomicBool,
    /// Present in the iteration view.
    pub did_iter: AtomicBool,
    /// CIDR routes installed on behalf of this peer.
    pub did_iroutes: AtomicBool,
}

impl ClientInstance {
    fn new(id: InstanceId, real: OuterAddr, pipeline: Box<dyn PacketPipeline>) -> Self {
        let msg_prefix = format!("{real}#{id}");
        Self {
            id,
            common_name: RwLock::new(real.to_string()),
            real,
            msg_prefix,
            state: RwLock::new(InstanceState::Unassigned),
            halt: AtomicBool::new(false),
            created_unix: unix_timestamp(),
            last_activity: AtomicInstant::now(),
            vaddr: RwLock::new(None),
            pipeline: Mutex::new(pipeline),
            stats: InstanceStats::default(),
            deferred: Mutex::new(VecDeque::new()),
            outbound_notify: Notify::new(),
            rwflags: AtomicU8::new(RW_READ),
            did_open_context: AtomicBool::new(true),
            did_real_hash: AtomicBool::new(false),
            did_iter: AtomicBool::new(false),
            did_iroutes: AtomicBool::new(false),
        }
    }

    // ========================================
    // Lifecycle
    // ========================================

    /// Returns `true` once the instance is terminating.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halt.load(Ordering::Acquire)
    }

    /// Latches the halt flag; returns `true` on the first call.
    pub fn set_halt(&self) -> bool {
        !self.halt.swap(true, Ordering::AcqRel)
    }

    #[must_use]
    pub fn state(&self) -> InstanceState {
        *self.state.read()
    }

    pub fn set_state(&self, state: InstanceState) {
        *self.state.write() = state;
    }

    /// `true` while data may flow to this peer.
    #[must_use]
    pub fn is_established(&self) -> bool {
        !self.is_halted() && self.state() == InstanceState::Established
    }

    // ========================================
    // Activity
    // ========================================

    pub fn touch(&self) {
        self.last_activity.store(std::time::Instant::now());
    }

    #[must_use]
    pub fn idle_time(&self) -> Duration {
        self.last_activity.elapsed()
    }

    #[must_use]
    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.idle_time() > timeout
    }

    // ========================================
    // Identity
    // ========================================

    #[must_use]
    pub fn msg_prefix(&self) -> &str {
        &self.msg_prefix
    }

    #[must_use]
    pub fn common_name(&self) -> String {
        self.common_name.read().clone()
    }

    pub fn set_common_name(&self, name: impl Into<String>) {
        *self.common_name.write() = name.into();
    }

    #[must_use]
    pub fn vaddr(&self) -> Option<InnerAddr> {
        *self.vaddr.read()
    }

    fn set_vaddr(&self, addr: Option<InnerAddr>) {
        *self.vaddr.write() = addr;
    }

    // ========================================
    // Pipeline
    // ========================================

    /// Locks the opaque processing pipeline.
    pub fn pipeline(&self) -> MutexGuard<'_, Box<dyn PacketPipeline>> {
        self.pipeline.lock()
    }

    // ========================================
    // Deferred Output
    // ========================================

    /// Queues an outbound wire buffer for a blocked stream socket.
    ///
    /// `limit` is the configured soft cap (`tcp_queue_limit`); beyond
    /// it frames are dropped, and beyond `limit * DEFERRED_HARD_FACTOR`
    /// the caller must halt the instance.
    pub fn push_deferred(&self, frame: Bytes, limit: usize) -> DeferredPush {
        let mut queue = self.deferred.lock();
        let len = queue.len();

        if len >= limit * DEFERRED_HARD_FACTOR {
            self.stats.record_drop();
            return DeferredPush::Overflow;
        }
        if len >= limit {
            self.stats.record_drop();
            return DeferredPush::Dropped;
        }

        queue.push_back(frame);
        drop(queue);
        self.outbound_notify.notify_one();
        DeferredPush::Queued
    }

    /// Takes the oldest deferred buffer.
    pub fn pop_deferred(&self) -> Option<Bytes> {
        self.deferred.lock().pop_front()
    }

    /// Puts a buffer back at the front after a failed flush attempt.
    pub fn unpop_deferred(&self, frame: Bytes) {
        self.deferred.lock().push_front(frame);
    }

    /// Number of queued deferred buffers.
    #[must_use]
    pub fn deferred_len(&self) -> usize {
        self.deferred.lock().len()
    }

    /// Discards all queued output (soft reset, close).
    pub fn clear_deferred(&self) {
        self.deferred.lock().clear();
    }

    /// Waits until deferred output appears (stream driver).
    pub async fn outbound_ready(&self) {
        self.outbound_notify.notified().await;
    }

    /// Wakes the stream driver without queueing (close notification).
    pub fn wake_outbound(&self) {
        self.outbound_notify.notify_one();
    }

    // ========================================
    // Stream Interest Mask
    // ========================================

    pub fn set_rwflags(&self, read: bool, write: bool) {
        let mask = u8::from(read) * RW_READ | u8::from(write) * RW_WRITE;
        self.rwflags.store(mask, Ordering::Relaxed);
    }

    #[must_use]
    pub fn rwflags(&self) -> u8 {
        self.rwflags.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ClientInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientInstance")
            .field("id", &self.id)
            .field("real", &self.real)
            .field("state", &self.state())
            .field("halt", &self.is_halted())
            .field("vaddr", &self.vaddr())
            .field("deferred", &self.deferred_len())
            .finish_non_exhaustive()
    }
}

// ============================================
// InstanceRegistry
// ============================================

/// The three views over the set of live client instances.
///
/// Serialized by the engine; not internally thread-safe beyond the
/// per-instance atomics.
#[derive(Default)]
pub struct InstanceRegistry {
    by_real: HashMap<OuterAddr, Arc<ClientInstance>>,
    by_vaddr: HashMap<InnerAddr, Arc<ClientInstance>>,
    iter: HashMap<InstanceId, Arc<ClientInstance>>,
    next_id: InstanceId,
}

impl InstanceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and registers an instance for a newly seen peer.
    pub fn create(
        &mut self,
        real: OuterAddr,
        pipeline: Box<dyn PacketPipeline>,
    ) -> Arc<ClientInstance> {
        self.next_id += 1;
        let instance = Arc::new(ClientInstance::new(self.next_id, real.clone(), pipeline));

        self.by_real.insert(real, Arc::clone(&instance));
        instance.did_real_hash.store(true, Ordering::Release);

        self.iter.insert(instance.id, Arc::clone(&instance));
        instance.did_iter.store(true, Ordering::Release);

        info!("[{}] instance created", instance.msg_prefix());
        instance
    }

    /// Looks up by outer address; halted instances are invisible.
    #[must_use]
    pub fn lookup_real(&self, real: &OuterAddr) -> Option<Arc<ClientInstance>> {
        self.by_real
            .get(real)
            .filter(|i| !i.is_halted())
            .map(Arc::clone)
    }

    /// Looks up by inner address; halted instances are invisible.
    #[must_use]
    pub fn lookup_vaddr(&self, vaddr: &InnerAddr) -> Option<Arc<ClientInstance>> {
        self.by_vaddr
            .get(vaddr)
            .filter(|i| !i.is_halted())
            .map(Arc::clone)
    }

    /// Looks up by registry id.
    #[must_use]
    pub fn instance(&self, id: InstanceId) -> Option<Arc<ClientInstance>> {
        self.iter.get(&id).map(Arc::clone)
    }

    /// Binds an inner address to an instance in the virtual view.
    pub fn attach_vaddr(&mut self, instance: &Arc<ClientInstance>, vaddr: InnerAddr) {
        if let Some(previous) = self.by_vaddr.insert(vaddr, Arc::clone(instance)) {
            if previous.id != instance.id {
                warn!(
                    "[{}] inner address {} taken over from instance {}",
                    instance.msg_prefix(),
                    vaddr,
                    previous.id
                );
            }
        }
        instance.set_vaddr(Some(vaddr));
        debug!("[{}] assigned inner address {}", instance.msg_prefix(), vaddr);
    }

    /// Removes an instance from every view.
    pub fn remove(&mut self, instance: &Arc<ClientInstance>) {
        if self.by_real.remove(&instance.real).is_some() {
            instance.did_real_hash.store(false, Ordering::Release);
        }
        if let Some(vaddr) = instance.vaddr() {
            // Only remove the mapping if it still points at us
            if self
                .by_vaddr
                .get(&vaddr)
                .is_some_and(|i| i.id == instance.id)
            {
                self.by_vaddr.remove(&vaddr);
            }
        }
        if self.iter.remove(&instance.id).is_some() {
            instance.did_iter.store(false, Ordering::Release);
        }
    }

    /// Number of registered instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.iter.len()
    }

    /// Returns `true` when no instances are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.iter.is_empty()
    }

    /// Snapshot of every registered instance (iteration view).
    #[must_use]
    pub fn all(&self) -> Vec<Arc<ClientInstance>> {
        self.iter.values().map(Arc::clone).collect()
    }
}

impl std::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("instances", &self.iter.len())
            .field("by_real", &self.by_real.len())
            .field("by_vaddr", &self.by_vaddr.len())
            .finish()
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use warren_core::pipeline::NullPipeline;

    fn real(port: u16) -> OuterAddr {
        OuterAddr::Ip(SocketAddr::from(([203, 0, 113, 9], port)))
    }

    fn registry_with_one() -> (InstanceRegistry, Arc<ClientInstance>) {
        let mut reg = InstanceRegistry::new();
        let inst = reg.create(real(5000), Box::new(NullPipeline::new()));
        (reg, inst)
    }

    #[test]
    fn test_create_and_lookup_real() {
        let (reg, inst) = registry_with_one();

        let found = reg.lookup_real(&real(5000)).unwrap();
        assert_eq!(found.id, inst.id);
        assert!(inst.did_real_hash.load(Ordering::Acquire));
        assert!(inst.did_iter.load(Ordering::Acquire));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_halted_is_invisible() {
        let (reg, inst) = registry_with_one();

        inst.set_halt();
        assert!(reg.lookup_real(&real(5000)).is_none());
    }

    #[test]
    fn test_vaddr_view() {
        let (mut reg, inst) = registry_with_one();
        let vaddr = InnerAddr::ipv4("10.8.0.2".parse().unwrap());

        reg.attach_vaddr(&inst, vaddr);
        assert_eq!(inst.vaddr(), Some(vaddr));

        let found = reg.lookup_vaddr(&vaddr).unwrap();
        assert_eq!(found.id, inst.id);
    }

    #[test]
    fn test_remove_clears_all_views() {
        let (mut reg, inst) = registry_with_one();
        let vaddr = InnerAddr::ipv4("10.8.0.2".parse().unwrap());
        reg.attach_vaddr(&inst, vaddr);

        reg.remove(&inst);

        assert!(reg.lookup_real(&real(5000)).is_none());
        assert!(reg.lookup_vaddr(&vaddr).is_none());
        assert!(reg.is_empty());
        assert!(!inst.did_real_hash.load(Ordering::Acquire));
    }

    #[test]
    fn test_state_machine_transitions() {
        let (_reg, inst) = registry_with_one();
        assert_eq!(inst.state(), InstanceState::Unassigned);

        inst.set_state(InstanceState::Authenticating);
        assert!(!inst.is_established());

        inst.set_state(InstanceState::Established);
        assert!(inst.is_established());

        inst.set_halt();
        inst.set_state(InstanceState::Halting);
        assert!(!inst.is_established());
    }

    #[test]
    fn test_halt_latches_once() {
        let (_reg, inst) = registry_with_one();
        assert!(inst.set_halt());
        assert!(!inst.set_halt());
    }

    #[test]
    fn test_deferred_limits() {
        let (_reg, inst) = registry_with_one();
        let limit = 2;

        assert_eq!(inst.push_deferred(Bytes::from_static(b"a"), limit), DeferredPush::Queued);
        assert_eq!(inst.push_deferred(Bytes::from_static(b"b"), limit), DeferredPush::Queued);

        // Soft limit reached: dropped, instance keeps running
        assert_eq!(inst.push_deferred(Bytes::from_static(b"c"), limit), DeferredPush::Dropped);
        assert_eq!(inst.stats.snapshot().dropped_frames, 1);
        assert_eq!(inst.deferred_len(), 2);
    }

    #[test]
    fn test_deferred_hard_overflow() {
        let (_reg, inst) = registry_with_one();
        let limit = 2;

        // Fill past the hard bound using a permissive soft limit
        for _ in 0..(limit * DEFERRED_HARD_FACTOR) {
            assert_eq!(
                inst.push_deferred(Bytes::from_static(b"x"), limit * DEFERRED_HARD_FACTOR),
                DeferredPush::Queued
            );
        }
        assert_eq!(
            inst.push_deferred(Bytes::from_static(b"y"), limit),
            DeferredPush::Overflow
        );
    }

    #[test]
    fn test_deferred_fifo() {
        let (_reg, inst) = registry_with_one();

        inst.push_deferred(Bytes::from_static(b"first"), 8);
        inst.push_deferred(Bytes::from_static(b"second"), 8);

        assert_eq!(inst.pop_deferred().unwrap(), Bytes::from_static(b"first"));
        inst.unpop_deferred(Bytes::from_static(b"first"));
        assert_eq!(inst.pop_deferred().unwrap(), Bytes::from_static(b"first"));
        assert_eq!(inst.pop_deferred().unwrap(), Bytes::from_static(b"second"));
    }

    #[test]
    fn test_rwflags() {
        let (_reg, inst) = registry_with_one();
        assert_eq!(inst.rwflags(), RW_READ);

        inst.set_rwflags(true, true);
        assert_eq!(inst.rwflags(), RW_READ | RW_WRITE);

        inst.set_rwflags(false, false);
        assert_eq!(inst.rwflags(), 0);
    }
}
