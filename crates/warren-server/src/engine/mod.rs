// ============================================
// File: crates/warren-server/src/engine/mod.rs
// ============================================
//! # Multi-Client Engine
//!
//! ## Creation Reason
//! The engine is the core of the server: it owns the client registry,
//! the routing table, the virtual-address pool, the wake-up scheduler,
//! the deferred set and the reaper, and applies the routing decisions
//! to every frame crossing the wire socket or the virtual interface.
//!
//! ## Main Functionality
//!
//! ### Submodules
//! - [`instance`]: client instances and the three registry views
//! - [`routes`]: routing table with longest-prefix matching
//! - [`pool`]: virtual-address pool and persistence
//! - [`scheduler`]: per-instance wake-up min-heap
//! - [`deferred`]: FIFO-across-instances deferred output index
//! - [`reaper`]: budgeted route sweeps
//!
//! ## Frame Flow
//! ```text
//! wire ──► process_incoming_link ──► decrypt ──► learn src ──┐
//!                                                            ├─► vif
//!                                                            ├─► peer (c2c)
//!                                                            └─► all peers (bcast)
//! vif ───► process_incoming_vif ──► route dst ──► encrypt ──► peer
//! ```
//! The engine never touches sockets: each call returns a [`Dispatch`]
//! of buffers and the driving loop performs the I/O. That keeps every
//! routing decision synchronous and testable.
//!
//! ## ⚠️ Important Note for Next Developer
//! - All maps are guarded; calls are serialized by the event loop and
//!   the guards only marshal the few auxiliary tasks (stream drivers)
//! - Never hold two engine locks across a pipeline call
//! - A halted instance must be invisible from every lookup path

pub mod deferred;
pub mod instance;
pub mod pool;
pub mod reaper;
pub mod routes;
pub mod scheduler;

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use warren_common::time::unix_timestamp;
use warren_core::addr::{InnerAddr, OuterAddr};
use warren_core::frame::{extract_addrs, TunnelKind};
use warren_core::pipeline::{PipelineAction, PipelineFactory};

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::status::StatusRow;

use self::deferred::DeferredSet;
use self::instance::{ClientInstance, InstanceRegistry, InstanceState};
use self::pool::{AddrPool, PoolPersistence};
use self::reaper::{ReapParams, Reaper};
use self::routes::{RouteFlags, RouteTable, DEFAULT_ROUTE_BUCKETS};
use self::scheduler::WakeupScheduler;

// ============================================
// EngineConfig
// ============================================

/// Engine configuration, extracted from the server configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Whether frames are L3 packets or Ethernet frames.
    pub tunnel_kind: TunnelKind,
    /// Hard cap on concurrent instances.
    pub max_clients: usize,
    /// Per-instance deferred-buffer soft cap.
    pub tcp_queue_limit: usize,
    /// Forward inner frames between peers inside the server.
    pub enable_c2c: bool,
    /// TTL of learned (ageable) routes.
    pub ageable_ttl: Duration,
    /// Reaper tuning.
    pub reap: ReapParams,
    /// Idle window after which an instance is halted.
    pub keepalive_timeout: Duration,
    /// Route-table bucket count.
    pub route_buckets: usize,
    /// Pool network address.
    pub pool_network: Ipv4Addr,
    /// Pool prefix length.
    pub pool_prefix: u8,
    /// The server's own inner address; reserved and never learned.
    pub local_inner: Ipv4Addr,
    /// CIDR routes installed when the named peer establishes:
    /// (network, prefix length, peer identity).
    pub iroutes: Vec<(Ipv4Addr, u8, String)>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tunnel_kind: TunnelKind::Tun,
            max_clients: 1024,
            tcp_queue_limit: 64,
            enable_c2c: false,
            ageable_ttl: Duration::from_secs(60),
            reap: ReapParams::default(),
            keepalive_timeout: Duration::from_secs(120),
            route_buckets: DEFAULT_ROUTE_BUCKETS,
            pool_network: Ipv4Addr::new(10, 8, 0, 0),
            pool_prefix: 24,
            local_inner: Ipv4Addr::new(10, 8, 0, 1),
            iroutes: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Extracts the engine configuration from a validated
    /// [`ServerConfig`].
    ///
    /// # Errors
    /// Returns error for a malformed address range.
    pub fn from_server_config(config: &ServerConfig) -> Result<Self> {
        let (pool_network, pool_prefix) = config.tunnel.parse_address_range()?;

        let mut iroutes = Vec::new();
        for entry in &config.routing.iroutes {
            let (network, prefix) = entry.parse_network()?;
            iroutes.push((network, prefix, entry.common_name.clone()));
        }

        Ok(Self {
            tunnel_kind: config.tunnel.mode,
            max_clients: config.limits.max_clients,
            tcp_queue_limit: config.limits.tcp_queue_limit,
            enable_c2c: config.routing.enable_c2c,
            ageable_ttl: config.routing.ageable_ttl(),
            reap: config.routing.reap_params(),
            keepalive_timeout: config.limits.session_timeout(),
            route_buckets: DEFAULT_ROUTE_BUCKETS,
            pool_network,
            pool_prefix,
            local_inner: config.tunnel.gateway_ip,
            iroutes,
        })
    }
}

// ============================================
// Dispatch
// ============================================

/// I/O the driving loop must perform after an engine call.
#[derive(Debug, Default)]
pub struct Dispatch {
    /// Plaintext inner frames for the virtual interface.
    pub to_vif: Vec<Bytes>,
    /// Wire frames for specific peers.
    pub to_link: Vec<(Arc<ClientInstance>, Bytes)>,
}

impl Dispatch {
    /// Returns `true` when there is nothing to do.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_vif.is_empty() && self.to_link.is_empty()
    }
}

// ============================================
// EngineCounts
// ============================================

/// Point-in-time structural counters, for logs and invariant checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineCounts {
    /// Registered client instances.
    pub instances: usize,
    /// Routes in the table (including dead ones not yet reaped).
    pub routes: usize,
    /// Outstanding pool assignments.
    pub pool_outstanding: usize,
    /// Scheduled wake-ups.
    pub scheduled: usize,
}

// ============================================
// MultiEngine
// ============================================

/// One engine per server; owns every core structure.
pub struct MultiEngine {
    config: EngineConfig,
    factory: Arc<dyn PipelineFactory>,
    registry: Mutex<InstanceRegistry>,
    routes: Mutex<RouteTable>,
    scheduler: Mutex<WakeupScheduler>,
    pool: Mutex<AddrPool>,
    deferred: Mutex<DeferredSet>,
    reaper: Mutex<Reaper>,
    /// Wall second of the last housekeeping run.
    per_second_trigger: AtomicI64,
    /// Alternates link-first / vif-first dispatch priority.
    io_order_toggle: AtomicBool,
    /// The server's own inner address as a route key.
    local_inner: InnerAddr,
}

impl MultiEngine {
    /// Creates an engine.
    ///
    /// # Errors
    /// Returns error if the pool range is invalid.
    pub fn new(config: EngineConfig, factory: Arc<dyn PipelineFactory>) -> Result<Self> {
        let pool = AddrPool::new(config.pool_network, config.pool_prefix, config.local_inner)?;
        let routes = RouteTable::new(config.route_buckets, config.ageable_ttl);
        let reaper = Reaper::new(routes.bucket_count(), config.reap);
        let local_inner = InnerAddr::ipv4(config.local_inner);

        info!(
            "engine ready: {} mode, max_clients={}, c2c={}, pool {}/{}",
            config.tunnel_kind,
            config.max_clients,
            config.enable_c2c,
            config.pool_network,
            config.pool_prefix
        );

        Ok(Self {
            config,
            factory,
            registry: Mutex::new(InstanceRegistry::new()),
            routes: Mutex::new(routes),
            scheduler: Mutex::new(WakeupScheduler::new()),
            pool: Mutex::new(pool),
            deferred: Mutex::new(DeferredSet::new()),
            reaper: Mutex::new(reaper),
            per_second_trigger: AtomicI64::new(0),
            io_order_toggle: AtomicBool::new(false),
            local_inner,
        })
    }

    /// Engine configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Flips the dispatch priority and returns the new orientation
    /// (`true` = link first).
    pub fn flip_io_order(&self) -> bool {
        !self.io_order_toggle.fetch_xor(true, Ordering::Relaxed)
    }

    /// Structural counters.
    #[must_use]
    pub fn counts(&self) -> EngineCounts {
        EngineCounts {
            instances: self.registry.lock().len(),
            routes: self.routes.lock().len(),
            pool_outstanding: self.pool.lock().outstanding(),
            scheduled: self.scheduler.lock().len(),
        }
    }

    // ========================================
    // Admission
    // ========================================

    /// Returns the instance for a peer, creating one on first contact.
    ///
    /// # Errors
    /// Returns `MaxClientsReached` when the client cap is hit; no
    /// instance, route or pool state is created in that case.
    pub fn instance_for(&self, real: &OuterAddr) -> Result<Arc<ClientInstance>> {
        let mut registry = self.registry.lock();

        if let Some(existing) = registry.lookup_real(real) {
            return Ok(existing);
        }

        if registry.len() >= self.config.max_clients {
            debug!("refusing {}: client limit {} reached", real, self.config.max_clients);
            return Err(ServerError::MaxClientsReached {
                limit: self.config.max_clients,
            });
        }

        let pipeline = self.factory.open(real);
        let inst = registry.create(real.clone(), pipeline);
        drop(registry);

        // First wake-up inside the keepalive window
        self.scheduler
            .lock()
            .schedule(inst.id, Instant::now() + self.config.keepalive_timeout);

        Ok(inst)
    }

    /// Looks up a peer by outer address without creating anything.
    #[must_use]
    pub fn lookup_real(&self, real: &OuterAddr) -> Option<Arc<ClientInstance>> {
        self.registry.lock().lookup_real(real)
    }

    // ========================================
    // Link Input
    // ========================================

    /// Processes one wire frame received from `inst`'s peer.
    pub fn process_incoming_link(&self, inst: &Arc<ClientInstance>, payload: &[u8]) -> Dispatch {
        let mut out = Dispatch::default();
        if inst.is_halted() {
            return out;
        }

        inst.touch();
        inst.stats.record_in(payload.len() as u64);

        if inst.state() == InstanceState::Unassigned {
            inst.set_state(InstanceState::Authenticating);
        }

        let (inner, action) = inst.pipeline().process_incoming_link(payload);
        match action {
            PipelineAction::HardFail => {
                warn!("[{}] pipeline hard failure", inst.msg_prefix());
                self.close_instance(inst, false);
                return out;
            }
            PipelineAction::SoftReset => {
                debug!("[{}] pipeline soft reset", inst.msg_prefix());
                inst.clear_deferred();
            }
            PipelineAction::RekeyRequested => {
                trace!("[{}] rekey requested", inst.msg_prefix());
            }
            PipelineAction::Ok => {}
        }

        if !inst.is_established() && inst.pipeline().is_established() {
            if let Err(e) = self.establish(inst) {
                warn!("[{}] establishment failed: {}", inst.msg_prefix(), e);
                self.close_instance(inst, false);
                return out;
            }
        }

        if let Some(inner) = inner {
            self.route_link_frame(inst, inner, &mut out);
        }

        self.reschedule(inst);
        out
    }

    /// Applies the routing decision to a decrypted inner frame.
    fn route_link_frame(&self, inst: &Arc<ClientInstance>, inner: Bytes, out: &mut Dispatch) {
        let extracted = match extract_addrs(self.config.tunnel_kind, &inner) {
            Ok(e) => e,
            Err(e) => {
                inst.stats.record_format_error();
                debug!("[{}] unroutable frame: {}", inst.msg_prefix(), e);
                return;
            }
        };

        // Learn the inner source, unless it is ours or not unicast
        if extracted.src.is_learnable() && extracted.src != self.local_inner {
            self.routes.lock().learn(extracted.src, inst, unix_timestamp());
        }

        if extracted.class.is_replicated() {
            out.to_link.extend(self.broadcast(&inner, Some(inst)));
            out.to_vif.push(inner);
            return;
        }

        let peer = self.routes.lock().lookup(&extracted.dst, unix_timestamp());
        match peer {
            Some(peer) if self.config.enable_c2c && peer.id != inst.id => {
                trace!(
                    "[{}] c2c {} -> [{}]",
                    inst.msg_prefix(),
                    extracted.dst,
                    peer.msg_prefix()
                );
                if let Some(frame) = self.encrypt_for(&peer, &inner) {
                    out.to_link.push((peer, frame));
                }
            }
            _ => out.to_vif.push(inner),
        }
    }

    // ========================================
    // Virtual-Interface Input
    // ========================================

    /// Processes one frame read from the virtual interface.
    pub fn process_incoming_vif(&self, frame: &[u8]) -> Dispatch {
        let mut out = Dispatch::default();

        let extracted = match extract_addrs(self.config.tunnel_kind, frame) {
            Ok(e) => e,
            Err(e) => {
                debug!("unroutable frame from interface: {}", e);
                return out;
            }
        };

        if extracted.class.is_replicated() {
            out.to_link.extend(self.broadcast(frame, None));
            return out;
        }

        let peer = self.routes.lock().lookup(&extracted.dst, unix_timestamp());
        match peer {
            Some(peer) => {
                if let Some(encrypted) = self.encrypt_for(&peer, frame) {
                    out.to_link.push((peer, encrypted));
                }
            }
            None => {
                // Destined off-tunnel; the kernel owns it
                trace!("no route for {}, dropping", extracted.dst);
            }
        }
        out
    }

    // ========================================
    // Broadcast / C2C
    // ========================================

    /// Replicates `frame` to every established peer except `src`.
    fn broadcast(
        &self,
        frame: &[u8],
        src: Option<&Arc<ClientInstance>>,
    ) -> Vec<(Arc<ClientInstance>, Bytes)> {
        let peers = self.registry.lock().all();
        let mut out = Vec::new();

        for peer in peers {
            if src.is_some_and(|s| s.id == peer.id) || !peer.is_established() {
                continue;
            }
            if let Some(encrypted) = self.encrypt_for(&peer, frame) {
                out.push((peer, encrypted));
            }
        }
        out
    }

    /// Runs `inner` through a peer's pipeline toward the wire.
    fn encrypt_for(&self, peer: &Arc<ClientInstance>, inner: &[u8]) -> Option<Bytes> {
        let (frame, action) = peer.pipeline().process_incoming_tun(inner);
        match action {
            PipelineAction::HardFail => {
                warn!("[{}] pipeline hard failure on encrypt", peer.msg_prefix());
                self.close_instance(peer, false);
                return None;
            }
            PipelineAction::SoftReset => peer.clear_deferred(),
            _ => {}
        }

        let frame = frame?;
        peer.stats.record_out(frame.len() as u64);
        Some(frame)
    }

    // ========================================
    // Establishment
    // ========================================

    /// Promotes an instance once its pipeline reports the connection
    /// established: assigns an inner address and installs its route.
    fn establish(&self, inst: &Arc<ClientInstance>) -> Result<()> {
        let vaddr = self.pool.lock().allocate(&inst.common_name())?;

        self.registry.lock().attach_vaddr(inst, vaddr);
        self.routes.lock().insert_host(
            vaddr,
            Arc::clone(inst),
            RouteFlags::PERMANENT,
            unix_timestamp(),
        );
        inst.set_state(InstanceState::Established);

        self.install_iroutes(inst);

        info!(
            "[{}] established, inner address {}",
            inst.msg_prefix(),
            vaddr
        );
        Ok(())
    }

    /// Installs the configured CIDR routes served by this peer.
    fn install_iroutes(&self, inst: &Arc<ClientInstance>) {
        let identity = inst.common_name();
        let now = unix_timestamp();

        for (network, prefix, who) in &self.config.iroutes {
            if *who != identity {
                continue;
            }
            match InnerAddr::ipv4(*network).with_netbits(*prefix) {
                Ok(key) => {
                    self.routes.lock().insert_iroute(key, Arc::clone(inst), now);
                    inst.did_iroutes.store(true, Ordering::Release);
                    info!("[{}] serves {}", inst.msg_prefix(), key);
                }
                Err(e) => warn!("[{}] bad iroute {}/{}: {}", inst.msg_prefix(), network, prefix, e),
            }
        }
    }

    // ========================================
    // Timers & Housekeeping
    // ========================================

    /// The event-loop wait deadline: the earliest scheduled wake-up,
    /// capped so housekeeping still runs.
    #[must_use]
    pub fn deadline(&self, now: Instant) -> Instant {
        let cap = now + Duration::from_secs(self.config.reap.max_wakeup_secs);
        match self.scheduler.lock().peek_earliest() {
            Some((_, at)) if at < cap => at.max(now),
            _ => cap,
        }
    }

    /// Wakes every instance whose timer expired.
    ///
    /// Expired keepalive windows halt the instance; live instances get
    /// pipeline CPU, drain pending output and are rescheduled.
    pub fn process_timeouts(&self, now: Instant) -> Dispatch {
        let due = self.scheduler.lock().pop_due(now);
        let mut out = Dispatch::default();

        for id in due {
            let Some(inst) = self.registry.lock().instance(id) else {
                continue;
            };
            if inst.is_halted() {
                continue;
            }

            if inst.is_expired(self.config.keepalive_timeout) {
                info!("[{}] inactivity timeout", inst.msg_prefix());
                self.close_instance(&inst, false);
                continue;
            }

            while let Some(frame) = inst.pipeline().process_outgoing_link() {
                inst.stats.record_out(frame.len() as u64);
                out.to_link.push((Arc::clone(&inst), frame));
            }
            while let Some(frame) = inst.pipeline().process_outgoing_tun() {
                out.to_vif.push(frame);
            }

            self.reschedule(&inst);
        }
        out
    }

    /// Per-second housekeeping: idle-instance expiry and one reaper
    /// pass. Gated to at most once per wall second.
    pub fn per_second(&self) {
        let now_unix = unix_timestamp();
        if self.per_second_trigger.swap(now_unix, Ordering::Relaxed) == now_unix {
            return;
        }

        let all = self.registry.lock().all();
        for inst in all {
            if inst.is_expired(self.config.keepalive_timeout) {
                info!("[{}] inactivity timeout", inst.msg_prefix());
                self.close_instance(&inst, false);
            }
        }

        let mut routes = self.routes.lock();
        self.reaper.lock().process(&mut routes, now_unix);
    }

    /// Reports the pipeline's next wake-up to the scheduler and
    /// refreshes the stream interest mask.
    fn reschedule(&self, inst: &Arc<ClientInstance>) {
        let now = Instant::now();
        let ps = inst.pipeline().pre_select(now);
        inst.set_rwflags(ps.wants_read, ps.wants_write);

        let wake = ps
            .next_wake
            .unwrap_or(now + Duration::from_secs(self.config.reap.max_wakeup_secs));
        self.scheduler.lock().schedule(inst.id, wake);
    }

    // ========================================
    // Deferred Output
    // ========================================

    /// Marks an instance as having deferred wire output.
    pub fn mark_deferred(&self, inst: &Arc<ClientInstance>) {
        self.deferred.lock().enqueue(inst.id);
    }

    /// Returns `true` while any instance has deferred wire output.
    #[must_use]
    pub fn has_deferred(&self) -> bool {
        !self.deferred.lock().is_empty()
    }

    /// Next instance with deferred output, FIFO across instances.
    #[must_use]
    pub fn next_deferred(&self) -> Option<Arc<ClientInstance>> {
        loop {
            let id = self.deferred.lock().next()?;
            if let Some(inst) = self.registry.lock().instance(id) {
                if !inst.is_halted() {
                    return Some(inst);
                }
            }
        }
    }

    // ========================================
    // Teardown
    // ========================================

    /// Halts an instance and detaches it from every structure.
    ///
    /// Learned routes die lazily via the staleness check; the
    /// instance's own address route is removed with its pool handle.
    pub fn close_instance(&self, inst: &Arc<ClientInstance>, shutdown: bool) {
        if !inst.set_halt() {
            return;
        }
        inst.set_state(InstanceState::Halting);

        self.registry.lock().remove(inst);
        self.scheduler.lock().remove(inst.id);
        self.deferred.lock().remove(inst.id);
        inst.clear_deferred();
        inst.wake_outbound();

        if let Some(vaddr) = inst.vaddr() {
            self.routes.lock().delete(&vaddr);
            self.pool.lock().release(&vaddr);
        }

        info!(
            "[{}] instance closed{}",
            inst.msg_prefix(),
            if shutdown { " (shutdown)" } else { "" }
        );
    }

    /// Closes instances idle for more than half the keepalive window
    /// (soft restart).
    pub fn close_idle(&self) {
        let threshold = self.config.keepalive_timeout / 2;
        let all = self.registry.lock().all();
        for inst in all {
            if inst.idle_time() > threshold {
                self.close_instance(&inst, false);
            }
        }
    }

    /// Closes every instance (hard restart / exit).
    pub fn drain(&self) {
        let all = self.registry.lock().all();
        info!("draining {} instances", all.len());
        for inst in all {
            self.close_instance(&inst, true);
        }
    }

    // ========================================
    // Status & Persistence
    // ========================================

    /// Current status rows, ordered by instance id.
    #[must_use]
    pub fn status_rows(&self) -> Vec<StatusRow> {
        let mut instances = self.registry.lock().all();
        instances.sort_by_key(|i| i.id);

        instances
            .iter()
            .map(|inst| {
                let stats = inst.stats.snapshot();
                StatusRow {
                    common_name: inst.common_name(),
                    real_addr: inst.real.to_string(),
                    virtual_addr: inst.vaddr().map(|v| v.to_string()),
                    bytes_in: stats.bytes_in,
                    bytes_out: stats.bytes_out,
                    connected_since: inst.created_unix,
                }
            })
            .collect()
    }

    /// Restores pool assignments from a persistence store.
    pub fn restore_pool(&self, store: &dyn PoolPersistence) {
        match store.load() {
            Ok(map) => self.pool.lock().restore(map),
            Err(e) => warn!("pool restore failed: {}", e),
        }
    }

    /// Saves pool assignments to a persistence store.
    pub fn persist_pool(&self, store: &dyn PoolPersistence) {
        let snapshot = self.pool.lock().snapshot();
        if let Err(e) = store.save(&snapshot) {
            warn!("pool persist failed: {}", e);
        }
    }
}

impl std::fmt::Debug for MultiEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts = self.counts();
        f.debug_struct("MultiEngine")
            .field("instances", &counts.instances)
            .field("routes", &counts.routes)
            .field("pool_outstanding", &counts.pool_outstanding)
            .field("scheduled", &counts.scheduled)
            .finish()
    }
}

// ============================================
// Tests
// ============================================
