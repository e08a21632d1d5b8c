// ============================================
// File: crates/warren-server/src/engine/routes.rs
// ============================================
//! # Routing Table
//!
//! ## Creation Reason
//! Maps inner addresses to the client instance that reaches them:
//! learned host routes from observed traffic, the peers' own assigned
//! addresses, and CIDR routes for networks behind a peer.
//!
//! ## Main Functionality
//! - `RouteTable`: bucketed hash of host and CIDR routes
//! - Exact host lookup, then longest-prefix CIDR walk
//! - CIDR-length helper tracking active prefix lengths (descending)
//! - Generation-based invalidation of cached host routes
//! - Budgeted reap pass over a bucket window
//!
//! ## Staleness Rules
//! A route is dead when any of these holds:
//! - its instance is halted,
//! - it is a cache route and its generation is not the table's,
//! - it is ageable and `last_reference + ageable_ttl < now`.
//! Lookups skip dead routes; the reaper removes them.
//!
//! ## Tie-Breaks
//! Longest prefix wins; host routes dominate CIDR routes; for two
//! equal keys the most recent insertion wins (replace).
//!
//! ## ⚠️ Important Note for Next Developer
//! - CIDR keys must be masked before insertion; probes are masked per
//!   active length during lookup
//! - The active-length set and the bucket contents must stay in sync;
//!   every CIDR removal goes through the helper

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use warren_core::addr::{AddrKind, InnerAddr};

use super::instance::ClientInstance;

// ============================================
// Constants
// ============================================

/// Default number of hash buckets in the route table.
pub const DEFAULT_ROUTE_BUCKETS: usize = 256;

// ============================================
// RouteFlags
// ============================================

/// Behavioral flags of a route entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteFlags {
    /// Invalidated when the table's cache generation moves.
    pub cache: bool,
    /// Expires after `ageable_ttl` without references.
    pub ageable: bool,
}

impl RouteFlags {
    /// Flags of a learned host route.
    pub const LEARNED: Self = Self {
        cache: true,
        ageable: true,
    };

    /// Flags of an explicitly installed route (vaddr binding, iroute).
    pub const PERMANENT: Self = Self {
        cache: false,
        ageable: false,
    };
}

// ============================================
// Route
// ============================================

/// One routing entry: inner address -> owning instance.
#[derive(Debug)]
pub struct Route {
    /// Host address or masked CIDR prefix.
    pub key: InnerAddr,
    /// The instance that reaches this address.
    pub instance: Arc<ClientInstance>,
    /// Cache/ageable behavior.
    pub flags: RouteFlags,
    /// Table generation at insertion (cache routes).
    pub generation: u64,
    /// Wall-clock second of the last lookup hit.
    pub last_reference: i64,
}

// ============================================
// CidrHelper
// ============================================

/// Maintains the set of CIDR prefix lengths currently in use.
#[derive(Debug)]
struct CidrHelper {
    /// Incremented whenever the distinct-length set changes.
    cache_generation: u64,
    /// Ageable route time-to-live in wall-clock seconds.
    ageable_ttl_secs: i64,
    /// (prefix length, refcount), descending by length.
    net_lens: Vec<(u8, usize)>,
}

impl CidrHelper {
    fn new(ageable_ttl: Duration) -> Self {
        Self {
            cache_generation: 0,
            ageable_ttl_secs: ageable_ttl.as_secs() as i64,
            net_lens: Vec::new(),
        }
    }

    fn add_len(&mut self, netbits: u8) {
        if let Some(entry) = self.net_lens.iter_mut().find(|(l, _)| *l == netbits) {
            entry.1 += 1;
        } else {
            self.net_lens.push((netbits, 1));
            self.net_lens.sort_by(|a, b| b.0.cmp(&a.0));
            self.cache_generation += 1;
        }
    }

    fn del_len(&mut self, netbits: u8) {
        if let Some(pos) = self.net_lens.iter().position(|(l, _)| *l == netbits) {
            self.net_lens[pos].1 -= 1;
            if self.net_lens[pos].1 == 0 {
                self.net_lens.remove(pos);
                self.cache_generation += 1;
            }
        }
    }

    fn active_lengths(&self) -> Vec<u8> {
        self.net_lens.iter().map(|(l, _)| *l).collect()
    }
}

// ============================================
// RouteTable
// ============================================

/// Bucketed routing table with longest-prefix CIDR matching.
pub struct RouteTable {
    buckets: Vec<Vec<Route>>,
    helper: CidrHelper,
    n_routes: usize,
}

impl RouteTable {
    /// Creates a table with `n_buckets` buckets.
    #[must_use]
    pub fn new(n_buckets: usize, ageable_ttl: Duration) -> Self {
        let n_buckets = n_buckets.max(1);
        Self {
            buckets: (0..n_buckets).map(|_| Vec::new()).collect(),
            helper: CidrHelper::new(ageable_ttl),
            n_routes: 0,
        }
    }

    // ========================================
    // Accessors
    // ========================================

    /// Number of routes in the table (including dead ones not yet
    /// reaped).
    #[must_use]
    pub const fn len(&self) -> usize {
        self.n_routes
    }

    /// Returns `true` when the table holds no routes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.n_routes == 0
    }

    /// Number of hash buckets.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Current cache generation.
    #[must_use]
    pub const fn cache_generation(&self) -> u64 {
        self.helper.cache_generation
    }

    /// Active CIDR prefix lengths, descending.
    #[must_use]
    pub fn active_prefix_lengths(&self) -> Vec<u8> {
        self.helper.active_lengths()
    }

    fn bucket_of(&self, key: &InnerAddr) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.buckets.len()
    }

    fn defined(route: &Route, generation: u64, ttl: i64, now: i64) -> bool {
        if route.instance.is_halted() {
            return false;
        }
        if route.flags.cache && route.generation != generation {
            return false;
        }
        if route.flags.ageable && route.last_reference + ttl < now {
            return false;
        }
        true
    }

    // ========================================
    // Insertion
    // ========================================

    /// Adds or replaces a host route.
    pub fn insert_host(
        &mut self,
        key: InnerAddr,
        instance: Arc<ClientInstance>,
        flags: RouteFlags,
        now: i64,
    ) {
        let generation = self.helper.cache_generation;
        let b = self.bucket_of(&key);
        let route = Route {
            key,
            instance,
            flags,
            generation,
            last_reference: now,
        };

        if let Some(existing) = self.buckets[b].iter_mut().find(|r| r.key == key) {
            trace!("route {} replaced", key);
            *existing = route;
        } else {
            self.buckets[b].push(route);
            self.n_routes += 1;
            trace!("route {} added", key);
        }
    }

    /// Registers a CIDR route for a network behind `instance`.
    ///
    /// The key must carry a prefix length; host bits are masked by the
    /// caller via [`InnerAddr::with_netbits`]. Updates the net-length
    /// refcounts and, when the distinct set changes, the cache
    /// generation.
    pub fn insert_iroute(&mut self, prefix: InnerAddr, instance: Arc<ClientInstance>, now: i64) {
        let Some(netbits) = prefix.netbits() else {
            // Host key: behaves like a permanent host route
            self.insert_host(prefix, instance, RouteFlags::PERMANENT, now);
            return;
        };

        self.helper.add_len(netbits);

        let b = self.bucket_of(&prefix);
        let route = Route {
            key: prefix,
            instance,
            flags: RouteFlags::PERMANENT,
            generation: self.helper.cache_generation,
            last_reference: now,
        };

        if let Some(existing) = self.buckets[b].iter_mut().find(|r| r.key == prefix) {
            // Replacing the same prefix: the old length reference goes
            self.helper.del_len(netbits);
            *existing = route;
        } else {
            self.buckets[b].push(route);
            self.n_routes += 1;
        }
        debug!("iroute {} installed", prefix);
    }

    /// Learns `src` as a host route to `instance`.
    ///
    /// Idempotent: a live route already mapping `src` to the same
    /// instance is only touched. Returns `true` when a route was
    /// inserted or replaced.
    pub fn learn(&mut self, src: InnerAddr, instance: &Arc<ClientInstance>, now: i64) -> bool {
        let generation = self.helper.cache_generation;
        let ttl = self.helper.ageable_ttl_secs;
        let b = self.bucket_of(&src);

        if let Some(existing) = self.buckets[b].iter_mut().find(|r| r.key == src) {
            if existing.instance.id == instance.id
                && Self::defined(existing, generation, ttl, now)
            {
                existing.last_reference = now;
                return false;
            }
            debug!("[{}] learned {} (takeover)", instance.msg_prefix(), src);
            *existing = Route {
                key: src,
                instance: Arc::clone(instance),
                flags: RouteFlags::LEARNED,
                generation,
                last_reference: now,
            };
            return true;
        }

        debug!("[{}] learned {}", instance.msg_prefix(), src);
        self.buckets[b].push(Route {
            key: src,
            instance: Arc::clone(instance),
            flags: RouteFlags::LEARNED,
            generation,
            last_reference: now,
        });
        self.n_routes += 1;
        true
    }

    // ========================================
    // Lookup
    // ========================================

    /// Looks up the instance reaching `key`.
    ///
    /// Host exact match first, then the active prefix lengths in
    /// descending order with the query masked per length. Dead routes
    /// are invisible.
    pub fn lookup(&mut self, key: &InnerAddr, now: i64) -> Option<Arc<ClientInstance>> {
        if let Some(instance) = self.probe(key, now) {
            return Some(instance);
        }

        // CIDR routes exist only for IPv4 prefixes
        if key.kind() != AddrKind::Ipv4 || key.netbits().is_some() {
            return None;
        }

        for netbits in self.helper.active_lengths() {
            let Ok(masked) = key.masked_to(netbits) else {
                continue;
            };
            if let Some(instance) = self.probe(&masked, now) {
                return Some(instance);
            }
        }
        None
    }

    fn probe(&mut self, key: &InnerAddr, now: i64) -> Option<Arc<ClientInstance>> {
        let generation = self.helper.cache_generation;
        let ttl = self.helper.ageable_ttl_secs;
        let b = self.bucket_of(key);

        let route = self.buckets[b].iter_mut().find(|r| &r.key == key)?;
        if !Self::defined(route, generation, ttl, now) {
            return None;
        }
        route.last_reference = now;
        Some(Arc::clone(&route.instance))
    }

    // ========================================
    // Deletion
    // ========================================

    /// Removes the route with exactly this key.
    pub fn delete(&mut self, key: &InnerAddr) -> bool {
        let b = self.bucket_of(key);
        let Some(pos) = self.buckets[b].iter().position(|r| &r.key == key) else {
            return false;
        };

        let route = self.buckets[b].swap_remove(pos);
        self.n_routes -= 1;
        if let Some(netbits) = route.key.netbits() {
            self.helper.del_len(netbits);
        }
        debug!("route {} deleted", key);
        true
    }

    // ========================================
    // Reaping
    // ========================================

    /// Scans `buckets_per_pass` buckets from `bucket_base` and removes
    /// dead routes. Returns the number removed.
    pub fn reap_pass(&mut self, bucket_base: usize, buckets_per_pass: usize, now: i64) -> usize {
        let n = self.buckets.len();
        let generation = self.helper.cache_generation;
        let ttl = self.helper.ageable_ttl_secs;

        let mut removed = 0usize;
        let mut removed_lens: Vec<u8> = Vec::new();

        for i in 0..buckets_per_pass.min(n) {
            let b = (bucket_base + i) % n;
            self.buckets[b].retain(|route| {
                let keep = Self::defined(route, generation, ttl, now);
                if !keep {
                    trace!("reaped route {}", route.key);
                    removed += 1;
                    if let Some(netbits) = route.key.netbits() {
                        removed_lens.push(netbits);
                    }
                }
                keep
            });
        }

        self.n_routes -= removed;
        for netbits in removed_lens {
            self.helper.del_len(netbits);
        }

        if removed > 0 {
            debug!("reaper removed {} routes", removed);
        }
        removed
    }
}

impl std::fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteTable")
            .field("routes", &self.n_routes)
            .field("buckets", &self.buckets.len())
            .field("generation", &self.helper.cache_generation)
            .field("active_lengths", &self.helper.active_lengths())
            .finish()
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::instance::InstanceRegistry;
    use std::net::{Ipv4Addr, SocketAddr};
    use warren_core::addr::OuterAddr;
    use warren_core::pipeline::NullPipeline;

    const TTL: Duration = Duration::from_secs(60);

    fn make_instance(reg: &mut InstanceRegistry, port: u16) -> Arc<ClientInstance> {
        let real = OuterAddr::Ip(SocketAddr::from(([198, 51, 100, 7], port)));
        reg.create(real, Box::new(NullPipeline::new()))
    }

    fn host(a: u8, b: u8, c: u8, d: u8) -> InnerAddr {
        InnerAddr::ipv4(Ipv4Addr::new(a, b, c, d))
    }

    fn net(a: u8, b: u8, c: u8, d: u8, bits: u8) -> InnerAddr {
        host(a, b, c, d).with_netbits(bits).unwrap()
    }

    #[test]
    fn test_host_lookup() {
        let mut reg = InstanceRegistry::new();
        let inst = make_instance(&mut reg, 1);
        let mut table = RouteTable::new(DEFAULT_ROUTE_BUCKETS, TTL);

        table.insert_host(host(10, 8, 0, 6), Arc::clone(&inst), RouteFlags::PERMANENT, 100);

        let found = table.lookup(&host(10, 8, 0, 6), 100).unwrap();
        assert_eq!(found.id, inst.id);
        assert!(table.lookup(&host(10, 8, 0, 7), 100).is_none());
    }

    #[test]
    fn test_longest_prefix_wins() {
        let mut reg = InstanceRegistry::new();
        let a = make_instance(&mut reg, 1);
        let b = make_instance(&mut reg, 2);
        let mut table = RouteTable::new(DEFAULT_ROUTE_BUCKETS, TTL);

        table.insert_iroute(net(10, 0, 0, 0, 8), Arc::clone(&a), 100);
        table.insert_iroute(net(10, 1, 0, 0, 16), Arc::clone(&b), 100);

        assert_eq!(table.lookup(&host(10, 1, 2, 3), 100).unwrap().id, b.id);
        assert_eq!(table.lookup(&host(10, 2, 3, 4), 100).unwrap().id, a.id);
        assert!(table.lookup(&host(192, 168, 0, 1), 100).is_none());
        assert_eq!(table.active_prefix_lengths(), vec![16, 8]);
    }

    #[test]
    fn test_host_dominates_cidr() {
        let mut reg = InstanceRegistry::new();
        let a = make_instance(&mut reg, 1);
        let b = make_instance(&mut reg, 2);
        let mut table = RouteTable::new(DEFAULT_ROUTE_BUCKETS, TTL);

        table.insert_iroute(net(10, 0, 0, 0, 8), Arc::clone(&a), 100);
        table.insert_host(host(10, 0, 0, 9), Arc::clone(&b), RouteFlags::PERMANENT, 100);

        assert_eq!(table.lookup(&host(10, 0, 0, 9), 100).unwrap().id, b.id);
    }

    #[test]
    fn test_learning_is_idempotent() {
        let mut reg = InstanceRegistry::new();
        let inst = make_instance(&mut reg, 1);
        let mut table = RouteTable::new(DEFAULT_ROUTE_BUCKETS, TTL);
        let src = host(10, 8, 0, 6);

        assert!(table.learn(src, &inst, 100));
        assert!(!table.learn(src, &inst, 101));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_learning_takeover() {
        let mut reg = InstanceRegistry::new();
        let a = make_instance(&mut reg, 1);
        let b = make_instance(&mut reg, 2);
        let mut table = RouteTable::new(DEFAULT_ROUTE_BUCKETS, TTL);
        let src = host(10, 8, 0, 6);

        table.learn(src, &a, 100);
        // The address moves to another peer
        assert!(table.learn(src, &b, 101));
        assert_eq!(table.lookup(&src, 101).unwrap().id, b.id);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_ageable_route_expires() {
        let mut reg = InstanceRegistry::new();
        let inst = make_instance(&mut reg, 1);
        let mut table = RouteTable::new(DEFAULT_ROUTE_BUCKETS, TTL);
        let src = host(10, 8, 0, 6);

        table.learn(src, &inst, 100);
        assert!(table.lookup(&src, 100 + 60).is_some());
        // Past the TTL the route is invisible
        assert!(table.lookup(&src, 100 + 61).is_none());
    }

    #[test]
    fn test_lookup_refreshes_last_reference() {
        let mut reg = InstanceRegistry::new();
        let inst = make_instance(&mut reg, 1);
        let mut table = RouteTable::new(DEFAULT_ROUTE_BUCKETS, TTL);
        let src = host(10, 8, 0, 6);

        table.learn(src, &inst, 100);
        // A hit at t=150 pushes expiry to t=210
        assert!(table.lookup(&src, 150).is_some());
        assert!(table.lookup(&src, 205).is_some());
    }

    #[test]
    fn test_cache_generation_invalidates_learned_routes() {
        let mut reg = InstanceRegistry::new();
        let a = make_instance(&mut reg, 1);
        let b = make_instance(&mut reg, 2);
        let mut table = RouteTable::new(DEFAULT_ROUTE_BUCKETS, TTL);
        let src = host(10, 8, 0, 6);

        table.learn(src, &a, 100);
        assert!(table.lookup(&src, 100).is_some());

        // A new prefix length changes the generation
        table.insert_iroute(net(172, 16, 0, 0, 12), Arc::clone(&b), 100);
        assert!(table.lookup(&src, 100).is_none());

        // Relearning installs a fresh route under the new generation
        assert!(table.learn(src, &a, 101));
        assert!(table.lookup(&src, 101).is_some());
    }

    #[test]
    fn test_halted_instance_routes_invisible() {
        let mut reg = InstanceRegistry::new();
        let inst = make_instance(&mut reg, 1);
        let mut table = RouteTable::new(DEFAULT_ROUTE_BUCKETS, TTL);

        table.insert_host(host(10, 8, 0, 6), Arc::clone(&inst), RouteFlags::PERMANENT, 100);
        inst.set_halt();
        assert!(table.lookup(&host(10, 8, 0, 6), 100).is_none());
    }

    #[test]
    fn test_delete_recomputes_active_lengths() {
        let mut reg = InstanceRegistry::new();
        let a = make_instance(&mut reg, 1);
        let mut table = RouteTable::new(DEFAULT_ROUTE_BUCKETS, TTL);

        table.insert_iroute(net(10, 0, 0, 0, 8), Arc::clone(&a), 100);
        table.insert_iroute(net(10, 1, 0, 0, 16), Arc::clone(&a), 100);
        let generation = table.cache_generation();

        assert!(table.delete(&net(10, 1, 0, 0, 16)));
        assert_eq!(table.active_prefix_lengths(), vec![8]);
        assert!(table.cache_generation() > generation);
        assert!(table.lookup(&host(10, 1, 2, 3), 100).is_some()); // /8 still matches
    }

    #[test]
    fn test_reap_removes_dead_routes() {
        let mut reg = InstanceRegistry::new();
        let live = make_instance(&mut reg, 1);
        let dead = make_instance(&mut reg, 2);
        let mut table = RouteTable::new(32, TTL);

        for i in 0..50u8 {
            table.learn(host(10, 8, 1, i), &live, 100);
        }
        for i in 0..50u8 {
            table.learn(host(10, 8, 2, i), &dead, 100);
        }
        dead.set_halt();

        // Full coverage in ceil(32 / 8) passes
        let mut base = 0;
        for _ in 0..4 {
            table.reap_pass(base, 8, 100);
            base = (base + 8) % table.bucket_count();
        }

        assert_eq!(table.len(), 50);
        assert!(table.lookup(&host(10, 8, 1, 7), 100).is_some());
        assert!(table.lookup(&host(10, 8, 2, 7), 100).is_none());
    }

    #[test]
    fn test_reap_removes_aged_routes_everywhere() {
        let mut reg = InstanceRegistry::new();
        let inst = make_instance(&mut reg, 1);
        let mut table = RouteTable::new(32, TTL);

        for i in 0..100u8 {
            table.learn(host(10, 8, 3, i), &inst, 100);
        }

        // Past the TTL, a full cycle of passes empties the table
        let mut base = 0;
        for _ in 0..4 {
            table.reap_pass(base, 8, 100 + 61);
            base = (base + 8) % table.bucket_count();
        }
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_reap_updates_helper_for_cidr_routes() {
        let mut reg = InstanceRegistry::new();
        let inst = make_instance(&mut reg, 1);
        let mut table = RouteTable::new(32, TTL);

        table.insert_iroute(net(10, 0, 0, 0, 8), Arc::clone(&inst), 100);
        inst.set_halt();

        let mut base = 0;
        for _ in 0..4 {
            table.reap_pass(base, 8, 100);
            base = (base + 8) % table.bucket_count();
        }

        assert_eq!(table.len(), 0);
        assert!(table.active_prefix_lengths().is_empty());
    }
}
