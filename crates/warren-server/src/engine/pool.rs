// ============================================
// File: crates/warren-server/src/engine/pool.rs
// ============================================
//! # Virtual-Address Pool
//!
//! ## Creation Reason
//! Hands out distinct inner addresses to client instances from a
//! configured range, and can persist the assignment map so peers keep
//! their addresses across a restart.
//!
//! ## Main Functionality
//! - `AddrPool`: allocation over a CIDR range
//! - First-fit allocation, identity-sticky re-allocation
//! - `PoolPersistence`: save/load hand-off interface
//! - `JsonPoolFile`: JSON file implementation
//!
//! ## Allocation Strategy
//! - Skips the network address (.0) and the gateway address
//! - An identity that held an address before gets it back while free
//! - O(n) allocation, O(1) release
//!
//! ## ⚠️ Important Note for Next Developer
//! - The gateway address is the server's own inner address - never
//!   allocate it
//! - The outstanding set must always equal the live instances' vaddrs;
//!   release on every close path

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use warren_core::addr::InnerAddr;

use crate::error::{Result, ServerError};

// ============================================
// AddrPool
// ============================================

/// Virtual-address pool over a CIDR range.
///
/// # Capacity
/// For a /24 network: 254 addresses (256 minus network and broadcast),
/// minus the gateway: 253 allocatable addresses.
pub struct AddrPool {
    /// Network address (e.g., 10.8.0.0)
    network: Ipv4Addr,
    /// Prefix length (e.g., 24)
    prefix_len: u8,
    /// Gateway address (reserved; the server's own inner address)
    gateway: Ipv4Addr,
    /// Allocated addresses and the identity that holds each
    allocated: HashMap<Ipv4Addr, String>,
    /// First usable address offset
    first_usable: u32,
    /// Last usable address offset
    last_usable: u32,
}

impl AddrPool {
    /// Creates a new pool.
    ///
    /// # Errors
    /// Returns error if the range or gateway is invalid.
    pub fn new(network: Ipv4Addr, prefix_len: u8, gateway: Ipv4Addr) -> Result<Self> {
        if prefix_len > 30 {
            return Err(ServerError::config_invalid(
                "pool.prefix_len",
                "prefix length must be <= 30 for usable addresses",
            ));
        }

        let total_addresses = 1u32 << (32 - prefix_len);
        let first_usable = 1; // Skip network address
        let last_usable = total_addresses - 2; // Skip broadcast address

        let network_u32 = u32::from(network);
        let gateway_offset = u32::from(gateway).wrapping_sub(network_u32);

        if gateway_offset >= total_addresses {
            return Err(ServerError::config_invalid(
                "pool.gateway",
                "gateway address is not in network range",
            ));
        }

        debug!(
            "Address pool initialized: {}/{}, gateway={}, available={}",
            network,
            prefix_len,
            gateway,
            last_usable - first_usable
        );

        Ok(Self {
            network,
            prefix_len,
            gateway,
            allocated: HashMap::new(),
            first_usable,
            last_usable,
        })
    }

    /// Allocates an inner address for `identity`.
    ///
    /// An identity that already holds an address gets the same address
    /// back (persistence restore, duplicate handshakes).
    ///
    /// # Errors
    /// Returns `PoolExhausted` if no addresses are available.
    pub fn allocate(&mut self, identity: &str) -> Result<InnerAddr> {
        // Sticky re-allocation for a known identity
        if let Some((&ip, _)) = self.allocated.iter().find(|(_, who)| *who == identity) {
            debug!("Re-issued {} to {}", ip, identity);
            return Ok(InnerAddr::ipv4(ip));
        }

        let network_u32 = u32::from(self.network);
        for offset in self.first_usable..=self.last_usable {
            let ip = Ipv4Addr::from(network_u32 + offset);

            if ip == self.gateway || self.allocated.contains_key(&ip) {
                continue;
            }

            self.allocated.insert(ip, identity.to_string());
            debug!("Allocated {} to {} ({} in use)", ip, identity, self.allocated.len());
            return Ok(InnerAddr::ipv4(ip));
        }

        warn!("Address pool exhausted ({} addresses in use)", self.allocated.len());
        Err(ServerError::PoolExhausted)
    }

    /// Releases a previously allocated address.
    ///
    /// Returns `true` if the address was released.
    pub fn release(&mut self, addr: &InnerAddr) -> bool {
        let Some(ip) = addr.to_ipv4() else {
            return false;
        };
        let removed = self.allocated.remove(&ip).is_some();

        if removed {
            debug!("Released {} ({} in use)", ip, self.allocated.len());
        } else {
            warn!("Attempted to release unallocated address: {}", ip);
        }

        removed
    }

    /// Seeds the pool from a persisted assignment map.
    ///
    /// Entries outside the configured range are dropped with a warning.
    pub fn restore(&mut self, map: HashMap<Ipv4Addr, String>) {
        let mut kept = 0usize;
        for (ip, identity) in map {
            if self.contains(ip) {
                self.allocated.insert(ip, identity);
                kept += 1;
            } else {
                warn!("Dropping persisted assignment {} (outside range)", ip);
            }
        }
        if kept > 0 {
            info!("Restored {} persisted address assignments", kept);
        }
    }

    /// Snapshot of the current assignment map, for persistence.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<Ipv4Addr, String> {
        self.allocated.clone()
    }

    /// Checks if `ip` is currently allocated.
    #[must_use]
    pub fn is_allocated(&self, ip: Ipv4Addr) -> bool {
        self.allocated.contains_key(&ip)
    }

    /// Number of outstanding assignments.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.allocated.len()
    }

    /// Total allocatable capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        let total_usable = (self.last_usable - self.first_usable + 1) as usize;
        let gateway_reserved = 1;
        total_usable - gateway_reserved
    }

    /// Checks if `ip` is allocatable within this pool's range.
    #[must_use]
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let offset = u32::from(ip).wrapping_sub(u32::from(self.network));
        offset >= self.first_usable && offset <= self.last_usable && ip != self.gateway
    }

    /// Returns the gateway (server inner) address.
    #[must_use]
    pub const fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }
}

impl std::fmt::Debug for AddrPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddrPool")
            .field("range", &format!("{}/{}", self.network, self.prefix_len))
            .field("gateway", &self.gateway)
            .field("outstanding", &self.outstanding())
            .field("capacity", &self.capacity())
            .finish()
    }
}

// ============================================
// PoolPersistence
// ============================================

/// Save/load hand-off for the assignment map.
///
/// Used optionally to preserve address assignments across restarts.
pub trait PoolPersistence: Send + Sync {
    /// Persists the assignment map.
    ///
    /// # Errors
    /// Returns error if the map cannot be stored.
    fn save(&self, map: &HashMap<Ipv4Addr, String>) -> std::io::Result<()>;

    /// Loads the previously persisted map (empty when none exists).
    ///
    /// # Errors
    /// Returns error if an existing store cannot be read.
    fn load(&self) -> std::io::Result<HashMap<Ipv4Addr, String>>;
}

/// JSON-file implementation of [`PoolPersistence`].
#[derive(Debug, Clone)]
pub struct JsonPoolFile {
    path: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct PersistedEntry {
    addr: Ipv4Addr,
    identity: String,
}

impl JsonPoolFile {
    /// Creates a persistence store at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PoolPersistence for JsonPoolFile {
    fn save(&self, map: &HashMap<Ipv4Addr, String>) -> std::io::Result<()> {
        let entries: Vec<PersistedEntry> = map
            .iter()
            .map(|(&addr, identity)| PersistedEntry {
                addr,
                identity: identity.clone(),
            })
            .collect();

        let content = serde_json::to_string_pretty(&entries)?;
        std::fs::write(&self.path, content)?;
        debug!("Persisted {} assignments to {}", entries.len(), self.path.display());
        Ok(())
    }

    fn load(&self) -> std::io::Result<HashMap<Ipv4Addr, String>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        let entries: Vec<PersistedEntry> = serde_json::from_str(&content)?;
        Ok(entries
            .into_iter()
            .map(|e| (e.addr, e.identity))
            .collect())
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool() -> AddrPool {
        AddrPool::new(
            Ipv4Addr::new(10, 8, 0, 0),
            24,
            Ipv4Addr::new(10, 8, 0, 1),
        )
        .unwrap()
    }

    #[test]
    fn test_pool_creation() {
        let pool = test_pool();
        assert_eq!(pool.outstanding(), 0);
        // 254 total - 1 gateway = 253
        assert_eq!(pool.capacity(), 253);
        assert_eq!(pool.gateway(), Ipv4Addr::new(10, 8, 0, 1));
    }

    #[test]
    fn test_allocate_skips_network_and_gateway() {
        let mut pool = test_pool();
        let addr = pool.allocate("peer-a").unwrap();
        assert_eq!(addr.to_ipv4(), Some(Ipv4Addr::new(10, 8, 0, 2)));
    }

    #[test]
    fn test_allocate_distinct() {
        let mut pool = test_pool();
        let a = pool.allocate("peer-a").unwrap();
        let b = pool.allocate("peer-b").unwrap();
        let c = pool.allocate("peer-c").unwrap();

        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(pool.outstanding(), 3);
    }

    #[test]
    fn test_identity_sticky() {
        let mut pool = test_pool();
        let first = pool.allocate("peer-a").unwrap();
        let again = pool.allocate("peer-a").unwrap();

        assert_eq!(first, again);
        assert_eq!(pool.outstanding(), 1);
    }

    #[test]
    fn test_release_and_reuse() {
        let mut pool = test_pool();
        let a = pool.allocate("peer-a").unwrap();
        let _b = pool.allocate("peer-b").unwrap();

        assert!(pool.release(&a));
        assert!(!pool.release(&a));
        assert_eq!(pool.outstanding(), 1);

        // Freed address is handed out again
        let c = pool.allocate("peer-c").unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_exhaustion() {
        // /30: network, broadcast, gateway, one usable
        let mut pool = AddrPool::new(
            Ipv4Addr::new(10, 0, 0, 0),
            30,
            Ipv4Addr::new(10, 0, 0, 1),
        )
        .unwrap();

        let only = pool.allocate("peer-a").unwrap();
        assert_eq!(only.to_ipv4(), Some(Ipv4Addr::new(10, 0, 0, 2)));

        assert!(matches!(
            pool.allocate("peer-b"),
            Err(ServerError::PoolExhausted)
        ));
    }

    #[test]
    fn test_restore_and_snapshot() {
        let mut pool = test_pool();
        let mut persisted = HashMap::new();
        persisted.insert(Ipv4Addr::new(10, 8, 0, 5), "peer-a".to_string());
        persisted.insert(Ipv4Addr::new(192, 168, 1, 1), "stray".to_string());

        pool.restore(persisted);
        assert_eq!(pool.outstanding(), 1);
        assert!(pool.is_allocated(Ipv4Addr::new(10, 8, 0, 5)));

        // Restored identity keeps its address
        let addr = pool.allocate("peer-a").unwrap();
        assert_eq!(addr.to_ipv4(), Some(Ipv4Addr::new(10, 8, 0, 5)));

        let snap = pool.snapshot();
        assert_eq!(snap.len(), 1);
    }

    #[test]
    fn test_json_persistence_roundtrip() {
        let dir = std::env::temp_dir().join(format!("warren-pool-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let store = JsonPoolFile::new(dir.join("pool.json"));

        let mut map = HashMap::new();
        map.insert(Ipv4Addr::new(10, 8, 0, 2), "peer-a".to_string());
        map.insert(Ipv4Addr::new(10, 8, 0, 3), "peer-b".to_string());

        store.save(&map).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, map);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let store = JsonPoolFile::new("/nonexistent/warren-pool.json");
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_gateway_outside_range_rejected() {
        let result = AddrPool::new(
            Ipv4Addr::new(10, 0, 0, 0),
            24,
            Ipv4Addr::new(192, 168, 0, 1),
        );
        assert!(result.is_err());
    }
}
