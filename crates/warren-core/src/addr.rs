// ============================================
// File: crates/warren-core/src/addr.rs
// ============================================
//! # Inner and Outer Address Values
//!
//! ## Creation Reason
//! Centralizes the two address vocabularies of the tunnel: the inner
//! (tunneled) addresses learned from packet headers and used as routing
//! keys, and the outer (transport) addresses peers connect from.
//!
//! ## Main Functionality
//! - `InnerAddr`: tagged address value (Ethernet MAC, IPv4 host or CIDR
//!   prefix, IPv6 host, Unix path) with optional transport port
//! - `OuterAddr`: peer transport address (IP+port or Unix path)
//! - `PktInfo`: local address/interface the kernel chose for a datagram
//!
//! ## Main Logical Flow
//! 1. Frame parsing produces `InnerAddr` source/destination pairs
//! 2. The routing table keys host and CIDR routes by `InnerAddr`
//! 3. The registry keys client instances by `OuterAddr`
//!
//! ## ⚠️ Important Note for Next Developer
//! - Equality and hash cover (kind, prefix, length, bytes); bytes past
//!   the address length MUST stay zero or route lookups break
//! - CIDR route keys must have their host bits masked before insertion
//! - `InnerAddr` is `Copy` and small on purpose - it is a hot hash key

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;

use crate::error::{CoreError, Result};

// ============================================
// Constants
// ============================================

/// Largest address we carry: IPv6 (16 bytes) plus a port.
pub const MAX_ADDR_LEN: usize = 20;

// ============================================
// AddrKind
// ============================================

/// Discriminant of an [`InnerAddr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddrKind {
    /// Ethernet MAC address (6 bytes), TAP mode.
    Ether,
    /// IPv4 host or CIDR prefix (4 bytes).
    Ipv4,
    /// IPv6 host (16 bytes).
    Ipv6,
    /// Unix socket path prefix (up to 20 bytes).
    Unix,
}

impl AddrKind {
    /// Number of bits in an address of this kind, if fixed-width.
    #[must_use]
    pub const fn bit_width(self) -> Option<u8> {
        match self {
            Self::Ether => Some(48),
            Self::Ipv4 => Some(32),
            Self::Ipv6 => Some(128),
            Self::Unix => None,
        }
    }

    /// Family name for error messages and display.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ether => "ether",
            Self::Ipv4 => "ipv4",
            Self::Ipv6 => "ipv6",
            Self::Unix => "unix",
        }
    }
}

// ============================================
// InnerAddr
// ============================================

/// A tagged inner (tunneled) address value.
///
/// # Purpose
/// The single key type of the routing table: learned source addresses,
/// assigned virtual addresses, and CIDR prefixes for networks behind a
/// peer are all `InnerAddr` values.
///
/// # Hash Key Contract
/// Equality and hash are derived over (kind, netbits, port, length,
/// bytes). Constructors zero-fill the byte array, so values built from
/// different code paths compare equal when they denote the same address.
///
/// # Example
/// ```
/// use warren_core::addr::InnerAddr;
/// use std::net::Ipv4Addr;
///
/// let host = InnerAddr::ipv4(Ipv4Addr::new(10, 8, 0, 6));
/// let net = InnerAddr::ipv4(Ipv4Addr::new(10, 8, 0, 99)).with_netbits(24).unwrap();
///
/// assert_eq!(net.to_ipv4(), Some(Ipv4Addr::new(10, 8, 0, 0)));
/// assert_ne!(host, net);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InnerAddr {
    kind: AddrKind,
    len: u8,
    netbits: Option<u8>,
    port: Option<u16>,
    bytes: [u8; MAX_ADDR_LEN],
}

impl InnerAddr {
    // ========================================
    // Constructors
    // ========================================

    /// Creates an Ethernet MAC address.
    #[must_use]
    pub fn ether(mac: [u8; 6]) -> Self {
        let mut bytes = [0u8; MAX_ADDR_LEN];
        bytes[..6].copy_from_slice(&mac);
        Self {
            kind: AddrKind::Ether,
            len: 6,
            netbits: None,
            port: None,
            bytes,
        }
    }

    /// Creates an IPv4 host address.
    #[must_use]
    pub fn ipv4(addr: Ipv4Addr) -> Self {
        let mut bytes = [0u8; MAX_ADDR_LEN];
        bytes[..4].copy_from_slice(&addr.octets());
        Self {
            kind: AddrKind::Ipv4,
            len: 4,
            netbits: None,
            port: None,
            bytes,
        }
    }

    /// Creates an IPv6 host address.
    #[must_use]
    pub fn ipv6(addr: Ipv6Addr) -> Self {
        let mut bytes = [0u8; MAX_ADDR_LEN];
        bytes[..16].copy_from_slice(&addr.octets());
        Self {
            kind: AddrKind::Ipv6,
            len: 16,
            netbits: None,
            port: None,
            bytes,
        }
    }

    /// Creates an address from a peer's outer transport address.
    ///
    /// # Arguments
    /// * `outer` - The transport address
    /// * `use_port` - Whether the port participates in equality/hash
    #[must_use]
    pub fn from_outer(outer: &OuterAddr, use_port: bool) -> Self {
        match outer {
            OuterAddr::Ip(sa) => {
                let mut addr = match sa.ip() {
                    IpAddr::V4(v4) => Self::ipv4(v4),
                    IpAddr::V6(v6) => Self::ipv6(v6),
                };
                if use_port {
                    addr = addr.with_port(sa.port());
                }
                addr
            }
            OuterAddr::Unix(path) => {
                let mut bytes = [0u8; MAX_ADDR_LEN];
                let raw = path.as_os_str().as_encoded_bytes();
                let len = raw.len().min(MAX_ADDR_LEN);
                bytes[..len].copy_from_slice(&raw[..len]);
                Self {
                    kind: AddrKind::Unix,
                    len: len as u8,
                    netbits: None,
                    port: None,
                    bytes,
                }
            }
        }
    }

    /// Attaches a transport port to the address.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Turns the address into a CIDR prefix, masking host bits.
    ///
    /// # Errors
    /// Returns `InvalidPrefixLength` if `netbits` exceeds the address
    /// bit width or the kind has no fixed width.
    pub fn with_netbits(mut self, netbits: u8) -> Result<Self> {
        let width = self.kind.bit_width().ok_or(CoreError::InvalidPrefixLength {
            netbits,
            kind: self.kind.name(),
        })?;
        if netbits > width {
            return Err(CoreError::InvalidPrefixLength {
                netbits,
                kind: self.kind.name(),
            });
        }
        self.netbits = Some(netbits);
        self.mask_host_bits();
        Ok(self)
    }

    /// Returns a copy masked to `netbits`, suitable as a CIDR probe key.
    ///
    /// # Errors
    /// Same conditions as [`InnerAddr::with_netbits`].
    pub fn masked_to(&self, netbits: u8) -> Result<Self> {
        let mut probe = *self;
        probe.netbits = None;
        probe.with_netbits(netbits)
    }

    /// Zeroes every bit past the prefix length.
    ///
    /// Required before a value is inserted as a CIDR route key; a no-op
    /// for host addresses.
    pub fn mask_host_bits(&mut self) {
        let Some(netbits) = self.netbits else {
            return;
        };
        let full_bytes = usize::from(netbits / 8);
        let partial_bits = netbits % 8;

        if full_bytes < usize::from(self.len) && partial_bits != 0 {
            let keep_mask = 0xffu8 << (8 - partial_bits);
            self.bytes[full_bytes] &= keep_mask;
        }
        let first_cleared = full_bytes + usize::from(partial_bits != 0);
        for b in &mut self.bytes[first_cleared..usize::from(self.len)] {
            *b = 0;
        }
    }

    // ========================================
    // Accessors
    // ========================================

    /// Returns the address kind.
    #[must_use]
    pub const fn kind(&self) -> AddrKind {
        self.kind
    }

    /// Returns the CIDR prefix length, if this is a network address.
    #[must_use]
    pub const fn netbits(&self) -> Option<u8> {
        self.netbits
    }

    /// Returns the transport port, if one participates in the key.
    #[must_use]
    pub const fn port(&self) -> Option<u16> {
        self.port
    }

    /// Returns the significant address bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }

    /// Returns the IPv4 address if this is an IPv4 value.
    #[must_use]
    pub fn to_ipv4(&self) -> Option<Ipv4Addr> {
        if self.kind == AddrKind::Ipv4 {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&self.bytes[..4]);
            Some(Ipv4Addr::from(octets))
        } else {
            None
        }
    }

    /// Returns the IPv6 address if this is an IPv6 value.
    #[must_use]
    pub fn to_ipv6(&self) -> Option<Ipv6Addr> {
        if self.kind == AddrKind::Ipv6 {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&self.bytes[..16]);
            Some(Ipv6Addr::from(octets))
        } else {
            None
        }
    }

    /// Returns the MAC address if this is an Ethernet value.
    #[must_use]
    pub fn to_mac(&self) -> Option<[u8; 6]> {
        if self.kind == AddrKind::Ether {
            let mut mac = [0u8; 6];
            mac.copy_from_slice(&self.bytes[..6]);
            Some(mac)
        } else {
            None
        }
    }

    // ========================================
    // Classification
    // ========================================

    /// Returns `true` for the all-ones broadcast address of the family.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        match self.kind {
            AddrKind::Ether => self.bytes[..6] == [0xff; 6],
            AddrKind::Ipv4 => self.bytes[..4] == [0xff; 4],
            AddrKind::Ipv6 | AddrKind::Unix => false,
        }
    }

    /// Returns `true` for a multicast address of the family.
    #[must_use]
    pub fn is_multicast(&self) -> bool {
        match self.kind {
            // Group bit in the first octet, excluding broadcast
            AddrKind::Ether => self.bytes[0] & 0x01 != 0 && !self.is_broadcast(),
            // 224.0.0.0/4
            AddrKind::Ipv4 => self.bytes[0] & 0xf0 == 0xe0,
            // ff00::/8
            AddrKind::Ipv6 => self.bytes[0] == 0xff,
            AddrKind::Unix => false,
        }
    }

    /// Returns `true` for the all-zero address.
    #[must_use]
    pub fn is_unspecified(&self) -> bool {
        self.as_bytes().iter().all(|&b| b == 0)
    }

    /// Returns `true` if this address may be learned as a host route.
    ///
    /// Broadcast, multicast, and unspecified addresses are reported as
    /// frame classes, never learned; CIDR prefixes are installed
    /// explicitly, never learned.
    #[must_use]
    pub fn is_learnable(&self) -> bool {
        self.netbits.is_none()
            && !self.is_broadcast()
            && !self.is_multicast()
            && !self.is_unspecified()
    }
}

impl fmt::Display for InnerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            AddrKind::Ether => {
                let b = &self.bytes;
                write!(
                    f,
                    "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                    b[0], b[1], b[2], b[3], b[4], b[5]
                )?;
            }
            AddrKind::Ipv4 => {
                let b = &self.bytes;
                write!(f, "{}.{}.{}.{}", b[0], b[1], b[2], b[3])?;
            }
            AddrKind::Ipv6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&self.bytes[..16]);
                write!(f, "{}", Ipv6Addr::from(octets))?;
            }
            AddrKind::Unix => {
                write!(f, "unix:{}", String::from_utf8_lossy(self.as_bytes()))?;
            }
        }
        if let Some(netbits) = self.netbits {
            write!(f, "/{netbits}")?;
        }
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for InnerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InnerAddr({self})")
    }
}

// ============================================
// OuterAddr
// ============================================

/// A peer's outer transport address, as observed by the server socket.
///
/// # Purpose
/// Primary key of the real-address view of the client registry. The
/// optional per-datagram [`PktInfo`] is carried separately because it
/// must not participate in equality or hashing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OuterAddr {
    /// IPv4 or IPv6 socket address.
    Ip(SocketAddr),
    /// Unix domain socket path.
    Unix(PathBuf),
}

impl OuterAddr {
    /// Returns the socket address for IP transports.
    #[must_use]
    pub const fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Ip(sa) => Some(*sa),
            Self::Unix(_) => None,
        }
    }

    /// Family name for logging.
    #[must_use]
    pub const fn family(&self) -> &'static str {
        match self {
            Self::Ip(SocketAddr::V4(_)) => "ipv4",
            Self::Ip(SocketAddr::V6(_)) => "ipv6",
            Self::Unix(_) => "unix",
        }
    }
}

impl fmt::Display for OuterAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(sa) => write!(f, "{sa}"),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

impl From<SocketAddr> for OuterAddr {
    fn from(sa: SocketAddr) -> Self {
        Self::Ip(sa)
    }
}

// ============================================
// PktInfo
// ============================================

/// Local address and interface the kernel chose for a received datagram.
///
/// Carried alongside an [`OuterAddr`] on multi-homed UDP servers so
/// replies leave from the address the peer targeted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PktInfo {
    /// Local destination address of the datagram.
    pub local: IpAddr,
    /// Interface index, when the platform reports one.
    pub ifindex: Option<u32>,
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_is_padding_independent() {
        let a = InnerAddr::ipv4(Ipv4Addr::new(10, 8, 0, 6));
        let b = InnerAddr::from_outer(
            &OuterAddr::Ip("10.8.0.6:0".parse().unwrap()),
            false,
        );
        assert_eq!(a, b);

        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut ha = DefaultHasher::new();
        let mut hb = DefaultHasher::new();
        a.hash(&mut ha);
        b.hash(&mut hb);
        assert_eq!(ha.finish(), hb.finish());
    }

    #[test]
    fn test_port_participates_in_key() {
        let bare = InnerAddr::ipv4(Ipv4Addr::new(10, 8, 0, 6));
        let with_port = bare.with_port(1194);
        assert_ne!(bare, with_port);
    }

    #[test]
    fn test_mask_host_bits() {
        let net = InnerAddr::ipv4(Ipv4Addr::new(10, 1, 2, 3))
            .with_netbits(16)
            .unwrap();
        assert_eq!(net.to_ipv4(), Some(Ipv4Addr::new(10, 1, 0, 0)));

        let odd = InnerAddr::ipv4(Ipv4Addr::new(10, 1, 255, 255))
            .with_netbits(20)
            .unwrap();
        assert_eq!(odd.to_ipv4(), Some(Ipv4Addr::new(10, 1, 240, 0)));
    }

    #[test]
    fn test_masked_probe_equals_inserted_key() {
        let inserted = InnerAddr::ipv4(Ipv4Addr::new(10, 0, 0, 0))
            .with_netbits(8)
            .unwrap();
        let probe = InnerAddr::ipv4(Ipv4Addr::new(10, 2, 3, 4))
            .masked_to(8)
            .unwrap();
        assert_eq!(inserted, probe);
    }

    #[test]
    fn test_invalid_prefix_rejected() {
        let err = InnerAddr::ipv4(Ipv4Addr::new(10, 0, 0, 0)).with_netbits(33);
        assert!(matches!(err, Err(CoreError::InvalidPrefixLength { .. })));
    }

    #[test]
    fn test_classification_ipv4() {
        assert!(InnerAddr::ipv4(Ipv4Addr::new(255, 255, 255, 255)).is_broadcast());
        assert!(InnerAddr::ipv4(Ipv4Addr::new(224, 0, 0, 1)).is_multicast());
        assert!(InnerAddr::ipv4(Ipv4Addr::new(0, 0, 0, 0)).is_unspecified());
        assert!(InnerAddr::ipv4(Ipv4Addr::new(10, 8, 0, 6)).is_learnable());
        assert!(!InnerAddr::ipv4(Ipv4Addr::new(239, 1, 1, 1)).is_learnable());
    }

    #[test]
    fn test_classification_ether() {
        assert!(InnerAddr::ether([0xff; 6]).is_broadcast());
        assert!(InnerAddr::ether([0x01, 0, 0x5e, 0, 0, 1]).is_multicast());
        assert!(InnerAddr::ether([0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee]).is_learnable());
    }

    #[test]
    fn test_cidr_prefix_is_not_learnable() {
        let net = InnerAddr::ipv4(Ipv4Addr::new(10, 9, 0, 0))
            .with_netbits(16)
            .unwrap();
        assert!(!net.is_learnable());
    }

    #[test]
    fn test_display() {
        let host = InnerAddr::ipv4(Ipv4Addr::new(10, 8, 0, 6));
        assert_eq!(host.to_string(), "10.8.0.6");

        let net = host.with_netbits(24).unwrap();
        assert_eq!(net.to_string(), "10.8.0.0/24");

        let mac = InnerAddr::ether([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]);
        assert_eq!(mac.to_string(), "de:ad:be:ef:00:01");
    }

    #[test]
    fn test_outer_addr_display_and_family() {
        let ip: OuterAddr = "192.0.2.1:1194".parse::<SocketAddr>().unwrap().into();
        assert_eq!(ip.to_string(), "192.0.2.1:1194");
        assert_eq!(ip.family(), "ipv4");

        let unix = OuterAddr::Unix(PathBuf::from("/run/warren.sock"));
        assert_eq!(unix.family(), "unix");
        assert!(unix.socket_addr().is_none());
    }
}
