// ============================================
// File: crates/warren-core/src/frame.rs
// ============================================
//! # Frame Address Extraction
//!
//! ## Creation Reason
//! The routing table learns and looks up inner addresses; this module
//! pulls the source/destination pair (and delivery class) out of the
//! frames that cross the virtual interface and the decrypted link.
//!
//! ## Main Functionality
//! - `extract_addrs`: parse an L3 packet (tun) or Ethernet frame (tap)
//! - `FrameClass`: unicast / broadcast / multicast / IGMP classification
//! - `TunnelKind`: whether the virtual interface carries L3 or L2 frames
//!
//! ## Parsing Strategy
//! 1. Check minimum frame length for the mode
//! 2. tun: dispatch on the IP version nibble
//! 3. tap: read MACs, skip an optional 802.1Q tag, check the EtherType
//! 4. Classify the destination; multicast and broadcast are reported as
//!    classes, never learned as routes
//!
//! ## ⚠️ Important Note for Next Developer
//! - Always validate buffer lengths before reading
//! - An unknown EtherType is a per-instance format error, not fatal
//! - Keep parsing zero-allocation; this runs once per packet

use serde::{Deserialize, Serialize};

use crate::addr::InnerAddr;
use crate::error::{CoreError, Result};

// ============================================
// Constants
// ============================================

/// Minimum IPv4 header size.
const IPV4_HEADER_MIN_SIZE: usize = 20;

/// Offset of the source IP in an IPv4 header.
const IPV4_SRC_OFFSET: usize = 12;

/// Offset of the destination IP in an IPv4 header.
const IPV4_DST_OFFSET: usize = 16;

/// Offset of the protocol byte in an IPv4 header.
const IPV4_PROTO_OFFSET: usize = 9;

/// Fixed IPv6 header size.
const IPV6_HEADER_SIZE: usize = 40;

/// Offset of the source IP in an IPv6 header.
const IPV6_SRC_OFFSET: usize = 8;

/// Offset of the destination IP in an IPv6 header.
const IPV6_DST_OFFSET: usize = 24;

/// Ethernet II header size (no VLAN tag).
const ETH_HEADER_SIZE: usize = 14;

/// Extra bytes occupied by an 802.1Q tag.
const VLAN_TAG_SIZE: usize = 4;

/// IANA protocol number for IGMP.
const IPPROTO_IGMP: u8 = 2;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_ARP: u16 = 0x0806;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_IPV6: u16 = 0x86dd;

// ============================================
// TunnelKind
// ============================================

/// Layer at which the virtual interface operates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelKind {
    /// L3 interface carrying raw IPv4/IPv6 packets.
    Tun,
    /// L2 interface carrying Ethernet II frames.
    Tap,
}

impl std::fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tun => write!(f, "tun"),
            Self::Tap => write!(f, "tap"),
        }
    }
}

// ============================================
// FrameClass
// ============================================

/// Delivery class of an inner frame's destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    /// Single destination; eligible for routing and learning.
    Unicast,
    /// All-stations destination; replicated to every peer.
    Broadcast,
    /// Group destination; replicated to every peer.
    Multicast,
    /// IGMP membership traffic; handled like multicast.
    Igmp,
}

impl FrameClass {
    /// Returns `true` if the frame must be replicated rather than routed.
    #[must_use]
    pub const fn is_replicated(self) -> bool {
        matches!(self, Self::Broadcast | Self::Multicast | Self::Igmp)
    }
}

// ============================================
// ExtractedAddrs
// ============================================

/// Source and destination of a frame, plus the delivery class.
#[derive(Debug, Clone, Copy)]
pub struct ExtractedAddrs {
    /// Inner source address (learn candidate).
    pub src: InnerAddr,
    /// Inner destination address (route key).
    pub dst: InnerAddr,
    /// Delivery class of the destination.
    pub class: FrameClass,
}

// ============================================
// Extraction
// ============================================

/// Extracts the inner source/destination pair from a frame.
///
/// # Arguments
/// * `kind` - Whether `frame` is an L3 packet or an Ethernet frame
/// * `frame` - The raw frame as read from the virtual interface or
///   produced by the pipeline
///
/// # Errors
/// - `FrameTooShort` if the frame cannot hold the headers it claims
/// - `UnsupportedIpVersion` for an unknown IP version nibble (tun)
/// - `UnknownEtherType` for an EtherType the tunnel does not carry (tap)
pub fn extract_addrs(kind: TunnelKind, frame: &[u8]) -> Result<ExtractedAddrs> {
    match kind {
        TunnelKind::Tun => extract_ip(frame),
        TunnelKind::Tap => extract_ether(frame),
    }
}

/// Parses an L3 packet (tun mode).
fn extract_ip(frame: &[u8]) -> Result<ExtractedAddrs> {
    if frame.is_empty() {
        return Err(CoreError::too_short(1, 0));
    }

    match frame[0] >> 4 {
        4 => extract_ipv4(frame),
        6 => extract_ipv6(frame),
        version => Err(CoreError::UnsupportedIpVersion(version)),
    }
}

fn extract_ipv4(frame: &[u8]) -> Result<ExtractedAddrs> {
    if frame.len() < IPV4_HEADER_MIN_SIZE {
        return Err(CoreError::too_short(IPV4_HEADER_MIN_SIZE, frame.len()));
    }

    let src = InnerAddr::ipv4(read_ipv4(frame, IPV4_SRC_OFFSET));
    let dst = InnerAddr::ipv4(read_ipv4(frame, IPV4_DST_OFFSET));

    let class = if dst.is_broadcast() {
        FrameClass::Broadcast
    } else if frame[IPV4_PROTO_OFFSET] == IPPROTO_IGMP {
        FrameClass::Igmp
    } else if dst.is_multicast() {
        FrameClass::Multicast
    } else {
        FrameClass::Unicast
    };

    Ok(ExtractedAddrs { src, dst, class })
}

fn extract_ipv6(frame: &[u8]) -> Result<ExtractedAddrs> {
    if frame.len() < IPV6_HEADER_SIZE {
        return Err(CoreError::too_short(IPV6_HEADER_SIZE, frame.len()));
    }

    let src = InnerAddr::ipv6(read_ipv6(frame, IPV6_SRC_OFFSET));
    let dst = InnerAddr::ipv6(read_ipv6(frame, IPV6_DST_OFFSET));

    let class = if dst.is_multicast() {
        FrameClass::Multicast
    } else {
        FrameClass::Unicast
    };

    Ok(ExtractedAddrs { src, dst, class })
}

/// Parses an Ethernet II frame (tap mode), skipping one 802.1Q tag.
fn extract_ether(frame: &[u8]) -> Result<ExtractedAddrs> {
    if frame.len() < ETH_HEADER_SIZE {
        return Err(CoreError::too_short(ETH_HEADER_SIZE, frame.len()));
    }

    let dst_mac: [u8; 6] = frame[0..6].try_into().expect("length checked");
    let src_mac: [u8; 6] = frame[6..12].try_into().expect("length checked");

    let mut ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    let mut payload_off = ETH_HEADER_SIZE;

    if ethertype == ETHERTYPE_VLAN {
        if frame.len() < ETH_HEADER_SIZE + VLAN_TAG_SIZE {
            return Err(CoreError::too_short(
                ETH_HEADER_SIZE + VLAN_TAG_SIZE,
                frame.len(),
            ));
        }
        ethertype = u16::from_be_bytes([frame[16], frame[17]]);
        payload_off = ETH_HEADER_SIZE + VLAN_TAG_SIZE;
    }

    if !matches!(ethertype, ETHERTYPE_IPV4 | ETHERTYPE_ARP | ETHERTYPE_IPV6) {
        return Err(CoreError::UnknownEtherType(ethertype));
    }

    let src = InnerAddr::ether(src_mac);
    let dst = InnerAddr::ether(dst_mac);

    let payload = &frame[payload_off..];
    let class = if dst.is_broadcast() {
        FrameClass::Broadcast
    } else if ethertype == ETHERTYPE_IPV4
        && payload.len() >= IPV4_HEADER_MIN_SIZE
        && payload[IPV4_PROTO_OFFSET] == IPPROTO_IGMP
    {
        FrameClass::Igmp
    } else if dst.is_multicast() {
        FrameClass::Multicast
    } else {
        FrameClass::Unicast
    };

    Ok(ExtractedAddrs { src, dst, class })
}

// ============================================
// Helper Functions
// ============================================

fn read_ipv4(frame: &[u8], offset: usize) -> std::net::Ipv4Addr {
    let octets: [u8; 4] = frame[offset..offset + 4].try_into().expect("length checked");
    std::net::Ipv4Addr::from(octets)
}

fn read_ipv6(frame: &[u8], offset: usize) -> std::net::Ipv6Addr {
    let octets: [u8; 16] = frame[offset..offset + 16]
        .try_into()
        .expect("length checked");
    std::net::Ipv6Addr::from(octets)
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    pub(crate) fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, proto: u8) -> Vec<u8> {
        let mut packet = vec![0u8; IPV4_HEADER_MIN_SIZE];
        packet[0] = 0x45; // Version 4, IHL 5
        packet[3] = IPV4_HEADER_MIN_SIZE as u8;
        packet[IPV4_PROTO_OFFSET] = proto;
        packet[IPV4_SRC_OFFSET..IPV4_SRC_OFFSET + 4].copy_from_slice(&src.octets());
        packet[IPV4_DST_OFFSET..IPV4_DST_OFFSET + 4].copy_from_slice(&dst.octets());
        packet
    }

    fn ether_frame(src: [u8; 6], dst: [u8; 6], ethertype: u16, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(ETH_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&dst);
        frame.extend_from_slice(&src);
        frame.extend_from_slice(&ethertype.to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn test_extract_ipv4_unicast() {
        let packet = ipv4_packet(
            Ipv4Addr::new(10, 8, 0, 6),
            Ipv4Addr::new(10, 8, 0, 10),
            17,
        );
        let e = extract_addrs(TunnelKind::Tun, &packet).unwrap();

        assert_eq!(e.src.to_ipv4(), Some(Ipv4Addr::new(10, 8, 0, 6)));
        assert_eq!(e.dst.to_ipv4(), Some(Ipv4Addr::new(10, 8, 0, 10)));
        assert_eq!(e.class, FrameClass::Unicast);
    }

    #[test]
    fn test_extract_ipv4_broadcast_and_multicast() {
        let bcast = ipv4_packet(
            Ipv4Addr::new(10, 8, 0, 6),
            Ipv4Addr::new(255, 255, 255, 255),
            17,
        );
        assert_eq!(
            extract_addrs(TunnelKind::Tun, &bcast).unwrap().class,
            FrameClass::Broadcast
        );

        let mcast = ipv4_packet(
            Ipv4Addr::new(10, 8, 0, 6),
            Ipv4Addr::new(239, 1, 2, 3),
            17,
        );
        assert_eq!(
            extract_addrs(TunnelKind::Tun, &mcast).unwrap().class,
            FrameClass::Multicast
        );
    }

    #[test]
    fn test_extract_ipv4_igmp() {
        let igmp = ipv4_packet(
            Ipv4Addr::new(10, 8, 0, 6),
            Ipv4Addr::new(224, 0, 0, 1),
            IPPROTO_IGMP,
        );
        assert_eq!(
            extract_addrs(TunnelKind::Tun, &igmp).unwrap().class,
            FrameClass::Igmp
        );
    }

    #[test]
    fn test_extract_ipv6() {
        let src: Ipv6Addr = "fd00::1".parse().unwrap();
        let dst: Ipv6Addr = "fd00::2".parse().unwrap();
        let mut packet = vec![0u8; IPV6_HEADER_SIZE];
        packet[0] = 0x60;
        packet[IPV6_SRC_OFFSET..IPV6_SRC_OFFSET + 16].copy_from_slice(&src.octets());
        packet[IPV6_DST_OFFSET..IPV6_DST_OFFSET + 16].copy_from_slice(&dst.octets());

        let e = extract_addrs(TunnelKind::Tun, &packet).unwrap();
        assert_eq!(e.src.to_ipv6(), Some(src));
        assert_eq!(e.dst.to_ipv6(), Some(dst));
        assert_eq!(e.class, FrameClass::Unicast);

        let mcast: Ipv6Addr = "ff02::1".parse().unwrap();
        packet[IPV6_DST_OFFSET..IPV6_DST_OFFSET + 16].copy_from_slice(&mcast.octets());
        assert_eq!(
            extract_addrs(TunnelKind::Tun, &packet).unwrap().class,
            FrameClass::Multicast
        );
    }

    #[test]
    fn test_extract_too_short() {
        assert!(matches!(
            extract_addrs(TunnelKind::Tun, &[0x45, 0x00]),
            Err(CoreError::FrameTooShort { .. })
        ));
        assert!(matches!(
            extract_addrs(TunnelKind::Tap, &[0u8; 10]),
            Err(CoreError::FrameTooShort { .. })
        ));
    }

    #[test]
    fn test_extract_bad_ip_version() {
        let mut packet = vec![0u8; IPV4_HEADER_MIN_SIZE];
        packet[0] = 0x50;
        assert!(matches!(
            extract_addrs(TunnelKind::Tun, &packet),
            Err(CoreError::UnsupportedIpVersion(5))
        ));
    }

    #[test]
    fn test_extract_ether_unicast() {
        let src = [0x02, 0, 0, 0, 0, 0x01];
        let dst = [0x02, 0, 0, 0, 0, 0x02];
        let inner = ipv4_packet(Ipv4Addr::new(10, 8, 0, 6), Ipv4Addr::new(10, 8, 0, 10), 6);
        let frame = ether_frame(src, dst, ETHERTYPE_IPV4, &inner);

        let e = extract_addrs(TunnelKind::Tap, &frame).unwrap();
        assert_eq!(e.src.to_mac(), Some(src));
        assert_eq!(e.dst.to_mac(), Some(dst));
        assert_eq!(e.class, FrameClass::Unicast);
    }

    #[test]
    fn test_extract_ether_broadcast() {
        let src = [0x02, 0, 0, 0, 0, 0x01];
        let frame = ether_frame(src, [0xff; 6], ETHERTYPE_ARP, &[0u8; 28]);

        let e = extract_addrs(TunnelKind::Tap, &frame).unwrap();
        assert_eq!(e.class, FrameClass::Broadcast);
    }

    #[test]
    fn test_extract_ether_vlan_tagged() {
        let src = [0x02, 0, 0, 0, 0, 0x01];
        let dst = [0x02, 0, 0, 0, 0, 0x02];
        let inner = ipv4_packet(Ipv4Addr::new(10, 8, 0, 6), Ipv4Addr::new(10, 8, 0, 10), 6);

        let mut frame = Vec::new();
        frame.extend_from_slice(&dst);
        frame.extend_from_slice(&src);
        frame.extend_from_slice(&ETHERTYPE_VLAN.to_be_bytes());
        frame.extend_from_slice(&[0x00, 0x64]); // VID 100
        frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        frame.extend_from_slice(&inner);

        let e = extract_addrs(TunnelKind::Tap, &frame).unwrap();
        assert_eq!(e.src.to_mac(), Some(src));
        assert_eq!(e.class, FrameClass::Unicast);
    }

    #[test]
    fn test_extract_ether_unknown_type() {
        let frame = ether_frame([0x02; 6], [0x04; 6], 0x88cc, &[0u8; 16]);
        assert!(matches!(
            extract_addrs(TunnelKind::Tap, &frame),
            Err(CoreError::UnknownEtherType(0x88cc))
        ));
    }

    #[test]
    fn test_extract_ether_igmp() {
        let src = [0x02, 0, 0, 0, 0, 0x01];
        let mcast_mac = [0x01, 0x00, 0x5e, 0x00, 0x00, 0x01];
        let inner = ipv4_packet(
            Ipv4Addr::new(10, 8, 0, 6),
            Ipv4Addr::new(224, 0, 0, 1),
            IPPROTO_IGMP,
        );
        let frame = ether_frame(src, mcast_mac, ETHERTYPE_IPV4, &inner);

        let e = extract_addrs(TunnelKind::Tap, &frame).unwrap();
        assert_eq!(e.class, FrameClass::Igmp);
    }
}
