// ============================================
// File: crates/warren-transport/src/traits.rs
// ============================================
//! # Transport Traits
//!
//! ## Creation Reason
//! Defines abstract interfaces for transport operations, enabling
//! testability and flexibility in implementation choices.
//!
//! ## Main Functionality
//! - `DatagramTransport`: single-port datagram interface (UDP)
//! - `VirtualInterface`: TUN/TAP read/write interface
//! - `VifConfig`: virtual-interface creation parameters
//!
//! ## Design Philosophy
//! - Traits enable mock implementations for testing
//! - Async-first design with `async_trait`
//! - Would-block is a result on the send path, not an error
//! - Platform-agnostic definitions
//!
//! ## ⚠️ Important Note for Next Developer
//! - Implementations must be Send + Sync for use in async contexts
//! - Buffer management is the caller's responsibility

use std::net::Ipv4Addr;

use async_trait::async_trait;

use warren_core::addr::{OuterAddr, PktInfo};
use warren_core::frame::TunnelKind;

use crate::error::{Result, TransportError};

// ============================================
// Frame Geometry
// ============================================

/// Ethernet II header length carried by tap frames.
pub const ETH_HEADER_LEN: usize = 14;

/// Extra bytes occupied by one 802.1Q tag on a tap frame.
pub const VLAN_TAG_LEN: usize = 4;

// ============================================
// TrySend
// ============================================

/// Outcome of a non-blocking send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrySend {
    /// The datagram or record left the socket.
    Sent(usize),
    /// The socket buffer is full; the caller decides whether to defer
    /// or drop the payload.
    WouldBlock,
}

// ============================================
// DatagramTransport Trait
// ============================================

/// Abstract interface for the single-port datagram transport.
///
/// # Purpose
/// One socket multiplexes every peer; each received datagram carries
/// the peer's outer address (and, on multi-homed hosts, the local
/// address the kernel chose) so the engine can key its registry.
///
/// # Example
/// ```ignore
/// async fn pump<T: DatagramTransport>(t: &T) -> Result<()> {
///     let mut buf = [0u8; 65535];
///     loop {
///         let (len, peer, _pktinfo) = t.recv(&mut buf).await?;
///         let reply = process(&buf[..len]);
///         t.try_send(&reply, &peer)?;
///     }
/// }
/// ```
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    /// Receives one datagram.
    ///
    /// # Returns
    /// (bytes received, peer outer address, optional local pktinfo)
    ///
    /// # Errors
    /// Returns error if receive fails; would-block never surfaces (the
    /// future parks instead).
    async fn recv(&self, buf: &mut [u8]) -> Result<(usize, OuterAddr, Option<PktInfo>)>;

    /// Attempts a non-blocking send to `dest`.
    ///
    /// # Errors
    /// Returns error on a socket failure; a full socket buffer is the
    /// `WouldBlock` outcome, not an error.
    fn try_send(&self, buf: &[u8], dest: &OuterAddr) -> Result<TrySend>;

    /// Sends to `dest`, parking until the socket accepts the datagram.
    ///
    /// # Errors
    /// Returns error if the send fails.
    async fn send(&self, buf: &[u8], dest: &OuterAddr) -> Result<usize>;

    /// Returns the local address this transport is bound to.
    ///
    /// # Errors
    /// Returns error if the address cannot be determined.
    fn local_addr(&self) -> Result<OuterAddr>;

    /// Gracefully shuts down the transport.
    ///
    /// # Errors
    /// Returns error if shutdown fails.
    async fn shutdown(&self) -> Result<()>;

    /// Returns `true` if the transport is still active.
    fn is_active(&self) -> bool;
}

// ============================================
// VirtualInterface Trait
// ============================================

/// Abstract interface for TUN/TAP device operations.
///
/// # Data Format
/// TUN devices carry raw IPv4/IPv6 packets; TAP devices carry
/// Ethernet II frames (optionally 802.1Q tagged). Any platform type
/// word is stripped by the implementation.
#[async_trait]
pub trait VirtualInterface: Send + Sync {
    /// Reads one frame from the device.
    ///
    /// # Errors
    /// Returns error if read fails.
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Writes one frame to the device.
    ///
    /// # Errors
    /// Returns error if write fails.
    async fn write(&self, buf: &[u8]) -> Result<usize>;

    /// Returns the device name.
    fn name(&self) -> &str;

    /// Returns whether the device is TUN (L3) or TAP (L2).
    fn kind(&self) -> TunnelKind;

    /// Returns the MTU.
    fn mtu(&self) -> u16;

    /// Brings the device up (activates it).
    ///
    /// # Errors
    /// Returns error if activation fails.
    async fn up(&self) -> Result<()>;

    /// Brings the device down (deactivates it).
    ///
    /// # Errors
    /// Returns error if deactivation fails.
    async fn down(&self) -> Result<()>;

    /// Returns `true` if the device is up and active.
    fn is_up(&self) -> bool;
}

// ============================================
// VifConfig
// ============================================

/// Configuration for virtual-interface creation.
///
/// # Example
/// ```
/// use warren_transport::traits::VifConfig;
/// use warren_core::frame::TunnelKind;
/// use std::net::Ipv4Addr;
///
/// let config = VifConfig::new("warren0", TunnelKind::Tun)
///     .with_address(Ipv4Addr::new(10, 8, 0, 1))
///     .with_netmask(Ipv4Addr::new(255, 255, 255, 0))
///     .with_mtu(1500);
/// ```
#[derive(Debug, Clone)]
pub struct VifConfig {
    /// Device name (e.g., "warren0").
    pub name: String,
    /// Whether to create a TUN or TAP device.
    pub kind: TunnelKind,
    /// IP address to assign to the device.
    pub address: Ipv4Addr,
    /// Network mask.
    pub netmask: Ipv4Addr,
    /// MTU size.
    pub mtu: u16,
}

impl VifConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: TunnelKind) -> Self {
        Self {
            name: name.into(),
            kind,
            address: Ipv4Addr::new(10, 8, 0, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            mtu: 1500,
        }
    }

    /// Sets the IP address.
    #[must_use]
    pub const fn with_address(mut self, address: Ipv4Addr) -> Self {
        self.address = address;
        self
    }

    /// Sets the network mask.
    #[must_use]
    pub const fn with_netmask(mut self, netmask: Ipv4Addr) -> Self {
        self.netmask = netmask;
        self
    }

    /// Sets the MTU.
    #[must_use]
    pub const fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    /// Largest frame this device may produce or accept.
    ///
    /// Tun devices carry bare L3 packets capped by the MTU; tap frames
    /// add the Ethernet header and, when the peer network tags its
    /// traffic, one 802.1Q tag on top of the MTU-sized payload.
    #[must_use]
    pub fn frame_capacity(&self) -> usize {
        match self.kind {
            TunnelKind::Tun => usize::from(self.mtu),
            TunnelKind::Tap => usize::from(self.mtu) + ETH_HEADER_LEN + VLAN_TAG_LEN,
        }
    }

    /// Checks an outbound frame against the device geometry before it
    /// is handed to the kernel.
    ///
    /// # Errors
    /// Rejects empty frames, frames above [`VifConfig::frame_capacity`],
    /// and tap runts shorter than an Ethernet header.
    pub fn check_outbound(&self, frame: &[u8]) -> Result<()> {
        if frame.is_empty() {
            return Err(TransportError::VifWriteFailed {
                reason: "empty frame".into(),
            });
        }
        let capacity = self.frame_capacity();
        if frame.len() > capacity {
            return Err(TransportError::VifWriteFailed {
                reason: format!(
                    "{} byte frame exceeds device capacity {}",
                    frame.len(),
                    capacity
                ),
            });
        }
        if self.kind == TunnelKind::Tap && frame.len() < ETH_HEADER_LEN {
            return Err(TransportError::VifWriteFailed {
                reason: format!("{} byte runt frame", frame.len()),
            });
        }
        Ok(())
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(TransportError::invalid_config(
                "name",
                "device name cannot be empty",
            ));
        }

        if self.name.len() > 15 {
            return Err(TransportError::invalid_config(
                "name",
                "device name cannot exceed 15 characters",
            ));
        }

        if self.mtu < 576 {
            return Err(TransportError::invalid_config(
                "mtu",
                "MTU must be at least 576 bytes",
            ));
        }

        if self.mtu > 9000 {
            return Err(TransportError::invalid_config(
                "mtu",
                "MTU cannot exceed 9000 bytes",
            ));
        }

        Ok(())
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vif_config_defaults() {
        let config = VifConfig::new("tun0", TunnelKind::Tun);

        assert_eq!(config.name, "tun0");
        assert_eq!(config.kind, TunnelKind::Tun);
        assert_eq!(config.mtu, 1500);
    }

    #[test]
    fn test_vif_config_builder() {
        let config = VifConfig::new("tap0", TunnelKind::Tap)
            .with_address(Ipv4Addr::new(10, 9, 0, 1))
            .with_netmask(Ipv4Addr::new(255, 255, 0, 0))
            .with_mtu(1400);

        assert_eq!(config.address, Ipv4Addr::new(10, 9, 0, 1));
        assert_eq!(config.netmask, Ipv4Addr::new(255, 255, 0, 0));
        assert_eq!(config.mtu, 1400);
    }

    #[test]
    fn test_vif_config_validation() {
        assert!(VifConfig::new("tun0", TunnelKind::Tun).validate().is_ok());
        assert!(VifConfig::new("", TunnelKind::Tun).validate().is_err());
        assert!(VifConfig::new("a".repeat(20), TunnelKind::Tun)
            .validate()
            .is_err());
        assert!(VifConfig::new("tun0", TunnelKind::Tun)
            .with_mtu(100)
            .validate()
            .is_err());
        assert!(VifConfig::new("tun0", TunnelKind::Tun)
            .with_mtu(10000)
            .validate()
            .is_err());
    }

    #[test]
    fn test_frame_capacity_per_mode() {
        let tun = VifConfig::new("tun0", TunnelKind::Tun).with_mtu(1400);
        assert_eq!(tun.frame_capacity(), 1400);

        // Tap reserves room for the L2 header and one 802.1Q tag
        let tap = VifConfig::new("tap0", TunnelKind::Tap).with_mtu(1400);
        assert_eq!(tap.frame_capacity(), 1400 + ETH_HEADER_LEN + VLAN_TAG_LEN);
    }

    #[test]
    fn test_check_outbound_tun() {
        let tun = VifConfig::new("tun0", TunnelKind::Tun).with_mtu(1400);

        assert!(tun.check_outbound(&[0x45; 20]).is_ok());
        assert!(tun.check_outbound(&[]).is_err());
        assert!(tun.check_outbound(&vec![0u8; 1401]).is_err());
    }

    #[test]
    fn test_check_outbound_tap() {
        let tap = VifConfig::new("tap0", TunnelKind::Tap).with_mtu(1400);

        // A full-size tagged frame fits
        let tagged = vec![0u8; 1400 + ETH_HEADER_LEN + VLAN_TAG_LEN];
        assert!(tap.check_outbound(&tagged).is_ok());

        // Shorter than an Ethernet header is a runt
        assert!(tap.check_outbound(&[0u8; 13]).is_err());
        assert!(tap.check_outbound(&[0u8; 14]).is_ok());
    }
}
