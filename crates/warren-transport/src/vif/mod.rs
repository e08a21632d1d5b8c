// ============================================
// File: crates/warren-transport/src/vif/mod.rs
// ============================================
//! # Virtual-Interface Module
//!
//! ## Creation Reason
//! The userspace end of the tunnel: frames the engine routes enter and
//! leave the host network stack through one of these devices.
//!
//! ## Main Functionality
//! - [`linux`]: kernel tun/tap devices via the `/dev/net/tun` clone
//! - [`mock`]: in-memory device with congestion simulation, for tests
//!
//! ## Tun vs Tap
//! A tun device exchanges bare IPv4/IPv6 packets and drives L3
//! routing; a tap device exchanges Ethernet II frames (possibly 802.1Q
//! tagged), which is what enables MAC learning and broadcast
//! replication. Frame sizing differs per mode: callers take buffer
//! sizes from `VifConfig::frame_capacity`, which reserves the L2
//! header and one VLAN tag on top of the MTU in tap mode.
//!
//! ## ⚠️ Important Note for Next Developer
//! - Real devices require root or CAP_NET_ADMIN; everything testable
//!   without privileges belongs in the mock
//! - Outbound frames are geometry-checked in both implementations;
//!   keep them in agreement

// Platform-specific implementations
#[cfg(target_os = "linux")]
pub mod linux;

// Mock implementation for testing
#[cfg(any(test, feature = "mock"))]
pub mod mock;

// Re-export based on platform
#[cfg(target_os = "linux")]
pub use linux::LinuxVif;

#[cfg(any(test, feature = "mock"))]
pub use mock::MockVif;
