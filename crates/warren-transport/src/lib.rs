// ============================================
// File: crates/warren-transport/src/lib.rs
// ============================================
//! # Warren Transport - Network I/O Layer
//!
//! ## Creation Reason
//! Provides network transport for the Warren tunnel: the datagram
//! socket that multiplexes every peer over a single port, the framed
//! stream link for TCP mode, and the TUN/TAP virtual-interface drivers.
//!
//! ## Main Functionality
//!
//! ### Modules
//! - [`traits`]: Transport trait definitions for abstraction
//! - [`udp`]: UDP socket implementation
//! - [`tcp`]: Framed stream link for TCP mode
//! - [`vif`]: Virtual-interface drivers (Linux TUN/TAP + mock)
//! - [`error`]: Transport-specific error types
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              warren-server                          │
//! │                    │                                │
//! │         ┌──────────┴──────────┐                     │
//! │         ▼                     ▼                     │
//! │   warren-core          warren-transport             │
//! │                        You are here ◄──             │
//! │         │                     │                     │
//! │         └──────────┬──────────┘                     │
//! │                    ▼                                │
//! │             warren-common                           │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Platform Support
//! | Platform | UDP | TCP | TUN/TAP |
//! |----------|-----|-----|---------|
//! | Linux    | ✅  | ✅  | ✅      |
//! | macOS    | ✅  | ✅  | ⚠️ (utun) |
//! | Windows  | ✅  | ✅  | ❌      |
//!
//! ## ⚠️ Important Note for Next Developer
//! - Virtual-interface creation requires root or CAP_NET_ADMIN
//! - All sockets run non-blocking; would-block surfaces to the caller
//! - Mock implementations available with the `mock` feature

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod tcp;
pub mod traits;
pub mod udp;
pub mod vif;

// Re-export primary types
pub use error::{Result, TransportError};
pub use tcp::{bind_stream_listener, SendStatus, TcpLink};
pub use traits::{DatagramTransport, TrySend, VifConfig, VirtualInterface};
pub use udp::UdpTransport;

#[cfg(target_os = "linux")]
pub use vif::linux::LinuxVif;

#[cfg(any(test, feature = "mock"))]
pub use vif::mock::MockVif;
