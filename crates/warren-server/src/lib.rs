// ============================================
// File: crates/warren-server/src/lib.rs
// ============================================
//! # Warren Server Library
//!
//! ## Creation Reason
//! Provides the multi-client tunnel server: one engine multiplexing
//! every peer over a single wire port, routing inner frames between
//! peers and the local virtual interface.
//!
//! ## Main Functionality
//!
//! ### Modules
//! - [`config`]: Server configuration management
//! - [`server`]: Event loops and component wiring
//! - [`engine`]: The multi-client core
//!   - [`engine::instance`]: Client registry
//!   - [`engine::routes`]: Routing/learning table
//!   - [`engine::pool`]: Virtual-address pool
//!   - [`engine::scheduler`]: Wake-up scheduler
//!   - [`engine::deferred`]: Deferred-output index
//!   - [`engine::reaper`]: Route sweeps
//! - [`status`]: Status file output
//! - [`signal`]: Signal latches
//! - [`error`]: Server-specific error types
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Warren Server                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │   wire socket ◄──────────┐          ┌──────► vif (tun/tap)  │
//! │        │                 │          │              │        │
//! │        ▼                 │          │              ▼        │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │                    Event Loop                        │   │
//! │  └──────────────────────────┬───────────────────────────┘   │
//! │                             ▼                               │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │                     MultiEngine                      │   │
//! │  │  registry · routes · pool · scheduler · reaper       │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Data Flow
//! ```text
//! peer ──► wire ──► pipeline decrypt ──► route ──► vif / other peer
//! peer ◄── wire ◄── pipeline encrypt ◄── route ◄── vif
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Server requires root or CAP_NET_ADMIN for the virtual interface
//! - Configuration changes require restart (no hot-reload)
//! - Graceful shutdown drains every instance before returning

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod engine;
pub mod error;
pub mod server;
pub mod signal;
pub mod status;

// Re-export primary types
pub use config::ServerConfig;
pub use engine::MultiEngine;
pub use error::{Result, ServerError};
pub use server::Server;
