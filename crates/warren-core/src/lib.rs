// ============================================
// File: crates/warren-core/src/lib.rs
// ============================================
//! # Warren Core - Address Model and Pipeline Contract
//!
//! ## Creation Reason
//! Provides the data-plane vocabulary of the Warren tunnel: inner and
//! outer addresses, frame parsing for routing decisions, the stream
//! framing codec, and the contract the server engine uses to drive the
//! opaque per-client packet-processing pipeline.
//!
//! ## Main Functionality
//! - [`addr`]: Inner (tunneled) and outer (transport) address values
//! - [`frame`]: Source/destination extraction from IP and Ethernet frames
//! - [`codec`]: Length-prefix framing for stream transports
//! - [`session`]: 8-byte session identifiers
//! - [`pipeline`]: Per-client processing pipeline contract
//! - [`error`]: Core error types
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              warren-server                          │
//! │                    │                                │
//! │         ┌──────────┴──────────┐                     │
//! │         ▼                     ▼                     │
//! │   warren-core          warren-transport             │
//! │   You are here ◄──            │                     │
//! │         └──────────┬──────────┘                     │
//! │                    ▼                                │
//! │             warren-common                           │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Address equality/hash must stay padding-independent (route keys)
//! - The pipeline contract is the only crypto-facing surface of the engine
//! - The 2-byte stream length prefix is a wire constant - never change it

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod addr;
pub mod codec;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod session;

// Re-export primary types
pub use addr::{AddrKind, InnerAddr, OuterAddr, PktInfo};
pub use codec::{encode_frame, StreamAssembler};
pub use error::{CoreError, Result};
pub use frame::{extract_addrs, ExtractedAddrs, FrameClass, TunnelKind};
pub use pipeline::{PacketPipeline, PipelineAction, PipelineFactory, PreSelect};
pub use session::SessionId;
