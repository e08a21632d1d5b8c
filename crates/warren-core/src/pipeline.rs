// ============================================
// File: crates/warren-core/src/pipeline.rs
// ============================================
//! # Per-Client Processing Pipeline Contract
//!
//! ## Creation Reason
//! The server engine never performs cryptography itself; each client
//! instance carries an opaque pipeline that transforms frames between
//! their link (wire) and tunnel (plaintext) forms. This module defines
//! the five entry points the engine calls and the control signals it
//! observes.
//!
//! ## Main Functionality
//! - `PacketPipeline`: the five entry points of the per-client context
//! - `PipelineAction`: control signal returned by the transform calls
//! - `PreSelect`: the pipeline's timing and I/O interests
//! - `PipelineFactory`: opens a pipeline for a newly seen peer
//! - `NullPipeline`: pass-through implementation (plaintext mode, tests)
//!
//! ## Engine Contract
//! ```text
//! link frame ──► process_incoming_link ──► inner frame (or control, None)
//! inner frame ─► process_incoming_tun ───► link frame
//! process_outgoing_link / process_outgoing_tun drain pending output
//! pre_select reports the next wake-up and stream I/O interests
//! ```
//! Action translation by the engine: hard-fail → halt and close the
//! instance; soft-reset → keep the connection, discard queued state;
//! rekey-requested → advisory only, no engine action.
//!
//! ## ⚠️ Important Note for Next Developer
//! - Pipelines are driven from the event loop only; they need `Send`
//!   but never internal locking
//! - A pipeline that stops advancing its wake-up gets its instance
//!   transitioned to halting by the keepalive check

use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::addr::OuterAddr;
use crate::session::SessionId;

// ============================================
// PipelineAction
// ============================================

/// Control signal returned by the pipeline transform calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineAction {
    /// Frame processed normally.
    Ok,
    /// Recoverable state loss; discard queued output, keep the peer.
    SoftReset,
    /// Unrecoverable failure; the instance must be halted.
    HardFail,
    /// The pipeline wants a rekey soon; advisory only.
    RekeyRequested,
}

// ============================================
// PreSelect
// ============================================

/// Timing and I/O interests reported by a pipeline.
#[derive(Debug, Clone, Copy)]
pub struct PreSelect {
    /// Absolute time the pipeline next needs CPU (keepalive, rekey).
    pub next_wake: Option<Instant>,
    /// Whether the stream socket should be read-polled.
    pub wants_read: bool,
    /// Whether the stream socket should be write-polled.
    pub wants_write: bool,
}

impl PreSelect {
    /// Interests of an idle pipeline that only needs a future wake-up.
    #[must_use]
    pub const fn idle(next_wake: Instant) -> Self {
        Self {
            next_wake: Some(next_wake),
            wants_read: true,
            wants_write: false,
        }
    }
}

// ============================================
// PacketPipeline
// ============================================

/// The opaque per-client packet-processing context.
///
/// # Purpose
/// Everything cryptographic (handshake, AEAD, rekeying), plus
/// compression and fragmentation, lives behind these five calls. The
/// engine routes the byte buffers and obeys the returned actions.
pub trait PacketPipeline: Send {
    /// Consumes a frame received from the wire.
    ///
    /// Returns the decrypted inner frame for data packets, `None` for
    /// control/handshake traffic consumed by the pipeline itself.
    fn process_incoming_link(&mut self, frame: &[u8]) -> (Option<Bytes>, PipelineAction);

    /// Consumes a plaintext inner frame headed to this peer.
    ///
    /// Returns the link frame to transmit, `None` if the pipeline
    /// queued it internally (e.g. while the handshake completes).
    fn process_incoming_tun(&mut self, frame: &[u8]) -> (Option<Bytes>, PipelineAction);

    /// Drains pending link output (handshake records, queued data).
    fn process_outgoing_link(&mut self) -> Option<Bytes>;

    /// Drains a pending inner frame destined to the virtual interface.
    fn process_outgoing_tun(&mut self) -> Option<Bytes>;

    /// Reports when the pipeline next needs CPU and its I/O interests.
    fn pre_select(&mut self, now: Instant) -> PreSelect;

    /// `true` once the control channel reports the connection established.
    fn is_established(&self) -> bool;
}

// ============================================
// PipelineFactory
// ============================================

/// Opens pipelines for newly seen peers.
///
/// The factory carries the configured options (cipher, keys, timers);
/// `open` is the per-instance constructor, `Drop` the destructor.
pub trait PipelineFactory: Send + Sync {
    /// Opens a fresh pipeline for a peer at `remote`.
    fn open(&self, remote: &OuterAddr) -> Box<dyn PacketPipeline>;
}

// ============================================
// NullPipeline
// ============================================

/// Pass-through pipeline: frames cross unchanged.
///
/// # Purpose
/// Implements the plaintext ("no crypto") operating mode and gives the
/// engine tests a deterministic pipeline without keys or privileges.
/// The connection is considered established after the first link frame.
#[derive(Debug)]
pub struct NullPipeline {
    session: SessionId,
    established: bool,
    keepalive: Duration,
}

impl NullPipeline {
    /// Default keepalive interval between wake-ups.
    pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(10);

    /// Creates a pass-through pipeline with the default keepalive.
    #[must_use]
    pub fn new() -> Self {
        Self::with_keepalive(Self::DEFAULT_KEEPALIVE)
    }

    /// Creates a pass-through pipeline with a custom keepalive.
    #[must_use]
    pub fn with_keepalive(keepalive: Duration) -> Self {
        Self {
            session: SessionId::generate(),
            established: false,
            keepalive,
        }
    }

    /// The session identifier minted for this pipeline.
    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session
    }
}

impl Default for NullPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketPipeline for NullPipeline {
    fn process_incoming_link(&mut self, frame: &[u8]) -> (Option<Bytes>, PipelineAction) {
        self.established = true;
        (Some(Bytes::copy_from_slice(frame)), PipelineAction::Ok)
    }

    fn process_incoming_tun(&mut self, frame: &[u8]) -> (Option<Bytes>, PipelineAction) {
        (Some(Bytes::copy_from_slice(frame)), PipelineAction::Ok)
    }

    fn process_outgoing_link(&mut self) -> Option<Bytes> {
        None
    }

    fn process_outgoing_tun(&mut self) -> Option<Bytes> {
        None
    }

    fn pre_select(&mut self, now: Instant) -> PreSelect {
        PreSelect::idle(now + self.keepalive)
    }

    fn is_established(&self) -> bool {
        self.established
    }
}

/// Factory for [`NullPipeline`] instances.
#[derive(Debug, Clone)]
pub struct NullPipelineFactory {
    keepalive: Duration,
}

impl NullPipelineFactory {
    /// Creates a factory with the default keepalive.
    #[must_use]
    pub fn new() -> Self {
        Self {
            keepalive: NullPipeline::DEFAULT_KEEPALIVE,
        }
    }

    /// Creates a factory with a custom keepalive.
    #[must_use]
    pub const fn with_keepalive(keepalive: Duration) -> Self {
        Self { keepalive }
    }
}

impl Default for NullPipelineFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineFactory for NullPipelineFactory {
    fn open(&self, _remote: &OuterAddr) -> Box<dyn PacketPipeline> {
        Box::new(NullPipeline::with_keepalive(self.keepalive))
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_pipeline_passthrough() {
        let mut p = NullPipeline::new();
        assert!(!p.is_established());

        let (inner, action) = p.process_incoming_link(b"payload");
        assert_eq!(action, PipelineAction::Ok);
        assert_eq!(&inner.unwrap()[..], b"payload");
        assert!(p.is_established());

        let (link, action) = p.process_incoming_tun(b"reply");
        assert_eq!(action, PipelineAction::Ok);
        assert_eq!(&link.unwrap()[..], b"reply");
    }

    #[test]
    fn test_null_pipeline_no_pending_output() {
        let mut p = NullPipeline::new();
        assert!(p.process_outgoing_link().is_none());
        assert!(p.process_outgoing_tun().is_none());
    }

    #[test]
    fn test_pre_select_advances_wakeup() {
        let mut p = NullPipeline::with_keepalive(Duration::from_secs(5));
        let now = Instant::now();
        let ps = p.pre_select(now);

        assert_eq!(ps.next_wake, Some(now + Duration::from_secs(5)));
        assert!(ps.wants_read);
        assert!(!ps.wants_write);
    }

    #[test]
    fn test_factory_opens_distinct_sessions() {
        let factory = NullPipelineFactory::new();
        let remote: OuterAddr = "10.0.0.1:1194".parse::<std::net::SocketAddr>().unwrap().into();

        let a = factory.open(&remote);
        let b = factory.open(&remote);
        // Boxed pipelines are independent instances
        assert!(!a.is_established());
        assert!(!b.is_established());
    }
}
