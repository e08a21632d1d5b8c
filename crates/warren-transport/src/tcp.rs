// ============================================
// File: crates/warren-transport/src/tcp.rs
// ============================================
//! # TCP Stream Link
//!
//! ## Creation Reason
//! In TCP mode each peer owns an accepted connection carrying
//! length-prefixed records. This module wraps one such connection:
//! framed reads through the stream assembler, non-blocking framed
//! writes with a partial-record tail, and reset classification.
//!
//! ## Main Functionality
//! - `TcpLink`: one accepted peer connection
//! - `bind_stream_listener`: listener with address reuse
//! - `SendStatus`: whether a record was committed or must be deferred
//!
//! ## Backpressure Contract
//! A record is either committed in full (possibly leaving a partial
//! tail that `flush_pending` completes) or refused with
//! `SendStatus::Blocked` before any byte is written. Refused records
//! belong on the instance's deferred queue; the link never reorders or
//! tears records.
//!
//! ## ⚠️ Important Note for Next Developer
//! - Record boundaries are sacred: never interleave writes from two
//!   records
//! - RST/ABORT class errors surface as `PeerReset`; orderly EOF as
//!   `Ok(None)` from `read_frame`

use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, trace};

use warren_core::addr::OuterAddr;
use warren_core::codec::{encode_frame, StreamAssembler};

use crate::error::{Result, TransportError};

// ============================================
// Constants
// ============================================

/// Read chunk size for the stream reassembly path.
const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Listen backlog for the stream listener.
const LISTEN_BACKLOG: i32 = 32;

// ============================================
// SendStatus
// ============================================

/// Outcome of a non-blocking framed send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// The record was committed to the socket (a partial tail may
    /// remain; complete it with `flush_pending`).
    Sent,
    /// The socket refused the record before any byte was written;
    /// defer it.
    Blocked,
}

// ============================================
// Listener
// ============================================

/// Binds a TCP listener with address reuse, ready for `accept`.
///
/// # Errors
/// Returns `AddressInUse` / `BindFailed` on bind errors.
pub async fn bind_stream_listener(addr: SocketAddr) -> Result<TcpListener> {
    info!("Binding TCP listener to {}", addr);

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| TransportError::io("creating TCP socket", e))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| TransportError::io("setting SO_REUSEADDR", e))?;

    socket
        .set_nonblocking(true)
        .map_err(|e| TransportError::io("setting non-blocking", e))?;

    socket.bind(&addr.into()).map_err(|e| {
        if e.kind() == std::io::ErrorKind::AddrInUse {
            TransportError::AddressInUse { addr }
        } else {
            TransportError::bind_failed(addr, e.to_string())
        }
    })?;

    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|e| TransportError::io("listening", e))?;

    let std_listener: std::net::TcpListener = socket.into();
    let listener = TcpListener::from_std(std_listener)
        .map_err(|e| TransportError::io("converting to Tokio listener", e))?;

    info!("TCP listener bound to {}", addr);
    Ok(listener)
}

// ============================================
// TcpLink
// ============================================

/// One accepted peer connection carrying length-prefixed records.
///
/// Owned by the connection's driver task; not internally synchronized.
pub struct TcpLink {
    stream: TcpStream,
    peer: OuterAddr,
    assembler: StreamAssembler,
    /// Unwritten tail of a partially committed record.
    pending: BytesMut,
}

impl TcpLink {
    /// Wraps an accepted stream.
    ///
    /// # Arguments
    /// * `stream` - The accepted connection
    /// * `max_frame` - Largest acceptable record
    ///
    /// # Errors
    /// Returns error if the peer address cannot be read.
    pub fn new(stream: TcpStream, max_frame: usize) -> Result<Self> {
        let peer_addr = stream
            .peer_addr()
            .map_err(|e| TransportError::io("reading peer address", e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| TransportError::io("setting TCP_NODELAY", e))?;

        debug!("Stream link established with {}", peer_addr);

        Ok(Self {
            stream,
            peer: OuterAddr::Ip(peer_addr),
            assembler: StreamAssembler::new(max_frame),
            pending: BytesMut::new(),
        })
    }

    /// The peer's outer address.
    #[must_use]
    pub const fn peer(&self) -> &OuterAddr {
        &self.peer
    }

    // ========================================
    // Reading
    // ========================================

    /// Reads the next complete record from the stream.
    ///
    /// # Returns
    /// - `Ok(Some(record))` - one complete record
    /// - `Ok(None)` - the peer closed the connection in order
    ///
    /// # Errors
    /// - `PeerReset` for RST/ABORT class failures
    /// - Framing violations from the assembler (stream must be reset)
    pub async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(frame) = self.assembler.next_frame()? {
                trace!("Assembled {} byte record from {}", frame.len(), self.peer);
                return Ok(Some(frame));
            }

            let mut chunk = BytesMut::with_capacity(READ_CHUNK_SIZE);
            let n = self
                .stream
                .read_buf(&mut chunk)
                .await
                .map_err(|e| TransportError::classify_stream_error(&self.peer, e))?;

            if n == 0 {
                // Orderly EOF mid-record still counts as a close
                debug!("Stream from {} closed", self.peer);
                return Ok(None);
            }
            self.assembler.push(&chunk);
        }
    }

    // ========================================
    // Writing
    // ========================================

    /// Attempts a non-blocking framed send of `payload`.
    ///
    /// # Errors
    /// - Framing errors for oversize/empty payloads
    /// - `PeerReset` for RST/ABORT class failures
    pub fn try_send_frame(&mut self, payload: &[u8]) -> Result<SendStatus> {
        if !self.pending.is_empty() {
            // A partial record owns the socket until it is flushed
            return Ok(SendStatus::Blocked);
        }

        let framed = encode_frame(payload)?;

        let mut written = 0;
        while written < framed.len() {
            match self.stream.try_write(&framed[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if written == 0 {
                        return Ok(SendStatus::Blocked);
                    }
                    // Record committed; keep the unwritten tail
                    self.pending.extend_from_slice(&framed[written..]);
                    return Ok(SendStatus::Sent);
                }
                Err(e) => {
                    return Err(TransportError::classify_stream_error(&self.peer, e));
                }
            }
        }

        Ok(SendStatus::Sent)
    }

    /// Completes a partially committed record, parking until writable.
    ///
    /// # Errors
    /// Returns `PeerReset` class errors on failure.
    pub async fn flush_pending(&mut self) -> Result<()> {
        while !self.pending.is_empty() {
            self.stream
                .writable()
                .await
                .map_err(|e| TransportError::classify_stream_error(&self.peer, e))?;

            match self.stream.try_write(&self.pending) {
                Ok(n) => {
                    let _ = self.pending.split_to(n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    return Err(TransportError::classify_stream_error(&self.peer, e));
                }
            }
        }
        Ok(())
    }

    /// Parks until the socket reports writable.
    ///
    /// # Errors
    /// Returns `PeerReset` class errors on failure.
    pub async fn writable(&self) -> Result<()> {
        self.stream
            .writable()
            .await
            .map_err(|e| TransportError::classify_stream_error(&self.peer, e))
    }

    /// Returns `true` while a partial record tail awaits flushing.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

impl std::fmt::Debug for TcpLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpLink")
            .field("peer", &self.peer)
            .field("pending", &self.pending.len())
            .finish()
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn connected_pair() -> (TcpLink, TcpStream) {
        let listener = bind_stream_listener("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();

        (TcpLink::new(accepted, 65535).unwrap(), client)
    }

    #[tokio::test]
    async fn test_read_framed_record() {
        let (mut link, mut client) = connected_pair().await;

        let framed = encode_frame(b"record body").unwrap();
        client.write_all(&framed).await.unwrap();

        let got = link.read_frame().await.unwrap().unwrap();
        assert_eq!(&got[..], b"record body");
    }

    #[tokio::test]
    async fn test_read_record_split_across_writes() {
        let (mut link, mut client) = connected_pair().await;

        let framed = encode_frame(b"slow record").unwrap();
        let (head, tail) = framed.split_at(5);
        client.write_all(head).await.unwrap();
        client.flush().await.unwrap();

        let reader = tokio::spawn(async move {
            let frame = link.read_frame().await.unwrap().unwrap();
            frame
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        client.write_all(tail).await.unwrap();

        let got = reader.await.unwrap();
        assert_eq!(&got[..], b"slow record");
    }

    #[tokio::test]
    async fn test_eof_returns_none() {
        let (mut link, client) = connected_pair().await;
        drop(client);
        assert!(link.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_try_send_frame_roundtrip() {
        let (mut link, mut client) = connected_pair().await;

        let status = link.try_send_frame(b"from server").unwrap();
        assert_eq!(status, SendStatus::Sent);
        link.flush_pending().await.unwrap();

        let mut buf = vec![0u8; 2 + 11];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..2], &[0x00, 0x0b]);
        assert_eq!(&buf[2..], b"from server");
    }

    #[tokio::test]
    async fn test_oversize_record_is_error() {
        let (mut link, _client) = connected_pair().await;
        let big = vec![0u8; 70_000];
        assert!(link.try_send_frame(&big).is_err());
    }
}
