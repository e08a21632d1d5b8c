// ============================================
// File: crates/warren-transport/src/udp.rs
// ============================================
//! # UDP Transport Implementation
//!
//! ## Creation Reason
//! Provides the single-port UDP socket every peer multiplexes over,
//! wrapping Tokio's UDP socket with our `DatagramTransport` trait.
//!
//! ## Main Functionality
//! - `UdpTransport`: Main UDP transport implementation
//! - Socket binding with address reuse
//! - Async receive, non-blocking try-send for the event loop
//! - Graceful shutdown support
//!
//! ## Design Choices
//! - Uses SO_REUSEADDR for quick rebinding after restart
//! - Non-blocking operations with Tokio
//! - A full socket buffer surfaces as `TrySend::WouldBlock`; datagram
//!   delivery is best-effort so callers may drop
//!
//! ## ⚠️ Important Note for Next Developer
//! - UDP is connectionless - no guaranteed delivery
//! - Maximum UDP payload is ~65507 bytes
//! - Packet-info (multi-homed replies) requires recvmsg and is not
//!   exposed by this implementation; bind a specific address instead

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info, trace};

use warren_core::addr::{OuterAddr, PktInfo};

use crate::error::{Result, TransportError};
use crate::traits::{DatagramTransport, TrySend};

// ============================================
// UdpTransport
// ============================================

/// UDP-based transport implementation.
///
/// # Features
/// - Async receive using Tokio
/// - Non-blocking sends for the event loop
/// - Address reuse for quick restart
/// - Thread-safe (Send + Sync)
///
/// # Example
/// ```ignore
/// use warren_transport::UdpTransport;
///
/// let transport = UdpTransport::bind("0.0.0.0:1194").await?;
///
/// let mut buf = [0u8; 65535];
/// let (len, peer, _) = transport.recv(&mut buf).await?;
/// transport.try_send(b"response", &peer)?;
/// ```
pub struct UdpTransport {
    /// Underlying UDP socket
    socket: Arc<UdpSocket>,
    /// Local address we're bound to
    local_addr: SocketAddr,
    /// Shutdown flag
    shutdown: AtomicBool,
}

impl UdpTransport {
    /// Creates a new UDP transport bound to the specified address.
    ///
    /// # Socket Options
    /// - `SO_REUSEADDR`: Enabled for quick rebinding
    /// - Non-blocking: Required for async operations
    ///
    /// # Errors
    /// - `InvalidAddress` if `addr` does not parse
    /// - `BindFailed` / `AddressInUse` if binding fails
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self> {
        let addr_str = addr.as_ref();
        let socket_addr: SocketAddr = addr_str.parse().map_err(|_| {
            TransportError::InvalidAddress {
                addr: addr_str.to_string(),
            }
        })?;

        Self::bind_addr(socket_addr).await
    }

    /// Creates a new UDP transport bound to the specified socket address.
    ///
    /// # Errors
    /// Returns error if binding fails.
    pub async fn bind_addr(addr: SocketAddr) -> Result<Self> {
        info!("Binding UDP transport to {}", addr);

        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| TransportError::io("creating UDP socket", e))?;

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

        let std_socket: std::net::UdpSocket = socket.into();
        let tokio_socket = UdpSocket::from_std(std_socket)
            .map_err(|e| TransportError::io("converting to Tokio socket", e))?;

        let local_addr = tokio_socket
            .local_addr()
            .map_err(|e| TransportError::io("getting local address", e))?;

        info!("UDP transport bound to {}", local_addr);

        Ok(Self {
            socket: Arc::new(tokio_socket),
            local_addr,
            shutdown: AtomicBool::new(false),
        })
    }

    /// Checks if the transport has been shut down.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn require_ip(dest: &OuterAddr) -> Result<SocketAddr> {
        dest.socket_addr().ok_or_else(|| TransportError::SendFailed {
            dest: dest.to_string(),
            reason: "UDP transport cannot reach a unix-path peer".into(),
        })
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    async fn recv(&self, buf: &mut [u8]) -> Result<(usize, OuterAddr, Option<PktInfo>)> {
        if self.is_shutdown() {
            return Err(TransportError::ShuttingDown);
        }

        let (len, addr) = self
            .socket
            .recv_from(buf)
            .await
            .map_err(|e| TransportError::ReceiveFailed {
                reason: e.to_string(),
            })?;

        trace!("Received {} bytes from {}", len, addr);

        Ok((len, OuterAddr::Ip(addr), None))
    }

    fn try_send(&self, buf: &[u8], dest: &OuterAddr) -> Result<TrySend> {
        if self.is_shutdown() {
            return Err(TransportError::ShuttingDown);
        }

        let addr = Self::require_ip(dest)?;
        match self.socket.try_send_to(buf, addr) {
            Ok(len) => {
                trace!("Sent {} bytes to {}", len, addr);
                Ok(TrySend::Sent(len))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(TrySend::WouldBlock),
            Err(e) => Err(TransportError::SendFailed {
                dest: dest.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn send(&self, buf: &[u8], dest: &OuterAddr) -> Result<usize> {
        if self.is_shutdown() {
            return Err(TransportError::ShuttingDown);
        }

        let addr = Self::require_ip(dest)?;
        let len = self
            .socket
            .send_to(buf, addr)
            .await
            .map_err(|e| TransportError::SendFailed {
                dest: dest.to_string(),
                reason: e.to_string(),
            })?;

        trace!("Sent {} bytes to {}", len, addr);

        Ok(len)
    }

    fn local_addr(&self) -> Result<OuterAddr> {
        Ok(OuterAddr::Ip(self.local_addr))
    }

    async fn shutdown(&self) -> Result<()> {
        debug!("Shutting down UDP transport");
        self.shutdown.store(true, Ordering::Release);
        info!("UDP transport shutdown complete");
        Ok(())
    }

    fn is_active(&self) -> bool {
        !self.is_shutdown()
    }
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("local_addr", &self.local_addr)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_and_local_addr() {
        let transport = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let addr = transport.local_addr().unwrap();

        let sa = addr.socket_addr().unwrap();
        assert_eq!(sa.ip(), std::net::Ipv4Addr::LOCALHOST);
        assert!(sa.port() > 0);
    }

    #[tokio::test]
    async fn test_send_recv_loopback() {
        let server = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let client = UdpTransport::bind("127.0.0.1:0").await.unwrap();

        let server_addr = server.local_addr().unwrap();
        let client_addr = client.local_addr().unwrap();

        let message = b"hello warren";
        client.send(message, &server_addr).await.unwrap();

        let mut buf = [0u8; 1024];
        let (len, source, pktinfo) = server.recv(&mut buf).await.unwrap();

        assert_eq!(len, message.len());
        assert_eq!(&buf[..len], message);
        assert_eq!(source, client_addr);
        assert!(pktinfo.is_none());
    }

    #[tokio::test]
    async fn test_try_send_loopback() {
        let server = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let client = UdpTransport::bind("127.0.0.1:0").await.unwrap();

        let outcome = client
            .try_send(b"nonblocking", &server.local_addr().unwrap())
            .unwrap();
        assert_eq!(outcome, TrySend::Sent(11));

        let mut buf = [0u8; 64];
        let (len, _, _) = server.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"nonblocking");
    }

    #[tokio::test]
    async fn test_shutdown() {
        let transport = UdpTransport::bind("127.0.0.1:0").await.unwrap();

        assert!(transport.is_active());
        transport.shutdown().await.unwrap();
        assert!(!transport.is_active());

        let mut buf = [0u8; 64];
        let result = transport.recv(&mut buf).await;
        assert!(matches!(result, Err(TransportError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_invalid_address() {
        let result = UdpTransport::bind("not-an-address").await;
        assert!(matches!(result, Err(TransportError::InvalidAddress { .. })));
    }

    #[tokio::test]
    async fn test_unix_destination_rejected() {
        let transport = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let dest = OuterAddr::Unix(std::path::PathBuf::from("/run/warren.sock"));
        assert!(matches!(
            transport.try_send(b"x", &dest),
            Err(TransportError::SendFailed { .. })
        ));
    }
}
