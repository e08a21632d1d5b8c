// ============================================
// File: crates/warren-transport/src/error.rs
// ============================================
//! # Transport Error Types
//!
//! ## Creation Reason
//! Defines error types specific to transport layer operations
//! including network I/O and virtual-interface errors.
//!
//! ## Main Functionality
//! - `TransportError`: Primary error enum for transport operations
//! - Error conversion from system errors
//! - Categorization of retryable vs fatal vs peer-reset errors
//!
//! ## Error Categories
//! 1. **Network Errors**: UDP/TCP send/receive failures
//! 2. **Vif Errors**: Device creation, read/write failures
//! 3. **Configuration Errors**: Invalid addresses, ports
//! 4. **System Errors**: Permission denied, resource limits
//!
//! ## ⚠️ Important Note for Next Developer
//! - Would-block conditions are results, not errors, on the hot paths
//! - Peer-reset class errors halt one instance, never the loop
//! - Vif errors may require elevated privileges

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use warren_common::error::CommonError;

// ============================================
// Result Type Alias
// ============================================

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

// ============================================
// TransportError
// ============================================

/// Transport layer error types.
#[derive(Error, Debug)]
pub enum TransportError {
    // ========================================
    // Network Errors
    // ========================================

    /// Failed to bind to address.
    #[error("Failed to bind to {addr}: {reason}")]
    BindFailed {
        /// Address we tried to bind to
        addr: SocketAddr,
        /// Why binding failed
        reason: String,
    },

    /// Send operation failed.
    #[error("Failed to send to {dest}: {reason}")]
    SendFailed {
        /// Destination address
        dest: String,
        /// Why send failed
        reason: String,
    },

    /// Receive operation failed.
    #[error("Failed to receive: {reason}")]
    ReceiveFailed {
        /// Why receive failed
        reason: String,
    },

    /// The peer reset or aborted a stream connection.
    #[error("Peer {peer} reset the connection: {reason}")]
    PeerReset {
        /// The peer whose connection died
        peer: String,
        /// Underlying cause
        reason: String,
    },

    /// A stream connection closed in an orderly fashion.
    #[error("Peer {peer} closed the connection")]
    PeerClosed {
        /// The peer that disconnected
        peer: String,
    },

    /// Address already in use.
    #[error("Address {addr} already in use")]
    AddressInUse {
        /// The address that's in use
        addr: SocketAddr,
    },

    // ========================================
    // Virtual-Interface Errors
    // ========================================

    /// Failed to create the virtual interface.
    #[error("Failed to create interface '{name}': {reason}")]
    VifCreateFailed {
        /// Requested device name
        name: String,
        /// Why creation failed
        reason: String,
    },

    /// Failed to configure the virtual interface.
    #[error("Failed to configure interface '{name}': {reason}")]
    VifConfigFailed {
        /// Device name
        name: String,
        /// Why configuration failed
        reason: String,
    },

    /// Virtual-interface read failed.
    #[error("Interface read failed: {reason}")]
    VifReadFailed {
        /// Why read failed
        reason: String,
    },

    /// Virtual-interface write failed.
    #[error("Interface write failed: {reason}")]
    VifWriteFailed {
        /// Why write failed
        reason: String,
    },

    // ========================================
    // Configuration Errors
    // ========================================

    /// Invalid configuration.
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig {
        /// Configuration field name
        field: String,
        /// Why it's invalid
        reason: String,
    },

    /// Invalid IP address.
    #[error("Invalid address: {addr}")]
    InvalidAddress {
        /// The invalid address string
        addr: String,
    },

    // ========================================
    // System Errors
    // ========================================

    /// Permission denied for operation.
    #[error("Permission denied: {operation}")]
    PermissionDenied {
        /// What operation was denied
        operation: String,
    },

    /// Transport is shutting down.
    #[error("Transport is shutting down")]
    ShuttingDown,

    // ========================================
    // Wrapped Errors
    // ========================================

    /// I/O error from the system.
    #[error("I/O error: {context}")]
    Io {
        /// What was happening when the error occurred
        context: String,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Stream framing violation; the record boundary is lost.
    #[error("Stream framing error: {0}")]
    Framing(#[from] warren_core::error::CoreError),

    /// Error from the common crate.
    #[error(transparent)]
    Common(#[from] CommonError),
}

impl TransportError {
    // ========================================
    // Convenience Constructors
    // ========================================

    /// Creates a `BindFailed` error.
    pub fn bind_failed(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::BindFailed {
            addr,
            reason: reason.into(),
        }
    }

    /// Creates a `VifCreateFailed` error.
    pub fn vif_create_failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::VifCreateFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Creates an `Io` error with context.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Creates an `InvalidConfig` error.
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Classifies an I/O error on a stream socket for `peer`.
    ///
    /// Reset/abort class errors become `PeerReset`; everything else is
    /// wrapped as a generic `Io` error.
    pub fn classify_stream_error(peer: impl std::fmt::Display, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Self::PeerReset {
                peer: peer.to_string(),
                reason: err.to_string(),
            },
            io::ErrorKind::UnexpectedEof => Self::PeerClosed {
                peer: peer.to_string(),
            },
            _ => Self::Io {
                context: format!("stream I/O with {peer}"),
                source: err,
            },
        }
    }

    // ========================================
    // Error Classification
    // ========================================

    /// Returns `true` if this error is transient and retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
            ),
            Self::SendFailed { .. } | Self::ReceiveFailed { .. } => true,
            _ => false,
        }
    }

    /// Returns `true` if the error terminates one peer's connection.
    #[must_use]
    pub const fn is_peer_fatal(&self) -> bool {
        matches!(self, Self::PeerReset { .. } | Self::PeerClosed { .. })
    }

    /// Returns `true` if this error requires elevated privileges.
    #[must_use]
    pub const fn requires_privileges(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied { .. } | Self::VifCreateFailed { .. }
        )
    }
}

// ============================================
// Error Conversions
// ============================================

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        Self::Io {
            context: "unspecified I/O operation".into(),
            source: err,
        }
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TransportError::bind_failed("127.0.0.1:1194".parse().unwrap(), "in use");
        assert!(err.to_string().contains("127.0.0.1:1194"));
        assert!(err.to_string().contains("in use"));
    }

    #[test]
    fn test_stream_error_classification() {
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        let err = TransportError::classify_stream_error("10.0.0.1:9", reset);
        assert!(err.is_peer_fatal());
        assert!(matches!(err, TransportError::PeerReset { .. }));

        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        let err = TransportError::classify_stream_error("10.0.0.1:9", eof);
        assert!(matches!(err, TransportError::PeerClosed { .. }));

        let other = io::Error::new(io::ErrorKind::OutOfMemory, "oom");
        let err = TransportError::classify_stream_error("10.0.0.1:9", other);
        assert!(!err.is_peer_fatal());
    }

    #[test]
    fn test_io_error_retryable() {
        let would_block = io::Error::new(io::ErrorKind::WouldBlock, "would block");
        let err: TransportError = would_block.into();
        assert!(err.is_retryable());
    }
}
