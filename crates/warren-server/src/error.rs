// ============================================
// File: crates/warren-server/src/error.rs
// ============================================
//! # Server Error Types

use thiserror::Error;

use warren_common::error::CommonError;
use warren_core::addr::InnerAddr;
use warren_core::error::CoreError;
use warren_transport::error::TransportError;

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Server error types.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to load configuration from '{path}': {reason}")]
    ConfigLoad {
        path: String,
        reason: String,
    },

    #[error("Invalid configuration: {field} - {reason}")]
    ConfigInvalid {
        field: String,
        reason: String,
    },

    #[error("Client limit reached: max {limit} instances")]
    MaxClientsReached {
        limit: usize,
    },

    #[error("Virtual address pool exhausted")]
    PoolExhausted,

    #[error("Virtual address {0} already assigned")]
    AddrAlreadyAssigned(InnerAddr),

    #[error("No route found for {destination}")]
    NoRoute {
        destination: InnerAddr,
    },

    #[error("Invalid packet from {from_addr}: {reason}")]
    InvalidPacket {
        from_addr: String,
        reason: String,
    },

    #[error("Server failed to start: {reason}")]
    StartupFailed {
        reason: String,
    },

    #[error("Server is shutting down")]
    ShuttingDown,

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },

    #[error(transparent)]
    Common(#[from] CommonError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    pub fn config_load(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn config_invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_packet(source: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Self::InvalidPacket {
            from_addr: source.to_string(),
            reason: reason.into(),
        }
    }

    pub fn startup_failed(reason: impl Into<String>) -> Self {
        Self::StartupFailed {
            reason: reason.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigLoad { .. } | Self::ConfigInvalid { .. }
        )
    }

    /// New connections refused for capacity reasons may succeed later.
    #[must_use]
    pub const fn is_admission_refusal(&self) -> bool {
        matches!(
            self,
            Self::MaxClientsReached { .. } | Self::PoolExhausted
        )
    }

    /// Format errors are counted and the frame dropped; the instance
    /// and the loop both continue.
    #[must_use]
    pub fn is_format_error(&self) -> bool {
        match self {
            Self::InvalidPacket { .. } => true,
            Self::Core(e) => e.is_format_error(),
            _ => false,
        }
    }

    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConfigLoad { .. } | Self::StartupFailed { .. } | Self::Internal { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ServerError::config_load("/etc/warren/server.toml", "file not found");
        assert!(err.to_string().contains("/etc/warren/server.toml"));
    }

    #[test]
    fn test_error_classification() {
        let config_err = ServerError::config_invalid("port", "must be > 0");
        assert!(config_err.is_config_error());

        assert!(ServerError::MaxClientsReached { limit: 2 }.is_admission_refusal());
        assert!(ServerError::PoolExhausted.is_admission_refusal());

        let format = ServerError::Core(CoreError::too_short(20, 3));
        assert!(format.is_format_error());
        assert!(!format.is_fatal());
    }
}
