// ============================================
// File: crates/warren-core/src/error.rs
// ============================================
//! # Core Error Types

use thiserror::Error;

use warren_common::error::CommonError;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error types.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Frame is shorter than the minimum required for parsing.
    #[error("Frame too short: need {needed} bytes, got {actual}")]
    FrameTooShort {
        /// Minimum bytes required
        needed: usize,
        /// Bytes available
        actual: usize,
    },

    /// EtherType is not one the tunnel forwards.
    #[error("Unknown EtherType: {0:#06x}")]
    UnknownEtherType(u16),

    /// IP version nibble is neither 4 nor 6.
    #[error("Unsupported IP version: {0}")]
    UnsupportedIpVersion(u8),

    /// CIDR prefix length exceeds the address bit width.
    #[error("Invalid prefix length {netbits} for {kind} address")]
    InvalidPrefixLength {
        /// The offending prefix length
        netbits: u8,
        /// Address family name
        kind: &'static str,
    },

    /// A stream record exceeded the negotiated maximum.
    #[error("Stream frame of {len} bytes exceeds maximum {max}")]
    FrameOversize {
        /// Declared frame length
        len: usize,
        /// Configured maximum
        max: usize,
    },

    /// A stream record declared a zero length.
    #[error("Zero-length stream frame")]
    ZeroLengthFrame,

    /// The stream assembler hit a fatal framing error earlier.
    #[error("Stream framing is in error state")]
    StreamPoisoned,

    /// Error from the common crate.
    #[error(transparent)]
    Common(#[from] CommonError),
}

impl CoreError {
    /// Creates a `FrameTooShort` error.
    #[must_use]
    pub const fn too_short(needed: usize, actual: usize) -> Self {
        Self::FrameTooShort { needed, actual }
    }

    /// Returns `true` if the error describes a malformed frame.
    ///
    /// Format errors are counted against the sending instance and the
    /// frame is dropped; they never terminate the connection.
    #[must_use]
    pub const fn is_format_error(&self) -> bool {
        matches!(
            self,
            Self::FrameTooShort { .. }
                | Self::UnknownEtherType(_)
                | Self::UnsupportedIpVersion(_)
        )
    }

    /// Returns `true` if the error poisons a stream connection.
    ///
    /// Framing errors on a stream transport desynchronize the record
    /// boundary; the connection must be reset.
    #[must_use]
    pub const fn is_stream_fatal(&self) -> bool {
        matches!(
            self,
            Self::FrameOversize { .. } | Self::ZeroLengthFrame | Self::StreamPoisoned
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::too_short(20, 7);
        assert!(err.to_string().contains("20"));
        assert!(err.to_string().contains("7"));
    }

    #[test]
    fn test_error_classification() {
        assert!(CoreError::UnknownEtherType(0x1234).is_format_error());
        assert!(!CoreError::UnknownEtherType(0x1234).is_stream_fatal());

        let oversize = CoreError::FrameOversize { len: 70000, max: 65535 };
        assert!(oversize.is_stream_fatal());
        assert!(!oversize.is_format_error());
    }
}
