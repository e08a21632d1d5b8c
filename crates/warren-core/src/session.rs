// ============================================
// File: crates/warren-core/src/session.rs
// ============================================
//! # Session Identifiers
//!
//! ## Creation Reason
//! Each control-channel session is identified by a random 8-byte
//! identifier, transmitted only when keys are negotiated. The engine
//! treats it as an opaque token owned by the pipeline.
//!
//! ## Main Functionality
//! - `SessionId`: 8-byte random identifier
//! - Definedness check: an all-zero identifier means "absent"
//!
//! ## ⚠️ Important Note for Next Developer
//! - The 8-byte width is a wire constant - never change it
//! - `is_defined` means "not all zero", nothing else

use std::fmt;

use rand::RngCore;

// ============================================
// Constants
// ============================================

/// Size of a session identifier in bytes (wire constant).
pub const SESSION_ID_SIZE: usize = 8;

// ============================================
// SessionId
// ============================================

/// Random 8-byte session identifier.
///
/// # Example
/// ```
/// use warren_core::session::SessionId;
///
/// let sid = SessionId::generate();
/// assert!(sid.is_defined());
/// assert!(!SessionId::zero().is_defined());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; SESSION_ID_SIZE]);

impl SessionId {
    /// Creates the all-zero (absent) identifier.
    #[must_use]
    pub const fn zero() -> Self {
        Self([0u8; SESSION_ID_SIZE])
    }

    /// Generates a new random identifier.
    #[must_use]
    pub fn generate() -> Self {
        let mut id = [0u8; SESSION_ID_SIZE];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }

    /// Creates an identifier from raw bytes.
    ///
    /// Returns `None` if `bytes` is not exactly 8 bytes.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let id: [u8; SESSION_ID_SIZE] = bytes.try_into().ok()?;
        Some(Self(id))
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; SESSION_ID_SIZE] {
        &self.0
    }

    /// Returns `true` if the identifier is present (not all zero).
    #[must_use]
    pub fn is_defined(&self) -> bool {
        self.0 != [0u8; SESSION_ID_SIZE]
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

// ============================================
// Tests
// ============================================
