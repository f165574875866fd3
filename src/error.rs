//! Error types for the VPN.
//!
//! Crypto, framing, and transport faults are separate enums because the
//! bridge reacts differently to each: crypto and framing errors on a data
//! frame drop that frame and increment a counter, while transport errors end
//! the session.

use thiserror::Error;

/// Cryptographic channel errors.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum CryptoError {
    /// Pre-shared key shorter than the 16-byte minimum.
    #[error("pre-shared key too short: {0} bytes (minimum 16)")]
    BadPsk(usize),

    /// Wrap/unwrap attempted before the handshake completed.
    #[error("session not authenticated")]
    NotAuthenticated,

    /// No session keys derived yet (handshake never started).
    #[error("no session keys")]
    NoSession,

    /// HMAC verification failed.
    #[error("HMAC mismatch")]
    HmacMismatch,

    /// PKCS#7 padding invalid after decryption.
    #[error("invalid padding")]
    BadPadding,

    /// Frame too short or payload length inconsistent for this operation.
    #[error("malformed frame: {0}")]
    ShortFrame(&'static str),

    /// Frame type not valid for this handshake step.
    #[error("unexpected packet type 0x{0:02x}")]
    WrongType(u8),
}

/// Wire framing errors. `OversizedPayload` is fatal to the connection.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum FrameError {
    /// Declared payload length exceeds the frame size limit.
    #[error("oversized frame payload: {len} bytes (max {max})")]
    OversizedPayload { len: u32, max: u32 },

    /// Buffer shorter than the fixed header.
    #[error("short frame header: {0} bytes")]
    ShortHeader(usize),
}

/// Top-level VPN errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum VpnError {
    /// Configuration error (invalid CLI values, missing fields).
    #[error("configuration error: {0}")]
    Config(String),

    /// TUN device creation or I/O failed.
    #[error("TUN device error: {0}")]
    TunDevice(String),

    /// Network I/O error.
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Cryptographic channel error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Wire framing error.
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),
}

impl VpnError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a TUN device error.
    pub fn tun_device(message: impl Into<String>) -> Self {
        Self::TunDevice(message.into())
    }

    /// Returns true if this error is potentially recoverable by
    /// reconnecting: transport-level faults are, everything that needs user
    /// action (bad config, TUN permissions) is not.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, VpnError::Network(_) | VpnError::Frame(_))
    }
}

/// Result type alias for VPN operations.
pub type VpnResult<T> = Result<T, VpnError>;
