//! Crypto error types

use thiserror::Error;

/// Errors raised by key handling and the envelope codec
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Key derivation failed")]
    KeyDerivation,

    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Invalid secret key")]
    InvalidSecretKey,

    #[error("Encryption failed")]
    EncryptionFailed,

    /// The tag did not verify: wrong key or a tampered envelope
    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Unsupported envelope version: {0}")]
    UnsupportedVersion(u8),

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Key store error: {0}")]
    KeyStore(String),
}

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;
