//! Versioned AES-256-GCM message envelope
//!
//! An envelope carries everything a recipient needs to open a message
//! except its own secret key:
//!
//! ```text
//! version | iv (12) | ciphertext | tag (16) | ephemeral public key | salt
//! ```
//!
//! Version 2 derives the cipher key with HKDF over the ECDH secret and
//! binds the header fields as associated data. Version 1 envelopes (raw
//! shared secret, no associated data) can still be opened but are never
//! produced.

use crate::error::{CryptoError, Result};
use crate::keys::{
    decode_public_key, derive_envelope_key, derive_legacy_key, random_salt, KeyPair,
    SymmetricKey, SALT_SIZE,
};
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use p256::PublicKey;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Envelope version produced by this crate
pub const ENVELOPE_VERSION: u8 = 2;

/// Legacy version, decrypt only
pub const LEGACY_ENVELOPE_VERSION: u8 = 1;

/// AES-GCM IV size (96 bits)
pub const IV_SIZE: usize = 12;

/// AES-GCM tag size (128 bits)
pub const TAG_SIZE: usize = 16;

/// Upper bound for a serialized envelope
pub const MAX_ENVELOPE_SIZE: usize = 1024 * 1024;

/// Encrypted message as exchanged between peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub version: u8,
    pub iv: [u8; IV_SIZE],
    pub ciphertext: Vec<u8>,
    pub auth_tag: [u8; TAG_SIZE],
    /// Sender's ephemeral key (empty for envelopes sealed with a bare key)
    pub ephemeral_public_key: Vec<u8>,
    /// HKDF salt (empty for version 1)
    pub salt: Vec<u8>,
}

impl EncryptedEnvelope {
    /// Serialize for the wire
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| CryptoError::MalformedEnvelope(e.to_string()))
    }

    /// Parse and validate a serialized envelope
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_ENVELOPE_SIZE {
            return Err(CryptoError::MalformedEnvelope(format!(
                "envelope too large: {} bytes",
                bytes.len()
            )));
        }

        let envelope: EncryptedEnvelope = bincode::deserialize(bytes)
            .map_err(|e| CryptoError::MalformedEnvelope(e.to_string()))?;
        envelope.check_version()?;
        Ok(envelope)
    }

    fn check_version(&self) -> Result<()> {
        match self.version {
            ENVELOPE_VERSION | LEGACY_ENVELOPE_VERSION => Ok(()),
            other => Err(CryptoError::UnsupportedVersion(other)),
        }
    }

    fn associated_data(&self) -> Vec<u8> {
        associated_data(self.version, &self.ephemeral_public_key, &self.salt)
    }
}

fn associated_data(version: u8, ephemeral_public_key: &[u8], salt: &[u8]) -> Vec<u8> {
    if version == LEGACY_ENVELOPE_VERSION {
        return Vec::new();
    }

    let mut aad = Vec::with_capacity(1 + ephemeral_public_key.len() + salt.len());
    aad.push(version);
    aad.extend_from_slice(ephemeral_public_key);
    aad.extend_from_slice(salt);
    aad
}

fn seal_parts(
    key: &SymmetricKey,
    version: u8,
    plaintext: &[u8],
    ephemeral_public_key: Vec<u8>,
    salt: Vec<u8>,
) -> Result<EncryptedEnvelope> {
    let cipher =
        Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::EncryptionFailed)?;

    let mut iv = [0u8; IV_SIZE];
    OsRng
        .try_fill_bytes(&mut iv)
        .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;

    let aad = associated_data(version, &ephemeral_public_key, &salt);
    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&iv), &aad, &mut buffer)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut auth_tag = [0u8; TAG_SIZE];
    auth_tag.copy_from_slice(tag.as_slice());

    Ok(EncryptedEnvelope {
        version,
        iv,
        ciphertext: buffer,
        auth_tag,
        ephemeral_public_key,
        salt,
    })
}

/// Encrypt with an already agreed symmetric key
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<EncryptedEnvelope> {
    seal_parts(key, ENVELOPE_VERSION, plaintext, Vec::new(), Vec::new())
}

/// Decrypt with an already agreed symmetric key.
///
/// Fails with [`CryptoError::AuthenticationFailed`] on any tag mismatch;
/// no plaintext is returned in that case.
pub fn decrypt(envelope: &EncryptedEnvelope, key: &SymmetricKey) -> Result<Vec<u8>> {
    envelope.check_version()?;

    let cipher =
        Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::AuthenticationFailed)?;

    let aad = envelope.associated_data();
    let mut buffer = envelope.ciphertext.clone();
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&envelope.iv),
            &aad,
            &mut buffer,
            Tag::from_slice(&envelope.auth_tag),
        )
        .map_err(|_| CryptoError::AuthenticationFailed)?;

    Ok(buffer)
}

/// Encrypt for a recipient using a fresh ephemeral key pair
pub fn encrypt_for(recipient: &PublicKey, plaintext: &[u8]) -> Result<EncryptedEnvelope> {
    let ephemeral = KeyPair::generate()?;
    encrypt_with_keypair(&ephemeral, recipient, plaintext)
}

/// Encrypt for a recipient with a caller-supplied sender key pair.
///
/// Used when a contact-scoped session key is reused across messages; the
/// salt is still fresh per call so every message gets its own cipher key.
pub fn encrypt_with_keypair(
    sender: &KeyPair,
    recipient: &PublicKey,
    plaintext: &[u8],
) -> Result<EncryptedEnvelope> {
    let salt = random_salt()?;
    let shared = sender.agree(recipient);
    let key = derive_envelope_key(&shared, &salt)?;

    seal_parts(
        &key,
        ENVELOPE_VERSION,
        plaintext,
        sender.public_key_bytes(),
        salt.to_vec(),
    )
}

/// Open an envelope addressed to `recipient`
pub fn decrypt_with(recipient: &KeyPair, envelope: &EncryptedEnvelope) -> Result<Vec<u8>> {
    envelope.check_version()?;

    let sender = decode_public_key(&envelope.ephemeral_public_key)?;
    let shared = recipient.agree(&sender);

    let key = match envelope.version {
        LEGACY_ENVELOPE_VERSION => derive_legacy_key(&shared)?,
        _ => {
            if envelope.salt.len() != SALT_SIZE {
                return Err(CryptoError::MalformedEnvelope(format!(
                    "salt must be {} bytes, got {}",
                    SALT_SIZE,
                    envelope.salt.len()
                )));
            }
            derive_envelope_key(&shared, &envelope.salt)?
        }
    };

    decrypt(envelope, &key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symmetric_roundtrip() {
        let key = SymmetricKey::generate().unwrap();
        let envelope = encrypt(&key, b"hello over i2p").unwrap();

        assert_eq!(envelope.version, ENVELOPE_VERSION);
        assert_eq!(decrypt(&envelope, &key).unwrap(), b"hello over i2p");
    }

    #[test]
    fn test_iv_differs_per_call() {
        let key = SymmetricKey::generate().unwrap();
        let a = encrypt(&key, b"same").unwrap();
        let b = encrypt(&key, b"same").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_single_bit_key_change_fails() {
        let key = SymmetricKey::generate().unwrap();
        let envelope = encrypt(&key, b"secret").unwrap();

        let mut bytes = *key.as_bytes();
        bytes[7] ^= 0x01;
        let wrong = SymmetricKey::from_bytes(bytes);

        assert!(matches!(
            decrypt(&envelope, &wrong),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = SymmetricKey::generate().unwrap();
        let mut envelope = encrypt(&key, b"do not touch").unwrap();
        envelope.ciphertext[0] ^= 0xff;

        assert!(matches!(
            decrypt(&envelope, &key),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_tampered_header_fails() {
        let recipient = KeyPair::generate().unwrap();
        let mut envelope = encrypt_for(recipient.public_key(), b"bound header").unwrap();
        envelope.salt[0] ^= 0x01;

        assert!(matches!(
            decrypt_with(&recipient, &envelope),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_ecdh_roundtrip() {
        let recipient = KeyPair::generate().unwrap();
        let envelope = encrypt_for(recipient.public_key(), b"per-message key").unwrap();

        assert_eq!(envelope.salt.len(), SALT_SIZE);
        assert_eq!(
            decrypt_with(&recipient, &envelope).unwrap(),
            b"per-message key"
        );

        let stranger = KeyPair::generate().unwrap();
        assert!(matches!(
            decrypt_with(&stranger, &envelope),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_legacy_envelope_opens() {
        let recipient = KeyPair::generate().unwrap();
        let sender = KeyPair::generate().unwrap();
        let shared = sender.agree(recipient.public_key());
        let key = derive_legacy_key(&shared).unwrap();

        let envelope = seal_parts(
            &key,
            LEGACY_ENVELOPE_VERSION,
            b"old peer",
            sender.public_key_bytes(),
            Vec::new(),
        )
        .unwrap();

        assert_eq!(decrypt_with(&recipient, &envelope).unwrap(), b"old peer");
    }

    #[test]
    fn test_unknown_version_rejected() {
        let key = SymmetricKey::generate().unwrap();
        let mut envelope = encrypt(&key, b"v3?").unwrap();
        envelope.version = 3;

        assert!(matches!(
            decrypt(&envelope, &key),
            Err(CryptoError::UnsupportedVersion(3))
        ));

        let bytes = bincode::serialize(&envelope).unwrap();
        assert!(matches!(
            EncryptedEnvelope::from_bytes(&bytes),
            Err(CryptoError::UnsupportedVersion(3))
        ));
    }

    #[test]
    fn test_wire_encoding() {
        let recipient = KeyPair::generate().unwrap();
        let envelope = encrypt_for(recipient.public_key(), b"on the wire").unwrap();

        let bytes = envelope.to_bytes().unwrap();
        let parsed = EncryptedEnvelope::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, envelope);

        assert!(EncryptedEnvelope::from_bytes(&bytes[..bytes.len() / 2]).is_err());
    }
}
