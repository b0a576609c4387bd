//! Veilmsg cryptography
//!
//! End-to-end protection for messages carried over i2p:
//! - P-256 ECDH key pairs, used only for key agreement
//! - HKDF-SHA256 key derivation with a per-message salt
//! - AES-256-GCM envelopes with an explicit version byte
//! - Per-contact session key storage
//!
//! ## Usage
//!
//! ```rust
//! use veilmsg_crypto::{decrypt_with, encrypt_for, KeyPair};
//!
//! let bob = KeyPair::generate().unwrap();
//! let envelope = encrypt_for(bob.public_key(), b"hi bob").unwrap();
//! assert_eq!(decrypt_with(&bob, &envelope).unwrap(), b"hi bob");
//! ```

pub mod envelope;
pub mod error;
pub mod keys;
pub mod keystore;

pub use envelope::{
    decrypt, decrypt_with, encrypt, encrypt_for, encrypt_with_keypair, EncryptedEnvelope,
    ENVELOPE_VERSION, LEGACY_ENVELOPE_VERSION,
};
pub use error::{CryptoError, Result};
pub use keys::{decode_public_key, encode_public_key, KeyPair, SymmetricKey};
pub use keystore::{session_keypair, MemoryKeyStore, SessionKeyStore, StoredSessionKey};
pub use p256::PublicKey;

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_roundtrip(plaintext in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let key = SymmetricKey::generate().unwrap();
            let envelope = encrypt(&key, &plaintext).unwrap();
            prop_assert_eq!(decrypt(&envelope, &key).unwrap(), plaintext);
        }

        #[test]
        fn prop_bit_flip_in_key_fails(
            plaintext in proptest::collection::vec(any::<u8>(), 1..256),
            bit in 0usize..256,
        ) {
            let key = SymmetricKey::generate().unwrap();
            let envelope = encrypt(&key, &plaintext).unwrap();

            let mut bytes = *key.as_bytes();
            bytes[bit / 8] ^= 1 << (bit % 8);
            let flipped = SymmetricKey::from_bytes(bytes);

            prop_assert!(matches!(
                decrypt(&envelope, &flipped),
                Err(CryptoError::AuthenticationFailed)
            ));
        }

        #[test]
        fn prop_ciphertext_flip_fails(
            plaintext in proptest::collection::vec(any::<u8>(), 1..256),
            index in any::<prop::sample::Index>(),
        ) {
            let recipient = KeyPair::generate().unwrap();
            let mut envelope = encrypt_for(recipient.public_key(), &plaintext).unwrap();
            let i = index.index(envelope.ciphertext.len());
            envelope.ciphertext[i] ^= 0x80;

            prop_assert!(matches!(
                decrypt_with(&recipient, &envelope),
                Err(CryptoError::AuthenticationFailed)
            ));
        }
    }
}
