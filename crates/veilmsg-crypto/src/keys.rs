//! P-256 key pairs and symmetric key derivation
//!
//! Key pairs are only ever used for Diffie-Hellman agreement. The raw ECDH
//! output is never used directly as a cipher key: [`derive_envelope_key`]
//! runs it through HKDF-SHA256 with a per-message salt and a fixed context.

use crate::error::{CryptoError, Result};
use hkdf::Hkdf;
use p256::ecdh::{diffie_hellman, SharedSecret};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// AES-256 key size
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// HKDF salt size
pub const SALT_SIZE: usize = 32;

/// HKDF info string for envelope keys
pub const KDF_CONTEXT: &[u8] = b"veilmsg/envelope/v2";

/// Uncompressed SEC1 point size for P-256
pub const PUBLIC_KEY_SIZE: usize = 65;

const KEYGEN_ATTEMPTS: usize = 8;

/// 256-bit symmetric key, wiped on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; SYMMETRIC_KEY_SIZE]);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; SYMMETRIC_KEY_SIZE]) -> Self {
        SymmetricKey(bytes)
    }

    /// Random key, mostly useful for tests and benchmarks
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; SYMMETRIC_KEY_SIZE];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        Ok(SymmetricKey(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; SYMMETRIC_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Ephemeral or contact-scoped ECDH key pair
#[derive(Clone)]
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public_key_bytes()))
            .finish()
    }
}

impl KeyPair {
    /// Generate a fresh key pair from the OS RNG
    pub fn generate() -> Result<Self> {
        let mut seed = Zeroizing::new([0u8; SYMMETRIC_KEY_SIZE]);

        // A random 32-byte string is outside the scalar range with
        // negligible probability; retry a few times before giving up.
        for _ in 0..KEYGEN_ATTEMPTS {
            OsRng
                .try_fill_bytes(&mut seed[..])
                .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;

            if let Ok(secret) = SecretKey::from_slice(&seed[..]) {
                let public = secret.public_key();
                return Ok(KeyPair { secret, public });
            }
        }

        Err(CryptoError::KeyGeneration(
            "no valid scalar produced".to_string(),
        ))
    }

    /// Restore a key pair from its 32-byte secret scalar
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let secret = SecretKey::from_slice(bytes).map_err(|_| CryptoError::InvalidSecretKey)?;
        let public = secret.public_key();
        Ok(KeyPair { secret, public })
    }

    /// Export the secret scalar
    pub fn secret_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.secret.to_bytes().to_vec())
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Uncompressed SEC1 encoding of the public key
    pub fn public_key_bytes(&self) -> Vec<u8> {
        encode_public_key(&self.public)
    }

    /// Raw ECDH agreement with a peer's public key
    pub fn agree(&self, peer: &PublicKey) -> SharedSecret {
        diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine())
    }
}

/// Encode a public key as an uncompressed SEC1 point
pub fn encode_public_key(key: &PublicKey) -> Vec<u8> {
    key.to_encoded_point(false).as_bytes().to_vec()
}

/// Decode a SEC1 public key (compressed or uncompressed)
pub fn decode_public_key(bytes: &[u8]) -> Result<PublicKey> {
    PublicKey::from_sec1_bytes(bytes).map_err(|_| CryptoError::InvalidPublicKey)
}

/// Derive an envelope key from an ECDH secret with HKDF-SHA256
pub fn derive_envelope_key(shared: &SharedSecret, salt: &[u8]) -> Result<SymmetricKey> {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared.raw_secret_bytes().as_slice());
    let mut okm = [0u8; SYMMETRIC_KEY_SIZE];
    hk.expand(KDF_CONTEXT, &mut okm)
        .map_err(|_| CryptoError::KeyDerivation)?;
    let key = SymmetricKey::from_bytes(okm);
    okm.zeroize();
    Ok(key)
}

/// Version 1 derivation: the raw shared secret truncated to 32 bytes.
///
/// Only used to open envelopes written by older peers.
pub fn derive_legacy_key(shared: &SharedSecret) -> Result<SymmetricKey> {
    let raw = shared.raw_secret_bytes();
    if raw.len() < SYMMETRIC_KEY_SIZE {
        return Err(CryptoError::KeyDerivation);
    }
    let mut bytes = [0u8; SYMMETRIC_KEY_SIZE];
    bytes.copy_from_slice(&raw[..SYMMETRIC_KEY_SIZE]);
    let key = SymmetricKey::from_bytes(bytes);
    bytes.zeroize();
    Ok(key)
}

/// Random HKDF salt
pub fn random_salt() -> Result<[u8; SALT_SIZE]> {
    let mut salt = [0u8; SALT_SIZE];
    OsRng
        .try_fill_bytes(&mut salt)
        .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
    Ok(salt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agreement_is_symmetric() {
        let alice = KeyPair::generate().unwrap();
        let bob = KeyPair::generate().unwrap();

        let ab = alice.agree(bob.public_key());
        let ba = bob.agree(alice.public_key());
        assert_eq!(
            ab.raw_secret_bytes().as_slice(),
            ba.raw_secret_bytes().as_slice()
        );
    }

    #[test]
    fn test_envelope_key_depends_on_salt() {
        let alice = KeyPair::generate().unwrap();
        let bob = KeyPair::generate().unwrap();
        let shared = alice.agree(bob.public_key());

        let k1 = derive_envelope_key(&shared, &[1u8; SALT_SIZE]).unwrap();
        let k2 = derive_envelope_key(&shared, &[2u8; SALT_SIZE]).unwrap();
        assert_ne!(k1.as_bytes(), k2.as_bytes());

        // HKDF output must not equal the raw secret
        let legacy = derive_legacy_key(&shared).unwrap();
        assert_ne!(k1.as_bytes(), legacy.as_bytes());
    }

    #[test]
    fn test_secret_roundtrip() {
        let pair = KeyPair::generate().unwrap();
        let restored = KeyPair::from_secret_bytes(&pair.secret_bytes()).unwrap();
        assert_eq!(pair.public_key_bytes(), restored.public_key_bytes());
    }

    #[test]
    fn test_public_key_encoding() {
        let pair = KeyPair::generate().unwrap();
        let bytes = pair.public_key_bytes();
        assert_eq!(bytes.len(), PUBLIC_KEY_SIZE);
        assert_eq!(bytes[0], 0x04);

        let decoded = decode_public_key(&bytes).unwrap();
        assert_eq!(&decoded, pair.public_key());
    }

    #[test]
    fn test_rejects_garbage_public_key() {
        assert!(matches!(
            decode_public_key(&[0x04, 1, 2, 3]),
            Err(CryptoError::InvalidPublicKey)
        ));
        assert!(matches!(
            KeyPair::from_secret_bytes(&[0u8; 32]),
            Err(CryptoError::InvalidSecretKey)
        ));
    }
}
