//! i2p addressing and the shareable identity descriptor
//!
//! A b32 address is the lowercase, unpadded base32 encoding of the SHA-256
//! hash of a destination's public portion, followed by `.b32.i2p`.
//!
//! The identity descriptor is the text handed around out of band (QR code,
//! copy/paste):
//!
//! ```text
//! anonymous://<b32>?i2p_dest=<base64>&ec_key=<base64>&v=1
//! ```

use data_encoding::{Encoding, Specification, BASE32_NOPAD, BASE64};
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Suffix of every b32 address
pub const B32_SUFFIX: &str = ".b32.i2p";

/// Minimum length of the base32 part (a SHA-256 hash encodes to 52 chars)
pub const B32_MIN_PREFIX_LEN: usize = 52;

/// Scheme prefix of identity descriptors
pub const DESCRIPTOR_SCHEME: &str = "anonymous://";

/// Current identity descriptor version
pub const DESCRIPTOR_VERSION: u32 = 1;

/// Public keys (256) + signing key (128) of a destination
const DESTINATION_KEYS_LEN: usize = 384;

/// Certificate type byte plus 16-bit length
const CERTIFICATE_HEADER_LEN: usize = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Invalid base64 destination: {0}")]
    InvalidDestination(String),

    #[error("Invalid b32 address: {0}")]
    InvalidB32(String),

    #[error("Unrecognized descriptor scheme")]
    UnrecognizedScheme,

    #[error("Descriptor missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid descriptor field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Destination does not hash to {0}")]
    AddressMismatch(String),
}

pub type Result<T> = std::result::Result<T, IdentityError>;

/// i2p flavoured base64: `-` and `~` instead of `+` and `/`
static I2P_BASE64: Lazy<Encoding> = Lazy::new(|| i2p_base64(true));
static I2P_BASE64_NOPAD: Lazy<Encoding> = Lazy::new(|| i2p_base64(false));

fn i2p_base64(padded: bool) -> Encoding {
    let mut spec = Specification::new();
    spec.symbols
        .push_str("ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-~");
    if padded {
        spec.padding = Some('=');
    }
    match spec.encoding() {
        Ok(encoding) => encoding,
        // The specification above is a constant and always valid
        Err(e) => unreachable!("invalid i2p base64 specification: {}", e),
    }
}

/// Decode an i2p base64 destination (padded or not)
pub fn decode_destination(destination: &str) -> Result<Vec<u8>> {
    let trimmed = destination.trim();
    if trimmed.is_empty() {
        return Err(IdentityError::InvalidDestination("empty".to_string()));
    }

    I2P_BASE64
        .decode(trimmed.as_bytes())
        .or_else(|_| I2P_BASE64_NOPAD.decode(trimmed.as_bytes()))
        .map_err(|e| IdentityError::InvalidDestination(e.to_string()))
}

/// Encode raw destination bytes with the i2p base64 alphabet
pub fn encode_destination(bytes: &[u8]) -> String {
    I2P_BASE64.encode(bytes)
}

/// Strip private key material from a destination blob.
///
/// SAM hands back `destination || private keys` for sessions; the public
/// destination ends after its certificate, whose length is stored in the
/// certificate header. Blobs too short to carry a certificate are returned
/// unchanged.
pub fn public_portion(bytes: &[u8]) -> &[u8] {
    let header_end = DESTINATION_KEYS_LEN + CERTIFICATE_HEADER_LEN;
    if bytes.len() < header_end {
        return bytes;
    }

    let cert_len = u16::from_be_bytes([
        bytes[DESTINATION_KEYS_LEN + 1],
        bytes[DESTINATION_KEYS_LEN + 2],
    ]) as usize;
    let end = header_end + cert_len;

    if end <= bytes.len() {
        &bytes[..end]
    } else {
        bytes
    }
}

/// Public destination (base64) for a public or private destination blob
pub fn public_destination(destination: &str) -> Result<String> {
    let bytes = decode_destination(destination)?;
    Ok(encode_destination(public_portion(&bytes)))
}

/// Derive the b32 address of a base64 destination
pub fn b32_address(destination: &str) -> Result<String> {
    let bytes = decode_destination(destination)?;
    let digest = Sha256::digest(public_portion(&bytes));
    let mut address = BASE32_NOPAD.encode(&digest).to_lowercase();
    address.push_str(B32_SUFFIX);
    Ok(address)
}

/// Check the b32 address format
pub fn is_valid_b32(address: &str) -> bool {
    let Some(prefix) = address.strip_suffix(B32_SUFFIX) else {
        return false;
    };

    prefix.len() >= B32_MIN_PREFIX_LEN
        && prefix
            .bytes()
            .all(|b| b.is_ascii_lowercase() || (b'2'..=b'7').contains(&b))
}

/// Parsed identity descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityDescriptor {
    pub b32_address: String,
    /// Full base64 destination
    pub destination: String,
    /// Application ECDH public key, standard base64
    pub ec_public_key: Option<String>,
    pub version: u32,
}

impl IdentityDescriptor {
    /// Decode the application public key bytes, if present
    pub fn ec_public_key_bytes(&self) -> Result<Option<Vec<u8>>> {
        self.ec_public_key
            .as_deref()
            .map(|key| {
                BASE64
                    .decode(key.as_bytes())
                    .map_err(|e| IdentityError::InvalidField {
                        field: "ec_key",
                        reason: e.to_string(),
                    })
            })
            .transpose()
    }

    /// Confirm the destination actually hashes to the advertised address
    pub fn verify_destination(&self) -> Result<()> {
        if b32_address(&self.destination)? == self.b32_address {
            Ok(())
        } else {
            Err(IdentityError::AddressMismatch(self.b32_address.clone()))
        }
    }
}

impl fmt::Display for IdentityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}?i2p_dest={}",
            DESCRIPTOR_SCHEME,
            self.b32_address,
            percent_encode(&self.destination)
        )?;
        if let Some(key) = &self.ec_public_key {
            write!(f, "&ec_key={}", percent_encode(key))?;
        }
        write!(f, "&v={}", self.version)
    }
}

impl FromStr for IdentityDescriptor {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self> {
        parse_qr_content(s)
    }
}

/// Build a descriptor string
pub fn generate_qr_content(b32: &str, destination: &str, ec_key: Option<&str>) -> String {
    IdentityDescriptor {
        b32_address: b32.to_string(),
        destination: destination.to_string(),
        ec_public_key: ec_key.map(str::to_string),
        version: DESCRIPTOR_VERSION,
    }
    .to_string()
}

/// Parse a descriptor string. Any deviation from the format is an error;
/// partial results are never returned.
pub fn parse_qr_content(content: &str) -> Result<IdentityDescriptor> {
    let rest = content
        .trim()
        .strip_prefix(DESCRIPTOR_SCHEME)
        .ok_or(IdentityError::UnrecognizedScheme)?;

    let (b32, query) = rest.split_once('?').unwrap_or((rest, ""));
    if !is_valid_b32(b32) {
        return Err(IdentityError::InvalidB32(b32.to_string()));
    }

    let mut destination = None;
    let mut ec_public_key = None;
    let mut version = DESCRIPTOR_VERSION;

    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        match key {
            "i2p_dest" => destination = Some(percent_decode(value, "i2p_dest")?),
            "ec_key" if !value.is_empty() => ec_public_key = Some(percent_decode(value, "ec_key")?),
            "v" => {
                version = value.parse().map_err(|_| IdentityError::InvalidField {
                    field: "v",
                    reason: format!("not an integer: {}", value),
                })?
            }
            _ => {}
        }
    }

    let destination = destination
        .filter(|d| !d.is_empty())
        .ok_or(IdentityError::MissingField("i2p_dest"))?;

    Ok(IdentityDescriptor {
        b32_address: b32.to_string(),
        destination,
        ec_public_key,
        version,
    })
}

/// The local device identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub b32_address: String,
    /// Public base64 destination
    pub network_destination: String,
    /// Application ECDH public key (SEC1 bytes)
    pub application_public_key: Vec<u8>,
}

impl Identity {
    /// Build an identity from a destination, deriving the b32 address
    pub fn from_destination(destination: &str, application_public_key: Vec<u8>) -> Result<Self> {
        let network_destination = public_destination(destination)?;
        let b32_address = b32_address(&network_destination)?;
        Ok(Identity {
            b32_address,
            network_destination,
            application_public_key,
        })
    }

    pub fn descriptor(&self) -> IdentityDescriptor {
        IdentityDescriptor {
            b32_address: self.b32_address.clone(),
            destination: self.network_destination.clone(),
            ec_public_key: Some(BASE64.encode(&self.application_public_key)),
            version: DESCRIPTOR_VERSION,
        }
    }

    /// Descriptor text suitable for a QR code
    pub fn qr_content(&self) -> String {
        self.descriptor().to_string()
    }
}

fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len() * 3 / 2);
    for b in value.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

fn percent_decode(value: &str, field: &'static str) -> Result<String> {
    let invalid = |reason: &str| IdentityError::InvalidField {
        field,
        reason: reason.to_string(),
    };

    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .ok_or_else(|| invalid("truncated escape"))?;
            let byte = u8::from_str_radix(hex, 16).map_err(|_| invalid("bad escape"))?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8(out).map_err(|_| invalid("not utf-8"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Destination shaped like a real one: keys, KEY certificate, 4 byte payload
    fn sample_destination(seed: u8) -> Vec<u8> {
        let mut bytes: Vec<u8> = (0..DESTINATION_KEYS_LEN)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect();
        bytes.extend_from_slice(&[5, 0, 4, 0, 7, 0, 4]);
        bytes
    }

    #[test]
    fn test_b32_shape() {
        let dest = encode_destination(&sample_destination(1));
        let b32 = b32_address(&dest).unwrap();
        assert!(b32.ends_with(B32_SUFFIX));
        assert_eq!(b32.len(), B32_MIN_PREFIX_LEN + B32_SUFFIX.len());
        assert!(is_valid_b32(&b32));
    }

    #[test]
    fn test_private_keys_do_not_change_address() {
        let public = sample_destination(9);
        let mut private = public.clone();
        private.extend_from_slice(&[0xAA; 256 + 32]);

        let from_public = b32_address(&encode_destination(&public)).unwrap();
        let from_private = b32_address(&encode_destination(&private)).unwrap();
        assert_eq!(from_public, from_private);

        assert_eq!(
            public_destination(&encode_destination(&private)).unwrap(),
            encode_destination(&public)
        );
    }

    #[test]
    fn test_base64_alphabet() {
        let encoded = encode_destination(&[0xfb, 0xff, 0xbf]);
        assert_eq!(encoded, "-~-~");
        assert_eq!(decode_destination("-~-~").unwrap(), vec![0xfb, 0xff, 0xbf]);
        assert!(decode_destination("+/+/").is_err());
        assert!(decode_destination("").is_err());
    }

    #[test]
    fn test_b32_validation() {
        let good = format!("{}{}", "a".repeat(52), B32_SUFFIX);
        assert!(is_valid_b32(&good));
        assert!(!is_valid_b32(&format!("{}{}", "a".repeat(51), B32_SUFFIX)));
        assert!(!is_valid_b32(&format!("{}{}", "A".repeat(52), B32_SUFFIX)));
        assert!(!is_valid_b32(&format!("{}1{}", "a".repeat(52), B32_SUFFIX)));
        assert!(!is_valid_b32(&format!("{}.i2p", "a".repeat(52))));
        assert!(!is_valid_b32("example.i2p"));
    }

    #[test]
    fn test_descriptor_roundtrip() {
        let dest = encode_destination(&sample_destination(3));
        let b32 = b32_address(&dest).unwrap();
        let content = generate_qr_content(&b32, &dest, Some("BP+abc/def=="));

        assert!(content.starts_with("anonymous://"));
        assert!(content.contains("ec_key=BP%2Babc%2Fdef%3D%3D"));

        let parsed = parse_qr_content(&content).unwrap();
        assert_eq!(parsed.b32_address, b32);
        assert_eq!(parsed.destination, dest);
        assert_eq!(parsed.ec_public_key.as_deref(), Some("BP+abc/def=="));
        assert_eq!(parsed.version, DESCRIPTOR_VERSION);
        assert!(parsed.verify_destination().is_ok());
    }

    #[test]
    fn test_descriptor_without_key() {
        let dest = encode_destination(&sample_destination(4));
        let b32 = b32_address(&dest).unwrap();
        let parsed: IdentityDescriptor = generate_qr_content(&b32, &dest, None).parse().unwrap();
        assert_eq!(parsed.ec_public_key, None);
    }

    #[test]
    fn test_descriptor_rejections() {
        let dest = encode_destination(&sample_destination(5));
        let b32 = b32_address(&dest).unwrap();
        let content = generate_qr_content(&b32, &dest, None);

        let no_scheme = content.replace("anonymous://", "");
        assert_eq!(
            parse_qr_content(&no_scheme),
            Err(IdentityError::UnrecognizedScheme)
        );

        let bad_b32 = content.replace(&b32, "notanaddress.b32.i2p");
        assert!(matches!(
            parse_qr_content(&bad_b32),
            Err(IdentityError::InvalidB32(_))
        ));

        let no_dest = format!("anonymous://{}?v=1", b32);
        assert_eq!(
            parse_qr_content(&no_dest),
            Err(IdentityError::MissingField("i2p_dest"))
        );

        let bad_version = content.replace("v=1", "v=one");
        assert!(matches!(
            parse_qr_content(&bad_version),
            Err(IdentityError::InvalidField { field: "v", .. })
        ));
    }

    #[test]
    fn test_mismatched_destination_detected() {
        let dest = encode_destination(&sample_destination(6));
        let other = b32_address(&encode_destination(&sample_destination(7))).unwrap();
        let parsed = parse_qr_content(&generate_qr_content(&other, &dest, None)).unwrap();
        assert!(matches!(
            parsed.verify_destination(),
            Err(IdentityError::AddressMismatch(_))
        ));
    }

    #[test]
    fn test_identity_descriptor_key() {
        let dest = encode_destination(&sample_destination(8));
        let identity = Identity::from_destination(&dest, vec![4, 1, 2, 3]).unwrap();
        let parsed = parse_qr_content(&identity.qr_content()).unwrap();
        assert_eq!(parsed.ec_public_key_bytes().unwrap(), Some(vec![4, 1, 2, 3]));
        assert_eq!(parsed.b32_address, identity.b32_address);
    }

    proptest! {
        #[test]
        fn prop_b32_deterministic_and_valid(bytes in proptest::collection::vec(any::<u8>(), 1..600)) {
            let dest = encode_destination(&bytes);
            let first = b32_address(&dest).unwrap();
            let second = b32_address(&dest).unwrap();
            prop_assert_eq!(&first, &second);
            prop_assert!(is_valid_b32(&first));
        }

        #[test]
        fn prop_descriptor_recovers_triple(
            bytes in proptest::collection::vec(any::<u8>(), 1..512),
            key in proptest::option::of(proptest::collection::vec(any::<u8>(), 1..80)),
        ) {
            let dest = encode_destination(&bytes);
            let b32 = b32_address(&dest).unwrap();
            let key = key.map(|k| BASE64.encode(&k));

            let content = generate_qr_content(&b32, &dest, key.as_deref());
            let parsed = parse_qr_content(&content).unwrap();
            prop_assert_eq!(parsed.b32_address, b32);
            prop_assert_eq!(parsed.destination, dest);
            prop_assert_eq!(parsed.ec_public_key, key);
        }
    }
}
