//! Deterministic idempotency-key derivation.
//!
//! Providers disagree on what an idempotency token may look like (a UUID, a
//! bounded header value, a hex digest). The caller supplies one opaque key;
//! [`derive`] converts it into whatever the target provider accepts. The
//! function is pure (identical `(key, format)` inputs always yield an
//! identical token) because it is recomputed on every retry of the same
//! logical send without any coordination.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Shape required by the target provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyFormat {
    /// A well-formed RFC 4122 UUID.
    Uuid,
    /// A hex digest truncated to at most `max_len` characters.
    HexDigest { max_len: usize },
    /// Any token of at most `max_len` URL/header-safe characters.
    Opaque { max_len: usize },
}

/// Converts an opaque caller key into a provider-acceptable token.
///
/// Pass-through is used whenever the input already satisfies the target
/// shape; otherwise the key is hashed and reformatted.
///
/// ```
/// use courier_idempotency::{derive, KeyFormat};
///
/// let a = derive("order-42", &KeyFormat::Uuid);
/// let b = derive("order-42", &KeyFormat::Uuid);
/// assert_eq!(a, b);
/// assert!(uuid::Uuid::parse_str(&a).is_ok());
/// ```
pub fn derive(key: &str, format: &KeyFormat) -> String {
    match format {
        KeyFormat::Uuid => match Uuid::parse_str(key) {
            Ok(parsed) => parsed.to_string(),
            Err(_) => hash_to_uuid(key).to_string(),
        },
        KeyFormat::HexDigest { max_len } => truncated_digest(key, *max_len),
        KeyFormat::Opaque { max_len } => {
            if key.len() <= *max_len && !key.is_empty() && key.bytes().all(is_token_safe) {
                key.to_string()
            } else {
                truncated_digest(key, *max_len)
            }
        }
    }
}

/// Hex-encoded SHA-256 of arbitrary bytes. Used both for key derivation and
/// for the deterministic message id synthesized when a provider reports an
/// idempotent request already in flight.
pub fn payload_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn truncated_digest(key: &str, max_len: usize) -> String {
    let mut digest = payload_hash(key.as_bytes());
    digest.truncate(max_len);
    digest
}

/// Interprets the first 16 hash bytes as UUID octets, with the RFC 4122
/// version/variant bits set so the result parses as a valid v4 UUID.
fn hash_to_uuid(key: &str) -> Uuid {
    let digest = Sha256::digest(key.as_bytes());
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&digest[..16]);
    uuid::Builder::from_random_bytes(octets).into_uuid()
}

fn is_token_safe(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b':')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_pure() {
        for format in [
            KeyFormat::Uuid,
            KeyFormat::HexDigest { max_len: 32 },
            KeyFormat::Opaque { max_len: 64 },
        ] {
            let first = derive("job:123/retry", &format);
            let second = derive("job:123/retry", &format);
            assert_eq!(first, second);
        }
    }

    #[test]
    fn uuid_passthrough_and_hashing() {
        let well_formed = "6ba7b810-9dad-11d1-80b4-00c04fd430c8";
        assert_eq!(derive(well_formed, &KeyFormat::Uuid), well_formed);

        let derived = derive("not-a-uuid", &KeyFormat::Uuid);
        let parsed = Uuid::parse_str(&derived).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
    }

    #[test]
    fn hex_digest_respects_length_and_charset() {
        let token = derive("anything at all", &KeyFormat::HexDigest { max_len: 16 });
        assert_eq!(token.len(), 16);
        assert!(token.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn opaque_passthrough_only_when_safe() {
        let format = KeyFormat::Opaque { max_len: 32 };
        assert_eq!(derive("safe-token_1", &format), "safe-token_1");

        // Unsafe characters force hashing.
        let hashed = derive("has spaces and ümlauts", &format);
        assert_ne!(hashed, "has spaces and ümlauts");
        assert_eq!(hashed.len(), 32);

        // Over-long keys are compacted, deterministically.
        let long = "x".repeat(100);
        let a = derive(&long, &format);
        assert_eq!(a.len(), 32);
        assert_eq!(a, derive(&long, &format));
    }

    #[test]
    fn distinct_keys_yield_distinct_tokens() {
        assert_ne!(
            derive("a", &KeyFormat::Uuid),
            derive("b", &KeyFormat::Uuid)
        );
    }
}
