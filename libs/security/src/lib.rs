//! Webhook signature verification.
//!
//! Three schemes cover the provider surface: a timestamped multi-signature
//! HMAC (id + timestamp + body), a URL-plus-sorted-fields HMAC, and a plain
//! shared-secret header. Every failure path returns `false` rather than an
//! error; the event source retries on any non-2xx response regardless, and
//! a thrown error would only obscure that.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use hmac::{Hmac, Mac};
use http::HeaderMap;
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;
type HmacSha1 = Hmac<Sha1>;

/// Known literal prefix some providers prepend to the shared secret before
/// base64-encoding the key material.
const SECRET_PREFIX: &str = "whsec_";

const DEFAULT_TOLERANCE: Duration = Duration::from_secs(300);

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Timestamped multi-signature HMAC-SHA256 scheme.
///
/// Headers carry a message id, a unix timestamp and one or more
/// space-separated signatures, each tagged with a scheme label
/// (`v1,<base64>`). The signed content is `id.timestamp.body`; the key is
/// the base64-decoded configured secret, with the `whsec_` prefix stripped
/// when present. Events older (or newer) than the tolerance window are
/// rejected outright to blunt replay.
#[derive(Clone)]
pub struct TimestampedSignature {
    secret: String,
    tolerance: Duration,
}

impl TimestampedSignature {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            tolerance: DEFAULT_TOLERANCE,
        }
    }

    pub fn verify(&self, body: &[u8], headers: &HeaderMap) -> bool {
        self.verify_at(body, headers, OffsetDateTime::now_utc())
    }

    /// Verification with an injected clock, so the tolerance window is
    /// testable without sleeping.
    pub fn verify_at(&self, body: &[u8], headers: &HeaderMap, now: OffsetDateTime) -> bool {
        let Some(id) = header_str(headers, "webhook-id").or_else(|| header_str(headers, "svix-id"))
        else {
            warn!("webhook rejected: missing id header");
            return false;
        };
        let Some(timestamp) = header_str(headers, "webhook-timestamp")
            .or_else(|| header_str(headers, "svix-timestamp"))
        else {
            warn!("webhook rejected: missing timestamp header");
            return false;
        };
        let Some(signatures) = header_str(headers, "webhook-signature")
            .or_else(|| header_str(headers, "svix-signature"))
        else {
            warn!("webhook rejected: missing signature header");
            return false;
        };

        let Ok(ts) = timestamp.parse::<i64>() else {
            warn!(timestamp, "webhook rejected: unparseable timestamp");
            return false;
        };
        let skew = (now.unix_timestamp() - ts).unsigned_abs();
        if skew > self.tolerance.as_secs() {
            warn!(skew, "webhook rejected: timestamp outside tolerance");
            return false;
        }

        let raw_secret = self.secret.strip_prefix(SECRET_PREFIX).unwrap_or(&self.secret);
        let Ok(key) = B64.decode(raw_secret) else {
            warn!("webhook rejected: secret is not valid base64");
            return false;
        };

        let Ok(mut mac) = HmacSha256::new_from_slice(&key) else {
            return false;
        };
        mac.update(id.as_bytes());
        mac.update(b".");
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(body);
        let expected = mac.finalize().into_bytes();

        // Accept if any v1-tagged signature matches.
        for entry in signatures.split_ascii_whitespace() {
            let Some((label, value)) = entry.split_once(',') else {
                continue;
            };
            if label != "v1" {
                continue;
            }
            if let Ok(provided) = B64.decode(value) {
                if ct_eq(&provided, expected.as_slice()) {
                    return true;
                }
            }
        }
        warn!("webhook rejected: no signature matched");
        false
    }
}

/// URL + sorted-field HMAC-SHA1 scheme.
///
/// The signed content is the configured callback URL followed by every body
/// field's key (sorted ascending) immediately followed by its string value,
/// with no separators. The base64-encoded digest is compared against a
/// single header-provided signature.
#[derive(Clone)]
pub struct SortedFieldSignature {
    secret: String,
    url: String,
}

impl SortedFieldSignature {
    pub fn new(secret: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            url: url.into(),
        }
    }

    /// Computes the expected signature for a set of decoded body fields.
    pub fn compute(&self, fields: &BTreeMap<String, String>) -> Option<String> {
        let mut signed = self.url.clone();
        for (key, value) in fields {
            signed.push_str(key);
            signed.push_str(value);
        }
        let mut mac = HmacSha1::new_from_slice(self.secret.as_bytes()).ok()?;
        mac.update(signed.as_bytes());
        Some(B64.encode(mac.finalize().into_bytes()))
    }

    pub fn verify(&self, fields: &BTreeMap<String, String>, provided: &str) -> bool {
        match self.compute(fields) {
            Some(expected) if ct_eq(expected.as_bytes(), provided.as_bytes()) => true,
            Some(_) => {
                warn!("webhook rejected: sorted-field signature mismatch");
                false
            }
            None => false,
        }
    }
}

/// Static shared-secret header: the configured header must be present and
/// equal the expected value exactly.
#[derive(Clone)]
pub struct StaticSecret {
    header: String,
    expected: String,
}

impl StaticSecret {
    pub fn new(header: impl Into<String>, expected: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            expected: expected.into(),
        }
    }

    pub fn verify(&self, headers: &HeaderMap) -> bool {
        match header_str(headers, &self.header) {
            Some(value) if ct_eq(value.as_bytes(), self.expected.as_bytes()) => true,
            Some(_) => {
                warn!(header = %self.header, "webhook rejected: secret header mismatch");
                false
            }
            None => {
                warn!(header = %self.header, "webhook rejected: secret header missing");
                false
            }
        }
    }
}
