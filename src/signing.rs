use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Header carrying the hex HMAC-SHA256 of `timestamp || body`.
pub const SIGNATURE_HEADER: &str = "X-Relay-Signature";

/// Header carrying the unix-seconds timestamp that participated in the MAC.
pub const TIMESTAMP_HEADER: &str = "X-Relay-Timestamp";

/// Build the signature headers for one outbound request body.
///
/// Receivers recompute the MAC over the timestamp header concatenated with
/// the raw body and compare.
pub fn signature_headers(secret: &[u8], body: &[u8]) -> [(&'static str, String); 2] {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        .to_string();

    let signature = compute_signature(secret, body, &timestamp);

    [
        (SIGNATURE_HEADER, signature),
        (TIMESTAMP_HEADER, timestamp),
    ]
}

/// Compute the hex HMAC-SHA256 over `timestamp || body`.
pub fn compute_signature(secret: &[u8], body: &[u8], timestamp: &str) -> String {
    let data = [timestamp.as_bytes(), body].concat();

    let mut mac = Hmac::<Sha256>::new_from_slice(secret)
        .unwrap_or_else(|_| Hmac::<Sha256>::new_from_slice(b"default").expect("hmac"));
    mac.update(&data);
    hex::encode(mac.finalize().into_bytes())
}
