use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted clock skew between caller and server.
pub const TIMESTAMP_TOLERANCE: Duration = Duration::from_secs(300);

/// Sign a request. The canonical form is
/// `"{timestamp}\n{METHOD}\n{path}\n{sha256hex(body)}"`, MACed with the
/// shared secret and returned as lowercase hex.
pub fn sign(method: &str, path: &str, body: &[u8], timestamp: i64, secret: &str) -> String {
    let canonical = canonical_request(method, path, body, timestamp);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(canonical.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a signature in constant time. Malformed hex, length mismatches
/// and MAC mismatches all return false; this never panics on caller input.
pub fn verify(
    method: &str,
    path: &str,
    body: &[u8],
    timestamp: i64,
    secret: &str,
    signature: &str,
) -> bool {
    let Ok(provided) = hex::decode(signature) else {
        return false;
    };
    let canonical = canonical_request(method, path, body, timestamp);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(canonical.as_bytes());
    mac.verify_slice(&provided).is_ok()
}

/// Whether `timestamp` is within tolerance of the current wall clock.
pub fn timestamp_fresh(timestamp: i64, tolerance: Duration) -> bool {
    let now = chrono::Utc::now().timestamp();
    now.abs_diff(timestamp) <= tolerance.as_secs()
}

fn canonical_request(method: &str, path: &str, body: &[u8], timestamp: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let body_hash = hex::encode(hasher.finalize());
    format!(
        "{}\n{}\n{}\n{}",
        timestamp,
        method.to_uppercase(),
        path,
        body_hash
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";

    #[test]
    fn round_trip_verifies() {
        let body = br#"{"projectId":"p1"}"#;
        let ts = chrono::Utc::now().timestamp();
        let sig = sign("post", "/projects", body, ts, SECRET);
        assert!(verify("POST", "/projects", body, ts, SECRET, &sig));
    }

    #[test]
    fn tampering_with_any_field_fails() {
        let body = b"hello";
        let ts = 1_700_000_000;
        let sig = sign("POST", "/projects", body, ts, SECRET);

        assert!(!verify("DELETE", "/projects", body, ts, SECRET, &sig));
        assert!(!verify("POST", "/projects/x", body, ts, SECRET, &sig));
        assert!(!verify("POST", "/projects", b"hell0", ts, SECRET, &sig));
        assert!(!verify("POST", "/projects", body, ts + 1, SECRET, &sig));
        assert!(!verify("POST", "/projects", body, ts, "other-secret", &sig));
    }

    #[test]
    fn malformed_signatures_are_rejected_without_panicking() {
        assert!(!verify("GET", "/", b"", 0, SECRET, ""));
        assert!(!verify("GET", "/", b"", 0, SECRET, "zz"));
        assert!(!verify("GET", "/", b"", 0, SECRET, "deadbeef"));
        assert!(!verify("GET", "/", b"", 0, SECRET, "not hex at all"));
    }

    #[test]
    fn method_case_is_canonicalised() {
        let ts = 1_700_000_000;
        let a = sign("post", "/projects", b"", ts, SECRET);
        let b = sign("POST", "/projects", b"", ts, SECRET);
        assert_eq!(a, b);
    }

    #[test]
    fn freshness_window() {
        let now = chrono::Utc::now().timestamp();
        assert!(timestamp_fresh(now, TIMESTAMP_TOLERANCE));
        assert!(timestamp_fresh(now - 299, TIMESTAMP_TOLERANCE));
        assert!(timestamp_fresh(now + 299, TIMESTAMP_TOLERANCE));
        assert!(!timestamp_fresh(now - 600, TIMESTAMP_TOLERANCE));
        assert!(!timestamp_fresh(now + 600, TIMESTAMP_TOLERANCE));
    }
}
