//! Integrity: SHA-256 digest of bulk transfer payloads, verified on receive.

use sha2::{Digest, Sha256};

/// Hash a file payload. Returns 32-byte digest.
pub fn digest(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}

/// Verify payload against expected digest.
pub fn verify(payload: &[u8], expected: &[u8; 32]) -> bool {
    digest(payload) == *expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_matches() {
        let data = b"2021-01-14 10:00:00.000 | SessionManager | activate";
        let d = digest(data);
        assert!(verify(data, &d));
    }

    #[test]
    fn verify_rejects_tampered() {
        let d = digest(b"log line");
        assert!(!verify(b"log line!", &d));
    }
}
