use sha2::{Digest, Sha256};

/// SHA-256 of the given bytes, hex-encoded with a `0x` prefix.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("0x{}", alloy::hex::encode(digest))
}

/// Canonical digest of an inbound request.
///
/// Hashes method, path, query, and body joined by newlines so that two
/// requests differing in any of those produce distinct fingerprints. The
/// result keys the replay store and lands in the receipt as `request_hash`.
pub fn request_hash(method: &str, path: &str, query: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b"\n");
    hasher.update(path.as_bytes());
    hasher.update(b"\n");
    hasher.update(query.as_bytes());
    hasher.update(b"\n");
    hasher.update(body);
    format!("0x{}", alloy::hex::encode(hasher.finalize()))
}
