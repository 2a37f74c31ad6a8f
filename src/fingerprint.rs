// src/fingerprint.rs
//! Content fingerprinting for idempotent ingestion.

use sha2::{Digest, Sha256};

/// Deterministic dedup key for a feed entry: `sha256(body | "|" | url)`, hex.
/// Globally unique per source kind in the item store; an entry observed on
/// any later poll cycle maps to the same fingerprint and is skipped.
pub fn fingerprint(body: &str, url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    hasher.update(b"|");
    hasher.update(url.as_bytes());
    format!("{:x}", hasher.finalize())
}
