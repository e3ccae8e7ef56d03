//! Stable machine fingerprint for upstream identification headers

use std::sync::OnceLock;

use sha2::{Digest, Sha256};

static FINGERPRINT: OnceLock<String> = OnceLock::new();

/// Stable per-machine fingerprint, computed once per process.
///
/// Derived from `/etc/machine-id` where available, falling back to the
/// hostname. The upstream only requires the value to be stable across
/// requests from the same installation.
pub fn machine_fingerprint() -> &'static str {
    FINGERPRINT.get_or_init(|| {
        let seed = std::fs::read_to_string("/etc/machine-id")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "kiro-gateway".to_string());

        let digest = Sha256::digest(seed.as_bytes());
        hex::encode(digest)
    })
}
