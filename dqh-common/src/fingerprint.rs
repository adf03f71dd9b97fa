//! Tool configuration fingerprints
//!
//! The fingerprint of the configuration a tool ran with is stored as the
//! validation run's `config_hash`, so two runs can be checked for having used
//! identical rules.

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of raw configuration bytes
pub fn config_fingerprint(bytes: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes.as_ref());
    format!("{:x}", hasher.finalize())
}
