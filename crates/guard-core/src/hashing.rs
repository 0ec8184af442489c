use sha2::{Digest, Sha256};

/// Hex SHA-256 of a stored payload. Checked again when the entry is claimed.
pub fn payload_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
