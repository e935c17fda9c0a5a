//! Integrity: SHA-256 digest of the transferred blob, verified after reassembly.

use sha2::{Digest, Sha256};

/// 32-byte SHA-256 digest.
pub type Hash = [u8; 32];

pub fn hash_blob(bytes: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

pub fn verify_blob(bytes: &[u8], expected: &Hash) -> bool {
    hash_blob(bytes) == *expected
}

/// Parse a digest received as raw bytes (after decryption).
pub fn hash_from_slice(bytes: &[u8]) -> Option<Hash> {
    bytes.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_verify_roundtrip() {
        let blob = b"gzip vault";
        let hash = hash_blob(blob);
        assert!(verify_blob(blob, &hash));
    }

    #[test]
    fn verify_rejects_tampered() {
        let hash = hash_blob(b"gzip vault");
        assert!(!verify_blob(b"gzip vau1t", &hash));
    }

    #[test]
    fn hash_from_slice_checks_length() {
        assert!(hash_from_slice(&[0u8; 31]).is_none());
        assert_eq!(hash_from_slice(&[7u8; 32]), Some([7u8; 32]));
    }
}
