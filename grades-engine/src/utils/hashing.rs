//! Content hashing helpers

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// SHA-256 digest, base64 encoded (44 characters)
pub fn sha256_base64(bytes: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(bytes))
}

/// Hash the compact JSON form of `value`
///
/// Struct fields serialize in declaration order and maps must be ordered
/// (`BTreeMap`) for the result to be stable.
pub fn hash_json<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(sha256_base64(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_has_stable_length() {
        assert_eq!(sha256_base64(b"").len(), 44);
        assert_eq!(sha256_base64(b"a much longer input string").len(), 44);
    }

    #[test]
    fn test_hash_json_is_deterministic() {
        let a = hash_json(&vec![1, 2, 3]).unwrap();
        let b = hash_json(&vec![1, 2, 3]).unwrap();
        let c = hash_json(&vec![3, 2, 1]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
