use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of the whole buffer.
pub fn calculate_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compares a buffer against a previously recorded content hash.
pub fn verify_hash(data: &[u8], expected_hex: &str) -> bool {
    calculate_hash(data).eq_ignore_ascii_case(expected_hex.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_hash() {
        let hash = calculate_hash(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_calculate_hash_empty() {
        assert_eq!(
            calculate_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_verify_hash() {
        let expected = "B94D27B9934D3E08A52E52D7DA7DABFAC484EFE37A5380EE9088F7ACE2EFCDE9";
        assert!(verify_hash(b"hello world", expected));
        assert!(!verify_hash(b"hello world!", expected));
    }
}
