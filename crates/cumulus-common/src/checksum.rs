//! Content checksums
//!
//! Blocks are fingerprinted with SHA-256 at write time; the hex digest is
//! persisted with the block and compared against every copy read back.

use sha2::{Digest, Sha256};

/// Compute the content-addressed checksum of `data` as a lowercase hex string
#[must_use]
pub fn content_checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Check `data` against a previously computed checksum
#[must_use]
pub fn verify(data: &[u8], expected: &str) -> bool {
    content_checksum(data) == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_stable() {
        let data = b"hello cumulus";
        assert_eq!(content_checksum(data), content_checksum(data));
        assert_eq!(content_checksum(data).len(), 64);
    }

    #[test]
    fn test_checksum_detects_single_bit_flip() {
        let data: Vec<u8> = (0..4096).map(|_| rand::random::<u8>()).collect();
        let sum = content_checksum(&data);

        let mut corrupted = data.clone();
        corrupted[1234] ^= 0x01;

        assert!(verify(&data, &sum));
        assert!(!verify(&corrupted, &sum));
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(
            content_checksum(&[]),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
