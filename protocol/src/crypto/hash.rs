//! SHA-256 helpers. Strata commits to SHA-256 everywhere a digest crosses
//! the wire — leaf hashes, Merkle nodes, block hashes, signature
//! pre-hashes — because both tiers and any external verifier must agree
//! on one function.

use sha2::{Digest, Sha256};

/// SHA-256 of `data`, hex-encoded. The universal digest form on the wire.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// SHA-256 of `data` as raw bytes, for call sites that feed the digest
/// into another hash or a signature rather than onto the wire.
pub fn sha256_bytes(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_known_vector() {
        // SHA-256("") — also the Merkle root of an empty entry set.
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn hex_and_bytes_agree() {
        let data = b"strata";
        assert_eq!(sha256_hex(data), hex::encode(sha256_bytes(data)));
    }

    #[test]
    fn deterministic() {
        assert_eq!(sha256_hex(b"record"), sha256_hex(b"record"));
        assert_ne!(sha256_hex(b"record"), sha256_hex(b"Record"));
    }
}
