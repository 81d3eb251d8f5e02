//! # Cryptographic Core
//!
//! Everything hash- or signature-shaped in Strata goes through this
//! module: the canonical JSON routine that is the sole hash pre-image,
//! SHA-256 helpers, the Merkle root/proof builder and verifier, and ECDSA
//! P-256 key management with DER-encoded signatures.
//!
//! Both chain tiers use the exact same routines. Cross-chain proof
//! verification only works because the upper tier recomputes what the
//! lower tier computed, byte for byte.

pub mod canonical;
pub mod hash;
pub mod keys;
pub mod merkle;

pub use canonical::canonical_json;
pub use hash::{sha256_bytes, sha256_hex};
pub use keys::{verify_signature, EcdsaKeypair};
pub use merkle::{merkle_proof, merkle_root, verify_merkle, ProofStep, Side};

use thiserror::Error;

/// Errors raised by the cryptographic core.
///
/// Callers at the request boundary translate every variant to the same
/// rejection (HTTP 403 for signatures, 400 for malformed input); the
/// variants exist for logs, not for branching.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("value is not canonically serializable: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("malformed PEM key material")]
    InvalidPem,

    #[error("malformed DER signature")]
    InvalidSignature,

    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}
