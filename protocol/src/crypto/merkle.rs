//! # Merkle Tree
//!
//! Binary Merkle tree over hex-encoded SHA-256 leaf hashes, with sibling
//! proofs a remote verifier can walk without the full entry set.
//!
//! ## The odd-leaf rule
//!
//! When a level has an odd number of nodes, the last node is **duplicated**
//! (hashed against itself), never promoted unchanged to the next level.
//! Root computation and proof generation apply the rule identically — the
//! upper tier verifies proofs produced by the lower tier, and any
//! divergence here breaks cross-chain verification silently: roots still
//! look valid, proofs just stop matching.
//!
//! ## Hash composition
//!
//! Parents are computed over the *decoded* leaf bytes:
//! `parent = sha256(raw(left) || raw(right))`, re-encoded as hex.
//! Concatenating the hex strings instead would produce different (and
//! incompatible) digests.

use serde::{Deserialize, Serialize};

use super::hash::sha256_hex;

/// Which side of the running hash a proof sibling sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    /// Sibling is hashed on the left of the running value.
    L,
    /// Sibling is hashed on the right of the running value.
    R,
}

/// One level of a Merkle proof: the sibling digest and its side.
///
/// Serialized on the wire as a two-element array `[sibling_hex, "L"|"R"]`
/// so proofs stay readable in logs and portable across implementations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep(pub String, pub Side);

/// Hash two hex-encoded digests into their parent digest.
///
/// Non-hex input contributes zero bytes for the undecodable portion; such
/// a tree can never verify against an honestly computed root, which is the
/// failure mode we want for garbage input.
fn pair_hash(left: &str, right: &str) -> String {
    let mut joined = hex::decode(left).unwrap_or_default();
    joined.extend(hex::decode(right).unwrap_or_default());
    sha256_hex(&joined)
}

/// Compute the Merkle root of `leaves`.
///
/// - empty input → `sha256_hex(b"")` (the empty-tree sentinel, shared with
///   the genesis block's merkle root);
/// - a single leaf is its own root;
/// - otherwise adjacent leaves pair up level by level, duplicating the
///   last node of odd levels.
pub fn merkle_root(leaves: &[String]) -> String {
    match leaves.len() {
        0 => return sha256_hex(b""),
        1 => return leaves[0].clone(),
        _ => {}
    }

    let mut level: Vec<String> = leaves.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(level[level.len() - 1].clone());
        }
        level = level
            .chunks(2)
            .map(|pair| pair_hash(&pair[0], &pair[1]))
            .collect();
    }
    level.into_iter().next().expect("non-empty level")
}

/// Build the sibling path for `leaves[index]`.
///
/// Returns `None` when the index is out of range. A single-leaf tree has
/// an empty proof (the leaf is the root).
pub fn merkle_proof(leaves: &[String], index: usize) -> Option<Vec<ProofStep>> {
    if index >= leaves.len() {
        return None;
    }

    let mut level: Vec<String> = leaves.to_vec();
    let mut cursor = index;
    let mut proof = Vec::new();

    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(level[level.len() - 1].clone());
        }

        if cursor % 2 == 0 {
            proof.push(ProofStep(level[cursor + 1].clone(), Side::R));
        } else {
            proof.push(ProofStep(level[cursor - 1].clone(), Side::L));
        }

        level = level
            .chunks(2)
            .map(|pair| pair_hash(&pair[0], &pair[1]))
            .collect();
        cursor /= 2;
    }

    Some(proof)
}

/// Walk a proof from `leaf` and compare the result against `root`.
pub fn verify_merkle(leaf: &str, proof: &[ProofStep], root: &str) -> bool {
    let mut running = leaf.to_string();
    for ProofStep(sibling, side) in proof {
        running = match side {
            Side::L => pair_hash(sibling, &running),
            Side::R => pair_hash(&running, sibling),
        };
    }
    running == root
}
