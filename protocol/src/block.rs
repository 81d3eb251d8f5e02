//! # Block Structure
//!
//! A block is the unit of finality on both tiers. Lower-tier blocks seal
//! provider records; upper-tier blocks seal anchors. The shape is
//! identical — only the entry type and the finality evidence differ — so
//! there is one generic [`Block<E>`] with a closed [`Evidence`] sum type
//! instead of two parallel structs.
//!
//! ## Hash computation
//!
//! `block_hash = sha256_hex(canonical(header_subset))` where the header
//! subset is `{index, chain_id, prev_hash, timestamp, merkle_root}` plus,
//! for PoW blocks, `{nonce, difficulty}`. The subset deliberately excludes
//! the entries array, any signature list, the measured `elapsed`, and the
//! hash field itself: entries are committed through `merkle_root`, and
//! PBFT signatures sign the hash (not the other way around).
//!
//! ## Merkle commitment
//!
//! `merkle_root` is the tree over `leaf_hash(e)` for each entry in order.
//! The leaf hashes are persisted alongside the block so proof generation
//! at query time does not re-serialize entries.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::{GENESIS_PREV_HASH, GENESIS_TIMESTAMP};
use crate::crypto::{canonical_json, merkle_root, sha256_hex, CryptoError};
use crate::record::Entry;

// ---------------------------------------------------------------------------
// Evidence
// ---------------------------------------------------------------------------

/// Proof of finality carried by a block.
///
/// Exactly one of these shapes is valid per consensus mode; the genesis
/// block carries its own marker and is valid only at index 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Evidence {
    /// The deterministic genesis block. No work, no votes.
    Genesis,

    /// Won a mining race: the block hash starts with `difficulty` hex
    /// zeros at the given nonce. `elapsed` is the winner's measured
    /// search time in seconds, input to difficulty adjustment; it is not
    /// part of the hash pre-image.
    Pow {
        nonce: u64,
        difficulty: u32,
        elapsed: f32,
    },

    /// Finalized by a PBFT commit round: `signatures` are hex DER ECDSA
    /// signatures over the block hash, one per distinct voter, at least a
    /// quorum of them.
    Pbft {
        proposer: String,
        signatures: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

/// A sealed (or candidate) block of entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block<E> {
    /// Height of this block; genesis is 0.
    pub index: u64,
    /// Chain identifier, fixed at genesis for the chain's lifetime.
    pub chain_id: String,
    /// `block_hash` of the predecessor; 64 zeros for genesis.
    pub prev_hash: String,
    /// Creation time, RFC 3339.
    pub timestamp: String,
    /// The committed payload, in Merkle-leaf order.
    pub entries: Vec<E>,
    /// `leaf_hash` of each entry, persisted for proof generation.
    pub leaf_hashes: Vec<String>,
    /// Merkle root over `leaf_hashes`.
    pub merkle_root: String,
    /// Finality evidence.
    pub evidence: Evidence,
    /// SHA-256 hex of the canonical header subset.
    pub block_hash: String,
}

impl<E: Entry> Block<E> {
    /// Construct the deterministic genesis block for a chain id.
    ///
    /// Two fresh nodes given the same chain id produce byte-identical
    /// genesis blocks; the fixed timestamp and zero prev-hash exist for
    /// exactly that reproducibility.
    pub fn genesis(chain_id: &str) -> Self {
        let mut block = Self {
            index: 0,
            chain_id: chain_id.to_string(),
            prev_hash: GENESIS_PREV_HASH.to_string(),
            timestamp: GENESIS_TIMESTAMP.to_string(),
            entries: Vec::new(),
            leaf_hashes: Vec::new(),
            merkle_root: sha256_hex(b""),
            evidence: Evidence::Genesis,
            block_hash: String::new(),
        };
        block.block_hash = block.compute_hash();
        block
    }

    /// Build a candidate block extending `prev` with the given entries
    /// and evidence. Computes leaf hashes, the Merkle root, and the block
    /// hash; the caller supplies the timestamp so consensus engines
    /// control it (PoW fixes it before the nonce search begins).
    pub fn build(
        prev: &Block<E>,
        entries: Vec<E>,
        timestamp: String,
        evidence: Evidence,
    ) -> Result<Self, CryptoError> {
        let leaf_hashes = entries
            .iter()
            .map(Entry::leaf_hash)
            .collect::<Result<Vec<_>, _>>()?;
        let merkle_root = merkle_root(&leaf_hashes);
        let mut block = Self {
            index: prev.index + 1,
            chain_id: prev.chain_id.clone(),
            prev_hash: prev.block_hash.clone(),
            timestamp,
            entries,
            leaf_hashes,
            merkle_root,
            evidence,
            block_hash: String::new(),
        };
        block.block_hash = block.compute_hash();
        Ok(block)
    }

    /// The canonical header subset this block hashes over.
    fn header_subset(&self) -> serde_json::Value {
        let mut subset = json!({
            "index": self.index,
            "chain_id": self.chain_id,
            "prev_hash": self.prev_hash,
            "timestamp": self.timestamp,
            "merkle_root": self.merkle_root,
        });
        if let Evidence::Pow {
            nonce, difficulty, ..
        } = &self.evidence
        {
            subset["nonce"] = json!(nonce);
            subset["difficulty"] = json!(difficulty);
        }
        subset
    }

    /// Recompute the block hash from the header subset.
    ///
    /// Use this to check that `block_hash` matches the content. A JSON
    /// value is always canonically serializable, so this cannot fail.
    pub fn compute_hash(&self) -> String {
        let bytes =
            canonical_json(&self.header_subset()).expect("JSON value is always serializable");
        sha256_hex(&bytes)
    }

    /// Recompute the leaf hashes from the entries, not trusting the
    /// persisted `leaf_hashes` field.
    pub fn compute_leaf_hashes(&self) -> Result<Vec<String>, CryptoError> {
        self.entries.iter().map(Entry::leaf_hash).collect()
    }

    /// Does the block hash satisfy a PoW difficulty of `d` hex zeros?
    pub fn meets_difficulty(&self, d: u32) -> bool {
        hash_meets_difficulty(&self.block_hash, d)
    }
}

/// Difficulty predicate shared by the miner and every validator: the hex
/// hash must start with `difficulty` `'0'` characters.
pub fn hash_meets_difficulty(hash: &str, difficulty: u32) -> bool {
    let d = difficulty as usize;
    hash.len() >= d && hash.bytes().take(d).all(|b| b == b'0')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ProviderRecord;
    use serde_json::Map;

    fn record(id: &str) -> ProviderRecord {
        ProviderRecord {
            record_id: id.to_string(),
            info: Map::new(),
            fingerprint: format!("{:0>64}", id.len()),
            storage_addr: "s3://x".into(),
            history: None,
            timestamp: "2026-08-02T00:00:00Z".into(),
        }
    }

    fn pow_evidence() -> Evidence {
        Evidence::Pow {
            nonce: 42,
            difficulty: 0,
            elapsed: 1.5,
        }
    }

    #[test]
    fn genesis_is_reproducible() {
        let a: Block<ProviderRecord> = Block::genesis("CP-A");
        let b: Block<ProviderRecord> = Block::genesis("CP-A");
        assert_eq!(a, b);
        assert_eq!(a.block_hash, a.compute_hash());
        assert_eq!(a.prev_hash, GENESIS_PREV_HASH);
        assert_eq!(a.merkle_root, sha256_hex(b""));
        assert!(a.entries.is_empty());
    }

    #[test]
    fn genesis_differs_per_chain_id() {
        let a: Block<ProviderRecord> = Block::genesis("CP-A");
        let b: Block<ProviderRecord> = Block::genesis("CP-B");
        assert_ne!(a.block_hash, b.block_hash);
    }

    #[test]
    fn build_links_to_parent_and_commits_entries() {
        let genesis: Block<ProviderRecord> = Block::genesis("CP-A");
        let entries = vec![record("a"), record("b"), record("c")];
        let block = Block::build(
            &genesis,
            entries.clone(),
            "2026-08-02T00:00:01Z".into(),
            pow_evidence(),
        )
        .unwrap();

        assert_eq!(block.index, 1);
        assert_eq!(block.prev_hash, genesis.block_hash);
        assert_eq!(block.chain_id, "CP-A");
        assert_eq!(block.leaf_hashes.len(), 3);
        assert_eq!(block.leaf_hashes, block.compute_leaf_hashes().unwrap());
        assert_eq!(block.merkle_root, merkle_root(&block.leaf_hashes));
        assert_eq!(block.block_hash, block.compute_hash());
    }

    #[test]
    fn hash_excludes_entries_but_commits_them_via_root() {
        let genesis: Block<ProviderRecord> = Block::genesis("CP-A");
        let mut block = Block::build(
            &genesis,
            vec![record("a")],
            "2026-08-02T00:00:01Z".into(),
            pow_evidence(),
        )
        .unwrap();

        // Dropping an entry without touching the root leaves the header
        // hash unchanged — the root is the commitment, not the array.
        block.entries.clear();
        assert_eq!(block.block_hash, block.compute_hash());

        // Touching the root changes the hash.
        block.merkle_root = sha256_hex(b"other");
        assert_ne!(block.block_hash, block.compute_hash());
    }

    #[test]
    fn pow_hash_covers_nonce_and_difficulty() {
        let genesis: Block<ProviderRecord> = Block::genesis("CP-A");
        let block = Block::build(
            &genesis,
            vec![],
            "2026-08-02T00:00:01Z".into(),
            Evidence::Pow {
                nonce: 7,
                difficulty: 2,
                elapsed: 0.0,
            },
        )
        .unwrap();

        let mut renonced = block.clone();
        renonced.evidence = Evidence::Pow {
            nonce: 8,
            difficulty: 2,
            elapsed: 0.0,
        };
        assert_ne!(block.compute_hash(), renonced.compute_hash());

        // elapsed is measured, not consensus: it must not move the hash.
        let mut retimed = block.clone();
        retimed.evidence = Evidence::Pow {
            nonce: 7,
            difficulty: 2,
            elapsed: 99.0,
        };
        assert_eq!(block.compute_hash(), retimed.compute_hash());
    }

    #[test]
    fn pbft_signatures_do_not_move_the_hash() {
        let genesis: Block<ProviderRecord> = Block::genesis("CP-A");
        let block = Block::build(
            &genesis,
            vec![record("a")],
            "2026-08-02T00:00:01Z".into(),
            Evidence::Pbft {
                proposer: "node-1:5000".into(),
                signatures: vec![],
            },
        )
        .unwrap();

        let mut signed = block.clone();
        signed.evidence = Evidence::Pbft {
            proposer: "node-1:5000".into(),
            signatures: vec!["aa".repeat(35)],
        };
        assert_eq!(block.compute_hash(), signed.compute_hash());
    }

    #[test]
    fn difficulty_predicate() {
        assert!(hash_meets_difficulty("00ab", 2));
        assert!(hash_meets_difficulty("0000", 2));
        assert!(!hash_meets_difficulty("0a00", 2));
        assert!(hash_meets_difficulty("ab", 0));
        assert!(!hash_meets_difficulty("0", 2));
    }

    #[test]
    fn serde_round_trip_preserves_hash() {
        let genesis: Block<ProviderRecord> = Block::genesis("CP-A");
        let block = Block::build(
            &genesis,
            vec![record("a"), record("b")],
            "2026-08-02T00:00:01Z".into(),
            pow_evidence(),
        )
        .unwrap();

        let json = serde_json::to_string(&block).unwrap();
        let back: Block<ProviderRecord> = serde_json::from_str(&json).unwrap();
        assert_eq!(block, back);
        assert_eq!(back.block_hash, back.compute_hash());
    }
}
