//! # Ledger
//!
//! Chain invariants live here. The ledger owns the store, the chain
//! mutex, and the pending pool; every path that appends a block — mining
//! winner, gossip receiver, PBFT finalization, chain-watcher resync —
//! funnels through [`Ledger::append`] and its validation pipeline:
//!
//! 1. duplicate-index check (drop-duplicate semantics at the caller),
//! 2. link: consecutive index, `prev_hash`, `chain_id`,
//! 3. digest: leaf hashes, Merkle root, and block hash are **recomputed**,
//!    never trusted from the wire,
//! 4. finality evidence via the injected [`EvidenceVerifier`],
//! 5. one atomic store commit, then a `BlockSealed` broadcast event.
//!
//! The evidence verifier is a capability handed in at construction: the
//! PoW verifier is stateless, the PBFT verifier needs the peer key
//! registry. Injecting the trait keeps the ledger free of any reference
//! back into the peerage.
//!
//! ## Locking
//!
//! The chain mutex serializes "read tip → validate → append" and is held
//! across the store commit. The pending pool has its own short-held mutex
//! and is never locked while the chain mutex is held.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::block::{Block, Evidence};
use crate::consensus::EvidenceError;
use crate::crypto::{merkle_root, CryptoError};
use crate::record::Entry;
use crate::storage::{ChainStore, StoreError};

/// Capacity of the sealed-block broadcast channel. Large enough to absorb
/// a burst of appends during resync without dropping events for the
/// anchor submitter.
const SEALED_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from the append pipeline and pending pool.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The predecessor of the offered block is not in the store. The
    /// caller should trigger a resync rather than retry.
    #[error("missing previous block for index {index}")]
    MissingPrev { index: u64 },

    /// A block already exists at this index. Duplicate delivery is
    /// expected on the gossip layer; callers drop these silently.
    #[error("block {index} already persisted")]
    DuplicateIndex { index: u64 },

    #[error("index not consecutive: prev={prev}, got={got}")]
    NonConsecutive { prev: u64, got: u64 },

    #[error("prev_hash mismatch at index {index}")]
    PrevHashMismatch { index: u64 },

    #[error("chain_id mismatch: chain={chain}, block={block}")]
    ChainIdMismatch { chain: String, block: String },

    #[error("leaf hashes do not match entries")]
    LeafHashMismatch,

    #[error("merkle_root mismatch")]
    MerkleRootMismatch,

    #[error("block_hash mismatch")]
    BlockHashMismatch,

    #[error("malformed genesis block")]
    MalformedGenesis,

    /// The local chain has no blocks yet; the node is waiting for sync.
    #[error("local chain not initialized")]
    EmptyChain,

    #[error("finality evidence rejected: {0}")]
    Evidence(#[from] EvidenceError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

// ---------------------------------------------------------------------------
// Evidence verification capability
// ---------------------------------------------------------------------------

/// Verifies a block's proof of finality. Implemented by the PoW engine
/// (difficulty prefix) and the PBFT engine (quorum of distinct valid
/// signatures against registered peer keys).
pub trait EvidenceVerifier: Send + Sync {
    /// Check `evidence` for the block with the given hash. Genesis blocks
    /// do not reach this call; the ledger validates them structurally.
    fn verify(&self, block_hash: &str, evidence: &Evidence) -> Result<(), EvidenceError>;
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// The chain state machine for one tier: store + chain mutex + pending
/// pool + sealed-block events.
pub struct Ledger<E: Entry> {
    store: ChainStore,
    chain_mutex: Mutex<()>,
    pending: Mutex<Vec<E>>,
    verifier: Arc<dyn EvidenceVerifier>,
    sealed: broadcast::Sender<Block<E>>,
    last_block_time: Mutex<Option<Instant>>,
}

impl<E: Entry> Ledger<E> {
    /// Create a ledger over an opened store with the given evidence
    /// verifier.
    pub fn new(store: ChainStore, verifier: Arc<dyn EvidenceVerifier>) -> Self {
        let (sealed, _) = broadcast::channel(SEALED_CHANNEL_CAPACITY);
        Self {
            store,
            chain_mutex: Mutex::new(()),
            pending: Mutex::new(Vec::new()),
            verifier,
            sealed,
            last_block_time: Mutex::new(None),
        }
    }

    /// Read access to the underlying store (blocks, indices, anchors).
    pub fn store(&self) -> &ChainStore {
        &self.store
    }

    /// Subscribe to sealed-block events. The lower-tier boot's anchor
    /// submitter listens here.
    pub fn subscribe_sealed(&self) -> broadcast::Receiver<Block<E>> {
        self.sealed.subscribe()
    }

    // -- Bootstrap ----------------------------------------------------------

    /// Establish the chain on startup.
    ///
    /// If block 0 exists, its `chain_id` is the source of truth and is
    /// recorded into meta. Otherwise, when `author_genesis` is set (the
    /// boot node for PoW, the local genesis author for PBFT), the
    /// deterministic genesis is constructed and committed; other nodes
    /// leave the chain empty and defer to peerage-driven sync.
    pub fn bootstrap(&self, chain_id: &str, author_genesis: bool) -> Result<(), LedgerError> {
        let _guard = self.chain_mutex.lock();

        if let Some(genesis) = self.store.block::<E>(0)? {
            self.store.set_chain_id(&genesis.chain_id)?;
            let height = self.store.height()?;
            info!(chain_id = %genesis.chain_id, ?height, "chain loaded");
            return Ok(());
        }

        if !author_genesis {
            info!("no local genesis; waiting for sync");
            return Ok(());
        }

        let genesis = Block::<E>::genesis(chain_id);
        self.store.append_block(&genesis)?;
        self.store.set_chain_id(chain_id)?;
        info!(chain_id, hash = %genesis.block_hash, "genesis created");
        Ok(())
    }

    // -- Queries ------------------------------------------------------------

    /// Latest height, `None` when the chain is empty.
    pub fn height(&self) -> Result<Option<u64>, LedgerError> {
        Ok(self.store.height()?)
    }

    /// The current tip block.
    pub fn tip(&self) -> Result<Option<Block<E>>, LedgerError> {
        Ok(self.store.latest_block()?)
    }

    /// Chain id from meta (set at bootstrap or first synced genesis).
    pub fn chain_id(&self) -> Result<Option<String>, LedgerError> {
        Ok(self.store.chain_id()?)
    }

    /// Seconds since the last accepted block, if any.
    pub fn secs_since_last_block(&self) -> Option<f32> {
        let last = *self.last_block_time.lock();
        last.map(|t| t.elapsed().as_secs_f32())
    }

    // -- Validation ---------------------------------------------------------

    /// Structural validation of `block` against its predecessor: link and
    /// digests. Evidence is checked separately in [`Ledger::append`].
    pub fn validate_link(&self, block: &Block<E>, prev: &Block<E>) -> Result<(), LedgerError> {
        if block.index != prev.index + 1 {
            return Err(LedgerError::NonConsecutive {
                prev: prev.index,
                got: block.index,
            });
        }
        if block.prev_hash != prev.block_hash {
            return Err(LedgerError::PrevHashMismatch { index: block.index });
        }
        if block.chain_id != prev.chain_id {
            return Err(LedgerError::ChainIdMismatch {
                chain: prev.chain_id.clone(),
                block: block.chain_id.clone(),
            });
        }
        self.validate_digests(block)
    }

    /// Recompute leaf hashes, Merkle root, and block hash; reject on any
    /// mismatch with the carried values.
    pub fn validate_digests(&self, block: &Block<E>) -> Result<(), LedgerError> {
        let leaves = block.compute_leaf_hashes()?;
        if leaves != block.leaf_hashes {
            return Err(LedgerError::LeafHashMismatch);
        }
        if merkle_root(&leaves) != block.merkle_root {
            return Err(LedgerError::MerkleRootMismatch);
        }
        if block.compute_hash() != block.block_hash {
            return Err(LedgerError::BlockHashMismatch);
        }
        Ok(())
    }

    fn validate_genesis(&self, block: &Block<E>) -> Result<(), LedgerError> {
        let expected = Block::<E>::genesis(&block.chain_id);
        if *block != expected {
            return Err(LedgerError::MalformedGenesis);
        }
        Ok(())
    }

    // -- Append -------------------------------------------------------------

    /// Run the full append pipeline for an externally received block.
    ///
    /// Holds the chain mutex across read-tip, validation, and the atomic
    /// store commit. Emits a sealed-block event on success.
    pub fn append(&self, block: Block<E>) -> Result<(), LedgerError> {
        let _guard = self.chain_mutex.lock();

        if self.store.block::<E>(block.index)?.is_some() {
            return Err(LedgerError::DuplicateIndex { index: block.index });
        }

        if block.index == 0 {
            // Only reachable while syncing into an empty store.
            self.validate_genesis(&block)?;
            self.store.append_block(&block)?;
            self.store.set_chain_id(&block.chain_id)?;
        } else {
            let prev = self
                .store
                .block::<E>(block.index - 1)?
                .ok_or(LedgerError::MissingPrev { index: block.index })?;
            self.validate_link(&block, &prev)?;
            self.verifier.verify(&block.block_hash, &block.evidence)?;
            self.store.append_block(&block)?;
        }

        *self.last_block_time.lock() = Some(Instant::now());
        info!(
            index = block.index,
            hash = %block.block_hash,
            entries = block.entries.len(),
            "block appended"
        );

        // Send fails only when nobody subscribed, which is fine.
        let _ = self.sealed.send(block);
        Ok(())
    }

    /// Wipe the local chain ahead of a resync. Pending survives — those
    /// entries have not been committed anywhere yet.
    pub fn reset(&self) -> Result<(), LedgerError> {
        let _guard = self.chain_mutex.lock();
        self.store.reset()?;
        warn!("ledger reset; awaiting resync");
        Ok(())
    }

    // -- Pending pool -------------------------------------------------------

    /// Queue records for the next block.
    pub fn append_pending(&self, mut records: Vec<E>) {
        let mut pending = self.pending.lock();
        pending.append(&mut records);
    }

    /// Atomically take the whole pending set, leaving it empty.
    pub fn drain_pending(&self) -> Vec<E> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Is the pending pool empty?
    pub fn pending_is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// `(count, approximate serialized bytes)` of the pending pool, for
    /// the ingest response.
    pub fn pending_stats(&self) -> (usize, usize) {
        let pending = self.pending.lock();
        let bytes = pending
            .iter()
            .map(|e| serde_json::to_vec(e).map(|v| v.len()).unwrap_or(0))
            .sum();
        (pending.len(), bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::hash_meets_difficulty;
    use crate::record::ProviderRecord;
    use serde_json::Map;

    /// Evidence verifier used by ledger tests: accepts PoW whose hash
    /// meets the carried difficulty, rejects everything else.
    struct PowOnly;

    impl EvidenceVerifier for PowOnly {
        fn verify(&self, block_hash: &str, evidence: &Evidence) -> Result<(), EvidenceError> {
            match evidence {
                Evidence::Pow { difficulty, .. } => {
                    if hash_meets_difficulty(block_hash, *difficulty) {
                        Ok(())
                    } else {
                        Err(EvidenceError::DifficultyNotMet {
                            difficulty: *difficulty,
                        })
                    }
                }
                _ => Err(EvidenceError::WrongKind),
            }
        }
    }

    fn record(id: &str) -> ProviderRecord {
        ProviderRecord {
            record_id: id.to_string(),
            info: Map::new(),
            fingerprint: format!("{id:0>64}"),
            storage_addr: "s3://x".into(),
            history: None,
            timestamp: "2026-08-02T00:00:00Z".into(),
        }
    }

    fn ledger() -> Ledger<ProviderRecord> {
        Ledger::new(ChainStore::open_temporary().unwrap(), Arc::new(PowOnly))
    }

    fn next_block(prev: &Block<ProviderRecord>, ids: &[&str]) -> Block<ProviderRecord> {
        Block::build(
            prev,
            ids.iter().map(|id| record(id)).collect(),
            "2026-08-02T00:00:01Z".into(),
            Evidence::Pow {
                nonce: 1,
                difficulty: 0,
                elapsed: 1.0,
            },
        )
        .unwrap()
    }

    #[test]
    fn bootstrap_authors_genesis_when_allowed() {
        let ledger = ledger();
        ledger.bootstrap("CP-A", true).unwrap();
        assert_eq!(ledger.height().unwrap(), Some(0));
        assert_eq!(ledger.chain_id().unwrap().unwrap(), "CP-A");
    }

    #[test]
    fn bootstrap_defers_when_not_author() {
        let ledger = ledger();
        ledger.bootstrap("CP-A", false).unwrap();
        assert!(ledger.height().unwrap().is_none());
    }

    #[test]
    fn bootstrap_adopts_existing_genesis_chain_id() {
        let store = ChainStore::open_temporary().unwrap();
        store
            .append_block(&Block::<ProviderRecord>::genesis("CP-EXISTING"))
            .unwrap();
        let ledger = Ledger::<ProviderRecord>::new(store, Arc::new(PowOnly));
        // Passed-in id is ignored; the persisted genesis wins.
        ledger.bootstrap("CP-OTHER", true).unwrap();
        assert_eq!(ledger.chain_id().unwrap().unwrap(), "CP-EXISTING");
    }

    #[test]
    fn append_accepts_valid_block() {
        let ledger = ledger();
        ledger.bootstrap("CP-A", true).unwrap();
        let tip = ledger.tip().unwrap().unwrap();
        ledger.append(next_block(&tip, &["a", "b"])).unwrap();
        assert_eq!(ledger.height().unwrap(), Some(1));
    }

    #[test]
    fn append_rejects_duplicate_index() {
        let ledger = ledger();
        ledger.bootstrap("CP-A", true).unwrap();
        let tip = ledger.tip().unwrap().unwrap();
        let block = next_block(&tip, &["a"]);
        ledger.append(block.clone()).unwrap();
        assert!(matches!(
            ledger.append(block),
            Err(LedgerError::DuplicateIndex { index: 1 })
        ));
        // State unchanged.
        assert_eq!(ledger.height().unwrap(), Some(1));
    }

    #[test]
    fn append_rejects_missing_prev() {
        let ledger = ledger();
        ledger.bootstrap("CP-A", true).unwrap();
        let tip = ledger.tip().unwrap().unwrap();
        let b1 = next_block(&tip, &["a"]);
        let b2 = next_block(&b1, &["b"]);
        assert!(matches!(
            ledger.append(b2),
            Err(LedgerError::MissingPrev { index: 2 })
        ));
    }

    #[test]
    fn append_rejects_tampered_digests() {
        let ledger = ledger();
        ledger.bootstrap("CP-A", true).unwrap();
        let tip = ledger.tip().unwrap().unwrap();

        // Wrong prev hash.
        let mut bad = next_block(&tip, &["a"]);
        bad.prev_hash = "00".repeat(32);
        bad.block_hash = bad.compute_hash();
        assert!(matches!(
            ledger.append(bad),
            Err(LedgerError::PrevHashMismatch { .. })
        ));

        // Entry swapped after sealing: leaf hashes no longer match.
        let mut bad = next_block(&tip, &["a"]);
        bad.entries[0].record_id = "tampered".into();
        assert!(matches!(
            ledger.append(bad),
            Err(LedgerError::LeafHashMismatch)
        ));

        // Carried merkle root tampered.
        let mut bad = next_block(&tip, &["a"]);
        bad.merkle_root = "ab".repeat(32);
        bad.leaf_hashes = bad.compute_leaf_hashes().unwrap();
        assert!(matches!(
            ledger.append(bad),
            Err(LedgerError::MerkleRootMismatch)
        ));

        // Carried block hash tampered.
        let mut bad = next_block(&tip, &["a"]);
        bad.block_hash = "cd".repeat(32);
        assert!(matches!(
            ledger.append(bad),
            Err(LedgerError::BlockHashMismatch)
        ));

        // Chain id drift.
        let mut bad = next_block(&tip, &["a"]);
        bad.chain_id = "CP-B".into();
        bad.block_hash = bad.compute_hash();
        assert!(matches!(
            ledger.append(bad),
            Err(LedgerError::ChainIdMismatch { .. })
        ));

        assert_eq!(ledger.height().unwrap(), Some(0));
    }

    #[test]
    fn append_consults_the_evidence_verifier() {
        let ledger = ledger();
        ledger.bootstrap("CP-A", true).unwrap();
        let tip = ledger.tip().unwrap().unwrap();

        // Difficulty 4 claim with (almost certainly) no leading zeros.
        let bad = Block::build(
            &tip,
            vec![record("a")],
            "2026-08-02T00:00:01Z".into(),
            Evidence::Pow {
                nonce: 1,
                difficulty: 4,
                elapsed: 1.0,
            },
        )
        .unwrap();
        if !hash_meets_difficulty(&bad.block_hash, 4) {
            assert!(matches!(
                ledger.append(bad),
                Err(LedgerError::Evidence(_))
            ));
        }
    }

    #[test]
    fn genesis_via_sync_must_be_canonical() {
        let ledger = ledger();
        let mut fake = Block::<ProviderRecord>::genesis("CP-A");
        fake.timestamp = "2026-01-01T00:00:00Z".into();
        fake.block_hash = fake.compute_hash();
        assert!(matches!(
            ledger.append(fake),
            Err(LedgerError::MalformedGenesis)
        ));

        ledger.append(Block::genesis("CP-A")).unwrap();
        assert_eq!(ledger.chain_id().unwrap().unwrap(), "CP-A");
    }

    #[test]
    fn pending_pool_drains_atomically() {
        let ledger = ledger();
        assert!(ledger.pending_is_empty());

        ledger.append_pending(vec![record("a"), record("b")]);
        ledger.append_pending(vec![record("c")]);
        let (count, bytes) = ledger.pending_stats();
        assert_eq!(count, 3);
        assert!(bytes > 0);

        let drained = ledger.drain_pending();
        assert_eq!(drained.len(), 3);
        assert!(ledger.pending_is_empty());
        assert!(ledger.drain_pending().is_empty());
    }

    #[test]
    fn sealed_events_reach_subscribers() {
        let ledger = ledger();
        ledger.bootstrap("CP-A", true).unwrap();
        let mut rx = ledger.subscribe_sealed();
        let tip = ledger.tip().unwrap().unwrap();
        let block = next_block(&tip, &["a"]);
        ledger.append(block.clone()).unwrap();
        let sealed = rx.try_recv().unwrap();
        assert_eq!(sealed.block_hash, block.block_hash);
    }

    #[test]
    fn reset_empties_the_chain() {
        let ledger = ledger();
        ledger.bootstrap("CP-A", true).unwrap();
        ledger.append_pending(vec![record("keep-me")]);
        ledger.reset().unwrap();
        assert!(ledger.height().unwrap().is_none());
        // Pending is not chain state; it survives the reset.
        assert!(!ledger.pending_is_empty());
    }
}
