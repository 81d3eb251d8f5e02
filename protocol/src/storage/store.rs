//! # ChainStore — Persistent Storage Engine
//!
//! The persistence layer for a Strata node, built on sled's embedded
//! key-value store. All on-disk chain state flows through this module.
//!
//! ## Tree Layout
//!
//! | Tree      | Key                          | Value                        |
//! |-----------|------------------------------|------------------------------|
//! | `blocks`  | block index (8B BE)          | block JSON                   |
//! | `hashes`  | block hash (UTF-8 hex)       | block index (8B BE)          |
//! | `indices` | `cid_*`, `fp_*`, `info_k_v`  | pointer `"<block>:<entry>"`  |
//! | `anchors` | provider id (UTF-8)          | `{root, ts}` JSON            |
//! | `meta`    | well-known keys (UTF-8)      | height, root, chain id, PEMs |
//!
//! Block indices are stored big-endian so sled's lexicographic ordering
//! matches numeric ordering and range scans walk the chain in height
//! order.
//!
//! Blocks are stored as JSON rather than a binary encoding: the same
//! bytes serve `/block/index`, `/block/hash`, and sync pages, and a block
//! must re-hash identically after a round trip through storage.
//!
//! ## Atomicity
//!
//! Appending a block writes the block, its hash pointer, every content
//! index entry, `root_latest`, and `height_latest` in ONE sled
//! transaction across all four trees. Either the whole append lands or
//! none of it does; a half-indexed block cannot exist.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sled::transaction::TransactionError;
use sled::{Db, Transactional, Tree};
use tracing::{debug, warn};

use crate::block::{Block, Evidence};
use crate::record::Entry;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt store state: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Meta keys
// ---------------------------------------------------------------------------

const META_HEIGHT: &[u8] = b"height_latest";
const META_ROOT_LATEST: &[u8] = b"root_latest";
const META_CHAIN_ID: &[u8] = b"chain_id";
const META_PRIVATE_KEY: &[u8] = b"node_private_key";
const META_PUBLIC_KEY: &[u8] = b"node_public_key";

// ---------------------------------------------------------------------------
// AnchorInfo
// ---------------------------------------------------------------------------

/// The upper tier's persisted view of one provider's latest anchor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorInfo {
    /// The provider chain's anchored Merkle root.
    pub root: String,
    /// Submission timestamp, RFC 3339. Strictly increasing per provider.
    pub ts: String,
}

// ---------------------------------------------------------------------------
// ChainStore
// ---------------------------------------------------------------------------

/// Durable ordered key/value store for one node's chain state.
///
/// sled trees support lock-free concurrent reads; `ChainStore` is shared
/// across threads via `Arc` without further synchronization. Callers that
/// need "read tip, validate, append" as a unit serialize through the
/// ledger's chain mutex — the store itself only guarantees that each
/// append is atomic.
#[derive(Debug, Clone)]
pub struct ChainStore {
    db: Db,
    blocks: Tree,
    hashes: Tree,
    indices: Tree,
    anchors: Tree,
    meta: Tree,
    /// Optional human-readable block history log, one line per append.
    history_log: Option<PathBuf>,
}

impl ChainStore {
    /// Open or create a store at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// An in-memory store that vanishes on drop. For tests.
    pub fn open_temporary() -> StoreResult<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> StoreResult<Self> {
        Ok(Self {
            blocks: db.open_tree("blocks")?,
            hashes: db.open_tree("hashes")?,
            indices: db.open_tree("indices")?,
            anchors: db.open_tree("anchors")?,
            meta: db.open_tree("meta")?,
            db,
            history_log: None,
        })
    }

    /// Enable the append-only block history text file at `path`.
    pub fn with_history_log(mut self, path: PathBuf) -> Self {
        self.history_log = Some(path);
        self
    }

    // -- Meta ---------------------------------------------------------------

    /// Latest persisted height. `None` means the chain is empty (the
    /// on-disk rendition of "-1").
    pub fn height(&self) -> StoreResult<Option<u64>> {
        match self.meta.get(META_HEIGHT)? {
            Some(bytes) => Ok(Some(decode_index(&bytes)?)),
            None => Ok(None),
        }
    }

    /// The chain id recorded from genesis, if any.
    pub fn chain_id(&self) -> StoreResult<Option<String>> {
        self.get_meta_string(META_CHAIN_ID)
    }

    /// Record the chain id (called once genesis is known).
    pub fn set_chain_id(&self, chain_id: &str) -> StoreResult<()> {
        self.meta.insert(META_CHAIN_ID, chain_id.as_bytes())?;
        Ok(())
    }

    /// The node's persisted key material as `(private_pem, public_pem)`.
    pub fn keypair_pems(&self) -> StoreResult<Option<(String, String)>> {
        let private = self.get_meta_string(META_PRIVATE_KEY)?;
        let public = self.get_meta_string(META_PUBLIC_KEY)?;
        Ok(private.zip(public))
    }

    /// Persist the node's key material.
    pub fn set_keypair_pems(&self, private_pem: &str, public_pem: &str) -> StoreResult<()> {
        self.meta.insert(META_PRIVATE_KEY, private_pem.as_bytes())?;
        self.meta.insert(META_PUBLIC_KEY, public_pem.as_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    /// Merkle root of the most recently appended block, if any.
    pub fn latest_root(&self) -> StoreResult<Option<String>> {
        self.get_meta_string(META_ROOT_LATEST)
    }

    fn get_meta_string(&self, key: &[u8]) -> StoreResult<Option<String>> {
        match self.meta.get(key)? {
            Some(bytes) => Ok(Some(
                String::from_utf8(bytes.to_vec())
                    .map_err(|_| StoreError::Corrupt("non-UTF-8 meta value".into()))?,
            )),
            None => Ok(None),
        }
    }

    // -- Blocks -------------------------------------------------------------

    /// Retrieve a block by height.
    pub fn block<E: Entry>(&self, index: u64) -> StoreResult<Option<Block<E>>> {
        match self.blocks.get(index.to_be_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Retrieve a block by its hash via the pointer tree.
    pub fn block_by_hash<E: Entry>(&self, hash: &str) -> StoreResult<Option<Block<E>>> {
        match self.hashes.get(hash.as_bytes())? {
            Some(idx_bytes) => self.block(decode_index(&idx_bytes)?),
            None => Ok(None),
        }
    }

    /// The block at the tip of the chain.
    pub fn latest_block<E: Entry>(&self) -> StoreResult<Option<Block<E>>> {
        match self.height()? {
            Some(h) => self.block(h),
            None => Ok(None),
        }
    }

    /// Paginated ascending listing: `(blocks, total)` where `total` is
    /// the chain length. Offsets beyond the end return an empty page.
    pub fn list_blocks<E: Entry>(
        &self,
        offset: u64,
        limit: u64,
    ) -> StoreResult<(Vec<Block<E>>, u64)> {
        let total = match self.height()? {
            Some(h) => h + 1,
            None => return Ok((Vec::new(), 0)),
        };
        if offset >= total || limit == 0 {
            return Ok((Vec::new(), total));
        }
        let end = (offset + limit).min(total);
        let mut out = Vec::with_capacity((end - offset) as usize);
        for i in offset..end {
            match self.block(i)? {
                Some(b) => out.push(b),
                None => return Err(StoreError::Corrupt(format!("missing block {i}"))),
            }
        }
        Ok((out, total))
    }

    /// Append a validated block atomically: block body, hash pointer,
    /// content indices, `root_latest`, and `height_latest` in one
    /// transaction. Validation is the ledger's job; the store writes what
    /// it is given.
    pub fn append_block<E: Entry>(&self, block: &Block<E>) -> StoreResult<()> {
        let block_bytes = serde_json::to_vec(block)?;
        let index_key = block.index.to_be_bytes();

        // Content index pointers, computed outside the transaction.
        let pointers: Vec<(String, String)> = block
            .entries
            .iter()
            .enumerate()
            .flat_map(|(ei, entry)| {
                let ptr = format!("{}:{}", block.index, ei);
                entry
                    .index_keys()
                    .into_iter()
                    .map(move |k| (k, ptr.clone()))
            })
            .collect();

        (&self.blocks, &self.hashes, &self.indices, &self.meta)
            .transaction(|(blocks, hashes, indices, meta)| {
                blocks.insert(index_key.as_slice(), block_bytes.as_slice())?;
                hashes.insert(block.block_hash.as_bytes(), index_key.as_slice())?;
                for (key, ptr) in &pointers {
                    indices.insert(key.as_bytes(), ptr.as_bytes())?;
                }
                meta.insert(META_ROOT_LATEST, block.merkle_root.as_bytes())?;
                meta.insert(META_HEIGHT, index_key.as_slice())?;
                Ok(())
            })
            .map_err(|e: TransactionError<()>| match e {
                TransactionError::Storage(e) => StoreError::Sled(e),
                TransactionError::Abort(()) => StoreError::Corrupt("append aborted".into()),
            })?;

        self.db.flush()?;
        debug!(index = block.index, hash = %block.block_hash, "block persisted");
        self.append_history_line(block);
        Ok(())
    }

    /// Resolve a content index key to its `(block_index, entry_index)`
    /// pointer.
    pub fn lookup_pointer(&self, key: &str) -> StoreResult<Option<(u64, usize)>> {
        let Some(bytes) = self.indices.get(key.as_bytes())? else {
            return Ok(None);
        };
        let text = String::from_utf8(bytes.to_vec())
            .map_err(|_| StoreError::Corrupt("non-UTF-8 index pointer".into()))?;
        let Some((bi, ei)) = text.split_once(':') else {
            return Err(StoreError::Corrupt(format!("malformed pointer {text:?}")));
        };
        match (bi.parse(), ei.parse()) {
            (Ok(bi), Ok(ei)) => Ok(Some((bi, ei))),
            _ => Err(StoreError::Corrupt(format!("malformed pointer {text:?}"))),
        }
    }

    // -- Anchors (upper tier) -----------------------------------------------

    /// Persist a provider's latest anchor.
    pub fn put_anchor(&self, provider_id: &str, info: &AnchorInfo) -> StoreResult<()> {
        self.anchors
            .insert(provider_id.as_bytes(), serde_json::to_vec(info)?)?;
        self.db.flush()?;
        Ok(())
    }

    /// A provider's persisted anchor, if any.
    pub fn anchor(&self, provider_id: &str) -> StoreResult<Option<AnchorInfo>> {
        match self.anchors.get(provider_id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All persisted anchors, for rehydrating the in-memory map on boot.
    pub fn all_anchors(&self) -> StoreResult<Vec<(String, AnchorInfo)>> {
        let mut out = Vec::new();
        for item in self.anchors.iter() {
            let (key, value) = item?;
            let provider = String::from_utf8(key.to_vec())
                .map_err(|_| StoreError::Corrupt("non-UTF-8 anchor key".into()))?;
            out.push((provider, serde_json::from_slice(&value)?));
        }
        Ok(out)
    }

    // -- Reset --------------------------------------------------------------

    /// Wipe everything. The chain height becomes empty; identity and
    /// chain id are re-established from the next genesis the node syncs
    /// or authors. This is the first half of fork resolution.
    pub fn reset(&self) -> StoreResult<()> {
        self.blocks.clear()?;
        self.hashes.clear()?;
        self.indices.clear()?;
        self.anchors.clear()?;
        self.meta.clear()?;
        self.db.flush()?;
        warn!("chain store reset");
        Ok(())
    }

    // -- History log --------------------------------------------------------

    fn append_history_line<E: Entry>(&self, block: &Block<E>) {
        let Some(path) = &self.history_log else {
            return;
        };
        let difficulty = match &block.evidence {
            Evidence::Pow { difficulty, .. } => *difficulty,
            _ => 0,
        };
        let line = format!(
            "Block #{:02}, Entries : {}, Timestamp : {}, Difficulty : {}\n",
            block.index,
            block.entries.len(),
            block.timestamp,
            difficulty,
        );
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "cannot write block history");
        }
    }
}

fn decode_index(bytes: &[u8]) -> StoreResult<u64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Corrupt("invalid index bytes".into()))?;
    Ok(u64::from_be_bytes(arr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, Evidence};
    use crate::record::ProviderRecord;
    use serde_json::{json, Map};

    fn record(id: &str) -> ProviderRecord {
        let mut info = Map::new();
        info.insert("title".into(), json!(format!("title-{id}")));
        ProviderRecord {
            record_id: id.to_string(),
            info,
            fingerprint: format!("{id:0>64}"),
            storage_addr: "s3://bucket/obj".into(),
            history: None,
            timestamp: "2026-08-02T00:00:00Z".into(),
        }
    }

    fn chain_of(n: usize) -> Vec<Block<ProviderRecord>> {
        let mut chain = vec![Block::genesis("CP-A")];
        for i in 1..n {
            let prev = chain.last().unwrap();
            let block = Block::build(
                prev,
                vec![record(&format!("rec-{i}"))],
                format!("2026-08-02T00:00:{i:02}Z"),
                Evidence::Pow {
                    nonce: i as u64,
                    difficulty: 0,
                    elapsed: 1.0,
                },
            )
            .unwrap();
            chain.push(block);
        }
        chain
    }

    #[test]
    fn empty_store_has_no_height() {
        let store = ChainStore::open_temporary().unwrap();
        assert!(store.height().unwrap().is_none());
        assert!(store.latest_root().unwrap().is_none());
        assert!(store.latest_block::<ProviderRecord>().unwrap().is_none());
    }

    #[test]
    fn append_updates_height_root_and_hash_pointer() {
        let store = ChainStore::open_temporary().unwrap();
        for block in chain_of(3) {
            store.append_block(&block).unwrap();
        }

        assert_eq!(store.height().unwrap(), Some(2));
        let tip: Block<ProviderRecord> = store.latest_block().unwrap().unwrap();
        assert_eq!(tip.index, 2);
        assert_eq!(store.latest_root().unwrap().unwrap(), tip.merkle_root);

        let by_hash: Block<ProviderRecord> =
            store.block_by_hash(&tip.block_hash).unwrap().unwrap();
        assert_eq!(by_hash.index, 2);
    }

    #[test]
    fn round_trip_preserves_block_hash() {
        let store = ChainStore::open_temporary().unwrap();
        let chain = chain_of(2);
        store.append_block(&chain[0]).unwrap();
        store.append_block(&chain[1]).unwrap();

        let loaded: Block<ProviderRecord> = store.block(1).unwrap().unwrap();
        assert_eq!(loaded, chain[1]);
        assert_eq!(loaded.block_hash, loaded.compute_hash());
    }

    #[test]
    fn content_indices_point_into_the_block() {
        let store = ChainStore::open_temporary().unwrap();
        for block in chain_of(3) {
            store.append_block(&block).unwrap();
        }

        assert_eq!(store.lookup_pointer("cid_rec-2").unwrap(), Some((2, 0)));
        assert_eq!(
            store.lookup_pointer("info_title_title-1").unwrap(),
            Some((1, 0))
        );
        assert_eq!(store.lookup_pointer("cid_missing").unwrap(), None);
    }

    #[test]
    fn missing_blocks_are_none_not_errors() {
        let store = ChainStore::open_temporary().unwrap();
        assert!(store.block::<ProviderRecord>(7).unwrap().is_none());
        assert!(store
            .block_by_hash::<ProviderRecord>("feed")
            .unwrap()
            .is_none());
    }

    #[test]
    fn pagination_clamps_to_chain_length() {
        let store = ChainStore::open_temporary().unwrap();
        for block in chain_of(5) {
            store.append_block(&block).unwrap();
        }

        let (page, total) = store.list_blocks::<ProviderRecord>(0, 10).unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.len(), 5);

        let (page, _) = store.list_blocks::<ProviderRecord>(3, 10).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].index, 3);

        let (page, total) = store.list_blocks::<ProviderRecord>(9, 10).unwrap();
        assert!(page.is_empty());
        assert_eq!(total, 5);
    }

    #[test]
    fn chain_id_and_keypair_persist() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = ChainStore::open(dir.path()).unwrap();
            store.set_chain_id("CP-A").unwrap();
            store.set_keypair_pems("private-pem", "public-pem").unwrap();
        }
        let store = ChainStore::open(dir.path()).unwrap();
        assert_eq!(store.chain_id().unwrap().unwrap(), "CP-A");
        assert_eq!(
            store.keypair_pems().unwrap().unwrap(),
            ("private-pem".to_string(), "public-pem".to_string())
        );
    }

    #[test]
    fn anchors_round_trip_and_enumerate() {
        let store = ChainStore::open_temporary().unwrap();
        let info = AnchorInfo {
            root: "ab".repeat(32),
            ts: "2026-08-02T00:00:00Z".into(),
        };
        store.put_anchor("CP-A", &info).unwrap();
        store
            .put_anchor(
                "CP-B",
                &AnchorInfo {
                    root: "cd".repeat(32),
                    ts: "2026-08-02T00:00:01Z".into(),
                },
            )
            .unwrap();

        assert_eq!(store.anchor("CP-A").unwrap().unwrap(), info);
        assert!(store.anchor("CP-C").unwrap().is_none());
        assert_eq!(store.all_anchors().unwrap().len(), 2);
    }

    #[test]
    fn reset_wipes_everything() {
        let store = ChainStore::open_temporary().unwrap();
        for block in chain_of(3) {
            store.append_block(&block).unwrap();
        }
        store.set_chain_id("CP-A").unwrap();
        store
            .put_anchor(
                "CP-A",
                &AnchorInfo {
                    root: "r".into(),
                    ts: "t".into(),
                },
            )
            .unwrap();

        store.reset().unwrap();

        assert!(store.height().unwrap().is_none());
        assert!(store.block::<ProviderRecord>(0).unwrap().is_none());
        assert!(store.lookup_pointer("cid_rec-1").unwrap().is_none());
        assert!(store.anchor("CP-A").unwrap().is_none());
        assert!(store.chain_id().unwrap().is_none());
    }

    #[test]
    fn history_log_appends_one_line_per_block() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("block_history.txt");
        let store = ChainStore::open_temporary()
            .unwrap()
            .with_history_log(log_path.clone());

        for block in chain_of(2) {
            store.append_block(&block).unwrap();
        }

        let text = std::fs::read_to_string(&log_path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("Block #00"));
        assert!(lines[1].contains("Entries : 1"));
    }
}
