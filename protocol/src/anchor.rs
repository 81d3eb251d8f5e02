//! # Anchoring
//!
//! The bridge between tiers. After each sealed block, the lower chain's
//! boot signs `root|ts` with its ECDSA key and submits the anchor to the
//! upper boot. The upper side fetches the submitter's public key from the
//! claimed boot address, verifies the DER signature over the identically
//! rebuilt message, guards against timestamp replay, and admits an
//! [`AnchorRecord`] into its pending pool while persisting the
//! `{root, ts}` snapshot per provider.
//!
//! The same module carries the query path the anchors exist for: the
//! lower-side keyword search that packages `record + leaf + proof +
//! roots`, and the upper-side verification that gates each item on the
//! stored anchor root before checking its Merkle proof.

use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::block::Block;
use crate::crypto::{
    merkle_proof, verify_merkle, verify_signature, CryptoError, EcdsaKeypair, ProofStep,
};
use crate::record::{AnchorRecord, ContractSnapshot, Entry, ProviderRecord};
use crate::storage::{AnchorInfo, ChainStore, StoreError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from the anchoring and verified-query paths.
#[derive(Debug, thiserror::Error)]
pub enum AnchorError {
    /// The submission signature does not verify against the provider
    /// boot's published key.
    #[error("anchor signature invalid for provider {0}")]
    InvalidSignature(String),

    /// The submission timestamp is not strictly after the stored anchor.
    #[error("anchor timestamp not after the stored one for provider {0}")]
    StaleTimestamp(String),

    /// An unparsable RFC 3339 timestamp.
    #[error("malformed anchor timestamp {0:?}")]
    BadTimestamp(String),

    /// No anchor or boot route is known for the provider.
    #[error("unknown provider {0}")]
    UnknownProvider(String),

    /// No indexed entry matches the keyword.
    #[error("no record found for keyword {0:?}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Body of `/addAnchor`: a lower boot's signed root submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorSubmission {
    pub provider_id: String,
    /// The submitting boot's address; the upper side fetches the public
    /// key from here and routes future queries to it.
    pub boot_addr: String,
    pub root: String,
    pub ts: String,
    pub sig: String,
}

/// One item of a lower-side `/search` response: everything the upper
/// tier needs to verify the record against its stored anchor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchItem {
    pub record: ProviderRecord,
    /// Merkle root of the block the record sits in.
    pub block_root: String,
    /// The responding node's current latest root; must equal the anchor
    /// the upper tier holds, or the item is not trustworthy yet.
    pub latest_root: String,
    pub leaf: String,
    pub proof: Vec<ProofStep>,
}

// ---------------------------------------------------------------------------
// Message construction & signing (lower side)
// ---------------------------------------------------------------------------

/// The exact bytes an anchor signature covers: `root|ts` with an
/// RFC 3339 timestamp. Both sides build this identically; the unix-epoch
/// concatenation some historic nodes used simply fails verification.
pub fn anchor_message(root: &str, ts: &str) -> Vec<u8> {
    format!("{root}|{ts}").into_bytes()
}

/// Load the node's keypair from the store, generating and persisting one
/// on first use.
pub fn ensure_keypair(store: &ChainStore) -> Result<EcdsaKeypair, AnchorError> {
    if let Some((private_pem, _)) = store.keypair_pems()? {
        return Ok(EcdsaKeypair::from_private_pem(&private_pem)?);
    }
    let keypair = EcdsaKeypair::generate();
    store.set_keypair_pems(&keypair.private_pem()?, &keypair.public_pem()?)?;
    info!("generated node ECDSA keypair");
    Ok(keypair)
}

/// Build a signed submission for a sealed block's Merkle root.
pub fn build_submission(
    keypair: &EcdsaKeypair,
    provider_id: &str,
    boot_addr: &str,
    root: &str,
) -> AnchorSubmission {
    let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let sig = keypair.sign_hex(&anchor_message(root, &ts));
    AnchorSubmission {
        provider_id: provider_id.to_string(),
        boot_addr: boot_addr.to_string(),
        root: root.to_string(),
        ts,
        sig,
    }
}

// ---------------------------------------------------------------------------
// Verification & admission (upper side)
// ---------------------------------------------------------------------------

fn parse_ts(ts: &str) -> Result<DateTime<FixedOffset>, AnchorError> {
    DateTime::parse_from_rfc3339(ts).map_err(|_| AnchorError::BadTimestamp(ts.to_string()))
}

/// Verify a submission against the provider boot's public key and the
/// previously stored anchor.
///
/// Checks, in order: the DER signature over the rebuilt `root|ts`, the
/// timestamp's well-formedness, and strict monotonicity against
/// `previous` — an old-but-valid submission replayed later must not
/// overwrite a newer anchor.
pub fn verify_submission(
    submission: &AnchorSubmission,
    public_pem: &str,
    previous: Option<&AnchorInfo>,
) -> Result<(), AnchorError> {
    let message = anchor_message(&submission.root, &submission.ts);
    if !verify_signature(public_pem, &message, &submission.sig) {
        warn!(provider = %submission.provider_id, "anchor signature rejected");
        return Err(AnchorError::InvalidSignature(submission.provider_id.clone()));
    }

    let new_ts = parse_ts(&submission.ts)?;
    if let Some(prev) = previous {
        let prev_ts = parse_ts(&prev.ts)?;
        if new_ts <= prev_ts {
            return Err(AnchorError::StaleTimestamp(submission.provider_id.clone()));
        }
    }
    Ok(())
}

/// Turn a verified submission into the record sealed into upper blocks.
pub fn to_anchor_record(submission: &AnchorSubmission) -> AnchorRecord {
    AnchorRecord {
        provider_id: submission.provider_id.clone(),
        contract_snapshot: ContractSnapshot::default(),
        lower_root: submission.root.clone(),
        access_catalog: Vec::new(),
        anchor_ts: submission.ts.clone(),
    }
}

// ---------------------------------------------------------------------------
// Anchor registry (upper side)
// ---------------------------------------------------------------------------

/// The upper tier's live view of provider anchors and boot routes.
///
/// Anchors are double-written: into the store (surviving restarts) and
/// into this map (served on the query path without a store read). Boot
/// routes are memory-only; they re-learn from the next submission.
pub struct AnchorRegistry {
    store: ChainStore,
    anchors: DashMap<String, AnchorInfo>,
    provider_boots: DashMap<String, String>,
}

impl AnchorRegistry {
    /// Rehydrate the in-memory map from persisted anchors.
    pub fn load(store: ChainStore) -> Result<Self, AnchorError> {
        let anchors = DashMap::new();
        for (provider, info) in store.all_anchors()? {
            anchors.insert(provider, info);
        }
        Ok(Self {
            store,
            anchors,
            provider_boots: DashMap::new(),
        })
    }

    /// The stored anchor for a provider.
    pub fn anchor(&self, provider_id: &str) -> Option<AnchorInfo> {
        self.anchors.get(provider_id).map(|a| a.value().clone())
    }

    /// Record a verified anchor in both the store and the map.
    pub fn put_anchor(&self, provider_id: &str, info: AnchorInfo) -> Result<(), AnchorError> {
        self.store.put_anchor(provider_id, &info)?;
        self.anchors.insert(provider_id.to_string(), info);
        Ok(())
    }

    /// Resolve a provider's boot address for query routing.
    pub fn provider_boot(&self, provider_id: &str) -> Option<String> {
        self.provider_boots.get(provider_id).map(|b| b.value().clone())
    }

    /// Record a provider's boot address. Returns `true` when the address
    /// is new or changed — the caller then gossips it to the other upper
    /// nodes.
    pub fn set_provider_boot(&self, provider_id: &str, boot_addr: &str) -> bool {
        let changed = self
            .provider_boots
            .insert(provider_id.to_string(), boot_addr.to_string())
            .map(|old| old != boot_addr)
            .unwrap_or(true);
        if changed {
            info!(provider = provider_id, boot = boot_addr, "provider boot updated");
        }
        changed
    }

    /// All known provider boots (for diagnostics and status surfaces).
    pub fn provider_boots_snapshot(&self) -> Vec<(String, String)> {
        self.provider_boots
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Verified query path
// ---------------------------------------------------------------------------

/// Upper-side filter over a lower chain's search response: keep only
/// items whose `latest_root` equals the stored anchor root and whose
/// Merkle proof verifies against their `block_root`.
///
/// A provider that has moved past the anchored root yields an empty list,
/// not an error — the operator waits for the next anchor cycle.
pub fn verify_search_items(anchor_root: &str, items: Vec<SearchItem>) -> Vec<SearchItem> {
    items
        .into_iter()
        .filter(|item| {
            if item.latest_root != anchor_root {
                return false;
            }
            verify_merkle(&item.leaf, &item.proof, &item.block_root)
        })
        .collect()
}

/// Lower-side keyword search: resolve the keyword through the content
/// indices, scan the enclosing block for matches, and package each with
/// its leaf, proof, and the chain's current latest root.
pub fn search_records(store: &ChainStore, keyword: &str) -> Result<Vec<SearchItem>, AnchorError> {
    let pointer = store
        .lookup_pointer(&format!("cid_{keyword}"))?
        .or(store.lookup_pointer(&format!("fp_{keyword}"))?)
        .or(store.lookup_pointer(&format!("info_title_{}", keyword.to_lowercase()))?);
    let Some((block_index, _)) = pointer else {
        return Err(AnchorError::NotFound(keyword.to_string()));
    };

    let Some(block) = store.block::<ProviderRecord>(block_index)? else {
        return Err(AnchorError::NotFound(keyword.to_string()));
    };
    let latest_root = store.latest_root()?.unwrap_or_default();

    let mut items = Vec::new();
    for (entry_index, record) in block.entries.iter().enumerate() {
        if !record.matches(keyword) {
            continue;
        }
        let Some(proof) = merkle_proof(&block.leaf_hashes, entry_index) else {
            continue;
        };
        items.push(SearchItem {
            record: record.clone(),
            block_root: block.merkle_root.clone(),
            latest_root: latest_root.clone(),
            leaf: block.leaf_hashes[entry_index].clone(),
            proof,
        });
    }

    if items.is_empty() {
        return Err(AnchorError::NotFound(keyword.to_string()));
    }
    Ok(items)
}

/// Index-backed Merkle proof for one record id: `(record, block, proof)`.
pub fn record_proof(
    store: &ChainStore,
    record_id: &str,
) -> Result<(ProviderRecord, Block<ProviderRecord>, Vec<ProofStep>), AnchorError> {
    let Some((block_index, entry_index)) = store.lookup_pointer(&format!("cid_{record_id}"))?
    else {
        return Err(AnchorError::NotFound(record_id.to_string()));
    };
    let Some(block) = store.block::<ProviderRecord>(block_index)? else {
        return Err(AnchorError::NotFound(record_id.to_string()));
    };
    let record = block
        .entries
        .get(entry_index)
        .cloned()
        .ok_or_else(|| AnchorError::NotFound(record_id.to_string()))?;
    let proof = merkle_proof(&block.leaf_hashes, entry_index)
        .ok_or_else(|| AnchorError::NotFound(record_id.to_string()))?;
    Ok((record, block, proof))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Evidence;
    use serde_json::{json, Map};

    fn record(id: &str, title: &str) -> ProviderRecord {
        let mut info = Map::new();
        info.insert("title".into(), json!(title));
        ProviderRecord {
            record_id: id.to_string(),
            info,
            fingerprint: format!("{id:0>64}"),
            storage_addr: format!("s3://bucket/{id}"),
            history: None,
            timestamp: "2026-08-02T00:00:00Z".into(),
        }
    }

    fn store_with_block(entries: Vec<ProviderRecord>) -> (ChainStore, Block<ProviderRecord>) {
        let store = ChainStore::open_temporary().unwrap();
        let genesis: Block<ProviderRecord> = Block::genesis("CP-A");
        store.append_block(&genesis).unwrap();
        let block = Block::build(
            &genesis,
            entries,
            "2026-08-02T00:00:01Z".into(),
            Evidence::Pow {
                nonce: 1,
                difficulty: 0,
                elapsed: 1.0,
            },
        )
        .unwrap();
        store.append_block(&block).unwrap();
        (store, block)
    }

    #[test]
    fn keypair_is_generated_once_and_reloaded() {
        let store = ChainStore::open_temporary().unwrap();
        let first = ensure_keypair(&store).unwrap();
        let second = ensure_keypair(&store).unwrap();
        assert_eq!(first.public_pem().unwrap(), second.public_pem().unwrap());
    }

    #[test]
    fn submission_round_trip_verifies() {
        let kp = EcdsaKeypair::generate();
        let sub = build_submission(&kp, "CP-A", "cp-boot:5000", &"ab".repeat(32));
        assert!(verify_submission(&sub, &kp.public_pem().unwrap(), None).is_ok());
    }

    #[test]
    fn tampered_root_is_rejected() {
        let kp = EcdsaKeypair::generate();
        let mut sub = build_submission(&kp, "CP-A", "cp-boot:5000", &"ab".repeat(32));
        sub.root = "cd".repeat(32);
        assert!(matches!(
            verify_submission(&sub, &kp.public_pem().unwrap(), None),
            Err(AnchorError::InvalidSignature(_))
        ));
    }

    #[test]
    fn foreign_key_is_rejected() {
        let kp = EcdsaKeypair::generate();
        let other = EcdsaKeypair::generate();
        let sub = build_submission(&kp, "CP-A", "cp-boot:5000", &"ab".repeat(32));
        assert!(matches!(
            verify_submission(&sub, &other.public_pem().unwrap(), None),
            Err(AnchorError::InvalidSignature(_))
        ));
    }

    #[test]
    fn non_monotonic_timestamp_is_rejected() {
        let kp = EcdsaKeypair::generate();
        let pem = kp.public_pem().unwrap();
        let root = "ab".repeat(32);

        let make = |ts: &str| {
            let sig = kp.sign_hex(&anchor_message(&root, ts));
            AnchorSubmission {
                provider_id: "CP-A".into(),
                boot_addr: "cp-boot:5000".into(),
                root: root.clone(),
                ts: ts.to_string(),
                sig,
            }
        };

        let stored = AnchorInfo {
            root: root.clone(),
            ts: "2026-08-02T12:00:00Z".into(),
        };

        // Strictly after: accepted.
        assert!(verify_submission(&make("2026-08-02T12:00:01Z"), &pem, Some(&stored)).is_ok());
        // Equal: rejected (replay).
        assert!(matches!(
            verify_submission(&make("2026-08-02T12:00:00Z"), &pem, Some(&stored)),
            Err(AnchorError::StaleTimestamp(_))
        ));
        // Before: rejected.
        assert!(matches!(
            verify_submission(&make("2026-08-02T11:59:59Z"), &pem, Some(&stored)),
            Err(AnchorError::StaleTimestamp(_))
        ));
        // Garbage timestamp: rejected as malformed, not verified.
        assert!(matches!(
            verify_submission(&make("yesterday-ish"), &pem, Some(&stored)),
            Err(AnchorError::BadTimestamp(_))
        ));
    }

    #[test]
    fn registry_persists_and_rehydrates_anchors() {
        let store = ChainStore::open_temporary().unwrap();
        let registry = AnchorRegistry::load(store.clone()).unwrap();
        registry
            .put_anchor(
                "CP-A",
                AnchorInfo {
                    root: "r1".into(),
                    ts: "2026-08-02T00:00:00Z".into(),
                },
            )
            .unwrap();

        // A fresh registry over the same store sees the anchor.
        let reloaded = AnchorRegistry::load(store).unwrap();
        assert_eq!(reloaded.anchor("CP-A").unwrap().root, "r1");
        assert!(reloaded.anchor("CP-B").is_none());
    }

    #[test]
    fn provider_boot_changes_are_flagged_once() {
        let registry = AnchorRegistry::load(ChainStore::open_temporary().unwrap()).unwrap();
        assert!(registry.set_provider_boot("CP-A", "boot-1:5000"));
        assert!(!registry.set_provider_boot("CP-A", "boot-1:5000"));
        assert!(registry.set_provider_boot("CP-A", "boot-2:5000"));
        assert_eq!(registry.provider_boot("CP-A").unwrap(), "boot-2:5000");
    }

    #[test]
    fn search_finds_matches_with_verifying_proofs() {
        let entries = vec![
            record("rec-1", "Solaris"),
            record("rec-2", "Stalker"),
            record("rec-3", "Mirror"),
        ];
        let (store, block) = store_with_block(entries);

        let items = search_records(&store, "rec-2").unwrap();
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.record.record_id, "rec-2");
        assert_eq!(item.block_root, block.merkle_root);
        assert_eq!(item.latest_root, block.merkle_root);
        assert!(verify_merkle(&item.leaf, &item.proof, &item.block_root));

        // Keyword search through the info index, case-insensitively.
        let items = search_records(&store, "stalker").unwrap();
        assert_eq!(items[0].record.record_id, "rec-2");
    }

    #[test]
    fn search_misses_are_not_found() {
        let (store, _) = store_with_block(vec![record("rec-1", "Solaris")]);
        assert!(matches!(
            search_records(&store, "nope"),
            Err(AnchorError::NotFound(_))
        ));
    }

    #[test]
    fn query_verification_gates_on_anchor_root_then_proof() {
        let entries = vec![record("rec-1", "Solaris"), record("rec-2", "Stalker")];
        let (store, block) = store_with_block(entries);
        let items = search_records(&store, "rec-1").unwrap();

        // Anchor matches the provider's latest root: item passes.
        let verified = verify_search_items(&block.merkle_root, items.clone());
        assert_eq!(verified.len(), 1);

        // Upper holds an older anchor: empty result, not an error.
        let verified = verify_search_items("older-root", items.clone());
        assert!(verified.is_empty());

        // Tampered proof fails even with the right anchor.
        let mut tampered = items;
        tampered[0].leaf = "00".repeat(32);
        let verified = verify_search_items(&block.merkle_root, tampered);
        assert!(verified.is_empty());
    }

    #[test]
    fn record_proof_serves_the_indexed_entry() {
        let entries = vec![record("rec-1", "Solaris"), record("rec-2", "Stalker")];
        let (store, block) = store_with_block(entries);

        let (rec, blk, proof) = record_proof(&store, "rec-2").unwrap();
        assert_eq!(rec.record_id, "rec-2");
        assert_eq!(blk.index, block.index);
        assert!(verify_merkle(&blk.leaf_hashes[1], &proof, &blk.merkle_root));

        assert!(matches!(
            record_proof(&store, "rec-9"),
            Err(AnchorError::NotFound(_))
        ));
    }

    #[test]
    fn anchor_record_is_built_from_the_submission() {
        let kp = EcdsaKeypair::generate();
        let sub = build_submission(&kp, "CP-A", "cp-boot:5000", &"ab".repeat(32));
        let rec = to_anchor_record(&sub);
        assert_eq!(rec.provider_id, "CP-A");
        assert_eq!(rec.lower_root, sub.root);
        assert_eq!(rec.anchor_ts, sub.ts);
        assert_eq!(rec.contract_snapshot, ContractSnapshot::default());
    }
}
