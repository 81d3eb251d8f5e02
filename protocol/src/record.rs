//! # Record Types
//!
//! The payloads committed into blocks on each tier.
//!
//! Lower-tier blocks carry [`ProviderRecord`]s — content or clinical
//! record metadata ingested by the provider. Upper-tier blocks carry
//! [`AnchorRecord`]s — signed Merkle-root commitments received from
//! provider chains. Both implement [`Entry`], which is all the ledger,
//! store, and consensus engines know about block payloads.
//!
//! A record is immutable once hashed into a block: its canonical JSON is
//! the leaf of the block's Merkle tree, so any later mutation would break
//! every proof over that block.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::crypto::{canonical_json, sha256_hex, CryptoError};

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// A block payload item: hashable into a Merkle leaf, indexable for
/// keyword search, and serializable for storage and the wire.
pub trait Entry: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static {
    /// Stable identifier used in logs and index pointers.
    fn entry_id(&self) -> &str;

    /// Store index keys this entry should be findable under, e.g.
    /// `cid_<record_id>` or `fp_<fingerprint>`. Each maps to a
    /// `"<blockIndex>:<entryIndex>"` pointer.
    fn index_keys(&self) -> Vec<String>;

    /// Exact-match keyword predicate used by the search path to pick the
    /// matching entries out of a candidate block.
    fn matches(&self, keyword: &str) -> bool;

    /// SHA-256 hex of the entry's canonical JSON — the Merkle leaf.
    fn leaf_hash(&self) -> Result<String, CryptoError> {
        Ok(sha256_hex(&canonical_json(self)?))
    }
}

// ---------------------------------------------------------------------------
// ProviderRecord (lower tier)
// ---------------------------------------------------------------------------

/// A single content/record entry on a provider chain.
///
/// `info` is an opaque metadata map (title, category, description, ...).
/// It participates in the canonical JSON deterministically — keys are
/// sorted at serialization time — so two nodes hashing the same record
/// always agree on the leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRecord {
    /// Provider-assigned unique identifier.
    pub record_id: String,

    /// Free-form metadata. Values are matched case-insensitively by
    /// keyword search and indexed as `info_<key>_<lower(value)>`.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub info: Map<String, Value>,

    /// Hex digest of the underlying content, the integrity claim this
    /// whole system exists to anchor.
    pub fingerprint: String,

    /// Where the content itself lives (URI, path, locator).
    pub storage_addr: String,

    /// Optional provenance trail carried along from ingest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<Value>,

    /// Ingest time, RFC 3339.
    pub timestamp: String,
}

impl Entry for ProviderRecord {
    fn entry_id(&self) -> &str {
        &self.record_id
    }

    fn index_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        if !self.record_id.is_empty() {
            keys.push(format!("cid_{}", self.record_id));
        }
        if !self.fingerprint.is_empty() {
            keys.push(format!("fp_{}", self.fingerprint));
        }
        for (k, v) in &self.info {
            let text = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let text = text.trim().to_string();
            if !text.is_empty() {
                keys.push(format!("info_{}_{}", k, text.to_lowercase()));
            }
        }
        keys
    }

    fn matches(&self, keyword: &str) -> bool {
        if self.record_id == keyword || self.fingerprint == keyword {
            return true;
        }
        self.info.values().any(|v| {
            let text = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            text.eq_ignore_ascii_case(keyword)
        })
    }
}

// ---------------------------------------------------------------------------
// AnchorRecord (upper tier)
// ---------------------------------------------------------------------------

/// Contract terms between a provider and the registry, snapshotted at
/// anchor time. Empty unless the submission carries one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContractSnapshot {
    /// Provider the contract binds.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provider_id: String,

    /// Contract expiry, RFC 3339.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub expiry_ts: String,

    /// Regions the provider may serve.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regions: Vec<String>,

    /// Record ids covered by the contract.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_record_ids: Vec<String>,

    /// Additional contract terms (version, conditions).
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub meta: std::collections::BTreeMap<String, String>,
}

/// A verified anchor from one provider chain, sealed into upper blocks.
///
/// Admitted to the upper pending pool only after its submission signature
/// verified against the provider boot's published key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorRecord {
    /// Provider chain identifier.
    pub provider_id: String,

    /// Contract state at anchor time.
    #[serde(default)]
    pub contract_snapshot: ContractSnapshot,

    /// The provider chain's latest Merkle root — the commitment being
    /// anchored.
    pub lower_root: String,

    /// Record ids the registry currently exposes for this provider.
    #[serde(default)]
    pub access_catalog: Vec<String>,

    /// Submission timestamp, RFC 3339. Strictly increasing per provider.
    pub anchor_ts: String,
}

impl Entry for AnchorRecord {
    fn entry_id(&self) -> &str {
        &self.provider_id
    }

    fn index_keys(&self) -> Vec<String> {
        vec![format!("provider_{}", self.provider_id)]
    }

    fn matches(&self, keyword: &str) -> bool {
        self.provider_id == keyword || self.lower_root == keyword
    }
}
