//! # Peerage
//!
//! The peer set, the public-key registry, liveness accounting, and boot
//! election.
//!
//! A node keeps an ordered list of peer addresses (never including
//! itself) and a key registry mapping addresses — its own included — to
//! PEM public keys. The two structures have separate locks; every path
//! that touches both acquires the peer list first, then the registry,
//! so registration and removal cannot deadlock.
//!
//! ## Election
//!
//! When the boot dies, survivors probe everyone (peers ∪ self), keep the
//! live responses, and crown the node with the greatest height — ties
//! broken by the lexicographically smallest address, so every survivor
//! computes the same winner without another message exchange. A node
//! that sees no live peers at all promotes itself.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Status probe payload
// ---------------------------------------------------------------------------

/// A node's `/status` response, as consumed by probes and elections.
///
/// `height` is `-1` while a chain is empty, matching the on-wire
/// convention every tier uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerStatus {
    pub addr: String,
    pub height: i64,
    pub is_boot: bool,
    #[serde(default)]
    pub boot_addr: String,
    #[serde(default)]
    pub started_at: String,
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default)]
    pub last_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<u32>,
}

// ---------------------------------------------------------------------------
// PeerSet
// ---------------------------------------------------------------------------

/// Shared peer membership state: ordered addresses plus the key registry.
pub struct PeerSet {
    /// Ordered peer addresses, excluding this node.
    peers: RwLock<Vec<String>>,
    /// Public key PEM per address, including this node's own.
    keys: DashMap<String, String>,
    /// Consecutive failed probes per address.
    failures: DashMap<String, u32>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(Vec::new()),
            keys: DashMap::new(),
            failures: DashMap::new(),
        }
    }

    /// Add a peer and its public key. Returns `false` when the address
    /// was already present (the key is refreshed either way).
    pub fn add(&self, addr: &str, public_key_pem: &str) -> bool {
        if addr.is_empty() {
            return false;
        }
        let mut peers = self.peers.write();
        let added = if peers.iter().any(|p| p == addr) {
            false
        } else {
            peers.push(addr.to_string());
            true
        };
        // Lock order: peers (held) then keys.
        self.keys.insert(addr.to_string(), public_key_pem.to_string());
        drop(peers);
        self.failures.remove(addr);
        if added {
            info!(peer = addr, total = self.len(), "peer added");
        } else {
            debug!(peer = addr, "peer already known; key refreshed");
        }
        added
    }

    /// Register a key without adding the address to the peer list. Used
    /// for this node's own key so quorum verification can match its
    /// signatures.
    pub fn register_key(&self, addr: &str, public_key_pem: &str) {
        self.keys.insert(addr.to_string(), public_key_pem.to_string());
    }

    /// Drop a peer from the list, the key registry, and the failure map.
    pub fn remove(&self, addr: &str) {
        let mut peers = self.peers.write();
        peers.retain(|p| p != addr);
        self.keys.remove(addr);
        drop(peers);
        self.failures.remove(addr);
        info!(peer = addr, total = self.len(), "peer removed");
    }

    /// A copy of the current peer list.
    pub fn snapshot(&self) -> Vec<String> {
        self.peers.read().clone()
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.peers.read().iter().any(|p| p == addr)
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// The registered public key for an address, self included.
    pub fn key_of(&self, addr: &str) -> Option<String> {
        self.keys.get(addr).map(|k| k.value().clone())
    }

    /// All registered keys, ordered by address. This is the `peer_keys`
    /// map a joining node receives from `/register`.
    pub fn keys_snapshot(&self) -> BTreeMap<String, String> {
        self.keys
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Record a probe result and return the consecutive failure count
    /// (0 after a success).
    pub fn record_probe(&self, addr: &str, ok: bool) -> u32 {
        if ok {
            self.failures.remove(addr);
            0
        } else {
            let mut entry = self.failures.entry(addr.to_string()).or_insert(0);
            *entry += 1;
            *entry
        }
    }
}

impl Default for PeerSet {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Boot cell
// ---------------------------------------------------------------------------

/// The node's view of "who is boot right now": many readers, rare
/// writers (join, election, boot notifications).
pub struct BootCell {
    addr: RwLock<String>,
    is_boot: AtomicBool,
}

impl BootCell {
    pub fn new(addr: &str, is_boot: bool) -> Self {
        Self {
            addr: RwLock::new(addr.to_string()),
            is_boot: AtomicBool::new(is_boot),
        }
    }

    pub fn addr(&self) -> String {
        self.addr.read().clone()
    }

    pub fn is_boot(&self) -> bool {
        self.is_boot.load(Ordering::Relaxed)
    }

    /// Adopt a new boot address; `self_addr` decides whether that means
    /// this node just became (or stopped being) boot.
    pub fn set(&self, new_boot: &str, self_addr: &str) {
        *self.addr.write() = new_boot.to_string();
        self.is_boot.store(new_boot == self_addr, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Election
// ---------------------------------------------------------------------------

/// Pick the boot from live statuses: maximum height first, then the
/// lexicographically smallest address. Returns `None` for an empty slate
/// (the caller self-promotes).
pub fn pick_boot(live: &[PeerStatus]) -> Option<&PeerStatus> {
    live.iter().reduce(|best, candidate| {
        if candidate.height > best.height
            || (candidate.height == best.height && candidate.addr < best.addr)
        {
            candidate
        } else {
            best
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(addr: &str, height: i64) -> PeerStatus {
        PeerStatus {
            addr: addr.to_string(),
            height,
            is_boot: false,
            boot_addr: String::new(),
            started_at: String::new(),
            peers: vec![],
            last_hash: String::new(),
            difficulty: None,
        }
    }

    #[test]
    fn add_dedupes_and_refreshes_keys() {
        let set = PeerSet::new();
        assert!(set.add("node-2:5000", "pem-a"));
        assert!(!set.add("node-2:5000", "pem-b"));
        assert_eq!(set.len(), 1);
        assert_eq!(set.key_of("node-2:5000").unwrap(), "pem-b");
    }

    #[test]
    fn remove_clears_key_and_failures() {
        let set = PeerSet::new();
        set.add("node-2:5000", "pem");
        set.record_probe("node-2:5000", false);
        set.remove("node-2:5000");
        assert!(set.is_empty());
        assert!(set.key_of("node-2:5000").is_none());
        // Failure count starts over if the peer returns.
        assert_eq!(set.record_probe("node-2:5000", false), 1);
    }

    #[test]
    fn self_key_is_registered_without_joining_the_peer_list() {
        let set = PeerSet::new();
        set.register_key("self:5000", "self-pem");
        assert!(set.is_empty());
        assert_eq!(set.key_of("self:5000").unwrap(), "self-pem");
        assert!(set.keys_snapshot().contains_key("self:5000"));
    }

    #[test]
    fn consecutive_failures_accumulate_and_reset() {
        let set = PeerSet::new();
        set.add("node-2:5000", "pem");
        assert_eq!(set.record_probe("node-2:5000", false), 1);
        assert_eq!(set.record_probe("node-2:5000", false), 2);
        assert_eq!(set.record_probe("node-2:5000", true), 0);
        assert_eq!(set.record_probe("node-2:5000", false), 1);
    }

    #[test]
    fn election_prefers_height_then_smallest_address() {
        let live = vec![
            status("node-c:5000", 4),
            status("node-a:5000", 7),
            status("node-b:5000", 7),
        ];
        assert_eq!(pick_boot(&live).unwrap().addr, "node-a:5000");

        let live = vec![status("node-z:5000", 9), status("node-a:5000", 3)];
        assert_eq!(pick_boot(&live).unwrap().addr, "node-z:5000");

        assert!(pick_boot(&[]).is_none());
    }

    #[test]
    fn empty_chains_lose_to_any_height() {
        let live = vec![status("node-a:5000", -1), status("node-b:5000", 0)];
        assert_eq!(pick_boot(&live).unwrap().addr, "node-b:5000");
    }

    #[test]
    fn boot_cell_tracks_self_promotion() {
        let cell = BootCell::new("boot:5000", false);
        assert!(!cell.is_boot());
        cell.set("me:5000", "me:5000");
        assert!(cell.is_boot());
        assert_eq!(cell.addr(), "me:5000");
        cell.set("other:5000", "me:5000");
        assert!(!cell.is_boot());
    }

    #[test]
    fn status_difficulty_is_omitted_when_absent() {
        let s = status("node-a:5000", 2);
        let json = serde_json::to_string(&s).unwrap();
        assert!(!json.contains("difficulty"));

        let with = PeerStatus {
            difficulty: Some(4),
            ..s
        };
        assert!(serde_json::to_string(&with).unwrap().contains("\"difficulty\":4"));
    }
}
