//! # PBFT
//!
//! View-based three-phase finality: the boot node is the leader, views
//! are keyed by the height they try to fill, and every phase advance is
//! driven by signature collection.
//!
//! ```text
//! Idle -> PrePrepare -> Prepare -> Commit -> Finalized
//! ```
//!
//! The leader drains pending, proposes a candidate block on `/bft/start`,
//! and seeds its own signature into the Prepare collector. Peers validate
//! the candidate, sign its hash, and broadcast `/bft/prepare`; at quorum
//! they sign again into `/bft/commit`; at commit quorum the signatures
//! become the block's evidence and the append pipeline runs.
//!
//! At most one view is active at a time (a global gate), and a view that
//! stalls past its timeout is reset to Idle so the leader can re-propose —
//! the one liveness gap this design inherits and patches.
//!
//! Vote collectors deduplicate by sender address; signatures are ECDSA
//! over the block hash and verified against the key registry both at
//! collection time and again at append time.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::block::{Block, Evidence};
use crate::crypto::verify_signature;
use crate::ledger::EvidenceVerifier;
use crate::peers::PeerSet;

use super::EvidenceError;

// ---------------------------------------------------------------------------
// Quorum
// ---------------------------------------------------------------------------

/// PBFT quorum for a node with `peer_count` known peers:
/// `n = peers + 1` (self included), `f = (n - 1) / 3`, quorum `2f + 1`.
pub fn quorum(peer_count: usize) -> usize {
    let n = peer_count + 1;
    let f = (n - 1) / 3;
    2 * f + 1
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Body of `/bft/start`: the leader's proposal for a view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BftStart<E> {
    pub view: u64,
    pub block: Block<E>,
}

/// Body of `/bft/prepare` and `/bft/commit`: one node's signature over
/// the proposed block's hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BftVote {
    pub view: u64,
    pub addr: String,
    pub sig: String,
    pub hash: String,
}

// ---------------------------------------------------------------------------
// View state
// ---------------------------------------------------------------------------

/// Phases of one view's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    PrePrepare,
    Prepare,
    Commit,
    Finalized,
}

/// Deduplicating signature collector for one phase of one view.
#[derive(Debug, Default)]
pub struct VoteCollector {
    votes: BTreeMap<String, String>,
}

impl VoteCollector {
    /// Record a vote. Returns `false` for a repeat sender.
    pub fn add(&mut self, addr: &str, sig: &str) -> bool {
        if self.votes.contains_key(addr) {
            return false;
        }
        self.votes.insert(addr.to_string(), sig.to_string());
        true
    }

    pub fn count(&self) -> usize {
        self.votes.len()
    }

    /// All collected signatures, ordered by voter address so every node
    /// attaches the same evidence list.
    pub fn signatures(&self) -> Vec<String> {
        self.votes.values().cloned().collect()
    }
}

/// Mutable state of a single view.
pub struct ViewState {
    pub phase: Phase,
    /// Hash of the block this view is voting on; empty until PrePrepare
    /// lands.
    pub block_hash: String,
    pub prepare: VoteCollector,
    pub commit: VoteCollector,
    started: Instant,
}

impl ViewState {
    fn new() -> Self {
        Self {
            phase: Phase::Idle,
            block_hash: String::new(),
            prepare: VoteCollector::default(),
            commit: VoteCollector::default(),
            started: Instant::now(),
        }
    }

    /// Restart the view's stall clock. Called when the view leaves Idle.
    pub fn mark_started(&mut self) {
        self.started = Instant::now();
    }

    fn stalled(&self, timeout: Duration) -> bool {
        !matches!(self.phase, Phase::Idle | Phase::Finalized) && self.started.elapsed() > timeout
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// All live views plus the single-active-view gate.
pub struct PbftState {
    views: Mutex<HashMap<u64, Arc<Mutex<ViewState>>>>,
    in_progress: AtomicBool,
}

impl PbftState {
    pub fn new() -> Self {
        Self {
            views: Mutex::new(HashMap::new()),
            in_progress: AtomicBool::new(false),
        }
    }

    /// Get or create the state for a view.
    pub fn view(&self, view: u64) -> Arc<Mutex<ViewState>> {
        self.views
            .lock()
            .entry(view)
            .or_insert_with(|| Arc::new(Mutex::new(ViewState::new())))
            .clone()
    }

    /// Drop a finalized (or abandoned) view.
    pub fn clear_view(&self, view: u64) {
        self.views.lock().remove(&view);
    }

    /// Claim the global consensus gate. Returns `false` when another view
    /// is already active.
    pub fn try_begin(&self) -> bool {
        self.in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Mark consensus active without contending for the gate. Followers
    /// call this when a leader proposal moves a view out of Idle.
    pub fn begin(&self) {
        self.in_progress.store(true, Ordering::Release);
    }

    /// Release the gate after finalization or abandonment.
    pub fn end(&self) {
        self.in_progress.store(false, Ordering::Release);
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Reset views that have been stuck in a voting phase longer than
    /// `timeout`. Releases the gate when anything was reset so the leader
    /// can re-propose. Returns the expired view numbers.
    pub fn expire_stalled(&self, timeout: Duration) -> Vec<u64> {
        let mut expired = Vec::new();
        let mut views = self.views.lock();
        views.retain(|view, state| {
            let stalled = state.lock().stalled(timeout);
            if stalled {
                warn!(view, "view stalled; resetting to idle");
                expired.push(*view);
            }
            !stalled
        });
        drop(views);
        if !expired.is_empty() {
            self.end();
        }
        expired
    }
}

impl Default for PbftState {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Evidence verifier
// ---------------------------------------------------------------------------

/// Ledger-side PBFT evidence check: at least a quorum of distinct valid
/// signers over the block hash, matched against the key registry (peers
/// and self alike).
pub struct PbftVerifier {
    peers: Arc<PeerSet>,
}

impl PbftVerifier {
    pub fn new(peers: Arc<PeerSet>) -> Self {
        Self { peers }
    }
}

impl EvidenceVerifier for PbftVerifier {
    fn verify(&self, block_hash: &str, evidence: &Evidence) -> Result<(), EvidenceError> {
        let signatures = match evidence {
            Evidence::Pbft { signatures, .. } => signatures,
            Evidence::Genesis => return Err(EvidenceError::UnexpectedGenesis),
            Evidence::Pow { .. } => return Err(EvidenceError::WrongKind),
        };

        let need = quorum(self.peers.len());
        let keys = self.peers.keys_snapshot();
        let mut used: HashSet<&String> = HashSet::new();
        let mut valid = 0usize;

        for sig in signatures {
            for (addr, pem) in &keys {
                if used.contains(addr) {
                    continue;
                }
                if verify_signature(pem, block_hash.as_bytes(), sig) {
                    used.insert(addr);
                    valid += 1;
                    break;
                }
            }
        }

        if valid >= need {
            info!(valid, need, "consensus evidence verified");
            Ok(())
        } else {
            Err(EvidenceError::InsufficientSigners { have: valid, need })
        }
    }
}
