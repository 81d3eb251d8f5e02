//! # Proof of Work
//!
//! Race-based finality: a mining round begins when any node notices
//! pending entries and posts `/mine/start` to the whole network. Every
//! node then searches nonces over the same header; the first to find a
//! hash with `difficulty` leading hex zeros broadcasts the block on
//! `/receiveBlock` and everyone else aborts.
//!
//! ## Cancellation
//!
//! The mining state is a single enum — `Idle` or `Running` with a stop
//! flag — behind a mutex. The stop flag is the sole cancellation channel:
//! the nonce loop polls it every iteration, a received valid block raises
//! it, and a drop-duplicate delivery leaves it alone (a block for an
//! index we already have must not stop the search for the next one).
//!
//! ## Difficulty
//!
//! Adjusted over a window of three sealed blocks against a 20-second
//! target; the winner's broadcast carries its difficulty and receivers
//! adopt the value on acceptance, clamped to the configured bounds.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::block::{hash_meets_difficulty, Block, Evidence};
use crate::config::{
    DIFFICULTY_CEILING, DIFFICULTY_FLOOR, DIFFICULTY_LOWER_RATIO, DIFFICULTY_RAISE_RATIO,
    DIFFICULTY_WINDOW, MINING_NONCE_JITTER, TARGET_BLOCK_SECS,
};
use crate::crypto::{canonical_json, sha256_hex, CryptoError};
use crate::ledger::EvidenceVerifier;
use crate::record::Entry;

use super::EvidenceError;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// The header fields a miner iterates over. Its canonical JSON is exactly
/// the block's header subset, so the hash found here IS the block hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowHeader {
    pub index: u64,
    pub chain_id: String,
    pub prev_hash: String,
    pub timestamp: String,
    pub merkle_root: String,
    pub difficulty: u32,
    pub nonce: u64,
}

/// Body of `/mine/start`: the pending entries for this round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MineStartRequest<E> {
    pub entries: Vec<E>,
}

/// Body of `/receiveBlock`: the winner's sealed block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockAnnouncement<E> {
    pub header: PowHeader,
    pub hash: String,
    pub entries: Vec<E>,
    pub difficulty: u32,
    pub elapsed: f32,
    pub winner: String,
}

impl<E: Entry> BlockAnnouncement<E> {
    /// Reassemble the announced block. The ledger recomputes and checks
    /// every digest on append; this only restores the shape.
    pub fn into_block(self) -> Result<Block<E>, CryptoError> {
        let leaf_hashes = self
            .entries
            .iter()
            .map(Entry::leaf_hash)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Block {
            index: self.header.index,
            chain_id: self.header.chain_id,
            prev_hash: self.header.prev_hash,
            timestamp: self.header.timestamp,
            entries: self.entries,
            leaf_hashes,
            merkle_root: self.header.merkle_root,
            evidence: Evidence::Pow {
                nonce: self.header.nonce,
                difficulty: self.header.difficulty,
                elapsed: self.elapsed,
            },
            block_hash: self.hash,
        })
    }
}

// ---------------------------------------------------------------------------
// Mining state
// ---------------------------------------------------------------------------

enum MiningPhase {
    Idle,
    Running { stop: Arc<AtomicBool> },
}

/// The node's mining gate. At most one nonce search runs at a time.
pub struct MiningState {
    phase: Mutex<MiningPhase>,
}

impl MiningState {
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(MiningPhase::Idle),
        }
    }

    /// Transition Idle → Running and hand back the stop flag for the new
    /// search. Returns `None` when a search is already running — the
    /// caller cancels its round, it does not queue.
    pub fn try_begin(&self) -> Option<Arc<AtomicBool>> {
        let mut phase = self.phase.lock();
        match *phase {
            MiningPhase::Running { .. } => None,
            MiningPhase::Idle => {
                let stop = Arc::new(AtomicBool::new(false));
                *phase = MiningPhase::Running { stop: stop.clone() };
                Some(stop)
            }
        }
    }

    /// Request cooperative abort of the running search, if any.
    pub fn abort(&self) {
        if let MiningPhase::Running { stop } = &*self.phase.lock() {
            stop.store(true, Ordering::Relaxed);
        }
    }

    /// Return to Idle after a search ends (won, lost, or aborted).
    pub fn finish(&self) {
        *self.phase.lock() = MiningPhase::Idle;
    }

    pub fn is_mining(&self) -> bool {
        matches!(*self.phase.lock(), MiningPhase::Running { .. })
    }
}

impl Default for MiningState {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Nonce search
// ---------------------------------------------------------------------------

/// A successful mining result: the winning header, its hash, and how long
/// the search took.
#[derive(Debug, Clone)]
pub struct MineOutcome {
    pub header: PowHeader,
    pub hash: String,
    pub elapsed: f32,
}

/// Search nonces for `header` until the hash satisfies its difficulty or
/// `stop` is raised. Returns `None` on abort.
///
/// The starting nonce is randomized so concurrent miners explore
/// different trajectories instead of racing through identical ones.
pub fn mine(mut header: PowHeader, stop: &AtomicBool) -> Option<MineOutcome> {
    let started = Instant::now();
    let mut nonce = rand::thread_rng().gen_range(0..MINING_NONCE_JITTER);

    loop {
        if stop.load(Ordering::Relaxed) {
            debug!(index = header.index, "mining aborted");
            return None;
        }
        header.nonce = nonce;
        let Ok(bytes) = canonical_json(&header) else {
            warn!("mining header not serializable; aborting search");
            return None;
        };
        let hash = sha256_hex(&bytes);
        if hash_meets_difficulty(&hash, header.difficulty) {
            let elapsed = started.elapsed().as_secs_f32();
            info!(
                index = header.index,
                nonce,
                elapsed,
                hash = %hash,
                "mining succeeded"
            );
            return Some(MineOutcome {
                header,
                hash,
                elapsed,
            });
        }
        nonce = nonce.wrapping_add(1);
    }
}

// ---------------------------------------------------------------------------
// Difficulty controller
// ---------------------------------------------------------------------------

/// Tracks recent block times and retargets difficulty.
pub struct DifficultyController {
    difficulty: AtomicU32,
    window: Mutex<VecDeque<f32>>,
}

impl DifficultyController {
    pub fn new(initial: u32) -> Self {
        Self {
            difficulty: AtomicU32::new(initial.clamp(DIFFICULTY_FLOOR, DIFFICULTY_CEILING)),
            window: Mutex::new(VecDeque::with_capacity(DIFFICULTY_WINDOW)),
        }
    }

    /// The difficulty new rounds mine at.
    pub fn current(&self) -> u32 {
        self.difficulty.load(Ordering::Relaxed)
    }

    /// Feed one sealed block's mining time. Every `DIFFICULTY_WINDOW`
    /// samples the average is compared against the target and difficulty
    /// steps by at most one.
    pub fn record_block_time(&self, elapsed: f32) {
        let mut window = self.window.lock();
        window.push_back(elapsed);
        if window.len() < DIFFICULTY_WINDOW {
            return;
        }
        let avg: f32 = window.iter().sum::<f32>() / window.len() as f32;
        window.clear();
        drop(window);

        let ratio = avg / TARGET_BLOCK_SECS;
        let current = self.current();
        let next = if ratio < DIFFICULTY_RAISE_RATIO {
            (current + 1).min(DIFFICULTY_CEILING)
        } else if ratio > DIFFICULTY_LOWER_RATIO {
            current.saturating_sub(1).max(DIFFICULTY_FLOOR)
        } else {
            current
        };
        if next != current {
            info!(avg, ratio, from = current, to = next, "difficulty retargeted");
            self.difficulty.store(next, Ordering::Relaxed);
        }
    }

    /// Adopt a difficulty carried by an accepted foreign block. Values
    /// outside the configured bounds are ignored — a cooperative network
    /// never produces them, so whatever did is not worth following.
    pub fn adopt(&self, foreign: u32) {
        if (DIFFICULTY_FLOOR..=DIFFICULTY_CEILING).contains(&foreign) {
            let current = self.difficulty.swap(foreign, Ordering::Relaxed);
            if current != foreign {
                info!(from = current, to = foreign, "adopted difficulty from accepted block");
            }
        } else {
            warn!(foreign, "ignoring out-of-range foreign difficulty");
        }
    }
}

// ---------------------------------------------------------------------------
// Evidence verifier
// ---------------------------------------------------------------------------

/// Ledger-side PoW evidence check: the block hash must carry the claimed
/// number of leading hex zeros.
pub struct PowVerifier;

impl EvidenceVerifier for PowVerifier {
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
            Evidence::Genesis => Err(EvidenceError::UnexpectedGenesis),
            Evidence::Pbft { .. } => Err(EvidenceError::WrongKind),
        }
    }
}
