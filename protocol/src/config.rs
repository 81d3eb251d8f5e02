//! # Protocol Configuration & Constants
//!
//! Every magic number in Strata lives here. Watcher cadences, difficulty
//! bounds, quorum timing, genesis constants — if a value shapes consensus
//! or the network protocol, this is its one home.
//!
//! Changing any of the consensus-relevant values (difficulty bounds,
//! genesis constants, the header hash rule implied by them) after a chain
//! has produced blocks will split the network. Watcher cadences and HTTP
//! timeouts are operational and safe to tune.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Genesis
// ---------------------------------------------------------------------------

/// Fixed genesis timestamp. Every node constructs the same genesis block
/// for a given chain id, so this must never depend on wall-clock time.
pub const GENESIS_TIMESTAMP: &str = "1970-01-01T00:00:00Z";

/// The previous-hash field of the genesis block: 64 hex zeros.
pub const GENESIS_PREV_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

// ---------------------------------------------------------------------------
// Proof of Work
// ---------------------------------------------------------------------------

/// Starting difficulty for a fresh chain: the block hash must begin with
/// this many hex zeros.
pub const INITIAL_DIFFICULTY: u32 = 4;

/// Difficulty never drops below this.
pub const DIFFICULTY_FLOOR: u32 = 1;

/// Difficulty never rises above this. Eight leading zeros is already
/// multi-minute territory on a single core; anything beyond is a config
/// mistake, not a security posture.
pub const DIFFICULTY_CEILING: u32 = 8;

/// Number of recent block times averaged when adjusting difficulty.
pub const DIFFICULTY_WINDOW: usize = 3;

/// Target seconds between mined blocks.
pub const TARGET_BLOCK_SECS: f32 = 20.0;

/// Blocks arriving faster than this ratio of target raise difficulty.
pub const DIFFICULTY_RAISE_RATIO: f32 = 0.85;

/// Blocks arriving slower than this ratio of target lower difficulty.
pub const DIFFICULTY_LOWER_RATIO: f32 = 1.25;

/// Upper bound for the randomized starting nonce. Randomizing the start
/// keeps concurrent miners from exploring the same nonce trajectory.
pub const MINING_NONCE_JITTER: u64 = 5_000;

/// How often the mining watcher checks for pending entries and, when the
/// node is idle, triggers a network-wide mining round.
pub const MINING_WATCHER_INTERVAL: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// PBFT
// ---------------------------------------------------------------------------

/// How often the PBFT leader checks the pending pool for a new proposal.
pub const PBFT_WATCHER_INTERVAL: Duration = Duration::from_secs(1);

/// A view that has not finalized within this window is reset to Idle so
/// the leader can re-propose. The corpus this protocol derives from had no
/// view-change at all; a stalled view was unrecoverable without operator
/// action.
pub const PBFT_VIEW_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Peerage
// ---------------------------------------------------------------------------

/// Liveness probe cadence for the network watcher.
pub const NETWORK_WATCHER_INTERVAL: Duration = Duration::from_secs(60);

/// Consecutive failed probes before a peer is declared dead and removed.
pub const PEER_FAILURE_THRESHOLD: u32 = 3;

/// Fork/outdated reconciliation cadence for the chain watcher.
pub const CHAIN_WATCHER_INTERVAL: Duration = Duration::from_secs(300);

/// Page size used when pulling a remote chain during resync.
pub const SYNC_PAGE_LIMIT: u64 = 256;

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// Per-call timeout for status probes, sync pages, key fetches, and
/// broadcast fan-out. Bounds watcher latency when a peer is unreachable.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Default limit for `/blocks` pagination when the caller omits one.
pub const DEFAULT_BLOCKS_LIMIT: u64 = 50;

// ---------------------------------------------------------------------------
// Environment variables
// ---------------------------------------------------------------------------

/// This node's externally reachable address, e.g. `cp-node-01:5000`.
pub const ENV_NODE_ADDR: &str = "NODE_ADDR";

/// Address of the boot node to join on startup. Empty for the boot itself.
pub const ENV_BOOTSTRAP_ADDR: &str = "BOOTSTRAP_ADDR";

/// HTTP listener port.
pub const ENV_PORT: &str = "PORT";

/// Filesystem path of the sled database directory.
pub const ENV_DB_PATH: &str = "DB_PATH";

/// Chain identifier (provider id for lower chains, registry id for the
/// upper chain). Stored in genesis and enforced at `/register`.
pub const ENV_CHAIN_ID: &str = "CHAIN_ID";

/// Upper-tier boot address a lower chain submits anchors to.
pub const ENV_UPPER_BOOTSTRAP_ADDR: &str = "UPPER_BOOTSTRAP_ADDR";

/// Default listener port when neither `--port` nor `PORT` is given.
pub const DEFAULT_PORT: u16 = 5000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn difficulty_bounds_are_ordered() {
        assert!(DIFFICULTY_FLOOR <= INITIAL_DIFFICULTY);
        assert!(INITIAL_DIFFICULTY <= DIFFICULTY_CEILING);
    }

    #[test]
    fn adjustment_ratios_bracket_one() {
        // The dead zone must exist, otherwise difficulty oscillates on
        // every single block.
        assert!(DIFFICULTY_RAISE_RATIO < 1.0);
        assert!(DIFFICULTY_LOWER_RATIO > 1.0);
    }

    #[test]
    fn genesis_prev_hash_is_64_zeros() {
        assert_eq!(GENESIS_PREV_HASH.len(), 64);
        assert!(GENESIS_PREV_HASH.chars().all(|c| c == '0'));
    }

    #[test]
    fn view_timeout_outlasts_watcher_tick() {
        assert!(PBFT_VIEW_TIMEOUT > PBFT_WATCHER_INTERVAL);
    }
}
