//! # Consensus
//!
//! Two interchangeable finalizers seal blocks:
//!
//! - [`pow`] — network-wide mining races: every node searches nonces
//!   concurrently, the first valid hash wins and aborts everyone else.
//! - [`pbft`] — a designated leader proposes, peers vote in Prepare and
//!   Commit rounds, and a quorum of signatures becomes the block's
//!   finality evidence.
//!
//! Both plug into the ledger through the `EvidenceVerifier` capability;
//! the ledger re-verifies evidence on every append regardless of which
//! engine produced the block.

pub mod pbft;
pub mod pow;

pub use pbft::{quorum, BftStart, BftVote, PbftState, PbftVerifier, Phase};
pub use pow::{
    mine, BlockAnnouncement, DifficultyController, MineOutcome, MineStartRequest, MiningState,
    PowHeader, PowVerifier,
};

use thiserror::Error;

/// Why a block's finality evidence was rejected.
#[derive(Debug, Error)]
pub enum EvidenceError {
    /// The evidence shape does not match the active consensus mode.
    #[error("evidence kind does not match the active consensus mode")]
    WrongKind,

    /// PoW: the block hash does not carry the claimed number of leading
    /// hex zeros.
    #[error("block hash does not satisfy difficulty {difficulty}")]
    DifficultyNotMet { difficulty: u32 },

    /// PBFT: fewer distinct valid signers than the quorum requires.
    #[error("insufficient distinct valid signers: {have}/{need}")]
    InsufficientSigners { have: usize, need: usize },

    /// Genesis evidence offered above index 0.
    #[error("genesis evidence outside the genesis block")]
    UnexpectedGenesis,
}
