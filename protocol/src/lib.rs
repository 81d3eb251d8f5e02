// Copyright (c) 2026 Strata Contributors. MIT License.
// See LICENSE for details.

//! # Strata Protocol — Core Library
//!
//! Strata is a two-tier hierarchical blockchain for anchoring content and
//! record provenance across provider domains. Many independent lower
//! chains — one per provider — seal blocks of records and expose a signed
//! Merkle root; a single upper chain aggregates those roots into blocks
//! of anchors and verifies cross-chain queries against them. Trust flows
//! upward as signatures and downward as Merkle proofs.
//!
//! ## Architecture
//!
//! The modules mirror the actual concerns of a federated provenance
//! network:
//!
//! - **crypto** — Canonical JSON, SHA-256, Merkle trees, ECDSA P-256.
//!   The canonicalization rule lives in exactly one place on purpose.
//! - **record** — The payload types both tiers commit to blocks.
//! - **block** — One generic block with a closed finality-evidence type.
//! - **storage** — sled-backed chain store with atomic block appends.
//! - **ledger** — Chain invariants, the append pipeline, the pending pool.
//! - **consensus** — Two interchangeable finalizers: PoW mining races and
//!   PBFT three-phase voting.
//! - **peers** — Membership, liveness accounting, boot election.
//! - **anchor** — The lower→upper bridge: signed root submission,
//!   verification, and the verified query path.
//! - **net** — Outbound HTTP with timeouts and fire-and-forget fan-out.
//! - **node** — The per-node orchestration the HTTP gateway drives.
//! - **config** — Every protocol constant, in one place.
//!
//! ## Design Philosophy
//!
//! 1. Digests are recomputed, never trusted from the wire.
//! 2. One canonical serialization site; divergence breaks cross-chain
//!    proofs silently, so there is nothing to diverge.
//! 3. Evidence verification runs at append time on every node, no matter
//!    which engine produced the block.

pub mod anchor;
pub mod block;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod ledger;
pub mod net;
pub mod node;
pub mod peers;
pub mod record;
pub mod storage;

pub use anchor::{AnchorError, AnchorRegistry, AnchorSubmission, SearchItem};
pub use block::{Block, Evidence};
pub use ledger::{Ledger, LedgerError};
pub use node::{ConsensusMode, LowerNode, Node, NodeConfig, NodeError, UpperNode};
pub use record::{AnchorRecord, ContractSnapshot, Entry, ProviderRecord};
pub use storage::{AnchorInfo, ChainStore, StoreError};
