//! # Node
//!
//! [`Node<E>`] is the one value threaded through every request handler:
//! identity, ledger, peer set, boot cell, HTTP client, and the handles of
//! whichever consensus engine is active. There is no global mutable
//! state — the gateway clones an `Arc<Node<E>>` and every protocol
//! operation lives here as a method.
//!
//! Tier-specific behavior wraps the generic core:
//!
//! - [`LowerNode`] adds the upper-boot target and the anchor submitter
//!   that signs and ships each sealed block's root.
//! - [`UpperNode`] adds the anchor registry, submission verification, and
//!   the verified query route.
//!
//! Watcher loops (mining trigger, PBFT proposer, liveness sweep, chain
//! reconciliation) are spawned from the tier wrappers so election wins
//! can run their cross-tier notifications.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::anchor::{
    build_submission, ensure_keypair, to_anchor_record, verify_search_items, verify_submission,
    AnchorError, AnchorRegistry, AnchorSubmission, SearchItem,
};
use crate::block::{hash_meets_difficulty, Block, Evidence};
use crate::config::{
    CHAIN_WATCHER_INTERVAL, INITIAL_DIFFICULTY, MINING_WATCHER_INTERVAL, NETWORK_WATCHER_INTERVAL,
    PBFT_VIEW_TIMEOUT, PBFT_WATCHER_INTERVAL, PEER_FAILURE_THRESHOLD, SYNC_PAGE_LIMIT,
};
use crate::consensus::{
    mine, quorum, BftStart, BftVote, BlockAnnouncement, DifficultyController, MiningState,
    PbftState, PbftVerifier, Phase, PowHeader, PowVerifier,
};
use crate::crypto::{verify_signature, CryptoError, EcdsaKeypair};
use crate::ledger::{EvidenceVerifier, Ledger, LedgerError};
use crate::net::{NetClient, NetError};
use crate::peers::{pick_boot, BootCell, PeerSet, PeerStatus};
use crate::record::{AnchorRecord, Entry, ProviderRecord};
use crate::storage::{AnchorInfo, ChainStore};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced to the gateway. The HTTP layer maps each class to a
/// status code.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Join attempt from a foreign chain.
    #[error("chain_id mismatch")]
    ChainIdMismatch,

    /// A consensus endpoint was hit while the other engine is active.
    #[error("consensus mode not active for this request")]
    WrongMode,

    /// A claimed boot address did not answer its status probe.
    #[error("boot {0} not reachable")]
    BootUnreachable(String),

    /// The local chain has no tip yet; the operation needs one.
    #[error("local chain not initialized")]
    NotInitialized,

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Anchor(#[from] AnchorError),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Body of `/register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub chain_id: String,
    pub addr: String,
    pub pub_key: String,
}

/// Reply to `/register`: the membership a joiner adopts wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub peers: Vec<String>,
    pub peer_keys: std::collections::BTreeMap<String, String>,
}

/// Body of `/addPeer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddPeerRequest {
    pub addr: String,
    pub pub_key: String,
}

/// Body of `/bootNotify` and `/upperBootNotify`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootNotify {
    pub addr: String,
}

/// Body of `/providerBootNotify`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderBootNotify {
    pub provider_id: String,
    pub boot_addr: String,
}

/// A page of `/blocks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlocksPage<E> {
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
    pub items: Vec<Block<E>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<u32>,
}

/// What a liveness sweep's election (if any) decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// No election ran, or the boot did not change.
    NoChange,
    /// This node won and is now boot.
    SelfPromoted,
    /// Another node was recognized as the new boot.
    NewBoot(String),
}

/// Which finalizer this network runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusMode {
    Pow,
    Pbft,
}

/// Startup parameters for a node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's externally reachable address.
    pub addr: String,
    /// Chain identifier (provider id or registry id).
    pub chain_id: String,
    pub mode: ConsensusMode,
    /// Whether this node starts as the network's boot.
    pub is_boot: bool,
    /// The boot to join when not boot itself. Empty for the boot.
    pub bootstrap_addr: String,
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// The node's signing identity and address.
pub struct NodeIdentity {
    pub addr: String,
    pub keypair: EcdsaKeypair,
    pub public_pem: String,
}

/// Everything one chain-tier node knows, threaded through all handlers.
pub struct Node<E: Entry> {
    pub identity: NodeIdentity,
    pub mode: ConsensusMode,
    /// The chain id this node was configured with; the persisted genesis
    /// overrides it once one exists.
    configured_chain_id: String,
    pub ledger: Arc<Ledger<E>>,
    pub peers: Arc<PeerSet>,
    pub boot: BootCell,
    pub net: NetClient,
    pub mining: MiningState,
    pub difficulty: DifficultyController,
    pub pbft: PbftState,
    /// Candidate blocks per PBFT view, waiting for commit quorum.
    proposed: Mutex<HashMap<u64, Block<E>>>,
    pub started_at: String,
}

impl<E: Entry> Node<E> {
    /// Build a node over an opened store: load or create the keypair,
    /// wire the evidence verifier for the chosen mode, and bootstrap the
    /// ledger (PoW: only the boot authors genesis; PBFT: every node
    /// authors the same deterministic genesis locally).
    pub fn new(config: NodeConfig, store: ChainStore) -> Result<Arc<Self>, NodeError> {
        let peers = Arc::new(PeerSet::new());
        let keypair = ensure_keypair(&store)?;
        let public_pem = keypair.public_pem()?;
        peers.register_key(&config.addr, &public_pem);

        let verifier: Arc<dyn EvidenceVerifier> = match config.mode {
            ConsensusMode::Pow => Arc::new(PowVerifier),
            ConsensusMode::Pbft => Arc::new(PbftVerifier::new(peers.clone())),
        };
        let ledger = Arc::new(Ledger::new(store, verifier));
        let author_genesis = config.is_boot || config.mode == ConsensusMode::Pbft;
        ledger.bootstrap(&config.chain_id, author_genesis)?;

        let boot_addr = if config.is_boot || config.bootstrap_addr.is_empty() {
            config.addr.clone()
        } else {
            config.bootstrap_addr.clone()
        };

        Ok(Arc::new(Self {
            identity: NodeIdentity {
                addr: config.addr.clone(),
                keypair,
                public_pem,
            },
            mode: config.mode,
            configured_chain_id: config.chain_id.clone(),
            ledger,
            peers,
            boot: BootCell::new(&boot_addr, config.is_boot),
            net: NetClient::new(),
            mining: MiningState::new(),
            difficulty: DifficultyController::new(INITIAL_DIFFICULTY),
            pbft: PbftState::new(),
            proposed: Mutex::new(HashMap::new()),
            started_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }))
    }

    fn now_rfc3339(&self) -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    /// Peers plus self: the target set for consensus broadcasts.
    fn all_nodes(&self) -> Vec<String> {
        let mut nodes = self.peers.snapshot();
        nodes.push(self.identity.addr.clone());
        nodes
    }

    // -- Status -------------------------------------------------------------

    /// The `/status` payload probes and elections consume.
    pub fn status(&self) -> PeerStatus {
        let height = self
            .ledger
            .height()
            .ok()
            .flatten()
            .map(|h| h as i64)
            .unwrap_or(-1);
        let last_hash = self
            .ledger
            .tip()
            .ok()
            .flatten()
            .map(|b| b.block_hash)
            .unwrap_or_default();
        PeerStatus {
            addr: self.identity.addr.clone(),
            height,
            is_boot: self.boot.is_boot(),
            boot_addr: self.boot.addr(),
            started_at: self.started_at.clone(),
            peers: self.peers.snapshot(),
            last_hash,
            difficulty: (self.mode == ConsensusMode::Pow).then(|| self.difficulty.current()),
        }
    }

    // -- Membership ---------------------------------------------------------

    /// Boot-side `/register`: admit a joiner after the chain-id check,
    /// hand back the full membership, and gossip the newcomer to the
    /// existing peers.
    pub fn handle_register(&self, req: &RegisterRequest) -> Result<RegisterResponse, NodeError> {
        let chain_id = self.ledger.chain_id()?.ok_or(NodeError::NotInitialized)?;
        if chain_id != req.chain_id {
            warn!(joiner = %req.addr, offered = %req.chain_id, "register rejected: foreign chain");
            return Err(NodeError::ChainIdMismatch);
        }

        let others = self.peers.snapshot();
        self.peers.add(&req.addr, &req.pub_key);

        // Existing peers learn the newcomer asynchronously.
        self.net.broadcast(
            &others,
            "/addPeer",
            &AddPeerRequest {
                addr: req.addr.clone(),
                pub_key: req.pub_key.clone(),
            },
        );

        // Reply with everyone except the joiner, boot itself included.
        let mut peers: Vec<String> = others;
        peers.push(self.identity.addr.clone());
        Ok(RegisterResponse {
            peers,
            peer_keys: self.peers.keys_snapshot(),
        })
    }

    /// `/addPeer`: adopt a gossiped peer.
    pub fn handle_add_peer(&self, req: &AddPeerRequest) {
        if req.addr != self.identity.addr {
            self.peers.add(&req.addr, &req.pub_key);
        }
    }

    /// Join the network through a boot node: register, adopt the
    /// returned membership, and pull the chain.
    pub async fn join(&self, boot_addr: &str) -> Result<(), NodeError> {
        // PoW followers start with an empty store; they offer the
        // configured id and adopt the genesis on first sync.
        let chain_id = self
            .ledger
            .chain_id()?
            .unwrap_or_else(|| self.configured_chain_id.clone());
        let req = RegisterRequest {
            chain_id,
            addr: self.identity.addr.clone(),
            pub_key: self.identity.public_pem.clone(),
        };
        let resp: RegisterResponse = self.net.post_json(boot_addr, "/register", &req).await?;

        for (addr, key) in &resp.peer_keys {
            if addr != &self.identity.addr {
                self.peers.add(addr, key);
            }
        }
        for addr in &resp.peers {
            // Addresses the key map somehow missed still join keyless;
            // PBFT verification will simply never match them.
            if addr != &self.identity.addr && !self.peers.contains(addr) {
                self.peers.add(addr, "");
            }
        }
        self.boot.set(boot_addr, &self.identity.addr);
        info!(boot = boot_addr, peers = self.peers.len(), "joined network");

        if let Err(e) = self.sync_from(boot_addr).await {
            warn!(error = %e, "initial sync failed; chain watcher will retry");
        }
        Ok(())
    }

    // -- Boot election ------------------------------------------------------

    /// Probe peers ∪ self in parallel, elect height-then-address, adopt
    /// the result, and broadcast `/bootNotify` when self wins.
    pub async fn elect_and_switch(&self) -> ElectionOutcome {
        let mut join_set = JoinSet::new();
        for peer in self.peers.snapshot() {
            let net = self.net.clone();
            join_set.spawn(async move { net.probe_status(&peer).await });
        }

        let mut live = vec![self.status()];
        while let Some(result) = join_set.join_next().await {
            if let Ok(Some(status)) = result {
                live.push(status);
            }
        }

        let winner = match pick_boot(&live) {
            Some(w) => w.addr.clone(),
            None => self.identity.addr.clone(),
        };

        if winner == self.identity.addr {
            self.boot.set(&winner, &self.identity.addr);
            self.net.broadcast(
                &self.peers.snapshot(),
                "/bootNotify",
                &BootNotify {
                    addr: winner.clone(),
                },
            );
            info!("elected as new boot");
            ElectionOutcome::SelfPromoted
        } else {
            self.boot.set(&winner, &self.identity.addr);
            info!(boot = %winner, "new boot recognized");
            ElectionOutcome::NewBoot(winner)
        }
    }

    /// `/bootNotify`: probe the claimed boot before accepting it.
    pub async fn handle_boot_notify(&self, claimed: &str) -> Result<(), NodeError> {
        if claimed != self.identity.addr && self.net.probe_status(claimed).await.is_none() {
            return Err(NodeError::BootUnreachable(claimed.to_string()));
        }
        self.boot.set(claimed, &self.identity.addr);
        info!(boot = claimed, "boot address updated");
        Ok(())
    }

    /// One liveness tick: probe every peer, remove those past the
    /// failure threshold, and run an election when the boot died.
    pub async fn run_liveness_sweep(&self) -> ElectionOutcome {
        let current_boot = self.boot.addr();
        let mut boot_lost = false;

        for peer in self.peers.snapshot() {
            let alive = self.net.probe_status(&peer).await.is_some();
            let failures = self.peers.record_probe(&peer, alive);
            if !alive {
                debug!(peer = %peer, failures, "probe failed");
            }
            if failures >= PEER_FAILURE_THRESHOLD {
                self.peers.remove(&peer);
                if peer == current_boot {
                    boot_lost = true;
                }
            }
        }

        if boot_lost {
            warn!(boot = %current_boot, "boot unreachable; starting election");
            self.elect_and_switch().await
        } else {
            ElectionOutcome::NoChange
        }
    }

    // -- Sync & fork resolution ---------------------------------------------

    /// Pull a peer's chain page by page, validating and appending each
    /// block. Duplicates are skipped; the first invalid block aborts.
    pub async fn sync_from(&self, peer: &str) -> Result<u64, NodeError> {
        let mut offset = 0u64;
        let mut appended = 0u64;
        loop {
            let page: BlocksPage<E> = self
                .net
                .get_json(
                    peer,
                    &format!("/blocks?offset={offset}&limit={SYNC_PAGE_LIMIT}"),
                )
                .await?;
            if let Some(d) = page.difficulty {
                self.difficulty.adopt(d);
            }
            if page.items.is_empty() {
                break;
            }
            for block in page.items {
                match self.ledger.append(block) {
                    Ok(()) => appended += 1,
                    Err(LedgerError::DuplicateIndex { .. }) => {}
                    Err(e) => {
                        warn!(error = %e, peer, "sync aborted on invalid block");
                        return Err(e.into());
                    }
                }
            }
            offset += SYNC_PAGE_LIMIT;
            if offset >= page.total {
                break;
            }
        }
        info!(peer, appended, "chain synced");
        Ok(appended)
    }

    /// One chain-watcher tick: find the best peer (height, then a fork
    /// at equal height), and when it beats the local chain, reset and
    /// resync from it. Skipped while consensus is in flight.
    pub async fn run_chain_reconciliation(&self) {
        let busy = match self.mode {
            ConsensusMode::Pow => self.mining.is_mining() || !self.ledger.pending_is_empty(),
            ConsensusMode::Pbft => self.pbft.in_progress(),
        };
        if busy {
            return;
        }

        let local = self.status();
        let mut best: Option<PeerStatus> = None;
        for peer in self.peers.snapshot() {
            let Some(status) = self.net.probe_status(&peer).await else {
                continue;
            };
            let better = match &best {
                None => true,
                Some(b) => {
                    status.height > b.height
                        || (status.height == b.height && status.last_hash != b.last_hash)
                }
            };
            if better {
                best = Some(status);
            }
        }
        let Some(best) = best else { return };

        let outdated = best.height > local.height;
        let forked = best.height == local.height
            && best.height >= 0
            && best.last_hash != local.last_hash;
        if !outdated && !forked {
            return;
        }

        warn!(
            peer = %best.addr,
            local_height = local.height,
            best_height = best.height,
            forked,
            "fork/outdated detected; reset and resync"
        );
        if let Err(e) = self.ledger.reset() {
            warn!(error = %e, "reset failed");
            return;
        }
        if let Err(e) = self.sync_from(&best.addr).await {
            warn!(error = %e, "resync failed; will retry next tick");
        }
    }

    // -- PoW ----------------------------------------------------------------

    /// One mining-watcher tick: when idle with pending entries, drain
    /// them and order a network-wide mining round.
    pub async fn trigger_mining_tick(&self) {
        if self.mode != ConsensusMode::Pow
            || self.mining.is_mining()
            || self.ledger.pending_is_empty()
        {
            return;
        }
        let entries = self.ledger.drain_pending();
        if entries.is_empty() {
            return;
        }
        info!(entries = entries.len(), "pending detected; starting network mining round");
        let request = crate::consensus::MineStartRequest { entries };
        self.net.broadcast(&self.all_nodes(), "/mine/start", &request);
    }

    /// `/mine/start`: begin the local nonce search for this round.
    /// Refuses quietly when a search is already running.
    pub fn handle_mine_start(self: Arc<Self>, entries: Vec<E>) -> Result<(), NodeError> {
        if self.mode != ConsensusMode::Pow {
            return Err(NodeError::WrongMode);
        }
        if entries.is_empty() {
            return Ok(());
        }
        let Some(stop) = self.mining.try_begin() else {
            debug!("mining already in progress; round request dropped");
            return Ok(());
        };

        let node = self.clone();
        tokio::spawn(async move {
            let announcement = node.mine_round(entries, stop).await;
            node.mining.finish();
            if let Some(announcement) = announcement {
                node.net
                    .broadcast(&node.all_nodes(), "/receiveBlock", &announcement);
            }
        });
        Ok(())
    }

    /// Run one nonce search on the blocking pool. `None` means aborted
    /// (someone else won) or the chain is not ready.
    async fn mine_round(
        &self,
        entries: Vec<E>,
        stop: Arc<std::sync::atomic::AtomicBool>,
    ) -> Option<BlockAnnouncement<E>> {
        let tip = self.ledger.tip().ok().flatten()?;
        let leaf_hashes: Vec<String> = entries
            .iter()
            .map(Entry::leaf_hash)
            .collect::<Result<_, _>>()
            .ok()?;
        let header = PowHeader {
            index: tip.index + 1,
            chain_id: tip.chain_id.clone(),
            prev_hash: tip.block_hash.clone(),
            timestamp: self.now_rfc3339(),
            merkle_root: crate::crypto::merkle_root(&leaf_hashes),
            difficulty: self.difficulty.current(),
            nonce: 0,
        };

        let outcome = tokio::task::spawn_blocking(move || mine(header, &stop))
            .await
            .ok()??;

        Some(BlockAnnouncement {
            difficulty: outcome.header.difficulty,
            hash: outcome.hash,
            elapsed: outcome.elapsed,
            winner: self.identity.addr.clone(),
            header: outcome.header,
            entries,
        })
    }

    /// `/receiveBlock`: the winner's block arrives. Duplicates at a
    /// known index are dropped without stopping the local search; a new
    /// block aborts mining, passes the full append pipeline, and its
    /// difficulty and elapsed feed the controller. A gap (missing
    /// predecessor) schedules a resync from the best peer.
    pub fn handle_receive_block(
        self: Arc<Self>,
        announcement: BlockAnnouncement<E>,
    ) -> Result<(), NodeError> {
        if self.mode != ConsensusMode::Pow {
            return Err(NodeError::WrongMode);
        }

        if self
            .ledger
            .store()
            .block::<E>(announcement.header.index)
            .map_err(LedgerError::from)?
            .is_some()
        {
            debug!(
                index = announcement.header.index,
                "duplicate block announcement ignored"
            );
            return Ok(());
        }

        self.mining.abort();
        info!(winner = %announcement.winner, index = announcement.header.index, "block race lost; validating winner");

        if !hash_meets_difficulty(&announcement.hash, announcement.header.difficulty) {
            return Err(NodeError::Ledger(LedgerError::Evidence(
                crate::consensus::EvidenceError::DifficultyNotMet {
                    difficulty: announcement.header.difficulty,
                },
            )));
        }

        let difficulty = announcement.difficulty;
        let elapsed = announcement.elapsed;
        let block = announcement.clone().into_block()?;
        if let Err(e) = self.ledger.append(block) {
            if matches!(e, LedgerError::MissingPrev { .. }) {
                // The chain has a gap this block cannot fill; catch up
                // off the request path.
                let node = self.clone();
                tokio::spawn(async move {
                    node.run_chain_reconciliation().await;
                });
            }
            return Err(e.into());
        }

        self.difficulty.adopt(difficulty);
        self.difficulty.record_block_time(elapsed);

        // Re-gossip so stragglers converge; duplicates drop by index.
        self.net
            .broadcast(&self.peers.snapshot(), "/receiveBlock", &announcement);
        Ok(())
    }

    // -- PBFT ---------------------------------------------------------------

    /// One proposer tick. Expires stalled views on every node; on the
    /// leader with pending entries and no active view, drains pending
    /// and broadcasts the Pre-Prepare.
    pub fn pbft_propose_tick(&self) -> Result<(), NodeError> {
        if self.mode != ConsensusMode::Pbft {
            return Ok(());
        }
        self.pbft.expire_stalled(PBFT_VIEW_TIMEOUT);

        if !self.boot.is_boot()
            || self.pbft.in_progress()
            || self.ledger.pending_is_empty()
        {
            return Ok(());
        }
        let Some(tip) = self.ledger.tip()? else {
            return Ok(());
        };
        let view = tip.index + 1;
        let view_state = self.pbft.view(view);
        let mut vs = view_state.lock();
        if vs.phase != Phase::Idle || !self.pbft.try_begin() {
            return Ok(());
        }

        let entries = self.ledger.drain_pending();
        if entries.is_empty() {
            self.pbft.end();
            return Ok(());
        }

        let block = match Block::build(
            &tip,
            entries,
            self.now_rfc3339(),
            Evidence::Pbft {
                proposer: self.identity.addr.clone(),
                signatures: Vec::new(),
            },
        ) {
            Ok(block) => block,
            Err(e) => {
                self.pbft.end();
                return Err(e.into());
            }
        };
        let own_sig = self.identity.keypair.sign_hex(block.block_hash.as_bytes());

        vs.phase = Phase::PrePrepare;
        vs.block_hash = block.block_hash.clone();
        vs.mark_started();
        vs.prepare.add(&self.identity.addr, &own_sig);
        drop(vs);

        self.proposed.lock().insert(view, block.clone());
        info!(view, hash = %block.block_hash, entries = block.entries.len(), "proposing block");
        self.net
            .broadcast(&self.all_nodes(), "/bft/start", &BftStart { view, block });
        Ok(())
    }

    /// `/bft/start`: validate the leader's candidate; on success move
    /// the view to Prepare, sign the hash, and broadcast the vote.
    /// Invalid candidates are dropped silently — the leader re-proposes
    /// on a later tick.
    pub fn handle_bft_start(&self, msg: BftStart<E>) -> Result<(), NodeError> {
        if self.mode != ConsensusMode::Pbft {
            return Err(NodeError::WrongMode);
        }
        let view_state = self.pbft.view(msg.view);
        let mut vs = view_state.lock();
        if vs.phase != Phase::Idle {
            return Ok(());
        }

        let Some(tip) = self.ledger.tip()? else {
            return Ok(());
        };
        if let Err(e) = self.ledger.validate_link(&msg.block, &tip) {
            warn!(view = msg.view, error = %e, "invalid proposal dropped");
            return Ok(());
        }

        let sig = self
            .identity
            .keypair
            .sign_hex(msg.block.block_hash.as_bytes());
        vs.phase = Phase::Prepare;
        vs.block_hash = msg.block.block_hash.clone();
        vs.mark_started();
        vs.prepare.add(&self.identity.addr, &sig);
        drop(vs);

        self.pbft.begin();
        self.proposed.lock().insert(msg.view, msg.block.clone());
        debug!(view = msg.view, "entering prepare phase");

        self.net.broadcast(
            &self.all_nodes(),
            "/bft/prepare",
            &BftVote {
                view: msg.view,
                addr: self.identity.addr.clone(),
                sig,
                hash: msg.block.block_hash,
            },
        );
        Ok(())
    }

    /// Check an incoming vote's signature against the sender's
    /// registered key. Unknown senders and bad signatures are dropped.
    fn vote_is_acceptable(&self, vote: &BftVote, expected_hash: &str) -> bool {
        if expected_hash.is_empty() || vote.hash != expected_hash {
            return false;
        }
        let Some(pem) = self.peers.key_of(&vote.addr) else {
            warn!(sender = %vote.addr, "vote from unregistered sender dropped");
            return false;
        };
        if !verify_signature(&pem, vote.hash.as_bytes(), &vote.sig) {
            warn!(sender = %vote.addr, view = vote.view, "vote signature invalid");
            return false;
        }
        true
    }

    /// `/bft/prepare`: collect a prepare vote; at quorum advance to
    /// Commit and broadcast this node's commit vote.
    pub fn handle_bft_prepare(&self, vote: BftVote) -> Result<(), NodeError> {
        if self.mode != ConsensusMode::Pbft {
            return Err(NodeError::WrongMode);
        }
        let view_state = self.pbft.view(vote.view);
        let mut vs = view_state.lock();
        if !self.vote_is_acceptable(&vote, &vs.block_hash) {
            return Ok(());
        }
        if !vs.prepare.add(&vote.addr, &vote.sig) {
            return Ok(());
        }
        let need = quorum(self.peers.len());
        debug!(view = vote.view, have = vs.prepare.count(), need, "prepare collected");

        // The leader sits at PrePrepare, voters at Prepare; both advance
        // on quorum.
        if vs.prepare.count() >= need
            && matches!(vs.phase, Phase::PrePrepare | Phase::Prepare)
        {
            vs.phase = Phase::Commit;
            let sig = self.identity.keypair.sign_hex(vote.hash.as_bytes());
            vs.commit.add(&self.identity.addr, &sig);
            info!(view = vote.view, "prepare quorum reached; entering commit phase");
            self.net.broadcast(
                &self.all_nodes(),
                "/bft/commit",
                &BftVote {
                    view: vote.view,
                    addr: self.identity.addr.clone(),
                    sig,
                    hash: vote.hash.clone(),
                },
            );
        }
        Ok(())
    }

    /// `/bft/commit`: collect a commit vote; at quorum attach the
    /// signatures as evidence and run the append pipeline exactly once.
    pub fn handle_bft_commit(&self, vote: BftVote) -> Result<(), NodeError> {
        if self.mode != ConsensusMode::Pbft {
            return Err(NodeError::WrongMode);
        }
        let view_state = self.pbft.view(vote.view);
        let mut vs = view_state.lock();
        if !self.vote_is_acceptable(&vote, &vs.block_hash) {
            return Ok(());
        }
        if !vs.commit.add(&vote.addr, &vote.sig) {
            return Ok(());
        }
        let need = quorum(self.peers.len());
        debug!(view = vote.view, have = vs.commit.count(), need, "commit collected");

        if vs.commit.count() < need || vs.phase != Phase::Commit {
            return Ok(());
        }
        vs.phase = Phase::Finalized;
        let signatures = vs.commit.signatures();
        drop(vs);

        let Some(mut block) = self.proposed.lock().remove(&vote.view) else {
            warn!(view = vote.view, "commit quorum without a stored proposal");
            self.pbft.clear_view(vote.view);
            self.pbft.end();
            return Ok(());
        };
        if let Evidence::Pbft {
            signatures: evidence_sigs,
            ..
        } = &mut block.evidence
        {
            *evidence_sigs = signatures;
        }

        info!(view = vote.view, hash = %block.block_hash, "commit quorum reached; finalizing");
        let result = self.ledger.append(block);
        self.pbft.clear_view(vote.view);
        self.pbft.end();
        result?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// LowerNode
// ---------------------------------------------------------------------------

/// A provider-chain node: the generic core plus the upper-tier target
/// and the anchor submitter.
pub struct LowerNode {
    pub node: Arc<Node<ProviderRecord>>,
    upper_boot: RwLock<String>,
}

impl LowerNode {
    pub fn new(node: Arc<Node<ProviderRecord>>, upper_boot: &str) -> Arc<Self> {
        Arc::new(Self {
            node,
            upper_boot: RwLock::new(upper_boot.to_string()),
        })
    }

    pub fn upper_boot(&self) -> String {
        self.upper_boot.read().clone()
    }

    /// `/upperBootNotify`: the upper tier elected a new boot; future
    /// anchors go there.
    pub fn set_upper_boot(&self, addr: &str) {
        *self.upper_boot.write() = addr.to_string();
        info!(upper_boot = addr, "upper boot updated");
    }

    /// Sign and submit one sealed block's root to the upper boot.
    pub async fn submit_anchor(&self, block: &Block<ProviderRecord>) -> Result<(), NodeError> {
        let upper = self.upper_boot();
        if upper.is_empty() {
            debug!("no upper boot configured; anchor skipped");
            return Ok(());
        }
        let chain_id = self
            .node
            .ledger
            .chain_id()?
            .ok_or(NodeError::NotInitialized)?;
        let submission = build_submission(
            &self.node.identity.keypair,
            &chain_id,
            &self.node.identity.addr,
            &block.merkle_root,
        );
        let status = self
            .node
            .net
            .post_json_ack(&upper, "/addAnchor", &submission)
            .await?;
        if status == 200 {
            info!(root = %block.merkle_root, upper = %upper, "anchor submitted");
        } else {
            warn!(status, upper = %upper, "upper rejected anchor");
        }
        Ok(())
    }

    /// After winning a lower-tier election, tell the upper tier where
    /// this provider's boot now lives so queries keep routing.
    pub async fn notify_upper_of_new_boot(&self) {
        let upper = self.upper_boot();
        if upper.is_empty() {
            return;
        }
        let Ok(Some(chain_id)) = self.node.ledger.chain_id() else {
            return;
        };
        let body = ProviderBootNotify {
            provider_id: chain_id,
            boot_addr: self.node.identity.addr.clone(),
        };
        if let Err(e) = self.node.net.post_json_ack(&upper, "/providerBootNotify", &body).await {
            warn!(error = %e, "upper boot notification failed");
        }
    }

    /// Spawn the lower tier's background loops: the anchor submitter
    /// (boot only, fed by sealed-block events), the consensus watcher
    /// for the active mode, the liveness sweep, and the chain watcher.
    pub fn spawn_watchers(self: Arc<Self>) {
        // Anchor submitter.
        let this = self.clone();
        tokio::spawn(async move {
            let mut sealed = this.node.ledger.subscribe_sealed();
            while let Ok(block) = sealed.recv().await {
                if this.node.boot.is_boot() && block.index > 0 {
                    if let Err(e) = this.submit_anchor(&block).await {
                        warn!(error = %e, "anchor submission failed");
                    }
                }
            }
        });

        // Consensus watcher.
        let this = self.clone();
        tokio::spawn(async move {
            match this.node.mode {
                ConsensusMode::Pow => {
                    let mut tick = tokio::time::interval(MINING_WATCHER_INTERVAL);
                    loop {
                        tick.tick().await;
                        this.node.trigger_mining_tick().await;
                    }
                }
                ConsensusMode::Pbft => {
                    let mut tick = tokio::time::interval(PBFT_WATCHER_INTERVAL);
                    loop {
                        tick.tick().await;
                        if let Err(e) = this.node.pbft_propose_tick() {
                            warn!(error = %e, "proposal tick failed");
                        }
                    }
                }
            }
        });

        // Liveness sweep; a win must re-route provider queries.
        let this = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(NETWORK_WATCHER_INTERVAL);
            loop {
                tick.tick().await;
                if this.node.run_liveness_sweep().await == ElectionOutcome::SelfPromoted {
                    this.notify_upper_of_new_boot().await;
                }
            }
        });

        // Chain watcher.
        let this = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(CHAIN_WATCHER_INTERVAL);
            loop {
                tick.tick().await;
                this.node.run_chain_reconciliation().await;
            }
        });
    }
}

// ---------------------------------------------------------------------------
// UpperNode
// ---------------------------------------------------------------------------

/// A registry-chain node: the generic core plus the anchor registry and
/// the verified query route.
pub struct UpperNode {
    pub node: Arc<Node<AnchorRecord>>,
    pub registry: AnchorRegistry,
}

impl UpperNode {
    pub fn new(node: Arc<Node<AnchorRecord>>) -> Result<Arc<Self>, NodeError> {
        let registry = AnchorRegistry::load(node.ledger.store().clone())?;
        Ok(Arc::new(Self { node, registry }))
    }

    /// `/addAnchor`: fetch the submitter's public key from its claimed
    /// boot address, verify the signature and timestamp, persist the
    /// anchor, queue the record for the next upper block, and gossip a
    /// changed provider boot to the other upper nodes.
    pub async fn handle_add_anchor(&self, submission: AnchorSubmission) -> Result<(), NodeError> {
        let public_pem = self
            .node
            .net
            .get_text(&submission.boot_addr, "/getPublicKey")
            .await?;

        let previous = self.registry.anchor(&submission.provider_id);
        verify_submission(&submission, &public_pem, previous.as_ref())?;

        self.registry.put_anchor(
            &submission.provider_id,
            AnchorInfo {
                root: submission.root.clone(),
                ts: submission.ts.clone(),
            },
        )?;
        self.node
            .ledger
            .append_pending(vec![to_anchor_record(&submission)]);
        info!(
            provider = %submission.provider_id,
            root = %submission.root,
            "anchor verified and queued"
        );

        if self
            .registry
            .set_provider_boot(&submission.provider_id, &submission.boot_addr)
        {
            self.node.net.broadcast(
                &self.node.peers.snapshot(),
                "/providerBootNotify",
                &ProviderBootNotify {
                    provider_id: submission.provider_id.clone(),
                    boot_addr: submission.boot_addr.clone(),
                },
            );
        }
        Ok(())
    }

    /// `/providerBootNotify`: adopt a gossiped provider boot after
    /// probing it.
    pub async fn handle_provider_boot_notify(
        &self,
        notify: &ProviderBootNotify,
    ) -> Result<(), NodeError> {
        if self.node.net.probe_status(&notify.boot_addr).await.is_none() {
            return Err(NodeError::BootUnreachable(notify.boot_addr.clone()));
        }
        self.registry
            .set_provider_boot(&notify.provider_id, &notify.boot_addr);
        Ok(())
    }

    /// `/query`: route a keyword to the provider's boot, then keep only
    /// the items that verify against the stored anchor.
    pub async fn handle_query(
        &self,
        provider_id: &str,
        keyword: &str,
    ) -> Result<Vec<SearchItem>, NodeError> {
        let boot = self
            .registry
            .provider_boot(provider_id)
            .ok_or_else(|| NodeError::Anchor(AnchorError::UnknownProvider(provider_id.into())))?;
        let anchor = self
            .registry
            .anchor(provider_id)
            .ok_or_else(|| NodeError::Anchor(AnchorError::UnknownProvider(provider_id.into())))?;

        let items: Vec<SearchItem> = self
            .node
            .net
            .get_json_with_query(&boot, "/search", &[("value", keyword)])
            .await?;
        let total = items.len();
        let verified = verify_search_items(&anchor.root, items);
        info!(
            provider = provider_id,
            keyword,
            received = total,
            verified = verified.len(),
            "query verified"
        );
        Ok(verified)
    }

    /// After winning an upper-tier election, re-point every known
    /// provider boot at this node for future anchor submissions.
    pub async fn notify_providers_of_new_boot(&self) {
        let body = BootNotify {
            addr: self.node.identity.addr.clone(),
        };
        for (provider, boot) in self.registry.provider_boots_snapshot() {
            if let Err(e) = self
                .node
                .net
                .post_json_ack(&boot, "/upperBootNotify", &body)
                .await
            {
                warn!(provider = %provider, error = %e, "upper boot notification failed");
            }
        }
    }

    /// Spawn the upper tier's background loops.
    pub fn spawn_watchers(self: Arc<Self>) {
        // Consensus watcher.
        let this = self.clone();
        tokio::spawn(async move {
            match this.node.mode {
                ConsensusMode::Pow => {
                    let mut tick = tokio::time::interval(MINING_WATCHER_INTERVAL);
                    loop {
                        tick.tick().await;
                        this.node.trigger_mining_tick().await;
                    }
                }
                ConsensusMode::Pbft => {
                    let mut tick = tokio::time::interval(PBFT_WATCHER_INTERVAL);
                    loop {
                        tick.tick().await;
                        if let Err(e) = this.node.pbft_propose_tick() {
                            warn!(error = %e, "proposal tick failed");
                        }
                    }
                }
            }
        });

        // Liveness sweep; a win must re-route anchor submission.
        let this = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(NETWORK_WATCHER_INTERVAL);
            loop {
                tick.tick().await;
                if this.node.run_liveness_sweep().await == ElectionOutcome::SelfPromoted {
                    this.notify_providers_of_new_boot().await;
                }
            }
        });

        // Chain watcher.
        let this = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(CHAIN_WATCHER_INTERVAL);
            loop {
                tick.tick().await;
                this.node.run_chain_reconciliation().await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

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

    fn boot_node(mode: ConsensusMode) -> Arc<Node<ProviderRecord>> {
        Node::new(
            NodeConfig {
                addr: "self:5000".into(),
                chain_id: "CP-A".into(),
                mode,
                is_boot: true,
                bootstrap_addr: String::new(),
            },
            ChainStore::open_temporary().unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn status_reports_genesis_height_and_hash() {
        let node = boot_node(ConsensusMode::Pow);
        let status = node.status();
        assert_eq!(status.height, 0);
        assert_eq!(status.addr, "self:5000");
        assert!(status.is_boot);
        assert_eq!(status.difficulty, Some(INITIAL_DIFFICULTY));
        assert_eq!(
            status.last_hash,
            node.ledger.tip().unwrap().unwrap().block_hash
        );
    }

    #[tokio::test]
    async fn pbft_node_hides_difficulty_and_authors_genesis() {
        let node = boot_node(ConsensusMode::Pbft);
        let status = node.status();
        assert_eq!(status.height, 0);
        assert!(status.difficulty.is_none());
    }

    #[tokio::test]
    async fn register_enforces_chain_id() {
        let node = boot_node(ConsensusMode::Pow);
        let rejected = node.handle_register(&RegisterRequest {
            chain_id: "CP-OTHER".into(),
            addr: "joiner:5000".into(),
            pub_key: "pem".into(),
        });
        assert!(matches!(rejected, Err(NodeError::ChainIdMismatch)));
        assert_eq!(node.peers.len(), 0);

        let accepted = node
            .handle_register(&RegisterRequest {
                chain_id: "CP-A".into(),
                addr: "joiner:5000".into(),
                pub_key: "pem".into(),
            })
            .unwrap();
        assert_eq!(node.peers.len(), 1);
        // Reply includes the boot itself and the joiner's key.
        assert!(accepted.peers.contains(&"self:5000".to_string()));
        assert!(accepted.peer_keys.contains_key("joiner:5000"));
        assert!(accepted.peer_keys.contains_key("self:5000"));
    }

    #[tokio::test]
    async fn receive_block_appends_then_drops_duplicates() {
        let node = boot_node(ConsensusMode::Pow);
        let tip = node.ledger.tip().unwrap().unwrap();
        let entries = vec![record("rec-1")];

        // Mine a difficulty-0 block inline.
        let leaf_hashes: Vec<String> = entries
            .iter()
            .map(|e| e.leaf_hash().unwrap())
            .collect();
        let header = PowHeader {
            index: 1,
            chain_id: tip.chain_id.clone(),
            prev_hash: tip.block_hash.clone(),
            timestamp: "2026-08-02T00:00:01Z".into(),
            merkle_root: crate::crypto::merkle_root(&leaf_hashes),
            difficulty: 0,
            nonce: 0,
        };
        let stop = std::sync::atomic::AtomicBool::new(false);
        let outcome = mine(header, &stop).unwrap();
        let announcement = BlockAnnouncement {
            difficulty: 0,
            hash: outcome.hash,
            elapsed: outcome.elapsed,
            winner: "peer:5000".into(),
            header: outcome.header,
            entries,
        };

        node.clone().handle_receive_block(announcement.clone()).unwrap();
        assert_eq!(node.ledger.height().unwrap(), Some(1));

        // Same announcement again: ignored, state unchanged.
        node.clone().handle_receive_block(announcement).unwrap();
        assert_eq!(node.ledger.height().unwrap(), Some(1));
    }

    #[tokio::test]
    async fn receive_block_rejects_unmet_difficulty() {
        let node = boot_node(ConsensusMode::Pow);
        let tip = node.ledger.tip().unwrap().unwrap();
        let block = Block::build(
            &tip,
            vec![record("rec-1")],
            "2026-08-02T00:00:01Z".into(),
            Evidence::Pow {
                nonce: 0,
                difficulty: 8,
                elapsed: 0.1,
            },
        )
        .unwrap();
        if hash_meets_difficulty(&block.block_hash, 8) {
            return; // One-in-4-billion jackpot; nothing to assert.
        }
        let announcement = BlockAnnouncement {
            header: PowHeader {
                index: block.index,
                chain_id: block.chain_id.clone(),
                prev_hash: block.prev_hash.clone(),
                timestamp: block.timestamp.clone(),
                merkle_root: block.merkle_root.clone(),
                difficulty: 8,
                nonce: 0,
            },
            hash: block.block_hash.clone(),
            entries: block.entries.clone(),
            difficulty: 8,
            elapsed: 0.1,
            winner: "peer:5000".into(),
        };
        assert!(node.clone().handle_receive_block(announcement).is_err());
        assert_eq!(node.ledger.height().unwrap(), Some(0));
    }

    /// Drive a full PBFT view on one node by replaying the messages a
    /// leader peer would send: start, its prepare vote, its commit vote.
    #[tokio::test]
    async fn pbft_view_finalizes_on_quorum() {
        let node = boot_node(ConsensusMode::Pbft);
        let leader_kp = EcdsaKeypair::generate();
        node.peers.add("leader:5000", &leader_kp.public_pem().unwrap());
        // n = 2, f = 0, quorum = 1.

        let tip = node.ledger.tip().unwrap().unwrap();
        let block = Block::build(
            &tip,
            vec![record("rec-1")],
            "2026-08-02T00:00:01Z".into(),
            Evidence::Pbft {
                proposer: "leader:5000".into(),
                signatures: Vec::new(),
            },
        )
        .unwrap();
        let hash = block.block_hash.clone();

        node.handle_bft_start(BftStart {
            view: 1,
            block,
        })
        .unwrap();
        assert!(node.pbft.in_progress());

        let leader_sig = leader_kp.sign_hex(hash.as_bytes());
        node.handle_bft_prepare(BftVote {
            view: 1,
            addr: "leader:5000".into(),
            sig: leader_sig,
            hash: hash.clone(),
        })
        .unwrap();

        let leader_commit = leader_kp.sign_hex(hash.as_bytes());
        node.handle_bft_commit(BftVote {
            view: 1,
            addr: "leader:5000".into(),
            sig: leader_commit,
            hash: hash.clone(),
        })
        .unwrap();

        // Finalized: appended with quorum evidence, gate released.
        assert_eq!(node.ledger.height().unwrap(), Some(1));
        assert!(!node.pbft.in_progress());
        let sealed = node.ledger.tip().unwrap().unwrap();
        match sealed.evidence {
            Evidence::Pbft { signatures, .. } => assert!(!signatures.is_empty()),
            other => panic!("unexpected evidence {other:?}"),
        }
    }

    #[tokio::test]
    async fn pbft_votes_from_unknown_senders_are_dropped() {
        let node = boot_node(ConsensusMode::Pbft);
        let outsider = EcdsaKeypair::generate();
        let tip = node.ledger.tip().unwrap().unwrap();
        let block = Block::build(
            &tip,
            vec![record("rec-1")],
            "2026-08-02T00:00:01Z".into(),
            Evidence::Pbft {
                proposer: "outsider:5000".into(),
                signatures: Vec::new(),
            },
        )
        .unwrap();
        let hash = block.block_hash.clone();
        node.handle_bft_start(BftStart { view: 1, block }).unwrap();

        node.handle_bft_prepare(BftVote {
            view: 1,
            addr: "outsider:5000".into(),
            sig: outsider.sign_hex(hash.as_bytes()),
            hash: hash.clone(),
        })
        .unwrap();

        // Nothing finalized; the chain did not move.
        assert_eq!(node.ledger.height().unwrap(), Some(0));
    }

    #[tokio::test]
    async fn wrong_mode_endpoints_are_rejected() {
        let pow = boot_node(ConsensusMode::Pow);
        assert!(matches!(
            pow.handle_bft_prepare(BftVote {
                view: 1,
                addr: "x".into(),
                sig: "s".into(),
                hash: "h".into()
            }),
            Err(NodeError::WrongMode)
        ));

        let pbft = boot_node(ConsensusMode::Pbft);
        assert!(matches!(
            pbft.handle_mine_start(vec![record("r")]),
            Err(NodeError::WrongMode)
        ));
    }

    #[tokio::test]
    async fn elect_and_switch_self_promotes_when_alone() {
        let node = boot_node(ConsensusMode::Pow);
        node.boot.set("dead-boot:5000", &node.identity.addr);
        assert!(!node.boot.is_boot());

        let outcome = node.elect_and_switch().await;
        assert_eq!(outcome, ElectionOutcome::SelfPromoted);
        assert!(node.boot.is_boot());
        assert_eq!(node.boot.addr(), "self:5000");
    }

    #[tokio::test]
    async fn lower_node_tracks_upper_boot() {
        let node = boot_node(ConsensusMode::Pow);
        let lower = LowerNode::new(node, "upper-boot:7000");
        assert_eq!(lower.upper_boot(), "upper-boot:7000");
        lower.set_upper_boot("upper-2:7000");
        assert_eq!(lower.upper_boot(), "upper-2:7000");
    }
}
