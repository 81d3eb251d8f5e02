//! # Runtime Wiring
//!
//! Assembles a running node from the CLI arguments: open the store,
//! build the tier-specific node value, spawn its watcher loops, kick off
//! the join sequence when a bootstrap address is configured, and hand
//! back the router to serve.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use strata_protocol::node::{LowerNode, Node, NodeConfig, UpperNode};
use strata_protocol::record::{AnchorRecord, ProviderRecord};
use strata_protocol::storage::ChainStore;

use crate::api;
use crate::cli::{RunArgs, Tier};

/// The tier-specific runtime kept alive for the process lifetime.
pub enum TierRuntime {
    Lower(Arc<LowerNode>),
    Upper(Arc<UpperNode>),
}

/// Build the node, spawn its background loops, and return the router.
pub fn build_runtime(args: &RunArgs) -> Result<(axum::Router, TierRuntime)> {
    let mut store = ChainStore::open(&args.db_path)
        .with_context(|| format!("failed to open store at {}", args.db_path.display()))?;
    if let Some(history) = &args.history_log {
        store = store.with_history_log(history.clone());
    }

    let config = NodeConfig {
        addr: args.node_addr.clone(),
        chain_id: args.chain_id.clone(),
        mode: args.consensus.into(),
        is_boot: args.is_boot(),
        bootstrap_addr: args.bootstrap_addr.clone(),
    };

    match args.tier {
        Tier::Lower => {
            let node = Node::<ProviderRecord>::new(config, store)
                .context("lower node initialization failed")?;
            let lower = LowerNode::new(node, &args.upper_bootstrap_addr);
            lower.clone().spawn_watchers();
            spawn_join(&lower.node, args);
            let router = api::lower_router(lower.clone());
            Ok((router, TierRuntime::Lower(lower)))
        }
        Tier::Upper => {
            let node = Node::<AnchorRecord>::new(config, store)
                .context("upper node initialization failed")?;
            let upper = UpperNode::new(node).context("anchor registry load failed")?;
            upper.clone().spawn_watchers();
            spawn_join(&upper.node, args);
            let router = api::upper_router(upper.clone());
            Ok((router, TierRuntime::Upper(upper)))
        }
    }
}

/// Register with the configured boot and pull the chain, off the startup
/// path. The boot itself skips this.
fn spawn_join<E: strata_protocol::record::Entry>(node: &Arc<Node<E>>, args: &RunArgs) {
    if args.is_boot() {
        info!("running as boot node; skipping join");
        return;
    }
    let node = node.clone();
    let boot = args.bootstrap_addr.clone();
    tokio::spawn(async move {
        match node.join(&boot).await {
            Ok(()) => info!(boot = %boot, "network join complete"),
            Err(e) => warn!(boot = %boot, error = %e, "join failed; watchers will keep trying"),
        }
    });
}
