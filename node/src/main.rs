// Copyright (c) 2026 Strata Contributors. MIT License.
// See LICENSE for details.

//! # Strata Node
//!
//! Entry point for the `strata-node` binary: one process serving either
//! a provider (lower) chain or the registry (upper) chain, with the PoW
//! or PBFT finalizer selected at startup.
//!
//! Subcommands:
//!
//! - `run`     — start the node: HTTP gateway, watchers, consensus
//! - `init`    — create the data directory and generate the keypair
//! - `version` — print build information

mod api;
mod cli;
mod logging;
mod state;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;

use cli::{Commands, InitArgs, RunArgs, StrataNodeCli};
use logging::LogFormat;

fn main() -> Result<()> {
    let cli = StrataNodeCli::parse();
    match cli.command {
        Commands::Run(args) => run_node(args),
        Commands::Init(args) => init_node(args),
        Commands::Version => {
            println!("strata-node {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn run_node(args: RunArgs) -> Result<()> {
    logging::init_logging(
        "strata_node=info,strata_protocol=info,tower_http=warn",
        LogFormat::from_str_lossy(&args.log_format),
    );

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    runtime.block_on(async {
        tracing::info!(
            addr = %args.node_addr,
            chain_id = %args.chain_id,
            tier = ?args.tier,
            consensus = ?args.consensus,
            boot = args.is_boot(),
            "starting strata-node"
        );

        let (router, _runtime_state) = state::build_runtime(&args)?;

        let listen = format!("0.0.0.0:{}", args.port);
        let listener = tokio::net::TcpListener::bind(&listen)
            .await
            .with_context(|| format!("failed to bind listener on {listen}"))?;
        tracing::info!("gateway listening on {listen}");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("gateway server error")?;

        tracing::info!("strata-node stopped");
        Ok(())
    })
}

/// Create the data directory and the node's ECDSA keypair ahead of the
/// first run, printing the public half for out-of-band registration.
fn init_node(args: InitArgs) -> Result<()> {
    logging::init_logging("strata_node=info", LogFormat::Pretty);

    let store = strata_protocol::storage::ChainStore::open(&args.db_path)
        .with_context(|| format!("failed to open store at {}", args.db_path.display()))?;
    let keypair =
        strata_protocol::anchor::ensure_keypair(&store).context("keypair generation failed")?;

    println!("Node initialized.");
    println!("  Data directory : {}", args.db_path.display());
    println!("  Public key     :");
    println!("{}", keypair.public_pem().context("public key encoding")?);
    Ok(())
}

/// Resolve on SIGINT (Ctrl+C) or SIGTERM, whichever lands first.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
