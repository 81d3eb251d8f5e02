//! # Command-Line Interface
//!
//! Arguments for the `strata-node` binary. Every networking setting has
//! an environment fallback matching the variables the deployment scripts
//! export (`NODE_ADDR`, `BOOTSTRAP_ADDR`, `PORT`, `DB_PATH`, `CHAIN_ID`,
//! `UPPER_BOOTSTRAP_ADDR`).
//!
//! A node is the network's boot exactly when it has no bootstrap address
//! (or bootstraps from itself); everyone else joins through that boot.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use strata_protocol::config::DEFAULT_PORT;
use strata_protocol::node::ConsensusMode;

/// Strata chain node.
#[derive(Debug, Parser)]
#[command(name = "strata-node", version, about = "Strata provenance chain node")]
pub struct StrataNodeCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the node: gateway, watchers, and consensus participation.
    Run(RunArgs),
    /// Initialize the data directory and generate the node keypair.
    Init(InitArgs),
    /// Print version information.
    Version,
}

/// Which tier this node serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Tier {
    /// A provider chain committing records.
    Lower,
    /// The registry chain aggregating anchors.
    Upper,
}

/// Which finalizer the network runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Engine {
    Pow,
    Pbft,
}

impl From<Engine> for ConsensusMode {
    fn from(engine: Engine) -> Self {
        match engine {
            Engine::Pow => ConsensusMode::Pow,
            Engine::Pbft => ConsensusMode::Pbft,
        }
    }
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// This node's externally reachable address, e.g. `cp-node-01:5000`.
    #[arg(long, env = "NODE_ADDR")]
    pub node_addr: String,

    /// Boot node to join. Leave empty on the boot itself.
    #[arg(long, env = "BOOTSTRAP_ADDR", default_value = "")]
    pub bootstrap_addr: String,

    /// HTTP listener port.
    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// sled database directory.
    #[arg(long, env = "DB_PATH", default_value = "strata_db")]
    pub db_path: PathBuf,

    /// Chain identifier (provider id, or the registry id on the upper
    /// tier). Must match the genesis of the network being joined.
    #[arg(long, env = "CHAIN_ID")]
    pub chain_id: String,

    /// Upper-tier boot the lower chain submits anchors to.
    #[arg(long, env = "UPPER_BOOTSTRAP_ADDR", default_value = "")]
    pub upper_bootstrap_addr: String,

    /// Which tier this node serves.
    #[arg(long, value_enum, default_value_t = Tier::Lower)]
    pub tier: Tier,

    /// Which consensus engine finalizes blocks.
    #[arg(long, value_enum, default_value_t = Engine::Pow)]
    pub consensus: Engine,

    /// Append a human-readable line per accepted block to this file.
    #[arg(long)]
    pub history_log: Option<PathBuf>,

    /// Log output format: `pretty` or `json`.
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl RunArgs {
    /// A node with no one to bootstrap from (or bootstrapping from
    /// itself) is the boot.
    pub fn is_boot(&self) -> bool {
        self.bootstrap_addr.is_empty() || self.bootstrap_addr == self.node_addr
    }
}

#[derive(Debug, Args)]
pub struct InitArgs {
    /// sled database directory to initialize.
    #[arg(long, env = "DB_PATH", default_value = "strata_db")]
    pub db_path: PathBuf,
}
