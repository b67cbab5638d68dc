#![forbid(unsafe_code)]
//! Runs one or more AuthorityChain nodes on an in-process network.
//!
//! The first node mines; the rest validate and sync from it.

use authority_chain::config::load_config;
use authority_chain::genesis::GenesisBlockData;
use authority_chain::logging::init_logging;
use authority_chain::network::LocalNetwork;
use authority_chain::shutdown::ShutdownController;
use authority_chain::Node;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

/// Secret key of the authority in the bundled genesis file.
const DEV_AUTHORITY_KEY: &str = "0000000000000000000000000000000000000000000000000000000000000001";

#[derive(Parser)]
#[command(name = "authority-node", about = "AuthorityChain node runner")]
struct Cli {
    /// Path to a TOML configuration file. Defaults apply when it is absent.
    #[arg(long, default_value = "authority.toml", env = "AUTHORITY_CONFIG")]
    config: PathBuf,

    /// Path to a genesis JSON file. The bundled genesis is used otherwise.
    #[arg(long, env = "AUTHORITY_GENESIS")]
    genesis: Option<PathBuf>,

    /// Number of nodes to run on the in-process network.
    #[arg(long, default_value_t = 1)]
    nodes: usize,

    /// Mine on the first node with the bundled genesis authority key.
    #[arg(long)]
    dev: bool,

    /// Overrides `[logging].level`.
    #[arg(long, env = "AUTHORITY_LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    let level = cli.log_level.clone().unwrap_or_else(|| config.logging.level.clone());
    init_logging(config.logging.format, &level);

    let genesis = match &cli.genesis {
        Some(path) => GenesisBlockData::from_json(&std::fs::read_to_string(path)?)?,
        None => GenesisBlockData::embedded()?,
    };

    let network = LocalNetwork::new();
    let mut nodes = Vec::with_capacity(cli.nodes.max(1));
    for index in 0..cli.nodes.max(1) {
        let peer = format!("node-{}", index);
        let mut node_config = config.clone();
        node_config.node.data_dir = config.node.data_dir.join(&peer);
        if index == 0 {
            if cli.dev {
                node_config.miner.enabled = true;
                node_config
                    .miner
                    .authority_key_hex
                    .get_or_insert_with(|| DEV_AUTHORITY_KEY.to_string());
            }
        } else {
            node_config.miner.enabled = false;
            node_config.miner.authority_key_hex = None;
        }

        let node = Node::start(node_config, genesis.clone(), network.join(peer.clone())).await?;
        info!(peer = %peer, "Node running");
        nodes.push(node);
    }

    let signals = ShutdownController::new();
    tokio::select! {
        _ = signals.wait_for_signal() => {}
        _ = nodes[0].stopped() => warn!("First node stopped on its own"),
    }

    for node in nodes {
        node.join().await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_env_fallbacks_are_wired() {
        let command = Cli::command();
        let env_of = |id: &str| {
            command
                .get_arguments()
                .find(|arg| arg.get_id() == id)
                .and_then(|arg| arg.get_env())
                .map(|env| env.to_string_lossy().into_owned())
        };
        assert_eq!(env_of("config").as_deref(), Some("AUTHORITY_CONFIG"));
        assert_eq!(env_of("genesis").as_deref(), Some("AUTHORITY_GENESIS"));
        assert_eq!(env_of("log_level").as_deref(), Some("AUTHORITY_LOG_LEVEL"));
        assert_eq!(env_of("nodes"), None);
    }

    #[test]
    fn test_flags_parse() {
        let cli = Cli::try_parse_from(["authority-node", "--nodes", "3", "--dev"]).unwrap();
        assert_eq!(cli.nodes, 3);
        assert!(cli.dev);
    }
}
