//! Chainmesh CLI application

use anyhow::Result;
use chainmesh::{crypto::Identity, utils::parse_size, ChainInfo, ChainNode, NodeConfig};
use clap::{Parser, Subcommand};
use serde_json::{json, Map};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chainmesh-cli")]
#[command(about = "Peer-to-peer node for a network of independently owned chains")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Maximum number of inbound peers
    #[arg(short = 'n', long)]
    max_peers: Option<usize>,

    /// Seed peer as address:port (repeatable)
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node
    Start {
        /// Create an owned chain with this name before going online
        #[arg(long)]
        create_chain: Option<String>,

        /// Blocks to append to the created chain
        #[arg(long, default_value_t = 0)]
        blocks: usize,

        /// Payload size of each generated block, e.g. 512 or 4k
        #[arg(long, default_value = "1k")]
        size: String,
    },
    /// Generate a new keypair
    Keygen,
    /// Show version information
    Version,
}

fn load_config(cli: &Cli) -> Result<NodeConfig> {
    let mut config = match &cli.config {
        Some(path) => NodeConfig::from_file(path)?,
        None => NodeConfig::default(),
    };
    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(max_peers) = cli.max_peers {
        config.max_peers = max_peers;
    }
    Ok(config)
}

/// Chain id from a chain's info, for log lines
fn chain_label(info: &ChainInfo) -> &str {
    info.get("chain_id")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("?")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match &cli.command {
        Some(Commands::Start {
            create_chain,
            blocks,
            size,
        }) => {
            let size = parse_size(size)?;
            run_node(&cli, create_chain.as_deref(), *blocks, size).await?;
        },
        None => run_node(&cli, None, 0, 0).await?,
        Some(Commands::Keygen) => {
            let identity = Identity::generate();
            println!("Generated new keypair:");
            println!("Public key:  {}", identity.public_key());
            if let Some(private_key) = identity.private_key() {
                println!("Private key: {}", private_key);
            }
        },
        Some(Commands::Version) => {
            println!("Chainmesh v{}", chainmesh::VERSION);
        },
    }

    Ok(())
}

async fn run_node(cli: &Cli, create_chain: Option<&str>, blocks: usize, size: usize) -> Result<()> {
    let config = load_config(cli)?;
    info!("Starting node on {}:{}", config.host, config.port);

    let mut builder = ChainNode::builder().with_config(config);
    for peer in &cli.peers {
        builder = builder.peer(peer.clone());
    }
    let mut node = builder.build()?;

    if let Some(name) = create_chain {
        let mut metadata = Map::new();
        metadata.insert("name".to_string(), json!(name));
        metadata.insert("version".to_string(), json!(chainmesh::PROTOCOL_VERSION));
        let info = node.create_chain(metadata).await?;
        info!("Created chain {}", chain_label(&info));

        if blocks > 0 {
            let created = node.create_blocks(None, blocks, size).await?;
            info!("Appended {} blocks", created.len());
        }
    }

    node.start().await?;

    // Keep the node running
    tokio::signal::ctrl_c().await?;

    info!("Shutting down node...");
    node.stop().await?;
    Ok(())
}
