//! `jausd`: the node manager daemon.
//!
//! Brings up a node manager from a settings file (flags override file
//! values) and runs until killed.

use clap::Parser;
use jaus_node::{NodeManager, NodeSettings};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "jausd", about = "JAUS node manager daemon")]
struct Args {
    /// Settings file (JSON). Flags below override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Subsystem id of this node (1-254).
    #[arg(short, long)]
    subsystem: Option<u8>,

    /// Node id of this node (1-254).
    #[arg(short, long)]
    node: Option<u8>,

    /// Use TCP instead of UDP for inter-node links.
    #[arg(long)]
    tcp: bool,

    /// Multicast group for discovery.
    #[arg(long)]
    multicast: Option<String>,

    /// Multicast TTL.
    #[arg(long)]
    ttl: Option<u32>,

    /// Enable cross-subsystem discovery (255.255.1.1 heartbeats).
    #[arg(long)]
    subsystem_discovery: bool,

    /// Write traffic logs.
    #[arg(long)]
    logdata: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.logdata {
        let log = std::sync::Arc::new(std::fs::File::create("jausd.log")?);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(log)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut settings = match &args.config {
        Some(path) => NodeSettings::load(path)?,
        None => {
            let (Some(subsystem), Some(node)) = (args.subsystem, args.node) else {
                return Err("either --config or both --subsystem and --node are required".into());
            };
            NodeSettings::new(subsystem, node)
        }
    };
    if let Some(subsystem) = args.subsystem {
        settings.subsystem_id = subsystem;
    }
    if let Some(node) = args.node {
        settings.node_id = node;
    }
    if args.tcp {
        settings.transport = jaus_node::config::TransportFlavor::Tcp;
    }
    if let Some(multicast) = args.multicast {
        settings.multicast = multicast;
    }
    if let Some(ttl) = args.ttl {
        settings.ttl = ttl;
    }
    if args.subsystem_discovery {
        settings.subsystem_discovery = true;
    }
    if args.logdata {
        settings.logdata = true;
    }

    let manager = NodeManager::initialize(settings)?;
    info!("node manager {} running", manager.id());

    loop {
        std::thread::sleep(Duration::from_secs(60));
    }
}
