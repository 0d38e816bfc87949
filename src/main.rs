//! Replica process entry point.
//!
//! One positional argument selects this node's identity (and with it the
//! listen address) from the static four-replica table.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use pbft_replica::config::Config;
use pbft_replica::node::Node;
use pbft_replica::server;
use pbft_replica::transport::HttpTransport;

#[derive(Parser, Debug)]
#[command(name = "pbft-replica")]
#[command(about = "Replica node of a Practical Byzantine Fault Tolerant consensus group")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Node identifier selecting this replica's entry in the peer table
    node_id: String,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level: tracing::Level = args
        .log_level
        .parse()
        .with_context(|| format!("invalid log level {}", args.log_level))?;
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = Arc::new(Config::new(&args.node_id)?);
    tracing::info!(
        node_id = %config.node_id,
        view_id = config.view.view_id,
        leader = %config.view.leader,
        f = config.f,
        "replica starting"
    );

    let transport = Arc::new(HttpTransport::new()?);
    let handle = Node::spawn(config.clone(), transport);

    server::serve(config.listen_addr(), handle.entrance()).await
}
