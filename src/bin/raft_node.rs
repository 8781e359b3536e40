use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use raft_node::{
    node_channel, ClusterView, FileStore, Input, LoggingObserver, Node, NodeActor, NodeId, Output, RaftServer,
    TokioTimerDriver,
};

/// Run one Raft cluster member.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// This node's id, used both in cluster membership and on the wire.
    #[arg(long)]
    id: String,

    /// Address to listen on for Raft RPCs, e.g. 127.0.0.1:9001.
    #[arg(long)]
    listen: String,

    /// A peer as "id=host:port". Repeat for every other cluster member.
    #[arg(long = "peer", value_name = "ID=ADDR")]
    peers: Vec<String>,

    /// Directory for the durable current_term/voted_for files.
    #[arg(long, default_value = "./raft-state")]
    state_dir: String,

    #[arg(long, default_value_t = 150)]
    election_timeout_min_ms: u64,

    #[arg(long, default_value_t = 300)]
    election_timeout_max_ms: u64,

    #[arg(long, default_value_t = 50)]
    heartbeat_interval_ms: u64,
}

fn parse_peer(spec: &str) -> anyhow::Result<(NodeId, String)> {
    let (id, addr) = spec
        .split_once('=')
        .with_context(|| format!("peer spec '{spec}' must look like ID=HOST:PORT"))?;
    Ok((NodeId::from(id), addr.to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let self_id = NodeId::from(args.id.as_str());
    let mut peer_addrs = HashMap::new();
    for spec in &args.peers {
        let (id, addr) = parse_peer(spec)?;
        peer_addrs.insert(id, addr);
    }
    let cluster = ClusterView::new(peer_addrs.keys().cloned().collect());

    let store = FileStore::new(&args.state_dir).with_context(|| format!("opening state dir {}", args.state_dir))?;

    let (handle, inbox) = node_channel();
    let timers = TokioTimerDriver::new(
        Arc::new(handle.clone()),
        Duration::from_millis(args.election_timeout_min_ms),
        Duration::from_millis(args.election_timeout_max_ms),
        Duration::from_millis(args.heartbeat_interval_ms),
    );
    let observer = LoggingObserver::new(self_id.clone());
    let node = Node::new(self_id.clone(), cluster, store, Box::new(timers), Box::new(observer));

    let (outputs_tx, outputs_rx) = tokio::sync::mpsc::unbounded_channel::<Output>();
    NodeActor::spawn_with_inbox(node, inbox, outputs_tx);

    let server = RaftServer::bind(&args.listen, handle.clone())
        .await
        .with_context(|| format!("binding raft listener on {}", args.listen))?;
    log::info!("{} listening for raft rpcs on {}", self_id, args.listen);

    tokio::spawn(raft_node::transport::drive_outputs(outputs_rx, handle.clone(), self_id.clone(), peer_addrs));

    tokio::spawn(async move {
        if let Err(e) = server.serve().await {
            log::error!("raft server exited: {e}");
        }
    });

    // A minimal stdin-driven client loop: typing a line proposes it as one
    // log entry if this node happens to be leader.
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin());
    use tokio::io::AsyncBufReadExt;
    let mut buf = String::new();
    loop {
        buf.clear();
        let read = lines.read_line(&mut buf).await?;
        if read == 0 {
            break;
        }
        let line = buf.trim_end();
        if line.is_empty() {
            continue;
        }
        match handle.request(Input::AppendData(vec![line.as_bytes().to_vec()])).await {
            Ok(Output::AppendAccepted { first, last, .. }) => {
                log::info!("accepted entries {first:?}..={last:?}");
            }
            Ok(other) => log::info!("{other:?}"),
            Err(e) => log::error!("append failed: {e}"),
        }
    }

    Ok(())
}
