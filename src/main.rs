use anyhow::Context;
use clap::Parser;
use cluster_map::api::handlers::router;
use cluster_map::cmap::{
    CMap, CMapManager, FileStore, NodeId, NodeStatus, NodeType, UpdateOutcome,
};
use cluster_map::gossip::{GossipConfig, GossipError, TcpTransport, start_gossip};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "cmapd")]
#[command(about = "Cluster map gossip node")]
struct Args {
    /// Node id of this process in the cluster map.
    #[arg(long)]
    id: u64,

    /// Gossip listen address.
    #[arg(long)]
    bind: SocketAddr,

    /// Address peers should dial, when it differs from --bind.
    #[arg(long)]
    advertise: Option<String>,

    /// metadata, data or gateway.
    #[arg(long = "node-type", default_value = "data")]
    node_type: String,

    /// Directory holding persisted cluster map snapshots.
    #[arg(long = "data-dir", default_value = "cmap-data")]
    data_dir: PathBuf,

    /// JSON cluster map published before gossip starts.
    #[arg(long)]
    bootstrap: Option<PathBuf>,

    /// Admin HTTP address (defaults to the gossip port + 1000).
    #[arg(long)]
    http: Option<SocketAddr>,

    /// JSON file with gossip tuning parameters.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    let node_type: NodeType = args
        .node_type
        .parse()
        .map_err(GossipError::InvalidConfig)?;

    // 1. Cluster map manager:
    let store = Arc::new(FileStore::open(&args.data_dir)?);
    let manager = CMapManager::new(store)?;

    if let Some(path) = &args.bootstrap {
        let bytes = std::fs::read(path)
            .with_context(|| format!("reading bootstrap cmap {}", path.display()))?;
        let cmap: CMap = serde_json::from_slice(&bytes)?;
        match manager.update(cmap)? {
            UpdateOutcome::Committed(version) => {
                tracing::info!("Bootstrapped cmap v{}", version)
            }
            UpdateOutcome::Stale { current } => {
                tracing::info!("Bootstrap cmap is not newer than v{}, skipped", current)
            }
        }
    }

    let local_id = NodeId(args.id);
    if let Some(local) = manager.latest_snapshot().node(local_id)
        && local.node_type != node_type
    {
        return Err(GossipError::InvalidConfig(format!(
            "{} is registered as {:?}, not {:?}",
            local_id, local.node_type, node_type
        ))
        .into());
    }

    // 2. Gossip:
    let mut config = match &args.config {
        Some(path) => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("reading gossip config {}", path.display()))?;
            serde_json::from_slice::<GossipConfig>(&bytes)?
        }
        None => GossipConfig::default(),
    };
    config.node_id = local_id;
    config.address = args
        .advertise
        .clone()
        .unwrap_or_else(|| args.bind.to_string());
    config.validate()?;

    let transport = TcpTransport::bind(args.bind).await?;
    let gossip = start_gossip(config, manager.clone(), transport)?;

    // 3. Health reporter:
    let reporter = manager.clone();
    tokio::spawn(async move {
        loop {
            let changed = reporter.get_state_changed_noti();
            let Ok(version) = changed.await else {
                break;
            };

            let cmap = reporter.latest_snapshot();
            let alive = cmap
                .nodes
                .iter()
                .filter(|node| node.status == NodeStatus::Alive)
                .count();
            tracing::info!(
                "Cluster health at v{}: {}/{} nodes alive",
                version,
                alive,
                cmap.nodes.len()
            );
            for node in cmap.nodes.iter().filter(|node| node.status != NodeStatus::Alive) {
                tracing::info!(
                    "  - {} {} at {} is {:?} (inc={})",
                    node.id,
                    node.name,
                    node.address,
                    node.status,
                    node.incarnation
                );
            }
        }
    });

    // 4. Admin HTTP server:
    let http_addr = args
        .http
        .unwrap_or_else(|| {
            SocketAddr::new(args.bind.ip(), args.bind.port().saturating_add(1000))
        });
    let listener = tokio::net::TcpListener::bind(http_addr).await?;

    tracing::info!("HTTP server listening on {}", http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    axum::serve(listener, router(manager.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    gossip.leave().await?;
    Ok(())
}
