mod mediaserver;
mod rtmp;

use std::sync::Arc;

use anyhow::Result;
use sqlx::sqlite::SqlitePoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vidmesh_core::census::Census;
use vidmesh_core::chain::ChainTimeouts;
use vidmesh_core::discovery::OrchestratorStore;
use vidmesh_core::drivers::{OsDriver, S3Driver};
use vidmesh_core::{logging, Config, Node, SessionConfig, SessionCoordinator};
use vidmesh_media::pubsub::InMemoryOverlay;
use vidmesh_media::{FrameSegmenter, StreamRegistry};

/// Node identity: hostname plus a random suffix, unique per process.
fn generate_node_id() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{hostname}-{}", nanoid::nanoid!(6))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref())?;

    logging::init_logging(&config.logging)?;
    let node_id = generate_node_id();
    info!("vidmesh node starting, id {}", node_id);
    info!("rtmp address: {}", config.rtmp_address());
    info!("http address: {}", config.http_address());

    let pool = SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await?;
    let _store = OrchestratorStore::init(pool.clone()).await?;

    let census = Census::new("broadcaster", &node_id);
    let cancel = CancellationToken::new();
    let _watcher = census.spawn_timeout_watcher(cancel.child_token());

    let storage: Option<Arc<dyn OsDriver>> = match config.storage.backend.as_str() {
        "s3" => Some(Arc::new(S3Driver::new(
            &config.storage.region,
            &config.storage.bucket,
            &config.storage.access_key,
            &config.storage.secret,
        ))),
        "gs" => {
            warn!("gs storage requires a credential signer; storage disabled");
            None
        }
        "" => None,
        other => {
            warn!("unknown storage backend '{}'; storage disabled", other);
            None
        }
    };

    // The on-chain client and the overlay transport are deployment
    // concerns; without them the node runs standalone with the in-process
    // overlay and no job ledger.
    if config.chain.enabled {
        warn!("chain.enabled set but no chain client is linked into this build");
    }

    let node = Node::new(
        node_id,
        Arc::new(StreamRegistry::new()),
        Arc::new(InMemoryOverlay::new()),
        Arc::new(FrameSegmenter::new()),
        Arc::clone(&census),
        None,
        storage,
    );

    let coordinator = SessionCoordinator::new(
        Arc::clone(&node),
        SessionConfig::from_config(&config.media),
        ChainTimeouts::from_config(&config.chain),
    );
    let _reaper = coordinator.start_idle_reaper(cancel.child_token());

    let rtmp_addr = config.rtmp_address();
    let rtmp_coordinator = Arc::clone(&coordinator);
    let rtmp_cancel = cancel.child_token();
    tokio::spawn(async move {
        if let Err(e) = rtmp::run_rtmp_server(rtmp_addr, rtmp_coordinator, rtmp_cancel).await {
            tracing::error!("rtmp server error: {}", e);
        }
    });

    let state = mediaserver::AppState {
        coordinator,
        census,
        node,
        chain_timeouts: ChainTimeouts::from_config(&config.chain),
    };
    let http_cancel = cancel.child_token();
    let server = tokio::spawn(mediaserver::serve(config.http_address(), state, http_cancel));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    cancel.cancel();
    let _ = server.await;

    Ok(())
}
