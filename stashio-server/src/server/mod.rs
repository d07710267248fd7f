use crate::config::Config;
use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use stashio_core::{
    BlobStore, Coordinator, CoordinatorOpts, FetchChunksOperation, GetDestinationOperation,
    HashRing, KeyHashPair, Node, PeerClient, ReceiveInfoOperation, Result, StashError,
    StoreChunksOperation,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tower_http::catch_panic::CatchPanicLayer;

mod internal;
mod types;

use internal::{
    announce_new_node, announce_remove_node, get_destination, health, rebase, receive_chunks,
    receive_info, send_chunks, sync_nodes,
};
pub(crate) use types::*;

/// Depth of the replication queue; a full queue back-pressures the
/// spawned post-commit signal, never the client-visible write.
const REPLICATION_QUEUE_DEPTH: usize = 64;

pub struct ServerState {
    pub(crate) ring: Arc<HashRing>,
    pub(crate) get_destination_operation: Arc<GetDestinationOperation>,
    pub(crate) store_chunks_operation: Arc<StoreChunksOperation>,
    pub(crate) fetch_chunks_operation: Arc<FetchChunksOperation>,
    pub(crate) receive_info_operation: Arc<ReceiveInfoOperation>,
    pub(crate) rebase_tx: mpsc::Sender<()>,
    pub(crate) replication_tx: mpsc::Sender<KeyHashPair>,
}

/// Everything a node needs beyond the listener. Kept separate from
/// [`run_server`] so the wiring can be driven end-to-end without signal
/// handling.
pub(crate) struct NodeParts {
    pub(crate) app: Router,
    pub(crate) ring: Arc<HashRing>,
    pub(crate) store: Arc<BlobStore>,
    pub(crate) shutdown_tx: watch::Sender<bool>,
}

pub(crate) async fn assemble_node(
    config: &Config,
    sync: bool,
    announce_new: bool,
) -> Result<NodeParts> {
    let store = Arc::new(BlobStore::open(&config.storage.path)?);
    let ring = Arc::new(HashRing::new());

    let advertise_addr = config.rpc.advertise_addr();
    for address in &config.rpc.nodes {
        ring.add_node(Node::new(address.clone()));
    }
    ring.add_node(Node::new(advertise_addr.clone()));

    let peers = PeerClient::new(config.rpc.timeout());
    let coordinator = Arc::new(Coordinator::new(
        CoordinatorOpts {
            advertise_addr,
            sync_node: if sync { config.rpc.sync_node.clone() } else { None },
            announce_new: announce_new || config.rpc.announce_new,
            health_check_interval: config.rpc.health_check_interval(),
            replication_factor: config.storage.replication_factor,
        },
        ring.clone(),
        store.clone(),
        peers,
    ));

    // membership must be settled before we serve traffic
    coordinator.bootstrap().await?;

    let (rebase_tx, rebase_rx) = mpsc::channel(1);
    let (replication_tx, replication_rx) = mpsc::channel(REPLICATION_QUEUE_DEPTH);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    coordinator.spawn_loops(rebase_rx, replication_rx, shutdown_rx);

    let state = Arc::new(ServerState {
        get_destination_operation: Arc::new(GetDestinationOperation::new(ring.clone())),
        ring: ring.clone(),
        store_chunks_operation: Arc::new(StoreChunksOperation::new(store.clone())),
        fetch_chunks_operation: Arc::new(FetchChunksOperation::new(store.clone())),
        receive_info_operation: Arc::new(ReceiveInfoOperation::new(store.clone())),
        rebase_tx,
        replication_tx,
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/internal/v1/destination", get(get_destination))
        .route("/internal/v1/chunks", post(send_chunks))
        .route("/internal/v1/chunks/:hash", get(receive_chunks))
        .route("/internal/v1/keys", get(receive_info))
        .route(
            "/internal/v1/nodes",
            get(sync_nodes)
                .post(announce_new_node)
                .delete(announce_remove_node),
        )
        .route("/internal/v1/rebase", post(rebase))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(DefaultBodyLimit::disable())
        .with_state(state);

    Ok(NodeParts {
        app,
        ring,
        store,
        shutdown_tx,
    })
}

pub async fn run_server(config: Config, sync: bool, announce_new: bool) -> Result<()> {
    let parts = assemble_node(&config, sync, announce_new).await?;
    tracing::info!(
        members = parts.ring.len(),
        base_dir = %parts.store.base_dir().display(),
        "node state initialized"
    );

    let bind_addr = config.rpc.bind_addr();
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("stashio listening on {}", bind_addr);

    axum::serve(listener, parts.app)
        .with_graceful_shutdown(shutdown_signal(parts.shutdown_tx))
        .await
        .map_err(|error| StashError::Http(error.to_string()))?;

    Ok(())
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => tracing::error!(%error, "failed to install SIGTERM handler"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received, draining in-flight requests");
    let _ = shutdown_tx.send(true);
}

fn handle_panic(_panic: Box<dyn std::any::Any + Send + 'static>) -> Response {
    tracing::error!("recovered from panic in request handler");
    response_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

pub(crate) fn response_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

pub(crate) fn response_for_error(error: StashError) -> Response {
    let status = match &error {
        StashError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        StashError::NotFound(_) => StatusCode::NOT_FOUND,
        StashError::AlreadyExists(_) | StashError::Collision(_) => StatusCode::CONFLICT,
        StashError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    response_error(status, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Env, RpcConfig, StorageConfig};
    use std::time::Duration;

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn node_config(dir: &std::path::Path, port: u16, peer: Option<u16>) -> Config {
        Config {
            env: Env::Dev,
            rpc: RpcConfig {
                port,
                timeout: 5,
                // long interval: tests drive health state directly
                health_check_interval: 3600,
                sync_node: peer.map(|p| format!("127.0.0.1:{}", p)),
                nodes: Vec::new(),
                announce_new: false,
                advertise_addr: Some(format!("127.0.0.1:{}", port)),
            },
            storage: StorageConfig {
                path: dir.join(format!("node-{}", port)),
                replication_factor: 0,
            },
        }
    }

    async fn serve(parts: &NodeParts, port: u16) {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let app = parts.app.clone();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
    }

    /// Pick a port pair whose ring placement actually splits the fixture
    /// keys between both nodes. Placement is a pure function of the
    /// addresses, so this costs nothing but avoids a degenerate fixture.
    fn split_ports(keys: &[String]) -> (u16, u16) {
        loop {
            let (a, b) = (free_port(), free_port());
            if a == b {
                continue;
            }
            let ring = HashRing::new();
            ring.add_node(Node::new(format!("127.0.0.1:{}", a)));
            ring.add_node(Node::new(format!("127.0.0.1:{}", b)));

            let owned_by_b = keys
                .iter()
                .filter(|key| {
                    ring.node_for_key(key)
                        .unwrap()
                        .address
                        .ends_with(&format!(":{}", b))
                })
                .count();
            if owned_by_b > 0 && owned_by_b < keys.len() {
                return (a, b);
            }
        }
    }

    #[tokio::test]
    async fn test_two_node_join_and_rebalance() {
        let dir = tempfile::tempdir().unwrap();
        let keys: Vec<String> = (0..40).map(|i| format!("key-{:02}", i)).collect();
        let (port_a, port_b) = split_ports(&keys);
        let addr_a = format!("127.0.0.1:{}", port_a);
        let addr_b = format!("127.0.0.1:{}", port_b);

        // node A starts alone and takes 40 keys
        let config_a = node_config(dir.path(), port_a, None);
        let node_a = assemble_node(&config_a, false, false).await.unwrap();
        serve(&node_a, port_a).await;

        // distinct payloads: identical bytes would share one content hash
        for key in &keys {
            node_a
                .store
                .save_raw(key, "f.txt", key.as_bytes())
                .await
                .unwrap();
        }

        // node B joins: syncs membership from A and announces itself
        let config_b = node_config(dir.path(), port_b, Some(port_a));
        let node_b = assemble_node(&config_b, true, true).await.unwrap();
        serve(&node_b, port_b).await;

        assert!(node_b.ring.contains(&addr_a));
        assert!(node_a.ring.contains(&addr_b));

        // a synced peer answers the membership listing too
        let peers = PeerClient::new(Duration::from_secs(5));
        let members = peers.sync_nodes(&addr_b).await.unwrap();
        assert_eq!(members.len(), 2);

        // announcing the same address twice is rejected
        let duplicate = stashio_core::NodeInfo {
            address: addr_b.clone(),
            alive: false,
        };
        let err = peers.announce_new(&addr_a, &duplicate).await.unwrap_err();
        assert!(matches!(err, StashError::AlreadyExists(_)));

        // pretend one health tick passed on A, then tell A to rebalance
        node_a.ring.set_alive(&addr_a, true);
        node_a.ring.set_alive(&addr_b, true);
        peers.rebase(&addr_a).await.unwrap();

        let moved: Vec<String> = keys
            .iter()
            .filter(|key| node_a.ring.node_for_key(key).unwrap().address == addr_b)
            .cloned()
            .collect();
        assert!(!moved.is_empty(), "fixture keys all hashed to one node");

        // rebalance runs in the background; wait for it to settle
        for _ in 0..100 {
            if moved
                .iter()
                .all(|key| !node_b.store.hashes_by_key(key).unwrap().is_empty())
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for key in &moved {
            // B now owns the key, A dropped it
            assert!(!node_b.store.hashes_by_key(key).unwrap().is_empty());
            assert!(node_a.store.hashes_by_key(key).unwrap().is_empty());

            let blobs = node_b.store.get(key).await.unwrap();
            assert_eq!(blobs[0].origin_path, "f.txt");
            assert_eq!(blobs[0].payload.as_ref(), key.as_bytes());
        }

        // keys A still owns stayed put
        for key in &keys {
            if !moved.contains(key) {
                assert!(!node_a.store.hashes_by_key(key).unwrap().is_empty());
            }
        }
    }

    #[tokio::test]
    async fn test_send_and_receive_over_the_wire() {
        let dir = tempfile::tempdir().unwrap();
        let port = free_port();
        let addr = format!("127.0.0.1:{}", port);

        let config = node_config(dir.path(), port, None);
        let node = assemble_node(&config, false, false).await.unwrap();
        serve(&node, port).await;

        // stage a compressed blob on "disk" and push it through the wire
        let source_dir = tempfile::tempdir().unwrap();
        let raw = BlobStore::prepare_raw("a.jpg", b"HELLO");
        let hash = stashio_core::content_hash(&raw);
        let packed = stashio_core::packer::pack(&raw);
        let staged = source_dir.path().join("staged");
        std::fs::write(&staged, &packed).unwrap();

        let peers = PeerClient::new(Duration::from_secs(5));
        let size = peers
            .send_chunks(&addr, "photos", &hash, &staged)
            .await
            .unwrap();
        assert_eq!(size, packed.len() as u64);

        // the idempotent replay path: same transfer, same outcome
        let size = peers
            .send_chunks(&addr, "photos", &hash, &staged)
            .await
            .unwrap();
        assert_eq!(size, packed.len() as u64);

        assert_eq!(node.store.hashes_by_key("photos").unwrap(), vec![hash]);
        let blobs = node.store.get("photos").await.unwrap();
        assert_eq!(blobs[0].origin_path, "a.jpg");
        assert_eq!(blobs[0].payload.as_ref(), b"HELLO");

        // a probe against the serving node flips its health flag up
        let probed = peers
            .check_health(vec![stashio_core::Node::new(addr.clone())])
            .await;
        assert_eq!(probed.len(), 1);
        assert!(probed[0].alive);
    }
}
