use super::{
    response_error, response_for_error, ChunkQuery, KeyInfoResponse, KeyQuery, SendStatusResponse,
    ServerState,
};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use stashio_core::cluster::client::{
    HEADER_COMPRESSED, HEADER_CONTENT_HASH, HEADER_FILE_PATH, HEADER_KEY, HEADER_REPLICATE,
};
use stashio_core::{FetchChunksRequest, KeyHashPair, Node, NodeInfo, StoreChunksRequest};
use std::sync::Arc;

pub(crate) async fn health() -> &'static str {
    "OK"
}

pub(crate) async fn get_destination(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<KeyQuery>,
) -> impl IntoResponse {
    let key = query.key.unwrap_or_default();
    match state.get_destination_operation.run(&key) {
        Ok(info) => (StatusCode::OK, Json(info)).into_response(),
        Err(error) => response_for_error(error),
    }
}

pub(crate) async fn send_chunks(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let key = header_string(&headers, HEADER_KEY);
    let replicate = header_flag(&headers, HEADER_REPLICATE);

    let request = StoreChunksRequest {
        key: key.clone(),
        compressed: header_flag(&headers, HEADER_COMPRESSED),
        content_hash: optional_header(&headers, HEADER_CONTENT_HASH),
        file_path: optional_header(&headers, HEADER_FILE_PATH),
        body,
    };

    match state.store_chunks_operation.run(request).await {
        Ok(result) => {
            if replicate {
                let pair = KeyHashPair {
                    key,
                    hash: result.content_hash,
                };
                let replication_tx = state.replication_tx.clone();
                // post-commit signal; the reply must not wait on a full queue
                tokio::spawn(async move {
                    if replication_tx.send(pair).await.is_err() {
                        tracing::warn!("replication worker is gone, dropping fan-out request");
                    }
                });
            }
            (StatusCode::OK, Json(SendStatusResponse { size: result.size })).into_response()
        }
        Err(error) => response_for_error(error),
    }
}

pub(crate) async fn receive_info(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<KeyQuery>,
) -> impl IntoResponse {
    let key = query.key.unwrap_or_default();
    match state.receive_info_operation.run(&key) {
        Ok(hashes) => (
            StatusCode::OK,
            Json(KeyInfoResponse {
                size: hashes.len() as u32,
                hashes,
            }),
        )
            .into_response(),
        Err(error) => response_for_error(error),
    }
}

pub(crate) async fn receive_chunks(
    State(state): State<Arc<ServerState>>,
    Path(hash): Path<String>,
    Query(query): Query<ChunkQuery>,
) -> impl IntoResponse {
    let request = FetchChunksRequest {
        hash,
        decompress: query.decompress.unwrap_or(false),
    };

    match state.fetch_chunks_operation.run(request).await {
        Ok(bytes) => {
            let mut response = Response::new(bytes.into());
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
            response
        }
        Err(error) => response_for_error(error),
    }
}

pub(crate) async fn sync_nodes(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let nodes: Vec<NodeInfo> = state.ring.nodes().into_iter().map(NodeInfo::from).collect();
    (StatusCode::OK, Json(nodes)).into_response()
}

pub(crate) async fn rebase(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    // tokens coalesce: with one already pending, another pass is
    // guaranteed anyway
    let _ = state.rebase_tx.try_send(());
    StatusCode::OK
}

pub(crate) async fn announce_new_node(
    State(state): State<Arc<ServerState>>,
    Json(node): Json<NodeInfo>,
) -> impl IntoResponse {
    if node.address.trim().is_empty() {
        return response_error(StatusCode::BAD_REQUEST, "empty node address");
    }

    if state.ring.contains(&node.address) {
        return response_error(StatusCode::CONFLICT, "node already exists in ring");
    }

    tracing::info!(address = %node.address, "adding announced node to ring");
    state.ring.add_node(Node::new(node.address));
    StatusCode::OK.into_response()
}

pub(crate) async fn announce_remove_node(
    State(state): State<Arc<ServerState>>,
    Json(node): Json<NodeInfo>,
) -> impl IntoResponse {
    if node.address.trim().is_empty() {
        return response_error(StatusCode::BAD_REQUEST, "empty node address");
    }

    if !state.ring.remove_node(&node.address) {
        return response_error(StatusCode::NOT_FOUND, "node does not exist in ring");
    }

    tracing::info!(address = %node.address, "removed node from ring");
    StatusCode::OK.into_response()
}

fn header_string(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn optional_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .filter(|value| !value.is_empty())
}

fn header_flag(headers: &HeaderMap, name: &str) -> bool {
    matches!(
        headers.get(name).and_then(|value| value.to_str().ok()),
        Some("true") | Some("1")
    )
}
