use axum::{
    Json, Router,
    extract::{Extension, Query},
    http::StatusCode,
    routing::get,
};
use std::sync::Arc;

use super::protocol::*;
use crate::cmap::{CMap, CMapManager, Node, NodeId, UpdateOutcome, Volume, VolumeId};

pub fn router(manager: Arc<CMapManager>) -> Router {
    Router::new()
        .route(ENDPOINT_CMAP, get(handle_get_cmap).post(handle_update_cmap))
        .route(ENDPOINT_CMAP_VERSION, get(handle_get_version))
        .route(ENDPOINT_SEARCH_NODE, get(handle_search_node))
        .route(ENDPOINT_SEARCH_VOLUME, get(handle_search_volume))
        .layer(Extension(manager))
}

pub async fn handle_get_cmap(
    Extension(manager): Extension<Arc<CMapManager>>,
) -> (StatusCode, Json<CMap>) {
    (StatusCode::OK, Json(manager.latest_snapshot()))
}

pub async fn handle_get_version(
    Extension(manager): Extension<Arc<CMapManager>>,
) -> (StatusCode, Json<VersionResponse>) {
    (
        StatusCode::OK,
        Json(VersionResponse {
            version: manager.latest_version(),
        }),
    )
}

pub async fn handle_update_cmap(
    Extension(manager): Extension<Arc<CMapManager>>,
    Json(cmap): Json<CMap>,
) -> (StatusCode, Json<UpdateResponse>) {
    let submitted = cmap.version;

    match manager.update(cmap) {
        Ok(UpdateOutcome::Committed(version)) => (
            StatusCode::OK,
            Json(UpdateResponse {
                committed: true,
                version,
            }),
        ),
        Ok(UpdateOutcome::Stale { current }) => {
            tracing::debug!("Rejected stale cmap v{} (current v{})", submitted, current);
            (
                StatusCode::OK,
                Json(UpdateResponse {
                    committed: false,
                    version: current,
                }),
            )
        }
        Err(e) => {
            tracing::error!("Failed to update cmap to v{}: {}", submitted, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(UpdateResponse {
                    committed: false,
                    version: manager.latest_version(),
                }),
            )
        }
    }
}

pub async fn handle_search_node(
    Extension(manager): Extension<Arc<CMapManager>>,
    Query(params): Query<NodeSearchParams>,
) -> (StatusCode, Json<SearchResponse<Node>>) {
    let call = manager.search_call();

    let mut query = call.node();
    if let Some(id) = params.id {
        query = query.id(NodeId(id));
    }
    if let Some(name) = params.name.as_deref() {
        query = query.name(name);
    }
    if let Some(node_type) = params.node_type {
        query = query.node_type(node_type);
    }
    if let Some(status) = params.status {
        query = query.status(status);
    }
    if params.random {
        query = query.random();
    }

    let version = call.version();
    match query.find() {
        Ok(node) => (
            StatusCode::OK,
            Json(SearchResponse {
                version,
                found: Some(node),
            }),
        ),
        Err(_) => (
            StatusCode::NOT_FOUND,
            Json(SearchResponse {
                version,
                found: None,
            }),
        ),
    }
}

pub async fn handle_search_volume(
    Extension(manager): Extension<Arc<CMapManager>>,
    Query(params): Query<VolumeSearchParams>,
) -> (StatusCode, Json<SearchResponse<Volume>>) {
    let call = manager.search_call();

    let mut query = call.volume();
    if let Some(id) = params.id {
        query = query.id(VolumeId(id));
    }
    if let Some(status) = params.status {
        query = query.status(status);
    }
    if let Some(speed) = params.speed {
        query = query.speed(speed);
    }
    if let Some(owner) = params.owner {
        query = query.owner(NodeId(owner));
    }
    if params.random {
        query = query.random();
    }

    let version = call.version();
    match query.find() {
        Ok(volume) => (
            StatusCode::OK,
            Json(SearchResponse {
                version,
                found: Some(volume),
            }),
        ),
        Err(_) => (
            StatusCode::NOT_FOUND,
            Json(SearchResponse {
                version,
                found: None,
            }),
        ),
    }
}
