//! HTTP admin endpoints for the cluster join flow
//!
//! A joining node POSTs its url to `/data_nodes` on any peer to be assigned
//! an id, then POSTs `/metastore` to download a consistent snapshot of the
//! peer's metastore.

use crate::server::{DataNodeJson, Server};
use crate::Error;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use std::sync::Arc;
use url::Url;

/// Build the admin router for a server.
pub fn build_admin_router(server: Arc<Server>) -> Router {
    Router::new()
        .route("/data_nodes", post(create_data_node))
        .route("/metastore", post(copy_metastore))
        .with_state(server)
}

async fn create_data_node(
    State(server): State<Arc<Server>>,
    Json(body): Json<DataNodeJson>,
) -> Response {
    let url = match Url::parse(&body.url) {
        Ok(url) => url,
        Err(_) => return (StatusCode::BAD_REQUEST, "invalid url").into_response(),
    };

    match server.create_data_node(&url).await {
        Ok(()) => {}
        Err(Error::DataNodeExists) => {
            // Idempotent rejoin: fall through and return the existing node.
        }
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }

    match server.data_node_by_url(&url) {
        Some(node) => (
            StatusCode::CREATED,
            Json(DataNodeJson {
                id: node.id,
                url: node.url.to_string(),
            }),
        )
            .into_response(),
        None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn copy_metastore(State(server): State<Arc<Server>>) -> Response {
    match server.metastore_snapshot() {
        Ok(image) => (
            StatusCode::OK,
            [(header::CONTENT_LENGTH, image.len().to_string())],
            image,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
