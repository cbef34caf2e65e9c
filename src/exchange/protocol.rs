use std::{net::SocketAddr, sync::Arc};

use anyhow::{anyhow, Result};
use axum::{
    extract::{Extension, Path},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use log::{debug, warn};
use reqwest::Client;

use crate::{
    block::{BlockStore, ContentHandle},
    identity::ParticipantIdentity,
};

struct ExchangeState {
    identity: ParticipantIdentity,
    store: Arc<dyn BlockStore>,
}

pub fn router(identity: ParticipantIdentity, store: Arc<dyn BlockStore>) -> Router {
    let state = Arc::new(ExchangeState { identity, store });

    Router::new()
        .route("/exchange/identity", get(identity_handler))
        .route("/exchange/block/:handle", get(block_handler))
        .layer(Extension(state))
}

async fn identity_handler(Extension(state): Extension<Arc<ExchangeState>>) -> impl IntoResponse {
    Json(state.identity.clone())
}

async fn block_handler(
    Extension(state): Extension<Arc<ExchangeState>>,
    Path(handle): Path<String>,
) -> impl IntoResponse {
    let handle = match handle.parse::<ContentHandle>() {
        Ok(handle) => handle,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("{e}. ")).into_response(),
    };

    match state.store.get(&handle) {
        Ok(Some(block)) => {
            debug!("Serving block {handle}. ");
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/octet-stream")],
                block.data,
            ).into_response()
        },
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            let message = format!("Failed to read block {handle}: {e}. ");
            warn!("{message}");
            (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
        },
    }
}

pub async fn get_peer_identity(client: &Client, addr: &SocketAddr) -> Result<ParticipantIdentity> {
    let uri = format!("http://{addr}/exchange/identity");
    let response = client.get(uri).send().await?;

    if !response.status().is_success() {
        return Err(anyhow!("identity request returned {}", response.status()));
    }

    Ok(response.json().await?)
}

/// `None` when the peer answers but does not hold the block.
pub async fn get_peer_block(client: &Client, addr: &SocketAddr, handle: &ContentHandle) -> Result<Option<Bytes>> {
    let uri = format!("http://{addr}/exchange/block/{handle}");
    let response = client.get(uri).send().await?;

    match response.status().as_u16() {
        200 => Ok(Some(response.bytes().await?)),
        404 => Ok(None),
        _ => {
            let text = response.text().await?;
            Err(anyhow!("peer {addr} failed to serve block: {text}"))
        },
    }
}
