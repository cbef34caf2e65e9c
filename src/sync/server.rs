use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use axum::{
    extract::{Extension, Json},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use log::debug;
use tokio::time::timeout;

use crate::sync::{protocol::*, SyncService};

struct SyncState {
    service: SyncService,
    poll_interval: Duration,
}

pub fn router(service: SyncService, poll_interval: Duration) -> Router {
    let state = Arc::new(SyncState {
        service,
        poll_interval,
    });

    Router::new()
        .route("/sync/publish", post(publish_handler))
        .route("/sync/subscribe", get(subscribe_handler))
        .route("/sync/signal", post(signal_handler))
        .route("/sync/barrier", get(barrier_handler))
        .layer(Extension(state))
}

async fn publish_handler(
    Extension(state): Extension<Arc<SyncState>>,
    Json(request): Json<PublishRequest>,
) -> impl IntoResponse {
    match state.service.publish_value(&request.topic, request.payload).await {
        Ok(seq) => Json(PublishResponse { seq }).into_response(),
        Err(e) => {
            let message = format!("Failed to process request: {e}. ");
            (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
        },
    }
}

async fn subscribe_handler(
    Extension(state): Extension<Arc<SyncState>>,
    Json(request): Json<SubscribeRequest>,
) -> impl IntoResponse {
    match subscribe_impl(&state, request).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => {
            let message = format!("Failed to process request: {e}. ");
            (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
        },
    }
}

async fn subscribe_impl(state: &SyncState, request: SubscribeRequest) -> Result<SubscribeResponse> {
    let mut rx = state.service.subscribe_from(&request.topic, request.cursor)?;

    let first = match timeout(state.poll_interval, rx.recv()).await {
        Ok(Some(value)) => value,
        Ok(None) => return Err(anyhow!("sync service is shut down")),
        Err(_) => {
            debug!("Nothing new on topic {} past {}. ", request.topic, request.cursor);
            return Ok(SubscribeResponse { values: vec![] });
        },
    };

    let mut values = vec![first];
    while let Ok(value) = rx.try_recv() {
        values.push(value);
    }

    Ok(SubscribeResponse { values })
}

async fn signal_handler(
    Extension(state): Extension<Arc<SyncState>>,
    Json(request): Json<SignalRequest>,
) -> impl IntoResponse {
    match state.service.signal(&request.state).await {
        Ok(seq) => Json(SignalResponse { seq }).into_response(),
        Err(e) => {
            let message = format!("Failed to process request: {e}. ");
            (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
        },
    }
}

async fn barrier_handler(
    Extension(state): Extension<Arc<SyncState>>,
    Json(request): Json<BarrierRequest>,
) -> impl IntoResponse {
    match barrier_impl(&state, request).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => {
            let message = format!("Failed to process request: {e}. ");
            (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
        },
    }
}

async fn barrier_impl(state: &SyncState, request: BarrierRequest) -> Result<BarrierResponse> {
    let wait = state.service.wait(&request.state, request.target);

    let response = match timeout(state.poll_interval, wait).await {
        Ok(count) => BarrierResponse {
            count: count?,
            reached: true,
        },
        Err(_) => BarrierResponse {
            count: state.service.count(&request.state).await?,
            reached: false,
        },
    };

    Ok(response)
}
