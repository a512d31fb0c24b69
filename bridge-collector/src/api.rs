use std::collections::HashMap;
use std::convert::Infallible;
use std::future::ready;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::{routing::get, Json, Router};
use futures::stream::{self, Stream};
use health::HealthRegistry;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, warn};

use bridge_common::cache::{AggregateCache, CacheError};
use bridge_common::types::AggregateKind;

use crate::publisher::BroadcastPublisher;

#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<dyn AggregateCache>,
    pub publisher: BroadcastPublisher,
    pub liveness: HealthRegistry,
}

#[derive(Serialize, Debug)]
pub struct TotalResponse {
    pub kind: AggregateKind,
    pub key: String,
    pub total: String,
}

#[derive(Serialize, Debug)]
pub struct ErrorResponse {
    pub error: String,
    pub cause: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn unavailable(what: &str, err: CacheError) -> ApiError {
    error!("failed to read {}: {}", what, err);
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorResponse {
            error: format!("failed to read {what}"),
            cause: err.to_string(),
        }),
    )
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(|| ready("ok")))
        .route("/_liveness", get(liveness))
        .route("/metrics/total_volume", get(total_volumes))
        .route("/metrics/total_volume/:token", get(token_volume))
        .route("/metrics/chain/:chain_id", get(chain_count))
        .route("/metrics/bridge/:bridge_name", get(bridge_usage))
        .route("/updates", get(updates))
        .with_state(state)
}

pub async fn index() -> &'static str {
    "bridge-collector"
}

async fn liveness(State(state): State<AppState>) -> health::HealthStatus {
    state.liveness.get_status()
}

async fn total_volumes(
    State(state): State<AppState>,
) -> Result<Json<HashMap<String, String>>, ApiError> {
    state
        .cache
        .get_all(AggregateKind::TokenVolume)
        .await
        .map(Json)
        .map_err(|err| unavailable("token volumes", err))
}

async fn total(
    state: &AppState,
    kind: AggregateKind,
    key: String,
) -> Result<Json<TotalResponse>, ApiError> {
    let total = state
        .cache
        .get_current(kind, &key)
        .await
        .map_err(|err| unavailable(kind.as_str(), err))?;

    Ok(Json(TotalResponse { kind, key, total }))
}

async fn token_volume(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<TotalResponse>, ApiError> {
    total(&state, AggregateKind::TokenVolume, token).await
}

async fn chain_count(
    State(state): State<AppState>,
    Path(chain_id): Path<String>,
) -> Result<Json<TotalResponse>, ApiError> {
    total(&state, AggregateKind::ChainTxCount, chain_id).await
}

async fn bridge_usage(
    State(state): State<AppState>,
    Path(bridge_name): Path<String>,
) -> Result<Json<TotalResponse>, ApiError> {
    total(&state, AggregateKind::BridgeUseCount, bridge_name).await
}

/// Server-sent events stream of relayed aggregate updates. A client that
/// falls behind skips what it missed.
async fn updates(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.publisher.connect();

    let events = stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(message) => {
                    let event = Event::default()
                        .event(message.event)
                        .data(message.data.to_string());
                    return Some((Ok(event), receiver));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "realtime client lagged behind");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}
