//! # depot-broker
//!
//! Registry of `root name -> publisher endpoint` bindings plus a server-sent
//! event bus fanning out registration changes. The broker keeps no durable
//! state: publishers re-register on startup and on a heartbeat interval.

/// Error types and handling
pub mod errors;

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
};
use chrono::Utc;
use dashmap::DashMap;
use futures::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{info, warn};

use depot_core::models::{
    BusEvent, LocateResponse, RegisterRequest, RegisterResponse, RootBinding, RootEntry,
};

use crate::errors::{AppError, AppResult};

/// Bus events buffered per consumer before the oldest are shed.
const BUS_BUFFER: usize = 64;

/// Shared broker state.
#[derive(Clone, Debug)]
pub struct AppState {
    registry: Arc<DashMap<String, RootBinding>>,
    bus: tokio::sync::broadcast::Sender<BusEvent>,
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

impl AppState {
    pub fn new() -> AppState {
        let (bus, _) = tokio::sync::broadcast::channel(BUS_BUFFER);
        AppState {
            registry: Arc::new(DashMap::new()),
            bus,
        }
    }

    fn publish(&self, event: BusEvent) {
        // Send fails only when nobody is listening.
        let _ = self.bus.send(event);
    }
}

/// Build the broker router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/roots", get(roots_handler))
        .route("/api/register", post(register_handler))
        .route("/api/unregister", post(unregister_handler))
        .route("/api/locate/{root}", get(locate_handler))
        .route("/api/bus", get(bus_handler))
        .with_state(state)
}

async fn roots_handler(State(state): State<AppState>) -> Json<BTreeMap<String, RootEntry>> {
    let roots = state
        .registry
        .iter()
        .map(|entry| (entry.key().clone(), entry.value().entry()))
        .collect();
    Json(roots)
}

/// Bind a root to a publisher endpoint. Last writer wins: a displaced
/// publisher learns about it from the bus and must stop serving the root.
async fn register_handler(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> AppResult<Json<RegisterResponse>> {
    if request.root.is_empty() || request.root.contains('/') {
        return Err(AppError::bad_request(format!(
            "invalid root name: {:?}",
            request.root
        )));
    }
    if request.endpoint.is_empty() {
        return Err(AppError::bad_request("empty publisher endpoint"));
    }

    let binding = RootBinding {
        name: request.root.clone(),
        http: request.endpoint.clone(),
        last_seen: Utc::now(),
    };
    let previous = state
        .registry
        .insert(request.root.clone(), binding)
        .map(|prior| prior.http);

    match &previous {
        Some(prior) if *prior != request.endpoint => {
            info!(root = %request.root, from = %prior, to = %request.endpoint, "root rebound");
            state.publish(BusEvent::Evicted {
                root: request.root.clone(),
                endpoint: prior.clone(),
            });
        }
        Some(_) => {}
        None => info!(root = %request.root, endpoint = %request.endpoint, "root registered"),
    }
    state.publish(BusEvent::Registered {
        root: request.root,
        endpoint: request.endpoint,
    });

    Ok(Json(RegisterResponse { previous }))
}

/// Drop a binding, but only for the publisher that owns it.
async fn unregister_handler(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> AppResult<Json<RegisterResponse>> {
    let removed = state
        .registry
        .remove_if(&request.root, |_, binding| binding.http == request.endpoint);

    match removed {
        Some((root, binding)) => {
            info!(root = %root, "root unregistered");
            state.publish(BusEvent::Unregistered { root });
            Ok(Json(RegisterResponse {
                previous: Some(binding.http),
            }))
        }
        None => Ok(Json(RegisterResponse { previous: None })),
    }
}

async fn locate_handler(
    State(state): State<AppState>,
    Path(root): Path<String>,
) -> AppResult<Json<LocateResponse>> {
    match state.registry.get(&root) {
        Some(binding) => Ok(Json(LocateResponse {
            endpoint: binding.http.clone(),
        })),
        None => Err(AppError::not_found(format!("unknown root: {root}"))),
    }
}

/// Long-lived SSE channel carrying registry events.
async fn bus_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.bus.subscribe()).filter_map(|event| match event {
        Ok(event) => Event::default().json_data(&event).ok().map(Ok),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            warn!(skipped, "bus consumer lagged, shedding events");
            None
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
