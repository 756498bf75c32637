//! # depot-subscriber
//!
//! The client-facing cache of the fleet. Discovers publishers through the
//! broker, mirrors subscribed roots lazily chunk-by-chunk, resolves slice
//! requests against partially materialized shadow containers, and keeps the
//! cache coherent through per-dataset ETags.

/// Error types and handling
pub mod errors;

/// Root mirrors, shadow containers, single-flight, quota eviction
pub mod cache;

/// Slice fetch pipeline and wire encodings
pub mod fetch;

/// Whole-dataset downloads with optional slice suffixes
pub mod download;

/// Background change subscriptions
pub mod changes;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, header},
    response::Response,
    routing::{get, post},
};

use depot_core::models::{DatasetMeta, SubscribedRoot};

use crate::cache::SubCache;
use crate::errors::AppResult;
use crate::fetch::FetchQuery;

/// Shared subscriber state.
#[derive(Clone, Debug)]
pub struct AppState {
    pub cache: Arc<SubCache>,
}

/// Build the subscriber router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/roots", get(roots_handler))
        .route("/api/subscribe/{root}", post(subscribe_handler))
        .route("/api/list/{root}", get(list_handler))
        .route("/api/info/{root}/{*path}", get(info_handler))
        .route("/api/fetch/{root}/{*path}", get(fetch_handler))
        .route("/files/{root}/{*path}", get(files_handler))
        .with_state(state)
}

/// The opaque bearer cookie, forwarded verbatim to broker and publishers.
fn cookie_of(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

/// Roots known to the broker, annotated with subscription status.
async fn roots_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<BTreeMap<String, SubscribedRoot>>> {
    let client = state.cache.client(cookie_of(&headers));
    let roots = state.cache.broker_roots(&client).await?;
    let annotated = roots
        .into_iter()
        .map(|(name, entry)| {
            let subscribed = state.cache.subscribed(&name);
            (
                name,
                SubscribedRoot {
                    name: entry.name,
                    http: entry.http,
                    subscribed,
                },
            )
        })
        .collect();
    Ok(Json(annotated))
}

/// Idempotent subscription; responds with the literal string `Ok`.
async fn subscribe_handler(
    State(state): State<AppState>,
    Path(root): Path<String>,
    headers: HeaderMap,
) -> AppResult<&'static str> {
    let client = state.cache.client(cookie_of(&headers));
    let mirror = state.cache.subscribe(&root, &client).await?;
    if state.cache.settings().change_subscription {
        changes::spawn(state.cache.clone(), mirror);
    }
    Ok("Ok")
}

async fn list_handler(
    State(state): State<AppState>,
    Path(root): Path<String>,
) -> AppResult<Json<Vec<String>>> {
    let mirror = state.cache.mirror(&root)?;
    let catalog = mirror.catalog.read().await.clone();
    Ok(Json(catalog))
}

async fn info_handler(
    State(state): State<AppState>,
    Path((root, path)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<Json<DatasetMeta>> {
    let client = state.cache.client(cookie_of(&headers));
    let (mirror, entry) = state.cache.dataset(&root, &path, &client).await?;
    let meta = state.cache.ensure_meta(&mirror, &entry, &client).await?;
    Ok(Json(meta))
}

async fn fetch_handler(
    State(state): State<AppState>,
    Path((root, path)): Path<(String, String)>,
    Query(query): Query<FetchQuery>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let client = state.cache.client(cookie_of(&headers));
    let (mirror, entry) = state.cache.dataset(&root, &path, &client).await?;

    let expr = query.slice.unwrap_or_default();
    let (meta, sel, bytes) =
        fetch::fetch_slice(&state.cache, &mirror, &entry, &client, &expr).await?;

    let response = fetch::encode_response(
        &meta,
        &sel,
        bytes,
        query.prefer_schunk.unwrap_or(false),
        state.cache.settings().schunk_wire_threshold,
    )
    .await?;
    Ok(response)
}

async fn files_handler(
    State(state): State<AppState>,
    Path((root, path)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let client = state.cache.client(cookie_of(&headers));
    let (real_path, slice_expr) = download::split_slice_suffix(&path)?;
    let (mirror, entry) = state.cache.dataset(&root, &real_path, &client).await?;

    let response = download::download(
        &state.cache,
        &mirror,
        &entry,
        &client,
        &root,
        &path,
        slice_expr.as_deref(),
    )
    .await?;
    Ok(response)
}

/// Expose whether any subscribed root currently has a degraded change
/// subscription; used by operators and tests.
pub fn any_degraded(state: &AppState) -> bool {
    state
        .cache
        .mirrors()
        .iter()
        .any(|mirror| mirror.degraded.load(Ordering::Relaxed))
}
