//! # depot-publisher
//!
//! Serves one named root of chunked datasets: catalog enumeration,
//! per-dataset metadata with ETags, chunk-granularity reads, and a
//! server-sent stream of coalesced change batches. Registers itself with
//! the broker and steps aside when the broker rebinds its root elsewhere.

/// Error types and handling
pub mod errors;

/// Broker registration, heartbeat, and eviction handling
pub mod registration;

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, header},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::get,
};
use futures::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

use depot_core::models::DatasetMeta;
use depot_core::pubroot::{DirectoryRoot, PubRoot};

use crate::errors::{AppError, AppResult};

/// Shared publisher state.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Root name as registered with the broker.
    pub name: String,
    pub root: Arc<DirectoryRoot>,
    /// Set when the broker rebinds the root to another publisher; data
    /// endpoints refuse to serve from then on.
    pub revoked: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(name: String, root: DirectoryRoot) -> AppState {
        AppState {
            name,
            root: Arc::new(root),
            revoked: Arc::new(AtomicBool::new(false)),
        }
    }

    fn guard(&self) -> AppResult<()> {
        if self.revoked.load(Ordering::Relaxed) {
            return Err(AppError::revoked());
        }
        Ok(())
    }
}

/// Build the publisher router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/list", get(list_handler))
        .route("/api/info/{*path}", get(info_handler))
        .route("/api/chunk/{*rest}", get(chunk_handler))
        .route("/api/changes", get(changes_handler))
        .with_state(state)
}

async fn list_handler(State(state): State<AppState>) -> AppResult<Json<Vec<String>>> {
    state.guard()?;
    Ok(Json(state.root.walk_dsets().await?))
}

async fn info_handler(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> AppResult<Response> {
    state.guard()?;
    let meta: DatasetMeta = state.root.dset_meta(&path).await?;
    let etag = meta.etag.clone();
    let mut response = Json(meta).into_response();
    if let Ok(value) = etag.parse() {
        response.headers_mut().insert(header::ETAG, value);
    }
    Ok(response)
}

/// `GET /api/chunk/<path>/<n>`: the chunk index is the trailing segment of
/// the wildcard, so dataset paths may contain directories.
async fn chunk_handler(
    State(state): State<AppState>,
    Path(rest): Path<String>,
    headers: HeaderMap,
) -> AppResult<Response> {
    state.guard()?;
    let (path, nchunk) = split_chunk_path(&rest)?;

    let read = state.root.dset_chunk(path, nchunk).await?;

    // A caller pinning a version must never get bytes from another one.
    if let Some(expected) = headers.get(header::IF_MATCH).and_then(|v| v.to_str().ok()) {
        if expected != read.etag {
            return Err(AppError::etag_mismatch(read.etag));
        }
    }

    let mut response = (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        read.payload,
    )
        .into_response();
    if let Ok(value) = read.etag.parse() {
        response.headers_mut().insert(header::ETAG, value);
    }
    Ok(response)
}

fn split_chunk_path(rest: &str) -> AppResult<(&str, u64)> {
    let (path, index) = rest.rsplit_once('/').ok_or_else(|| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "bad_request",
            format!("chunk request needs a path and an index: {rest:?}"),
        )
    })?;
    let nchunk = index.parse::<u64>().map_err(|_| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "bad_request",
            format!("invalid chunk index: {index:?}"),
        )
    })?;
    Ok((path, nchunk))
}

/// Streamed change batches. Consumers that fall behind lose the oldest
/// batches rather than blocking the watcher.
async fn changes_handler(
    State(state): State<AppState>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    state.guard()?;
    let stream = BroadcastStream::new(state.root.watch_dsets()).filter_map(|batch| match batch {
        Ok(batch) => Event::default().json_data(&batch).ok().map(Ok),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            warn!(skipped, "changes consumer lagged, shedding batches");
            None
        }
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum_test::TestServer;
    use depot_core::container;
    use depot_core::models::{DatasetKind, Vlmeta};

    fn example_root(dir: &std::path::Path) {
        let data: Vec<u8> = (0..1000_i32).flat_map(|v| v.to_le_bytes()).collect();
        container::write_nd(
            &dir.join("ds-1d.b2nd"),
            "i4",
            &[1000],
            &[100],
            &data,
            Vlmeta::new(),
        )
        .unwrap();
        container::write_frame(
            &dir.join("ds-hello.b2frame"),
            b"Hello world!Hello world!",
            10,
            Vlmeta::new(),
        )
        .unwrap();
        std::fs::write(dir.join("README.md"), b"This is a simple example").unwrap();
    }

    fn server(dir: &std::path::Path) -> (TestServer, AppState) {
        example_root(dir);
        let state = AppState::new("foo".into(), DirectoryRoot::open(dir).unwrap());
        (TestServer::new(router(state.clone())).unwrap(), state)
    }

    #[tokio::test]
    async fn list_is_sorted_and_stable() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _) = server(dir.path());
        let first: Vec<String> = server.get("/api/list").await.json();
        assert_eq!(first, vec!["README.md", "ds-1d.b2nd", "ds-hello.b2frame"]);
        let second: Vec<String> = server.get("/api/list").await.json();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn info_carries_etag_header() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _) = server(dir.path());

        let response = server.get("/api/info/ds-1d.b2nd").await;
        response.assert_status_ok();
        let meta: DatasetMeta = response.json();
        assert_eq!(meta.kind, DatasetKind::B2nd);
        assert_eq!(meta.chunk_count, 10);
        assert_eq!(
            response.headers().get("etag").unwrap().to_str().unwrap(),
            meta.etag
        );
    }

    #[tokio::test]
    async fn chunk_respects_if_match() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _) = server(dir.path());

        let meta: DatasetMeta = server.get("/api/info/ds-1d.b2nd").await.json();

        let response = server
            .get("/api/chunk/ds-1d.b2nd/0")
            .add_header(
                axum::http::header::IF_MATCH,
                meta.etag.parse::<axum::http::HeaderValue>().unwrap(),
            )
            .await;
        response.assert_status_ok();
        let block = container::decompress_chunk(response.as_bytes(), 400).unwrap();
        assert_eq!(&block[..4], &0_i32.to_le_bytes());

        let response = server
            .get("/api/chunk/ds-1d.b2nd/0")
            .add_header(
                axum::http::header::IF_MATCH,
                axum::http::HeaderValue::from_static("0.0:0"),
            )
            .await;
        response.assert_status(axum::http::StatusCode::CONFLICT);
        let body: serde_json::Value = response.json();
        assert_eq!(body["error"]["code"], "etag_mismatch");
    }

    #[tokio::test]
    async fn chunk_index_out_of_range_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _) = server(dir.path());
        let response = server.get("/api/chunk/ds-1d.b2nd/10").await;
        response.assert_status_not_found();
        server
            .get("/api/chunk/README.md/1")
            .await
            .assert_status_not_found();
    }

    #[tokio::test]
    async fn escaping_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _) = server(dir.path());
        let response = server.get("/api/info/../../etc/passwd").await;
        response.assert_status_bad_request();
        let body: serde_json::Value = response.json();
        assert_eq!(body["error"]["code"], "path_invalid");
    }

    #[tokio::test]
    async fn revoked_root_refuses_data_requests() {
        let dir = tempfile::tempdir().unwrap();
        let (server, state) = server(dir.path());
        state.revoked.store(true, Ordering::Relaxed);

        let response = server.get("/api/list").await;
        response.assert_status(axum::http::StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = response.json();
        assert_eq!(body["error"]["code"], "root_revoked");
    }
}
