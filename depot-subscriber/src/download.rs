//! Whole-dataset downloads under `/files/{root}/{path}`.
//!
//! A `[slice]` suffix between the file stem and its extension restricts the
//! download to that region: `ds-1d[10:20].b2nd` is the slice `10:20` of
//! `ds-1d.b2nd`. Every download is materialized under the cache's
//! `downloads/` tree first — sliced container downloads as fresh container
//! files, opaque files as their original bytes — and the materialized file
//! is then streamed to the client.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use tokio_util::io::ReaderStream;
use tracing::debug;

use depot_core::client::ApiClient;
use depot_core::container;
use depot_core::error::{DepotError, Result};
use depot_core::models::DatasetKind;

use crate::cache::{DatasetEntry, RootMirror, SubCache};
use crate::fetch;

/// Split a `[slice]` suffix off a request path. The suffix sits between the
/// stem and the extension (or at the end for extensionless names).
pub fn split_slice_suffix(path: &str) -> Result<(String, Option<String>)> {
    let (dir, name) = match path.rsplit_once('/') {
        Some((dir, name)) => (Some(dir), name),
        None => (None, path),
    };

    let Some(open) = name.rfind('[') else {
        return Ok((path.to_owned(), None));
    };
    let Some(close) = name[open..].find(']').map(|i| open + i) else {
        return Err(DepotError::PathInvalid(format!(
            "unterminated slice suffix in {name:?}"
        )));
    };
    let rest = &name[close + 1..];
    if !(rest.is_empty() || rest.starts_with('.')) {
        return Err(DepotError::PathInvalid(format!(
            "malformed slice suffix in {name:?}"
        )));
    }

    let real_name = format!("{}{rest}", &name[..open]);
    let real_path = match dir {
        Some(dir) => format!("{dir}/{real_name}"),
        None => real_name,
    };
    Ok((real_path, Some(name[open + 1..close].to_owned())))
}

/// Serve a dataset download, honoring an optional slice suffix.
pub async fn download(
    cache: &Arc<SubCache>,
    mirror: &Arc<RootMirror>,
    entry: &Arc<DatasetEntry>,
    client: &ApiClient,
    root: &str,
    requested_path: &str,
    slice_expr: Option<&str>,
) -> Result<Response> {
    let kind = DatasetKind::from_relpath(&entry.relpath);

    let bytes = match (kind, slice_expr) {
        // Whole container: hand out the fully materialized frame.
        (DatasetKind::B2nd | DatasetKind::B2frame, None) => {
            let (_, frame) = fetch::materialized_cframe(cache, mirror, entry, client).await?;
            frame
        }

        // Sliced container: a fresh container restricted to the region.
        (DatasetKind::B2nd | DatasetKind::B2frame, Some(expr)) => {
            let (meta, sel, bytes) = fetch::fetch_slice(cache, mirror, entry, client, expr).await?;
            let shape = fetch::payload_shape(&meta, &sel, bytes.len());
            let frame_header = fetch::slice_frame_header(&meta, shape);
            tokio::task::spawn_blocking(move || {
                container::frame_from_bytes(&frame_header, &bytes)
            })
            .await
            .map_err(|err| DepotError::Internal(format!("frame encode task: {err}")))??
        }

        // Opaque files serve their original bytes; slices are byte ranges.
        (DatasetKind::File, slice_expr) => {
            let expr = slice_expr.unwrap_or("");
            let (_, _, bytes) = fetch::fetch_slice(cache, mirror, entry, client, expr).await?;
            bytes
        }
    };

    let target = persist_download(cache, root, requested_path, &bytes).await?;
    stream_file(&target).await
}

async fn persist_download(
    cache: &Arc<SubCache>,
    root: &str,
    requested_path: &str,
    bytes: &[u8],
) -> Result<PathBuf> {
    let target = cache
        .settings()
        .cache_dir
        .join("downloads")
        .join(root)
        .join(requested_path);
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&target, bytes).await?;
    debug!(path = %target.display(), "materialized download");
    Ok(target)
}

/// Stream a materialized download from disk without buffering it again.
async fn stream_file(path: &Path) -> Result<Response> {
    let file = tokio::fs::File::open(path).await?;
    let body = Body::from_stream(ReaderStream::new(file));
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        body,
    )
        .into_response())
}
