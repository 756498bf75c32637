//! The slice fetch pipeline: parse the slice expression, resolve the chunk
//! set, materialize missing chunks, assemble the region, and pick the wire
//! encoding. An ETag mismatch anywhere in the pipeline invalidates the
//! dataset and restarts the request, a bounded number of times.

use std::sync::Arc;

use axum::http::header;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::debug;

use depot_core::client::{ApiClient, RETRY_ATTEMPTS};
use depot_core::container::{self, ContainerHeader};
use depot_core::error::{DepotError, Result};
use depot_core::models::{
    DatasetKind, DatasetMeta, ENCODING_CFRAME, ENCODING_HEADER, ENCODING_MSGPACK, SlicePayload,
};
use depot_core::slicing::{self, Selection};

use crate::cache::{DatasetEntry, RootMirror, SubCache};

/// Query parameters of `GET /api/fetch/{root}/{*path}`.
#[derive(Debug, Default, Deserialize)]
pub struct FetchQuery {
    #[serde(rename = "slice_")]
    pub slice: Option<String>,
    pub prefer_schunk: Option<bool>,
}

/// Fetch the requested region of a dataset, returning its metadata, the
/// resolved selection, and the raw row-major bytes.
pub async fn fetch_slice(
    cache: &Arc<SubCache>,
    mirror: &Arc<RootMirror>,
    entry: &Arc<DatasetEntry>,
    client: &ApiClient,
    expr: &str,
) -> Result<(DatasetMeta, Selection, Vec<u8>)> {
    let items = slicing::parse(expr)?;

    let mut mismatch = None;
    for attempt in 0..RETRY_ATTEMPTS {
        let meta = cache.ensure_meta(mirror, entry, client).await?;
        let shape = meta.effective_shape();
        let chunk_shape = meta.effective_chunk_shape();
        let sel = Selection::resolve(&items, &shape)?;
        let chunks = slicing::chunks_for(&sel, &shape, &chunk_shape);

        let outcome = async {
            cache
                .materialize(mirror, entry, client, &meta, &chunks)
                .await?;
            entry.read_slice_checked(&meta.etag, &chunks, sel.clone()).await
        }
        .await;

        match outcome {
            Ok(bytes) => return Ok((meta, sel, bytes)),
            Err(err @ DepotError::EtagMismatch { .. }) => {
                debug!(
                    dataset = %entry.relpath,
                    attempt,
                    "etag moved during fetch, invalidating and retrying"
                );
                entry.invalidate().await;
                mismatch = Some(err);
            }
            Err(other) => return Err(other),
        }
    }
    Err(mismatch.unwrap_or_else(|| {
        DepotError::Internal("fetch retries exhausted without a cause".into())
    }))
}

/// Materialize every chunk of a container dataset and serialize the shadow
/// to a frame, retrying through ETag transitions.
pub async fn materialized_cframe(
    cache: &Arc<SubCache>,
    mirror: &Arc<RootMirror>,
    entry: &Arc<DatasetEntry>,
    client: &ApiClient,
) -> Result<(DatasetMeta, Vec<u8>)> {
    let mut mismatch = None;
    for _attempt in 0..RETRY_ATTEMPTS {
        let meta = cache.ensure_meta(mirror, entry, client).await?;
        let chunks: Vec<u64> = (0..meta.chunk_count).collect();

        let outcome = async {
            cache
                .materialize(mirror, entry, client, &meta, &chunks)
                .await?;
            entry.cframe_checked(&meta.etag, &chunks).await
        }
        .await;

        match outcome {
            Ok(frame) => return Ok((meta, frame)),
            Err(err @ DepotError::EtagMismatch { .. }) => {
                entry.invalidate().await;
                mismatch = Some(err);
            }
            Err(other) => return Err(other),
        }
    }
    Err(mismatch.unwrap_or_else(|| {
        DepotError::Internal("download retries exhausted without a cause".into())
    }))
}

/// Shape of the payload on the wire: N-dimensional datasets drop scalar
/// dimensions (an integer index yields a 0-D result); byte streams and
/// opaque files always present as 1-D byte runs.
pub fn payload_shape(meta: &DatasetMeta, sel: &Selection, nbytes: usize) -> Vec<u64> {
    match meta.kind {
        DatasetKind::B2nd => sel.result_shape(),
        DatasetKind::B2frame | DatasetKind::File => vec![nbytes as u64],
    }
}

/// Frame header for a freshly materialized slice of a dataset.
pub fn slice_frame_header(meta: &DatasetMeta, shape: Vec<u64>) -> ContainerHeader {
    let chunk_shape = shape.iter().map(|&extent| extent.max(1)).collect();
    ContainerHeader {
        kind: meta.kind,
        dtype: meta.effective_dtype(),
        shape,
        chunk_shape,
        vlmeta: meta.vlmeta.clone(),
    }
}

/// Pick the transport encoding and build the response. Container frames are
/// only used when the client prefers them, the dataset is a container type,
/// and the payload clears the configured threshold.
pub async fn encode_response(
    meta: &DatasetMeta,
    sel: &Selection,
    bytes: Vec<u8>,
    prefer_schunk: bool,
    threshold: usize,
) -> Result<Response> {
    let shape = payload_shape(meta, sel, bytes.len());

    if prefer_schunk && meta.kind.is_container() && bytes.len() > threshold {
        let frame_header = slice_frame_header(meta, shape);
        let frame = tokio::task::spawn_blocking(move || {
            container::frame_from_bytes(&frame_header, &bytes)
        })
        .await
        .map_err(|err| DepotError::Internal(format!("frame encode task: {err}")))??;

        return Ok((
            [
                (header::CONTENT_TYPE.as_str(), "application/octet-stream"),
                (ENCODING_HEADER, ENCODING_CFRAME),
            ],
            frame,
        )
            .into_response());
    }

    let payload = SlicePayload {
        shape,
        dtype: meta.effective_dtype(),
        data: bytes,
    };
    let body = rmp_serde::to_vec_named(&payload)
        .map_err(|err| DepotError::Internal(format!("msgpack encode: {err}")))?;
    Ok((
        [
            (header::CONTENT_TYPE.as_str(), "application/msgpack"),
            (ENCODING_HEADER, ENCODING_MSGPACK),
        ],
        body,
    )
        .into_response())
}
