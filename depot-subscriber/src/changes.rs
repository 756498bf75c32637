//! Per-root change subscription: a background task consuming the
//! publisher's `/api/changes` stream and invalidating affected datasets.
//!
//! A failing subscription marks the root degraded and keeps retrying; it
//! never takes the process down.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use depot_core::client::sse_data;
use depot_core::models::ChangeBatch;

use crate::cache::{RootMirror, SubCache};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Start watching a root's publisher for changes. At most one task per
/// root; later calls are no-ops.
pub fn spawn(cache: Arc<SubCache>, mirror: Arc<RootMirror>) -> Option<JoinHandle<()>> {
    if mirror.watching.swap(true, Ordering::SeqCst) {
        return None;
    }
    Some(tokio::spawn(async move {
        let client = cache.client(None);
        let url = format!("http://{}/api/changes", mirror.endpoint);
        loop {
            match client.get_stream(&url).await {
                Ok(response) => {
                    mirror.degraded.store(false, Ordering::Relaxed);
                    debug!(root = %mirror.name, "change subscription established");
                    let mut events = std::pin::pin!(sse_data(response));
                    while let Some(data) = events.next().await {
                        let data = match data {
                            Ok(data) => data,
                            Err(err) => {
                                warn!(root = %mirror.name, "change stream error: {err}");
                                break;
                            }
                        };
                        match serde_json::from_str::<ChangeBatch>(&data) {
                            Ok(batch) => apply_batch(&cache, &mirror, &client, batch).await,
                            Err(err) => {
                                warn!(root = %mirror.name, "unparseable change batch: {err}")
                            }
                        }
                    }
                }
                Err(err) => {
                    if !mirror.degraded.swap(true, Ordering::Relaxed) {
                        warn!(root = %mirror.name, "change subscription degraded: {err}");
                    }
                }
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }))
}

async fn apply_batch(
    cache: &Arc<SubCache>,
    mirror: &Arc<RootMirror>,
    client: &depot_core::client::ApiClient,
    batch: ChangeBatch,
) {
    debug!(root = %mirror.name, paths = batch.paths.len(), "applying change batch");
    for path in &batch.paths {
        if let Some(entry) = mirror.dataset_if_cached(path) {
            // The next access revalidates the ETag and discards stale
            // chunks if it moved.
            entry.mark_stale().await;
        }
    }
    // New or removed files alter the catalog.
    if let Err(err) = cache.refresh_catalog(mirror, client).await {
        mirror.degraded.store(true, Ordering::Relaxed);
        warn!(root = %mirror.name, "catalog refresh failed: {err}");
    }
}
