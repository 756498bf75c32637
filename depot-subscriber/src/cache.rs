//! The subscriber cache: per-root mirrors, per-dataset shadow containers
//! with lazy chunk materialization, ETag-keyed coherence, single-flight
//! chunk fetches, and LRU whole-dataset eviction under a disk quota.
//!
//! Locking discipline: the per-dataset RwLock guards both the in-memory
//! state and the shadow container file; chunk inserts hold the write lock
//! briefly, slice reads hold the read lock. Single-flight mutexes are
//! always acquired before the dataset lock, never the other way around.

use std::collections::{BTreeMap, HashSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{debug, info, warn};

use depot_core::client::{ApiClient, with_retries};
use depot_core::config::SubscriberSettings;
use depot_core::container::{Container, ContainerHeader};
use depot_core::error::{DepotError, Result};
use depot_core::models::{DatasetKind, DatasetMeta, RootEntry, Vlmeta};
use depot_core::relpath;
use depot_core::slicing::Selection;

type FlightKey = (String, String, u64);

/// Client-facing cache over every subscribed root.
pub struct SubCache {
    settings: SubscriberSettings,
    client: ApiClient,
    roots: DashMap<String, Arc<RootMirror>>,
    flights: DashMap<FlightKey, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for SubCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubCache")
            .field("roots", &self.roots.len())
            .field("flights", &self.flights.len())
            .finish()
    }
}

/// One subscribed root: the cached catalog and the datasets touched so far.
pub struct RootMirror {
    pub name: String,
    /// Publisher endpoint serving this root.
    pub endpoint: String,
    pub catalog: RwLock<Vec<String>>,
    datasets: DashMap<String, Arc<DatasetEntry>>,
    /// Set while the background change subscription cannot reach the
    /// publisher.
    pub degraded: AtomicBool,
    /// Guards against spawning the change-subscription task twice.
    pub watching: AtomicBool,
}

impl std::fmt::Debug for RootMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootMirror")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("datasets", &self.datasets.len())
            .finish()
    }
}

/// Cached state for one dataset, backed by a shadow container on disk plus
/// a JSON sidecar so cache contents survive restarts.
pub struct DatasetEntry {
    pub relpath: String,
    shadow_path: PathBuf,
    state: RwLock<DatasetState>,
    fetch_slots: Semaphore,
    /// Unix millis of the last client access, for LRU eviction.
    last_access: AtomicU64,
    disk_bytes: AtomicU64,
}

impl std::fmt::Debug for DatasetEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetEntry")
            .field("relpath", &self.relpath)
            .field("disk_bytes", &self.disk_bytes.load(Ordering::Relaxed))
            .finish()
    }
}

#[derive(Default)]
struct DatasetState {
    meta: Option<DatasetMeta>,
    present: HashSet<u64>,
    last_revalidated: Option<DateTime<Utc>>,
}

/// Sidecar persisted next to the shadow container.
#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    etag: String,
    present_chunks: Vec<u64>,
    last_revalidated: DateTime<Utc>,
}

fn sidecar_path(shadow: &Path) -> PathBuf {
    let mut os: OsString = shadow.as_os_str().to_owned();
    os.push(".meta");
    PathBuf::from(os)
}

fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

impl DatasetEntry {
    fn new(relpath: String, shadow_path: PathBuf, concurrency: usize) -> DatasetEntry {
        let mut state = DatasetState::default();
        let mut disk_bytes = 0;

        // Restore a previous run's shadow; a later revalidation discards it
        // if the publisher's ETag moved on.
        if shadow_path.is_file() {
            match Self::restore(&shadow_path) {
                Ok(Some((meta, present, size))) => {
                    debug!(dataset = %relpath, chunks = present.len(), "restored shadow state");
                    state.meta = Some(meta);
                    state.present = present;
                    disk_bytes = size;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(dataset = %relpath, "discarding unreadable shadow: {err}");
                    let _ = std::fs::remove_file(&shadow_path);
                    let _ = std::fs::remove_file(sidecar_path(&shadow_path));
                }
            }
        }

        DatasetEntry {
            relpath,
            shadow_path,
            state: RwLock::new(state),
            fetch_slots: Semaphore::new(concurrency.max(1)),
            last_access: AtomicU64::new(now_millis()),
            disk_bytes: AtomicU64::new(disk_bytes),
        }
    }

    fn restore(shadow_path: &Path) -> Result<Option<(DatasetMeta, HashSet<u64>, u64)>> {
        let sidecar_file = sidecar_path(shadow_path);
        if !sidecar_file.is_file() {
            return Ok(None);
        }
        let sidecar: Sidecar = serde_json::from_slice(&std::fs::read(&sidecar_file)?)?;
        let shadow = Container::open(shadow_path)?;
        let header = shadow.header().clone();

        let meta = match header.kind {
            DatasetKind::File => DatasetMeta {
                etag: sidecar.etag,
                kind: DatasetKind::File,
                shape: None,
                dtype: None,
                chunk_shape: None,
                chunk_count: 1,
                chunk_sizes: Some(vec![header.shape.first().copied().unwrap_or(0)]),
                vlmeta: Vlmeta::new(),
            },
            kind => DatasetMeta {
                etag: sidecar.etag,
                kind,
                shape: Some(header.shape.clone()),
                dtype: Some(header.dtype.clone()),
                chunk_shape: Some(header.chunk_shape.clone()),
                chunk_count: header.chunk_count(),
                chunk_sizes: None,
                vlmeta: header.vlmeta,
            },
        };

        // Trust only chunks both recorded and actually on disk.
        let on_disk: HashSet<u64> = shadow.present_chunks().into_iter().collect();
        let present = sidecar
            .present_chunks
            .into_iter()
            .filter(|n| on_disk.contains(n))
            .collect();
        let size = std::fs::metadata(shadow_path).map(|m| m.len()).unwrap_or(0);
        Ok(Some((meta, present, size)))
    }

    pub fn touch(&self) {
        self.last_access.store(now_millis(), Ordering::Relaxed);
    }

    pub fn disk_bytes(&self) -> u64 {
        self.disk_bytes.load(Ordering::Relaxed)
    }

    pub async fn cached_meta(&self) -> Option<DatasetMeta> {
        self.state.read().await.meta.clone()
    }

    /// Drop the revalidation timestamp so the next access re-checks the
    /// publisher's ETag.
    pub async fn mark_stale(&self) {
        self.state.write().await.last_revalidated = None;
    }

    fn persist_sidecar_locked(&self, state: &DatasetState) -> Result<()> {
        let path = sidecar_path(&self.shadow_path);
        match &state.meta {
            Some(meta) => {
                let mut present: Vec<u64> = state.present.iter().copied().collect();
                present.sort_unstable();
                let sidecar = Sidecar {
                    etag: meta.etag.clone(),
                    present_chunks: present,
                    last_revalidated: state.last_revalidated.unwrap_or_else(Utc::now),
                };
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&path, serde_json::to_vec(&sidecar)?)?;
            }
            None => {
                let _ = std::fs::remove_file(&path);
            }
        }
        Ok(())
    }

    fn clear_shadow_locked(&self, state: &mut DatasetState) {
        state.present.clear();
        state.meta = None;
        state.last_revalidated = None;
        self.disk_bytes.store(0, Ordering::Relaxed);
        let _ = std::fs::remove_file(&self.shadow_path);
        let _ = std::fs::remove_file(sidecar_path(&self.shadow_path));
    }

    /// Forget everything about this dataset, on disk and in memory.
    pub async fn invalidate(&self) {
        let mut state = self.state.write().await;
        self.clear_shadow_locked(&mut state);
    }

    /// Read a slice from the shadow, verifying the expected ETag and chunk
    /// presence first so a reader never sees a mixture of generations.
    pub async fn read_slice_checked(
        &self,
        etag: &str,
        chunks: &[u64],
        sel: Selection,
    ) -> Result<Vec<u8>> {
        let state = self.state.read().await;
        let coherent = state.meta.as_ref().is_some_and(|m| m.etag == etag)
            && chunks.iter().all(|n| state.present.contains(n));
        if !coherent {
            return Err(DepotError::EtagMismatch {
                path: self.relpath.clone(),
                recorded: etag.to_owned(),
                current: state
                    .meta
                    .as_ref()
                    .map(|m| m.etag.clone())
                    .unwrap_or_default(),
            });
        }
        if chunks.is_empty() {
            // Nothing materialized is needed for an empty selection.
            let meta = state.meta.as_ref().expect("coherent state has meta");
            let typesize = ContainerHeader::from_meta(meta).typesize()?;
            return Ok(vec![0; sel.nitems() as usize * typesize]);
        }

        // Decompression happens on the blocking pool while the read lock
        // keeps inserts out.
        let path = self.shadow_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut shadow = Container::open(&path)?;
            shadow.read_slice(&sel)
        })
        .await
        .map_err(|err| DepotError::Internal(format!("slice read task: {err}")))?
    }

    /// Serialize the fully materialized shadow to a frame, with the same
    /// coherence checks as [`Self::read_slice_checked`].
    pub async fn cframe_checked(&self, etag: &str, chunks: &[u64]) -> Result<Vec<u8>> {
        let state = self.state.read().await;
        let coherent = state.meta.as_ref().is_some_and(|m| m.etag == etag)
            && chunks.iter().all(|n| state.present.contains(n));
        if !coherent {
            return Err(DepotError::EtagMismatch {
                path: self.relpath.clone(),
                recorded: etag.to_owned(),
                current: state
                    .meta
                    .as_ref()
                    .map(|m| m.etag.clone())
                    .unwrap_or_default(),
            });
        }
        let path = self.shadow_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut shadow = Container::open(&path)?;
            shadow.to_cframe()
        })
        .await
        .map_err(|err| DepotError::Internal(format!("cframe task: {err}")))?
    }

    /// Try to evict this dataset; skipped when it is actively in use.
    async fn try_evict(&self) -> Option<u64> {
        let mut state = self.state.try_write().ok()?;
        let bytes = self.disk_bytes.load(Ordering::Relaxed);
        if bytes == 0 {
            return None;
        }
        self.clear_shadow_locked(&mut state);
        Some(bytes)
    }
}

impl RootMirror {
    /// Cache entry for a dataset, if one was ever created.
    pub fn dataset_if_cached(&self, relpath: &str) -> Option<Arc<DatasetEntry>> {
        self.datasets.get(relpath).map(|entry| entry.value().clone())
    }
}

impl SubCache {
    pub fn new(settings: SubscriberSettings, http: reqwest::Client) -> Arc<SubCache> {
        Arc::new(SubCache {
            settings,
            client: ApiClient::new(http),
            roots: DashMap::new(),
            flights: DashMap::new(),
        })
    }

    pub fn settings(&self) -> &SubscriberSettings {
        &self.settings
    }

    /// Per-request client carrying the caller's opaque auth cookie.
    pub fn client(&self, cookie: Option<String>) -> ApiClient {
        self.client.with_cookie(cookie)
    }

    fn broker_url(&self, path: &str) -> String {
        format!("http://{}{path}", self.settings.broker_endpoint)
    }

    pub async fn broker_roots(&self, client: &ApiClient) -> Result<BTreeMap<String, RootEntry>> {
        let url = self.broker_url("/api/roots");
        with_retries(|| client.get_json(&url)).await
    }

    pub fn subscribed(&self, root: &str) -> bool {
        self.roots.contains_key(root)
    }

    pub fn mirrors(&self) -> Vec<Arc<RootMirror>> {
        self.roots.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn mirror(&self, root: &str) -> Result<Arc<RootMirror>> {
        self.roots
            .get(root)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| DepotError::NotFound(format!("root not subscribed: {root}")))
    }

    /// Subscribe to a root: locate its publisher through the broker and
    /// record the catalog. Idempotent; datasets are not prefetched.
    pub async fn subscribe(&self, root: &str, client: &ApiClient) -> Result<Arc<RootMirror>> {
        if let Some(mirror) = self.roots.get(root) {
            return Ok(mirror.value().clone());
        }

        let roots = self.broker_roots(client).await?;
        let entry = roots.get(root).ok_or_else(|| {
            let available: Vec<&str> = roots.keys().map(String::as_str).collect();
            DepotError::NotFound(format!(
                "unknown root {root:?} (available roots: [{}])",
                available.join(", ")
            ))
        })?;

        let url = format!("http://{}/api/list", entry.http);
        let catalog: Vec<String> = with_retries(|| client.get_json(&url)).await?;
        info!(root = %root, publisher = %entry.http, datasets = catalog.len(), "subscribed");

        let mirror = Arc::new(RootMirror {
            name: root.to_owned(),
            endpoint: entry.http.clone(),
            catalog: RwLock::new(catalog),
            datasets: DashMap::new(),
            degraded: AtomicBool::new(false),
            watching: AtomicBool::new(false),
        });
        // A racing subscribe keeps the first mirror.
        let mirror = self
            .roots
            .entry(root.to_owned())
            .or_insert(mirror)
            .value()
            .clone();
        Ok(mirror)
    }

    /// Re-fetch a root's catalog from its publisher.
    pub async fn refresh_catalog(&self, mirror: &RootMirror, client: &ApiClient) -> Result<()> {
        let url = format!("http://{}/api/list", mirror.endpoint);
        let catalog: Vec<String> = with_retries(|| client.get_json(&url)).await?;
        *mirror.catalog.write().await = catalog;
        Ok(())
    }

    /// Look up a dataset in a subscribed root, creating its cache entry on
    /// demand. Unknown paths trigger one catalog refresh before failing.
    pub async fn dataset(
        &self,
        root: &str,
        path: &str,
        client: &ApiClient,
    ) -> Result<(Arc<RootMirror>, Arc<DatasetEntry>)> {
        let mirror = self.mirror(root)?;
        let normalized = relpath::normalize(path)?;

        let mut known = mirror.catalog.read().await.contains(&normalized);
        if !known {
            debug!(root = %root, dataset = %normalized, "not in catalog, refreshing");
            self.refresh_catalog(&mirror, client).await?;
            known = mirror.catalog.read().await.contains(&normalized);
        }
        if !known {
            return Err(DepotError::NotFound(format!(
                "no dataset {normalized:?} in root {root:?}"
            )));
        }

        let shadow_path = self
            .settings
            .cache_dir
            .join(&mirror.name)
            .join(&normalized);
        let concurrency = self.settings.chunk_fetch_concurrency;
        let entry = mirror
            .datasets
            .entry(normalized.clone())
            .or_insert_with(|| {
                Arc::new(DatasetEntry::new(normalized, shadow_path, concurrency))
            })
            .value()
            .clone();
        entry.touch();
        Ok((mirror, entry))
    }

    /// Current metadata for a dataset, revalidating against the publisher
    /// when the cached ETag is older than the freshness window. An ETag
    /// change quarantines the cached chunks immediately.
    pub async fn ensure_meta(
        &self,
        mirror: &RootMirror,
        entry: &DatasetEntry,
        client: &ApiClient,
    ) -> Result<DatasetMeta> {
        let ttl = self.settings.etag_revalidation_interval;
        let fresh = |state: &DatasetState| -> Option<DatasetMeta> {
            let at = state.last_revalidated?;
            if ttl > 0 && (Utc::now() - at) < chrono::Duration::seconds(ttl as i64) {
                state.meta.clone()
            } else {
                None
            }
        };

        if let Some(meta) = fresh(&*entry.state.read().await) {
            return Ok(meta);
        }

        let mut state = entry.state.write().await;
        if let Some(meta) = fresh(&state) {
            return Ok(meta);
        }

        let url = format!("http://{}/api/info/{}", mirror.endpoint, entry.relpath);
        let fetched: DatasetMeta = with_retries(|| client.get_json(&url)).await?;

        if state.meta.as_ref().is_some_and(|m| m.etag != fetched.etag) {
            info!(
                root = %mirror.name,
                dataset = %entry.relpath,
                "etag changed, discarding cached chunks"
            );
            entry.clear_shadow_locked(&mut state);
        }
        state.meta = Some(fetched.clone());
        state.last_revalidated = Some(Utc::now());
        entry.persist_sidecar_locked(&state)?;
        Ok(fetched)
    }

    /// Materialize the given chunks into the dataset's shadow container,
    /// in parallel up to the per-dataset concurrency limit.
    pub async fn materialize(
        self: &Arc<Self>,
        mirror: &Arc<RootMirror>,
        entry: &Arc<DatasetEntry>,
        client: &ApiClient,
        meta: &DatasetMeta,
        chunks: &[u64],
    ) -> Result<()> {
        let missing: Vec<u64> = {
            let state = entry.state.read().await;
            chunks
                .iter()
                .copied()
                .filter(|n| !state.present.contains(n))
                .collect()
        };
        if missing.is_empty() {
            return Ok(());
        }

        let concurrency = self.settings.chunk_fetch_concurrency.max(1);
        futures::stream::iter(missing.into_iter().map(|nchunk| {
            let cache = Arc::clone(self);
            let mirror = Arc::clone(mirror);
            let entry = Arc::clone(entry);
            let client = client.clone();
            let meta = meta.clone();
            async move {
                cache
                    .fetch_chunk(&mirror, &entry, &client, &meta, nchunk)
                    .await
            }
        }))
        .buffer_unordered(concurrency)
        .try_collect::<Vec<()>>()
        .await?;
        Ok(())
    }

    /// Fetch one chunk under the single-flight discipline: at most one
    /// in-flight request per `(root, dataset, chunk)`, with waiters joining
    /// the same result via the presence check.
    async fn fetch_chunk(
        self: &Arc<Self>,
        mirror: &Arc<RootMirror>,
        entry: &Arc<DatasetEntry>,
        client: &ApiClient,
        meta: &DatasetMeta,
        nchunk: u64,
    ) -> Result<()> {
        let key = (mirror.name.clone(), entry.relpath.clone(), nchunk);
        let flight = self
            .flights
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();

        let guard = flight.lock().await;
        let result = self
            .fetch_chunk_inner(mirror, entry, client, meta, nchunk)
            .await;
        drop(guard);
        // Last flight out removes the token (map + our clone = 2 refs).
        self.flights
            .remove_if(&key, |_, token| Arc::strong_count(token) <= 2);
        result
    }

    async fn fetch_chunk_inner(
        &self,
        mirror: &RootMirror,
        entry: &DatasetEntry,
        client: &ApiClient,
        meta: &DatasetMeta,
        nchunk: u64,
    ) -> Result<()> {
        {
            let state = entry.state.read().await;
            if state.present.contains(&nchunk) {
                return Ok(());
            }
            if state.meta.as_ref().map(|m| m.etag.as_str()) != Some(meta.etag.as_str()) {
                // Invalidated while we waited on the flight token.
                return Err(DepotError::EtagMismatch {
                    path: entry.relpath.clone(),
                    recorded: meta.etag.clone(),
                    current: state
                        .meta
                        .as_ref()
                        .map(|m| m.etag.clone())
                        .unwrap_or_default(),
                });
            }
        }

        let _slot = entry
            .fetch_slots
            .acquire()
            .await
            .map_err(|_| DepotError::Internal("fetch semaphore closed".into()))?;

        let url = format!(
            "http://{}/api/chunk/{}/{nchunk}",
            mirror.endpoint, entry.relpath
        );
        let (etag, payload) =
            with_retries(|| client.get_bytes(&url, Some(&meta.etag))).await?;
        if etag.as_deref() != Some(meta.etag.as_str()) {
            return Err(DepotError::EtagMismatch {
                path: entry.relpath.clone(),
                recorded: meta.etag.clone(),
                current: etag.unwrap_or_default(),
            });
        }

        let mut state = entry.state.write().await;
        if state.meta.as_ref().map(|m| m.etag.as_str()) != Some(meta.etag.as_str()) {
            return Err(DepotError::EtagMismatch {
                path: entry.relpath.clone(),
                recorded: meta.etag.clone(),
                current: state
                    .meta
                    .as_ref()
                    .map(|m| m.etag.clone())
                    .unwrap_or_default(),
            });
        }

        let shadow_path = entry.shadow_path.clone();
        let header = ContainerHeader::from_meta(meta);
        let bytes = payload.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut shadow = if shadow_path.is_file() {
                Container::open_rw(&shadow_path)?
            } else {
                Container::create(&shadow_path, header)?
            };
            shadow.insert_chunk(nchunk, &bytes)
        })
        .await
        .map_err(|err| DepotError::Internal(format!("chunk insert task: {err}")))??;

        state.present.insert(nchunk);
        entry.persist_sidecar_locked(&state)?;
        let size = std::fs::metadata(&entry.shadow_path)
            .map(|m| m.len())
            .unwrap_or(0);
        entry.disk_bytes.store(size, Ordering::Relaxed);
        drop(state);

        self.enforce_quota(&mirror.name, &entry.relpath).await
    }

    pub fn total_bytes(&self) -> u64 {
        self.roots
            .iter()
            .map(|mirror| {
                mirror
                    .datasets
                    .iter()
                    .map(|d| d.disk_bytes())
                    .sum::<u64>()
            })
            .sum()
    }

    /// Evict whole datasets in LRU order until the cache fits the quota.
    /// The dataset just written is never a victim.
    async fn enforce_quota(&self, keep_root: &str, keep_path: &str) -> Result<()> {
        let Some(quota) = self.settings.cache_quota_bytes else {
            return Ok(());
        };
        if self.total_bytes() <= quota {
            return Ok(());
        }

        let mut victims: Vec<(u64, Arc<DatasetEntry>)> = Vec::new();
        for mirror in self.mirrors() {
            for dataset in mirror.datasets.iter() {
                let entry = dataset.value();
                if mirror.name == keep_root && entry.relpath == keep_path {
                    continue;
                }
                if entry.disk_bytes() > 0 {
                    victims.push((entry.last_access.load(Ordering::Relaxed), entry.clone()));
                }
            }
        }
        victims.sort_by_key(|(at, _)| *at);

        for (_, entry) in victims {
            if self.total_bytes() <= quota {
                return Ok(());
            }
            if let Some(freed) = entry.try_evict().await {
                info!(dataset = %entry.relpath, freed, "evicted dataset for quota");
            }
        }

        let total = self.total_bytes();
        if total > quota {
            // The quota is soft: a single active dataset larger than the
            // whole budget is tolerated. Fail only when other datasets are
            // pinned and room genuinely cannot be made.
            let active = self
                .mirror(keep_root)
                .ok()
                .and_then(|mirror| mirror.dataset_if_cached(keep_path))
                .map(|entry| entry.disk_bytes())
                .unwrap_or(0);
            if total - active > quota {
                return Err(DepotError::QuotaExceeded(format!(
                    "cache holds {total} bytes against a quota of {quota}; \
                     nothing further is evictable"
                )));
            }
            warn!(
                total,
                quota, "active dataset alone exceeds the cache quota"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_path_appends_suffix() {
        let shadow = PathBuf::from("/cache/foo/dir1/ds.b2nd");
        assert_eq!(
            sidecar_path(&shadow),
            PathBuf::from("/cache/foo/dir1/ds.b2nd.meta")
        );
    }

    #[tokio::test]
    async fn entry_restores_from_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let shadow_path = dir.path().join("ds.b2nd");

        let header = ContainerHeader {
            kind: DatasetKind::B2nd,
            dtype: "u1".into(),
            shape: vec![20],
            chunk_shape: vec![10],
            vlmeta: Vlmeta::new(),
        };
        let mut shadow = Container::create(&shadow_path, header).unwrap();
        shadow
            .insert_chunk(1, &depot_core::container::compress_chunk(&[7; 10]))
            .unwrap();

        let sidecar = Sidecar {
            etag: "1.0:123".into(),
            // Chunk 0 is recorded but missing on disk: it must not survive.
            present_chunks: vec![0, 1],
            last_revalidated: Utc::now(),
        };
        std::fs::write(
            sidecar_path(&shadow_path),
            serde_json::to_vec(&sidecar).unwrap(),
        )
        .unwrap();

        let entry = DatasetEntry::new("ds.b2nd".into(), shadow_path, 4);
        let state = entry.state.read().await;
        assert_eq!(state.meta.as_ref().unwrap().etag, "1.0:123");
        assert_eq!(state.present, HashSet::from([1]));
        // Restored entries revalidate before first use.
        assert!(state.last_revalidated.is_none());
    }

    #[tokio::test]
    async fn invalidate_clears_disk_and_memory() {
        let dir = tempfile::tempdir().unwrap();
        let shadow_path = dir.path().join("ds.b2nd");
        let header = ContainerHeader {
            kind: DatasetKind::B2nd,
            dtype: "u1".into(),
            shape: vec![10],
            chunk_shape: vec![10],
            vlmeta: Vlmeta::new(),
        };
        Container::create(&shadow_path, header).unwrap();

        let entry = DatasetEntry::new("ds.b2nd".into(), shadow_path.clone(), 4);
        entry.invalidate().await;
        assert!(!shadow_path.exists());
        assert_eq!(entry.disk_bytes(), 0);
        assert!(entry.cached_meta().await.is_none());
    }
}
