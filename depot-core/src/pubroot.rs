//! Publisher root capability: the abstract surface a publisher serves a
//! root through, and the directory-backed implementation.
//!
//! The trait keeps the backend boundary clean for future root kinds; today
//! there is exactly one implementation, a local directory tree.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use tokio::sync::broadcast;
use walkdir::WalkDir;

use crate::container::{self, Container};
use crate::error::{DepotError, Result};
use crate::models::{ChangeBatch, DatasetKind, DatasetMeta, Vlmeta};
use crate::relpath;
use crate::watch::{ChangeWatcher, DEFAULT_DEBOUNCE_MS};

/// A chunk payload together with the ETag in force when it was read.
#[derive(Debug, Clone)]
pub struct ChunkRead {
    pub etag: String,
    pub payload: Vec<u8>,
}

/// Capability set a publisher needs from a root backend.
#[async_trait]
pub trait PubRoot: Send + Sync {
    /// Stable, ordered enumeration of dataset relpaths (files only).
    async fn walk_dsets(&self) -> Result<Vec<String>>;

    async fn exists_dset(&self, relpath: &str) -> bool;

    async fn dset_etag(&self, relpath: &str) -> Result<String>;

    async fn dset_meta(&self, relpath: &str) -> Result<DatasetMeta>;

    /// Read one chunk's compressed payload.
    async fn dset_chunk(&self, relpath: &str, nchunk: u64) -> Result<ChunkRead>;

    /// Subscribe to coalesced change batches for this root.
    fn watch_dsets(&self) -> broadcast::Receiver<ChangeBatch>;
}

/// Root backed by a local directory tree. Files are opened per request; the
/// OS provides isolation between readers.
#[derive(Debug)]
pub struct DirectoryRoot {
    abspath: PathBuf,
    watcher: ChangeWatcher,
}

impl DirectoryRoot {
    /// Open a root directory and start watching it.
    pub fn open(path: &Path) -> Result<DirectoryRoot> {
        Self::open_with_debounce(path, DEFAULT_DEBOUNCE_MS)
    }

    pub fn open_with_debounce(path: &Path, debounce_ms: u64) -> Result<DirectoryRoot> {
        let abspath = path.canonicalize().map_err(|err| {
            DepotError::Internal(format!("cannot resolve root {}: {err}", path.display()))
        })?;
        if !abspath.is_dir() {
            return Err(DepotError::Internal(format!(
                "root is not a directory: {}",
                abspath.display()
            )));
        }
        let watcher = ChangeWatcher::start(&abspath, debounce_ms)?;
        Ok(DirectoryRoot { abspath, watcher })
    }

    pub fn abspath(&self) -> &Path {
        &self.abspath
    }

    fn abs(&self, relpath: &str) -> Result<PathBuf> {
        relpath::resolve_under(&self.abspath, relpath)
    }

    fn etag_for(abspath: &Path) -> Result<String> {
        let stat = std::fs::metadata(abspath)?;
        let mtime = stat
            .modified()?
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Ok(format!(
            "{}.{:09}:{}",
            mtime.as_secs(),
            mtime.subsec_nanos(),
            stat.len()
        ))
    }

    fn meta_blocking(abspath: &Path, relpath: &str) -> Result<DatasetMeta> {
        if !abspath.is_file() {
            return Err(DepotError::NotFound(format!("no such dataset: {relpath}")));
        }
        let etag = Self::etag_for(abspath)?;
        match DatasetKind::from_relpath(relpath) {
            DatasetKind::B2nd | DatasetKind::B2frame => {
                let container = Container::open(abspath)?;
                Ok(container.meta(&etag))
            }
            DatasetKind::File => {
                let size = std::fs::metadata(abspath)?.len();
                Ok(DatasetMeta {
                    etag,
                    kind: DatasetKind::File,
                    shape: None,
                    dtype: None,
                    chunk_shape: None,
                    chunk_count: 1,
                    chunk_sizes: Some(vec![size]),
                    vlmeta: Vlmeta::new(),
                })
            }
        }
    }

    fn chunk_blocking(abspath: &Path, relpath: &str, nchunk: u64) -> Result<ChunkRead> {
        if !abspath.is_file() {
            return Err(DepotError::NotFound(format!("no such dataset: {relpath}")));
        }
        let payload = match DatasetKind::from_relpath(relpath) {
            DatasetKind::B2nd | DatasetKind::B2frame => {
                let mut container = Container::open(abspath)?;
                container.read_chunk(nchunk)?
            }
            DatasetKind::File => {
                if nchunk != 0 {
                    return Err(DepotError::NotFound(format!(
                        "chunk {nchunk} out of range for opaque file {relpath}"
                    )));
                }
                let bytes = std::fs::read(abspath)?;
                container::compress_chunk(&bytes)
            }
        };
        // The etag is sampled after the read so a concurrent replacement
        // surfaces as a mismatch on the consumer side.
        let etag = Self::etag_for(abspath)?;
        Ok(ChunkRead { etag, payload })
    }
}

#[async_trait]
impl PubRoot for DirectoryRoot {
    async fn walk_dsets(&self) -> Result<Vec<String>> {
        let root = self.abspath.clone();
        tokio::task::spawn_blocking(move || {
            let mut paths = Vec::new();
            for entry in WalkDir::new(&root).sort_by_file_name() {
                let entry = entry.map_err(|err| {
                    DepotError::Internal(format!("walk {}: {err}", root.display()))
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(&root)
                    .expect("walked path under root");
                if let Some(parts) = rel
                    .components()
                    .map(|c| c.as_os_str().to_str())
                    .collect::<Option<Vec<_>>>()
                {
                    paths.push(parts.join("/"));
                }
            }
            Ok(paths)
        })
        .await
        .map_err(|err| DepotError::Internal(format!("walk task: {err}")))?
    }

    async fn exists_dset(&self, relpath: &str) -> bool {
        match self.abs(relpath) {
            Ok(abspath) => abspath.is_file(),
            Err(_) => false,
        }
    }

    async fn dset_etag(&self, relpath: &str) -> Result<String> {
        let abspath = self.abs(relpath)?;
        Self::etag_for(&abspath).map_err(|err| missing(relpath, err))
    }

    async fn dset_meta(&self, relpath: &str) -> Result<DatasetMeta> {
        let abspath = self.abs(relpath)?;
        let relpath_owned = relpath.to_owned();
        tokio::task::spawn_blocking(move || Self::meta_blocking(&abspath, &relpath_owned))
            .await
            .map_err(|err| DepotError::Internal(format!("meta task: {err}")))?
            .map_err(|err| missing(relpath, err))
    }

    async fn dset_chunk(&self, relpath: &str, nchunk: u64) -> Result<ChunkRead> {
        let abspath = self.abs(relpath)?;
        let relpath_owned = relpath.to_owned();
        tokio::task::spawn_blocking(move || {
            Self::chunk_blocking(&abspath, &relpath_owned, nchunk)
        })
        .await
        .map_err(|err| DepotError::Internal(format!("chunk task: {err}")))?
        .map_err(|err| missing(relpath, err))
    }

    fn watch_dsets(&self) -> broadcast::Receiver<ChangeBatch> {
        self.watcher.subscribe()
    }
}

/// Collapse "file vanished" IO errors into NotFound for wire mapping.
fn missing(relpath: &str, err: DepotError) -> DepotError {
    match err {
        DepotError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
            DepotError::NotFound(format!("no such dataset: {relpath}"))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container;

    fn example_root(dir: &Path) -> DirectoryRoot {
        let data: Vec<u8> = (0..100_i32).flat_map(|v| v.to_le_bytes()).collect();
        container::write_nd(&dir.join("ds-1d.b2nd"), "i4", &[100], &[10], &data, Vlmeta::new())
            .unwrap();
        std::fs::create_dir_all(dir.join("dir1")).unwrap();
        container::write_frame(&dir.join("dir1/hello.b2frame"), b"Hello world!", 4, Vlmeta::new())
            .unwrap();
        std::fs::write(dir.join("README.md"), b"This is a simple example").unwrap();
        DirectoryRoot::open(dir).unwrap()
    }

    #[tokio::test]
    async fn walk_is_sorted_and_complete() {
        let dir = tempfile::tempdir().unwrap();
        let root = example_root(dir.path());
        let dsets = root.walk_dsets().await.unwrap();
        assert_eq!(
            dsets,
            vec!["README.md", "dir1/hello.b2frame", "ds-1d.b2nd"]
        );
        // Stable under no change.
        assert_eq!(root.walk_dsets().await.unwrap(), dsets);
    }

    #[tokio::test]
    async fn meta_for_container_and_opaque() {
        let dir = tempfile::tempdir().unwrap();
        let root = example_root(dir.path());

        let meta = root.dset_meta("ds-1d.b2nd").await.unwrap();
        assert_eq!(meta.kind, DatasetKind::B2nd);
        assert_eq!(meta.shape, Some(vec![100]));
        assert_eq!(meta.chunk_count, 10);

        let meta = root.dset_meta("README.md").await.unwrap();
        assert_eq!(meta.kind, DatasetKind::File);
        assert_eq!(meta.chunk_count, 1);
        assert_eq!(meta.chunk_sizes, Some(vec![24]));
    }

    #[tokio::test]
    async fn chunk_reads_carry_etag() {
        let dir = tempfile::tempdir().unwrap();
        let root = example_root(dir.path());

        let etag = root.dset_etag("ds-1d.b2nd").await.unwrap();
        let read = root.dset_chunk("ds-1d.b2nd", 3).await.unwrap();
        assert_eq!(read.etag, etag);
        let block = container::decompress_chunk(&read.payload, 40).unwrap();
        let expected: Vec<u8> = (30..40_i32).flat_map(|v| v.to_le_bytes()).collect();
        assert_eq!(block, expected);

        // Opaque files round-trip through a single compressed chunk.
        let read = root.dset_chunk("README.md", 0).await.unwrap();
        let raw = {
            use std::io::Read;
            let mut decoder = flate2::read::ZlibDecoder::new(&read.payload[..]);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out).unwrap();
            out
        };
        assert_eq!(raw, b"This is a simple example");
        assert!(root.dset_chunk("README.md", 1).await.is_err());
    }

    #[tokio::test]
    async fn rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let root = example_root(dir.path());
        assert!(matches!(
            root.dset_etag("../outside").await,
            Err(DepotError::PathInvalid(_))
        ));
        assert!(!root.exists_dset("/etc/passwd").await);
        assert!(matches!(
            root.dset_etag("missing.b2nd").await,
            Err(DepotError::NotFound(_))
        ));
    }
}
