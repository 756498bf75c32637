//! Chunked container codec backing `.b2nd` and `.b2frame` datasets.
//!
//! A container file holds a MessagePack header (kind, dtype, shape, chunk
//! shape, vlmeta), a fixed-width chunk index table, and deflate-compressed
//! chunk payloads. The index table admits holes, which is what lets the
//! subscriber keep partially materialized shadow copies: a zeroed slot means
//! the chunk has not been fetched yet.
//!
//! Every chunk decompresses to the same byte length: edge chunks are
//! zero-padded to the full chunk grid. The serialized "cframe" form is the
//! container file bytes themselves, with all chunks present.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};

use crate::error::{DepotError, Result};
use crate::models::{DatasetKind, DatasetMeta, Vlmeta};
use crate::slicing::{self, Selection};

const MAGIC: [u8; 4] = *b"B2CF";
const VERSION: u8 = 1;
/// magic + version + header length prefix
const PREFIX_LEN: u64 = 9;
/// offset (u64) + compressed length (u32) per chunk slot
const INDEX_ENTRY_LEN: u64 = 12;

/// Self-describing container header, stored as MessagePack right after the
/// magic bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerHeader {
    pub kind: DatasetKind,
    pub dtype: String,
    pub shape: Vec<u64>,
    pub chunk_shape: Vec<u64>,
    #[serde(default)]
    pub vlmeta: Vlmeta,
}

impl ContainerHeader {
    /// Header for a shadow copy of a dataset described by publisher
    /// metadata.
    pub fn from_meta(meta: &DatasetMeta) -> ContainerHeader {
        ContainerHeader {
            kind: meta.kind,
            dtype: meta.effective_dtype(),
            shape: meta.effective_shape(),
            chunk_shape: meta.effective_chunk_shape(),
            vlmeta: meta.vlmeta.clone(),
        }
    }

    pub fn typesize(&self) -> Result<usize> {
        dtype_itemsize(&self.dtype)
    }

    pub fn chunk_grid(&self) -> Vec<u64> {
        slicing::chunk_grid(&self.shape, &self.chunk_shape)
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_grid().iter().product()
    }

    /// Decompressed byte length every chunk pads out to.
    pub fn chunk_nbytes(&self) -> Result<usize> {
        let items = self.chunk_shape.iter().product::<u64>() as usize;
        Ok(items * self.typesize()?)
    }

    fn validate(&self) -> Result<()> {
        if self.shape.len() != self.chunk_shape.len() {
            return Err(DepotError::Container(format!(
                "shape ndim {} != chunk_shape ndim {}",
                self.shape.len(),
                self.chunk_shape.len()
            )));
        }
        if self.chunk_shape.iter().any(|&c| c == 0) {
            return Err(DepotError::Container(
                "chunk_shape dimensions must be positive".into(),
            ));
        }
        self.typesize()?;
        Ok(())
    }
}

/// Byte size of one element for numpy-style dtype codes (`u1`, `i4`, `f8`,
/// optionally prefixed with a byte-order character).
pub fn dtype_itemsize(dtype: &str) -> Result<usize> {
    let bare = dtype
        .strip_prefix(['<', '>', '=', '|'])
        .unwrap_or(dtype);
    let mut chars = bare.chars();
    let kind = chars.next();
    let size: String = chars.collect();
    match kind {
        Some('b' | 'i' | 'u' | 'f') => {}
        _ => {
            return Err(DepotError::Container(format!(
                "unsupported dtype: {dtype:?}"
            )));
        }
    }
    let size: usize = size
        .parse()
        .map_err(|_| DepotError::Container(format!("unsupported dtype: {dtype:?}")))?;
    if size == 0 || size > 16 {
        return Err(DepotError::Container(format!(
            "unsupported dtype size: {dtype:?}"
        )));
    }
    Ok(size)
}

/// Deflate-compress one chunk payload.
pub fn compress_chunk(raw: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    // Writing to a Vec cannot fail.
    encoder.write_all(raw).expect("write to Vec");
    encoder.finish().expect("finish to Vec")
}

/// Decompress one chunk payload, verifying the expected padded length.
pub fn decompress_chunk(payload: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(payload);
    let mut raw = Vec::with_capacity(expected_len);
    decoder
        .read_to_end(&mut raw)
        .map_err(|err| DepotError::CorruptChunk(format!("inflate failed: {err}")))?;
    if raw.len() != expected_len {
        return Err(DepotError::CorruptChunk(format!(
            "chunk decompressed to {} bytes, expected {expected_len}",
            raw.len()
        )));
    }
    Ok(raw)
}

#[derive(Debug, Clone, Copy, Default)]
struct IndexEntry {
    offset: u64,
    len: u32,
}

impl IndexEntry {
    fn present(&self) -> bool {
        self.offset != 0
    }
}

/// An open container file.
#[derive(Debug)]
pub struct Container {
    path: PathBuf,
    file: File,
    header: ContainerHeader,
    index: Vec<IndexEntry>,
    index_pos: u64,
}

impl Container {
    /// Create an empty writable container: header and a zeroed chunk index,
    /// no payloads.
    pub fn create(path: &Path, header: ContainerHeader) -> Result<Container> {
        header.validate()?;
        let header_bytes = encode_header(&header)?;
        let chunk_count = header.chunk_count();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(&MAGIC)?;
        file.write_all(&[VERSION])?;
        file.write_all(&(header_bytes.len() as u32).to_le_bytes())?;
        file.write_all(&header_bytes)?;
        let zeros = vec![0_u8; (chunk_count * INDEX_ENTRY_LEN) as usize];
        file.write_all(&zeros)?;
        file.flush()?;

        let index_pos = PREFIX_LEN + header_bytes.len() as u64;
        Ok(Container {
            path: path.to_path_buf(),
            file,
            header,
            index: vec![IndexEntry::default(); chunk_count as usize],
            index_pos,
        })
    }

    /// Open an existing container read-only.
    pub fn open(path: &Path) -> Result<Container> {
        Self::open_inner(path, false)
    }

    /// Open an existing container for chunk insertion.
    pub fn open_rw(path: &Path) -> Result<Container> {
        Self::open_inner(path, true)
    }

    fn open_inner(path: &Path, writable: bool) -> Result<Container> {
        let mut file = OpenOptions::new().read(true).write(writable).open(path)?;

        let mut prefix = [0_u8; PREFIX_LEN as usize];
        file.read_exact(&mut prefix)
            .map_err(|_| bad_container(path, "truncated prefix"))?;
        if prefix[..4] != MAGIC {
            return Err(bad_container(path, "bad magic"));
        }
        if prefix[4] != VERSION {
            return Err(bad_container(path, "unsupported version"));
        }
        let header_len = u32::from_le_bytes(prefix[5..9].try_into().expect("4 bytes")) as usize;

        let mut header_bytes = vec![0_u8; header_len];
        file.read_exact(&mut header_bytes)
            .map_err(|_| bad_container(path, "truncated header"))?;
        let header: ContainerHeader = rmp_serde::from_slice(&header_bytes)
            .map_err(|err| bad_container(path, &format!("header decode: {err}")))?;
        header.validate()?;

        let chunk_count = header.chunk_count() as usize;
        let mut index = Vec::with_capacity(chunk_count);
        let mut entry = [0_u8; INDEX_ENTRY_LEN as usize];
        for _ in 0..chunk_count {
            file.read_exact(&mut entry)
                .map_err(|_| bad_container(path, "truncated chunk index"))?;
            index.push(IndexEntry {
                offset: u64::from_le_bytes(entry[..8].try_into().expect("8 bytes")),
                len: u32::from_le_bytes(entry[8..].try_into().expect("4 bytes")),
            });
        }

        Ok(Container {
            path: path.to_path_buf(),
            file,
            header,
            index,
            index_pos: PREFIX_LEN + header_len as u64,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    pub fn chunk_count(&self) -> u64 {
        self.index.len() as u64
    }

    pub fn has_chunk(&self, nchunk: u64) -> bool {
        self.index
            .get(nchunk as usize)
            .is_some_and(IndexEntry::present)
    }

    pub fn present_chunks(&self) -> Vec<u64> {
        self.index
            .iter()
            .enumerate()
            .filter(|(_, e)| e.present())
            .map(|(n, _)| n as u64)
            .collect()
    }

    /// Compressed byte size per chunk slot; holes report zero.
    pub fn chunk_sizes(&self) -> Vec<u64> {
        self.index.iter().map(|e| e.len as u64).collect()
    }

    fn entry(&self, nchunk: u64) -> Result<IndexEntry> {
        self.index
            .get(nchunk as usize)
            .copied()
            .ok_or_else(|| {
                DepotError::NotFound(format!(
                    "chunk {nchunk} out of range for {} chunks",
                    self.index.len()
                ))
            })
    }

    /// Read one chunk's compressed payload.
    pub fn read_chunk(&mut self, nchunk: u64) -> Result<Vec<u8>> {
        let entry = self.entry(nchunk)?;
        if !entry.present() {
            return Err(DepotError::Container(format!(
                "chunk {nchunk} is not materialized in {}",
                self.path.display()
            )));
        }
        let mut payload = vec![0_u8; entry.len as usize];
        self.file.seek(SeekFrom::Start(entry.offset))?;
        self.file.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// Read and decompress one chunk to its full padded block.
    pub fn read_chunk_decompressed(&mut self, nchunk: u64) -> Result<Vec<u8>> {
        let payload = self.read_chunk(nchunk)?;
        decompress_chunk(&payload, self.header.chunk_nbytes()?)
    }

    /// Insert a compressed chunk at the given slot. Payloads are appended;
    /// replacing a chunk orphans the old bytes until the file is rebuilt.
    pub fn insert_chunk(&mut self, nchunk: u64, payload: &[u8]) -> Result<()> {
        self.entry(nchunk)?;
        let offset = self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(payload)?;

        let entry = IndexEntry {
            offset,
            len: payload.len() as u32,
        };
        let mut bytes = [0_u8; INDEX_ENTRY_LEN as usize];
        bytes[..8].copy_from_slice(&entry.offset.to_le_bytes());
        bytes[8..].copy_from_slice(&entry.len.to_le_bytes());
        self.file
            .seek(SeekFrom::Start(self.index_pos + nchunk * INDEX_ENTRY_LEN))?;
        self.file.write_all(&bytes)?;
        self.file.flush()?;

        self.index[nchunk as usize] = entry;
        Ok(())
    }

    /// Read a decompressed region. The selection must have been resolved
    /// against this container's shape.
    pub fn read_slice(&mut self, sel: &Selection) -> Result<Vec<u8>> {
        let typesize = self.header.typesize()?;
        let mut out = vec![0_u8; sel.nitems() as usize * typesize];
        if sel.is_empty() {
            return Ok(out);
        }
        let grid = self.header.chunk_grid();
        let chunk_shape = self.header.chunk_shape.clone();
        for nchunk in slicing::chunks_for(sel, &self.header.shape, &chunk_shape) {
            let block = self.read_chunk_decompressed(nchunk)?;
            let coords = slicing::delinearize(nchunk, &grid);
            slicing::copy_chunk_region(&block, &coords, &chunk_shape, sel, &mut out, typesize);
        }
        Ok(out)
    }

    /// Replace the container's vlmeta by rebuilding the file in place.
    pub fn write_vlmeta(&mut self, vlmeta: Vlmeta) -> Result<()> {
        let mut header = self.header.clone();
        header.vlmeta = vlmeta;

        let mut chunks = Vec::new();
        for n in 0..self.chunk_count() {
            if self.has_chunk(n) {
                chunks.push((n, self.read_chunk(n)?));
            }
        }

        let path = self.path.clone();
        let mut rebuilt = Container::create(&path, header)?;
        for (n, payload) in chunks {
            rebuilt.insert_chunk(n, &payload)?;
        }
        *self = rebuilt;
        Ok(())
    }

    pub fn vlmeta(&self) -> &Vlmeta {
        &self.header.vlmeta
    }

    /// Dataset metadata for this container under the given ETag.
    pub fn meta(&self, etag: &str) -> DatasetMeta {
        DatasetMeta {
            etag: etag.to_owned(),
            kind: self.header.kind,
            shape: Some(self.header.shape.clone()),
            dtype: Some(self.header.dtype.clone()),
            chunk_shape: Some(self.header.chunk_shape.clone()),
            chunk_count: self.chunk_count(),
            chunk_sizes: Some(self.chunk_sizes()),
            vlmeta: self.header.vlmeta.clone(),
        }
    }

    /// Serialize to a self-describing frame. All chunks must be present.
    pub fn to_cframe(&mut self) -> Result<Vec<u8>> {
        if !self.index.iter().all(IndexEntry::present) {
            return Err(DepotError::Container(format!(
                "cannot serialize {} with missing chunks",
                self.path.display()
            )));
        }

        let mut payloads = Vec::with_capacity(self.index.len());
        for n in 0..self.chunk_count() {
            payloads.push(self.read_chunk(n)?);
        }
        assemble_frame(&self.header, &payloads)
    }
}

fn assemble_frame(header: &ContainerHeader, payloads: &[Vec<u8>]) -> Result<Vec<u8>> {
    let header_bytes = encode_header(header)?;
    let index_pos = PREFIX_LEN + header_bytes.len() as u64;

    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.push(VERSION);
    out.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&header_bytes);

    let mut offset = index_pos + payloads.len() as u64 * INDEX_ENTRY_LEN;
    for payload in payloads {
        out.extend_from_slice(&offset.to_le_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        offset += payload.len() as u64;
    }
    for payload in payloads {
        out.extend_from_slice(payload);
    }
    Ok(out)
}

/// Build a complete serialized frame in memory from row-major element
/// bytes, without touching disk.
pub fn frame_from_bytes(header: &ContainerHeader, data: &[u8]) -> Result<Vec<u8>> {
    header.validate()?;
    let typesize = header.typesize()?;
    let expected = header.shape.iter().product::<u64>() as usize * typesize;
    if data.len() != expected {
        return Err(DepotError::Container(format!(
            "data is {} bytes, shape wants {expected}",
            data.len()
        )));
    }

    let grid = header.chunk_grid();
    let chunk_count = header.chunk_count();
    let mut payloads = Vec::with_capacity(chunk_count as usize);
    for n in 0..chunk_count {
        let coords = slicing::delinearize(n, &grid);
        let block =
            slicing::extract_chunk_block(data, &header.shape, &header.chunk_shape, &coords, typesize);
        payloads.push(compress_chunk(&block));
    }
    assemble_frame(header, &payloads)
}

/// Validate frame bytes and write them to disk as a container file.
pub fn write_cframe(path: &Path, bytes: &[u8]) -> Result<()> {
    parse_frame_header(bytes)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Decode the header of a serialized frame without touching disk.
pub fn parse_frame_header(bytes: &[u8]) -> Result<ContainerHeader> {
    if bytes.len() < PREFIX_LEN as usize || bytes[..4] != MAGIC {
        return Err(DepotError::Container("not a container frame".into()));
    }
    if bytes[4] != VERSION {
        return Err(DepotError::Container("unsupported frame version".into()));
    }
    let header_len =
        u32::from_le_bytes(bytes[5..9].try_into().expect("4 bytes")) as usize;
    let end = PREFIX_LEN as usize + header_len;
    if bytes.len() < end {
        return Err(DepotError::Container("truncated frame header".into()));
    }
    let header: ContainerHeader = rmp_serde::from_slice(&bytes[PREFIX_LEN as usize..end])
        .map_err(|err| DepotError::Container(format!("frame header decode: {err}")))?;
    header.validate()?;
    Ok(header)
}

fn encode_header(header: &ContainerHeader) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(header)
        .map_err(|err| DepotError::Container(format!("header encode: {err}")))
}

fn bad_container(path: &Path, what: &str) -> DepotError {
    DepotError::Container(format!("{}: {what}", path.display()))
}

/// Write a complete N-dimensional container from row-major element bytes.
pub fn write_nd(
    path: &Path,
    dtype: &str,
    shape: &[u64],
    chunk_shape: &[u64],
    data: &[u8],
    vlmeta: Vlmeta,
) -> Result<()> {
    let header = ContainerHeader {
        kind: DatasetKind::B2nd,
        dtype: dtype.to_owned(),
        shape: shape.to_vec(),
        chunk_shape: chunk_shape.to_vec(),
        vlmeta,
    };
    write_full(path, header, data)
}

/// Write a complete 1-D byte-stream container.
pub fn write_frame(path: &Path, data: &[u8], chunk_len: u64, vlmeta: Vlmeta) -> Result<()> {
    let header = ContainerHeader {
        kind: DatasetKind::B2frame,
        dtype: "u1".to_owned(),
        shape: vec![data.len() as u64],
        chunk_shape: vec![chunk_len.max(1)],
        vlmeta,
    };
    write_full(path, header, data)
}

fn write_full(path: &Path, header: ContainerHeader, data: &[u8]) -> Result<()> {
    header.validate()?;
    let typesize = header.typesize()?;
    let expected = header.shape.iter().product::<u64>() as usize * typesize;
    if data.len() != expected {
        return Err(DepotError::Container(format!(
            "data is {} bytes, shape wants {expected}",
            data.len()
        )));
    }

    let grid = header.chunk_grid();
    let shape = header.shape.clone();
    let chunk_shape = header.chunk_shape.clone();
    let mut container = Container::create(path, header)?;
    for n in 0..container.chunk_count() {
        let coords = slicing::delinearize(n, &grid);
        let block = slicing::extract_chunk_block(data, &shape, &chunk_shape, &coords, typesize);
        container.insert_chunk(n, &compress_chunk(&block))?;
    }
    Ok(())
}
