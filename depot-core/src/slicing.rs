//! Slice algebra: parsing slice expressions, resolving them against a
//! dataset's shape, computing the set of chunks a selection intersects, and
//! moving bytes between row-major chunk blocks and result buffers.
//!
//! A slice expression mirrors N-dimensional indexing: comma-separated
//! per-dimension items, each an integer or `lo:hi` with both bounds optional.
//! Steps other than 1 and negative indices are rejected.

use crate::error::{DepotError, Result};

/// One parsed per-dimension item of a slice expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceItem {
    /// A single integer index; selects one element and drops the dimension
    /// from the result shape.
    Index(u64),
    /// A half-open range with optional bounds.
    Range { lo: Option<u64>, hi: Option<u64> },
}

/// Parse a slice expression such as `"1"`, `":10"`, or `"0:10,5:8"`.
///
/// An empty expression selects everything.
pub fn parse(expr: &str) -> Result<Vec<SliceItem>> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Ok(Vec::new());
    }

    expr.split(',').map(|item| parse_item(item.trim())).collect()
}

fn parse_item(item: &str) -> Result<SliceItem> {
    if item.is_empty() {
        return Err(DepotError::SliceUnsupported(
            "empty slice dimension".into(),
        ));
    }

    let parts: Vec<&str> = item.split(':').collect();
    match parts.len() {
        1 => Ok(SliceItem::Index(parse_bound(parts[0])?.ok_or_else(|| {
            DepotError::SliceUnsupported(format!("invalid index: {item:?}"))
        })?)),
        2 => Ok(SliceItem::Range {
            lo: parse_bound(parts[0])?,
            hi: parse_bound(parts[1])?,
        }),
        3 => {
            match parts[2] {
                "" | "1" => {}
                _ => {
                    return Err(DepotError::SliceUnsupported(
                        "Only step=1 is supported".into(),
                    ));
                }
            }
            Ok(SliceItem::Range {
                lo: parse_bound(parts[0])?,
                hi: parse_bound(parts[1])?,
            })
        }
        _ => Err(DepotError::SliceUnsupported(format!(
            "malformed slice dimension: {item:?}"
        ))),
    }
}

fn parse_bound(text: &str) -> Result<Option<u64>> {
    if text.is_empty() {
        return Ok(None);
    }
    if text.starts_with('-') {
        return Err(DepotError::SliceUnsupported(
            "negative indices are not supported".into(),
        ));
    }
    text.parse::<u64>().map(Some).map_err(|_| {
        DepotError::SliceUnsupported(format!("invalid slice bound: {text:?}"))
    })
}

/// Resolved bounds along one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimSel {
    pub lo: u64,
    pub hi: u64,
    /// True when the dimension was addressed by an integer index, so it is
    /// dropped from the result shape.
    pub scalar: bool,
}

/// A slice expression resolved against a concrete shape: clamped, half-open
/// bounds for every dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub dims: Vec<DimSel>,
}

impl Selection {
    /// Resolve parsed items against `shape`. Missing trailing dimensions
    /// default to the full extent; upper bounds are clamped to the shape.
    pub fn resolve(items: &[SliceItem], shape: &[u64]) -> Result<Selection> {
        if items.len() > shape.len() {
            return Err(DepotError::SliceUnsupported(format!(
                "too many indices for shape: {} > {}",
                items.len(),
                shape.len()
            )));
        }

        let mut dims = Vec::with_capacity(shape.len());
        for (d, &extent) in shape.iter().enumerate() {
            let sel = match items.get(d) {
                Some(SliceItem::Index(i)) => {
                    if *i >= extent {
                        return Err(DepotError::SliceUnsupported(format!(
                            "index {i} is out of bounds for dimension {d} with size {extent}"
                        )));
                    }
                    DimSel {
                        lo: *i,
                        hi: *i + 1,
                        scalar: true,
                    }
                }
                Some(SliceItem::Range { lo, hi }) => {
                    let lo = lo.unwrap_or(0).min(extent);
                    let hi = hi.unwrap_or(extent).min(extent).max(lo);
                    DimSel {
                        lo,
                        hi,
                        scalar: false,
                    }
                }
                None => DimSel {
                    lo: 0,
                    hi: extent,
                    scalar: false,
                },
            };
            dims.push(sel);
        }
        Ok(Selection { dims })
    }

    /// Selected extent per dimension (scalar dimensions count as 1).
    pub fn extents(&self) -> Vec<u64> {
        self.dims.iter().map(|d| d.hi - d.lo).collect()
    }

    /// Shape of the result, with scalar dimensions dropped.
    pub fn result_shape(&self) -> Vec<u64> {
        self.dims
            .iter()
            .filter(|d| !d.scalar)
            .map(|d| d.hi - d.lo)
            .collect()
    }

    pub fn nitems(&self) -> u64 {
        self.extents().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.dims.iter().any(|d| d.lo >= d.hi)
    }
}

/// Number of chunks along each dimension. Never zero along a dimension, so
/// even an empty dataset owns one (empty) chunk slot.
pub fn chunk_grid(shape: &[u64], chunk_shape: &[u64]) -> Vec<u64> {
    shape
        .iter()
        .zip(chunk_shape)
        .map(|(&extent, &chunk)| extent.div_ceil(chunk).max(1))
        .collect()
}

/// Linearize chunk grid coordinates in row-major order.
pub fn linearize(coords: &[u64], grid: &[u64]) -> u64 {
    let mut index = 0;
    for (c, g) in coords.iter().zip(grid) {
        index = index * g + c;
    }
    index
}

/// Inverse of [`linearize`].
pub fn delinearize(mut index: u64, grid: &[u64]) -> Vec<u64> {
    let mut coords = vec![0; grid.len()];
    for d in (0..grid.len()).rev() {
        coords[d] = index % grid[d];
        index /= grid[d];
    }
    coords
}

/// Sorted, linearized indices of every chunk the selection intersects.
pub fn chunks_for(sel: &Selection, shape: &[u64], chunk_shape: &[u64]) -> Vec<u64> {
    if sel.is_empty() {
        return Vec::new();
    }
    let grid = chunk_grid(shape, chunk_shape);

    // Per-dimension chunk ranges, then their Cartesian product.
    let ranges: Vec<(u64, u64)> = sel
        .dims
        .iter()
        .zip(chunk_shape)
        .map(|(d, &chunk)| (d.lo / chunk, d.hi.div_ceil(chunk)))
        .collect();

    let mut out = Vec::new();
    let mut coords: Vec<u64> = ranges.iter().map(|r| r.0).collect();
    'outer: loop {
        out.push(linearize(&coords, &grid));
        for d in (0..coords.len()).rev() {
            coords[d] += 1;
            if coords[d] < ranges[d].1 {
                continue 'outer;
            }
            coords[d] = ranges[d].0;
        }
        break;
    }
    out.sort_unstable();
    out
}

fn strides(extents: &[u64]) -> Vec<u64> {
    let mut strides = vec![1; extents.len()];
    for d in (0..extents.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * extents[d + 1];
    }
    strides
}

/// Copy the part of a decompressed chunk block that falls inside the
/// selection into the result buffer.
///
/// `chunk` holds the full `chunk_shape` block (edge chunks are zero-padded),
/// `out` is the row-major buffer for the whole selection.
pub fn copy_chunk_region(
    chunk: &[u8],
    chunk_coords: &[u64],
    chunk_shape: &[u64],
    sel: &Selection,
    out: &mut [u8],
    typesize: usize,
) {
    let ndim = chunk_shape.len();
    if ndim == 0 {
        // 0-dimensional containers hold a single element in one chunk.
        out[..typesize].copy_from_slice(&chunk[..typesize]);
        return;
    }
    let mut o_lo = vec![0_u64; ndim];
    let mut o_hi = vec![0_u64; ndim];
    for d in 0..ndim {
        let origin = chunk_coords[d] * chunk_shape[d];
        o_lo[d] = sel.dims[d].lo.max(origin);
        o_hi[d] = sel.dims[d].hi.min(origin + chunk_shape[d]);
        if o_lo[d] >= o_hi[d] {
            return;
        }
    }

    let chunk_strides = strides(chunk_shape);
    let out_strides = strides(&sel.extents());
    let row_len = (o_hi[ndim - 1] - o_lo[ndim - 1]) as usize * typesize;

    for_each_row(&o_lo, &o_hi, |pos| {
        let mut src = 0_u64;
        let mut dst = 0_u64;
        for d in 0..ndim {
            src += (pos[d] - chunk_coords[d] * chunk_shape[d]) * chunk_strides[d];
            dst += (pos[d] - sel.dims[d].lo) * out_strides[d];
        }
        let src = src as usize * typesize;
        let dst = dst as usize * typesize;
        out[dst..dst + row_len].copy_from_slice(&chunk[src..src + row_len]);
    });
}

/// Extract one chunk's block from a full row-major array, zero-padding past
/// the array edges. The inverse of [`copy_chunk_region`] for whole arrays.
pub fn extract_chunk_block(
    data: &[u8],
    shape: &[u64],
    chunk_shape: &[u64],
    chunk_coords: &[u64],
    typesize: usize,
) -> Vec<u8> {
    let ndim = shape.len();
    let nbytes = chunk_shape.iter().product::<u64>() as usize * typesize;
    let mut block = vec![0_u8; nbytes];
    if ndim == 0 {
        block.copy_from_slice(&data[..typesize]);
        return block;
    }

    let mut o_lo = vec![0_u64; ndim];
    let mut o_hi = vec![0_u64; ndim];
    for d in 0..ndim {
        let origin = chunk_coords[d] * chunk_shape[d];
        o_lo[d] = origin.min(shape[d]);
        o_hi[d] = (origin + chunk_shape[d]).min(shape[d]);
        if o_lo[d] >= o_hi[d] {
            return block;
        }
    }

    let data_strides = strides(shape);
    let chunk_strides = strides(chunk_shape);
    let row_len = (o_hi[ndim - 1] - o_lo[ndim - 1]) as usize * typesize;

    for_each_row(&o_lo, &o_hi, |pos| {
        let mut src = 0_u64;
        let mut dst = 0_u64;
        for d in 0..ndim {
            src += pos[d] * data_strides[d];
            dst += (pos[d] - chunk_coords[d] * chunk_shape[d]) * chunk_strides[d];
        }
        let src = src as usize * typesize;
        let dst = dst as usize * typesize;
        block[dst..dst + row_len].copy_from_slice(&data[src..src + row_len]);
    });
    block
}

/// Visit every row of the region `[o_lo, o_hi)`: all coordinate combinations
/// over the outer dimensions, with the last dimension pinned at its start.
fn for_each_row(o_lo: &[u64], o_hi: &[u64], mut f: impl FnMut(&[u64])) {
    let ndim = o_lo.len();
    let mut pos = o_lo.to_vec();
    loop {
        f(&pos);
        // Advance the odometer over the outer dimensions.
        let mut d = ndim.wrapping_sub(2);
        loop {
            if d == usize::MAX {
                return;
            }
            pos[d] += 1;
            if pos[d] < o_hi[d] {
                break;
            }
            pos[d] = o_lo[d];
            d = d.wrapping_sub(1);
        }
    }
}
