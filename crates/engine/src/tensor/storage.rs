//! Backing storage for tensors
//!
//! Three storage variants cover the full range of model sizes: dense
//! (one contiguous heap buffer), chunked (a sequence of fixed-size buffers
//! so logical lengths can exceed a single 32-bit-addressable allocation),
//! and memory-mapped (a disk-backed view, read-only unless created with
//! write intent). Allocation falls through from dense to chunked
//! automatically once the dense element limit is crossed.

use emberlm_common::{EmberError, Result};
use memmap2::{Mmap, MmapMut};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

/// Largest element count a dense buffer may hold
pub const DENSE_MAX_ELEMENTS: usize = i32::MAX as usize;

/// Elements per chunk in chunked storage (256 MiB of f32 per chunk)
pub const DEFAULT_CHUNK_ELEMENTS: usize = 64 * 1024 * 1024;

/// Tensor backing memory
pub enum TensorStorage {
    /// One contiguous heap buffer
    Dense(Vec<f32>),

    /// Ordered fixed-size chunks
    Chunked(ChunkedStorage),

    /// Disk-backed view
    Mapped(MappedStorage),
}

impl TensorStorage {
    /// Allocate zeroed storage for `len` elements, choosing dense or chunked
    /// based on the dense element limit.
    pub fn alloc(len: usize) -> Self {
        Self::alloc_with_limits(len, DENSE_MAX_ELEMENTS, DEFAULT_CHUNK_ELEMENTS)
    }

    /// Allocation with explicit limits; `alloc` passes the platform defaults.
    pub(crate) fn alloc_with_limits(len: usize, dense_max: usize, chunk_len: usize) -> Self {
        if len <= dense_max {
            TensorStorage::Dense(vec![0.0; len])
        } else {
            TensorStorage::Chunked(ChunkedStorage::zeroed(len, chunk_len))
        }
    }

    /// Wrap an existing buffer
    pub fn from_vec(data: Vec<f32>) -> Self {
        TensorStorage::Dense(data)
    }

    /// Map `len` elements from a file starting at `byte_offset`.
    ///
    /// The mapping is read-only unless `write` is set. Fails with a storage
    /// error if the file holds fewer than `byte_offset + len * 4` bytes.
    pub fn map_file(path: &Path, byte_offset: u64, len: usize, write: bool) -> Result<Self> {
        MappedStorage::open(path, byte_offset, len, write).map(TensorStorage::Mapped)
    }

    /// Total element count
    pub fn len(&self) -> usize {
        match self {
            TensorStorage::Dense(data) => data.len(),
            TensorStorage::Chunked(chunked) => chunked.len(),
            TensorStorage::Mapped(mapped) => mapped.len(),
        }
    }

    /// Whether the storage holds no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read one element.
    ///
    /// Streaming kernels must not call this per element; use
    /// [`TensorStorage::chunk`] views instead.
    pub fn get(&self, index: usize) -> f32 {
        match self {
            TensorStorage::Dense(data) => data[index],
            TensorStorage::Chunked(chunked) => chunked.get(index),
            TensorStorage::Mapped(mapped) => mapped.as_slice()[index],
        }
    }

    /// Write one element. Fails on a read-only mapping.
    pub fn set(&mut self, index: usize, value: f32) -> Result<()> {
        match self {
            TensorStorage::Dense(data) => {
                data[index] = value;
                Ok(())
            }
            TensorStorage::Chunked(chunked) => {
                chunked.set(index, value);
                Ok(())
            }
            TensorStorage::Mapped(mapped) => mapped.set(index, value),
        }
    }

    /// Bulk copy `dst.len()` elements starting at `src_index` into `dst`
    pub fn copy_to(&self, src_index: usize, dst: &mut [f32]) -> Result<()> {
        let end = src_index
            .checked_add(dst.len())
            .filter(|&e| e <= self.len())
            .ok_or_else(|| {
                EmberError::shape(format!(
                    "copy_to of {} elements at {} out of bounds for storage of {}",
                    dst.len(),
                    src_index,
                    self.len()
                ))
            })?;

        match self {
            TensorStorage::Dense(data) => dst.copy_from_slice(&data[src_index..end]),
            TensorStorage::Chunked(chunked) => chunked.copy_to(src_index, dst),
            TensorStorage::Mapped(mapped) => {
                dst.copy_from_slice(&mapped.as_slice()[src_index..end])
            }
        }
        Ok(())
    }

    /// Bulk copy `src` into the storage starting at `dst_index`
    pub fn copy_from(&mut self, src: &[f32], dst_index: usize) -> Result<()> {
        let end = dst_index
            .checked_add(src.len())
            .filter(|&e| e <= self.len())
            .ok_or_else(|| {
                EmberError::shape(format!(
                    "copy_from of {} elements at {} out of bounds for storage of {}",
                    src.len(),
                    dst_index,
                    self.len()
                ))
            })?;

        match self {
            TensorStorage::Dense(data) => data[dst_index..end].copy_from_slice(src),
            TensorStorage::Chunked(chunked) => chunked.copy_from(src, dst_index),
            TensorStorage::Mapped(mapped) => mapped.copy_from(src, dst_index)?,
        }
        Ok(())
    }

    /// Set every element to `value`. Slow on mapped storage; avoid on hot
    /// paths.
    pub fn fill(&mut self, value: f32) -> Result<()> {
        match self {
            TensorStorage::Dense(data) => {
                data.fill(value);
                Ok(())
            }
            TensorStorage::Chunked(chunked) => {
                chunked.fill(value);
                Ok(())
            }
            TensorStorage::Mapped(mapped) => mapped.fill(value),
        }
    }

    /// Zero every element. Slow on mapped storage; avoid on hot paths.
    pub fn clear(&mut self) -> Result<()> {
        self.fill(0.0)
    }

    /// Direct view of the owned dense buffer.
    ///
    /// Chunked storage is not contiguous and mapped storage never hands out
    /// its buffer as a dense view; both refuse.
    pub fn dense_view(&self) -> Result<&[f32]> {
        match self {
            TensorStorage::Dense(data) => Ok(data),
            TensorStorage::Chunked(_) => Err(EmberError::storage(
                "dense_view unavailable for chunked storage",
            )),
            TensorStorage::Mapped(_) => Err(EmberError::storage(
                "dense_view unavailable for memory-mapped storage",
            )),
        }
    }

    /// Contiguous read-only view, available for dense and mapped storage
    pub fn contiguous(&self) -> Option<&[f32]> {
        match self {
            TensorStorage::Dense(data) => Some(data),
            TensorStorage::Chunked(_) => None,
            TensorStorage::Mapped(mapped) => Some(mapped.as_slice()),
        }
    }

    /// Number of chunks exposed for streaming reads
    pub fn chunk_count(&self) -> usize {
        match self {
            TensorStorage::Dense(_) | TensorStorage::Mapped(_) => 1,
            TensorStorage::Chunked(chunked) => chunked.chunks.len(),
        }
    }

    /// Read view of one chunk; dense and mapped storage expose a single
    /// chunk covering everything.
    pub fn chunk(&self, index: usize) -> &[f32] {
        match self {
            TensorStorage::Dense(data) => {
                assert_eq!(index, 0, "dense storage has a single chunk");
                data
            }
            TensorStorage::Chunked(chunked) => &chunked.chunks[index],
            TensorStorage::Mapped(mapped) => {
                assert_eq!(index, 0, "mapped storage has a single chunk");
                mapped.as_slice()
            }
        }
    }

    /// Element offset of a chunk within the logical buffer
    pub fn chunk_offset(&self, index: usize) -> usize {
        match self {
            TensorStorage::Dense(_) | TensorStorage::Mapped(_) => 0,
            TensorStorage::Chunked(chunked) => index * chunked.chunk_len,
        }
    }
}

impl std::fmt::Debug for TensorStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TensorStorage::Dense(data) => write!(f, "Dense(len={})", data.len()),
            TensorStorage::Chunked(chunked) => write!(
                f,
                "Chunked(len={}, chunks={})",
                chunked.len(),
                chunked.chunks.len()
            ),
            TensorStorage::Mapped(mapped) => write!(
                f,
                "Mapped(len={}, path={}, writable={})",
                mapped.len(),
                mapped.path.display(),
                mapped.writable()
            ),
        }
    }
}

/// Chunked backing buffer: fixed-size chunks, last chunk possibly short
pub struct ChunkedStorage {
    chunks: Vec<Vec<f32>>,
    chunk_len: usize,
    len: usize,
}

impl ChunkedStorage {
    /// Allocate `len` zeroed elements in chunks of `chunk_len`
    pub fn zeroed(len: usize, chunk_len: usize) -> Self {
        assert!(chunk_len > 0, "chunk_len must be positive");
        let full = len / chunk_len;
        let tail = len % chunk_len;

        let mut chunks = Vec::with_capacity(full + usize::from(tail > 0));
        for _ in 0..full {
            chunks.push(vec![0.0; chunk_len]);
        }
        if tail > 0 {
            chunks.push(vec![0.0; tail]);
        }

        Self {
            chunks,
            chunk_len,
            len,
        }
    }

    /// Total element count
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds no elements
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Resolve a global index to (chunk, offset)
    #[inline]
    fn locate(&self, index: usize) -> (usize, usize) {
        (index / self.chunk_len, index % self.chunk_len)
    }

    fn get(&self, index: usize) -> f32 {
        let (chunk, offset) = self.locate(index);
        self.chunks[chunk][offset]
    }

    fn set(&mut self, index: usize, value: f32) {
        let (chunk, offset) = self.locate(index);
        self.chunks[chunk][offset] = value;
    }

    fn copy_to(&self, mut src_index: usize, dst: &mut [f32]) {
        let mut written = 0;
        while written < dst.len() {
            let (chunk, offset) = self.locate(src_index);
            let available = self.chunks[chunk].len() - offset;
            let take = available.min(dst.len() - written);
            dst[written..written + take]
                .copy_from_slice(&self.chunks[chunk][offset..offset + take]);
            written += take;
            src_index += take;
        }
    }

    fn copy_from(&mut self, src: &[f32], mut dst_index: usize) {
        let mut read = 0;
        while read < src.len() {
            let (chunk, offset) = self.locate(dst_index);
            let available = self.chunks[chunk].len() - offset;
            let take = available.min(src.len() - read);
            self.chunks[chunk][offset..offset + take].copy_from_slice(&src[read..read + take]);
            read += take;
            dst_index += take;
        }
    }

    fn fill(&mut self, value: f32) {
        for chunk in &mut self.chunks {
            chunk.fill(value);
        }
    }
}

/// Disk-backed storage over a memory-mapped file region
pub struct MappedStorage {
    map: MapVariant,
    len: usize,
    byte_offset: u64,
    path: PathBuf,
}

enum MapVariant {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

impl MappedStorage {
    /// Map `len` f32 elements starting at `byte_offset` of `path`
    pub fn open(path: &Path, byte_offset: u64, len: usize, write: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(write)
            .open(path)
            .map_err(|e| EmberError::storage_at(path, format!("open failed: {e}")))?;

        let required = byte_offset + (len as u64) * 4;
        let actual = file
            .metadata()
            .map_err(|e| EmberError::storage_at(path, format!("metadata failed: {e}")))?
            .len();
        if actual < required {
            return Err(EmberError::storage_at(
                path,
                format!("file holds {actual} bytes, {required} required"),
            ));
        }

        let map = if write {
            // Safety: the file stays open for the lifetime of the map; the
            // region was validated against the file length above.
            let map = unsafe {
                memmap2::MmapOptions::new()
                    .offset(byte_offset)
                    .len(len * 4)
                    .map_mut(&file)
            }
            .map_err(|e| EmberError::storage_at(path, format!("mmap failed: {e}")))?;
            MapVariant::ReadWrite(map)
        } else {
            // Safety: as above.
            let map = unsafe {
                memmap2::MmapOptions::new()
                    .offset(byte_offset)
                    .len(len * 4)
                    .map(&file)
            }
            .map_err(|e| EmberError::storage_at(path, format!("mmap failed: {e}")))?;
            MapVariant::ReadOnly(map)
        };

        Ok(Self {
            map,
            len,
            byte_offset,
            path: path.to_path_buf(),
        })
    }

    /// Total element count
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping holds no elements
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the mapping was created with write intent
    pub fn writable(&self) -> bool {
        matches!(self.map, MapVariant::ReadWrite(_))
    }

    /// Byte offset of the mapped region within the file
    pub fn byte_offset(&self) -> u64 {
        self.byte_offset
    }

    fn bytes(&self) -> &[u8] {
        match &self.map {
            MapVariant::ReadOnly(map) => map,
            MapVariant::ReadWrite(map) => map,
        }
    }

    /// Read view of the mapped elements
    pub fn as_slice(&self) -> &[f32] {
        let bytes = self.bytes();
        // Safety: the mapping starts page-aligned plus a 4-byte-multiple
        // offset enforced by the file format, and covers exactly len * 4
        // bytes; f32 has no invalid bit patterns.
        unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const f32, self.len) }
    }

    fn as_mut_slice(&mut self) -> Result<&mut [f32]> {
        match &mut self.map {
            MapVariant::ReadOnly(_) => Err(EmberError::storage_at(
                &self.path,
                "mapping is read-only; create with write intent to mutate",
            )),
            MapVariant::ReadWrite(map) => {
                // Safety: as in as_slice, for the mutable view.
                Ok(unsafe {
                    std::slice::from_raw_parts_mut(map.as_mut_ptr() as *mut f32, self.len)
                })
            }
        }
    }

    fn set(&mut self, index: usize, value: f32) -> Result<()> {
        self.as_mut_slice()?[index] = value;
        Ok(())
    }

    fn copy_from(&mut self, src: &[f32], dst_index: usize) -> Result<()> {
        let slice = self.as_mut_slice()?;
        slice[dst_index..dst_index + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn fill(&mut self, value: f32) -> Result<()> {
        self.as_mut_slice()?.fill(value);
        Ok(())
    }
}
