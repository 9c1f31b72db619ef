//! Multi-layer key/value cache for incremental decoding
//!
//! Per layer the cache holds one K and one V buffer, 64-byte aligned, with
//! logical layout `[position][kv_head][feature]`. A single sequence-length
//! watermark is shared across layers: every layer appends at the watermark
//! during a step, and the watermark advances exactly once afterwards, so a
//! failed step leaves the cache at its pre-step state.
//!
//! By default the full `max_seq_len` is reserved up front, which keeps
//! growth branches off the decode path; page-granular growth is an opt-in
//! for extreme contexts.

use emberlm_common::{EmberError, Result};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

/// Cache-line alignment for K/V buffers
const KV_ALIGN: usize = 64;

/// Default positions reserved per growth step when paging is enabled
pub const DEFAULT_PAGE_SIZE: usize = 64;

/// Cache fill state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// No positions stored
    Empty,

    /// Some positions stored, capacity remains
    Growing,

    /// `seq_len == max_seq_len`; appends fail until cleared
    Full,
}

/// A 64-byte-aligned, heap-allocated f32 buffer
struct AlignedBuf {
    ptr: NonNull<f32>,
    len: usize,
}

impl AlignedBuf {
    fn zeroed(len: usize) -> Self {
        assert!(len > 0, "aligned buffer must be non-empty");
        let layout = Layout::from_size_align(len * 4, KV_ALIGN).expect("valid KV layout");
        // Safety: layout has non-zero size; allocation failure aborts via
        // handle_alloc_error.
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw as *mut f32) else {
            std::alloc::handle_alloc_error(layout)
        };
        Self { ptr, len }
    }

    fn as_slice(&self) -> &[f32] {
        // Safety: ptr covers len initialized (zeroed or written) f32s.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [f32] {
        // Safety: as above, and &mut self guarantees uniqueness.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.len * 4, KV_ALIGN).expect("valid KV layout");
        // Safety: ptr was allocated with exactly this layout.
        unsafe { dealloc(self.ptr.as_ptr() as *mut u8, layout) }
    }
}

// Safety: AlignedBuf owns its allocation exclusively.
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

/// Key/value store for one session
pub struct KvCache {
    num_layers: usize,
    num_heads: usize,
    kv_heads: usize,
    head_dim: usize,
    max_seq_len: usize,
    page_size: usize,
    paged: bool,

    /// Allocated positions per layer
    capacity: usize,

    /// Committed sequence length, shared across layers
    seq_len: usize,

    keys: Vec<AlignedBuf>,
    values: Vec<AlignedBuf>,
}

impl KvCache {
    /// Create a cache with the full `max_seq_len` reserved up front
    pub fn new(
        num_layers: usize,
        num_heads: usize,
        kv_heads: usize,
        head_dim: usize,
        max_seq_len: usize,
    ) -> Result<Self> {
        Self::with_paging(num_layers, num_heads, kv_heads, head_dim, max_seq_len, false, DEFAULT_PAGE_SIZE)
    }

    /// Create a cache that grows in pages of `page_size` positions
    pub fn with_paging(
        num_layers: usize,
        num_heads: usize,
        kv_heads: usize,
        head_dim: usize,
        max_seq_len: usize,
        paged: bool,
        page_size: usize,
    ) -> Result<Self> {
        if num_layers == 0 || kv_heads == 0 || head_dim == 0 || max_seq_len == 0 {
            return Err(EmberError::invalid_input(
                "KV cache dimensions must be positive",
            ));
        }
        if num_heads % kv_heads != 0 {
            return Err(EmberError::invalid_input(format!(
                "num_heads ({num_heads}) must be a multiple of kv_heads ({kv_heads})"
            )));
        }
        if page_size == 0 {
            return Err(EmberError::invalid_input("page_size must be > 0"));
        }

        let capacity = if paged {
            page_size.min(max_seq_len)
        } else {
            max_seq_len
        };
        let per_layer = capacity * kv_heads * head_dim;

        let keys = (0..num_layers).map(|_| AlignedBuf::zeroed(per_layer)).collect();
        let values = (0..num_layers).map(|_| AlignedBuf::zeroed(per_layer)).collect();

        Ok(Self {
            num_layers,
            num_heads,
            kv_heads,
            head_dim,
            max_seq_len,
            page_size,
            paged,
            capacity,
            seq_len: 0,
            keys,
            values,
        })
    }

    /// Committed sequence length
    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Maximum positions the cache can ever hold
    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// Number of decoder layers
    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    /// Query heads per KV head
    pub fn group_size(&self) -> usize {
        self.num_heads / self.kv_heads
    }

    /// Elements per position in each layer's buffer
    pub fn kv_stride(&self) -> usize {
        self.kv_heads * self.head_dim
    }

    /// Current fill state
    pub fn state(&self) -> CacheState {
        if self.seq_len == 0 {
            CacheState::Empty
        } else if self.seq_len == self.max_seq_len {
            CacheState::Full
        } else {
            CacheState::Growing
        }
    }

    /// Bytes held in K and V buffers across all layers
    pub fn allocated_bytes(&self) -> u64 {
        2 * (self.num_layers as u64) * (self.capacity as u64) * (self.kv_stride() as u64) * 4
    }

    /// Append `n_new` positions of keys and values to one layer at the
    /// current watermark.
    ///
    /// Every layer must append the same `n_new` before
    /// [`KvCache::advance`] commits the step.
    pub fn append(&mut self, layer: usize, keys: &[f32], values: &[f32], n_new: usize) -> Result<()> {
        if layer >= self.num_layers {
            return Err(EmberError::invalid_input(format!(
                "layer {layer} out of range ({} layers)",
                self.num_layers
            )));
        }
        let stride = self.kv_stride();
        if keys.len() != n_new * stride || values.len() != n_new * stride {
            return Err(EmberError::shape(format!(
                "append: {} key / {} value elements for {} positions of stride {}",
                keys.len(),
                values.len(),
                n_new,
                stride
            )));
        }
        if self.seq_len + n_new > self.max_seq_len {
            return Err(EmberError::Capacity {
                seq_len: self.seq_len,
                max_seq_len: self.max_seq_len,
            });
        }

        self.ensure_capacity(self.seq_len + n_new);

        let start = self.seq_len * stride;
        self.keys[layer].as_mut_slice()[start..start + keys.len()].copy_from_slice(keys);
        self.values[layer].as_mut_slice()[start..start + values.len()].copy_from_slice(values);
        Ok(())
    }

    /// Commit a step: advance the shared watermark by `n_new`.
    ///
    /// Called once per step after all layers have appended.
    pub fn advance(&mut self, n_new: usize) -> Result<()> {
        if self.seq_len + n_new > self.max_seq_len {
            return Err(EmberError::Capacity {
                seq_len: self.seq_len,
                max_seq_len: self.max_seq_len,
            });
        }
        self.seq_len += n_new;
        Ok(())
    }

    /// Committed keys of one layer: `seq_len * kv_stride` elements
    pub fn keys(&self, layer: usize) -> &[f32] {
        &self.keys[layer].as_slice()[..self.seq_len * self.kv_stride()]
    }

    /// Committed values of one layer
    pub fn values(&self, layer: usize) -> &[f32] {
        &self.values[layer].as_slice()[..self.seq_len * self.kv_stride()]
    }

    /// Keys of one layer including positions appended but not yet
    /// committed; used by prefill attention within a step.
    pub fn keys_pending(&self, layer: usize, pending: usize) -> &[f32] {
        &self.keys[layer].as_slice()[..(self.seq_len + pending) * self.kv_stride()]
    }

    /// Values counterpart of [`KvCache::keys_pending`]
    pub fn values_pending(&self, layer: usize, pending: usize) -> &[f32] {
        &self.values[layer].as_slice()[..(self.seq_len + pending) * self.kv_stride()]
    }

    /// Zero-copy strided view of the keys one query head attends to
    pub fn keys_for_query_head(&self, layer: usize, query_head: usize) -> Result<StridedView<'_>> {
        self.head_view(self.keys(layer), query_head)
    }

    /// Zero-copy strided view of the values one query head attends to
    pub fn values_for_query_head(&self, layer: usize, query_head: usize) -> Result<StridedView<'_>> {
        self.head_view(self.values(layer), query_head)
    }

    fn head_view<'a>(&self, data: &'a [f32], query_head: usize) -> Result<StridedView<'a>> {
        if query_head >= self.num_heads {
            return Err(EmberError::invalid_input(format!(
                "query head {query_head} out of range ({} heads)",
                self.num_heads
            )));
        }
        let kv_head = query_head / self.group_size();
        Ok(StridedView {
            data,
            offset: kv_head * self.head_dim,
            width: self.head_dim,
            stride: self.kv_stride(),
            positions: self.seq_len,
        })
    }

    /// Reset to `Empty` without freeing buffers. Idempotent.
    pub fn clear(&mut self) {
        self.seq_len = 0;
    }

    /// Grow paged capacity to cover `required` positions. At most one
    /// allocation per page boundary; no-op when fully reserved.
    fn ensure_capacity(&mut self, required: usize) {
        if required <= self.capacity {
            return;
        }
        debug_assert!(self.paged);

        let pages = required.div_ceil(self.page_size);
        let new_capacity = (pages * self.page_size).min(self.max_seq_len);
        let stride = self.kv_stride();

        for bufs in [&mut self.keys, &mut self.values] {
            for buf in bufs.iter_mut() {
                let mut grown = AlignedBuf::zeroed(new_capacity * stride);
                let old = buf.as_slice();
                grown.as_mut_slice()[..old.len()].copy_from_slice(old);
                *buf = grown;
            }
        }
        self.capacity = new_capacity;
    }
}

impl std::fmt::Debug for KvCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvCache")
            .field("num_layers", &self.num_layers)
            .field("kv_heads", &self.kv_heads)
            .field("head_dim", &self.head_dim)
            .field("seq_len", &self.seq_len)
            .field("max_seq_len", &self.max_seq_len)
            .field("state", &self.state())
            .finish()
    }
}

/// Zero-copy per-head view over the cache of one layer.
///
/// Position `i`'s vector lives at `offset + i * stride`.
#[derive(Debug, Clone, Copy)]
pub struct StridedView<'a> {
    data: &'a [f32],
    offset: usize,
    width: usize,
    stride: usize,
    positions: usize,
}

impl<'a> StridedView<'a> {
    /// Number of positions in the view
    pub fn positions(&self) -> usize {
        self.positions
    }

    /// Elements per position
    pub fn width(&self) -> usize {
        self.width
    }

    /// The vector stored at `position`
    pub fn position(&self, position: usize) -> &'a [f32] {
        let start = self.offset + position * self.stride;
        &self.data[start..start + self.width]
    }

    /// Iterate positions in order
    pub fn iter(&self) -> impl Iterator<Item = &'a [f32]> + '_ {
        (0..self.positions).map(|p| self.position(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(n: usize, base: f32) -> Vec<f32> {
        (0..n).map(|i| base + i as f32).collect()
    }

    #[test]
    fn test_alignment() {
        let cache = KvCache::new(2, 4, 2, 8, 16).unwrap();
        for layer in 0..2 {
            assert_eq!(cache.keys[layer].as_slice().as_ptr() as usize % KV_ALIGN, 0);
            assert_eq!(cache.values[layer].as_slice().as_ptr() as usize % KV_ALIGN, 0);
        }
    }

    #[test]
    fn test_append_round_trip() {
        let mut cache = KvCache::new(2, 2, 2, 4, 8).unwrap();
        let stride = cache.kv_stride();

        let k0 = filled(2 * stride, 100.0);
        let v0 = filled(2 * stride, 200.0);
        for layer in 0..2 {
            cache.append(layer, &k0, &v0, 2).unwrap();
        }
        cache.advance(2).unwrap();

        assert_eq!(cache.seq_len(), 2);
        assert_eq!(cache.keys(0), k0.as_slice());
        assert_eq!(cache.values(1), v0.as_slice());

        // Second step lands after the first.
        let k1 = filled(stride, 300.0);
        let v1 = filled(stride, 400.0);
        for layer in 0..2 {
            cache.append(layer, &k1, &v1, 1).unwrap();
        }
        cache.advance(1).unwrap();

        assert_eq!(&cache.keys(0)[2 * stride..], k1.as_slice());
    }

    #[test]
    fn test_watermark_advances_after_all_layers() {
        let mut cache = KvCache::new(2, 2, 2, 4, 8).unwrap();
        let stride = cache.kv_stride();
        let k = filled(stride, 1.0);
        let v = filled(stride, 2.0);

        cache.append(0, &k, &v, 1).unwrap();
        // Watermark untouched until advance; a discarded step is invisible.
        assert_eq!(cache.seq_len(), 0);
        assert_eq!(cache.state(), CacheState::Empty);

        cache.append(1, &k, &v, 1).unwrap();
        cache.advance(1).unwrap();
        assert_eq!(cache.seq_len(), 1);
        assert_eq!(cache.state(), CacheState::Growing);
    }

    #[test]
    fn test_capacity_error_when_full() {
        let mut cache = KvCache::new(1, 2, 2, 2, 3).unwrap();
        let stride = cache.kv_stride();
        let k = filled(stride, 0.0);

        for _ in 0..3 {
            cache.append(0, &k, &k, 1).unwrap();
            cache.advance(1).unwrap();
        }
        assert_eq!(cache.state(), CacheState::Full);

        let err = cache.append(0, &k, &k, 1).unwrap_err();
        match err {
            EmberError::Capacity {
                seq_len,
                max_seq_len,
            } => {
                assert_eq!(seq_len, 3);
                assert_eq!(max_seq_len, 3);
            }
            other => panic!("expected Capacity, got {other:?}"),
        }
    }

    #[test]
    fn test_clear_is_idempotent() {
        let mut cache = KvCache::new(1, 2, 2, 2, 4).unwrap();
        let stride = cache.kv_stride();
        let k = filled(stride, 5.0);
        cache.append(0, &k, &k, 1).unwrap();
        cache.advance(1).unwrap();

        cache.clear();
        let after_one = (cache.seq_len(), cache.state(), cache.allocated_bytes());
        cache.clear();
        let after_two = (cache.seq_len(), cache.state(), cache.allocated_bytes());

        assert_eq!(after_one, after_two);
        assert_eq!(cache.state(), CacheState::Empty);

        // Buffers survive clear; the cache is immediately reusable.
        cache.append(0, &k, &k, 1).unwrap();
        cache.advance(1).unwrap();
        assert_eq!(cache.keys(0), k.as_slice());
    }

    #[test]
    fn test_strided_head_view() {
        let mut cache = KvCache::new(1, 4, 2, 3, 4).unwrap();
        let stride = cache.kv_stride(); // 2 kv heads * 3 features

        // Position p, kv head h, feature f = 100*p + 10*h + f.
        for p in 0..2 {
            let mut k = Vec::with_capacity(stride);
            for h in 0..2 {
                for f in 0..3 {
                    k.push((100 * p + 10 * h + f) as f32);
                }
            }
            cache.append(0, &k, &k, 1).unwrap();
            cache.advance(1).unwrap();
        }

        // Query heads 0,1 -> kv head 0; query heads 2,3 -> kv head 1.
        let view = cache.keys_for_query_head(0, 1).unwrap();
        assert_eq!(view.positions(), 2);
        assert_eq!(view.position(0), &[0.0, 1.0, 2.0]);
        assert_eq!(view.position(1), &[100.0, 101.0, 102.0]);

        let view = cache.keys_for_query_head(0, 3).unwrap();
        assert_eq!(view.position(1), &[110.0, 111.0, 112.0]);
        assert_eq!(view.iter().count(), 2);
    }

    #[test]
    fn test_paged_growth() {
        let mut cache = KvCache::with_paging(1, 2, 2, 2, 10, true, 4).unwrap();
        let stride = cache.kv_stride();
        assert_eq!(cache.capacity, 4);

        for step in 0..10 {
            let k = filled(stride, step as f32);
            cache.append(0, &k, &k, 1).unwrap();
            cache.advance(1).unwrap();
        }
        assert_eq!(cache.seq_len(), 10);
        assert_eq!(cache.capacity, 10); // clamped to max_seq_len

        // Earlier positions survived the copies.
        assert_eq!(cache.keys(0)[..stride], filled(stride, 0.0)[..]);
        assert_eq!(cache.keys(0)[9 * stride..], filled(stride, 9.0)[..]);
    }

    #[test]
    fn test_head_grouping_validated() {
        assert!(KvCache::new(1, 6, 4, 8, 16).is_err());
        assert!(KvCache::new(1, 8, 4, 8, 16).is_ok());
    }
}
