//! Reusable scratch buffer pool for transient activations
//!
//! Buffers are bucketed by power-of-two length and queued on lock-free
//! per-bucket queues, so renting and recycling on the decode path never
//! takes a lock. Each bucket holds at most `bucket_capacity` idle buffers;
//! beyond that, returned buffers are dropped. Callers must treat rented
//! buffers as opaque-sized: the length is at least what was requested.
//!
//! [`ScratchGuard`] provides scoped acquisition: a buffer rented through
//! [`ScratchPool::rent_scoped`] goes back to the pool when the guard drops,
//! so an error exit from the hot path cannot leak it.

use crossbeam::queue::SegQueue;
use emberlm_common::config::ScratchConfig;
use emberlm_common::metrics::METRICS;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Smallest bucket: 2^8 = 256 elements (1 KiB)
const MIN_BUCKET_SHIFT: u32 = 8;

/// Largest bucket: 2^30 elements; no model shape reaches past this
const MAX_BUCKET_SHIFT: u32 = 30;

const BUCKET_COUNT: usize = (MAX_BUCKET_SHIFT - MIN_BUCKET_SHIFT + 1) as usize;

/// Process-wide pool of f32 scratch buffers
pub struct ScratchPool {
    buckets: Vec<SegQueue<Vec<f32>>>,
    bucket_capacity: usize,
    zero_on_return: bool,
}

impl ScratchPool {
    /// Create a pool with the configured per-bucket cap
    pub fn new(config: &ScratchConfig) -> Self {
        Self {
            buckets: (0..BUCKET_COUNT).map(|_| SegQueue::new()).collect(),
            bucket_capacity: config.bucket_capacity,
            zero_on_return: config.zero_on_return,
        }
    }

    /// Bucket index for a requested length
    fn bucket_for(min_len: usize) -> usize {
        let shift = usize::BITS - min_len.max(1).next_power_of_two().leading_zeros() - 1;
        (shift.clamp(MIN_BUCKET_SHIFT, MAX_BUCKET_SHIFT) - MIN_BUCKET_SHIFT) as usize
    }

    /// Length of buffers in a bucket
    fn bucket_len(bucket: usize) -> usize {
        1usize << (bucket as u32 + MIN_BUCKET_SHIFT)
    }

    /// Rent a buffer of at least `min_len` elements.
    ///
    /// The returned buffer's contents are unspecified unless the pool was
    /// configured to zero on return.
    pub fn rent(&self, min_len: usize) -> Vec<f32> {
        let bucket = Self::bucket_for(min_len);
        METRICS.resources.scratch_rented_total.inc();

        if let Some(buf) = self.buckets[bucket].pop() {
            return buf;
        }

        METRICS.resources.scratch_allocated_total.inc();
        vec![0.0; Self::bucket_len(bucket)]
    }

    /// Rent a buffer behind a guard that recycles on drop
    pub fn rent_scoped(self: &Arc<Self>, min_len: usize) -> ScratchGuard {
        ScratchGuard {
            pool: self.clone(),
            buf: Some(self.rent(min_len)),
        }
    }

    /// Return a buffer for reuse, optionally zeroing it first.
    ///
    /// Buffers beyond the per-bucket cap are dropped.
    pub fn recycle(&self, mut buf: Vec<f32>, zero: bool) {
        if !buf.len().is_power_of_two() || buf.len() < Self::bucket_len(0) {
            // Foreign buffer; not pool-shaped, let it drop.
            return;
        }
        let bucket = Self::bucket_for(buf.len());
        if self.buckets[bucket].len() >= self.bucket_capacity {
            return;
        }
        if zero || self.zero_on_return {
            buf.fill(0.0);
        }
        METRICS.resources.scratch_recycled_total.inc();
        self.buckets[bucket].push(buf);
    }

    /// Idle buffers currently held in a bucket (test and telemetry use)
    pub fn idle_in_bucket(&self, min_len: usize) -> usize {
        self.buckets[Self::bucket_for(min_len)].len()
    }
}

impl std::fmt::Debug for ScratchPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScratchPool")
            .field("bucket_capacity", &self.bucket_capacity)
            .field("zero_on_return", &self.zero_on_return)
            .finish()
    }
}

/// RAII scratch buffer: dereferences to `[f32]` and recycles into its pool
/// when dropped, whether the owner returned normally or bailed with `?`.
pub struct ScratchGuard {
    pool: Arc<ScratchPool>,
    buf: Option<Vec<f32>>,
}

impl Deref for ScratchGuard {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        self.buf.as_deref().expect("buffer present until drop")
    }
}

impl DerefMut for ScratchGuard {
    fn deref_mut(&mut self) -> &mut [f32] {
        self.buf.as_deref_mut().expect("buffer present until drop")
    }
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.recycle(buf, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(capacity: usize) -> Arc<ScratchPool> {
        Arc::new(ScratchPool::new(&ScratchConfig {
            bucket_capacity: capacity,
            zero_on_return: false,
        }))
    }

    #[test]
    fn test_rent_is_at_least_requested() {
        let pool = pool(4);
        for len in [1, 255, 256, 257, 1000, 4096] {
            let buf = pool.rent(len);
            assert!(buf.len() >= len, "rented {} for request {len}", buf.len());
            assert!(buf.len().is_power_of_two());
        }
    }

    #[test]
    fn test_recycled_buffer_is_reused() {
        let pool = pool(4);
        let buf = pool.rent(1000);
        let ptr = buf.as_ptr();
        pool.recycle(buf, false);
        assert_eq!(pool.idle_in_bucket(1000), 1);

        let again = pool.rent(1000);
        assert_eq!(again.as_ptr(), ptr);
        assert_eq!(pool.idle_in_bucket(1000), 0);
    }

    #[test]
    fn test_bucket_capacity_cap() {
        let pool = pool(2);
        let bufs: Vec<_> = (0..4).map(|_| pool.rent(512)).collect();
        for buf in bufs {
            pool.recycle(buf, false);
        }
        // Two retained, two dropped.
        assert_eq!(pool.idle_in_bucket(512), 2);
    }

    #[test]
    fn test_zero_on_recycle() {
        let pool = pool(4);
        let mut buf = pool.rent(256);
        buf.fill(7.0);
        pool.recycle(buf, true);

        let again = pool.rent(256);
        assert!(again.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_guard_returns_on_drop() {
        let pool = pool(8);
        {
            let mut a = pool.rent_scoped(300);
            let mut b = pool.rent_scoped(300);
            a[0] = 1.0;
            b[0] = 2.0;
            assert_eq!(pool.idle_in_bucket(300), 0);
        }
        assert_eq!(pool.idle_in_bucket(300), 2);
    }

    #[test]
    fn test_guard_returns_on_early_exit() {
        let pool = pool(8);

        fn failing(pool: &Arc<ScratchPool>) -> emberlm_common::Result<()> {
            let _a = pool.rent_scoped(600);
            Err(emberlm_common::EmberError::invalid_input("boom"))
        }

        assert!(failing(&pool).is_err());
        assert_eq!(pool.idle_in_bucket(600), 1);
    }

    #[test]
    fn test_guards_borrow_independently() {
        let pool = pool(8);
        let mut a = pool.rent_scoped(256);
        let mut b = pool.rent_scoped(256);
        a[0] = 1.0;
        b[0] = 2.0;
        assert_eq!(a[0], 1.0);
        assert_eq!(b[0], 2.0);
    }
}
