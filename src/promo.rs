//! Promotion buffers: write coalescing for small object copies.
//!
//! During write-back the collector copies many small objects to addresses it
//! allocated moments earlier, which are overwhelmingly contiguous within a
//! region. Staging those copies per (region, worker) and writing each staged
//! run as one operation turns thousands of tiny writes into a few large ones.
//! Buffers are worker-partitioned, so distinct workers never contend.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::io::PoolWriter;
use crate::region::PoolLayout;
use crate::types::{PoolAddr, RegionIndex, WorkerId};

/// One staging buffer: contiguous backing memory anchored at the destination
/// address its contents will be written to.
struct PromotionBuffer {
    data: Vec<u8>,
    /// Destination of `data[0]`; `None` iff the buffer is empty.
    anchor: Option<PoolAddr>,
}

impl PromotionBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            anchor: None,
        }
    }

    fn end(&self) -> Option<PoolAddr> {
        self.anchor.map(|a| a.add(self.data.len() as u64))
    }
}

/// Worker-partitioned promotion buffers over the region space.
pub struct PromotionBuffers {
    layout: PoolLayout,
    writer: Arc<PoolWriter>,
    capacity: usize,
    threshold: usize,
    /// Per-worker buffer maps, created lazily per region on first use.
    workers: Vec<Mutex<HashMap<RegionIndex, PromotionBuffer>>>,
}

impl PromotionBuffers {
    /// Build the buffer set.
    ///
    /// `threshold` must be below `capacity` (validated by the pool config).
    pub fn new(
        layout: PoolLayout,
        writer: Arc<PoolWriter>,
        workers: usize,
        capacity: usize,
        threshold: usize,
    ) -> Self {
        debug_assert!(threshold < capacity);
        Self {
            layout,
            writer,
            capacity,
            threshold,
            workers: (0..workers).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    /// Stage `payload` for `dest`, or write it straight through.
    ///
    /// Payloads above the threshold bypass buffering; staging them would
    /// copy a large payload twice. Otherwise the payload lands in the
    /// (region, worker) buffer: appended when exactly contiguous with the
    /// staged run and within capacity, else the staged run is flushed first
    /// and the buffer re-anchors at `dest`.
    pub fn insert(&self, worker: WorkerId, dest: PoolAddr, payload: &[u8]) -> Result<()> {
        if payload.len() > self.threshold {
            return self.writer.write(worker, dest, payload);
        }

        let Some(region) = self.layout.region_of(dest) else {
            debug_assert!(false, "promotion outside the region space");
            return self.writer.write(worker, dest, payload);
        };

        let mut buffers = self.workers[worker.as_usize()].lock();
        let buffer = buffers
            .entry(region)
            .or_insert_with(|| PromotionBuffer::new(self.capacity));

        let contiguous = buffer.end() == Some(dest);
        let fits = buffer.data.len() + payload.len() <= self.capacity;
        if buffer.anchor.is_some() && !(contiguous && fits) {
            Self::flush_buffer(&self.writer, worker, buffer)?;
        }

        if buffer.anchor.is_none() {
            buffer.anchor = Some(dest);
        }
        buffer.data.extend_from_slice(payload);
        Ok(())
    }

    /// Write a staged run to its anchor and reset the buffer. No-op when
    /// empty. The backing memory is kept for reuse within the cycle.
    fn flush_buffer(
        writer: &PoolWriter,
        worker: WorkerId,
        buffer: &mut PromotionBuffer,
    ) -> Result<()> {
        if let Some(anchor) = buffer.anchor.take() {
            writer.write(worker, anchor, &buffer.data)?;
            buffer.data.clear();
        }
        Ok(())
    }

    /// Flush every staged run, for one worker or all of them, and free
    /// the backing memory.
    ///
    /// Must complete before the write-back phase is declared done; the
    /// buffers' memory is released to bound waste between cycles.
    pub fn flush_and_release(&self, worker: Option<WorkerId>) -> Result<()> {
        match worker {
            Some(worker) => self.release_worker(worker),
            None => {
                for worker in 0..self.workers.len() {
                    self.release_worker(WorkerId::new(worker as u32))?;
                }
                Ok(())
            }
        }
    }

    fn release_worker(&self, worker: WorkerId) -> Result<()> {
        let mut buffers = self.workers[worker.as_usize()].lock();
        for (_, mut buffer) in buffers.drain() {
            Self::flush_buffer(&self.writer, worker, &mut buffer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{WriteBackEngine, WritePolicy};
    use crate::store::{BackingStore, MIN_POOL_BYTES};
    use tempfile::tempdir;

    const CAPACITY: usize = 4096;
    const THRESHOLD: usize = 512;

    struct Fixture {
        store: Arc<BackingStore>,
        buffers: PromotionBuffers,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let store = Arc::new(BackingStore::create(4096, MIN_POOL_BYTES, dir.path()).unwrap());
        let engine = Arc::new(WriteBackEngine::new(store.file_handle(), 2, 4, 1).unwrap());
        // Sync policy: every flush is immediately readable.
        let writer = Arc::new(PoolWriter::new(
            Arc::clone(&store),
            engine,
            WritePolicy::Sync,
        ));
        let layout = PoolLayout::new(store.aligned_start(), store.end(), 1024 * 1024);
        let buffers = PromotionBuffers::new(layout, writer, 2, CAPACITY, THRESHOLD);
        Fixture {
            store,
            buffers,
            _dir: dir,
        }
    }

    #[test]
    fn contiguous_inserts_coalesce_into_one_run() {
        let f = fixture();
        let w = WorkerId::new(0);
        let base = f.store.aligned_start();

        f.buffers.insert(w, base, b"hello ").unwrap();
        f.buffers.insert(w, base.add(6), b"world").unwrap();
        // Nothing written yet: still staged.
        assert_eq!(f.store.read(base, 11).unwrap(), vec![0u8; 11]);

        f.buffers.flush_and_release(Some(w)).unwrap();
        assert_eq!(f.store.read(base, 11).unwrap(), b"hello world");
    }

    #[test]
    fn discontinuity_flushes_the_staged_run() {
        let f = fixture();
        let w = WorkerId::new(0);
        let base = f.store.aligned_start();

        f.buffers.insert(w, base, b"first").unwrap();
        // Same region, but not contiguous with the staged run.
        f.buffers.insert(w, base.add(256), b"second").unwrap();

        // The first run was flushed to its anchor by the discontinuity.
        assert_eq!(f.store.read(base, 5).unwrap(), b"first");
        assert_eq!(f.store.read(base.add(256), 6).unwrap(), vec![0u8; 6]);

        f.buffers.flush_and_release(None).unwrap();
        assert_eq!(f.store.read(base.add(256), 6).unwrap(), b"second");
    }

    #[test]
    fn overflow_flushes_before_restaging() {
        let f = fixture();
        let w = WorkerId::new(0);
        let base = f.store.aligned_start();

        let chunk = vec![b'a'; THRESHOLD];
        let mut offset = 0u64;
        // Fill the buffer to capacity, then one more contiguous chunk.
        while (offset as usize) < CAPACITY {
            f.buffers.insert(w, base.add(offset), &chunk).unwrap();
            offset += chunk.len() as u64;
        }
        f.buffers.insert(w, base.add(offset), &chunk).unwrap();

        // The full first run is on storage; the overflow chunk is staged.
        assert_eq!(
            f.store.read(base, CAPACITY).unwrap(),
            vec![b'a'; CAPACITY]
        );
        f.buffers.flush_and_release(None).unwrap();
        assert_eq!(
            f.store.read(base.add(offset), chunk.len()).unwrap(),
            chunk
        );
    }

    #[test]
    fn large_payloads_bypass_the_buffer() {
        let f = fixture();
        let w = WorkerId::new(1);
        let dest = f.store.aligned_start().add(8192);

        let payload = vec![b'z'; THRESHOLD + 1];
        f.buffers.insert(w, dest, &payload).unwrap();
        // Written through immediately, nothing staged.
        assert_eq!(f.store.read(dest, payload.len()).unwrap(), payload);
    }

    #[test]
    fn regions_stage_independently_per_worker() {
        let f = fixture();
        let base = f.store.aligned_start();
        let other_region = base.add(1024 * 1024);

        f.buffers.insert(WorkerId::new(0), base, b"r0w0").unwrap();
        f.buffers
            .insert(WorkerId::new(1), other_region, b"r1w1")
            .unwrap();

        // Flushing worker 0 leaves worker 1's staging untouched.
        f.buffers.flush_and_release(Some(WorkerId::new(0))).unwrap();
        assert_eq!(f.store.read(base, 4).unwrap(), b"r0w0");
        assert_eq!(f.store.read(other_region, 4).unwrap(), vec![0u8; 4]);

        f.buffers.flush_and_release(None).unwrap();
        assert_eq!(f.store.read(other_region, 4).unwrap(), b"r1w1");
    }
}
