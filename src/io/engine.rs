//! Bounded-concurrency asynchronous write-back.
//!
//! Each worker owns a disjoint, fixed-size pool of write-request slots.
//! Submitting copies the payload into an owned buffer (the caller's buffer is
//! reusable the moment `submit` returns) and hands the write to a small pool
//! of I/O threads performing positioned writes against the backing file. The
//! submitter spins while its slot pool is saturated; completion is observed
//! by polling. No ordering holds between distinct in-flight writes.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{Result, TierError};
use crate::types::{PoolAddr, WorkerId};

/// Slot is unoccupied.
const FREE: u8 = 0;
/// Slot's write has been dispatched and has not completed.
const IN_FLIGHT: u8 = 1;
/// Slot's write completed; the slot is reusable once a poll observes it.
const DONE: u8 = 2;
/// Slot's write failed. Surfaced as an error on the next poll or claim.
const FAILED: u8 = 3;

/// Completion state shared between a slot and its in-flight job.
struct Completion {
    state: AtomicU8,
    /// `(offset, len, cause)` of a failed write, recorded by the I/O thread.
    error: Mutex<Option<(u64, u64, String)>>,
}

impl Completion {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(FREE),
            error: Mutex::new(None),
        })
    }

    fn failure(&self) -> TierError {
        match self.error.lock().take() {
            Some((offset, len, cause)) => TierError::WriteFailed {
                addr: PoolAddr::new(offset),
                len,
                cause,
            },
            None => TierError::IoCancelled {
                cause: "write failed with no recorded cause".into(),
            },
        }
    }
}

/// One dispatched write.
struct WriteJob {
    file: Arc<File>,
    offset: u64,
    buffer: Vec<u8>,
    completion: Arc<Completion>,
}

/// A worker's private slot partition.
struct SlotPool {
    slots: Vec<Arc<Completion>>,
    /// Scan cursor; the next claim resumes here.
    cursor: usize,
}

/// The asynchronous write-back engine.
pub struct WriteBackEngine {
    file: Arc<File>,
    workers: Vec<Mutex<SlotPool>>,
    sender: Option<Sender<WriteJob>>,
    io_threads: Vec<JoinHandle<()>>,
}

impl WriteBackEngine {
    /// Build the engine over the backing file.
    ///
    /// `total_slots` is divided evenly across `workers`; each partition gets
    /// at least one slot.
    pub fn new(
        file: Arc<File>,
        workers: usize,
        total_slots: usize,
        io_threads: usize,
    ) -> Result<Self> {
        debug_assert!(workers > 0 && io_threads > 0);
        let per_worker = (total_slots / workers).max(1);

        let worker_pools = (0..workers)
            .map(|_| {
                Mutex::new(SlotPool {
                    slots: (0..per_worker).map(|_| Completion::new()).collect(),
                    cursor: 0,
                })
            })
            .collect();

        let (sender, receiver) = crossbeam_channel::unbounded::<WriteJob>();
        let mut threads = Vec::with_capacity(io_threads);
        for i in 0..io_threads {
            let receiver: Receiver<WriteJob> = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("tierheap-io-{i}"))
                .spawn(move || {
                    for job in receiver {
                        run_job(job);
                    }
                })
                .map_err(|e| TierError::EngineStart {
                    cause: e.to_string(),
                })?;
            threads.push(handle);
        }

        Ok(Self {
            file,
            workers: worker_pools,
            sender: Some(sender),
            io_threads: threads,
        })
    }

    /// Number of worker partitions.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Queue an asynchronous write of `data` to the file offset of `addr`,
    /// charged to `worker`'s slot pool.
    ///
    /// Spins until the partition has a free (or newly-completed) slot. The
    /// payload is copied before this returns.
    pub fn submit(&self, worker: WorkerId, addr: PoolAddr, data: &[u8]) -> Result<()> {
        let mut pool = self.workers[worker.as_usize()].lock();

        let slot = loop {
            if let Some(slot) = Self::claim_slot(&mut pool)? {
                break slot;
            }
            std::hint::spin_loop();
        };

        let completion = Arc::clone(&pool.slots[slot]);
        completion.state.store(IN_FLIGHT, Ordering::Release);

        let job = WriteJob {
            file: Arc::clone(&self.file),
            offset: addr.as_u64(),
            buffer: data.to_vec(),
            completion: Arc::clone(&completion),
        };

        let sender = self.sender.as_ref().ok_or_else(|| TierError::IoCancelled {
            cause: "write-back engine is shut down".into(),
        })?;
        sender.send(job).map_err(|_| {
            completion.state.store(FREE, Ordering::Release);
            TierError::IoCancelled {
                cause: "write-back threads are gone".into(),
            }
        })
    }

    /// Find a usable slot, reaping completed writes along the way.
    ///
    /// Scans from the pool's cursor to the end; on a full scan with nothing
    /// claimable the cursor resets and `None` asks the caller to spin.
    fn claim_slot(pool: &mut SlotPool) -> Result<Option<usize>> {
        for i in pool.cursor..pool.slots.len() {
            match pool.slots[i].state.load(Ordering::Acquire) {
                FREE => {
                    pool.cursor = i;
                    return Ok(Some(i));
                }
                DONE => {
                    pool.slots[i].state.store(FREE, Ordering::Relaxed);
                    pool.cursor = i;
                    return Ok(Some(i));
                }
                FAILED => return Err(pool.slots[i].failure()),
                _ => {}
            }
        }
        pool.cursor = 0;
        Ok(None)
    }

    /// Check a single worker's slots, reaping completions.
    ///
    /// Returns `true` when every slot is free. A failed write surfaces as an
    /// error; cancellation never legitimately occurs for this workload, so
    /// callers treat it as fatal.
    pub fn poll_worker(&self, worker: WorkerId) -> Result<bool> {
        let pool = self.workers[worker.as_usize()].lock();
        let mut all_free = true;
        for slot in &pool.slots {
            match slot.state.load(Ordering::Acquire) {
                IN_FLIGHT => all_free = false,
                DONE => slot.state.store(FREE, Ordering::Relaxed),
                FAILED => return Err(slot.failure()),
                _ => {}
            }
        }
        Ok(all_free)
    }

    /// Check every worker's slots. Returns `true` when all are free.
    pub fn poll_all(&self) -> Result<bool> {
        let mut all_free = true;
        for worker in 0..self.workers.len() {
            if !self.poll_worker(WorkerId::new(worker as u32))? {
                all_free = false;
            }
        }
        Ok(all_free)
    }

    /// Spin until a worker's slots have all completed.
    pub fn wait_worker(&self, worker: WorkerId) -> Result<()> {
        while !self.poll_worker(worker)? {
            std::hint::spin_loop();
        }
        Ok(())
    }

    /// Spin until every in-flight write has completed.
    pub fn wait_all(&self) -> Result<()> {
        while !self.poll_all()? {
            std::hint::spin_loop();
        }
        Ok(())
    }
}

impl Drop for WriteBackEngine {
    fn drop(&mut self) {
        // Closing the channel drains the queue and stops the threads.
        self.sender.take();
        for handle in self.io_threads.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("write-back thread panicked during shutdown");
            }
        }
    }
}

/// Execute one write and publish its completion.
fn run_job(job: WriteJob) {
    match job.file.write_all_at(&job.buffer, job.offset) {
        Ok(()) => job.completion.state.store(DONE, Ordering::Release),
        Err(e) => {
            tracing::warn!(offset = job.offset, len = job.buffer.len(), error = %e, "write-back failed");
            *job.completion.error.lock() =
                Some((job.offset, job.buffer.len() as u64, e.to_string()));
            job.completion.state.store(FAILED, Ordering::Release);
        }
    }
    // The owned payload buffer drops here, as soon as the write completes.
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_file(len: u64) -> Arc<File> {
        let file = tempfile::tempfile().unwrap();
        file.set_len(len).unwrap();
        Arc::new(file)
    }

    #[test]
    fn submitted_writes_land_at_their_offsets() {
        let file = scratch_file(1024 * 1024);
        let engine = WriteBackEngine::new(Arc::clone(&file), 2, 8, 2).unwrap();

        engine.submit(WorkerId::new(0), PoolAddr::new(0), b"alpha").unwrap();
        engine.submit(WorkerId::new(1), PoolAddr::new(4096), b"beta").unwrap();
        engine.wait_all().unwrap();

        let mut buf = vec![0u8; 5];
        file.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"alpha");
        let mut buf = vec![0u8; 4];
        file.read_exact_at(&mut buf, 4096).unwrap();
        assert_eq!(&buf, b"beta");
    }

    #[test]
    fn caller_buffer_is_reusable_immediately() {
        let file = scratch_file(1024 * 1024);
        let engine = WriteBackEngine::new(Arc::clone(&file), 1, 4, 1).unwrap();

        let mut payload = vec![b'x'; 256];
        engine.submit(WorkerId::new(0), PoolAddr::new(0), &payload).unwrap();
        // Clobber the caller's buffer while the write may still be in flight.
        payload.fill(b'y');
        engine.wait_all().unwrap();

        let mut buf = vec![0u8; 256];
        file.read_exact_at(&mut buf, 0).unwrap();
        assert!(buf.iter().all(|&b| b == b'x'));
    }

    #[test]
    fn saturated_pool_spins_and_completes_everything() {
        let file = scratch_file(1024 * 1024);
        // One worker, one slot: every second submit must wait for the first.
        let engine = WriteBackEngine::new(Arc::clone(&file), 1, 1, 1).unwrap();

        for i in 0..32u64 {
            let payload = [i as u8; 64];
            engine
                .submit(WorkerId::new(0), PoolAddr::new(i * 64), &payload)
                .unwrap();
        }
        engine.wait_worker(WorkerId::new(0)).unwrap();

        for i in 0..32u64 {
            let mut buf = [0u8; 64];
            file.read_exact_at(&mut buf, i * 64).unwrap();
            assert!(buf.iter().all(|&b| b == i as u8), "write {i} intact");
        }
    }

    #[test]
    fn poll_reports_completion_per_worker() {
        let file = scratch_file(1024 * 1024);
        let engine = WriteBackEngine::new(Arc::clone(&file), 2, 8, 2).unwrap();

        engine.submit(WorkerId::new(0), PoolAddr::new(0), &[7u8; 128]).unwrap();
        engine.wait_worker(WorkerId::new(0)).unwrap();
        // Worker 1 never submitted; its pool is trivially complete.
        assert!(engine.poll_worker(WorkerId::new(1)).unwrap());
        assert!(engine.poll_all().unwrap());
    }

    #[test]
    fn failed_write_surfaces_on_poll() {
        // A zero-length read-only file: positioned writes fail.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("readonly");
        std::fs::write(&path, b"").unwrap();
        let file = Arc::new(File::open(&path).unwrap());

        let engine = WriteBackEngine::new(file, 1, 2, 1).unwrap();
        engine.submit(WorkerId::new(0), PoolAddr::new(0), b"nope").unwrap();

        let err = loop {
            match engine.poll_worker(WorkerId::new(0)) {
                Ok(true) => panic!("write against a read-only file succeeded"),
                Ok(false) => std::hint::spin_loop(),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, TierError::WriteFailed { .. }));
    }
}
