//! Write-policy selection and dispatch.

use std::sync::Arc;

use crate::error::Result;
use crate::io::WriteBackEngine;
use crate::store::BackingStore;
use crate::types::{PoolAddr, WorkerId};

/// How a payload reaches the backing store. Selected once at initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    /// Synchronous in-process copy through the mapping; nothing is ever
    /// explicitly persisted. For configurations without a device tier.
    Immediate,
    /// Blocking positioned write through the file descriptor.
    Sync,
    /// Queued asynchronous write through the write-back engine.
    Async,
    /// Blocking positioned writes plus an explicit flush to the device when
    /// the barrier runs at the end of a write-back phase.
    Durable,
}

/// Routes payloads to the backing store according to the selected policy.
pub struct PoolWriter {
    store: Arc<BackingStore>,
    engine: Arc<WriteBackEngine>,
    policy: WritePolicy,
}

impl PoolWriter {
    /// Build a writer over the store and engine.
    pub fn new(store: Arc<BackingStore>, engine: Arc<WriteBackEngine>, policy: WritePolicy) -> Self {
        Self {
            store,
            engine,
            policy,
        }
    }

    /// The policy this writer was configured with.
    pub fn policy(&self) -> WritePolicy {
        self.policy
    }

    /// Commit `data` to `dest` under the configured policy.
    ///
    /// For the asynchronous policy the data is copied and queued; for the
    /// others this blocks until the write is visible through the pool.
    pub fn write(&self, worker: WorkerId, dest: PoolAddr, data: &[u8]) -> Result<()> {
        match self.policy {
            WritePolicy::Immediate => self.store.copy_in(dest, data),
            WritePolicy::Sync | WritePolicy::Durable => self.store.write_at(dest, data),
            WritePolicy::Async => self.engine.submit(worker, dest, data),
        }
    }

    /// Block until every write issued under this policy is durable/visible,
    /// for `worker` or globally when `None`.
    pub fn barrier(&self, worker: Option<WorkerId>) -> Result<()> {
        match self.policy {
            // Immediate and Sync writes are visible when `write` returns.
            WritePolicy::Immediate | WritePolicy::Sync => Ok(()),
            WritePolicy::Async => match worker {
                Some(worker) => self.engine.wait_worker(worker),
                None => self.engine.wait_all(),
            },
            WritePolicy::Durable => self.store.sync_to_device(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MIN_POOL_BYTES;
    use tempfile::tempdir;

    fn writer(policy: WritePolicy) -> (PoolWriter, Arc<BackingStore>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(BackingStore::create(4096, MIN_POOL_BYTES, dir.path()).unwrap());
        let engine = Arc::new(WriteBackEngine::new(store.file_handle(), 2, 4, 1).unwrap());
        (PoolWriter::new(Arc::clone(&store), engine, policy), store, dir)
    }

    #[test]
    fn immediate_policy_copies_through_the_mapping() {
        let (writer, store, _dir) = writer(WritePolicy::Immediate);
        let dest = store.aligned_start();
        writer.write(WorkerId::new(0), dest, b"immediate").unwrap();
        writer.barrier(None).unwrap();
        assert_eq!(store.read(dest, 9).unwrap(), b"immediate");
    }

    #[test]
    fn sync_policy_writes_through_the_descriptor() {
        let (writer, store, _dir) = writer(WritePolicy::Sync);
        let dest = store.aligned_start().add(64);
        writer.write(WorkerId::new(1), dest, b"positioned").unwrap();
        assert_eq!(store.read(dest, 10).unwrap(), b"positioned");
    }

    #[test]
    fn async_policy_is_visible_after_barrier() {
        let (writer, store, _dir) = writer(WritePolicy::Async);
        let dest = store.aligned_start().add(4096);
        writer.write(WorkerId::new(0), dest, b"queued").unwrap();
        writer.barrier(Some(WorkerId::new(0))).unwrap();
        assert_eq!(store.read(dest, 6).unwrap(), b"queued");
    }

    #[test]
    fn durable_policy_survives_a_device_flush() {
        let (writer, store, _dir) = writer(WritePolicy::Durable);
        let dest = store.aligned_start().add(128);
        writer.write(WorkerId::new(0), dest, b"durable").unwrap();
        writer.barrier(None).unwrap();
        assert_eq!(store.read(dest, 7).unwrap(), b"durable");
    }
}
