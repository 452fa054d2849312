//! Error types for the tier heap.
//!
//! Every condition the allocator treats as unrecoverable-by-design (space
//! exhaustion, mapping failure, a cancelled write) is surfaced as a typed
//! error value; the caller owns the abort-vs-retry decision. Nothing in this
//! crate terminates the process.

use std::path::PathBuf;
use thiserror::Error;

use crate::types::PoolAddr;

/// The main error type for tier heap operations.
#[derive(Error, Debug)]
pub enum TierError {
    /// Failed to create or size the backing file.
    #[error("E001: failed to create backing store in {directory}: {cause}")]
    StoreCreate {
        /// Directory the backing file was created in.
        directory: PathBuf,
        /// Reason for the failure.
        cause: String,
    },

    /// Failed to memory-map the backing file.
    #[error("E002: failed to map {size} bytes of backing store: {cause}")]
    MapFailed {
        /// Requested mapping size in bytes.
        size: u64,
        /// Reason for the mapping failure.
        cause: String,
    },

    /// Requested pool size is below the sanity floor.
    ///
    /// The pool must be pre-sized correctly; there is no grow path.
    #[error("E003: pool size {requested} bytes is below the minimum of {minimum} bytes")]
    PoolTooSmall {
        /// Requested size in bytes.
        requested: u64,
        /// Minimum accepted size in bytes.
        minimum: u64,
    },

    /// No run of contiguous free regions large enough for the request.
    ///
    /// The collector must sweep before the pool is exhausted; allocation
    /// performs no compaction of its own.
    #[error("E004: allocator full: no {regions_needed} contiguous free regions for {requested} bytes")]
    OutOfSpace {
        /// Request size in bytes.
        requested: u64,
        /// Contiguous regions the request needed.
        regions_needed: usize,
    },

    /// Partition id outside the configured key space.
    #[error("E005: partition {partition} out of range (max {max_partitions})")]
    PartitionOutOfRange {
        /// Offending partition id.
        partition: u64,
        /// Configured partition count per group.
        max_partitions: u64,
    },

    /// Address or range outside the usable pool.
    #[error("E006: address {addr} + {len} bytes is outside the pool")]
    InvalidAddress {
        /// Start of the offending range.
        addr: PoolAddr,
        /// Length of the offending range in bytes.
        len: u64,
    },

    /// A positioned write against the backing file failed.
    #[error("E007: write of {len} bytes at {addr} failed: {cause}")]
    WriteFailed {
        /// Destination address.
        addr: PoolAddr,
        /// Payload length in bytes.
        len: u64,
        /// Reason for the failure.
        cause: String,
    },

    /// An in-flight asynchronous write was cancelled or its engine is gone.
    ///
    /// Cancellation never legitimately occurs for this workload; callers are
    /// expected to treat this as fatal.
    #[error("E008: asynchronous write-back cancelled: {cause}")]
    IoCancelled {
        /// Reason for the cancellation.
        cause: String,
    },

    /// Synchronizing the backing device failed.
    #[error("E009: device sync failed: {cause}")]
    SyncFailed {
        /// Reason for the failure.
        cause: String,
    },

    /// Configuration rejected at validation.
    #[error("E010: invalid configuration: {cause}")]
    InvalidConfig {
        /// What was wrong.
        cause: String,
    },

    /// Failed to start the write-back engine's I/O threads.
    #[error("E011: failed to start write-back engine: {cause}")]
    EngineStart {
        /// Reason for the failure.
        cause: String,
    },

    /// The kernel rejected a paging-advice hint.
    #[error("E012: paging advice rejected: {cause}")]
    AdviseFailed {
        /// Reason for the rejection.
        cause: String,
    },
}

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TierError>;
