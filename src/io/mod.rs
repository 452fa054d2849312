//! Write-back I/O: the asynchronous engine and the write-policy dispatch.
//!
//! Payloads reach the backing store through a [`PoolWriter`] configured with
//! one of four policies; the asynchronous policy routes through the
//! [`WriteBackEngine`], which bounds in-flight writes with per-worker slot
//! pools.

mod engine;
mod policy;

pub use engine::WriteBackEngine;
pub use policy::{PoolWriter, WritePolicy};
