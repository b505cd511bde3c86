//! Ledger backends.
//!
//! The registry only needs two linearizable operations from a ledger:
//! read a key and write a key. Any backend that provides them can sit
//! under a [`Registry`](crate::registry::Registry):
//! - [`MemoryLedger`] for tests and ephemeral deployments
//! - [`FileLedger`] for an embedded append-only log on disk

mod file;
mod memory;

pub use file::FileLedger;
pub use memory::MemoryLedger;

use crate::error::LedgerError;
use std::sync::Arc;

/// Key-value capability the registry writes through.
///
/// Both calls are assumed atomic with respect to each other. Retries, if
/// any, belong to the implementation.
pub trait LedgerStore: Send + Sync {
    /// Read the value stored under `key`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, LedgerError>;

    /// Store `value` under `key`.
    fn put(&self, key: &str, value: &[u8]) -> Result<(), LedgerError>;
}

impl<T: LedgerStore + ?Sized> LedgerStore for Arc<T> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, LedgerError> {
        (**self).get(key)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), LedgerError> {
        (**self).put(key, value)
    }
}
