//! Main Registrar struct tying the registry and event bus together.

use crate::bus::{BusConfig, BusStats, EventBus, SubscriptionHandle};
use crate::error::Result;
use crate::journal::{JournalEntry, TransactionJournal};
use crate::ledger::{FileLedger, LedgerStore, MemoryLedger};
use crate::registry::{Registry, DEFAULT_LOCK_STRIPES};
use crate::session::{Connection, Session};
use crate::types::{FileRef, Record, Student, Transaction};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Registrar configuration.
#[derive(Clone, Debug)]
pub struct RegistrarConfig {
    /// Directory for the on-disk ledger (used by [`Registrar::open`]).
    pub path: PathBuf,

    /// Keep a durable transaction journal next to the ledger.
    pub journal: bool,

    /// Sync the ledger every N writes.
    pub sync_interval: u64,

    /// Number of write-lock stripes in the registry.
    pub lock_stripes: usize,

    /// Event bus settings.
    pub bus: BusConfig,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./ledger"),
            journal: true,
            sync_interval: FileLedger::DEFAULT_SYNC_INTERVAL,
            lock_stripes: DEFAULT_LOCK_STRIPES,
            bus: BusConfig::default(),
        }
    }
}

/// Registry plus live fan-out of every committed write.
///
/// Constructed once per process and shared by reference with every request
/// and connection handler.
pub struct Registrar<L: LedgerStore = FileLedger> {
    registry: Registry<L>,
    bus: Arc<EventBus>,
}

impl Registrar<FileLedger> {
    /// Open (or create) an on-disk registrar at `config.path`.
    pub fn open(config: RegistrarConfig) -> Result<Self> {
        let ledger = FileLedger::open_with_sync_interval(&config.path, config.sync_interval)?;
        let mut registry = Registry::with_lock_stripes(ledger, config.lock_stripes);
        if config.journal {
            let journal = TransactionJournal::open(config.path.join("transactions.journal"))?;
            registry = registry.with_journal(journal);
        }

        info!(path = %config.path.display(), "registrar opened");
        Ok(Self::from_registry(registry, config.bus))
    }
}

impl Registrar<MemoryLedger> {
    /// Registrar over an in-memory ledger. `config.path` and
    /// `config.journal` are ignored.
    pub fn in_memory(config: RegistrarConfig) -> Self {
        Self::with_ledger(MemoryLedger::new(), config)
    }
}

impl<L: LedgerStore> Registrar<L> {
    /// Registrar over any ledger backend. No journal is attached.
    pub fn with_ledger(ledger: L, config: RegistrarConfig) -> Self {
        let registry = Registry::with_lock_stripes(ledger, config.lock_stripes);
        Self::from_registry(registry, config.bus)
    }

    fn from_registry(registry: Registry<L>, bus: BusConfig) -> Self {
        Self {
            registry,
            bus: Arc::new(EventBus::with_config(bus)),
        }
    }

    // --- Write Operations ---

    /// Commit `record` under `id`, then publish the transaction.
    ///
    /// The two steps are deliberately separate: once this returns an error,
    /// nothing was broadcast.
    pub fn register<R: Record>(&self, id: &str, record: R) -> Result<Transaction> {
        let transaction = self.registry.register(id, record)?;
        self.bus.publish(transaction.clone());
        Ok(transaction)
    }

    pub fn register_student(&self, id: &str, name: &str, school: &str) -> Result<Transaction> {
        self.register(id, Student::new(name, school))
    }

    pub fn register_file(&self, id: &str, filename: &str, hash: &str) -> Result<Transaction> {
        self.register(id, FileRef::new(filename, hash))
    }

    /// Register a file by content, hashing it with SHA-256.
    pub fn register_file_content(
        &self,
        id: &str,
        filename: &str,
        content: &[u8],
    ) -> Result<Transaction> {
        self.register(id, FileRef::from_content(filename, content))
    }

    // --- Read Operations ---

    pub fn query<R: Record>(&self, id: &str) -> Result<R> {
        self.registry.query(id)
    }

    pub fn query_student(&self, id: &str) -> Result<Student> {
        self.registry.query_student(id)
    }

    pub fn query_file(&self, id: &str) -> Result<FileRef> {
        self.registry.query_file(id)
    }

    /// Journal history (empty when no journal is attached).
    pub fn transactions(&self) -> Result<Vec<JournalEntry>> {
        self.registry.transactions()
    }

    // --- Subscriptions ---

    /// Subscribe an in-process observer.
    pub fn subscribe(&self) -> SubscriptionHandle {
        self.bus.subscribe_channel()
    }

    /// Attach a remote observer connection.
    pub fn open_session<C: Connection>(&self, connection: C) -> Session {
        Session::open(&self.bus, connection)
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn bus_stats(&self) -> BusStats {
        self.bus.stats()
    }

    pub fn registry(&self) -> &Registry<L> {
        &self.registry
    }

    /// Stop fan-out. Queued events are still delivered first.
    pub fn shutdown(&self) {
        self.bus.shutdown();
    }
}
