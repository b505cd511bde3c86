//! Write-once registry over a ledger.
//!
//! The registry owns the only write path into the ledger. Each registration
//! is an "insert if absent": the existence check and the write run under a
//! lock striped by id, so two registrations of the same id can never both
//! observe the key as absent.

use crate::error::{RegistryError, Result};
use crate::journal::{JournalEntry, TransactionJournal};
use crate::ledger::LedgerStore;
use crate::types::{Clock, FileRef, Record, Student, Transaction};
use parking_lot::Mutex;
use tracing::{info, warn};

/// Default number of write-lock stripes.
pub const DEFAULT_LOCK_STRIPES: usize = 64;

/// Longest accepted id, in bytes. Ledger keys carry a 16-bit length.
pub const MAX_ID_LEN: usize = u16::MAX as usize;

/// Registry of write-once records.
pub struct Registry<L: LedgerStore> {
    ledger: L,

    /// Striped locks guarding check-then-write per id.
    write_locks: Box<[Mutex<()>]>,

    clock: Clock,

    /// Optional durable transaction log.
    journal: Option<TransactionJournal>,
}

impl<L: LedgerStore> Registry<L> {
    /// Create a registry with the default number of lock stripes.
    pub fn new(ledger: L) -> Self {
        Self::with_lock_stripes(ledger, DEFAULT_LOCK_STRIPES)
    }

    /// Create a registry with a custom number of lock stripes (at least one).
    pub fn with_lock_stripes(ledger: L, stripes: usize) -> Self {
        let write_locks = (0..stripes.max(1)).map(|_| Mutex::new(())).collect();
        Self {
            ledger,
            write_locks,
            clock: Clock::new(),
            journal: None,
        }
    }

    /// Attach a transaction journal.
    pub fn with_journal(mut self, journal: TransactionJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// The underlying ledger.
    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Register a record under `id`.
    ///
    /// Returns the transaction describing the committed write. Handing it to
    /// the event bus is the caller's job. Ids must be non-empty and at most
    /// [`MAX_ID_LEN`] bytes.
    pub fn register<R: Record>(&self, id: &str, record: R) -> Result<Transaction> {
        if id.is_empty() {
            return Err(RegistryError::InvalidArgument("id must not be empty".into()));
        }
        if id.len() > MAX_ID_LEN {
            return Err(RegistryError::InvalidArgument(format!(
                "id is {} bytes, limit is {MAX_ID_LEN}",
                id.len()
            )));
        }
        if let Some(field) = record.missing_field() {
            return Err(RegistryError::InvalidArgument(format!(
                "{field} must not be empty"
            )));
        }

        let payload = serde_json::to_vec(&record)?;

        let transaction = {
            let _lock = self.lock_for(id).lock();

            if self.ledger.get(id)?.is_some() {
                return Err(RegistryError::AlreadyExists(id.to_string()));
            }

            self.ledger.put(id, &payload)?;

            Transaction::new(R::ACTION, id, self.clock.now())
        };

        self.log_transaction(&transaction);

        Ok(transaction)
    }

    /// Register a student.
    pub fn register_student(&self, id: &str, name: &str, school: &str) -> Result<Transaction> {
        self.register(id, Student::new(name, school))
    }

    /// Register a file by filename and content hash.
    pub fn register_file(&self, id: &str, filename: &str, hash: &str) -> Result<Transaction> {
        self.register(id, FileRef::new(filename, hash))
    }

    /// Read back the record stored under `id`.
    pub fn query<R: Record>(&self, id: &str) -> Result<R> {
        let bytes = self
            .ledger
            .get(id)?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        serde_json::from_slice(&bytes).map_err(|e| RegistryError::Corrupt {
            id: id.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn query_student(&self, id: &str) -> Result<Student> {
        self.query(id)
    }

    pub fn query_file(&self, id: &str) -> Result<FileRef> {
        self.query(id)
    }

    /// Whether any record is stored under `id`.
    pub fn contains(&self, id: &str) -> Result<bool> {
        Ok(self.ledger.get(id)?.is_some())
    }

    /// Journal history, if a journal is attached.
    pub fn transactions(&self) -> Result<Vec<JournalEntry>> {
        match &self.journal {
            Some(journal) => Ok(journal.entries()?),
            None => Ok(Vec::new()),
        }
    }

    fn lock_for(&self, id: &str) -> &Mutex<()> {
        let stripe = crc32fast::hash(id.as_bytes()) as usize % self.write_locks.len();
        &self.write_locks[stripe]
    }

    fn log_transaction(&self, transaction: &Transaction) {
        info!(
            tx_id = %transaction.id,
            action = %transaction.action,
            subject_id = %transaction.subject_id,
            timestamp = %transaction.timestamp,
            "transaction logged"
        );

        if let Some(journal) = &self.journal {
            // The ledger write is already committed; a journal failure
            // must not turn it into an error the caller would retry.
            if let Err(e) = journal.append(transaction) {
                warn!(tx_id = %transaction.id, error = %e, "failed to journal transaction");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LedgerError;
    use crate::ledger::MemoryLedger;
    use crate::types::{Action, STATUS_REGISTERED};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    /// Ledger whose reads are slow, to widen the check-then-write window.
    struct SlowLedger {
        inner: MemoryLedger,
        puts: AtomicUsize,
    }

    impl LedgerStore for SlowLedger {
        fn get(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, LedgerError> {
            let value = self.inner.get(key)?;
            thread::sleep(std::time::Duration::from_millis(2));
            Ok(value)
        }

        fn put(&self, key: &str, value: &[u8]) -> std::result::Result<(), LedgerError> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            self.inner.put(key, value)
        }
    }

    struct BrokenLedger;

    impl LedgerStore for BrokenLedger {
        fn get(&self, _key: &str) -> std::result::Result<Option<Vec<u8>>, LedgerError> {
            Ok(None)
        }

        fn put(&self, _key: &str, _value: &[u8]) -> std::result::Result<(), LedgerError> {
            Err(LedgerError::Unavailable("peer unreachable".into()))
        }
    }

    #[test]
    fn test_register_returns_transaction() {
        let registry = Registry::new(MemoryLedger::new());

        let tx = registry.register_student("s1", "Alice", "MIT").unwrap();
        assert_eq!(tx.id, "tx_s1");
        assert_eq!(tx.action, Action::Register);
        assert_eq!(tx.subject_id, "s1");
    }

    #[test]
    fn test_query_round_trip() {
        let registry = Registry::new(MemoryLedger::new());
        registry.register_student("s1", "Alice", "MIT").unwrap();

        let student = registry.query_student("s1").unwrap();
        assert_eq!(student.name, "Alice");
        assert_eq!(student.school, "MIT");
        assert_eq!(student.status, STATUS_REGISTERED);
    }

    #[test]
    fn test_stored_bytes_match_student_json() {
        let registry = Registry::new(MemoryLedger::new());
        registry.register_student("s1", "Alice", "MIT").unwrap();

        let bytes = registry.ledger().get("s1").unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"name": "Alice", "school": "MIT", "status": "Registered"})
        );
    }

    #[test]
    fn test_register_file() {
        let registry = Registry::new(MemoryLedger::new());

        let tx = registry.register_file("f1", "thesis.pdf", "QmHash").unwrap();
        assert_eq!(tx.action, Action::RegisterFile);

        let file = registry.query_file("f1").unwrap();
        assert_eq!(file.filename, "thesis.pdf");
        assert_eq!(file.hash, "QmHash");
    }

    #[test]
    fn test_duplicate_rejected() {
        let registry = Registry::new(MemoryLedger::new());
        registry.register_student("s1", "Alice", "MIT").unwrap();

        let result = registry.register_student("s1", "Bob", "Stanford");
        assert!(matches!(result, Err(RegistryError::AlreadyExists(ref id)) if id == "s1"));

        // First write wins
        assert_eq!(registry.query_student("s1").unwrap().name, "Alice");
    }

    #[test]
    fn test_empty_arguments_rejected() {
        let registry = Registry::new(MemoryLedger::new());

        for (id, name, school) in [("", "Alice", "MIT"), ("s1", "", "MIT"), ("s1", "Alice", "")] {
            let result = registry.register_student(id, name, school);
            assert!(matches!(result, Err(RegistryError::InvalidArgument(_))));
        }
        assert!(registry.ledger().is_empty());
    }

    #[test]
    fn test_overlong_id_rejected() {
        let registry = Registry::new(MemoryLedger::new());

        let id = "s".repeat(MAX_ID_LEN + 1);
        let result = registry.register_student(&id, "Alice", "MIT");
        assert!(matches!(result, Err(RegistryError::InvalidArgument(_))));
        assert!(registry.ledger().is_empty());

        let id = "s".repeat(MAX_ID_LEN);
        registry.register_student(&id, "Alice", "MIT").unwrap();
    }

    #[test]
    fn test_query_missing() {
        let registry = Registry::new(MemoryLedger::new());
        let result = registry.query_student("ghost");
        assert!(matches!(result, Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn test_query_corrupt() {
        let registry = Registry::new(MemoryLedger::new());
        registry.ledger().put("s1", b"not json").unwrap();

        let result = registry.query_student("s1");
        assert!(matches!(result, Err(RegistryError::Corrupt { .. })));
    }

    #[test]
    fn test_put_failure_is_storage_error() {
        let registry = Registry::new(BrokenLedger);
        let result = registry.register_student("s1", "Alice", "MIT");
        assert!(matches!(result, Err(RegistryError::Storage(_))));
    }

    #[test]
    fn test_concurrent_same_id_commits_once() {
        let registry = Arc::new(Registry::new(SlowLedger {
            inner: MemoryLedger::new(),
            puts: AtomicUsize::new(0),
        }));
        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    registry.register_student("s1", &format!("Student {}", i), "MIT")
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let committed = results.iter().filter(|r| r.is_ok()).count();
        let rejected = results
            .iter()
            .filter(|r| matches!(r, Err(RegistryError::AlreadyExists(_))))
            .count();

        assert_eq!(committed, 1);
        assert_eq!(rejected, threads - 1);
        assert_eq!(registry.ledger().puts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_single_stripe_still_correct() {
        let registry = Registry::with_lock_stripes(MemoryLedger::new(), 0);
        registry.register_student("a", "A", "X").unwrap();
        registry.register_student("b", "B", "X").unwrap();
        assert!(registry.contains("a").unwrap());
        assert!(!registry.contains("c").unwrap());
    }

    #[test]
    fn test_timestamps_non_decreasing() {
        let registry = Registry::new(MemoryLedger::new());
        let mut prev = None;
        for i in 0..50 {
            let tx = registry
                .register_student(&format!("s{}", i), "Name", "School")
                .unwrap();
            if let Some(prev) = prev {
                assert!(tx.timestamp >= prev);
            }
            prev = Some(tx.timestamp);
        }
    }

    #[test]
    fn test_journal_records_commits_only() {
        let dir = tempfile::TempDir::new().unwrap();
        let journal = TransactionJournal::open(dir.path().join("tx.journal")).unwrap();
        let registry = Registry::new(MemoryLedger::new()).with_journal(journal);

        registry.register_student("s1", "Alice", "MIT").unwrap();
        let _ = registry.register_student("s1", "Alice", "MIT");
        registry.register_file("f1", "a.pdf", "Qm").unwrap();

        let history = registry.transactions().unwrap();
        let ids: Vec<_> = history.iter().map(|e| e.transaction.id.as_str()).collect();
        assert_eq!(ids, vec!["tx_s1", "tx_f1"]);
    }
}
