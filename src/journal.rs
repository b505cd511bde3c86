//! Durable transaction journal.
//!
//! Every committed [`Transaction`] can be appended here as an audit trail.
//! Entries are MessagePack-encoded, length-prefixed and CRC32-checked, the
//! same framing the ledger uses. The journal is history only; subscribers
//! are never replayed from it.

use crate::error::LedgerError;
use crate::types::Transaction;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

type Result<T> = std::result::Result<T, LedgerError>;

/// Magic bytes for the journal file.
const JOURNAL_MAGIC: &[u8; 4] = b"TXJ\0";

/// Current journal format version.
const JOURNAL_VERSION: u8 = 1;

/// Size of the journal header (magic + version).
const HEADER_SIZE: u64 = 5;

/// Largest encoded entry the journal accepts.
const MAX_ENTRY_SIZE: usize = 1024 * 1024;

/// A single journal entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Position in the journal, starting at 1.
    pub seq: u64,
    pub transaction: Transaction,
}

struct JournalState {
    next_seq: u64,
    file: File,
    /// Length of the file up to the last complete entry.
    size: u64,
}

/// Append-only transaction journal.
pub struct TransactionJournal {
    path: PathBuf,
    state: Mutex<JournalState>,
}

impl TransactionJournal {
    /// Create or open a journal file.
    ///
    /// A torn entry at the end of the file is cut off. A damaged entry
    /// anywhere else fails the open.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let (next_seq, size) = if path.exists() {
            let file = OpenOptions::new().read(true).write(true).open(&path)?;
            let file_size = file.metadata()?.len();

            let (last_seq, valid_end) = Self::scan(&file, file_size, |_| {})?;
            if valid_end < file_size {
                warn!(path = %path.display(), valid_end, file_size, "truncating torn journal entry");
                file.set_len(valid_end)?;
                file.sync_all()?;
            }
            (last_seq + 1, valid_end)
        } else {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            file.write_all(JOURNAL_MAGIC)?;
            file.write_all(&[JOURNAL_VERSION])?;
            file.sync_all()?;
            (1, HEADER_SIZE)
        };

        let file = OpenOptions::new().append(true).open(&path)?;

        Ok(Self {
            path,
            state: Mutex::new(JournalState {
                next_seq,
                file,
                size,
            }),
        })
    }

    /// Append a transaction, returning its sequence number.
    pub fn append(&self, transaction: &Transaction) -> Result<u64> {
        self.append_with(transaction, |file, frame| file.write_all(frame))
    }

    /// Append through `write`. A failed write is rolled back to the last
    /// complete entry.
    fn append_with(
        &self,
        transaction: &Transaction,
        write: impl FnOnce(&mut File, &[u8]) -> io::Result<()>,
    ) -> Result<u64> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let entry = JournalEntry {
            seq: state.next_seq,
            transaction: transaction.clone(),
        };
        let frame = Self::encode_entry(&entry)?;

        let written = write(&mut state.file, &frame).and_then(|()| state.file.sync_data());
        if let Err(e) = written {
            if let Err(rollback) = state.file.set_len(state.size) {
                warn!(path = %self.path.display(), error = %rollback, "failed to roll back journal");
            }
            return Err(e.into());
        }

        state.size += frame.len() as u64;
        state.next_seq += 1;
        Ok(entry.seq)
    }

    /// Read every entry back in append order.
    pub fn entries(&self) -> Result<Vec<JournalEntry>> {
        // Hold the lock so we never read a half-written entry.
        let state = self.state.lock();

        let file = File::open(&self.path)?;
        let mut entries = Vec::new();
        let (_, valid_end) = Self::scan(&file, state.size, |entry| entries.push(entry))?;
        if valid_end < state.size {
            return Err(LedgerError::Corruption("Journal entry truncated".into()));
        }
        Ok(entries)
    }

    /// Number of entries written so far.
    pub fn len(&self) -> u64 {
        self.state.lock().next_seq - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_header(reader: &mut impl Read) -> Result<()> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != JOURNAL_MAGIC {
            return Err(LedgerError::InvalidFormat("Invalid journal magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != JOURNAL_VERSION {
            return Err(LedgerError::InvalidFormat(format!(
                "Unsupported journal version: {}",
                version[0]
            )));
        }
        Ok(())
    }

    /// Walk the entries in the first `len` bytes of `file`, returning the
    /// highest sequence number and the end of the last complete entry.
    ///
    /// Stops early only on a torn entry at the end; any other damage is an
    /// error.
    fn scan(
        file: &File,
        len: u64,
        mut visit: impl FnMut(JournalEntry),
    ) -> Result<(u64, u64)> {
        let mut reader = BufReader::new(file);
        Self::read_header(&mut reader)?;

        let mut last_seq = 0u64;
        let mut offset = HEADER_SIZE;
        while offset < len {
            match Self::read_entry(&mut reader) {
                Ok((entry, size)) => {
                    last_seq = last_seq.max(entry.seq);
                    offset += size;
                    visit(entry);
                }
                Err(LedgerError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
        }
        Ok((last_seq, offset.min(len)))
    }

    fn encode_entry(entry: &JournalEntry) -> Result<Vec<u8>> {
        let encoded = rmp_serde::to_vec(entry)?;
        if encoded.len() > MAX_ENTRY_SIZE {
            return Err(LedgerError::InvalidFormat(format!(
                "Journal entry too large: {} bytes",
                encoded.len()
            )));
        }

        let mut frame = Vec::with_capacity(4 + encoded.len() + 4);
        frame.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        frame.extend_from_slice(&encoded);
        frame.extend_from_slice(&crc32fast::hash(&encoded).to_le_bytes());
        Ok(frame)
    }

    /// Read one entry, returning it with its size on disk.
    fn read_entry(reader: &mut impl Read) -> Result<(JournalEntry, u64)> {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_ENTRY_SIZE {
            return Err(LedgerError::Corruption("Journal entry too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored = u32::from_le_bytes(checksum_bytes);
        let computed = crc32fast::hash(&encoded);
        if stored != computed {
            return Err(LedgerError::ChecksumMismatch {
                expected: stored,
                got: computed,
            });
        }

        let entry = rmp_serde::from_slice(&encoded)?;
        Ok((entry, 4 + len as u64 + 4))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Action, Timestamp};
    use tempfile::TempDir;

    fn tx(subject: &str) -> Transaction {
        Transaction::new(Action::Register, subject, Timestamp::now())
    }

    #[test]
    fn test_journal_append_and_read() {
        let dir = TempDir::new().unwrap();
        let journal = TransactionJournal::open(dir.path().join("tx.journal")).unwrap();
        assert!(journal.is_empty());

        assert_eq!(journal.append(&tx("s1")).unwrap(), 1);
        assert_eq!(journal.append(&tx("s2")).unwrap(), 2);

        let entries = journal.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].transaction.id, "tx_s1");
        assert_eq!(entries[1].seq, 2);
    }

    #[test]
    fn test_journal_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tx.journal");

        let first = tx("s1");
        {
            let journal = TransactionJournal::open(&path).unwrap();
            journal.append(&first).unwrap();
        }

        {
            let journal = TransactionJournal::open(&path).unwrap();
            assert_eq!(journal.len(), 1);
            // Numbering continues after reopen
            assert_eq!(journal.append(&tx("s2")).unwrap(), 2);

            let entries = journal.entries().unwrap();
            assert_eq!(entries[0].transaction, first);
        }
    }

    #[test]
    fn test_journal_torn_tail_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tx.journal");

        {
            let journal = TransactionJournal::open(&path).unwrap();
            journal.append(&tx("s1")).unwrap();
        }
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[42, 0, 0, 0, 1, 2]).unwrap();
        }

        let journal = TransactionJournal::open(&path).unwrap();
        journal.append(&tx("s2")).unwrap();

        let ids: Vec<_> = journal
            .entries()
            .unwrap()
            .into_iter()
            .map(|e| e.transaction.id)
            .collect();
        assert_eq!(ids, vec!["tx_s1", "tx_s2"]);
    }

    #[test]
    fn test_journal_damaged_entry_fails_open_and_keeps_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tx.journal");

        {
            let journal = TransactionJournal::open(&path).unwrap();
            for i in 0..5 {
                journal.append(&tx(&format!("s{}", i))).unwrap();
            }
        }
        let size_before = std::fs::metadata(&path).unwrap().len();

        // Flip a payload byte inside the first entry
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[HEADER_SIZE as usize + 4 + 2] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let result = TransactionJournal::open(&path);
        assert!(matches!(result, Err(LedgerError::ChecksumMismatch { .. })));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), size_before);
    }

    #[test]
    fn test_journal_entries_reports_damage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tx.journal");
        let journal = TransactionJournal::open(&path).unwrap();
        journal.append(&tx("s1")).unwrap();
        journal.append(&tx("s2")).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[HEADER_SIZE as usize + 4 + 2] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        assert!(journal.entries().is_err());
    }

    #[test]
    fn test_journal_rejects_oversized_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tx.journal");
        let journal = TransactionJournal::open(&path).unwrap();
        journal.append(&tx("s1")).unwrap();

        let huge = "x".repeat(MAX_ENTRY_SIZE + 1);
        let result = journal.append(&tx(&huge));
        assert!(matches!(result, Err(LedgerError::InvalidFormat(_))));
        assert_eq!(journal.len(), 1);

        drop(journal);
        let journal = TransactionJournal::open(&path).unwrap();
        assert_eq!(journal.entries().unwrap().len(), 1);
    }

    #[test]
    fn test_journal_failed_write_rolled_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tx.journal");

        {
            let journal = TransactionJournal::open(&path).unwrap();
            journal.append(&tx("s1")).unwrap();

            // Half a frame reaches the file before the write fails
            let result = journal.append_with(&tx("s2"), |file, frame| {
                file.write_all(&frame[..frame.len() / 2])?;
                Err(io::Error::new(io::ErrorKind::Other, "disk full"))
            });
            assert!(matches!(result, Err(LedgerError::Io(_))));

            assert_eq!(journal.append(&tx("s3")).unwrap(), 2);
        }

        let journal = TransactionJournal::open(&path).unwrap();
        let ids: Vec<_> = journal
            .entries()
            .unwrap()
            .into_iter()
            .map(|e| e.transaction.id)
            .collect();
        assert_eq!(ids, vec!["tx_s1", "tx_s3"]);
    }

    #[test]
    fn test_journal_rejects_foreign_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tx.journal");
        std::fs::write(&path, b"WAL\0\x01").unwrap();

        let result = TransactionJournal::open(&path);
        assert!(matches!(result, Err(LedgerError::InvalidFormat(_))));
    }
}
