//! Append-only ledger file.
//!
//! Layout of a ledger directory:
//! - `MANIFEST`: magic + format version
//! - `LOCK`: held exclusively while the ledger is open
//! - `ledger.log`: header followed by entries of the form
//!   `[key_len u16][key][value_len u32][value][crc32(value) u32]`
//!
//! The key index lives in memory and is rebuilt by scanning the log on open.

use super::LedgerStore;
use crate::error::LedgerError;
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

type Result<T> = std::result::Result<T, LedgerError>;

/// Magic bytes for the ledger manifest.
const MANIFEST_MAGIC: &[u8; 4] = b"REG\0";

/// Magic bytes for the ledger log.
const LOG_MAGIC: &[u8; 4] = b"LGR\0";

/// Current format version (manifest and log).
const LEDGER_VERSION: u8 = 1;

/// Size of the log header (magic + version).
const HEADER_SIZE: u64 = 5;

/// Upper bound on a single value (sanity check while scanning).
const MAX_VALUE_SIZE: usize = 64 * 1024 * 1024;

/// Location of a value inside the log.
#[derive(Clone, Copy, Debug)]
struct Slot {
    offset: u64,
    len: u32,
}

struct LogWriter {
    file: File,
    size: u64,
    writes_since_sync: u64,
}

/// Ledger persisted as an append-only log in a directory.
pub struct FileLedger {
    path: PathBuf,

    /// Lock file for exclusive access.
    _lock_file: File,

    log: Mutex<LogWriter>,

    /// Key to latest value location.
    index: RwLock<HashMap<String, Slot>>,

    /// Sync every N writes.
    sync_interval: u64,
}

impl FileLedger {
    /// Default sync interval - sync every 100 writes.
    pub const DEFAULT_SYNC_INTERVAL: u64 = 100;

    /// Open or create a ledger in `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_sync_interval(path, Self::DEFAULT_SYNC_INTERVAL)
    }

    /// Open or create a ledger with a custom sync interval.
    /// - sync_interval = 0 or 1: sync every write
    /// - sync_interval = N: sync every N writes
    pub fn open_with_sync_interval(path: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        if path.join("MANIFEST").exists() {
            Self::verify_manifest(&path)?;
        } else {
            Self::write_manifest(&path)?;
        }

        let lock_file = Self::acquire_lock(&path)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.join("ledger.log"))?;

        let (index, size) = if file.metadata()?.len() == 0 {
            file.write_all(LOG_MAGIC)?;
            file.write_all(&[LEDGER_VERSION])?;
            file.sync_all()?;
            (HashMap::new(), HEADER_SIZE)
        } else {
            Self::scan(&mut file)?
        };

        debug!(path = %path.display(), keys = index.len(), "ledger opened");

        Ok(Self {
            path,
            _lock_file: lock_file,
            log: Mutex::new(LogWriter {
                file,
                size,
                writes_since_sync: 0,
            }),
            index: RwLock::new(index),
            sync_interval: sync_interval.max(1),
        })
    }

    /// Directory holding the ledger.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// Current log size in bytes.
    pub fn size(&self) -> u64 {
        self.log.lock().size
    }

    /// Force pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        let mut log = self.log.lock();
        log.file.sync_all()?;
        log.writes_since_sync = 0;
        Ok(())
    }

    /// Rebuild the index from the log, dropping a torn trailing entry.
    fn scan(file: &mut File) -> Result<(HashMap<String, Slot>, u64)> {
        let file_size = file.metadata()?.len();
        file.seek(SeekFrom::Start(0))?;

        let mut index = HashMap::new();
        let mut offset = HEADER_SIZE;
        {
            let mut reader = BufReader::new(&*file);

            let mut magic = [0u8; 4];
            reader.read_exact(&mut magic)?;
            if &magic != LOG_MAGIC {
                return Err(LedgerError::InvalidFormat("Invalid ledger log magic".into()));
            }

            let mut version = [0u8; 1];
            reader.read_exact(&mut version)?;
            if version[0] != LEDGER_VERSION {
                return Err(LedgerError::InvalidFormat(format!(
                    "Unsupported ledger version: {}",
                    version[0]
                )));
            }

            while offset < file_size {
                match Self::read_entry(&mut reader) {
                    Ok((key, value)) => {
                        let value_offset = offset + 2 + key.len() as u64 + 4;
                        index.insert(
                            key,
                            Slot {
                                offset: value_offset,
                                len: value.len() as u32,
                            },
                        );
                        offset = value_offset + value.len() as u64 + 4;
                    }
                    Err(LedgerError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        warn!(offset, file_size, "truncating torn entry at end of ledger");
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if offset < file_size {
            file.set_len(offset)?;
            file.sync_all()?;
        }

        Ok((index, offset))
    }

    fn encode_entry(key: &str, value: &[u8]) -> Result<Vec<u8>> {
        let key_len = u16::try_from(key.len())
            .map_err(|_| LedgerError::InvalidFormat(format!("Key too long: {} bytes", key.len())))?;
        if value.len() > MAX_VALUE_SIZE {
            return Err(LedgerError::InvalidFormat(format!(
                "Value too large: {} bytes",
                value.len()
            )));
        }

        let mut buf = Vec::with_capacity(2 + key.len() + 4 + value.len() + 4);
        buf.extend_from_slice(&key_len.to_le_bytes());
        buf.extend_from_slice(key.as_bytes());
        buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        buf.extend_from_slice(value);
        buf.extend_from_slice(&crc32fast::hash(value).to_le_bytes());
        Ok(buf)
    }

    fn read_entry(reader: &mut impl Read) -> Result<(String, Vec<u8>)> {
        let mut key_len_bytes = [0u8; 2];
        reader.read_exact(&mut key_len_bytes)?;
        let key_len = u16::from_le_bytes(key_len_bytes) as usize;
        let mut key_bytes = vec![0u8; key_len];
        reader.read_exact(&mut key_bytes)?;
        let key = String::from_utf8(key_bytes)
            .map_err(|_| LedgerError::Corruption("Ledger key is not UTF-8".into()))?;

        let value = Self::read_value(reader)?;
        Ok((key, value))
    }

    fn read_value(reader: &mut impl Read) -> Result<Vec<u8>> {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_VALUE_SIZE {
            return Err(LedgerError::Corruption("Ledger entry too large".into()));
        }

        let mut value = vec![0u8; len];
        reader.read_exact(&mut value)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored = u32::from_le_bytes(checksum_bytes);
        let computed = crc32fast::hash(&value);
        if stored != computed {
            return Err(LedgerError::ChecksumMismatch {
                expected: stored,
                got: computed,
            });
        }

        Ok(value)
    }

    fn write_manifest(path: &Path) -> Result<()> {
        let mut file = File::create(path.join("MANIFEST"))?;
        file.write_all(MANIFEST_MAGIC)?;
        file.write_all(&[LEDGER_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        let mut file = File::open(path.join("MANIFEST"))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != MANIFEST_MAGIC {
            return Err(LedgerError::InvalidFormat("Invalid ledger manifest".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != LEDGER_VERSION {
            return Err(LedgerError::InvalidFormat(format!(
                "Unsupported ledger version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| LedgerError::Locked)?;
        Ok(lock_file)
    }
}

impl LedgerStore for FileLedger {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let slot = match self.index.read().get(key).copied() {
            Some(slot) => slot,
            None => return Ok(None),
        };

        let mut log = self.log.lock();
        log.file.seek(SeekFrom::Start(slot.offset - 4))?;
        let value = Self::read_value(&mut log.file)?;
        if value.len() != slot.len as usize {
            return Err(LedgerError::Corruption(format!(
                "Length mismatch for key {key}: indexed {}, stored {}",
                slot.len,
                value.len()
            )));
        }
        Ok(Some(value))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let entry = Self::encode_entry(key, value)?;

        let mut log = self.log.lock();
        let offset = log.size;
        log.file.seek(SeekFrom::Start(offset))?;
        if let Err(e) = log.file.write_all(&entry) {
            // Drop the partial entry so the next append lands at `offset`.
            let _ = log.file.set_len(offset);
            return Err(e.into());
        }
        log.size = offset + entry.len() as u64;

        log.writes_since_sync += 1;
        if log.writes_since_sync >= self.sync_interval {
            log.file.sync_all()?;
            log.writes_since_sync = 0;
        }

        self.index.write().insert(
            key.to_string(),
            Slot {
                offset: offset + 2 + key.len() as u64 + 4,
                len: value.len() as u32,
            },
        );

        Ok(())
    }
}

impl Drop for FileLedger {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_and_get() {
        let dir = TempDir::new().unwrap();
        let ledger = FileLedger::open(dir.path().join("ledger")).unwrap();

        assert!(ledger.get("s1").unwrap().is_none());
        ledger.put("s1", br#"{"name":"Alice"}"#).unwrap();
        assert_eq!(
            ledger.get("s1").unwrap().as_deref(),
            Some(&br#"{"name":"Alice"}"#[..])
        );
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger");

        {
            let ledger = FileLedger::open(&path).unwrap();
            for i in 0..5 {
                ledger
                    .put(&format!("key-{}", i), format!("value {}", i).as_bytes())
                    .unwrap();
            }
        }

        {
            let ledger = FileLedger::open(&path).unwrap();
            assert_eq!(ledger.len(), 5);
            assert_eq!(ledger.get("key-3").unwrap().unwrap(), b"value 3");

            ledger.put("key-5", b"value 5").unwrap();
            assert_eq!(ledger.get("key-5").unwrap().unwrap(), b"value 5");
        }
    }

    #[test]
    fn test_second_open_is_locked() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger");

        let _first = FileLedger::open(&path).unwrap();
        let second = FileLedger::open(&path);
        assert!(matches!(second, Err(LedgerError::Locked)));
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger");

        let intact_size = {
            let ledger = FileLedger::open(&path).unwrap();
            ledger.put("a", b"first").unwrap();
            ledger.put("b", b"second").unwrap();
            ledger.size()
        };

        // Simulate a crash halfway through an append.
        {
            let mut file = OpenOptions::new()
                .append(true)
                .open(path.join("ledger.log"))
                .unwrap();
            file.write_all(&3u16.to_le_bytes()).unwrap();
            file.write_all(b"ca").unwrap();
        }

        let ledger = FileLedger::open(&path).unwrap();
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.size(), intact_size);
        assert_eq!(ledger.get("b").unwrap().unwrap(), b"second");

        ledger.put("c", b"third").unwrap();
        assert_eq!(ledger.get("c").unwrap().unwrap(), b"third");
    }

    #[test]
    fn test_corrupted_value_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger");

        {
            let ledger = FileLedger::open(&path).unwrap();
            ledger.put("a", b"payload").unwrap();
        }

        // Flip a byte inside the value.
        {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(path.join("ledger.log"))
                .unwrap();
            let value_offset = HEADER_SIZE + 2 + 1 + 4;
            file.seek(SeekFrom::Start(value_offset)).unwrap();
            file.write_all(b"X").unwrap();
        }

        let result = FileLedger::open(&path);
        assert!(matches!(result, Err(LedgerError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_invalid_manifest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger");
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("MANIFEST"), b"NOPE\x01").unwrap();

        let result = FileLedger::open(&path);
        assert!(matches!(result, Err(LedgerError::InvalidFormat(_))));
    }
}
