//! Core types for the registrar.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

/// Status assigned to every record at registration.
pub const STATUS_REGISTERED: &str = "Registered";

/// Prefix of every transaction id.
const TX_PREFIX: &str = "tx_";

/// Commit time of a transaction, UTC with microsecond precision.
///
/// Serialized as an RFC3339 string.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub DateTime<Utc>);

impl Timestamp {
    /// Current wall-clock time, truncated to microseconds.
    pub fn now() -> Self {
        Timestamp(Utc::now().trunc_subsecs(6))
    }

    /// RFC3339 rendering used on the wire.
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    /// Parse an RFC3339 string.
    pub fn parse(s: &str) -> Result<Self, chrono::ParseError> {
        let parsed = DateTime::parse_from_rfc3339(s)?;
        Ok(Timestamp(parsed.with_timezone(&Utc)))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.to_rfc3339())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_rfc3339())
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_rfc3339())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Timestamp::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Hands out commit timestamps that never go backwards, even if the
/// system clock does.
pub struct Clock {
    last: Mutex<Option<Timestamp>>,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(None),
        }
    }

    /// Next commit timestamp.
    pub fn now(&self) -> Timestamp {
        let mut last = self.last.lock();
        let now = Timestamp::now();
        let next = match *last {
            Some(prev) if prev > now => prev,
            _ => now,
        };
        *last = Some(next);
        next
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Kind of committed write a transaction describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    /// A student was registered.
    Register,
    /// A file reference was registered.
    RegisterFile,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Register => "Register",
            Action::RegisterFile => "RegisterFile",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event describing one committed write.
///
/// The subject field goes over the wire as `student_id`, which is what
/// existing observers read; `subject_id` is accepted when decoding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub action: Action,
    #[serde(rename = "student_id", alias = "subject_id")]
    pub subject_id: String,
    pub timestamp: Timestamp,
}

impl Transaction {
    /// Build a transaction for a write of `subject_id`. The id is derived
    /// from the subject so replays of the same write share it.
    pub fn new(action: Action, subject_id: impl Into<String>, timestamp: Timestamp) -> Self {
        let subject_id = subject_id.into();
        Self {
            id: format!("{TX_PREFIX}{subject_id}"),
            action,
            subject_id,
            timestamp,
        }
    }
}

/// A write-once domain entity stored in the ledger.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync {
    /// Action recorded when this kind of record is registered.
    const ACTION: Action;

    /// Check that every required field is present.
    ///
    /// Returns the name of the first empty field.
    fn missing_field(&self) -> Option<&'static str>;
}

/// A registered student.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub name: String,
    pub school: String,
    pub status: String,
}

impl Student {
    pub fn new(name: impl Into<String>, school: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            school: school.into(),
            status: STATUS_REGISTERED.to_string(),
        }
    }
}

impl Record for Student {
    const ACTION: Action = Action::Register;

    fn missing_field(&self) -> Option<&'static str> {
        if self.name.is_empty() {
            Some("name")
        } else if self.school.is_empty() {
            Some("school")
        } else {
            None
        }
    }
}

/// A registered file, identified by its content hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub filename: String,
    pub hash: String,
    #[serde(default = "registered_status")]
    pub status: String,
}

fn registered_status() -> String {
    STATUS_REGISTERED.to_string()
}

impl FileRef {
    pub fn new(filename: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            hash: hash.into(),
            status: registered_status(),
        }
    }

    /// Reference a file by the SHA-256 of its content (lowercase hex).
    pub fn from_content(filename: impl Into<String>, content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        Self::new(filename, hex::encode(hasher.finalize()))
    }
}

impl Record for FileRef {
    const ACTION: Action = Action::RegisterFile;

    fn missing_field(&self) -> Option<&'static str> {
        if self.filename.is_empty() {
            Some("filename")
        } else if self.hash.is_empty() {
            Some("hash")
        } else {
            None
        }
    }
}

/// Unique identifier for a subscriber on the event bus. Never reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberId(pub u64);

impl fmt::Debug for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriberId({})", self.0)
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_wire_format() {
        let ts = Timestamp::parse("2024-05-01T10:00:00.000000Z").unwrap();
        let tx = Transaction::new(Action::Register, "s1", ts);
        assert_eq!(tx.id, "tx_s1");

        let value = serde_json::to_value(&tx).unwrap();
        assert_eq!(value["id"], "tx_s1");
        assert_eq!(value["action"], "Register");
        assert_eq!(value["student_id"], "s1");
        assert_eq!(value["timestamp"], "2024-05-01T10:00:00.000000Z");
        assert!(value.get("subject_id").is_none());
    }

    #[test]
    fn test_transaction_accepts_subject_id() {
        let json = r#"{"id":"tx_f1","action":"RegisterFile","subject_id":"f1","timestamp":"2024-05-01T10:00:00Z"}"#;
        let tx: Transaction = serde_json::from_str(json).unwrap();
        assert_eq!(tx.subject_id, "f1");
        assert_eq!(tx.action, Action::RegisterFile);
    }

    #[test]
    fn test_clock_never_decreases() {
        let clock = Clock::new();
        let mut prev = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next >= prev);
            prev = next;
        }
    }

    #[test]
    fn test_student_status_and_validation() {
        let student = Student::new("Alice", "MIT");
        assert_eq!(student.status, STATUS_REGISTERED);
        assert_eq!(student.missing_field(), None);
        assert_eq!(Student::new("", "MIT").missing_field(), Some("name"));
        assert_eq!(Student::new("Alice", "").missing_field(), Some("school"));
    }

    #[test]
    fn test_file_ref_from_content() {
        let file = FileRef::from_content("notes.txt", b"hello world");
        assert_eq!(
            file.hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(file.missing_field(), None);
    }

    #[test]
    fn test_file_ref_without_status_decodes() {
        let file: FileRef = serde_json::from_str(r#"{"filename":"a.pdf","hash":"Qm"}"#).unwrap();
        assert_eq!(file.status, STATUS_REGISTERED);
    }
}
