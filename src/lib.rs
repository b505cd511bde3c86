//! # Registrar
//!
//! A write-once record registry that notifies every live observer of every
//! committed write, in real time.
//!
//! ## Core Concepts
//!
//! - **Ledger**: Key-value backend the registry writes through
//! - **Registry**: Uniqueness-enforcing "insert if absent" over the ledger
//! - **Transactions**: One event per committed write, logged and broadcast
//! - **Event bus**: Single dispatch loop fanning transactions out to subscribers
//! - **Sessions**: Per-connection lifecycle around one subscriber
//!
//! ## Example
//!
//! ```ignore
//! use registrar::{Registrar, RegistrarConfig, JsonLines};
//!
//! let registrar = Registrar::open(RegistrarConfig {
//!     path: "./ledger".into(),
//!     ..Default::default()
//! })?;
//!
//! // Observe commits
//! let handle = registrar.subscribe();
//!
//! // Register a student
//! let tx = registrar.register_student("s1", "Alice", "MIT")?;
//! assert_eq!(tx.id, "tx_s1");
//!
//! // Query it back
//! let student = registrar.query_student("s1")?;
//! ```

pub mod bus;
pub mod error;
pub mod journal;
pub mod ledger;
pub mod registry;
pub mod service;
pub mod session;
pub mod types;

// Re-exports
pub use bus::{
    BusConfig, BusStats, Canceller, ChannelSubscriber, DeliveryError, EventBus, Subscriber,
    SubscriptionHandle,
};
pub use error::{LedgerError, RegistryError, Result};
pub use journal::{JournalEntry, TransactionJournal};
pub use ledger::{FileLedger, LedgerStore, MemoryLedger};
pub use registry::{Registry, MAX_ID_LEN};
pub use service::{Registrar, RegistrarConfig};
pub use session::{Connection, Interrupter, JsonLines, Session, SessionState, TcpObserver};
pub use types::*;
