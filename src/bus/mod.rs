//! Event bus for live transaction updates.
//!
//! Committed transactions are published onto a single bounded queue and
//! fanned out to every subscriber live at the moment of delivery:
//! - Subscribers that fail a delivery are pruned immediately
//! - Each delivery has a deadline, so one stalled observer cannot stall
//!   the rest
//! - There is no backlog: a subscriber only sees events published after it
//!   joined
//!
//! # Example
//!
//! ```ignore
//! let bus = EventBus::new();
//! let handle = bus.subscribe_channel();
//!
//! bus.publish(transaction);
//!
//! while let Ok(event) = handle.recv() {
//!     println!("committed: {}", event.id);
//! }
//! ```

mod manager;
mod types;

pub use manager::EventBus;
pub use types::{
    BusConfig, BusStats, Canceller, ChannelSubscriber, DeliveryError, Subscriber,
    SubscriptionHandle,
};
