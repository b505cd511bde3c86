//! Subscriber types for the event bus.

use crate::types::{SubscriberId, Transaction};
use crossbeam_channel::{
    select, Receiver, RecvError, RecvTimeoutError, Sender, TryRecvError,
};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Configuration for an event bus.
#[derive(Clone, Debug)]
pub struct BusConfig {
    /// Capacity of the inbound command queue. Publishers block once it fills.
    /// Default: 1024
    pub queue_capacity: usize,

    /// Deadline for a single delivery to a single subscriber. A delivery
    /// that misses it prunes the subscriber.
    /// Default: 500ms
    pub delivery_timeout: Duration,

    /// Buffer of each channel subscriber.
    /// Default: 256
    pub subscriber_buffer: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            delivery_timeout: Duration::from_millis(500),
            subscriber_buffer: 256,
        }
    }
}

/// Why a delivery failed.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("subscriber disconnected")]
    Disconnected,

    #[error("subscriber cancelled")]
    Cancelled,

    #[error("delivery deadline exceeded")]
    Timeout,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for DeliveryError {
    fn from(e: serde_json::Error) -> Self {
        DeliveryError::Serialization(e.to_string())
    }
}

/// A live observer owned by the event bus.
///
/// Only the bus calls these methods, and only from its dispatch thread.
pub trait Subscriber: Send {
    /// Deliver one event, giving up at `deadline`.
    fn deliver(&mut self, event: &Transaction, deadline: Instant) -> Result<(), DeliveryError>;

    /// Release the subscriber. Called exactly once, when the bus drops it.
    fn close(&mut self);
}

/// Signal that tells the bus side of a subscription to stop waiting.
///
/// Dropping or cancelling it disconnects every receiver obtained from
/// [`Canceller::signal`], which wakes any delivery blocked on a full buffer.
#[derive(Debug)]
pub struct Canceller {
    sender: Sender<()>,
    signal: Receiver<()>,
}

impl Canceller {
    pub fn new() -> Self {
        // Nothing is ever sent; only disconnection matters.
        let (sender, signal) = crossbeam_channel::bounded(0);
        Self { sender, signal }
    }

    /// A receiver that becomes ready once this canceller is dropped.
    pub fn signal(&self) -> Receiver<()> {
        self.signal.clone()
    }

    pub fn cancel(self) {
        drop(self.sender);
    }
}

impl Default for Canceller {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscriber backed by a bounded channel.
pub struct ChannelSubscriber {
    events: Option<Sender<Transaction>>,
    cancelled: Receiver<()>,
}

impl ChannelSubscriber {
    pub fn new(events: Sender<Transaction>, cancelled: Receiver<()>) -> Self {
        Self {
            events: Some(events),
            cancelled,
        }
    }

    fn is_cancelled(&self) -> bool {
        matches!(self.cancelled.try_recv(), Err(TryRecvError::Disconnected))
    }
}

impl Subscriber for ChannelSubscriber {
    fn deliver(&mut self, event: &Transaction, deadline: Instant) -> Result<(), DeliveryError> {
        if self.is_cancelled() {
            return Err(DeliveryError::Cancelled);
        }
        let events = self.events.as_ref().ok_or(DeliveryError::Disconnected)?;

        let timeout = deadline.saturating_duration_since(Instant::now());
        select! {
            send(events, event.clone()) -> res => res.map_err(|_| DeliveryError::Disconnected),
            recv(self.cancelled) -> _ => Err(DeliveryError::Cancelled),
            default(timeout) => Err(DeliveryError::Timeout),
        }
    }

    fn close(&mut self) {
        // Receiver drains what is buffered, then sees the disconnect.
        self.events.take();
    }
}

/// Handle to a channel subscription.
///
/// Dropping the handle disconnects the subscriber; the bus prunes it on its
/// next delivery attempt.
pub struct SubscriptionHandle {
    pub id: SubscriberId,
    /// Channel to receive events.
    pub receiver: Receiver<Transaction>,
    canceller: Canceller,
}

impl SubscriptionHandle {
    pub(crate) fn new(id: SubscriberId, receiver: Receiver<Transaction>, canceller: Canceller) -> Self {
        Self {
            id,
            receiver,
            canceller,
        }
    }

    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<Transaction, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<Transaction, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Transaction, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Split into id, event receiver and cancellation signal.
    pub fn into_parts(self) -> (SubscriberId, Receiver<Transaction>, Canceller) {
        (self.id, self.receiver, self.canceller)
    }
}

/// Event bus counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BusStats {
    /// Events taken off the inbound queue.
    pub published: u64,
    /// Successful per-subscriber deliveries.
    pub delivered: u64,
    /// Subscribers removed after a failed delivery.
    pub pruned: u64,
    /// Subscribers currently live.
    pub subscribers: usize,
}
