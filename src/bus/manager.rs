//! Event bus that fans committed transactions out to live subscribers.

use crate::types::{SubscriberId, Transaction};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::types::{
    BusConfig, BusStats, Canceller, ChannelSubscriber, Subscriber, SubscriptionHandle,
};

/// Work items for the dispatch thread, processed strictly in FIFO order.
enum Command {
    Subscribe {
        id: SubscriberId,
        subscriber: Pending,
        accepted: Sender<bool>,
    },
    Unsubscribe(SubscriberId),
    Publish(Transaction),
    Flush(Sender<()>),
    Shutdown,
}

/// A subscriber in transit to the dispatch thread. Closed on drop unless
/// the dispatcher took ownership of it.
struct Pending(Option<Box<dyn Subscriber>>);

impl Pending {
    fn take(mut self) -> Option<Box<dyn Subscriber>> {
        self.0.take()
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        if let Some(mut subscriber) = self.0.take() {
            subscriber.close();
        }
    }
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    pruned: AtomicU64,
    subscribers: AtomicUsize,
}

/// Fan-out bus for committed transactions.
///
/// All membership changes and deliveries go through one bounded queue
/// drained by a single dispatch thread, which exclusively owns the
/// subscriber set. A subscribe that returns before a publish is therefore
/// always seen by that publish, and an event is never offered to a
/// subscriber after one of its deliveries has failed.
pub struct EventBus {
    commands: Sender<Command>,
    next_id: AtomicU64,
    counters: Arc<Counters>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    config: BusConfig,
}

impl EventBus {
    /// Create a bus with default configuration and start its dispatch thread.
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    /// Create a bus and start its dispatch thread.
    pub fn with_config(config: BusConfig) -> Self {
        let (commands, inbox) = bounded(config.queue_capacity.max(1));
        let counters = Arc::new(Counters::default());

        let dispatcher = Dispatcher {
            inbox,
            subscribers: HashMap::new(),
            delivery_timeout: config.delivery_timeout,
            counters: Arc::clone(&counters),
        };
        let handle = thread::Builder::new()
            .name("registrar-bus".into())
            .spawn(move || dispatcher.run())
            .ok();
        if handle.is_none() {
            warn!("failed to spawn event bus dispatch thread");
        }

        Self {
            commands,
            next_id: AtomicU64::new(1),
            counters,
            dispatcher: Mutex::new(handle),
            config,
        }
    }

    /// Bus configuration.
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Register a subscriber. It receives every event published after this
    /// call returns, until it is unsubscribed or a delivery to it fails.
    ///
    /// On a shut-down bus the subscriber is closed immediately; the id is
    /// still returned but never becomes live. See [`EventBus::try_subscribe`].
    pub fn subscribe(&self, subscriber: Box<dyn Subscriber>) -> SubscriberId {
        self.register(subscriber).0
    }

    /// Register a subscriber, returning `None` (after closing it) if the bus
    /// is shut down.
    pub fn try_subscribe(&self, subscriber: Box<dyn Subscriber>) -> Option<SubscriberId> {
        match self.register(subscriber) {
            (id, true) => Some(id),
            (_, false) => None,
        }
    }

    /// Register a channel-backed subscriber and return its handle.
    pub fn subscribe_channel(&self) -> SubscriptionHandle {
        self.channel_subscription().0
    }

    /// Channel subscription plus whether the bus accepted it.
    pub(crate) fn channel_subscription(&self) -> (SubscriptionHandle, bool) {
        let (sender, receiver) = bounded(self.config.subscriber_buffer);
        let canceller = Canceller::new();
        let subscriber = ChannelSubscriber::new(sender, canceller.signal());

        let (id, accepted) = self.register(Box::new(subscriber));
        (SubscriptionHandle::new(id, receiver, canceller), accepted)
    }

    /// Hand a subscriber to the dispatcher and wait until it is live.
    fn register(&self, subscriber: Box<dyn Subscriber>) -> (SubscriberId, bool) {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (ack, accepted) = bounded(1);

        let command = Command::Subscribe {
            id,
            subscriber: Pending(Some(subscriber)),
            accepted: ack,
        };
        // A rejected command drops its `Pending`, which closes the subscriber.
        let live = self.commands.send(command).is_ok() && accepted.recv().unwrap_or(false);
        if !live {
            debug!(%id, "subscribe after shutdown");
        }
        (id, live)
    }

    /// Remove a subscriber. Removing an unknown or already-pruned id is a
    /// no-op.
    pub fn unsubscribe(&self, id: SubscriberId) {
        if self.commands.send(Command::Unsubscribe(id)).is_err() {
            debug!(%id, "unsubscribe after shutdown");
        }
    }

    /// Queue an event for delivery to every live subscriber.
    ///
    /// Blocks only while the inbound queue is full. Delivery failures are
    /// never reported here.
    pub fn publish(&self, event: Transaction) {
        if let Err(err) = self.commands.send(Command::Publish(event)) {
            if let Command::Publish(event) = err.into_inner() {
                debug!(tx_id = %event.id, "event bus closed; dropping event");
            }
        }
    }

    /// Wait until every command queued before this call has been processed.
    pub fn flush(&self) {
        let (ack, done) = bounded(1);
        if self.commands.send(Command::Flush(ack)).is_ok() {
            let _ = done.recv();
        }
    }

    /// Number of live subscribers, as of the last processed command.
    pub fn subscriber_count(&self) -> usize {
        self.counters.subscribers.load(Ordering::SeqCst)
    }

    /// Snapshot of the bus counters.
    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.counters.published.load(Ordering::SeqCst),
            delivered: self.counters.delivered.load(Ordering::SeqCst),
            pruned: self.counters.pruned.load(Ordering::SeqCst),
            subscribers: self.counters.subscribers.load(Ordering::SeqCst),
        }
    }

    /// Process everything already queued, close all subscribers and stop the
    /// dispatch thread. Idempotent.
    pub fn shutdown(&self) {
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            let _ = self.commands.send(Command::Shutdown);
            if handle.join().is_err() {
                warn!("event bus dispatch thread panicked");
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// State owned by the dispatch thread.
struct Dispatcher {
    inbox: Receiver<Command>,
    subscribers: HashMap<SubscriberId, Box<dyn Subscriber>>,
    delivery_timeout: Duration,
    counters: Arc<Counters>,
}

impl Dispatcher {
    fn run(mut self) {
        info!("event bus started");

        while let Ok(command) = self.inbox.recv() {
            match command {
                Command::Subscribe {
                    id,
                    subscriber,
                    accepted,
                } => {
                    if let Some(subscriber) = subscriber.take() {
                        self.subscribers.insert(id, subscriber);
                        debug!(%id, "subscriber added");
                    }
                    let _ = accepted.send(true);
                }
                Command::Unsubscribe(id) => {
                    if let Some(mut subscriber) = self.subscribers.remove(&id) {
                        subscriber.close();
                        debug!(%id, "subscriber removed");
                    }
                }
                Command::Publish(event) => self.dispatch(&event),
                Command::Flush(ack) => {
                    let _ = ack.send(());
                }
                Command::Shutdown => break,
            }
            self.counters
                .subscribers
                .store(self.subscribers.len(), Ordering::SeqCst);
        }

        for (_, mut subscriber) in self.subscribers.drain() {
            subscriber.close();
        }

        // Anything queued behind the shutdown is refused. Dropping a
        // `Pending` closes its subscriber.
        for command in self.inbox.try_iter() {
            match command {
                Command::Subscribe { id, accepted, .. } => {
                    debug!(%id, "subscriber refused during shutdown");
                    let _ = accepted.send(false);
                }
                Command::Flush(ack) => {
                    let _ = ack.send(());
                }
                Command::Unsubscribe(_) | Command::Publish(_) | Command::Shutdown => {}
            }
        }
        self.counters.subscribers.store(0, Ordering::SeqCst);
        info!("event bus stopped");
    }

    /// Offer one event to every live subscriber, pruning failures in place.
    fn dispatch(&mut self, event: &Transaction) {
        self.counters.published.fetch_add(1, Ordering::SeqCst);

        let delivery_timeout = self.delivery_timeout;
        let counters = &self.counters;
        self.subscribers.retain(|id, subscriber| {
            let deadline = Instant::now() + delivery_timeout;
            match subscriber.deliver(event, deadline) {
                Ok(()) => {
                    counters.delivered.fetch_add(1, Ordering::SeqCst);
                    true
                }
                Err(e) => {
                    warn!(%id, tx_id = %event.id, error = %e, "pruning subscriber");
                    subscriber.close();
                    counters.pruned.fetch_add(1, Ordering::SeqCst);
                    false
                }
            }
        });
    }
}
