//! Per-connection subscription sessions.
//!
//! A [`Session`] owns one observer connection. On open it registers a
//! channel subscriber with the [`EventBus`] and starts a pump thread that
//! writes every received transaction to the connection. The bus only ever
//! sees the channel, never the connection.
//!
//! Lifecycle: `Connecting -> Open -> Closing -> Closed`. The first failed
//! write, a prune by the bus, or an explicit [`Session::close`] moves the
//! session to `Closing`; the pump then unsubscribes, shuts the connection
//! down and marks it `Closed`. A write already blocked in the connection is
//! aborted through its [`Interrupter`], if it has one. A session opened on a
//! shut-down bus goes straight to `Closed`.

use crate::bus::{Canceller, DeliveryError, EventBus};
use crate::types::{SubscriberId, Transaction};
use crossbeam_channel::{select, Receiver};
use parking_lot::{Condvar, Mutex};
use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Transport to a remote observer.
pub trait Connection: Send + 'static {
    /// Serialize and write one event.
    fn send(&mut self, event: &Transaction) -> Result<(), DeliveryError>;

    /// Release the underlying transport. Called once, when the session ends.
    fn shutdown(&mut self) {}

    /// Handle that aborts an in-flight [`Connection::send`] from another
    /// thread. Without one, closing a session waits for the current write to
    /// finish on its own.
    fn interrupter(&self) -> Option<Interrupter> {
        None
    }
}

/// Aborts a blocked write on a connection. Invoked at most once, when the
/// owning session starts closing.
pub struct Interrupter(Box<dyn FnOnce() + Send>);

impl Interrupter {
    pub fn new(interrupt: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(interrupt))
    }

    fn interrupt(self) {
        (self.0)()
    }
}

/// Newline-delimited JSON over any writer.
pub struct JsonLines<W> {
    writer: W,
}

impl<W: Write> JsonLines<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send + 'static> Connection for JsonLines<W> {
    fn send(&mut self, event: &Transaction) -> Result<(), DeliveryError> {
        serde_json::to_writer(&mut self.writer, event)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// JSON lines over TCP with a bounded write time.
pub struct TcpObserver {
    lines: JsonLines<TcpStream>,
}

impl TcpObserver {
    pub fn new(stream: TcpStream, write_timeout: Duration) -> io::Result<Self> {
        stream.set_write_timeout(Some(write_timeout))?;
        stream.set_nodelay(true)?;
        Ok(Self {
            lines: JsonLines::new(stream),
        })
    }
}

impl Connection for TcpObserver {
    fn send(&mut self, event: &Transaction) -> Result<(), DeliveryError> {
        self.lines.send(event)
    }

    fn shutdown(&mut self) {
        let _ = self.lines.get_ref().shutdown(Shutdown::Both);
    }

    fn interrupter(&self) -> Option<Interrupter> {
        let stream = self.lines.get_ref().try_clone().ok()?;
        Some(Interrupter::new(move || {
            let _ = stream.shutdown(Shutdown::Both);
        }))
    }
}

/// Session lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

struct Shared {
    state: Mutex<SessionState>,
    closed: Condvar,
    /// Dropped on close to wake anything waiting on the subscription.
    canceller: Mutex<Option<Canceller>>,
    interrupter: Mutex<Option<Interrupter>>,
}

impl Shared {
    /// Move to `Closing`. Returns false if already closing or closed.
    fn begin_close(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            SessionState::Closing | SessionState::Closed => false,
            SessionState::Connecting | SessionState::Open => {
                *state = SessionState::Closing;
                if let Some(canceller) = self.canceller.lock().take() {
                    canceller.cancel();
                }
                if let Some(interrupter) = self.interrupter.lock().take() {
                    interrupter.interrupt();
                }
                true
            }
        }
    }

    fn finish_close(&self) {
        *self.state.lock() = SessionState::Closed;
        self.closed.notify_all();
    }
}

/// One observer connection subscribed to the event bus.
pub struct Session {
    id: SubscriberId,
    shared: Arc<Shared>,
    bus: Arc<EventBus>,
    worker: Option<JoinHandle<()>>,
}

impl Session {
    /// Subscribe `connection` to `bus` and start delivering events to it.
    pub fn open<C: Connection>(bus: &Arc<EventBus>, mut connection: C) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState::Connecting),
            closed: Condvar::new(),
            canceller: Mutex::new(None),
            interrupter: Mutex::new(connection.interrupter()),
        });

        let (handle, accepted) = bus.channel_subscription();
        let (id, events, canceller) = handle.into_parts();

        if !accepted {
            // Never registered, so never Open.
            warn!(%id, "event bus is shut down; session closed on open");
            *shared.state.lock() = SessionState::Closing;
            drop(shared.interrupter.lock().take());
            connection.shutdown();
            shared.finish_close();
            return Self {
                id,
                shared,
                bus: Arc::clone(bus),
                worker: None,
            };
        }

        let cancelled = canceller.signal();
        *shared.canceller.lock() = Some(canceller);
        *shared.state.lock() = SessionState::Open;

        let pump = Pump {
            id,
            events,
            cancelled,
            connection,
            shared: Arc::clone(&shared),
            bus: Arc::clone(bus),
        };

        let worker = match thread::Builder::new()
            .name(format!("registrar-session-{id}"))
            .spawn(move || pump.run())
        {
            Ok(handle) => {
                info!(%id, "session opened");
                Some(handle)
            }
            Err(e) => {
                warn!(%id, error = %e, "failed to spawn session pump");
                shared.begin_close();
                bus.unsubscribe(id);
                shared.finish_close();
                None
            }
        };

        Self {
            id,
            shared,
            bus: Arc::clone(bus),
            worker,
        }
    }

    /// Subscriber id of this session on the bus.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    /// Request shutdown. Returns immediately; safe to call any number of
    /// times from any thread.
    pub fn close(&self) {
        if self.shared.begin_close() {
            debug!(id = %self.id, "session close requested");
            self.bus.unsubscribe(self.id);
        }
    }

    /// Wait up to `timeout` for the session to reach `Closed`.
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        let mut state = self.shared.state.lock();
        if *state != SessionState::Closed {
            self.shared
                .closed
                .wait_while_for(&mut state, |s| *s != SessionState::Closed, timeout);
        }
        *state == SessionState::Closed
    }

    /// Close the session and wait for its connection to be released.
    pub fn join(mut self) {
        self.close();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(id = %self.id, "session pump panicked");
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Moves events from the subscription channel to the connection.
struct Pump<C> {
    id: SubscriberId,
    events: Receiver<Transaction>,
    cancelled: Receiver<()>,
    connection: C,
    shared: Arc<Shared>,
    bus: Arc<EventBus>,
}

impl<C: Connection> Pump<C> {
    fn run(self) {
        let Pump {
            id,
            events,
            cancelled,
            mut connection,
            shared,
            bus,
        } = self;

        loop {
            select! {
                recv(events) -> msg => match msg {
                    Ok(event) => {
                        if let Err(e) = connection.send(&event) {
                            warn!(%id, tx_id = %event.id, error = %e, "observer write failed");
                            break;
                        }
                    }
                    Err(_) => {
                        debug!(%id, "subscriber dropped by event bus");
                        break;
                    }
                },
                recv(cancelled) -> _ => break,
            }
        }

        shared.begin_close();
        bus.unsubscribe(id);
        drop(events);
        connection.shutdown();
        drop(connection);
        shared.finish_close();
        info!(%id, "session closed");
    }
}
