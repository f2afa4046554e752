//! Listener traits, registries and dispatch plumbing.
//!
//! Observers register against a [`ListenerHub`] and receive callbacks for
//! decoded events, responses, raw transport notifications, connection state
//! changes and framing corruption. Event and raw-notification dispatch is
//! decoupled from the read path through bounded queues drained by worker
//! tasks; a full queue drops the newest item with a warning rather than
//! stalling the reader. Response, connection and corruption callbacks are
//! delivered inline because senders and transfers depend on their timing.
//!
//! A panicking listener never takes the engine down: every callback runs
//! under [`std::panic::catch_unwind`] and a panic only removes that call's
//! effect, with the payload logged.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::codec::Message;
use crate::framer::FramingErrorKind;

/// Observer for device-initiated event messages.
pub trait MessageListener: Send + Sync {
    fn message_received(&self, message: &Message);
}

/// Observer for response messages.
pub trait ResponseMessageListener: Send + Sync {
    fn response_message_received(&self, message: &Message);
}

/// Observer for raw transport notifications, before framing.
pub trait BleMessageListener: Send + Sync {
    fn ble_message_received(&self, data: &[u8]);
}

/// Observer for connection state changes.
pub trait ConnectionListener: Send + Sync {
    fn on_connected(&self, connected: bool);
}

/// Observer for framing corruption events.
pub trait FramingErrorListener: Send + Sync {
    fn framing_error(&self, kind: &FramingErrorKind);
}

/// Opaque handle returned by `add_*_listener`, used to discard the listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Registry for one listener category.
///
/// Listeners are stored by id; iteration order is unspecified. Dispatch
/// walks a snapshot, so adding or discarding listeners from inside a
/// callback is safe and takes effect from the next dispatch.
pub(crate) struct ListenerSet<T: ?Sized> {
    entries: DashMap<u64, Arc<T>>,
    next_id: AtomicU64,
}

impl<T: ?Sized> Default for ListenerSet<T> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T: ?Sized> ListenerSet<T> {
    pub(crate) fn add(&self, listener: Arc<T>) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(id, listener);
        ListenerId(id)
    }

    /// Remove a listener; returns whether it was still registered.
    pub(crate) fn discard(&self, id: ListenerId) -> bool {
        self.entries.remove(&id.0).is_some()
    }

    pub(crate) fn clear(&self) { self.entries.clear(); }

    pub(crate) fn is_empty(&self) -> bool { self.entries.is_empty() }

    fn snapshot(&self) -> Vec<Arc<T>> {
        self.entries.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Run `f` for every registered listener, isolating panics.
    pub(crate) fn for_each(&self, context: &'static str, f: impl Fn(&T)) {
        for listener in self.snapshot() {
            isolated(context, || f(&listener));
        }
    }
}

fn panic_payload(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned())
}

/// Run `f`, turning a panic into an error log.
fn isolated(context: &'static str, f: impl FnOnce()) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        tracing::error!(
            context,
            panic = %panic_payload(payload.as_ref()),
            "listener panicked; continuing"
        );
    }
}

/// Central fan-out point for every listener category.
pub(crate) struct ListenerHub {
    pub(crate) message_listeners: ListenerSet<dyn MessageListener>,
    pub(crate) response_listeners: ListenerSet<dyn ResponseMessageListener>,
    pub(crate) ble_listeners: ListenerSet<dyn BleMessageListener>,
    pub(crate) connection_listeners: ListenerSet<dyn ConnectionListener>,
    pub(crate) framing_error_listeners: ListenerSet<dyn FramingErrorListener>,
    event_tx: mpsc::Sender<Message>,
    ble_tx: mpsc::Sender<Bytes>,
}

impl ListenerHub {
    /// Build the hub plus the receiver ends of its dispatch queues. The
    /// caller spawns [`ListenerHub::run_event_worker`] and
    /// [`ListenerHub::run_ble_worker`] with them.
    pub(crate) fn new(
        event_capacity: usize,
        ble_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Message>, mpsc::Receiver<Bytes>) {
        let (event_tx, event_rx) = mpsc::channel(event_capacity);
        let (ble_tx, ble_rx) = mpsc::channel(ble_capacity);
        let hub = Arc::new(Self {
            message_listeners: ListenerSet::default(),
            response_listeners: ListenerSet::default(),
            ble_listeners: ListenerSet::default(),
            connection_listeners: ListenerSet::default(),
            framing_error_listeners: ListenerSet::default(),
            event_tx,
            ble_tx,
        });
        (hub, event_rx, ble_rx)
    }

    /// Queue a device event for the event worker. Drops with a warning when
    /// the queue is full so a slow listener cannot stall the read path.
    pub(crate) fn dispatch_event(&self, message: Message) {
        match self.event_tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                tracing::warn!(
                    msg_type = format_args!("{:#04x}", message.msg_type()),
                    "event queue full, dropping message"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("event worker gone, dropping message");
            }
        }
    }

    /// Queue raw notification bytes for the BLE worker.
    pub(crate) fn dispatch_ble(&self, data: Bytes) {
        if self.ble_listeners.is_empty() {
            return;
        }
        match self.ble_tx.try_send(data) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("ble queue full, dropping notification");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("ble worker gone, dropping notification");
            }
        }
    }

    /// Deliver a response inline. The correlated sender is notified by the
    /// caller before this fan-out.
    pub(crate) fn dispatch_response(&self, message: &Message) {
        self.response_listeners
            .for_each("response listener", |l| l.response_message_received(message));
    }

    pub(crate) fn dispatch_connection(&self, connected: bool) {
        self.connection_listeners
            .for_each("connection listener", |l| l.on_connected(connected));
    }

    pub(crate) fn dispatch_framing_error(&self, kind: &FramingErrorKind) {
        self.framing_error_listeners
            .for_each("framing error listener", |l| l.framing_error(kind));
    }

    /// Drain the event queue until shutdown.
    pub(crate) async fn run_event_worker(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Message>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                maybe = rx.recv() => {
                    let Some(message) = maybe else { break };
                    self.message_listeners
                        .for_each("message listener", |l| l.message_received(&message));
                }
            }
        }
        tracing::debug!("event worker stopped");
    }

    /// Drain the raw-notification queue until shutdown.
    pub(crate) async fn run_ble_worker(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Bytes>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                maybe = rx.recv() => {
                    let Some(data) = maybe else { break };
                    self.ble_listeners
                        .for_each("ble listener", |l| l.ble_message_received(&data));
                }
            }
        }
        tracing::debug!("ble worker stopped");
    }

    pub(crate) fn clear(&self) {
        self.message_listeners.clear();
        self.response_listeners.clear();
        self.ble_listeners.clear();
        self.connection_listeners.clear();
        self.framing_error_listeners.clear();
    }
}
