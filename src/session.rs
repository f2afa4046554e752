//! Session facade tying transport, framer, sender and listeners together.
//!
//! [`BodyLink`] is the crate's front door. It owns the transport handle and
//! the listener hub for its whole lifetime; each connection gets a fresh
//! framer, a fresh correlated sender and a reader task that drains the
//! transport's notification channel into the framer. Corruption counters
//! live at the session level so they accumulate across reconnects.
//!
//! The handle is cheap to clone and every method takes `&self`; the session
//! is meant to be shared across tasks.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::codec::Message;
use crate::framer::{
    CorruptionCounters, CorruptionSnapshot, FrameSink, FramerConfig, FramingErrorKind, StreamFramer,
};
use crate::listener::{
    BleMessageListener, ConnectionListener, FramingErrorListener, ListenerHub, ListenerId,
    MessageListener, ResponseMessageListener,
};
use crate::metrics;
use crate::sender::CorrelatedSender;
use crate::transport::{BleTransport, TransportError};

/// Session tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct SessionConfig {
    /// Stream framer settings for each connection.
    pub framer: FramerConfig,
    /// Capacity of the decoded-event dispatch queue.
    pub event_queue_capacity: usize,
    /// Capacity of the raw-notification dispatch queue.
    pub ble_queue_capacity: usize,
    /// Response deadline used by [`BodyLink::send`].
    pub default_send_timeout: Duration,
    /// Scan deadline used when connecting without a device name.
    pub scan_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            framer: FramerConfig::default(),
            event_queue_capacity: 256,
            ble_queue_capacity: 64,
            default_send_timeout: Duration::from_secs(5),
            scan_timeout: Duration::from_secs(3),
        }
    }
}

/// Failures surfaced by the session facade.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A send or transfer was attempted with no active link.
    #[error("not connected")]
    NotConnected,
    /// Scanning found no advertising device to connect to.
    #[error("no advertising device found")]
    DeviceNotFound,
    /// The transport backend failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

struct ActiveLink {
    device_name: String,
    sender: Arc<CorrelatedSender>,
    reader_stop: CancellationToken,
}

struct SessionInner {
    config: SessionConfig,
    transport: Arc<dyn BleTransport>,
    hub: Arc<ListenerHub>,
    counters: Arc<CorruptionCounters>,
    link: Mutex<Option<ActiveLink>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

/// Shared handle to one device session.
#[derive(Clone)]
pub struct BodyLink {
    inner: Arc<SessionInner>,
}

impl BodyLink {
    /// Session with default configuration.
    #[must_use]
    pub fn new(transport: Arc<dyn BleTransport>) -> Self {
        Self::with_config(transport, SessionConfig::default())
    }

    /// Session with explicit configuration. Spawns the dispatch workers;
    /// call from within a tokio runtime.
    #[must_use]
    pub fn with_config(transport: Arc<dyn BleTransport>, config: SessionConfig) -> Self {
        let (hub, event_rx, ble_rx) =
            ListenerHub::new(config.event_queue_capacity, config.ble_queue_capacity);
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        tracker.spawn(Arc::clone(&hub).run_event_worker(event_rx, shutdown.clone()));
        tracker.spawn(Arc::clone(&hub).run_ble_worker(ble_rx, shutdown.clone()));
        Self {
            inner: Arc::new(SessionInner {
                config,
                transport,
                hub,
                counters: Arc::new(CorruptionCounters::default()),
                link: Mutex::new(None),
                tracker,
                shutdown,
            }),
        }
    }

    /// Connect to `device_name`, or scan and take the first advertising
    /// device when none is given. An existing connection is torn down
    /// first.
    ///
    /// # Errors
    ///
    /// [`SessionError::DeviceNotFound`] when scanning yields nothing, or a
    /// transport error from connecting or subscribing.
    pub async fn connect(&self, device_name: Option<&str>) -> Result<(), SessionError> {
        if self.is_connected() {
            self.disconnect().await;
        }
        let device_name = match device_name {
            Some(name) => name.to_owned(),
            None => self
                .list_available_devices(self.inner.config.scan_timeout)
                .await?
                .into_iter()
                .next()
                .ok_or(SessionError::DeviceNotFound)?,
        };
        self.inner.transport.connect(&device_name).await?;
        let notifications = match self.inner.transport.subscribe().await {
            Ok(rx) => rx,
            Err(error) => {
                self.inner.transport.disconnect().await;
                return Err(error.into());
            }
        };

        let sender = Arc::new(CorrelatedSender::new(Arc::clone(&self.inner.transport)));
        let framer = StreamFramer::new(self.inner.config.framer, Arc::clone(&self.inner.counters));
        let reader_stop = self.inner.shutdown.child_token();
        *lock(&self.inner.link) = Some(ActiveLink {
            device_name: device_name.clone(),
            sender: Arc::clone(&sender),
            reader_stop: reader_stop.clone(),
        });

        self.inner.tracker.spawn(read_loop(
            Arc::clone(&self.inner),
            notifications,
            framer,
            LinkSink {
                hub: Arc::clone(&self.inner.hub),
                sender,
            },
            reader_stop,
        ));

        metrics::inc_connections();
        tracing::info!(device = %device_name, "connected");
        self.inner.hub.dispatch_connection(true);
        Ok(())
    }

    /// Tear down the active connection. No-op when not connected.
    pub async fn disconnect(&self) {
        let Some(active) = lock(&self.inner.link).take() else {
            return;
        };
        active.reader_stop.cancel();
        active.sender.abort_pending();
        self.inner.transport.disconnect().await;
        metrics::dec_connections();
        tracing::info!(device = %active.device_name, "disconnected");
        self.inner.hub.dispatch_connection(false);
    }

    /// Send `message` and wait for the next response with the configured
    /// default deadline.
    ///
    /// Returns `None` on timeout or write failure.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotConnected`] when no link is active.
    pub async fn send(&self, message: Message) -> Result<Option<Message>, SessionError> {
        self.send_with_timeout(message, self.inner.config.default_send_timeout)
            .await
    }

    /// [`BodyLink::send`] with an explicit response deadline.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotConnected`] when no link is active.
    pub async fn send_with_timeout(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<Option<Message>, SessionError> {
        let sender = self.current_sender()?;
        Ok(sender.send_and_wait(&message, timeout).await)
    }

    /// Send `message` without waiting for a response.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotConnected`] when no link is active, or the
    /// transport write failure.
    pub async fn send_async(&self, message: Message) -> Result<(), SessionError> {
        let sender = self.current_sender()?;
        sender.send(&message).await.map_err(Into::into)
    }

    /// Scan for advertising devices, returning what was seen before
    /// `timeout`.
    ///
    /// # Errors
    ///
    /// Propagates transport scan failures.
    pub async fn list_available_devices(
        &self,
        timeout: Duration,
    ) -> Result<Vec<String>, SessionError> {
        match tokio::time::timeout(timeout, self.inner.transport.scan()).await {
            Ok(result) => result.map_err(Into::into),
            Err(_elapsed) => {
                tracing::debug!(timeout_ms = timeout.as_millis(), "scan deadline elapsed");
                Ok(Vec::new())
            }
        }
    }

    /// Whether a link is currently active.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        lock(&self.inner.link).is_some() && self.inner.transport.is_connected()
    }

    /// Name of the connected device, if any.
    #[must_use]
    pub fn connected_device(&self) -> Option<String> {
        lock(&self.inner.link)
            .as_ref()
            .map(|active| active.device_name.clone())
    }

    /// Corruption counters accumulated since the session was created.
    #[must_use]
    pub fn corruption_counters(&self) -> CorruptionSnapshot { self.inner.counters.snapshot() }

    /// Disconnect, stop the workers and wait for background tasks to drain.
    pub async fn shutdown(&self) {
        self.disconnect().await;
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.hub.clear();
        tracing::debug!("session shut down");
    }

    pub fn add_message_listener(&self, listener: Arc<dyn MessageListener>) -> ListenerId {
        self.inner.hub.message_listeners.add(listener)
    }

    pub fn discard_message_listener(&self, id: ListenerId) -> bool {
        self.inner.hub.message_listeners.discard(id)
    }

    pub fn add_response_message_listener(
        &self,
        listener: Arc<dyn ResponseMessageListener>,
    ) -> ListenerId {
        self.inner.hub.response_listeners.add(listener)
    }

    pub fn discard_response_message_listener(&self, id: ListenerId) -> bool {
        self.inner.hub.response_listeners.discard(id)
    }

    pub fn add_ble_message_listener(&self, listener: Arc<dyn BleMessageListener>) -> ListenerId {
        self.inner.hub.ble_listeners.add(listener)
    }

    pub fn discard_ble_message_listener(&self, id: ListenerId) -> bool {
        self.inner.hub.ble_listeners.discard(id)
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) -> ListenerId {
        self.inner.hub.connection_listeners.add(listener)
    }

    pub fn discard_connection_listener(&self, id: ListenerId) -> bool {
        self.inner.hub.connection_listeners.discard(id)
    }

    pub fn add_framing_error_listener(
        &self,
        listener: Arc<dyn FramingErrorListener>,
    ) -> ListenerId {
        self.inner.hub.framing_error_listeners.add(listener)
    }

    pub fn discard_framing_error_listener(&self, id: ListenerId) -> bool {
        self.inner.hub.framing_error_listeners.discard(id)
    }

    fn current_sender(&self) -> Result<Arc<CorrelatedSender>, SessionError> {
        lock(&self.inner.link)
            .as_ref()
            .map(|active| Arc::clone(&active.sender))
            .ok_or(SessionError::NotConnected)
    }
}

/// Connects the framer's output to the hub, giving the correlated sender
/// first look at every response frame.
struct LinkSink {
    hub: Arc<ListenerHub>,
    sender: Arc<CorrelatedSender>,
}

impl FrameSink for LinkSink {
    fn event_frame(&self, message: Message) { self.hub.dispatch_event(message); }

    fn response_frame(&self, message: Message) {
        self.sender.offer_response(&message);
        self.hub.dispatch_response(&message);
    }

    fn framing_error(&self, kind: &FramingErrorKind) { self.hub.dispatch_framing_error(kind); }
}

async fn read_loop(
    inner: Arc<SessionInner>,
    mut notifications: mpsc::Receiver<Bytes>,
    mut framer: StreamFramer,
    sink: LinkSink,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            maybe = notifications.recv() => match maybe {
                Some(data) => {
                    inner.hub.dispatch_ble(data.clone());
                    framer.feed(&data, &sink);
                }
                None => {
                    // A deliberate disconnect cancels `stop` before closing
                    // the stream; only an unsolicited drop tears the link
                    // down from here.
                    if !stop.is_cancelled() {
                        tracing::info!("transport closed the notification stream");
                        on_link_lost(&inner).await;
                    }
                    break;
                }
            },
        }
    }
    tracing::debug!("reader stopped");
}

/// Unsolicited link drop, observed by the reader. Mirrors
/// [`BodyLink::disconnect`] but runs from the reader task itself.
async fn on_link_lost(inner: &Arc<SessionInner>) {
    let Some(active) = lock(&inner.link).take() else {
        return;
    };
    active.sender.abort_pending();
    inner.transport.disconnect().await;
    metrics::dec_connections();
    inner.hub.dispatch_connection(false);
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
