//! Correlated request/response sending.
//!
//! The wire protocol carries no request identifiers: a response belongs to
//! whichever request went out last. [`CorrelatedSender`] therefore holds an
//! exclusive async lock for the whole round trip, so at most one request is
//! ever awaiting a response, and correlates by arrival order. The response
//! waiter is armed *before* the bytes leave, closing the window where a fast
//! device could answer an unarmed sender.
//!
//! This is a protocol limitation, not a policy choice: without ids there is
//! nothing stronger to correlate on.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::codec::Message;
use crate::transport::{BleTransport, TransportError};

/// Serialises request/response round trips over one connection.
pub(crate) struct CorrelatedSender {
    transport: std::sync::Arc<dyn BleTransport>,
    /// Held for the full round trip of [`CorrelatedSender::send_and_wait`].
    send_lock: tokio::sync::Mutex<()>,
    /// Waiter for the next response frame, armed before the write.
    pending: Mutex<Option<oneshot::Sender<Message>>>,
}

impl CorrelatedSender {
    pub(crate) fn new(transport: std::sync::Arc<dyn BleTransport>) -> Self {
        Self {
            transport,
            send_lock: tokio::sync::Mutex::new(()),
            pending: Mutex::new(None),
        }
    }

    /// Send `message` and wait up to `timeout` for the next response frame.
    ///
    /// Returns `None` on write failure or timeout; both are logged with
    /// distinct messages. Concurrent callers queue on the send lock.
    pub(crate) async fn send_and_wait(
        &self,
        message: &Message,
        timeout: Duration,
    ) -> Option<Message> {
        let _round_trip = self.send_lock.lock().await;
        let (tx, rx) = oneshot::channel();
        self.arm(tx);
        if let Err(error) = self.transport.write(&message.encode()).await {
            self.disarm();
            tracing::warn!(
                msg_type = format_args!("{:#04x}", message.msg_type()),
                %error,
                "write failed, no response expected"
            );
            return None;
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Some(response),
            Ok(Err(_closed)) => {
                tracing::warn!(
                    msg_type = format_args!("{:#04x}", message.msg_type()),
                    "response waiter dropped before a response arrived"
                );
                None
            }
            Err(_elapsed) => {
                self.disarm();
                tracing::warn!(
                    msg_type = format_args!("{:#04x}", message.msg_type()),
                    timeout_ms = timeout.as_millis(),
                    "timed out waiting for response"
                );
                None
            }
        }
    }

    /// Send `message` without waiting for a response. Still queues on the
    /// send lock so writes cannot interleave with a pending round trip.
    pub(crate) async fn send(&self, message: &Message) -> Result<(), TransportError> {
        let _round_trip = self.send_lock.lock().await;
        self.transport.write(&message.encode()).await
    }

    /// Hand an inbound response frame to the armed waiter, if any.
    ///
    /// Called from the read path before the response fan-out, so the waiter
    /// always sees the frame first. Unclaimed responses are left for the
    /// response listeners alone.
    pub(crate) fn offer_response(&self, message: &Message) {
        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = waiter {
            // The waiter may have just timed out; that race loses quietly.
            let _ = tx.send(message.clone());
        }
    }

    /// Drop any armed waiter, waking it with a closed-channel error. Used on
    /// disconnect so a blocked round trip resolves to `None` promptly.
    pub(crate) fn abort_pending(&self) { self.disarm(); }

    fn arm(&self, tx: oneshot::Sender<Message>) {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
    }

    fn disarm(&self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}
