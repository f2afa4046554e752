//! Chunked file download state machine.
//!
//! The device streams a requested file as [`Message::FileDataChunk`] frames
//! in strict offset order. [`FileReceiver`] owns a single transfer slot:
//! starting a download while one is active fails with
//! [`GetFileError::Busy`]. A transfer ends exactly once, whether it
//! completes, sees an out-of-order chunk, fails a sink write, or hits a
//! chunk or overall deadline; the finished callback consumes itself, so a
//! second invocation is unrepresentable.
//!
//! Timers race chunk arrival. The winner takes the whole transfer state out
//! of the slot under its mutex; whoever finds the slot empty walks away.

use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::codec::Message;
use crate::listener::{ListenerId, ResponseMessageListener};
use crate::session::{BodyLink, SessionError};

/// Chunk inter-arrival deadline applied when the request does not override
/// it.
pub const DEFAULT_CHUNK_TIMEOUT: Duration = Duration::from_secs(10);

/// Invoked once with the final outcome of a transfer.
pub type DoneCallback = Box<dyn FnOnce(TransferOutcome) + Send>;
/// Invoked with the file name and completion percentage as chunks land.
pub type ProgressCallback = Arc<dyn Fn(&str, f64) + Send + Sync>;

/// Why a transfer failed.
#[derive(Debug, Error)]
pub enum TransferError {
    /// A chunk arrived at the wrong offset; the stream is unrecoverable.
    #[error("chunk at offset {actual}, expected {expected}")]
    OutOfOrder { expected: u64, actual: u64 },
    /// No chunk arrived within the inter-chunk deadline.
    #[error("no chunk within {timeout:?}")]
    ChunkTimeout { timeout: Duration },
    /// The transfer as a whole exceeded its deadline.
    #[error("transfer exceeded {timeout:?}")]
    OverallTimeout { timeout: Duration },
    /// Writing received data to the sink failed.
    #[error("sink write: {0}")]
    Sink(#[from] std::io::Error),
}

/// Why a transfer could not be started.
#[derive(Debug, Error)]
pub enum GetFileError {
    /// Another transfer is already in flight.
    #[error("a file transfer is already in progress")]
    Busy,
    /// The request could not be sent.
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Parameters for one download.
pub struct TransferRequest {
    /// File name sent to the device.
    pub file_name: String,
    /// Total size the transfer is expected to deliver, in bytes.
    pub expected_length: u64,
    /// Optional destination for received bytes; returned in the outcome.
    pub sink: Option<Box<dyn Write + Send>>,
    /// Consumed with the final outcome, success or failure.
    pub done: DoneCallback,
    /// Optional progress observer.
    pub progress: Option<ProgressCallback>,
    /// Deadline between consecutive chunks.
    pub chunk_timeout: Duration,
    /// Optional deadline for the whole transfer.
    pub overall_timeout: Option<Duration>,
}

impl TransferRequest {
    /// Request with default timeouts, no sink and no progress observer.
    pub fn new(
        file_name: impl Into<String>,
        expected_length: u64,
        done: impl FnOnce(TransferOutcome) + Send + 'static,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            expected_length,
            sink: None,
            done: Box::new(done),
            progress: None,
            chunk_timeout: DEFAULT_CHUNK_TIMEOUT,
            overall_timeout: None,
        }
    }
}

/// Final state of a finished transfer.
pub struct TransferOutcome {
    pub file_name: String,
    /// Bytes delivered to the sink (or counted, if no sink was given).
    pub bytes_received: u64,
    /// The sink handed back to the caller, flushed but not closed.
    pub sink: Option<Box<dyn Write + Send>>,
    /// `None` on success.
    pub error: Option<TransferError>,
}

impl TransferOutcome {
    #[must_use]
    pub const fn is_success(&self) -> bool { self.error.is_none() }
}

struct ActiveTransfer {
    file_name: String,
    expected_length: u64,
    received: u64,
    sink: Option<Box<dyn Write + Send>>,
    done: DoneCallback,
    progress: Option<ProgressCallback>,
    chunk_timeout: Duration,
    chunk_deadline: Instant,
    generation: u64,
    watchers: CancellationToken,
}

#[derive(Default)]
struct Slot {
    active: Option<ActiveTransfer>,
    /// Distinguishes transfers across the slot's lifetime so a stale timer
    /// can never claim a newer transfer.
    generation: u64,
}

/// Single-slot download engine, registered as a response listener.
pub struct FileReceiver {
    link: BodyLink,
    slot: Mutex<Slot>,
    registration: Mutex<Option<ListenerId>>,
}

impl FileReceiver {
    /// Create a receiver and register it for response frames on `link`.
    #[must_use]
    pub fn attach(link: &BodyLink) -> Arc<Self> {
        let receiver = Arc::new(Self {
            link: link.clone(),
            slot: Mutex::new(Slot::default()),
            registration: Mutex::new(None),
        });
        let id = link.add_response_message_listener(receiver.clone());
        *lock(&receiver.registration) = Some(id);
        receiver
    }

    /// Unregister from the link. In-flight transfers keep running; call
    /// [`FileReceiver::cancel`] first to stop them.
    pub fn detach(&self) {
        if let Some(id) = lock(&self.registration).take() {
            self.link.discard_response_message_listener(id);
        }
    }

    /// Start downloading `request.file_name`.
    ///
    /// The transfer slot is armed and its watchdogs started before the
    /// request frame goes out, so a device that answers instantly is never
    /// racing an unarmed receiver.
    ///
    /// # Errors
    ///
    /// [`GetFileError::Busy`] when a transfer is already active, or
    /// [`GetFileError::Session`] when the request could not be sent (the
    /// slot is quietly released; the done callback is not invoked).
    pub async fn get_file(self: &Arc<Self>, request: TransferRequest) -> Result<(), GetFileError> {
        let message = Message::GetFile {
            file_name: request.file_name.clone(),
        };
        let (generation, watchers, overall_timeout) = {
            let mut slot = lock(&self.slot);
            if slot.active.is_some() {
                return Err(GetFileError::Busy);
            }
            slot.generation += 1;
            let generation = slot.generation;
            let watchers = CancellationToken::new();
            slot.active = Some(ActiveTransfer {
                file_name: request.file_name,
                expected_length: request.expected_length,
                received: 0,
                sink: request.sink,
                done: request.done,
                progress: request.progress,
                chunk_timeout: request.chunk_timeout,
                chunk_deadline: Instant::now() + request.chunk_timeout,
                generation,
                watchers: watchers.clone(),
            });
            (generation, watchers, request.overall_timeout)
        };

        tokio::spawn(Arc::clone(self).chunk_watcher(generation, watchers.clone()));
        if let Some(overall) = overall_timeout {
            tokio::spawn(Arc::clone(self).overall_watcher(generation, overall, watchers.clone()));
        }

        if let Err(error) = self.link.send_async(message).await {
            // Never started on the wire: release the slot without invoking
            // the done callback.
            watchers.cancel();
            let mut slot = lock(&self.slot);
            if slot
                .active
                .as_ref()
                .is_some_and(|active| active.generation == generation)
            {
                slot.active = None;
            }
            return Err(error.into());
        }

        if let Some(finished) = self.claim_if(|active| {
            active.generation == generation && active.expected_length == 0
        }) {
            finish(finished, None);
        }
        Ok(())
    }

    /// Abort the active transfer, if any, without invoking its callback.
    /// Returns whether a transfer was aborted.
    pub fn cancel(&self) -> bool {
        let claimed = {
            let mut slot = lock(&self.slot);
            slot.active.take()
        };
        match claimed {
            Some(active) => {
                active.watchers.cancel();
                tracing::debug!(file = %active.file_name, "transfer cancelled");
                true
            }
            None => false,
        }
    }

    /// Whether a transfer is currently in flight.
    #[must_use]
    pub fn is_busy(&self) -> bool { lock(&self.slot).active.is_some() }

    fn claim_if(&self, predicate: impl FnOnce(&ActiveTransfer) -> bool) -> Option<ActiveTransfer> {
        let mut slot = lock(&self.slot);
        if slot.active.as_ref().is_some_and(predicate) {
            slot.active.take()
        } else {
            None
        }
    }

    fn handle_chunk(&self, offset: u64, data: &[u8]) {
        enum Verdict {
            Continue(Option<(ProgressCallback, String, f64)>),
            Finished(ActiveTransfer, Option<TransferError>),
        }

        let verdict = {
            let mut slot = lock(&self.slot);
            let Some(active) = slot.active.as_mut() else {
                tracing::debug!(offset, "chunk with no transfer in flight, ignoring");
                return;
            };
            if offset != active.received {
                let error = TransferError::OutOfOrder {
                    expected: active.received,
                    actual: offset,
                };
                let finished = slot.active.take().expect("slot checked above");
                Verdict::Finished(finished, Some(error))
            } else if let Err(error) = active.absorb(data) {
                let finished = slot.active.take().expect("slot checked above");
                Verdict::Finished(finished, Some(error))
            } else if active.received >= active.expected_length {
                if active.received > active.expected_length {
                    tracing::warn!(
                        file = %active.file_name,
                        received = active.received,
                        expected = active.expected_length,
                        "transfer overshot its expected length"
                    );
                }
                let finished = slot.active.take().expect("slot checked above");
                Verdict::Finished(finished, None)
            } else {
                let report = active.progress.as_ref().map(|progress| {
                    (
                        Arc::clone(progress),
                        active.file_name.clone(),
                        active.percent(),
                    )
                });
                Verdict::Continue(report)
            }
        };

        // User callbacks run outside the slot lock.
        match verdict {
            Verdict::Continue(Some((progress, file_name, percent))) => {
                progress(&file_name, percent);
            }
            Verdict::Continue(None) => {}
            Verdict::Finished(active, error) => {
                // The completing chunk still reports progress, ahead of the
                // done callback.
                if error.is_none() {
                    if let Some(progress) = active.progress.as_ref() {
                        progress(&active.file_name, active.percent());
                    }
                }
                finish(active, error);
            }
        }
    }

    /// Fires the chunk deadline. The deadline moves forward with every
    /// chunk, so the watcher re-reads it after each sleep and only claims
    /// the transfer when the deadline it slept to is still the live one.
    async fn chunk_watcher(self: Arc<Self>, generation: u64, token: CancellationToken) {
        loop {
            let deadline = {
                let slot = lock(&self.slot);
                match slot.active.as_ref() {
                    Some(active) if active.generation == generation => active.chunk_deadline,
                    _ => return,
                }
            };
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep_until(deadline) => {}
            }
            let claimed = self.claim_if(|active| {
                active.generation == generation && active.chunk_deadline <= Instant::now()
            });
            if let Some(active) = claimed {
                let timeout = active.chunk_timeout;
                finish(active, Some(TransferError::ChunkTimeout { timeout }));
                return;
            }
        }
    }

    async fn overall_watcher(
        self: Arc<Self>,
        generation: u64,
        timeout: Duration,
        token: CancellationToken,
    ) {
        tokio::select! {
            () = token.cancelled() => return,
            () = tokio::time::sleep(timeout) => {}
        }
        let claimed = self.claim_if(|active| active.generation == generation);
        if let Some(active) = claimed {
            finish(active, Some(TransferError::OverallTimeout { timeout }));
        }
    }
}

impl ActiveTransfer {
    fn absorb(&mut self, data: &[u8]) -> Result<(), TransferError> {
        if let Some(sink) = self.sink.as_mut() {
            sink.write_all(data)?;
        }
        self.received += data.len() as u64;
        self.chunk_deadline = Instant::now() + self.chunk_timeout;
        Ok(())
    }

    fn percent(&self) -> f64 {
        if self.expected_length == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let ratio = self.received as f64 / self.expected_length as f64;
            (ratio * 100.0).min(100.0)
        }
    }
}

/// Tear down a claimed transfer and invoke its callback exactly once.
fn finish(mut active: ActiveTransfer, error: Option<TransferError>) {
    active.watchers.cancel();
    let error = match (error, active.sink.as_mut().map(Write::flush)) {
        (Some(error), _) => Some(error),
        (None, Some(Err(flush_error))) => Some(TransferError::Sink(flush_error)),
        (None, _) => None,
    };
    match &error {
        Some(error) => {
            tracing::warn!(file = %active.file_name, %error, "transfer failed");
        }
        None => {
            tracing::debug!(
                file = %active.file_name,
                bytes = active.received,
                "transfer complete"
            );
        }
    }
    let outcome = TransferOutcome {
        file_name: active.file_name,
        bytes_received: active.received,
        sink: active.sink,
        error,
    };
    (active.done)(outcome);
}

impl ResponseMessageListener for FileReceiver {
    fn response_message_received(&self, message: &Message) {
        if let Message::FileDataChunk {
            offset, file_data, ..
        } = message
        {
            self.handle_chunk(u64::from(*offset), file_data);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
