//! Incremental stream framer over fragmented transport notifications.
//!
//! BLE notifications carry arbitrary slices of the frame stream: a single
//! notification may hold several frames, a fraction of one, or garbage from a
//! corrupted link. [`StreamFramer::feed`] absorbs each slice into a carry-over
//! buffer, decodes every complete frame it can, and hands them to a
//! [`FrameSink`] classified as event or response.
//!
//! Corruption never stops the stream. When the buffer head cannot begin a
//! valid frame the framer discards exactly one byte and retries, walking
//! forward until it finds a frame boundary again. Every corruption event
//! increments a monotonic counter so callers can observe link quality.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BytesMut};

use crate::codec::{self, DecodeError, Message};
use crate::metrics;

/// Default carry-over cap. Far above the 65,535-byte maximum legal frame, so
/// only a stream that never resynchronises can reach it.
pub const DEFAULT_MAX_BUFFER: usize = 128 * 1024;

/// Tuning knobs for [`StreamFramer`].
#[derive(Clone, Copy, Debug)]
pub struct FramerConfig {
    /// Carry-over buffer cap in bytes. When an incomplete frame would hold
    /// more than this, the whole buffer is dropped and counted as an
    /// overflow.
    pub max_buffer: usize,
}

impl Default for FramerConfig {
    fn default() -> Self {
        Self {
            max_buffer: DEFAULT_MAX_BUFFER,
        }
    }
}

/// A corruption event observed while framing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FramingErrorKind {
    /// The byte at the buffer head could not begin a frame and was dropped.
    Resync { byte: u8 },
    /// A frame header named a message type this crate does not know.
    UnknownMessageType { msg_type: u8 },
    /// A full frame was present but its trailer did not match its contents.
    CrcMismatch { computed: u16, received: u16 },
    /// The carry-over buffer exceeded its cap and was discarded wholesale.
    BufferOverflow { limit: usize, dropped: usize },
}

impl FramingErrorKind {
    const fn label(&self) -> &'static str {
        match self {
            Self::Resync { .. } => "resync",
            Self::UnknownMessageType { .. } => "unknown_type",
            Self::CrcMismatch { .. } => "crc_mismatch",
            Self::BufferOverflow { .. } => "buffer_overflow",
        }
    }
}

/// Monotonic counters for each corruption class. Shared with the session so
/// they survive reconnects.
#[derive(Debug, Default)]
pub struct CorruptionCounters {
    crc_errors: AtomicU64,
    resync_events: AtomicU64,
    unknown_message_types: AtomicU64,
    buffer_overflows: AtomicU64,
}

/// Point-in-time copy of [`CorruptionCounters`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CorruptionSnapshot {
    pub crc_errors: u64,
    pub resync_events: u64,
    pub unknown_message_types: u64,
    pub buffer_overflows: u64,
}

impl CorruptionCounters {
    /// Copy the current counter values.
    #[must_use]
    pub fn snapshot(&self) -> CorruptionSnapshot {
        CorruptionSnapshot {
            crc_errors: self.crc_errors.load(Ordering::Relaxed),
            resync_events: self.resync_events.load(Ordering::Relaxed),
            unknown_message_types: self.unknown_message_types.load(Ordering::Relaxed),
            buffer_overflows: self.buffer_overflows.load(Ordering::Relaxed),
        }
    }

    fn record(&self, kind: &FramingErrorKind) {
        let counter = match kind {
            FramingErrorKind::Resync { .. } => &self.resync_events,
            FramingErrorKind::UnknownMessageType { .. } => &self.unknown_message_types,
            FramingErrorKind::CrcMismatch { .. } => &self.crc_errors,
            FramingErrorKind::BufferOverflow { .. } => &self.buffer_overflows,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Receiver for framed output and corruption reports.
///
/// Implementations must not block: [`StreamFramer::feed`] calls them inline
/// from the read path.
pub trait FrameSink {
    /// A device-initiated message (type below the response subspace).
    fn event_frame(&self, message: Message);
    /// A response message, correlated to a prior request by arrival order.
    fn response_frame(&self, message: Message);
    /// A corruption event. The framer has already counted it and moved on.
    fn framing_error(&self, kind: &FramingErrorKind);
}

/// Carry-over framer. One per connection; not shared across tasks.
#[derive(Debug)]
pub struct StreamFramer {
    buf: BytesMut,
    config: FramerConfig,
    counters: Arc<CorruptionCounters>,
}

impl StreamFramer {
    #[must_use]
    pub fn new(config: FramerConfig, counters: Arc<CorruptionCounters>) -> Self {
        Self {
            buf: BytesMut::new(),
            config,
            counters,
        }
    }

    /// Bytes currently buffered awaiting the rest of a frame.
    #[must_use]
    pub fn carry_over_len(&self) -> usize { self.buf.len() }

    /// Shared corruption counters.
    #[must_use]
    pub fn counters(&self) -> &Arc<CorruptionCounters> { &self.counters }

    /// Absorb one transport notification and emit every frame it completes.
    pub fn feed<S: FrameSink + ?Sized>(&mut self, data: &[u8], sink: &S) {
        self.buf.extend_from_slice(data);
        while !self.buf.is_empty() {
            match codec::decode(&self.buf) {
                Ok((message, consumed)) => {
                    self.buf.advance(consumed);
                    metrics::frame_processed();
                    if message.is_response() {
                        sink.response_frame(message);
                    } else {
                        sink.event_frame(message);
                    }
                }
                Err(DecodeError::Incomplete { needed, available }) => {
                    if self.buf.len() > self.config.max_buffer {
                        self.overflow(sink);
                    } else {
                        tracing::trace!(needed, available, "awaiting rest of frame");
                    }
                    break;
                }
                Err(error) => self.resync(&error, sink),
            }
        }
    }

    fn overflow(&mut self, sink: &(impl FrameSink + ?Sized)) {
        let kind = FramingErrorKind::BufferOverflow {
            limit: self.config.max_buffer,
            dropped: self.buf.len(),
        };
        tracing::warn!(
            limit = self.config.max_buffer,
            dropped = self.buf.len(),
            "carry-over buffer overflow, dropping buffered bytes"
        );
        self.buf.clear();
        self.report(&kind, sink);
    }

    /// Drop the byte at the buffer head and report why.
    fn resync(&mut self, error: &DecodeError, sink: &(impl FrameSink + ?Sized)) {
        let byte = self.buf[0];
        let kind = match *error {
            DecodeError::UnknownType(msg_type) => {
                FramingErrorKind::UnknownMessageType { msg_type }
            }
            DecodeError::CrcMismatch { computed, received } => {
                FramingErrorKind::CrcMismatch { computed, received }
            }
            DecodeError::BadLength { .. }
            | DecodeError::Payload { .. }
            | DecodeError::Incomplete { .. } => FramingErrorKind::Resync { byte },
        };
        tracing::debug!(%error, byte = format_args!("{byte:#04x}"), "resynchronising stream");
        self.buf.advance(1);
        self.counters.resync_events.fetch_add(1, Ordering::Relaxed);
        self.report(&kind, sink);
    }

    fn report(&self, kind: &FramingErrorKind, sink: &(impl FrameSink + ?Sized)) {
        // Resync bumps its own counter in `resync`; avoid double counting.
        if !matches!(kind, FramingErrorKind::Resync { .. }) {
            self.counters.record(kind);
        }
        metrics::framing_error(kind.label());
        sink.framing_error(kind);
    }
}

#[cfg(test)]
mod tests;
