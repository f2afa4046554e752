//! Metric helpers for `bodylink`.
//!
//! Metric names and small helper functions wrapping the
//! [`metrics`](https://docs.rs/metrics) crate. Compiled to no-ops when the
//! `metrics` feature is disabled.

/// Name of the gauge tracking active device connections.
pub const CONNECTIONS_ACTIVE: &str = "bodylink_connections_active";
/// Name of the counter tracking decoded frames.
pub const FRAMES_PROCESSED: &str = "bodylink_frames_processed_total";
/// Name of the counter tracking framing corruption events, by kind.
pub const FRAMING_ERRORS: &str = "bodylink_framing_errors_total";

/// Increment the active connections gauge.
pub fn inc_connections() {
    #[cfg(feature = "metrics")]
    metrics::gauge!(CONNECTIONS_ACTIVE).increment(1.0);
}

/// Decrement the active connections gauge.
pub fn dec_connections() {
    #[cfg(feature = "metrics")]
    metrics::gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record one successfully decoded frame.
pub fn frame_processed() {
    #[cfg(feature = "metrics")]
    metrics::counter!(FRAMES_PROCESSED).increment(1);
}

/// Record a framing corruption event.
#[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
pub fn framing_error(kind: &'static str) {
    #[cfg(feature = "metrics")]
    metrics::counter!(FRAMING_ERRORS, "kind" => kind).increment(1);
}
