//! Client-side protocol engine for a wearable biosensor over BLE.
//!
//! `bodylink` speaks the device's framed binary protocol over a Nordic UART
//! transport: it reassembles frames from fragmented notifications,
//! correlates requests with responses by arrival order, downloads recorded
//! files chunk by chunk, and fans decoded attribute updates out to typed
//! observer callbacks.
//!
//! The entry point is [`BodyLink`]; plug in a [`transport::BleTransport`]
//! backend, connect, and register listeners:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use bodylink::{BodyLink, Reporter};
//!
//! # async fn run(transport: Arc<dyn bodylink::transport::BleTransport>) -> Result<(), Box<dyn std::error::Error>> {
//! let link = BodyLink::new(transport);
//! link.connect(None).await?;
//! let reporter = Reporter::attach(&link);
//! reporter.start_heartrate_reporting(1).await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod dispatcher;
pub mod framer;
pub mod listener;
pub mod metrics;
pub mod reporter;
mod sender;
pub mod session;
pub mod transfer;
pub mod transport;

pub use codec::{DecodeError, Message, PulseSample};
pub use dispatcher::{AttributeDispatcher, AttributeListener};
pub use framer::{CorruptionSnapshot, FramerConfig, FramingErrorKind};
pub use listener::{
    BleMessageListener, ConnectionListener, FramingErrorListener, ListenerId, MessageListener,
    ResponseMessageListener,
};
pub use reporter::Reporter;
pub use session::{BodyLink, SessionConfig, SessionError};
pub use transfer::{
    FileReceiver, GetFileError, TransferError, TransferOutcome, TransferRequest,
};
pub use transport::{BleTransport, TransportError};
