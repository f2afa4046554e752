//! Transport boundary: the BLE collaborator the engine drives.
//!
//! The engine is transport-agnostic above this trait. A production backend
//! wraps a platform BLE stack speaking the Nordic UART Service; tests plug
//! in an in-memory mock. Inbound traffic arrives as notification payloads on
//! the channel returned by [`BleTransport::subscribe`]; closing that channel
//! signals an unsolicited disconnect.

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// Nordic UART Service UUID advertised by the device.
pub const UART_SERVICE_UUID: &str = "6E400001-B5A3-F393-E0A9-E50E24DCCA9E";
/// Characteristic the client writes frames to.
pub const UART_RX_CHAR_UUID: &str = "6E400002-B5A3-F393-E0A9-E50E24DCCA9E";
/// Characteristic the device notifies frames on.
pub const UART_TX_CHAR_UUID: &str = "6E400003-B5A3-F393-E0A9-E50E24DCCA9E";

/// Failures surfaced by a transport backend.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The named device was not found during scanning.
    #[error("device {0:?} not found")]
    DeviceNotFound(String),
    /// No connection is established.
    #[error("not connected")]
    NotConnected,
    /// The backend reported an I/O or stack failure.
    #[error("transport backend: {0}")]
    Backend(String),
}

/// Asynchronous BLE transport the session drives.
///
/// One transport serves at most one connection at a time; the session never
/// calls `connect` while connected.
#[async_trait::async_trait]
pub trait BleTransport: Send + Sync {
    /// Scan for advertising devices and return their names.
    async fn scan(&self) -> Result<Vec<String>, TransportError>;

    /// Connect to the named device.
    async fn connect(&self, device_name: &str) -> Result<(), TransportError>;

    /// Write one encoded frame to the device.
    async fn write(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Subscribe to inbound notifications. The receiver yields raw
    /// notification payloads; it closes when the link drops.
    async fn subscribe(&self) -> Result<mpsc::Receiver<Bytes>, TransportError>;

    /// Tear down the connection. Idempotent.
    async fn disconnect(&self);

    /// Whether a connection is currently established.
    fn is_connected(&self) -> bool;
}
