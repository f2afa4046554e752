//! Shared test harness: an in-memory BLE transport.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bodylink::codec::Message;
use bodylink::transport::{BleTransport, TransportError};
use bytes::Bytes;
use tokio::sync::mpsc;

/// Produces notification payloads to inject in reply to a written frame.
pub type Responder = Box<dyn Fn(&[u8]) -> Vec<Message> + Send + Sync>;

/// In-memory transport double. Writes are recorded; notifications are
/// injected by the test or synthesised by an optional responder.
pub struct MockTransport {
    devices: Vec<String>,
    connected: AtomicBool,
    fail_writes: AtomicBool,
    writes: Mutex<Vec<Vec<u8>>>,
    notif_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    responder: Mutex<Option<Responder>>,
}

impl MockTransport {
    pub fn new(devices: &[&str]) -> Arc<Self> {
        init_tracing();
        Arc::new(Self {
            devices: devices.iter().map(|&d| d.to_owned()).collect(),
            connected: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            writes: Mutex::new(Vec::new()),
            notif_tx: Mutex::new(None),
            responder: Mutex::new(None),
        })
    }

    /// Transport advertising one device named `G3_TEST`.
    pub fn single_device() -> Arc<Self> { Self::new(&["G3_TEST"]) }

    /// Reply to every written frame with the messages `f` produces.
    pub fn set_responder(&self, f: impl Fn(&[u8]) -> Vec<Message> + Send + Sync + 'static) {
        *self.responder.lock().expect("responder lock") = Some(Box::new(f));
    }

    /// Make subsequent writes fail.
    pub fn fail_writes(&self, fail: bool) { self.fail_writes.store(fail, Ordering::SeqCst); }

    /// Frames written by the engine so far.
    pub fn written(&self) -> Vec<Vec<u8>> { self.writes.lock().expect("writes lock").clone() }

    pub fn write_count(&self) -> usize { self.writes.lock().expect("writes lock").len() }

    /// Deliver one encoded message as a single notification.
    pub async fn inject_frame(&self, message: &Message) {
        self.inject_bytes(&message.encode()).await;
    }

    /// Deliver raw bytes as a single notification.
    pub async fn inject_bytes(&self, data: &[u8]) {
        let tx = self
            .notif_tx
            .lock()
            .expect("notif lock")
            .clone()
            .expect("subscribed");
        tx.send(Bytes::copy_from_slice(data)).await.expect("inject");
    }

    /// Simulate the device dropping the link: closes the notification
    /// stream.
    pub fn fire_disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.notif_tx.lock().expect("notif lock").take();
    }

    fn push_responses(&self, written: &[u8]) {
        let responses = {
            let responder = self.responder.lock().expect("responder lock");
            responder.as_ref().map(|f| f(written))
        };
        let Some(responses) = responses else { return };
        let tx = self.notif_tx.lock().expect("notif lock").clone();
        let Some(tx) = tx else { return };
        for message in responses {
            tx.try_send(Bytes::from(message.encode())).expect("inject response");
        }
    }
}

#[async_trait::async_trait]
impl BleTransport for MockTransport {
    async fn scan(&self) -> Result<Vec<String>, TransportError> { Ok(self.devices.clone()) }

    async fn connect(&self, device_name: &str) -> Result<(), TransportError> {
        if !self.devices.iter().any(|d| d == device_name) {
            return Err(TransportError::DeviceNotFound(device_name.to_owned()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Backend("injected write failure".to_owned()));
        }
        self.writes.lock().expect("writes lock").push(data.to_vec());
        self.push_responses(data);
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<Bytes>, TransportError> {
        let (tx, rx) = mpsc::channel(64);
        *self.notif_tx.lock().expect("notif lock") = Some(tx);
        Ok(rx)
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.notif_tx.lock().expect("notif lock").take();
    }

    fn is_connected(&self) -> bool { self.connected.load(Ordering::SeqCst) }
}

/// Route engine tracing to the test writer. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Let spawned tasks (reader, workers, watchers) run until they go idle.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}
