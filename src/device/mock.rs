//! In-memory transport for client-level tests.
//!
//! Records sends and physical subscription counts, lets tests inject
//! inbound traffic, and keeps a toy twin document so twin round trips
//! can be exercised without a broker.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::device::transport::{MethodDispatcher, Transport};
use crate::error::{Error, Result};
use crate::message::{Message, Qos};

pub(crate) struct MockTransport {
    connected: AtomicBool,
    closed: AtomicBool,
    hang_twin: AtomicBool,
    sent: StdMutex<Vec<Message>>,
    event_subs: AtomicUsize,
    twin_subs: AtomicUsize,
    event_sinks: StdMutex<Vec<mpsc::Sender<Message>>>,
    twin_sinks: StdMutex<Vec<mpsc::Sender<Vec<u8>>>>,
    dispatcher: StdMutex<Option<Arc<dyn MethodDispatcher>>>,
    reported: StdMutex<Value>,
    reported_version: AtomicUsize,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        MockTransport {
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            hang_twin: AtomicBool::new(false),
            sent: StdMutex::new(Vec::new()),
            event_subs: AtomicUsize::new(0),
            twin_subs: AtomicUsize::new(0),
            event_sinks: StdMutex::new(Vec::new()),
            twin_sinks: StdMutex::new(Vec::new()),
            dispatcher: StdMutex::new(None),
            reported: StdMutex::new(json!({})),
            reported_version: AtomicUsize::new(0),
        }
    }

    pub(crate) fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn event_subscriptions(&self) -> usize {
        self.event_subs.load(Ordering::SeqCst)
    }

    pub(crate) fn twin_subscriptions(&self) -> usize {
        self.twin_subs.load(Ordering::SeqCst)
    }

    /// Make twin requests block until their cancellation fires.
    pub(crate) fn hang_twin_requests(&self) {
        self.hang_twin.store(true, Ordering::SeqCst);
    }

    pub(crate) async fn push_event(&self, msg: Message) {
        let sinks = self.event_sinks.lock().unwrap().clone();
        for sink in sinks {
            _ = sink.send(msg.clone()).await;
        }
    }

    pub(crate) async fn push_twin_patch(&self, patch: Vec<u8>) {
        let sinks = self.twin_sinks.lock().unwrap().clone();
        for sink in sinks {
            _ = sink.send(patch.clone()).await;
        }
    }

    pub(crate) async fn invoke(&self, method: &str, payload: &[u8]) -> (i32, Vec<u8>) {
        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap()
            .clone()
            .expect("no dispatcher registered");
        dispatcher.dispatch(method, payload).await
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<()> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyConnected);
        }
        Ok(())
    }

    async fn send(&self, _ct: &CancellationToken, msg: &Message, _qos: Qos) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        self.sent.lock().unwrap().push(msg.clone());
        Ok(())
    }

    async fn subscribe_events(&self, sink: mpsc::Sender<Message>) -> Result<()> {
        self.event_subs.fetch_add(1, Ordering::SeqCst);
        self.event_sinks.lock().unwrap().push(sink);
        Ok(())
    }

    async fn subscribe_twin_updates(&self, sink: mpsc::Sender<Vec<u8>>) -> Result<()> {
        self.twin_subs.fetch_add(1, Ordering::SeqCst);
        self.twin_sinks.lock().unwrap().push(sink);
        Ok(())
    }

    async fn register_direct_methods(&self, dispatcher: Arc<dyn MethodDispatcher>) -> Result<()> {
        *self.dispatcher.lock().unwrap() = Some(dispatcher);
        Ok(())
    }

    async fn retrieve_twin(&self, ct: &CancellationToken) -> Result<Vec<u8>> {
        if self.hang_twin.load(Ordering::SeqCst) {
            ct.cancelled().await;
            return Err(Error::Cancelled);
        }
        let mut reported = self.reported.lock().unwrap().clone();
        let version = self.reported_version.load(Ordering::SeqCst);
        if let Value::Object(map) = &mut reported {
            map.insert("$version".into(), json!(version));
        }
        let doc = json!({ "desired": { "$version": 1 }, "reported": reported });
        Ok(serde_json::to_vec(&doc).unwrap())
    }

    async fn update_twin(&self, ct: &CancellationToken, patch: &[u8]) -> Result<u64> {
        if self.hang_twin.load(Ordering::SeqCst) {
            ct.cancelled().await;
            return Err(Error::Cancelled);
        }
        let patch: Value = serde_json::from_slice(patch)
            .map_err(|e| Error::Protocol(format!("invalid twin patch: {e}")))?;
        let mut reported = self.reported.lock().unwrap();
        if let (Value::Object(current), Value::Object(patch)) = (&mut *reported, patch) {
            for (key, value) in patch {
                if value.is_null() {
                    current.remove(&key);
                } else {
                    current.insert(key, value);
                }
            }
        }
        let version = self.reported_version.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(version as u64)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
