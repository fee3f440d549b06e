//! The device-side client.
//!
//! Composes credentials, a transport, and the three fan-out muxes into
//! the high-level API. The client is cheap to clone; all clones share
//! one connection and one lifecycle.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::select;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::message::{Message, SendOptions};
use crate::twin::TwinState;

pub(crate) mod mux;
pub mod mqtt;
pub mod transport;

#[cfg(test)]
mod mock;

pub use mqtt::{MqttTransport, TransportOptions};
pub use mux::{EventStream, TwinUpdateStream};
pub use transport::{MethodDispatcher, Transport};

use mux::{FanOut, MethodMux};

/// Buffer between a transport stream and the mux pump.
const PUMP_BUFFER: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    New,
    Connecting,
    Ready,
    Failed,
    Closed,
}

struct Inner {
    transport: Arc<dyn Transport>,
    events: Arc<FanOut<Message>>,
    twin_updates: Arc<FanOut<Vec<u8>>>,
    methods: Arc<MethodMux>,
    state: watch::Sender<State>,
    connect_error: StdMutex<Option<Error>>,
    connect_lock: Mutex<()>,
    cancellation: CancellationToken,
}

/// A client connected to the hub as a single device (or module).
#[derive(Clone)]
pub struct DeviceClient {
    inner: Arc<Inner>,
}

impl DeviceClient {
    /// Build a client over the MQTT transport from a device connection
    /// string.
    pub fn from_connection_string(s: &str) -> Result<Self> {
        DeviceClientBuilder::from_connection_string(s)?.build()
    }

    /// Build a client over a caller-supplied transport.
    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        let (state, _) = watch::channel(State::New);
        DeviceClient {
            inner: Arc::new(Inner {
                transport,
                events: Arc::new(FanOut::new()),
                twin_updates: Arc::new(FanOut::new()),
                methods: Arc::new(MethodMux::new()),
                state,
                connect_error: StdMutex::new(None),
                connect_lock: Mutex::new(()),
                cancellation: CancellationToken::new(),
            }),
        }
    }

    /// Establish the transport session. A second call is rejected with
    /// [`Error::AlreadyConnected`].
    pub async fn connect(&self, ct: &CancellationToken) -> Result<()> {
        let _guard = self.inner.connect_lock.lock().await;
        match *self.inner.state.borrow() {
            State::New => {}
            State::Closed => return Err(Error::Closed),
            _ => return Err(Error::AlreadyConnected),
        }
        if ct.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.inner.state.send_replace(State::Connecting);
        match self.inner.transport.connect().await {
            Ok(()) => {
                log::debug!("Device client is ready");
                self.inner.state.send_replace(State::Ready);
                Ok(())
            }
            Err(e) => {
                *self.inner.connect_error.lock().unwrap() = Some(e.clone());
                self.inner.state.send_replace(State::Failed);
                Err(e)
            }
        }
    }

    /// Wait until the client is ready, or fail fast on a terminal
    /// state.
    async fn check_connection(&self, ct: &CancellationToken) -> Result<()> {
        let mut state = self.inner.state.subscribe();
        loop {
            match *state.borrow_and_update() {
                State::Ready => return Ok(()),
                State::New => return Err(Error::NotConnected),
                State::Closed => return Err(Error::Closed),
                State::Failed => {
                    let err = self.inner.connect_error.lock().unwrap().clone();
                    return Err(err.unwrap_or(Error::NotConnected));
                }
                State::Connecting => {}
            }
            select! {
                _ = ct.cancelled() => return Err(Error::Cancelled),
                changed = state.changed() => {
                    if changed.is_err() {
                        return Err(Error::Closed);
                    }
                }
            }
        }
    }

    /// Publish a device-to-cloud message built from `payload` and the
    /// send options.
    pub async fn send(
        &self,
        ct: &CancellationToken,
        payload: impl Into<Vec<u8>>,
        opts: SendOptions,
    ) -> Result<()> {
        self.check_connection(ct).await?;
        let mut msg = Message::new(payload);
        opts.apply(&mut msg);
        self.inner.transport.send(ct, &msg, opts.qos).await
    }

    /// Subscribe to cloud-to-device messages. Any number of
    /// subscribers may coexist; the first one triggers the physical
    /// subscription.
    pub async fn subscribe_events(&self, ct: &CancellationToken) -> Result<EventStream> {
        self.check_connection(ct).await?;
        let sub = self.inner.events.subscribe().await;

        let result = self
            .inner
            .events
            .latch
            .call(|| async {
                let (tx, rx) = mpsc::channel(PUMP_BUFFER);
                self.inner.transport.subscribe_events(tx).await?;
                spawn_pump(rx, self.inner.events.clone(), self.inner.cancellation.clone());
                Ok(())
            })
            .await;

        if let Err(e) = result {
            self.inner.events.unsubscribe(sub.id()).await;
            return Err(e);
        }
        Ok(sub)
    }

    /// Drop one event subscription by handle.
    pub async fn unsubscribe_events(&self, sub: &EventStream) {
        self.inner.events.unsubscribe(sub.id()).await;
    }

    /// Subscribe to twin desired-state patches (raw JSON bytes).
    pub async fn subscribe_twin_updates(&self, ct: &CancellationToken) -> Result<TwinUpdateStream> {
        self.check_connection(ct).await?;
        let sub = self.inner.twin_updates.subscribe().await;

        let result = self
            .inner
            .twin_updates
            .latch
            .call(|| async {
                let (tx, rx) = mpsc::channel(PUMP_BUFFER);
                self.inner.transport.subscribe_twin_updates(tx).await?;
                spawn_pump(
                    rx,
                    self.inner.twin_updates.clone(),
                    self.inner.cancellation.clone(),
                );
                Ok(())
            })
            .await;

        if let Err(e) = result {
            self.inner.twin_updates.unsubscribe(sub.id()).await;
            return Err(e);
        }
        Ok(sub)
    }

    /// Drop one twin-update subscription by handle.
    pub async fn unsubscribe_twin_updates(&self, sub: &TwinUpdateStream) {
        self.inner.twin_updates.unsubscribe(sub.id()).await;
    }

    /// Register a direct-method handler under `name`. The handler's
    /// `Ok` maps to status 200, `Err` to 500.
    pub async fn register_method<F>(
        &self,
        ct: &CancellationToken,
        name: &str,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(&[u8]) -> anyhow::Result<Vec<u8>> + Send + Sync + 'static,
    {
        self.check_connection(ct).await?;
        self.inner.methods.register(name, Arc::new(handler)).await?;

        let dispatcher = self.inner.methods.clone();
        let result = self
            .inner
            .methods
            .latch
            .call(|| async {
                self.inner
                    .transport
                    .register_direct_methods(dispatcher)
                    .await
            })
            .await;

        if let Err(e) = result {
            self.inner.methods.unregister(name).await;
            return Err(e);
        }
        Ok(())
    }

    /// Remove a previously registered direct-method handler.
    pub async fn unregister_method(&self, name: &str) {
        self.inner.methods.unregister(name).await;
    }

    /// Fetch the full twin document.
    pub async fn retrieve_twin(&self, ct: &CancellationToken) -> Result<TwinState> {
        self.check_connection(ct).await?;
        let payload = self.inner.transport.retrieve_twin(ct).await?;
        TwinState::parse(&payload)
    }

    /// Patch the reported twin half; returns the new version.
    pub async fn update_twin(
        &self,
        ct: &CancellationToken,
        patch: serde_json::Value,
    ) -> Result<u64> {
        self.check_connection(ct).await?;
        let payload = serde_json::to_vec(&patch)
            .map_err(|e| Error::Config(format!("unserializable twin patch: {e}")))?;
        self.inner.transport.update_twin(ct, &payload).await
    }

    /// Close the client: cancel every outstanding operation, terminate
    /// the subscriptions, and release the transport. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let _guard = self.inner.connect_lock.lock().await;
        if *self.inner.state.borrow() == State::Closed {
            return Ok(());
        }
        log::debug!("Closing device client");
        self.inner.state.send_replace(State::Closed);
        self.inner.cancellation.cancel();
        self.inner.events.shutdown(Some(Error::Closed)).await;
        self.inner.twin_updates.shutdown(Some(Error::Closed)).await;
        self.inner.transport.close().await
    }
}

fn spawn_pump<T: Clone + Send + 'static>(
    mut rx: mpsc::Receiver<T>,
    mux: Arc<FanOut<T>>,
    cancellation: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            select! {
                _ = cancellation.cancelled() => break,
                item = rx.recv() => match item {
                    Some(item) => mux.dispatch(item).await,
                    None => break,
                }
            }
        }
    });
}

/// Configures and builds a [`DeviceClient`] over the MQTT transport.
pub struct DeviceClientBuilder {
    credentials: Credentials,
    options: TransportOptions,
}

impl DeviceClientBuilder {
    pub fn new(credentials: Credentials) -> Self {
        DeviceClientBuilder {
            credentials,
            options: TransportOptions::default(),
        }
    }

    pub fn from_connection_string(s: &str) -> Result<Self> {
        Ok(Self::new(Credentials::from_connection_string(s)?))
    }

    /// Connect over WebSockets instead of raw TLS.
    pub fn with_websocket(mut self, use_websocket: bool) -> Self {
        self.options.use_websocket = use_websocket;
        self
    }

    /// Announce a model ID in the connection username.
    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.options.model_id = Some(model_id.into());
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.options.keep_alive = keep_alive;
        self
    }

    pub fn build(self) -> Result<DeviceClient> {
        let transport = MqttTransport::new(self.credentials, self.options)?;
        Ok(DeviceClient::with_transport(Arc::new(transport)))
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockTransport;
    use super::*;
    use serde_json::json;

    fn client() -> (DeviceClient, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new());
        (DeviceClient::with_transport(transport.clone()), transport)
    }

    #[tokio::test]
    async fn connect_rejects_second_call() {
        let (client, _) = client();
        let ct = CancellationToken::new();
        client.connect(&ct).await.unwrap();
        let err = client.connect(&ct).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyConnected));
    }

    #[tokio::test]
    async fn operations_require_connection() {
        let (client, _) = client();
        let ct = CancellationToken::new();
        let err = client
            .send(&ct, b"x".to_vec(), SendOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (client, transport) = client();
        let ct = CancellationToken::new();
        client.connect(&ct).await.unwrap();
        client.close().await.unwrap();
        client.close().await.unwrap();
        assert!(transport.is_closed());

        let err = client
            .send(&ct, b"x".to_vec(), SendOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Closed));
    }

    #[tokio::test]
    async fn repeated_subscribes_share_one_physical_subscription() {
        let (client, transport) = client();
        let ct = CancellationToken::new();
        client.connect(&ct).await.unwrap();

        let mut subs = Vec::new();
        for _ in 0..3 {
            subs.push(client.subscribe_events(&ct).await.unwrap());
        }
        assert_eq!(transport.event_subscriptions(), 1);

        // Fan-out completeness: one inbound message reaches all three.
        let mut msg = Message::new(b"c2d".to_vec());
        msg.message_id = Some("m1".into());
        transport.push_event(msg).await;

        for sub in &mut subs {
            let received = sub.recv().await.unwrap();
            assert_eq!(received.message_id.as_deref(), Some("m1"));
            assert_eq!(received.payload, b"c2d");
        }
    }

    #[tokio::test]
    async fn send_applies_options_before_transport() {
        let (client, transport) = client();
        let ct = CancellationToken::new();
        client.connect(&ct).await.unwrap();

        client
            .send(
                &ct,
                b"payload".to_vec(),
                SendOptions::new().message_id("mid").property("k", "v"),
            )
            .await
            .unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message_id.as_deref(), Some("mid"));
        assert_eq!(sent[0].properties.get("k").map(String::as_str), Some("v"));
    }

    #[tokio::test]
    async fn method_handlers_dispatch_by_name() {
        let (client, transport) = client();
        let ct = CancellationToken::new();
        client.connect(&ct).await.unwrap();

        client
            .register_method(&ct, "echo", |payload| Ok(payload.to_vec()))
            .await
            .unwrap();
        let err = client
            .register_method(&ct, "echo", |_| Ok(Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered(_)));

        let (status, body) = transport.invoke("echo", b"ping").await;
        assert_eq!((status, body), (200, b"ping".to_vec()));

        let (status, _) = transport.invoke("absent", b"").await;
        assert_eq!(status, 0);
    }

    #[tokio::test]
    async fn twin_round_trip_shape() {
        let (client, _) = client();
        let ct = CancellationToken::new();
        client.connect(&ct).await.unwrap();

        let version = client
            .update_twin(&ct, json!({"ts": "1234"}))
            .await
            .unwrap();

        let twin = client.retrieve_twin(&ct).await.unwrap();
        assert_eq!(twin.reported.get("ts"), Some(&json!("1234")));
        assert_eq!(twin.reported_version(), Some(version));
    }

    #[tokio::test]
    async fn twin_updates_fan_out() {
        let (client, transport) = client();
        let ct = CancellationToken::new();
        client.connect(&ct).await.unwrap();

        let mut sub_a = client.subscribe_twin_updates(&ct).await.unwrap();
        let mut sub_b = client.subscribe_twin_updates(&ct).await.unwrap();
        assert_eq!(transport.twin_subscriptions(), 1);

        transport.push_twin_patch(br#"{"a":1,"$version":2}"#.to_vec()).await;
        assert_eq!(sub_a.recv().await.unwrap(), br#"{"a":1,"$version":2}"#);
        assert_eq!(sub_b.recv().await.unwrap(), br#"{"a":1,"$version":2}"#);
    }

    #[tokio::test]
    async fn cancellation_interrupts_blocking_operations() {
        let (client, transport) = client();
        transport.hang_twin_requests();
        let ct = CancellationToken::new();
        client.connect(&ct).await.unwrap();

        let op_ct = CancellationToken::new();
        let handle = {
            let client = client.clone();
            let op_ct = op_ct.clone();
            tokio::spawn(async move { client.retrieve_twin(&op_ct).await })
        };

        op_ct.cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery_to_that_handle_only() {
        let (client, transport) = client();
        let ct = CancellationToken::new();
        client.connect(&ct).await.unwrap();

        let sub_a = client.subscribe_events(&ct).await.unwrap();
        let mut sub_b = client.subscribe_events(&ct).await.unwrap();
        client.unsubscribe_events(&sub_a).await;

        transport.push_event(Message::new(b"one".to_vec())).await;
        assert_eq!(sub_b.recv().await.unwrap().payload, b"one");
    }
}
