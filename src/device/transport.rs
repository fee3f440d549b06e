use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::message::{Message, Qos};

/// Receives direct-method invocations routed up from a transport.
///
/// The dispatcher returns the status code and response payload to
/// publish back. Handler failures are its own concern; it must not
/// panic.
#[async_trait]
pub trait MethodDispatcher: Send + Sync {
    async fn dispatch(&self, method: &str, payload: &[u8]) -> (i32, Vec<u8>);
}

/// The uniform contract between a device client and a concrete
/// transport.
///
/// A transport owns the physical session and demuxes the four inbound
/// streams. Subscriptions are one physical subscription per stream no
/// matter how many sinks attach; sinks receive every message that
/// arrives after they were registered, with no replay.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the session. Rejects a second call with
    /// [`Error::AlreadyConnected`](crate::Error::AlreadyConnected).
    async fn connect(&self) -> Result<()>;

    /// Publish a device-to-cloud message at the given QoS.
    async fn send(&self, ct: &CancellationToken, msg: &Message, qos: Qos) -> Result<()>;

    /// Attach a sink for cloud-to-device messages. The first call
    /// issues the physical subscription.
    async fn subscribe_events(&self, sink: mpsc::Sender<Message>) -> Result<()>;

    /// Attach a sink for twin desired-state patches (raw JSON bytes).
    async fn subscribe_twin_updates(&self, sink: mpsc::Sender<Vec<u8>>) -> Result<()>;

    /// Register the direct-method dispatcher and subscribe to
    /// invocations. At most one dispatcher per transport.
    async fn register_direct_methods(&self, dispatcher: Arc<dyn MethodDispatcher>) -> Result<()>;

    /// Correlated twin GET; returns the full twin JSON document.
    async fn retrieve_twin(&self, ct: &CancellationToken) -> Result<Vec<u8>>;

    /// Correlated reported-properties PATCH; returns the new version.
    async fn update_twin(&self, ct: &CancellationToken, patch: &[u8]) -> Result<u64>;

    /// Disconnect and release resources. Idempotent.
    async fn close(&self) -> Result<()>;
}
