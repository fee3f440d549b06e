//! The service-side client.
//!
//! Operates against the hub's management surfaces: cloud-to-device
//! sends and feedback over the hub's own AMQP endpoint (authorized via
//! CBS token puts), device-to-cloud consumption through the redirected
//! event-hub endpoint, and direct-method invocation over REST.

use std::sync::Arc;

use fe2o3_amqp::connection::ConnectionHandle;
use fe2o3_amqp::session::SessionHandle;
use fe2o3_amqp::{Sender, Session};
use tokio::select;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::credentials::{Credentials, TOKEN_TTL};
use crate::error::{Error, Result};
use crate::message::{Message, SendOptions};

mod amqp;
mod eventhub;
mod feedback;
mod rest;

pub use feedback::Feedback;
pub use rest::{MethodCall, MethodResult};

const C2D_ADDRESS: &str = "/messages/devicebound";

struct Hub {
    connection: Arc<Mutex<ConnectionHandle<()>>>,
    // The session must stay alive for the sender link to work.
    _c2d_session: SessionHandle<()>,
    c2d_sender: Sender,
}

/// A client operating a hub from the service side.
pub struct ServiceClient {
    credentials: Credentials,
    rest: rest::RestClient,
    hub: Mutex<Option<Hub>>,
    cancellation: CancellationToken,
}

impl ServiceClient {
    /// Build a client from a service connection string
    /// (`HostName=…;SharedAccessKeyName=…;SharedAccessKey=…`).
    pub fn from_connection_string(s: &str) -> Result<Self> {
        let credentials = Credentials::from_connection_string(s)?;
        Ok(ServiceClient {
            rest: rest::RestClient::new(credentials.host_name(), credentials.clone()),
            credentials,
            hub: Mutex::new(None),
            cancellation: CancellationToken::new(),
        })
    }

    /// Open the hub AMQP connection: authorize through `$cbs`, attach
    /// the cloud-to-device sender, and start the token upkeep task.
    pub async fn connect(&self, ct: &CancellationToken) -> Result<()> {
        let mut hub = self.hub.lock().await;
        if hub.is_some() {
            return Err(Error::AlreadyConnected);
        }
        if self.cancellation.is_cancelled() {
            return Err(Error::Closed);
        }

        let host = self.credentials.host_name().to_string();
        let connect = async {
            let container_id = format!("iothub-service-{}", uuid::Uuid::new_v4());
            let mut connection = amqp::open_anonymous(&host, &container_id).await?;

            let token = self.credentials.token(&host, TOKEN_TTL)?;
            amqp::put_token(&mut connection, &host, &token).await?;

            let mut session = Session::begin(&mut connection)
                .await
                .map_err(|e| Error::network(e))?;
            let sender = Sender::attach(&mut session, "c2d-sender", C2D_ADDRESS)
                .await
                .map_err(|e| Error::network(e))?;
            Ok::<_, Error>((connection, session, sender))
        };

        let (connection, session, sender) = select! {
            result = connect => result?,
            _ = ct.cancelled() => return Err(Error::Cancelled),
        };

        let connection = Arc::new(Mutex::new(connection));
        amqp::spawn_token_upkeep(
            connection.clone(),
            self.credentials.clone(),
            host,
            self.cancellation.child_token(),
        );

        *hub = Some(Hub {
            connection,
            _c2d_session: session,
            c2d_sender: sender,
        });
        log::debug!("Service client is ready");
        Ok(())
    }

    /// Send a cloud-to-device message to `device_id`.
    pub async fn send_c2d(
        &self,
        ct: &CancellationToken,
        device_id: &str,
        payload: impl Into<Vec<u8>>,
        opts: SendOptions,
    ) -> Result<()> {
        let mut hub = self.hub.lock().await;
        let hub = hub.as_mut().ok_or(Error::NotConnected)?;

        let mut msg = Message::new(payload);
        opts.apply(&mut msg);
        if msg.to.is_none() {
            msg.to = Some(format!("/devices/{device_id}/messages/devicebound"));
        }
        let message = amqp::outbound_message(&msg, opts.ack);

        select! {
            outcome = hub.c2d_sender.send(message) => {
                amqp::expect_accepted(outcome.map_err(|e| Error::network(e))?)
            }
            _ = ct.cancelled() => Err(Error::Cancelled),
            _ = self.cancellation.cancelled() => Err(Error::Closed),
        }
    }

    /// Stream delivery-feedback records for acknowledged
    /// cloud-to-device messages.
    pub async fn subscribe_feedback(
        &self,
        _ct: &CancellationToken,
    ) -> Result<mpsc::Receiver<Feedback>> {
        let hub = self.hub.lock().await;
        let hub = hub.as_ref().ok_or(Error::NotConnected)?;
        let mut connection = hub.connection.lock().await;
        feedback::subscribe(&mut connection, self.cancellation.child_token()).await
    }

    /// Consume the device-to-cloud event stream: follow the hub's link
    /// redirect to the event-hub-compatible endpoint and read every
    /// partition in parallel, serializing all messages into `handler`.
    ///
    /// Runs until the scope is cancelled or a partition fails; the
    /// first error cancels all peers.
    pub async fn subscribe_events<F>(&self, ct: &CancellationToken, handler: F) -> Result<()>
    where
        F: FnMut(Message) + Send,
    {
        let redirect = {
            let hub = self.hub.lock().await;
            let hub = hub.as_ref().ok_or(Error::NotConnected)?;
            let mut connection = hub.connection.lock().await;
            eventhub::discover_redirect(&mut connection).await?
        };
        log::debug!(
            "Event stream redirected to {} ({})",
            redirect.host,
            redirect.group
        );
        eventhub::subscribe(&self.credentials, redirect, ct, handler).await
    }

    /// Invoke a direct method on a device over REST.
    pub async fn invoke_method(
        &self,
        ct: &CancellationToken,
        device_id: &str,
        call: &MethodCall,
    ) -> Result<MethodResult> {
        self.rest.invoke_method(ct, device_id, None, call).await
    }

    /// Invoke a direct method on a module of a device.
    pub async fn invoke_module_method(
        &self,
        ct: &CancellationToken,
        device_id: &str,
        module_id: &str,
        call: &MethodCall,
    ) -> Result<MethodResult> {
        self.rest
            .invoke_method(ct, device_id, Some(module_id), call)
            .await
    }

    /// Cancel all background work and close the hub connection.
    /// Idempotent.
    pub async fn close(&self) -> Result<()> {
        let mut hub = self.hub.lock().await;
        self.cancellation.cancel();
        if let Some(hub) = hub.take() {
            log::debug!("Closing service client");
            _ = hub.c2d_sender.close().await;
            let mut connection = hub.connection.lock().await;
            _ = connection.close().await;
        }
        Ok(())
    }
}
