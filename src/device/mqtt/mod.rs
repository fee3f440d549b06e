//! MQTT realization of the device transport.
//!
//! One TCP session carries four concurrent inbound streams
//! (cloud-to-device messages, direct-method invocations, twin desired
//! patches, twin responses); a background router demuxes them by topic
//! prefix. Subscriptions are recorded in an ordered replay list because
//! the broker forgets them across reconnects.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, MqttOptions, QoS, SubscribeFilter, TlsConfiguration, Transport as MqttSessionTransport};
use tokio::select;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::credentials::{Credentials, TokenRefresher};
use crate::device::mux::SubscribeOnce;
use crate::device::transport::{MethodDispatcher, Transport};
use crate::error::{Error, Result};
use crate::message::{Message, Qos};

pub(crate) mod correlator;
mod eventloop;
pub(crate) mod properties;
pub(crate) mod topics;

use correlator::Correlator;
use eventloop::Router;

const API_VERSION: &str = "2020-09-30";
const TLS_PORT: u16 = 8883;
const WEBSOCKET_PORT: u16 = 443;

/// Deadline for a single publish to be accepted by the session.
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for a correlated twin request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Capacity of the session's request queue and of the per-stream
/// inbound channels.
const INBOUND_BUFFER: usize = 10;

/// Tunables of the MQTT transport beyond the credentials.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Connect over `wss://{host}:443/$iothub/websocket` instead of
    /// raw TLS on 8883.
    pub use_websocket: bool,
    /// Optional model ID announced in the username.
    pub model_id: Option<String>,
    pub keep_alive: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        TransportOptions {
            use_websocket: false,
            model_id: None,
            keep_alive: Duration::from_secs(5 * 60),
        }
    }
}

/// State shared between the transport surface and the router task.
pub(super) struct Shared {
    pub(super) device_id: String,
    pub(super) c2d_prefix: String,
    pub(super) correlator: Correlator,
    pub(super) event_sinks: StdMutex<Vec<mpsc::Sender<Message>>>,
    pub(super) twin_sinks: StdMutex<Vec<mpsc::Sender<Vec<u8>>>>,
    pub(super) dispatcher: StdMutex<Option<Arc<dyn MethodDispatcher>>>,
    /// Ordered replay list; the router re-subscribes all of it on every
    /// CONNACK.
    pub(super) sticky: StdMutex<Vec<SubscribeFilter>>,
}

/// The MQTT device transport.
pub struct MqttTransport {
    credentials: Credentials,
    options: TransportOptions,
    client_id: String,
    shared: Arc<Shared>,
    active: Mutex<Option<AsyncClient>>,
    events_latch: SubscribeOnce,
    twin_patch_latch: SubscribeOnce,
    twin_res_latch: SubscribeOnce,
    methods_latch: SubscribeOnce,
    cancellation: CancellationToken,
}

impl MqttTransport {
    pub fn new(credentials: Credentials, options: TransportOptions) -> Result<Self> {
        let device_id = credentials
            .device_id()
            .ok_or_else(|| Error::Config("device transport requires a device ID".into()))?
            .to_string();
        let client_id = match credentials.module_id() {
            Some(module_id) => format!("{device_id}/{module_id}"),
            None => device_id.clone(),
        };

        Ok(MqttTransport {
            shared: Arc::new(Shared {
                c2d_prefix: topics::c2d_prefix(&device_id),
                device_id,
                correlator: Correlator::new(),
                event_sinks: StdMutex::new(Vec::new()),
                twin_sinks: StdMutex::new(Vec::new()),
                dispatcher: StdMutex::new(None),
                sticky: StdMutex::new(Vec::new()),
            }),
            credentials,
            options,
            client_id,
            active: Mutex::new(None),
            events_latch: SubscribeOnce::new(),
            twin_patch_latch: SubscribeOnce::new(),
            twin_res_latch: SubscribeOnce::new(),
            methods_latch: SubscribeOnce::new(),
            cancellation: CancellationToken::new(),
        })
    }

    async fn client(&self) -> Result<AsyncClient> {
        if self.cancellation.is_cancelled() {
            return Err(Error::Closed);
        }
        self.active
            .lock()
            .await
            .clone()
            .ok_or(Error::NotConnected)
    }

    fn username(&self) -> String {
        let mut username = format!(
            "{}/{}/api-version={API_VERSION}",
            self.credentials.host_name(),
            self.client_id
        );
        if let Some(model_id) = &self.options.model_id {
            username.push_str("&model-id=");
            username.push_str(&urlencoding::encode(model_id));
        }
        username
    }

    fn tls_configuration(&self) -> Result<TlsConfiguration> {
        match &self.credentials {
            Credentials::SharedAccessKey { .. } => Ok(TlsConfiguration::Native),
            Credentials::X509 {
                cert_pem, key_pem, ..
            } => {
                let identity = native_tls::Identity::from_pkcs8(cert_pem, key_pem)
                    .map_err(|e| Error::Auth(format!("unable to load certificate: {e}")))?;
                let connector = native_tls::TlsConnector::builder()
                    .identity(identity)
                    .build()
                    .map_err(|e| Error::Auth(format!("unable to build TLS connector: {e}")))?;
                Ok(TlsConfiguration::NativeConnector(connector))
            }
        }
    }

    fn push_sticky(&self, path: String) {
        self.shared.sticky.lock().unwrap().push(SubscribeFilter {
            path,
            qos: QoS::AtLeastOnce,
        });
    }

    /// Issue the physical subscription for one inbound stream and put
    /// it on the replay list.
    async fn subscribe_filter(&self, client: &AsyncClient, path: String) -> Result<()> {
        self.push_sticky(path.clone());
        client.subscribe(path, QoS::AtLeastOnce).await?;
        Ok(())
    }

    /// Publish a correlated twin request and wait for its response,
    /// selecting over cancellation, shutdown, and the deadline.
    async fn twin_request(
        &self,
        ct: &CancellationToken,
        topic: String,
        rid: u32,
        rx: tokio::sync::oneshot::Receiver<correlator::TwinResponse>,
        payload: Vec<u8>,
    ) -> Result<correlator::TwinResponse> {
        let client = self.client().await?;
        if let Err(e) = client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
        {
            self.shared.correlator.unregister(rid);
            return Err(e.into());
        }

        select! {
            response = rx => match response {
                Ok(response) if (200..300).contains(&response.status) => Ok(response),
                Ok(response) => Err(Error::Request(response.status)),
                Err(_) => Err(Error::Closed),
            },
            _ = ct.cancelled() => {
                self.shared.correlator.unregister(rid);
                Err(Error::Cancelled)
            }
            _ = self.cancellation.cancelled() => {
                self.shared.correlator.unregister(rid);
                Err(Error::Closed)
            }
            _ = tokio::time::sleep(REQUEST_TIMEOUT) => {
                self.shared.correlator.unregister(rid);
                Err(Error::Timeout)
            }
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(Error::AlreadyConnected);
        }
        if self.cancellation.is_cancelled() {
            return Err(Error::Closed);
        }

        let host = self.credentials.host_name();
        let (password, token_watch) = match &self.credentials {
            Credentials::SharedAccessKey { .. } => {
                let resource = format!("{host}/devices/{}", self.shared.device_id);
                let refresher = TokenRefresher::start(
                    self.credentials.clone(),
                    resource,
                    self.cancellation.child_token(),
                )?;
                let watch = refresher.watch();
                let token = watch.borrow().clone();
                (token, Some(watch))
            }
            // x509 authenticates in the TLS handshake; the password
            // stays empty.
            Credentials::X509 { .. } => (String::new(), None),
        };

        let mut options = if self.options.use_websocket {
            MqttOptions::new(
                &self.client_id,
                format!("wss://{host}:{WEBSOCKET_PORT}/$iothub/websocket"),
                WEBSOCKET_PORT,
            )
        } else {
            MqttOptions::new(&self.client_id, host, TLS_PORT)
        };
        options.set_keep_alive(self.options.keep_alive);
        options.set_clean_session(true);
        options.set_credentials(self.username(), password);

        let tls = self.tls_configuration()?;
        options.set_transport(if self.options.use_websocket {
            MqttSessionTransport::Wss(tls)
        } else {
            MqttSessionTransport::Tls(tls)
        });

        log::debug!(
            "Connecting to {host} as {} (websocket: {})",
            self.client_id,
            self.options.use_websocket
        );

        let (client, eventloop) = AsyncClient::new(options, INBOUND_BUFFER);
        let router = Router::new(
            eventloop,
            client.clone(),
            self.shared.clone(),
            token_watch,
            self.cancellation.clone(),
        );
        tokio::spawn(router.run());

        *active = Some(client);
        Ok(())
    }

    async fn send(&self, ct: &CancellationToken, msg: &Message, qos: Qos) -> Result<()> {
        let client = self.client().await?;
        let bag = properties::encode_bag(msg);
        let topic = topics::events_topic(&self.shared.device_id, &bag);
        let qos = match qos {
            Qos::AtMostOnce => QoS::AtMostOnce,
            Qos::AtLeastOnce => QoS::AtLeastOnce,
        };

        select! {
            result = tokio::time::timeout(
                WRITE_TIMEOUT,
                client.publish(topic, qos, false, msg.payload.clone()),
            ) => match result {
                Ok(result) => result.map_err(Into::into),
                Err(_) => Err(Error::Timeout),
            },
            _ = ct.cancelled() => Err(Error::Cancelled),
            _ = self.cancellation.cancelled() => Err(Error::Closed),
        }
    }

    async fn subscribe_events(&self, sink: mpsc::Sender<Message>) -> Result<()> {
        let client = self.client().await?;
        self.shared.event_sinks.lock().unwrap().push(sink);
        self.events_latch
            .call(|| self.subscribe_filter(&client, topics::c2d_filter(&self.shared.device_id)))
            .await
    }

    async fn subscribe_twin_updates(&self, sink: mpsc::Sender<Vec<u8>>) -> Result<()> {
        let client = self.client().await?;
        self.shared.twin_sinks.lock().unwrap().push(sink);
        self.twin_patch_latch
            .call(|| {
                self.subscribe_filter(&client, topics::TWIN_PATCH_DESIRED_FILTER.to_string())
            })
            .await
    }

    async fn register_direct_methods(&self, dispatcher: Arc<dyn MethodDispatcher>) -> Result<()> {
        let client = self.client().await?;
        {
            let mut slot = self.shared.dispatcher.lock().unwrap();
            if slot.is_some() {
                return Err(Error::AlreadyRegistered("direct method dispatcher".into()));
            }
            *slot = Some(dispatcher);
        }
        self.methods_latch
            .call(|| self.subscribe_filter(&client, topics::METHODS_FILTER.to_string()))
            .await
    }

    async fn retrieve_twin(&self, ct: &CancellationToken) -> Result<Vec<u8>> {
        let client = self.client().await?;
        // The response topic is subscribed lazily, on the first twin
        // request of the connection.
        self.twin_res_latch
            .call(|| self.subscribe_filter(&client, topics::TWIN_RES_FILTER.to_string()))
            .await?;

        let (rid, rx) = self.shared.correlator.register();
        let response = self
            .twin_request(ct, topics::twin_get_topic(rid), rid, rx, Vec::new())
            .await?;
        Ok(response.payload)
    }

    async fn update_twin(&self, ct: &CancellationToken, patch: &[u8]) -> Result<u64> {
        let client = self.client().await?;
        self.twin_res_latch
            .call(|| self.subscribe_filter(&client, topics::TWIN_RES_FILTER.to_string()))
            .await?;

        let (rid, rx) = self.shared.correlator.register();
        let response = self
            .twin_request(ct, topics::twin_patch_topic(rid), rid, rx, patch.to_vec())
            .await?;
        response
            .version
            .ok_or_else(|| Error::Protocol("twin update response misses $version".into()))
    }

    async fn close(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        self.cancellation.cancel();
        if let Some(client) = active.take() {
            log::debug!("Disconnecting MQTT session");
            _ = client.disconnect().await;
        }
        self.shared.correlator.abort_all();
        Ok(())
    }
}
