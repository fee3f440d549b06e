use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, Outgoing, Packet, Publish, QoS};
use tokio::select;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::correlator::TwinResponse;
use super::{properties, topics, Shared};

/// Ceiling of the reconnect backoff.
const MAX_RECONNECT_INTERVAL: Duration = Duration::from_secs(30);

/// Drives the MQTT session and demuxes inbound publishes to the
/// per-stream sinks.
///
/// The session library reconnects on the next poll after an error; the
/// router adds exponential backoff, refreshes the password from the
/// token watch, and replays the sticky subscriptions on every CONNACK.
pub(super) struct Router {
    eventloop: rumqttc::EventLoop,
    client: AsyncClient,
    shared: Arc<Shared>,
    token_watch: Option<watch::Receiver<String>>,
    cancellation: CancellationToken,
}

impl Router {
    pub(super) fn new(
        eventloop: rumqttc::EventLoop,
        client: AsyncClient,
        shared: Arc<Shared>,
        token_watch: Option<watch::Receiver<String>>,
        cancellation: CancellationToken,
    ) -> Self {
        Router {
            eventloop,
            client,
            shared,
            token_watch,
            cancellation,
        }
    }

    pub(super) async fn run(mut self) {
        let mut backoff = Duration::from_secs(1);
        loop {
            select! {
                _ = self.cancellation.cancelled() => {
                    log::debug!("Stopping MQTT router because of cancellation");
                    break;
                }
                notification = self.eventloop.poll() => match notification {
                    Ok(event) => {
                        backoff = Duration::from_secs(1);
                        self.process_event(event).await;
                    }
                    Err(e) => {
                        log::warn!("MQTT connection error: {e}");
                        self.refresh_credentials();
                        select! {
                            _ = self.cancellation.cancelled() => break,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(MAX_RECONNECT_INTERVAL);
                    }
                }
            }
        }
        self.shared.correlator.abort_all();
        log::debug!("MQTT router stopped");
    }

    /// Swap in the latest SAS token so the next CONNECT authenticates.
    fn refresh_credentials(&mut self) {
        let Some(token_watch) = &mut self.token_watch else {
            return;
        };
        if !token_watch.has_changed().unwrap_or(false) {
            return;
        }
        let token = token_watch.borrow_and_update().clone();
        if let Some((username, _)) = self.eventloop.mqtt_options.credentials() {
            log::debug!("Reconnecting with a refreshed SAS token");
            self.eventloop.mqtt_options.set_credentials(username, token);
        }
    }

    async fn process_event(&mut self, event: Event) {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                log::debug!("Connected (session present: {})", ack.session_present);
                resubscribe(&self.client, &self.shared).await;
            }
            Event::Incoming(Packet::Publish(publish)) => self.route(publish),
            Event::Incoming(packet) => log::trace!("Received = {packet:?}"),
            Event::Outgoing(Outgoing::Disconnect) => {
                log::debug!("Stopping MQTT router because of disconnect packet");
                self.cancellation.cancel();
            }
            Event::Outgoing(packet) => log::trace!("Sending = {packet:?}"),
        }
    }

    fn route(&self, publish: Publish) {
        let topic = &publish.topic;
        log::trace!("Received publish on {topic:?}");

        if let Some(bag) = topic.strip_prefix(self.shared.c2d_prefix.as_str()) {
            let message = properties::parse_bag(bag)
                .and_then(|bag| properties::message_from_bag(publish.payload.to_vec(), bag));
            match message {
                Ok(message) => deliver(&self.shared.event_sinks, message),
                Err(e) => {
                    log::error!("Failed parsing cloud-to-device topic {topic:?}: {e}");
                }
            }
        } else if topic.starts_with(topics::TWIN_RES_PREFIX) {
            match topics::parse_twin_response(topic) {
                Ok((status, rid, version)) => {
                    let response = TwinResponse {
                        status,
                        version,
                        payload: publish.payload.to_vec(),
                    };
                    if let Err(e) = self.shared.correlator.complete(rid, response) {
                        log::error!("Dropping twin response: {e}");
                    }
                }
                Err(e) => log::error!("Failed parsing twin response topic {topic:?}: {e}"),
            }
        } else if topic.starts_with(topics::TWIN_PATCH_DESIRED_PREFIX) {
            deliver(&self.shared.twin_sinks, publish.payload.to_vec());
        } else if topic.starts_with(topics::METHODS_PREFIX) {
            match topics::parse_method_topic(topic) {
                Ok((method_name, request_id)) => {
                    self.invoke_method(method_name, request_id, publish.payload.to_vec());
                }
                Err(e) => log::error!("Failed parsing method topic {topic:?}: {e}"),
            }
        } else {
            log::warn!("Ignoring message received on unexpected topic {topic:?}");
        }
    }

    /// Run the dispatcher off the router task and publish its response,
    /// so a slow handler cannot stall the demux.
    fn invoke_method(&self, method_name: String, request_id: String, payload: Vec<u8>) {
        let dispatcher = self.shared.dispatcher.lock().unwrap().clone();
        let Some(dispatcher) = dispatcher else {
            log::warn!("Received direct method {method_name:?} with no dispatcher registered");
            return;
        };
        let client = self.client.clone();
        tokio::spawn(async move {
            log::debug!("Invoking direct method {method_name:?}");
            let (status, body) = dispatcher.dispatch(&method_name, &payload).await;
            let topic = topics::method_response_topic(status, &request_id);
            if let Err(e) = client.publish(topic, QoS::AtLeastOnce, false, body).await {
                log::error!("Unable to publish direct method response: {e}");
            }
        });
    }
}

/// Replay the sticky subscriptions; the broker forgets them across
/// reconnects under clean-session semantics.
async fn resubscribe(client: &AsyncClient, shared: &Arc<Shared>) {
    let filters = shared.sticky.lock().unwrap().clone();
    if filters.is_empty() {
        return;
    }
    log::debug!("Replaying {} subscription(s)", filters.len());
    if let Err(e) = client.subscribe_many(filters).await {
        log::error!("Unable to replay subscriptions after reconnect: {e}");
    }
}

/// Hand one item to every live sink. A full sink drops the item with a
/// warning; QoS 1 redelivery covers the unacked case on reconnect, but
/// at-least-once is not preserved across a local overflow.
fn deliver<T: Clone>(sinks: &StdMutex<Vec<mpsc::Sender<T>>>, item: T) {
    let mut sinks = sinks.lock().unwrap();
    sinks.retain(|tx| !tx.is_closed());
    for tx in sinks.iter() {
        match tx.try_send(item.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::warn!("Inbound channel is full, dropping message");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}
