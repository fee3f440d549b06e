//! Device-to-cloud event consumption through the event-hub-compatible
//! endpoint.
//!
//! The hub does not serve the event stream itself: the first receiver
//! attached to `messages/events/` is detached with a link redirect
//! naming the real broker. The redirected endpoint speaks plain
//! SASL, exposes partition IDs through `$management`, and serves one
//! link per partition.

use chrono::Utc;
use fe2o3_amqp::connection::ConnectionHandle;
use fe2o3_amqp::{Receiver, Session};
use fe2o3_amqp_types::messaging::Source;
use fe2o3_amqp_types::primitives::{Symbol, Value};
use serde_amqp::described::Described;
use serde_amqp::descriptor::Descriptor;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::message::Message;

use super::amqp::{self, Redirect, WireBody};

const EVENTS_ADDRESS: &str = "messages/events/";
const SELECTOR_FILTER: &str = "apache.org:selector-filter:string";
const CONSUMER_GROUP: &str = "$Default";

/// Provoke the link redirect on the hub connection and extract the
/// event-hub endpoint from it.
pub(crate) async fn discover_redirect(
    connection: &mut ConnectionHandle<()>,
) -> Result<Redirect> {
    let mut session = Session::begin(connection)
        .await
        .map_err(|e| Error::network(e))?;
    let mut receiver = Receiver::attach(&mut session, "redirect-probe", EVENTS_ADDRESS)
        .await
        .map_err(|e| Error::network(e))?;

    let result = match receiver.recv::<WireBody>().await {
        Ok(_) => Err(Error::Protocol(
            "expected a link redirect on the events address".into(),
        )),
        Err(e) => amqp::redirect_from_recv_error(&e).ok_or_else(|| {
            Error::Network(format!("receive failed without a redirect: {e}"))
        }),
    };

    _ = session.end().await;
    result
}

/// Consume every partition of the redirected endpoint, starting at the
/// current time, serializing all messages into `handler`. Runs until
/// cancellation or the first partition error; either way all peers are
/// stopped before returning.
pub(crate) async fn subscribe<F>(
    credentials: &Credentials,
    redirect: Redirect,
    ct: &CancellationToken,
    mut handler: F,
) -> Result<()>
where
    F: FnMut(Message) + Send,
{
    let (key_name, key) = match credentials {
        Credentials::SharedAccessKey {
            key_name: Some(key_name),
            key,
            ..
        } => (key_name.clone(), key.clone()),
        Credentials::SharedAccessKey { .. } => {
            return Err(Error::Config(
                "event stream subscription requires SharedAccessKeyName".into(),
            ))
        }
        Credentials::X509 { .. } => return Err(Error::AuthKindMismatch),
    };

    let container_id = format!("iothub-events-{}", uuid::Uuid::new_v4());
    let mut connection =
        amqp::open_plain(&redirect.host, &container_id, &key_name, &key).await?;
    let mut session = Session::begin(&mut connection)
        .await
        .map_err(|e| Error::network(e))?;

    let partitions = amqp::partition_ids(&mut session, &redirect.group).await?;
    log::debug!(
        "Consuming {} partition(s) of {} on {}",
        partitions.len(),
        redirect.group,
        redirect.host
    );

    let since_millis = Utc::now().timestamp_millis();
    let mut receivers = Vec::new();
    for partition in &partitions {
        let address = format!(
            "{}/ConsumerGroups/{CONSUMER_GROUP}/Partitions/{partition}",
            redirect.group
        );
        let source = Source::builder()
            .address(address)
            .filter(enqueued_after(since_millis))
            .build();
        let receiver = Receiver::builder()
            .name(format!("partition-{partition}"))
            .source(source)
            .attach(&mut session)
            .await
            .map_err(|e| Error::network(e))?;
        receivers.push((partition.clone(), receiver));
    }

    let cancellation = ct.child_token();
    let (tx, mut rx) = mpsc::unbounded_channel::<Result<Message>>();

    for (partition, mut receiver) in receivers {
        let tx = tx.clone();
        let cancellation = cancellation.clone();
        tokio::spawn(async move {
            loop {
                select! {
                    _ = cancellation.cancelled() => break,
                    delivery = receiver.recv::<WireBody>() => {
                        let delivery = match delivery {
                            Ok(delivery) => delivery,
                            Err(e) => {
                                _ = tx.send(Err(Error::Network(format!(
                                    "partition {partition} receive failed: {e}"
                                ))));
                                break;
                            }
                        };
                        if let Err(e) = receiver.accept(&delivery).await {
                            _ = tx.send(Err(Error::network(e)));
                            break;
                        }
                        if tx.send(Ok(amqp::inbound_message(delivery.into_message()))).is_err() {
                            break;
                        }
                    }
                }
            }
            log::debug!("Partition {partition} receiver stopped");
        });
    }
    drop(tx);

    let result = loop {
        select! {
            _ = ct.cancelled() => break Err(Error::Cancelled),
            item = rx.recv() => match item {
                Some(Ok(msg)) => handler(msg),
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            }
        }
    };

    cancellation.cancel();
    _ = connection.close().await;
    result
}

/// Selector filter skipping everything enqueued before `millis`.
fn enqueued_after(millis: i64) -> fe2o3_amqp_types::messaging::FilterSet {
    let selector = format!("amqp.annotation.x-opt-enqueuedtimeutc > '{millis}'");
    let mut filter = fe2o3_amqp_types::messaging::FilterSet::new();
    filter.insert(
        Symbol::from(SELECTOR_FILTER),
        Value::Described(Box::new(Described {
            descriptor: Descriptor::Name(Symbol::from(SELECTOR_FILTER)),
            value: Value::String(selector),
        })),
    );
    filter
}
