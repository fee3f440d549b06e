//! AMQP session plumbing for the service client.
//!
//! Covers the pieces the hub's AMQP 1.0 surface needs beyond plain
//! links: claim-based-security token puts on `$cbs`, partition
//! discovery through `$management`, link-redirect extraction, and the
//! conversions between the wire messages and [`Message`].

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use fe2o3_amqp::connection::ConnectionHandle;
use fe2o3_amqp::link::{LinkStateError, RecvError};
use fe2o3_amqp::sasl_profile::SaslProfile;
use fe2o3_amqp::session::SessionHandle;
use fe2o3_amqp::{Connection, Receiver, Sender, Session};
use fe2o3_amqp_types::definitions::{ErrorCondition, LinkError};
use fe2o3_amqp_types::messaging::{
    ApplicationProperties, Body, Data, Message as AmqpMessage, MessageId, Outcome, Properties,
};
use fe2o3_amqp_types::primitives::{Binary, OrderedMap, SimpleValue, Symbol, Timestamp, Value};
use tokio::select;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::credentials::{Credentials, TOKEN_REFRESH_MARGIN, TOKEN_TTL};
use crate::error::{Error, Result};
use crate::message::{AckMode, Message};

const CBS_NODE: &str = "$cbs";
const MANAGEMENT_NODE: &str = "$management";

/// The wire body type used throughout: covers data, value, and empty
/// bodies.
pub(crate) type WireBody = Body<Value>;

pub(crate) async fn open_anonymous(host: &str, container_id: &str) -> Result<ConnectionHandle<()>> {
    Connection::builder()
        .container_id(container_id)
        .sasl_profile(SaslProfile::Anonymous)
        .open(format!("amqps://{host}").as_str())
        .await
        .map_err(|e| Error::Network(format!("unable to open AMQP connection to {host}: {e}")))
}

pub(crate) async fn open_plain(
    host: &str,
    container_id: &str,
    username: &str,
    password: &str,
) -> Result<ConnectionHandle<()>> {
    Connection::builder()
        .container_id(container_id)
        .sasl_profile(SaslProfile::Plain {
            username: username.to_string(),
            password: password.to_string(),
        })
        .open(format!("amqps://{host}").as_str())
        .await
        .map_err(|e| Error::Network(format!("unable to open AMQP connection to {host}: {e}")))
}

/// Present a SAS token on the `$cbs` node over a transient session.
pub(crate) async fn put_token(
    connection: &mut ConnectionHandle<()>,
    audience: &str,
    token: &str,
) -> Result<()> {
    let mut session = Session::begin(connection)
        .await
        .map_err(|e| Error::network(e))?;

    let result = put_token_on_session(&mut session, audience, token).await;
    _ = session.end().await;
    result
}

async fn put_token_on_session(
    session: &mut SessionHandle<()>,
    audience: &str,
    token: &str,
) -> Result<()> {
    let mut sender = Sender::attach(session, "cbs-sender", CBS_NODE)
        .await
        .map_err(|e| Error::network(e))?;
    let mut receiver = Receiver::attach(session, "cbs-receiver", CBS_NODE)
        .await
        .map_err(|e| Error::network(e))?;

    let message = AmqpMessage::builder()
        .properties(
            Properties::builder()
                .message_id(MessageId::from(uuid::Uuid::new_v4().to_string()))
                .reply_to("cbs-receiver")
                .build(),
        )
        .application_properties(
            ApplicationProperties::builder()
                .insert("operation", "put-token")
                .insert("type", "servicebus.windows.net:sastoken")
                .insert("name", audience)
                .build(),
        )
        .value(Value::String(token.to_string()))
        .build();

    let outcome = sender.send(message).await.map_err(|e| Error::network(e))?;
    expect_accepted(outcome)?;

    let delivery: fe2o3_amqp::Delivery<WireBody> =
        receiver.recv().await.map_err(|e| Error::network(e))?;
    receiver
        .accept(&delivery)
        .await
        .map_err(|e| Error::network(e))?;

    let status = application_status(delivery.message())
        .ok_or_else(|| Error::Protocol("token put response misses status-code".into()))?;
    if !(200..300).contains(&status) {
        return Err(Error::Auth(format!("token was rejected with status {status}")));
    }

    _ = sender.close().await;
    _ = receiver.close().await;
    Ok(())
}

/// Keep the hub connection authorized: re-present the SAS token ahead
/// of each expiry. Errors end the task; the connection itself stays up
/// until the hub drops it.
pub(crate) fn spawn_token_upkeep(
    connection: Arc<Mutex<ConnectionHandle<()>>>,
    credentials: Credentials,
    audience: String,
    cancellation: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            select! {
                _ = cancellation.cancelled() => break,
                _ = tokio::time::sleep(TOKEN_TTL - TOKEN_REFRESH_MARGIN) => {}
            }
            let token = match credentials.token(&audience, TOKEN_TTL) {
                Ok(token) => token,
                Err(e) => {
                    log::error!("Unable to generate a fresh SAS token: {e}");
                    break;
                }
            };
            let mut connection = connection.lock().await;
            if let Err(e) = put_token(&mut connection, &audience, &token).await {
                log::error!("Unable to refresh the CBS token: {e}");
                break;
            }
            log::debug!("Refreshed the CBS token for {audience}");
        }
        log::debug!("CBS token upkeep for {audience} stopped");
    });
}

/// Ask `$management` for the partition IDs of the event-hub-compatible
/// entity named `hub`.
pub(crate) async fn partition_ids(
    session: &mut SessionHandle<()>,
    hub: &str,
) -> Result<Vec<String>> {
    let mut sender = Sender::attach(session, "mgmt-sender", MANAGEMENT_NODE)
        .await
        .map_err(|e| Error::network(e))?;
    let mut receiver = Receiver::attach(session, "mgmt-receiver", MANAGEMENT_NODE)
        .await
        .map_err(|e| Error::network(e))?;

    let message = AmqpMessage::builder()
        .properties(
            Properties::builder()
                .message_id(MessageId::from(uuid::Uuid::new_v4().to_string()))
                .reply_to("mgmt-receiver")
                .build(),
        )
        .application_properties(
            ApplicationProperties::builder()
                .insert("operation", "READ")
                .insert("name", hub)
                .insert("type", "com.microsoft:eventhub")
                .build(),
        )
        .value(Value::Null)
        .build();

    let outcome = sender.send(message).await.map_err(|e| Error::network(e))?;
    expect_accepted(outcome)?;

    let delivery: fe2o3_amqp::Delivery<WireBody> =
        receiver.recv().await.map_err(|e| Error::network(e))?;
    receiver
        .accept(&delivery)
        .await
        .map_err(|e| Error::network(e))?;

    let ids = partition_ids_from_body(delivery.body())
        .ok_or_else(|| Error::Protocol("management response misses partition_ids".into()))?;

    _ = sender.close().await;
    _ = receiver.close().await;
    Ok(ids)
}

fn partition_ids_from_body(body: &WireBody) -> Option<Vec<String>> {
    let Body::Value(value) = body else {
        return None;
    };
    let Value::Map(map) = &value.0 else {
        return None;
    };
    let ids = map.get(&Value::String("partition_ids".to_string()))?;
    let items: &[Value] = match ids {
        Value::Array(items) => &items.0,
        Value::List(items) => items,
        _ => return None,
    };
    items
        .iter()
        .map(|id| match id {
            Value::String(id) => Some(id.clone()),
            _ => None,
        })
        .collect()
}

/// A link redirect extracted from a forced detach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Redirect {
    pub(crate) host: String,
    /// The path segment of the redirect address: the event-hub entity
    /// the partition links hang off of.
    pub(crate) group: String,
}

/// Interpret a receive failure as a link redirect. The redirect is a
/// control message in this flow, not an error.
pub(crate) fn redirect_from_recv_error(err: &RecvError) -> Option<Redirect> {
    let error = match err {
        RecvError::LinkStateError(LinkStateError::RemoteDetachedWithError(error))
        | RecvError::LinkStateError(LinkStateError::RemoteClosedWithError(error)) => error,
        _ => return None,
    };
    if error.condition != ErrorCondition::LinkError(LinkError::Redirect) {
        return None;
    }
    let info = error.info.as_ref()?;
    let host = match info_value(info, "hostname")? {
        Value::String(host) => host.clone(),
        _ => return None,
    };
    let address = match info_value(info, "address")? {
        Value::String(address) => address,
        _ => return None,
    };
    Some(Redirect {
        host,
        group: parse_redirect_group(address)?,
    })
}

fn info_value<'a>(info: &'a OrderedMap<Symbol, Value>, key: &str) -> Option<&'a Value> {
    info.get(&Symbol::from(key))
}

/// The redirect address looks like `amqps://{host}:5671/{group}/`;
/// extract the group.
pub(crate) fn parse_redirect_group(address: &str) -> Option<String> {
    let (_, rest) = address.split_once(":5671/")?;
    let group = rest.trim_end_matches('/');
    if group.is_empty() {
        return None;
    }
    Some(group.to_string())
}

pub(crate) fn expect_accepted(outcome: Outcome) -> Result<()> {
    match outcome {
        Outcome::Accepted(_) => Ok(()),
        other => Err(Error::Network(format!(
            "message was not accepted: {other:?}"
        ))),
    }
}

fn application_status(message: &AmqpMessage<WireBody>) -> Option<i32> {
    let properties = message.application_properties.as_ref()?;
    match properties.0.get("status-code")? {
        SimpleValue::Int(code) => Some(*code),
        SimpleValue::Uint(code) => Some(*code as i32),
        SimpleValue::Long(code) => Some(*code as i32),
        SimpleValue::Short(code) => Some(i32::from(*code)),
        _ => None,
    }
}

/// Build the AMQP rendition of an outbound cloud-to-device message.
pub(crate) fn outbound_message(msg: &Message, ack: Option<AckMode>) -> AmqpMessage<Data> {
    let mut properties = Properties::builder();
    let message_id = msg
        .message_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    properties = properties.message_id(MessageId::from(message_id));
    if let Some(to) = &msg.to {
        properties = properties.to(to.clone());
    }
    if let Some(correlation_id) = &msg.correlation_id {
        properties = properties.correlation_id(MessageId::from(correlation_id.clone()));
    }
    if let Some(user_id) = &msg.user_id {
        properties = properties.user_id(Binary::from(user_id.clone().into_bytes()));
    }
    if let Some(at) = &msg.expiry_time {
        properties =
            properties.absolute_expiry_time(Timestamp::from_milliseconds(at.timestamp_millis()));
    }

    let mut application = ApplicationProperties::builder();
    for (key, value) in &msg.properties {
        application = application.insert(key.clone(), value.clone());
    }
    if let Some(ack) = ack {
        application = application.insert("iothub-ack", ack.as_str());
    }

    AmqpMessage::builder()
        .properties(properties.build())
        .application_properties(application.build())
        .data(Binary::from(msg.payload.clone()))
        .build()
}

/// Lift an inbound event-hub message into the wire-neutral model,
/// pulling the server-populated fields out of the annotations.
pub(crate) fn inbound_message(message: AmqpMessage<WireBody>) -> Message {
    let mut msg = Message {
        payload: body_bytes(&message.body),
        ..Default::default()
    };

    if let Some(properties) = &message.properties {
        msg.message_id = properties.message_id.as_ref().map(message_id_string);
        msg.correlation_id = properties.correlation_id.as_ref().map(message_id_string);
        msg.to = properties.to.clone();
        msg.user_id = properties
            .user_id
            .as_ref()
            .map(|id| String::from_utf8_lossy(id).into_owned());
        if let Some(at) = &properties.absolute_expiry_time {
            msg.expiry_time = timestamp_to_datetime(at);
        }
    }

    if let Some(annotations) = &message.message_annotations {
        for (key, value) in annotations.0.iter() {
            let name = match key {
                fe2o3_amqp_types::messaging::annotations::OwnedKey::Symbol(symbol) => {
                    symbol.0.as_str()
                }
                _ => continue,
            };
            match (name, value) {
                ("iothub-connection-device-id", Value::String(id)) => {
                    msg.connection_device_id = Some(id.clone());
                }
                ("iothub-connection-auth-generation-id", Value::String(id)) => {
                    msg.connection_device_generation_id = Some(id.clone());
                }
                ("iothub-connection-auth-method", Value::String(method)) => {
                    msg.connection_auth_method = Some(method.clone());
                }
                ("iothub-message-source", Value::String(source)) => {
                    msg.message_source = Some(source.clone());
                }
                ("x-opt-enqueued-time", Value::Timestamp(at)) => {
                    msg.enqueued_time = timestamp_to_datetime(at);
                }
                _ => {}
            }
        }
    }

    if let Some(application) = &message.application_properties {
        for (key, value) in application.0.iter() {
            let value = match value {
                SimpleValue::String(value) => value.clone(),
                other => format!("{other:?}"),
            };
            msg.properties.insert(key.clone(), value);
        }
    }

    msg
}

pub(crate) fn body_bytes(body: &WireBody) -> Vec<u8> {
    match body {
        Body::Data(batch) => batch
            .iter()
            .flat_map(|data| data.0.to_vec())
            .collect(),
        Body::Value(value) => match &value.0 {
            Value::Binary(bytes) => bytes.to_vec(),
            Value::String(text) => text.clone().into_bytes(),
            other => serde_json::to_vec(&format!("{other:?}")).unwrap_or_default(),
        },
        _ => Vec::new(),
    }
}

fn message_id_string(id: &MessageId) -> String {
    match id {
        MessageId::String(id) => id.clone(),
        MessageId::Uuid(id) => format!("{id:?}"),
        MessageId::Ulong(id) => id.to_string(),
        MessageId::Binary(id) => String::from_utf8_lossy(id).into_owned(),
    }
}

fn timestamp_to_datetime(at: &Timestamp) -> Option<chrono::DateTime<Utc>> {
    Utc.timestamp_millis_opt(at.milliseconds()).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_group_comes_from_the_address_path() {
        assert_eq!(
            parse_redirect_group("amqps://eh.example.net:5671/my-hub/"),
            Some("my-hub".to_string())
        );
        assert_eq!(parse_redirect_group("amqps://eh.example.net:5671/"), None);
        assert_eq!(parse_redirect_group("amqps://eh.example.net"), None);
    }

    #[test]
    fn partition_ids_parse_from_the_management_body() {
        use fe2o3_amqp_types::messaging::AmqpValue;
        use fe2o3_amqp_types::primitives::Array;

        let mut map = OrderedMap::new();
        map.insert(
            Value::String("partition_ids".into()),
            Value::Array(Array::from(vec![
                Value::String("0".into()),
                Value::String("1".into()),
            ])),
        );
        let body = Body::Value(AmqpValue(Value::Map(map)));
        assert_eq!(
            partition_ids_from_body(&body),
            Some(vec!["0".to_string(), "1".to_string()])
        );
        assert_eq!(partition_ids_from_body(&Body::Empty), None);
    }

    #[test]
    fn outbound_message_defaults_a_message_id() {
        let message = outbound_message(&Message::new(b"hi".to_vec()), Some(AckMode::Full));
        let properties = message.properties.as_ref().unwrap();
        assert!(properties.message_id.is_some());

        let application = message.application_properties.as_ref().unwrap();
        assert_eq!(
            application.0.get("iothub-ack"),
            Some(&SimpleValue::String("full".to_string()))
        );
    }
}
