//! The topic-encoded property bag.
//!
//! Message metadata rides in the topic as a form-urlencoded string with
//! `+` normalized to `%20`. Reserved `$.`-prefixed keys map to message
//! fields; everything else is an application property. Unknown reserved
//! keys are a protocol error.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{Error, Result};
use crate::message::Message;

const KEY_MESSAGE_ID: &str = "$.mid";
const KEY_CORRELATION_ID: &str = "$.cid";
const KEY_USER_ID: &str = "$.uid";
const KEY_TO: &str = "$.to";
const KEY_EXPIRY_TIME: &str = "$.exp";
const KEY_ENQUEUED_TIME: &str = "$.ctime";

/// Encode the message metadata and application properties as a topic
/// property bag. Reserved keys come first, application properties in
/// sorted order so the output is stable.
pub(crate) fn encode_bag(msg: &Message) -> String {
    let mut pairs: Vec<(&str, String)> = Vec::new();

    if let Some(id) = &msg.message_id {
        pairs.push((KEY_MESSAGE_ID, id.clone()));
    }
    if let Some(id) = &msg.correlation_id {
        pairs.push((KEY_CORRELATION_ID, id.clone()));
    }
    if let Some(id) = &msg.user_id {
        pairs.push((KEY_USER_ID, id.clone()));
    }
    if let Some(to) = &msg.to {
        pairs.push((KEY_TO, to.clone()));
    }
    if let Some(at) = &msg.expiry_time {
        pairs.push((KEY_EXPIRY_TIME, format_time(at)));
    }
    if let Some(at) = &msg.enqueued_time {
        pairs.push((KEY_ENQUEUED_TIME, format_time(at)));
    }

    let mut properties: Vec<_> = msg.properties.iter().collect();
    properties.sort_by_key(|(k, _)| k.as_str());
    for (key, value) in properties {
        pairs.push((key, value.clone()));
    }

    pairs
        .into_iter()
        .map(|(key, value)| {
            format!(
                "{}={}",
                urlencoding::encode(key),
                urlencoding::encode(&value)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Parse a property bag into a key/value map. A pair without `=` maps
/// to an empty value. Stray semicolons the hub occasionally leaves
/// unencoded are normalized first.
pub(crate) fn parse_bag(raw: &str) -> Result<HashMap<String, String>> {
    let raw = raw.replace(';', "%3B");
    let mut bag = HashMap::new();
    for pair in raw.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = match pair.split_once('=') {
            Some((key, value)) => (decode(key)?, decode(value)?),
            None => (decode(pair)?, String::new()),
        };
        bag.insert(key, value);
    }
    Ok(bag)
}

/// Lift a parsed bag into a [`Message`], moving reserved keys onto the
/// message fields.
pub(crate) fn message_from_bag(
    payload: Vec<u8>,
    bag: HashMap<String, String>,
) -> Result<Message> {
    let mut msg = Message {
        payload,
        ..Default::default()
    };
    for (key, value) in bag {
        match key.as_str() {
            KEY_MESSAGE_ID => msg.message_id = Some(value),
            KEY_CORRELATION_ID => msg.correlation_id = Some(value),
            KEY_USER_ID => msg.user_id = Some(value),
            KEY_TO => msg.to = Some(value),
            KEY_EXPIRY_TIME => msg.expiry_time = Some(parse_time(&value)?),
            KEY_ENQUEUED_TIME => msg.enqueued_time = Some(parse_time(&value)?),
            key if key.starts_with("$.") => {
                return Err(Error::Protocol(format!(
                    "unrecognized reserved property {key:?}"
                )))
            }
            _ => {
                msg.properties.insert(key, value);
            }
        }
    }
    Ok(msg)
}

fn decode(raw: &str) -> Result<String> {
    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .map_err(|e| Error::Protocol(format!("unable to URL-decode {raw:?}: {e}")))
}

fn format_time(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| Error::Protocol(format!("invalid timestamp {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_devicebound_bag() {
        let bag = parse_bag(
            "%24.to=%2Fdevices%2Fmydev%2Fmessages%2FdeviceBound&a[]=b&b=c",
        )
        .unwrap();
        assert_eq!(bag.len(), 3);
        assert_eq!(bag["$.to"], "/devices/mydev/messages/deviceBound");
        assert_eq!(bag["a[]"], "b");
        assert_eq!(bag["b"], "c");
    }

    #[test]
    fn escapes_are_strict() {
        for (raw, encoded) in [("#", "%23"), (" ", "%20"), ("+", "%2B")] {
            let mut msg = Message::new(Vec::new());
            msg.properties.insert(raw.to_string(), raw.to_string());
            assert_eq!(encode_bag(&msg), format!("{encoded}={encoded}"));
        }
    }

    #[test]
    fn bag_round_trip_preserves_message() {
        let mut msg = Message::new(Vec::new());
        msg.message_id = Some("mid-1".into());
        msg.correlation_id = Some("cid 2".into());
        msg.user_id = Some("user+3".into());
        msg.to = Some("/devices/mydev/messages/deviceBound".into());
        msg.expiry_time = Some(Utc.with_ymd_and_hms(2021, 6, 8, 20, 21, 13).unwrap());
        msg.properties.insert("foo".into(), "bar".into());
        msg.properties.insert("a[]".into(), "b".into());

        let bag = parse_bag(&encode_bag(&msg)).unwrap();
        let parsed = message_from_bag(Vec::new(), bag).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn expiry_uses_millisecond_rfc3339() {
        let mut msg = Message::new(Vec::new());
        msg.expiry_time = Some(Utc.with_ymd_and_hms(2021, 6, 8, 20, 21, 13).unwrap());
        assert_eq!(
            encode_bag(&msg),
            "%24.exp=2021-06-08T20%3A21%3A13.000Z"
        );
    }

    #[test]
    fn unknown_reserved_keys_are_rejected() {
        let bag = parse_bag("%24.bogus=1").unwrap();
        let err = message_from_bag(Vec::new(), bag).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn unencoded_semicolons_are_normalized() {
        let bag = parse_bag("a=1;rest").unwrap();
        assert_eq!(bag["a"], "1;rest");
    }

    #[test]
    fn pair_without_value_maps_to_empty() {
        let bag = parse_bag("flag&x=1").unwrap();
        assert_eq!(bag["flag"], "");
        assert_eq!(bag["x"], "1");
    }
}
