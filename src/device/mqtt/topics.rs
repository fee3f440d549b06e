//! The hub's MQTT topic scheme.
//!
//! Inbound topics carry request metadata in the topic itself, so the
//! parsers here are part of the wire contract: method names may contain
//! slashes, twin request IDs are hex, and property bags are URL-encoded.

use crate::error::{Error, Result};

use super::properties;

pub(crate) const METHODS_PREFIX: &str = "$iothub/methods/POST/";
pub(crate) const METHODS_FILTER: &str = "$iothub/methods/POST/#";
pub(crate) const TWIN_RES_PREFIX: &str = "$iothub/twin/res/";
pub(crate) const TWIN_RES_FILTER: &str = "$iothub/twin/res/#";
pub(crate) const TWIN_PATCH_DESIRED_PREFIX: &str = "$iothub/twin/PATCH/properties/desired/";
pub(crate) const TWIN_PATCH_DESIRED_FILTER: &str = "$iothub/twin/PATCH/properties/desired/#";

pub(crate) fn events_topic(device_id: &str, property_bag: &str) -> String {
    format!("devices/{device_id}/messages/events/{property_bag}")
}

pub(crate) fn c2d_prefix(device_id: &str) -> String {
    format!("devices/{device_id}/messages/devicebound/")
}

pub(crate) fn c2d_filter(device_id: &str) -> String {
    format!("devices/{device_id}/messages/devicebound/#")
}

pub(crate) fn method_response_topic(status: i32, request_id: &str) -> String {
    format!("$iothub/methods/res/{status}/?$rid={request_id}")
}

pub(crate) fn twin_get_topic(request_id: u32) -> String {
    format!("$iothub/twin/GET/?$rid={request_id:x}")
}

pub(crate) fn twin_patch_topic(request_id: u32) -> String {
    format!("$iothub/twin/PATCH/properties/reported/?$rid={request_id:x}")
}

/// Parse a direct-method invocation topic into `(method_name,
/// request_id)`.
///
/// The hub does not restrict method names, so the name is everything up
/// to the last slash.
pub(crate) fn parse_method_topic(topic: &str) -> Result<(String, String)> {
    let rest = topic
        .strip_prefix(METHODS_PREFIX)
        .ok_or_else(|| Error::Protocol(format!("not a method topic: {topic:?}")))?;
    let last_slash = rest
        .rfind('/')
        .ok_or_else(|| Error::Protocol(format!("method topic misses request id: {topic:?}")))?;
    let method_name = rest[..last_slash].to_string();

    let query = rest[last_slash + 1..]
        .strip_prefix('?')
        .ok_or_else(|| Error::Protocol(format!("method topic misses query: {topic:?}")))?;
    let bag = properties::parse_bag(query)?;
    let request_id = bag
        .get("$rid")
        .filter(|rid| !rid.is_empty())
        .ok_or_else(|| Error::Protocol(format!("method topic misses $rid: {topic:?}")))?
        .clone();

    Ok((method_name, request_id))
}

/// Parse a twin response topic into `(status, request_id, version)`.
/// The request ID is hex-formatted on the wire.
pub(crate) fn parse_twin_response(topic: &str) -> Result<(u16, u32, Option<u64>)> {
    let rest = topic
        .strip_prefix(TWIN_RES_PREFIX)
        .ok_or_else(|| Error::Protocol(format!("not a twin response topic: {topic:?}")))?;
    let (status, query) = rest
        .split_once("/?")
        .ok_or_else(|| Error::Protocol(format!("twin response topic misses query: {topic:?}")))?;

    let status: u16 = status
        .parse()
        .map_err(|_| Error::Protocol(format!("invalid twin response status in {topic:?}")))?;

    let bag = properties::parse_bag(query)?;
    let request_id = bag
        .get("$rid")
        .ok_or_else(|| Error::Protocol(format!("twin response misses $rid: {topic:?}")))?;
    let request_id = u32::from_str_radix(request_id, 16)
        .map_err(|_| Error::Protocol(format!("invalid twin request id in {topic:?}")))?;

    let version = match bag.get("$version") {
        Some(ver) => Some(ver.parse().map_err(|_| {
            Error::Protocol(format!("invalid twin version in {topic:?}"))
        })?),
        None => None,
    };

    Ok((status, request_id, version))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_topic_parses_name_and_rid() {
        let (name, rid) = parse_method_topic("$iothub/methods/POST/add/?$rid=666").unwrap();
        assert_eq!(name, "add");
        assert_eq!(rid, "666");
    }

    #[test]
    fn method_name_may_contain_slashes() {
        let (name, rid) =
            parse_method_topic("$iothub/methods/POST/nested/path/?$rid=1").unwrap();
        assert_eq!(name, "nested/path");
        assert_eq!(rid, "1");
    }

    #[test]
    fn method_topic_without_rid_is_rejected() {
        assert!(parse_method_topic("$iothub/methods/POST/add/?foo=1").is_err());
    }

    #[test]
    fn twin_response_parses_status_rid_and_version() {
        let (status, rid, version) =
            parse_twin_response("$iothub/twin/res/200/?$rid=12&$version=4").unwrap();
        assert_eq!(status, 200);
        assert_eq!(rid, 0x12);
        assert_eq!(version, Some(4));
    }

    #[test]
    fn twin_response_version_is_optional() {
        let (status, rid, version) = parse_twin_response("$iothub/twin/res/204/?$rid=ff").unwrap();
        assert_eq!(status, 204);
        assert_eq!(rid, 0xff);
        assert_eq!(version, None);
    }

    #[test]
    fn twin_request_ids_are_hex_on_the_wire() {
        assert_eq!(twin_get_topic(30), "$iothub/twin/GET/?$rid=1e");
        assert_eq!(
            twin_patch_topic(255),
            "$iothub/twin/PATCH/properties/reported/?$rid=ff"
        );
    }

    #[test]
    fn outbound_topics() {
        assert_eq!(
            events_topic("dev", "a=b"),
            "devices/dev/messages/events/a=b"
        );
        assert_eq!(c2d_filter("dev"), "devices/dev/messages/devicebound/#");
        assert_eq!(
            method_response_topic(200, "666"),
            "$iothub/methods/res/200/?$rid=666"
        );
    }
}
