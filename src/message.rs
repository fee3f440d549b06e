use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// Delivery guarantee for a single publish.
///
/// The hub supports at most MQTT QoS 1; QoS 2 does not exist on this
/// transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Qos {
    /// Fire and forget.
    AtMostOnce,
    /// At-least-once, the default for all hub traffic.
    #[default]
    AtLeastOnce,
}

/// Acknowledgement kind a cloud-to-device message asks the device side
/// to produce on the feedback link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    None,
    Positive,
    Negative,
    Full,
}

impl AckMode {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            AckMode::None => "none",
            AckMode::Positive => "positive",
            AckMode::Negative => "negative",
            AckMode::Full => "full",
        }
    }
}

/// A wire-neutral message exchanged in either direction.
///
/// The sender constructs it and hands it to a transport; from then on it
/// is immutable. Deserialized copies on the receiving side are owned by
/// the client until the subscriber is done with them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub message_id: Option<String>,
    pub to: Option<String>,
    /// Absolute expiry time, if the sender set one.
    pub expiry_time: Option<DateTime<Utc>>,
    /// Populated by the hub on arrival; never set by a sender.
    pub enqueued_time: Option<DateTime<Utc>>,
    pub correlation_id: Option<String>,
    pub user_id: Option<String>,
    /// Populated by the hub for device-to-cloud events read on the
    /// service side.
    pub connection_device_id: Option<String>,
    pub connection_device_generation_id: Option<String>,
    pub connection_auth_method: Option<String>,
    pub message_source: Option<String>,
    pub payload: Vec<u8>,
    /// Application properties. Insertion order is irrelevant.
    pub properties: HashMap<String, String>,
}

impl Message {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Message {
            payload: payload.into(),
            ..Default::default()
        }
    }
}

/// Per-send options, applied to a [`Message`] before it reaches the
/// transport.
///
/// Options compose by chaining; application happens once, inside the
/// client, and any invalid combination fails before the transport is
/// invoked.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub(crate) message_id: Option<String>,
    pub(crate) correlation_id: Option<String>,
    pub(crate) user_id: Option<String>,
    pub(crate) to: Option<String>,
    pub(crate) expiry_time: Option<DateTime<Utc>>,
    pub(crate) properties: HashMap<String, String>,
    pub(crate) qos: Qos,
    pub(crate) ack: Option<AckMode>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn user_id(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    pub fn to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    pub fn expiry_time(mut self, at: DateTime<Utc>) -> Self {
        self.expiry_time = Some(at);
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn qos(mut self, qos: Qos) -> Self {
        self.qos = qos;
        self
    }

    /// Request delivery feedback for this message. Only meaningful for
    /// cloud-to-device sends from the service client.
    pub fn ack(mut self, mode: AckMode) -> Self {
        self.ack = Some(mode);
        self
    }

    /// Fold the options into `msg`. Fields already present on the
    /// message are kept unless an option overrides them.
    pub(crate) fn apply(&self, msg: &mut Message) {
        if let Some(id) = &self.message_id {
            msg.message_id = Some(id.clone());
        }
        if let Some(id) = &self.correlation_id {
            msg.correlation_id = Some(id.clone());
        }
        if let Some(id) = &self.user_id {
            msg.user_id = Some(id.clone());
        }
        if let Some(to) = &self.to {
            msg.to = Some(to.clone());
        }
        if let Some(at) = &self.expiry_time {
            msg.expiry_time = Some(*at);
        }
        for (k, v) in &self.properties {
            msg.properties.insert(k.clone(), v.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_apply_over_message() {
        let mut msg = Message::new(b"hello".to_vec());
        msg.message_id = Some("original".into());

        let opts = SendOptions::new()
            .message_id("overridden")
            .correlation_id("corr")
            .property("a", "b");
        opts.apply(&mut msg);

        assert_eq!(msg.message_id.as_deref(), Some("overridden"));
        assert_eq!(msg.correlation_id.as_deref(), Some("corr"));
        assert_eq!(msg.properties.get("a").map(String::as_str), Some("b"));
        assert_eq!(msg.payload, b"hello");
    }

    #[test]
    fn default_qos_is_at_least_once() {
        assert_eq!(SendOptions::new().qos, Qos::AtLeastOnce);
    }
}
