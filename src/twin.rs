use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Reserved key carrying the hub-assigned version of a twin half.
pub const VERSION_KEY: &str = "$version";

/// A device twin: the hub-held JSON document with its two halves.
///
/// *Desired* is written by the service and observed by the device;
/// *reported* is written by the device and observed by the service.
/// Versions are hub-assigned and monotonically increasing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TwinState {
    #[serde(default)]
    pub desired: Map<String, Value>,
    #[serde(default)]
    pub reported: Map<String, Value>,
}

impl TwinState {
    /// Parse the full twin document returned by a twin GET.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| Error::Protocol(format!("malformed twin document: {e}")))
    }

    pub fn desired_version(&self) -> Option<u64> {
        version_of(&self.desired)
    }

    pub fn reported_version(&self) -> Option<u64> {
        version_of(&self.reported)
    }
}

fn version_of(half: &Map<String, Value>) -> Option<u64> {
    half.get(VERSION_KEY).and_then(Value::as_u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_both_halves() {
        let doc = json!({
            "desired": {"color": "red", "$version": 7},
            "reported": {"color": "blue", "$version": 3},
        });
        let twin = TwinState::parse(doc.to_string().as_bytes()).unwrap();
        assert_eq!(twin.desired_version(), Some(7));
        assert_eq!(twin.reported_version(), Some(3));
        assert_eq!(twin.desired.get("color"), Some(&json!("red")));
    }

    #[test]
    fn rejects_non_json() {
        assert!(matches!(
            TwinState::parse(b"not json"),
            Err(Error::Protocol(_))
        ));
    }
}
