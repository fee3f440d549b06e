//! The narrow JSON-over-HTTPS client the service side uses for
//! direct-method invocation.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::select;
use tokio_util::sync::CancellationToken;

use crate::credentials::{Credentials, TOKEN_TTL};
use crate::error::{Error, Result};

const API_VERSION: &str = "2019-03-30";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// A direct-method invocation request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodCall {
    pub method_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_in_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_timeout_in_seconds: Option<u64>,
    pub payload: Value,
}

impl MethodCall {
    pub fn new(method_name: impl Into<String>, payload: Value) -> Self {
        MethodCall {
            method_name: method_name.into(),
            connect_timeout_in_seconds: None,
            response_timeout_in_seconds: None,
            payload,
        }
    }
}

/// A direct-method invocation result.
#[derive(Debug, Clone, Deserialize)]
pub struct MethodResult {
    pub status: i32,
    #[serde(default)]
    pub payload: Value,
}

pub(crate) struct RestClient {
    host: String,
    credentials: Credentials,
}

impl RestClient {
    pub(crate) fn new(host: impl Into<String>, credentials: Credentials) -> Self {
        RestClient {
            host: host.into(),
            credentials,
        }
    }

    /// Invoke a direct method on a device, or on one of its modules
    /// when `module_id` is given.
    pub(crate) async fn invoke_method(
        &self,
        ct: &CancellationToken,
        device_id: &str,
        module_id: Option<&str>,
        call: &MethodCall,
    ) -> Result<MethodResult> {
        let path = match module_id {
            Some(module_id) => format!("twins/{device_id}/modules/{module_id}/methods"),
            None => format!("twins/{device_id}/methods"),
        };
        let body = serde_json::to_value(call)
            .map_err(|e| Error::Config(format!("unserializable method call: {e}")))?;
        let response = self.post(ct, &path, body, None).await?;
        serde_json::from_value(response)
            .map_err(|e| Error::Protocol(format!("malformed method result: {e}")))
    }

    /// POST `body` to `https://{host}/{path}?api-version=…` with the
    /// standard headers. Runs the blocking HTTP client off the async
    /// runtime.
    pub(crate) async fn post(
        &self,
        ct: &CancellationToken,
        path: &str,
        body: Value,
        etag: Option<&str>,
    ) -> Result<Value> {
        let url = format!("https://{}/{}?api-version={API_VERSION}", self.host, path);
        let token = self.credentials.token(&self.host, TOKEN_TTL)?;
        let etag = etag.map(|etag| format!("\"{etag}\""));

        let request = tokio::task::spawn_blocking(move || send_json(&url, &token, etag, body));
        select! {
            result = request => result.map_err(|e| Error::Network(e.to_string()))?,
            _ = ct.cancelled() => Err(Error::Cancelled),
        }
    }
}

fn send_json(url: &str, token: &str, etag: Option<String>, body: Value) -> Result<Value> {
    let connector = Arc::new(
        native_tls::TlsConnector::new()
            .map_err(|e| Error::Network(format!("unable to build TLS connector: {e}")))?,
    );
    let agent = ureq::AgentBuilder::new().tls_connector(connector).build();

    let mut request = agent
        .post(url)
        .timeout(REQUEST_TIMEOUT)
        .set("Content-Type", "application/json; charset=utf-8")
        .set("Authorization", token)
        .set("Request-Id", &uuid::Uuid::new_v4().to_string());
    if let Some(etag) = &etag {
        request = request.set("If-Match", etag);
    }

    log::debug!("Sending request to {url}");
    match request.send_json(body) {
        Ok(response) => response
            .into_json()
            .map_err(|e| Error::Protocol(format!("malformed response body: {e}"))),
        Err(ureq::Error::Status(status, response)) => {
            log::debug!(
                "Request to {url} failed with status {status}: {}",
                response.into_string().unwrap_or_default()
            );
            Err(Error::Request(status))
        }
        Err(ureq::Error::Transport(e)) => Err(Error::Network(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn method_call_serializes_per_wire_contract() {
        let mut call = MethodCall::new("reboot", json!({"delay": 5}));
        call.response_timeout_in_seconds = Some(30);

        let body = serde_json::to_value(&call).unwrap();
        assert_eq!(
            body,
            json!({
                "methodName": "reboot",
                "responseTimeoutInSeconds": 30,
                "payload": {"delay": 5},
            })
        );
    }

    #[test]
    fn method_result_parses_with_and_without_payload() {
        let result: MethodResult =
            serde_json::from_value(json!({"status": 200, "payload": {"ok": true}})).unwrap();
        assert_eq!(result.status, 200);
        assert_eq!(result.payload, json!({"ok": true}));

        let result: MethodResult = serde_json::from_value(json!({"status": 0})).unwrap();
        assert_eq!(result.status, 0);
        assert_eq!(result.payload, Value::Null);
    }
}
