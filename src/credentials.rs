use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::select;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Default lifetime of a generated SAS token.
pub(crate) const TOKEN_TTL: Duration = Duration::from_secs(60 * 60);

/// How long before expiry a fresh token is generated.
pub(crate) const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(10 * 60);

/// A parsed `Key=Value;…` connection string.
///
/// Only the documented keys are recognized; anything else fails parsing.
/// `Display` re-serializes the recognized fields, so a parse/format round
/// trip is lossless.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionString {
    pub host_name: String,
    pub device_id: Option<String>,
    pub module_id: Option<String>,
    pub shared_access_key: Option<String>,
    pub shared_access_key_name: Option<String>,
}

impl FromStr for ConnectionString {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut cs = ConnectionString::default();
        for pair in s.split(';').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("malformed segment {pair:?}")))?;
            match key {
                "HostName" => cs.host_name = value.to_string(),
                "DeviceId" => cs.device_id = Some(value.to_string()),
                "ModuleId" => cs.module_id = Some(value.to_string()),
                "SharedAccessKey" => cs.shared_access_key = Some(value.to_string()),
                "SharedAccessKeyName" => cs.shared_access_key_name = Some(value.to_string()),
                other => {
                    return Err(Error::Config(format!(
                        "unrecognized connection string key {other:?}"
                    )))
                }
            }
        }
        if cs.host_name.is_empty() {
            return Err(Error::Config("HostName is required".into()));
        }
        Ok(cs)
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostName={}", self.host_name)?;
        if let Some(device_id) = &self.device_id {
            write!(f, ";DeviceId={device_id}")?;
        }
        if let Some(module_id) = &self.module_id {
            write!(f, ";ModuleId={module_id}")?;
        }
        if let Some(key_name) = &self.shared_access_key_name {
            write!(f, ";SharedAccessKeyName={key_name}")?;
        }
        if let Some(key) = &self.shared_access_key {
            write!(f, ";SharedAccessKey={key}")?;
        }
        Ok(())
    }
}

/// Client credentials, either a shared access key or an x509 pair.
///
/// SAS token generation is total only on the first variant; the second
/// authenticates through the TLS handshake and carries no key.
#[derive(Clone)]
pub enum Credentials {
    SharedAccessKey {
        host_name: String,
        device_id: Option<String>,
        module_id: Option<String>,
        key_name: Option<String>,
        /// Base64-encoded key bytes, as they appear in the connection
        /// string.
        key: String,
    },
    X509 {
        host_name: String,
        device_id: String,
        /// PEM-encoded certificate chain.
        cert_pem: Vec<u8>,
        /// PEM-encoded PKCS#8 private key.
        key_pem: Vec<u8>,
    },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::SharedAccessKey {
                host_name,
                device_id,
                module_id,
                key_name,
                ..
            } => f
                .debug_struct("SharedAccessKey")
                .field("host_name", host_name)
                .field("device_id", device_id)
                .field("module_id", module_id)
                .field("key_name", key_name)
                .finish_non_exhaustive(),
            Credentials::X509 {
                host_name,
                device_id,
                ..
            } => f
                .debug_struct("X509")
                .field("host_name", host_name)
                .field("device_id", device_id)
                .finish_non_exhaustive(),
        }
    }
}

impl Credentials {
    /// Build shared-access-key credentials from a connection string.
    pub fn from_connection_string(s: &str) -> Result<Self> {
        let cs: ConnectionString = s.parse()?;
        let key = cs
            .shared_access_key
            .ok_or_else(|| Error::Config("SharedAccessKey is required".into()))?;
        if BASE64.decode(&key).is_err() {
            return Err(Error::Config("SharedAccessKey is not valid base64".into()));
        }
        Ok(Credentials::SharedAccessKey {
            host_name: cs.host_name,
            device_id: cs.device_id,
            module_id: cs.module_id,
            key_name: cs.shared_access_key_name,
            key,
        })
    }

    pub fn from_x509(
        host_name: impl Into<String>,
        device_id: impl Into<String>,
        cert_pem: Vec<u8>,
        key_pem: Vec<u8>,
    ) -> Self {
        Credentials::X509 {
            host_name: host_name.into(),
            device_id: device_id.into(),
            cert_pem,
            key_pem,
        }
    }

    pub fn host_name(&self) -> &str {
        match self {
            Credentials::SharedAccessKey { host_name, .. } => host_name,
            Credentials::X509 { host_name, .. } => host_name,
        }
    }

    pub fn device_id(&self) -> Option<&str> {
        match self {
            Credentials::SharedAccessKey { device_id, .. } => device_id.as_deref(),
            Credentials::X509 { device_id, .. } => Some(device_id),
        }
    }

    pub fn module_id(&self) -> Option<&str> {
        match self {
            Credentials::SharedAccessKey { module_id, .. } => module_id.as_deref(),
            Credentials::X509 { .. } => None,
        }
    }

    /// Generate a SAS token for `resource`, valid for `ttl` from now.
    pub fn token(&self, resource: &str, ttl: Duration) -> Result<String> {
        let expiry = Utc::now().timestamp() + ttl.as_secs() as i64;
        self.token_until(resource, expiry)
    }

    /// Generate a SAS token with an explicit unix-seconds expiry. The
    /// output is deterministic for a fixed `(key, resource, expiry)`.
    pub(crate) fn token_until(&self, resource: &str, expiry: i64) -> Result<String> {
        let (key, key_name) = match self {
            Credentials::SharedAccessKey { key, key_name, .. } => (key, key_name),
            Credentials::X509 { .. } => return Err(Error::AuthKindMismatch),
        };

        let key = BASE64
            .decode(key)
            .map_err(|_| Error::Auth("shared access key is not valid base64".into()))?;

        let sr = urlencoding::encode(resource).into_owned();
        let to_sign = format!("{sr}\n{expiry}");

        let mut mac = HmacSha256::new_from_slice(&key)
            .map_err(|e| Error::Auth(format!("unusable shared access key: {e}")))?;
        mac.update(to_sign.as_bytes());
        let sig = BASE64.encode(mac.finalize().into_bytes());

        Ok(format!(
            "SharedAccessSignature sr={sr}&sig={}&se={expiry}&skn={}",
            urlencoding::encode(&sig),
            urlencoding::encode(key_name.as_deref().unwrap_or(""))
        ))
    }
}

/// Handle to the background token refresher.
///
/// The current token is observed through a `watch` channel; a fresh one
/// is generated 10 minutes before the previous one expires. A generation
/// failure is logged and ends the loop, after which the connection fails
/// at its next authentication check.
pub(crate) struct TokenRefresher {
    rx: watch::Receiver<String>,
}

impl TokenRefresher {
    pub(crate) fn start(
        credentials: Credentials,
        resource: String,
        cancellation: CancellationToken,
    ) -> Result<Self> {
        let initial = credentials.token(&resource, TOKEN_TTL)?;
        let (tx, rx) = watch::channel(initial);

        tokio::spawn(async move {
            loop {
                select! {
                    _ = cancellation.cancelled() => break,
                    _ = tokio::time::sleep(TOKEN_TTL - TOKEN_REFRESH_MARGIN) => {}
                }
                match credentials.token(&resource, TOKEN_TTL) {
                    Ok(token) => {
                        log::debug!("Refreshed SAS token for {resource}");
                        if tx.send(token).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log::error!("Unable to refresh SAS token for {resource}: {e}");
                        break;
                    }
                }
            }
            log::debug!("Token refresher for {resource} stopped");
        });

        Ok(TokenRefresher { rx })
    }

    pub(crate) fn watch(&self) -> watch::Receiver<String> {
        self.rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_string_round_trip() {
        let input = "HostName=test.azure-devices.net;DeviceId=devnull;SharedAccessKey=c2VjcmV0";
        let cs: ConnectionString = input.parse().expect("valid connection string");
        assert_eq!(cs.host_name, "test.azure-devices.net");
        assert_eq!(cs.device_id.as_deref(), Some("devnull"));
        assert_eq!(cs.shared_access_key.as_deref(), Some("c2VjcmV0"));
        assert_eq!(cs.to_string(), input);

        let service = "HostName=h.example.net;SharedAccessKeyName=owner;SharedAccessKey=a2V5";
        let cs: ConnectionString = service.parse().expect("valid connection string");
        assert_eq!(cs.to_string(), service);
    }

    #[test]
    fn connection_string_rejects_unknown_keys() {
        let err = "HostName=h;Bogus=1".parse::<ConnectionString>().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn connection_string_requires_host() {
        let err = "DeviceId=d".parse::<ConnectionString>().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn sas_token_vector() {
        let creds = Credentials::from_connection_string(
            "HostName=test.azure-devices.net;DeviceId=devnull;SharedAccessKey=c2VjcmV0",
        )
        .unwrap();

        // 2017-01-01T01:01:01Z plus one hour.
        let token = creds
            .token_until("test.azure-devices.net/devices/test", 1_483_236_061)
            .unwrap();
        assert_eq!(
            token,
            "SharedAccessSignature sr=test.azure-devices.net%2Fdevices%2Ftest\
             &sig=IMr3Y5GKbdixQSt96QgIEymAURnu3qzLvEHhGHPLxrU%3D&se=1483236061&skn="
        );

        // Determinism for a fixed (key, resource, se).
        let again = creds
            .token_until("test.azure-devices.net/devices/test", 1_483_236_061)
            .unwrap();
        assert_eq!(token, again);
    }

    #[test]
    fn sas_token_requires_shared_key() {
        let creds = Credentials::from_x509("h.example.net", "dev", Vec::new(), Vec::new());
        let err = creds.token_until("h.example.net/devices/dev", 0).unwrap_err();
        assert!(matches!(err, Error::AuthKindMismatch));
    }

    #[test]
    fn invalid_key_is_rejected() {
        let err =
            Credentials::from_connection_string("HostName=h;DeviceId=d;SharedAccessKey=!!!")
                .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn refresher_rotates_the_token_ahead_of_expiry() {
        let creds = Credentials::from_connection_string(
            "HostName=h.example.net;DeviceId=d;SharedAccessKey=c2VjcmV0",
        )
        .unwrap();

        let cancellation = CancellationToken::new();
        let refresher = TokenRefresher::start(
            creds,
            "h.example.net/devices/d".into(),
            cancellation.clone(),
        )
        .unwrap();

        let mut watch = refresher.watch();
        let initial = watch.borrow_and_update().clone();
        assert!(initial.starts_with("SharedAccessSignature sr="));

        // Paused time fast-forwards through the refresh interval; the
        // loop publishes a token generated against the new deadline.
        watch.changed().await.unwrap();
        let refreshed = watch.borrow_and_update().clone();
        assert!(refreshed.starts_with("SharedAccessSignature sr="));

        cancellation.cancel();
    }
}
