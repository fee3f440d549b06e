use thiserror::Error;

/// Errors returned by the device and service clients.
///
/// The variants follow the failure surfaces of the SDK: configuration
/// parsing, authentication, transport I/O, protocol violations, hub
/// responses, and client lifecycle. Network errors are kept distinct
/// because the background reconnect logic keys off of them; protocol
/// errors are never retried.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Malformed connection string, missing credentials, or an unknown
    /// option.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid or expired SAS, a rejected certificate, or a missing
    /// symmetric key.
    #[error("authentication error: {0}")]
    Auth(String),

    /// A SAS token was requested from x509 credentials.
    #[error("credentials hold a certificate, not a shared access key")]
    AuthKindMismatch,

    /// Transport-level I/O failure, TLS handshake failure, or a broker
    /// disconnect.
    #[error("network error: {0}")]
    Network(String),

    /// Malformed topic, missing required header, unexpected response
    /// shape, or missing redirect info.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A non-2xx twin or REST response.
    #[error("request failed with status {0}")]
    Request(u16),

    /// `connect` was called on an already connected client.
    #[error("client is already connected")]
    AlreadyConnected,

    /// An operation that needs a live connection was called before
    /// `connect`.
    #[error("client is not connected")]
    NotConnected,

    /// A direct-method handler is already registered under this name.
    #[error("method {0:?} is already registered")]
    AlreadyRegistered(String),

    /// The client was closed.
    #[error("client is closed")]
    Closed,

    /// The cancellation scope supplied to the operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation did not complete within its deadline.
    #[error("operation timed out")]
    Timeout,
}

impl Error {
    pub(crate) fn network(err: impl std::fmt::Display) -> Self {
        Error::Network(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<rumqttc::ClientError> for Error {
    fn from(err: rumqttc::ClientError) -> Self {
        Error::Network(err.to_string())
    }
}
