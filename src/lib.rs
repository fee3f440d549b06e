//! Device and service SDK for Azure IoT Hub.
//!
//! The crate has two symmetric halves. The device half connects from
//! an edge node over MQTT: device-to-cloud events, cloud-to-device
//! messages, direct methods, and twin state synchronization. The
//! service half operates the hub itself: cloud-to-device sends and
//! delivery feedback over AMQP, the device-to-cloud event stream
//! through the event-hub-compatible endpoint, and direct-method
//! invocation over REST.
//!
//! ```no_run
//! use iothub::{DeviceClient, SendOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> iothub::Result<()> {
//!     let client = DeviceClient::from_connection_string(
//!         "HostName=my-hub.azure-devices.net;DeviceId=mydev;SharedAccessKey=c2VjcmV0",
//!     )?;
//!     let ct = CancellationToken::new();
//!     client.connect(&ct).await?;
//!     client
//!         .send(&ct, b"hello".to_vec(), SendOptions::new().message_id("m-1"))
//!         .await?;
//!     client.close().await
//! }
//! ```

mod credentials;
mod error;
mod message;
mod twin;

pub mod device;
pub mod service;

pub use credentials::{ConnectionString, Credentials};
pub use device::{DeviceClient, DeviceClientBuilder};
pub use error::{Error, Result};
pub use message::{AckMode, Message, Qos, SendOptions};
pub use service::ServiceClient;
pub use twin::TwinState;
