//! Delivery-feedback consumption.
//!
//! Cloud-to-device messages sent with an ack request produce feedback
//! records on `/messages/servicebound/feedback`; each delivery carries
//! a JSON array of them.

use chrono::{DateTime, Utc};
use fe2o3_amqp::connection::ConnectionHandle;
use fe2o3_amqp::{Receiver, Session};
use serde::Deserialize;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

use super::amqp::{self, WireBody};

const FEEDBACK_ADDRESS: &str = "/messages/servicebound/feedback";
const FEEDBACK_BUFFER: usize = 10;

/// The delivery outcome of one acknowledged cloud-to-device message.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feedback {
    pub original_message_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub device_generation_id: String,
    pub device_id: String,
    #[serde(default)]
    pub enqueued_time_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status_code: String,
}

/// Attach the feedback link and stream its records until cancellation
/// or a link failure.
pub(crate) async fn subscribe(
    connection: &mut ConnectionHandle<()>,
    cancellation: CancellationToken,
) -> Result<mpsc::Receiver<Feedback>> {
    let mut session = Session::begin(connection)
        .await
        .map_err(|e| Error::network(e))?;
    let mut receiver = Receiver::attach(&mut session, "feedback-receiver", FEEDBACK_ADDRESS)
        .await
        .map_err(|e| Error::network(e))?;

    let (tx, rx) = mpsc::channel(FEEDBACK_BUFFER);
    tokio::spawn(async move {
        loop {
            select! {
                _ = cancellation.cancelled() => break,
                delivery = receiver.recv::<WireBody>() => {
                    let delivery = match delivery {
                        Ok(delivery) => delivery,
                        Err(e) => {
                            log::warn!("Feedback link failed: {e}");
                            break;
                        }
                    };
                    if let Err(e) = receiver.accept(&delivery).await {
                        log::warn!("Unable to settle feedback delivery: {e}");
                        break;
                    }
                    let payload = amqp::body_bytes(delivery.body());
                    match serde_json::from_slice::<Vec<Feedback>>(&payload) {
                        Ok(records) => {
                            for record in records {
                                if tx.send(record).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => log::warn!("Ignoring malformed feedback payload: {e}"),
                    }
                }
            }
        }
        _ = session.end().await;
        log::debug!("Feedback receiver stopped");
    });

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feedback_records_parse_from_the_wire_shape() {
        let payload = br#"[{
            "originalMessageId": "mid-1",
            "description": "Success",
            "deviceGenerationId": "635756332941533330",
            "deviceId": "dev-1",
            "enqueuedTimeUtc": "2023-03-01T12:00:00Z",
            "statusCode": "Success"
        }]"#;
        let records: Vec<Feedback> = serde_json::from_slice(payload).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].original_message_id, "mid-1");
        assert_eq!(records[0].device_id, "dev-1");
        assert_eq!(records[0].status_code, "Success");
        assert!(records[0].enqueued_time_utc.is_some());
    }
}
