//! Twin request/response correlation.
//!
//! Twin traffic shares one response topic, so requests are matched by a
//! request ID generated from a monotonic counter. Each pending request
//! holds a single-slot channel; a response for an unknown ID (late,
//! duplicate, or fabricated) is a protocol error and is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::error::{Error, Result};

#[derive(Debug)]
pub(crate) struct TwinResponse {
    pub(crate) status: u16,
    pub(crate) version: Option<u64>,
    pub(crate) payload: Vec<u8>,
}

pub(crate) struct Correlator {
    next_rid: AtomicU32,
    pending: Mutex<HashMap<u32, oneshot::Sender<TwinResponse>>>,
}

impl Correlator {
    pub(crate) fn new() -> Self {
        Correlator {
            next_rid: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a request ID and park a response slot for it.
    pub(crate) fn register(&self) -> (u32, oneshot::Receiver<TwinResponse>) {
        let rid = self.next_rid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(rid, tx);
        (rid, rx)
    }

    /// Deliver a response to its waiter. Fails with a protocol error
    /// when no request is pending under `rid`.
    pub(crate) fn complete(&self, rid: u32, response: TwinResponse) -> Result<()> {
        let tx = self
            .pending
            .lock()
            .unwrap()
            .remove(&rid)
            .ok_or_else(|| {
                Error::Protocol(format!("unexpected twin response for request {rid:#x}"))
            })?;
        // The waiter may have timed out or been cancelled in the
        // meantime; that is not an error.
        _ = tx.send(response);
        Ok(())
    }

    /// Forget a request whose waiter gave up.
    pub(crate) fn unregister(&self, rid: u32) {
        self.pending.lock().unwrap().remove(&rid);
    }

    /// Drop every pending slot, waking all waiters with a closed
    /// channel. Called when the transport shuts down.
    pub(crate) fn abort_all(&self) {
        self.pending.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16) -> TwinResponse {
        TwinResponse {
            status,
            version: None,
            payload: Vec::new(),
        }
    }

    #[test]
    fn request_ids_never_collide() {
        let correlator = Correlator::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let (rid, _rx) = correlator.register();
            assert!(seen.insert(rid));
            correlator.unregister(rid);
        }
    }

    #[tokio::test]
    async fn response_reaches_the_registered_waiter() {
        let correlator = Correlator::new();
        let (rid_a, rx_a) = correlator.register();
        let (_rid_b, _rx_b) = correlator.register();

        correlator
            .complete(
                rid_a,
                TwinResponse {
                    status: 200,
                    version: Some(4),
                    payload: b"{}".to_vec(),
                },
            )
            .unwrap();

        let resp = rx_a.await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.version, Some(4));
    }

    #[test]
    fn duplicate_responses_are_a_protocol_error() {
        let correlator = Correlator::new();
        let (rid, _rx) = correlator.register();
        correlator.complete(rid, response(200)).unwrap();
        let err = correlator.complete(rid, response(200)).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn abort_wakes_waiters_with_closed_channel() {
        let correlator = Correlator::new();
        let (_rid, rx) = correlator.register();
        correlator.abort_all();
        assert!(rx.await.is_err());
    }
}
