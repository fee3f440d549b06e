use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::device::transport::MethodDispatcher;
use crate::error::{Error, Result};
use crate::message::Message;

/// Buffer of each subscriber sink. A dispatch that would block spills
/// into a spawned delivery task instead of stalling the router.
const SINK_BUFFER: usize = 1;

/// One-shot guard around the physical transport subscription.
///
/// An atomic fast path over a mutex-held slow path; the flag is only
/// set after the guarded call succeeded, so a failed subscription can
/// be retried by the next caller.
pub(crate) struct SubscribeOnce {
    done: AtomicBool,
    lock: Mutex<()>,
}

impl SubscribeOnce {
    pub(crate) fn new() -> Self {
        SubscribeOnce {
            done: AtomicBool::new(false),
            lock: Mutex::new(()),
        }
    }

    /// Run `f` exactly once across all callers. Concurrent callers wait
    /// for the winner and observe its outcome through the flag.
    pub(crate) async fn call<F, Fut>(&self, f: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if self.done.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.lock.lock().await;
        if self.done.load(Ordering::Acquire) {
            return Ok(());
        }
        f().await?;
        self.done.store(true, Ordering::Release);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

type ErrSlot = Arc<StdMutex<Option<Error>>>;

/// A live subscription handle: a bounded receiving channel paired with
/// an error slot that is filled when the stream terminates abnormally.
///
/// Dropping the handle unsubscribes implicitly; closed sinks are pruned
/// on the next dispatch.
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::Receiver<T>,
    err: ErrSlot,
}

/// Stream of cloud-to-device messages.
pub type EventStream = Subscription<Message>;

/// Stream of twin desired-state patches, delivered as raw JSON bytes.
pub type TwinUpdateStream = Subscription<Vec<u8>>;

impl<T> Subscription<T> {
    /// Receive the next item, or `None` once the stream has ended.
    /// After `None`, [`Subscription::error`] tells why.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// The terminal error of this stream, if it ended abnormally.
    pub fn error(&self) -> Option<Error> {
        self.err.lock().unwrap().clone()
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

struct Sink<T> {
    id: u64,
    tx: mpsc::Sender<T>,
    err: ErrSlot,
}

/// Fan-out of one inbound stream to any number of subscribers.
///
/// Holds the subscribe-once latch for its physical subscription and the
/// subscriber set. Dispatch delivers under a read lock; a full sink
/// gets its delivery spawned so slow subscribers cannot block peers.
pub(crate) struct FanOut<T> {
    pub(crate) latch: SubscribeOnce,
    sinks: RwLock<Vec<Sink<T>>>,
    next_id: AtomicU64,
}

impl<T: Clone + Send + 'static> FanOut<T> {
    pub(crate) fn new() -> Self {
        FanOut {
            latch: SubscribeOnce::new(),
            sinks: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) async fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(SINK_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let err = Arc::new(StdMutex::new(None));
        self.sinks.write().await.push(Sink {
            id,
            tx,
            err: err.clone(),
        });
        Subscription { id, rx, err }
    }

    pub(crate) async fn unsubscribe(&self, id: u64) {
        self.sinks.write().await.retain(|s| s.id != id);
    }

    /// Deliver `item` to every live subscriber.
    pub(crate) async fn dispatch(&self, item: T) {
        let sinks = self.sinks.read().await;
        for sink in sinks.iter() {
            match sink.tx.try_send(item.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(item)) => {
                    let tx = sink.tx.clone();
                    tokio::spawn(async move {
                        _ = tx.send(item).await;
                    });
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        drop(sinks);
        self.sinks.write().await.retain(|s| !s.tx.is_closed());
    }

    /// Terminate every subscription, recording `err` in each handle's
    /// error slot. Dropping the senders closes the streams.
    pub(crate) async fn shutdown(&self, err: Option<Error>) {
        let mut sinks = self.sinks.write().await;
        for sink in sinks.drain(..) {
            *sink.err.lock().unwrap() = err.clone();
        }
    }

    pub(crate) async fn subscriber_count(&self) -> usize {
        self.sinks.read().await.len()
    }
}

/// A registered direct-method handler. Returning `Err` maps to status
/// 500 with the error text as the payload.
pub type MethodHandler =
    Arc<dyn Fn(&[u8]) -> anyhow::Result<Vec<u8>> + Send + Sync + 'static>;

/// Named direct-method dispatch table.
///
/// Registration is keyed by method name and rejects duplicates. The
/// transport invokes [`MethodDispatcher::dispatch`]; an unregistered
/// name answers with status 0 and an empty payload.
pub(crate) struct MethodMux {
    pub(crate) latch: SubscribeOnce,
    handlers: RwLock<HashMap<String, MethodHandler>>,
}

impl MethodMux {
    pub(crate) fn new() -> Self {
        MethodMux {
            latch: SubscribeOnce::new(),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) async fn register(&self, name: &str, handler: MethodHandler) -> Result<()> {
        let mut handlers = self.handlers.write().await;
        if handlers.contains_key(name) {
            return Err(Error::AlreadyRegistered(name.to_string()));
        }
        handlers.insert(name.to_string(), handler);
        Ok(())
    }

    pub(crate) async fn unregister(&self, name: &str) {
        self.handlers.write().await.remove(name);
    }
}

#[async_trait]
impl MethodDispatcher for MethodMux {
    async fn dispatch(&self, method: &str, payload: &[u8]) -> (i32, Vec<u8>) {
        let handler = self.handlers.read().await.get(method).cloned();
        match handler {
            Some(handler) => match handler(payload) {
                Ok(response) => (200, response),
                Err(e) => {
                    log::error!("Direct method {method:?} handler failed: {e:?}");
                    (500, e.to_string().into_bytes())
                }
            },
            None => {
                log::warn!("No handler registered for direct method {method:?}");
                (0, Vec::new())
            }
        }
    }
}
