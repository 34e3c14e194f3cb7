//! In-process transport
//!
//! Loopback implementation of [`Transport`] where queryables are closures and
//! publishing calls subscribers synchronously. Used for embedding the client
//! next to an in-process daemon and for testing without a network.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::transport::{
    Payload, Reply, ReplyStream, SampleHandler, Transport, TransportError, TransportSubscription,
};

type ReplyFn = Arc<dyn Fn(Option<&[u8]>) -> Vec<Reply> + Send + Sync>;

#[derive(Clone)]
enum Responder {
    /// Replies immediately with whatever the closure returns.
    Immediate(ReplyFn),
    /// Replies after a fixed delay.
    Delayed(Duration, ReplyFn),
    /// Accepts the query and never answers.
    Silent,
    /// Fails the query at the transport level.
    Fail(TransportError),
}

/// A query observed by the memory transport.
#[derive(Debug, Clone)]
pub struct QueryRecord {
    pub topic: String,
    pub payload: Option<Payload>,
    pub timeout: Duration,
}

#[derive(Default)]
struct Inner {
    responders: Mutex<HashMap<String, Responder>>,
    subscribers: Mutex<HashMap<String, Vec<(u64, Arc<SampleHandler>)>>>,
    queries: Mutex<Vec<QueryRecord>>,
    next_subscriber_id: AtomicU64,
    unreachable: AtomicBool,
    close_count: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Loopback transport. Clones share the same bus.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer queries on `topic` with the replies produced by `f`.
    pub fn respond<F>(&self, topic: &str, f: F)
    where
        F: Fn(Option<&[u8]>) -> Vec<Reply> + Send + Sync + 'static,
    {
        self.set_responder(topic, Responder::Immediate(Arc::new(f)));
    }

    /// Answer every query on `topic` with the same JSON document.
    pub fn respond_json(&self, topic: &str, value: serde_json::Value) {
        let bytes = value.to_string().into_bytes();
        self.respond(topic, move |_| vec![Ok(bytes.clone())]);
    }

    /// Answer queries on `topic` after `delay`.
    pub fn respond_after<F>(&self, topic: &str, delay: Duration, f: F)
    where
        F: Fn(Option<&[u8]>) -> Vec<Reply> + Send + Sync + 'static,
    {
        self.set_responder(topic, Responder::Delayed(delay, Arc::new(f)));
    }

    /// Accept queries on `topic` but never reply.
    pub fn silent(&self, topic: &str) {
        self.set_responder(topic, Responder::Silent);
    }

    /// Fail queries on `topic` with `error`.
    pub fn fail(&self, topic: &str, error: TransportError) {
        self.set_responder(topic, Responder::Fail(error));
    }

    /// Make every operation fail as if the network were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Deliver `payload` to every subscriber of `topic`, returning how many got it.
    pub fn publish(&self, topic: &str, payload: impl Into<Payload>) -> usize {
        let payload = payload.into();
        let handlers: Vec<Arc<SampleHandler>> = lock(&self.inner.subscribers)
            .get(topic)
            .map(|subs| subs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        for handler in &handlers {
            handler(payload.clone());
        }
        handlers.len()
    }

    /// Publish a JSON document on `topic`.
    pub fn publish_json(&self, topic: &str, value: &serde_json::Value) -> usize {
        self.publish(topic, value.to_string().into_bytes())
    }

    pub fn query_count(&self) -> usize {
        lock(&self.inner.queries).len()
    }

    pub fn queries(&self) -> Vec<QueryRecord> {
        lock(&self.inner.queries).clone()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        lock(&self.inner.subscribers)
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Number of times `close` was called.
    pub fn close_count(&self) -> usize {
        self.inner.close_count.load(Ordering::SeqCst)
    }

    fn set_responder(&self, topic: &str, responder: Responder) {
        lock(&self.inner.responders).insert(topic.to_string(), responder);
    }

    fn check_reachable(&self) -> Result<(), TransportError> {
        if self.inner.unreachable.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable("memory transport offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn query(
        &self,
        topic: &str,
        payload: Option<Payload>,
        timeout: Duration,
    ) -> Result<ReplyStream, TransportError> {
        self.check_reachable()?;

        lock(&self.inner.queries).push(QueryRecord {
            topic: topic.to_string(),
            payload: payload.clone(),
            timeout,
        });

        let responder = lock(&self.inner.responders).get(topic).cloned();
        debug!("memory query on '{}' (responder: {})", topic, responder.is_some());

        let replies: ReplyStream = match responder {
            None => stream::empty().boxed(),
            Some(Responder::Immediate(f)) => stream::iter(f(payload.as_deref())).boxed(),
            Some(Responder::Delayed(delay, f)) => {
                let replies = f(payload.as_deref());
                stream::once(async move {
                    tokio::time::sleep(delay).await;
                    stream::iter(replies)
                })
                .flatten()
                .boxed()
            }
            Some(Responder::Silent) => stream::pending().boxed(),
            Some(Responder::Fail(error)) => return Err(error),
        };
        Ok(replies)
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: SampleHandler,
    ) -> Result<Box<dyn TransportSubscription>, TransportError> {
        self.check_reachable()?;

        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.subscribers)
            .entry(topic.to_string())
            .or_default()
            .push((id, Arc::new(handler)));

        Ok(Box::new(MemorySubscription {
            inner: Arc::clone(&self.inner),
            topic: topic.to_string(),
            id,
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.close_count.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.subscribers).clear();
        Ok(())
    }
}

struct MemorySubscription {
    inner: Arc<Inner>,
    topic: String,
    id: u64,
}

impl MemorySubscription {
    fn remove(&self) {
        let mut subscribers = lock(&self.inner.subscribers);
        if let Some(subs) = subscribers.get_mut(&self.topic) {
            subs.retain(|(id, _)| *id != self.id);
            if subs.is_empty() {
                subscribers.remove(&self.topic);
            }
        }
    }
}

#[async_trait]
impl TransportSubscription for MemorySubscription {
    async fn undeclare(self: Box<Self>) -> Result<(), TransportError> {
        self.remove();
        Ok(())
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.remove();
    }
}
