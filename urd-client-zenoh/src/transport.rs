//! Zenoh implementation of the client transport
//!
//! Queries map to `session.get`, subscriptions to callback subscribers.

use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, info, warn};
use urd_client::transport::{Payload, ReplyStream, SampleHandler};
use urd_client::{Transport, TransportError, TransportSubscription};
use zenoh::pubsub::Subscriber;
use zenoh::sample::Sample;
use zenoh::Session;

/// Client transport over a Zenoh session.
#[derive(Clone)]
pub struct ZenohTransport {
    session: Session,
}

impl ZenohTransport {
    /// Open a new Zenoh session with `config`.
    pub async fn open(config: zenoh::Config) -> Result<Self, TransportError> {
        info!("Opening Zenoh session for URD client");
        let session = zenoh::open(config)
            .await
            .map_err(|e| TransportError::Unreachable(format!("Failed to open Zenoh session: {}", e)))?;
        Ok(Self { session })
    }

    /// Wrap an already open session. Closing the transport closes it.
    pub fn from_session(session: Session) -> Self {
        Self { session }
    }

    /// Get the underlying Zenoh session for advanced usage
    pub fn session(&self) -> &Session {
        &self.session
    }
}

#[async_trait]
impl Transport for ZenohTransport {
    async fn query(
        &self,
        topic: &str,
        payload: Option<Payload>,
        timeout: Duration,
    ) -> Result<ReplyStream, TransportError> {
        if self.session.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut get = self.session.get(topic).timeout(timeout);
        if let Some(payload) = payload {
            get = get.payload(payload);
        }
        let replies = get
            .await
            .map_err(|e| TransportError::Query(format!("Failed to send query on '{}': {}", topic, e)))?;

        // The channel closes once Zenoh's own query timeout fires or every
        // queryable has answered.
        let stream = futures::stream::unfold(replies, |replies| async move {
            let reply = replies.recv_async().await.ok()?;
            let item = match reply.result() {
                Ok(sample) => Ok(sample.payload().to_bytes().into_owned()),
                Err(err) => Err(TransportError::ErrorReply(
                    String::from_utf8_lossy(&err.payload().to_bytes()).into_owned(),
                )),
            };
            Some((item, replies))
        });
        Ok(stream.boxed())
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: SampleHandler,
    ) -> Result<Box<dyn TransportSubscription>, TransportError> {
        if self.session.is_closed() {
            return Err(TransportError::Closed);
        }

        let subscriber = self
            .session
            .declare_subscriber(topic.to_string())
            .callback(move |sample: Sample| handler(sample.payload().to_bytes().into_owned()))
            .await
            .map_err(|e| {
                TransportError::Subscribe(format!("Failed to declare subscriber on '{}': {}", topic, e))
            })?;

        debug!("Declared Zenoh subscriber on '{}'", topic);
        Ok(Box::new(ZenohSubscription {
            topic: topic.to_string(),
            subscriber,
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        info!("Closing Zenoh session");
        self.session
            .close()
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close Zenoh session: {}", e)))
    }
}

struct ZenohSubscription {
    topic: String,
    subscriber: Subscriber<()>,
}

#[async_trait]
impl TransportSubscription for ZenohSubscription {
    async fn undeclare(self: Box<Self>) -> Result<(), TransportError> {
        let ZenohSubscription { topic, subscriber } = *self;
        subscriber.undeclare().await.map_err(|e| {
            warn!("Failed to undeclare subscriber on '{}': {}", topic, e);
            TransportError::Subscribe(format!("Failed to undeclare subscriber on '{}': {}", topic, e))
        })?;
        debug!("Undeclared Zenoh subscriber on '{}'", topic);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn zenoh_enabled() -> bool {
        std::env::var("ZENOH_TEST_ENABLED").is_ok()
    }

    #[tokio::test]
    async fn test_query_reply_roundtrip() {
        // This test requires Zenoh networking, so we'll make it conditional
        if !zenoh_enabled() {
            return;
        }

        let transport = ZenohTransport::open(zenoh::Config::default()).await.unwrap();
        let queryable = transport
            .session()
            .declare_queryable("test/urd_client/echo")
            .await
            .unwrap();
        tokio::spawn(async move {
            while let Ok(query) = queryable.recv_async().await {
                let body = query
                    .payload()
                    .map(|p| p.to_bytes().into_owned())
                    .unwrap_or_default();
                query.reply(query.key_expr().clone(), body).await.ok();
            }
        });

        let mut replies = transport
            .query("test/urd_client/echo", Some(b"{\"ping\":1}".to_vec()), Duration::from_secs(2))
            .await
            .unwrap();
        let first = replies.next().await.unwrap().unwrap();
        assert_eq!(first, b"{\"ping\":1}".to_vec());

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_subscription_receives_and_undeclares() {
        if !zenoh_enabled() {
            return;
        }

        let transport = ZenohTransport::open(zenoh::Config::default()).await.unwrap();
        let received = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&received);
        let sub = transport
            .subscribe(
                "test/urd_client/ticks",
                Box::new(move |_: Vec<u8>| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        transport
            .session()
            .put("test/urd_client/ticks", "{\"n\":1}")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(received.load(Ordering::SeqCst), 1);

        sub.undeclare().await.unwrap();
        transport
            .session()
            .put("test/urd_client/ticks", "{\"n\":2}")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(received.load(Ordering::SeqCst), 1);

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_session_rejects_queries() {
        if !zenoh_enabled() {
            return;
        }

        let transport = ZenohTransport::open(zenoh::Config::default()).await.unwrap();
        transport.close().await.unwrap();
        let result = transport
            .query("test/urd_client/echo", None, Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }
}
