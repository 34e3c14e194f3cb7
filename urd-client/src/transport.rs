//! Transport abstraction for the URD client
//!
//! Provides a trait-based seam over the query/reply and publish/subscribe
//! primitives the client needs, so the engine can run on any messaging
//! substrate (Zenoh, an in-process bus, etc.) without depending on it.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;
use thiserror::Error;

/// Raw payload bytes as carried by the transport.
pub type Payload = Vec<u8>;

/// One reply to a query. `Err` carries an error reply sent by the remote side.
pub type Reply = std::result::Result<Payload, TransportError>;

/// Replies to a single query, in arrival order.
///
/// A transport ends the stream once its own query timeout has elapsed or all
/// responders have answered. The client never relies on the stream ending.
pub type ReplyStream = BoxStream<'static, Reply>;

/// Handler invoked by the transport for every sample received on a subscription.
pub type SampleHandler = Box<dyn Fn(Payload) + Send + Sync + 'static>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport unreachable: {0}")]
    Unreachable(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("error reply: {0}")]
    ErrorReply(String),

    #[error("subscription failed: {0}")]
    Subscribe(String),

    #[error("transport closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

/// Messaging substrate used by the client.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a query on `topic` and return the stream of replies.
    async fn query(
        &self,
        topic: &str,
        payload: Option<Payload>,
        timeout: Duration,
    ) -> Result<ReplyStream, TransportError>;

    /// Register `handler` for every sample published on `topic`.
    async fn subscribe(
        &self,
        topic: &str,
        handler: SampleHandler,
    ) -> Result<Box<dyn TransportSubscription>, TransportError>;

    /// Close the underlying session. Called at most once by the client.
    async fn close(&self) -> Result<(), TransportError>;
}

/// A live transport-level subscription.
#[async_trait]
pub trait TransportSubscription: Send + Sync {
    /// Stop delivery and release the subscription.
    async fn undeclare(self: Box<Self>) -> Result<(), TransportError>;
}
