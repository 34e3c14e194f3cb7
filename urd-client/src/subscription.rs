//! Topic subscriptions
//!
//! A subscription goes `Created -> Active -> (Draining | Cancelled) -> Closed`.
//! It is bounded by a timeout measured from its start and optionally by a
//! message count; whichever comes first drains it. The transport handler only
//! forwards raw samples into a bounded channel, consumers decode on their side.
//!
//! Pull mode hands the channel to the caller through [`Subscription`]. Push
//! mode spawns one tokio task per subscription that drives a callback.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ClientError, Result};
use crate::transport::{Payload, Transport, TransportSubscription};

const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Created,
    Active,
    Draining,
    Cancelled,
    Closed,
}

impl SubscriptionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SubscriptionState::Created,
            1 => SubscriptionState::Active,
            2 => SubscriptionState::Draining,
            3 => SubscriptionState::Cancelled,
            _ => SubscriptionState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            SubscriptionState::Created => 0,
            SubscriptionState::Active => 1,
            SubscriptionState::Draining => 2,
            SubscriptionState::Cancelled => 3,
            SubscriptionState::Closed => 4,
        }
    }
}

/// Why a subscription stopped delivering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    CountReached,
    TimedOut,
    Cancelled,
    TransportClosed,
}

impl EndReason {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(EndReason::CountReached),
            2 => Some(EndReason::TimedOut),
            3 => Some(EndReason::Cancelled),
            4 => Some(EndReason::TransportClosed),
            _ => None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            EndReason::CountReached => 1,
            EndReason::TimedOut => 2,
            EndReason::Cancelled => 3,
            EndReason::TransportClosed => 4,
        }
    }
}

/// Limits for one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Measured from the moment the subscription is requested
    pub timeout: Duration,
    /// Maximum number of delivered messages, `None` for no limit
    pub count: Option<usize>,
}

impl SubscribeOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            count: None,
        }
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }
}

/// One message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    topic: Arc<str>,
    payload: Value,
    received_at: DateTime<Utc>,
}

impl Message {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Field of an object payload.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn into_payload(self) -> Value {
        self.payload
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.payload)
    }
}

/// State shared by the consumer, the transport handler and the client.
struct SessionCore {
    id: Uuid,
    topic: Arc<str>,
    state: AtomicU8,
    end_reason: AtomicU8,
    delivered: AtomicUsize,
    dropped: Arc<AtomicUsize>,
    cancel_tx: watch::Sender<bool>,
    closed_tx: watch::Sender<bool>,
    transport_sub: tokio::sync::Mutex<Option<Box<dyn TransportSubscription>>>,
}

impl SessionCore {
    fn new(topic: &str) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        let (closed_tx, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            topic: Arc::from(topic),
            state: AtomicU8::new(SubscriptionState::Created.as_u8()),
            end_reason: AtomicU8::new(0),
            delivered: AtomicUsize::new(0),
            dropped: Arc::new(AtomicUsize::new(0)),
            cancel_tx,
            closed_tx,
            transport_sub: tokio::sync::Mutex::new(None),
        }
    }

    fn state(&self) -> SubscriptionState {
        SubscriptionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn end_reason(&self) -> Option<EndReason> {
        EndReason::from_u8(self.end_reason.load(Ordering::SeqCst))
    }

    fn activate(&self) -> bool {
        self.state
            .compare_exchange(
                SubscriptionState::Created.as_u8(),
                SubscriptionState::Active.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Move out of Created/Active. Only the first caller wins.
    fn begin_end(&self, reason: EndReason) -> bool {
        let target = match reason {
            EndReason::Cancelled => SubscriptionState::Cancelled,
            _ => SubscriptionState::Draining,
        };
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            match SubscriptionState::from_u8(current) {
                SubscriptionState::Created | SubscriptionState::Active => {}
                _ => return false,
            }
            match self.state.compare_exchange(
                current,
                target.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.end_reason.store(reason.as_u8(), Ordering::SeqCst);
        self.cancel_tx.send_replace(true);
        debug!("Subscription {} on '{}' ending: {:?}", self.id, self.topic, reason);
        true
    }

    /// Release the transport subscription. Safe to call any number of times.
    async fn release(&self) {
        // Held across undeclare so concurrent releasers wait for it to finish
        let mut guard = self.transport_sub.lock().await;
        if let Some(sub) = guard.take() {
            if let Err(e) = sub.undeclare().await {
                error!("Failed to undeclare subscription on '{}': {}", self.topic, e);
            }
            info!(
                "Subscription on '{}' closed after {} messages",
                self.topic,
                self.delivered.load(Ordering::SeqCst)
            );
        }
        self.state
            .store(SubscriptionState::Closed.as_u8(), Ordering::SeqCst);
        self.closed_tx.send_replace(true);
    }

    async fn end(&self, reason: EndReason) {
        self.begin_end(reason);
        self.release().await;
    }
}

async fn wait_true(mut rx: watch::Receiver<bool>) {
    // Senders live in the session core, an error only means it is gone
    let _ = rx.wait_for(|flag| *flag).await;
}

/// Deadline `timeout` from now, clamped to roughly 30 years.
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + FAR_FUTURE)
}

fn decode(topic: &Arc<str>, payload: &[u8]) -> Option<Message> {
    match serde_json::from_slice::<Value>(payload) {
        Ok(value) => Some(Message {
            topic: Arc::clone(topic),
            payload: value,
            received_at: Utc::now(),
        }),
        Err(e) => {
            warn!("Skipping undecodable message on '{}': {}", topic, e);
            None
        }
    }
}

/// Source of messages for one subscription, shared by both consumption modes.
struct Feed {
    core: Arc<SessionCore>,
    rx: mpsc::Receiver<Payload>,
    deadline: Instant,
    remaining: Option<usize>,
}

impl Feed {
    async fn next(&mut self) -> Option<Message> {
        loop {
            if self.core.state() != SubscriptionState::Active {
                self.core.release().await;
                return None;
            }
            if self.remaining == Some(0) {
                self.core.end(EndReason::CountReached).await;
                return None;
            }

            let cancelled = wait_true(self.core.cancel_tx.subscribe());
            let payload = tokio::select! {
                biased;
                _ = cancelled => {
                    self.core.release().await;
                    return None;
                }
                _ = tokio::time::sleep_until(self.deadline) => {
                    self.core.end(EndReason::TimedOut).await;
                    return None;
                }
                payload = self.rx.recv() => payload,
            };

            let Some(payload) = payload else {
                self.core.end(EndReason::TransportClosed).await;
                return None;
            };
            let Some(message) = decode(&self.core.topic, &payload) else {
                continue;
            };

            self.core.delivered.fetch_add(1, Ordering::SeqCst);
            if let Some(remaining) = self.remaining.as_mut() {
                *remaining -= 1;
                if *remaining == 0 {
                    self.core.end(EndReason::CountReached).await;
                }
            }
            return Some(message);
        }
    }
}

macro_rules! session_accessors {
    () => {
        pub fn id(&self) -> Uuid {
            self.core().id
        }

        /// Key expression the subscription listens on.
        pub fn topic(&self) -> &str {
            &self.core().topic
        }

        pub fn state(&self) -> SubscriptionState {
            self.core().state()
        }

        pub fn end_reason(&self) -> Option<EndReason> {
            self.core().end_reason()
        }

        pub fn is_active(&self) -> bool {
            self.state() == SubscriptionState::Active
        }

        /// Messages delivered to the consumer so far.
        pub fn delivered(&self) -> usize {
            self.core().delivered.load(Ordering::SeqCst)
        }

        /// Messages discarded because the consumer fell behind.
        pub fn dropped(&self) -> usize {
            self.core().dropped.load(Ordering::SeqCst)
        }

        /// Stop delivery and release the transport subscription.
        pub async fn cancel(&self) {
            self.core().end(EndReason::Cancelled).await;
        }
    };
}

/// Pull-mode subscription: a finite sequence of messages.
pub struct Subscription {
    feed: Feed,
}

impl Subscription {
    fn core(&self) -> &SessionCore {
        &self.feed.core
    }

    session_accessors!();

    /// Wait for the next message. `None` once the count is reached, the
    /// timeout elapsed, or the subscription was cancelled.
    pub async fn next(&mut self) -> Option<Message> {
        self.feed.next().await
    }

    /// Collect every remaining message.
    pub async fn collect(mut self) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Some(message) = self.next().await {
            messages.push(message);
        }
        messages
    }

    pub fn into_stream(self) -> impl futures::Stream<Item = Message> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|message| (message, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Transport handle is released when the last reference to the core goes
        self.feed.core.begin_end(EndReason::Cancelled);
    }
}

/// Handle to a push-mode subscription running on its own task.
///
/// Dropping the handle does not stop the subscription.
#[derive(Clone)]
pub struct SubscriptionHandle {
    core: Arc<SessionCore>,
}

impl SubscriptionHandle {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    session_accessors!();

    /// Wait until the subscription has been torn down.
    pub async fn finished(&self) {
        wait_true(self.core.closed_tx.subscribe()).await;
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.core.id)
            .field("topic", &self.core.topic)
            .field("state", &self.core.state())
            .finish()
    }
}

/// Creates subscriptions and tracks them for client shutdown.
pub struct SubscriptionEngine {
    transport: Arc<dyn Transport>,
    buffer: usize,
    closed: Arc<AtomicBool>,
    sessions: Mutex<Vec<Weak<SessionCore>>>,
}

impl SubscriptionEngine {
    pub fn new(transport: Arc<dyn Transport>, buffer: usize) -> Self {
        Self::with_closed_flag(transport, buffer, Arc::new(AtomicBool::new(false)))
    }

    pub(crate) fn with_closed_flag(
        transport: Arc<dyn Transport>,
        buffer: usize,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            transport,
            buffer: buffer.max(1),
            closed,
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// Pull-mode subscription on `topic`.
    pub async fn subscribe(&self, topic: &str, options: SubscribeOptions) -> Result<Subscription> {
        let feed = self.open(topic, options).await?;
        Ok(Subscription { feed })
    }

    /// Push-mode subscription: `callback` runs on a background task for each
    /// message until the count or timeout is reached.
    pub async fn subscribe_with<F>(
        &self,
        topic: &str,
        options: SubscribeOptions,
        mut callback: F,
    ) -> Result<SubscriptionHandle>
    where
        F: FnMut(Message) + Send + 'static,
    {
        let mut feed = self.open(topic, options).await?;
        let core = Arc::clone(&feed.core);

        tokio::spawn(async move {
            while let Some(message) = feed.next().await {
                callback(message);
            }
            feed.core.release().await;
        });

        Ok(SubscriptionHandle { core })
    }

    /// Number of subscriptions still delivering.
    pub fn active_count(&self) -> usize {
        self.live_sessions()
            .iter()
            .filter(|core| core.state() == SubscriptionState::Active)
            .count()
    }

    /// Cancel every live subscription and wait for the transport to release them.
    pub async fn close_all(&self) {
        for core in self.live_sessions() {
            core.end(EndReason::Cancelled).await;
        }
    }

    /// Signal cancellation without waiting. Usable from `Drop`.
    pub fn cancel_all(&self) {
        for core in self.live_sessions() {
            core.begin_end(EndReason::Cancelled);
        }
    }

    /// Number of sessions still tracked for shutdown.
    #[cfg(test)]
    fn tracked_count(&self) -> usize {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn live_sessions(&self) -> Vec<Arc<SessionCore>> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.retain(|weak| weak.strong_count() > 0);
        sessions.iter().filter_map(Weak::upgrade).collect()
    }

    async fn open(&self, topic: &str, options: SubscribeOptions) -> Result<Feed> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::ClientClosed);
        }

        let deadline = deadline_after(options.timeout);
        let core = Arc::new(SessionCore::new(topic));
        let (tx, rx) = mpsc::channel(self.buffer);

        if options.count == Some(0) {
            core.end(EndReason::CountReached).await;
            return Ok(Feed {
                core,
                rx,
                deadline,
                remaining: Some(0),
            });
        }

        let dropped = Arc::clone(&core.dropped);
        let handler_topic = Arc::clone(&core.topic);
        let handler = Box::new(move |payload: Payload| match tx.try_send(payload) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let total = dropped.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    "Subscriber on '{}' is lagging, dropped message ({} total)",
                    handler_topic, total
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        });

        let transport_sub = self
            .transport
            .subscribe(topic, handler)
            .await
            .map_err(|source| ClientError::Subscription {
                topic: topic.to_string(),
                source,
            })?;

        *core.transport_sub.lock().await = Some(transport_sub);
        core.activate();
        info!(
            "Subscribed to '{}' (timeout {:?}, count {:?})",
            topic, options.timeout, options.count
        );

        {
            let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            sessions.retain(|weak| weak.strong_count() > 0);
            sessions.push(Arc::downgrade(&core));
        }

        // The client may have closed while the transport was subscribing
        if self.closed.load(Ordering::SeqCst) {
            core.end(EndReason::Cancelled).await;
        }

        Ok(Feed {
            core,
            rx,
            deadline,
            remaining: options.count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    const BLOCKS: &str = "urd/robot/blocks";

    fn engine(transport: &MemoryTransport) -> SubscriptionEngine {
        SubscriptionEngine::new(Arc::new(transport.clone()), 16)
    }

    fn block(id: usize) -> serde_json::Value {
        json!({"block_id": format!("block_{}", id), "status": "completed", "execution_time_ms": 12})
    }

    #[tokio::test]
    async fn test_pull_stops_at_count() {
        let transport = MemoryTransport::new();
        let engine = engine(&transport);
        let sub = engine
            .subscribe(BLOCKS, SubscribeOptions::new(Duration::from_secs(10)).with_count(3))
            .await
            .unwrap();

        let publisher = transport.clone();
        tokio::spawn(async move {
            for i in 0..5 {
                publisher.publish_json(BLOCKS, &block(i));
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });

        let start = std::time::Instant::now();
        let messages = sub.collect().await;
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].get("block_id"), Some(&json!("block_0")));
        assert_eq!(messages[2].get("block_id"), Some(&json!("block_2")));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(transport.subscriber_count(BLOCKS), 0);
    }

    #[tokio::test]
    async fn test_pull_stops_at_timeout_without_error() {
        let transport = MemoryTransport::new();
        let engine = engine(&transport);
        let mut sub = engine
            .subscribe(BLOCKS, SubscribeOptions::new(Duration::from_millis(300)).with_count(5))
            .await
            .unwrap();

        transport.publish_json(BLOCKS, &block(0));

        let start = std::time::Instant::now();
        assert!(sub.next().await.is_some());
        assert!(sub.next().await.is_none());
        assert!(start.elapsed() >= Duration::from_millis(250));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(sub.end_reason(), Some(EndReason::TimedOut));
        assert_eq!(sub.state(), SubscriptionState::Closed);
        assert_eq!(sub.delivered(), 1);
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_empty_sequence_is_valid() {
        let transport = MemoryTransport::new();
        let engine = engine(&transport);
        let sub = engine
            .subscribe(BLOCKS, SubscribeOptions::new(Duration::from_millis(50)))
            .await
            .unwrap();
        assert!(sub.collect().await.is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_messages_do_not_count() {
        let transport = MemoryTransport::new();
        let engine = engine(&transport);
        let sub = engine
            .subscribe(BLOCKS, SubscribeOptions::new(Duration::from_secs(5)).with_count(2))
            .await
            .unwrap();

        transport.publish(BLOCKS, b"\xff\xfe".to_vec());
        transport.publish_json(BLOCKS, &block(1));
        transport.publish_json(BLOCKS, &block(2));

        let messages = sub.collect().await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].get("block_id"), Some(&json!("block_1")));
    }

    #[tokio::test]
    async fn test_zero_count_never_subscribes() {
        let transport = MemoryTransport::new();
        let engine = engine(&transport);
        let mut sub = engine
            .subscribe(BLOCKS, SubscribeOptions::new(Duration::from_secs(5)).with_count(0))
            .await
            .unwrap();
        assert!(sub.next().await.is_none());
        assert_eq!(sub.state(), SubscriptionState::Closed);
        assert_eq!(transport.subscriber_count(BLOCKS), 0);
    }

    #[tokio::test]
    async fn test_push_mode_invokes_callback_in_order() {
        let transport = MemoryTransport::new();
        let engine = engine(&transport);
        let received = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&received);

        let handle = engine
            .subscribe_with(
                BLOCKS,
                SubscribeOptions::new(Duration::from_secs(5)).with_count(3),
                move |msg| sink.lock().unwrap().push(msg.get("block_id").cloned()),
            )
            .await
            .unwrap();
        assert!(handle.is_active());

        for i in 0..5 {
            transport.publish_json(BLOCKS, &block(i));
        }

        tokio::time::timeout(Duration::from_secs(2), handle.finished())
            .await
            .unwrap();

        let received = received.lock().unwrap().clone();
        assert_eq!(
            received,
            vec![Some(json!("block_0")), Some(json!("block_1")), Some(json!("block_2"))]
        );
        assert_eq!(handle.end_reason(), Some(EndReason::CountReached));
        assert_eq!(handle.state(), SubscriptionState::Closed);
        assert_eq!(transport.subscriber_count(BLOCKS), 0);
    }

    #[tokio::test]
    async fn test_push_mode_stops_at_timeout() {
        let transport = MemoryTransport::new();
        let engine = engine(&transport);
        let handle = engine
            .subscribe_with(BLOCKS, SubscribeOptions::new(Duration::from_millis(100)), |_| {})
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle.finished())
            .await
            .unwrap();
        assert_eq!(handle.end_reason(), Some(EndReason::TimedOut));
        assert_eq!(transport.subscriber_count(BLOCKS), 0);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let transport = MemoryTransport::new();
        let engine = engine(&transport);
        let sub = engine
            .subscribe(BLOCKS, SubscribeOptions::new(Duration::from_secs(10)))
            .await
            .unwrap();

        sub.cancel().await;
        sub.cancel().await;
        assert_eq!(sub.state(), SubscriptionState::Closed);
        assert_eq!(sub.end_reason(), Some(EndReason::Cancelled));
        assert_eq!(transport.subscriber_count(BLOCKS), 0);
        assert_eq!(transport.publish_json(BLOCKS, &block(0)), 0);
    }

    #[tokio::test]
    async fn test_cancel_after_timeout_is_noop() {
        let transport = MemoryTransport::new();
        let engine = engine(&transport);
        let mut sub = engine
            .subscribe(BLOCKS, SubscribeOptions::new(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(sub.next().await.is_none());
        sub.cancel().await;
        assert_eq!(sub.end_reason(), Some(EndReason::TimedOut));
    }

    #[tokio::test]
    async fn test_close_all_cancels_push_and_pull() {
        let transport = MemoryTransport::new();
        let engine = engine(&transport);
        let mut pull = engine
            .subscribe(BLOCKS, SubscribeOptions::new(Duration::from_secs(30)))
            .await
            .unwrap();
        let push = engine
            .subscribe_with("urd/robot/pose", SubscribeOptions::new(Duration::from_secs(30)), |_| {})
            .await
            .unwrap();
        assert_eq!(engine.active_count(), 2);

        engine.close_all().await;
        engine.close_all().await;

        assert!(pull.next().await.is_none());
        tokio::time::timeout(Duration::from_secs(2), push.finished())
            .await
            .unwrap();
        assert_eq!(push.end_reason(), Some(EndReason::Cancelled));
        assert_eq!(engine.active_count(), 0);
        assert_eq!(transport.subscriber_count(BLOCKS), 0);
        assert_eq!(transport.subscriber_count("urd/robot/pose"), 0);
    }

    #[tokio::test]
    async fn test_lagging_consumer_drops_newest() {
        let transport = MemoryTransport::new();
        let engine = SubscriptionEngine::new(Arc::new(transport.clone()), 2);
        let sub = engine
            .subscribe(BLOCKS, SubscribeOptions::new(Duration::from_millis(200)))
            .await
            .unwrap();

        for i in 0..4 {
            transport.publish_json(BLOCKS, &block(i));
        }
        assert_eq!(sub.dropped(), 2);

        let messages = sub.collect().await;
        let ids: Vec<_> = messages.iter().map(|m| m.get("block_id").cloned()).collect();
        assert_eq!(ids, vec![Some(json!("block_0")), Some(json!("block_1"))]);
    }

    #[tokio::test]
    async fn test_subscribe_failure_is_reported() {
        let transport = MemoryTransport::new();
        transport.set_unreachable(true);
        let engine = engine(&transport);
        let result = engine
            .subscribe(BLOCKS, SubscribeOptions::new(Duration::from_secs(1)))
            .await;
        assert!(matches!(result, Err(ClientError::Subscription { ref topic, .. }) if topic == BLOCKS));
    }

    #[tokio::test]
    async fn test_unbounded_timeout_is_accepted() {
        let transport = MemoryTransport::new();
        let engine = engine(&transport);
        let sub = engine
            .subscribe(BLOCKS, SubscribeOptions::new(Duration::MAX).with_count(1))
            .await
            .unwrap();
        transport.publish_json(BLOCKS, &block(0));
        assert_eq!(sub.collect().await.len(), 1);

        let handle = engine
            .subscribe_with(BLOCKS, SubscribeOptions::new(Duration::MAX), |_| {})
            .await
            .unwrap();
        assert!(handle.is_active());
        handle.cancel().await;
        assert_eq!(handle.state(), SubscriptionState::Closed);
        assert_eq!(transport.subscriber_count(BLOCKS), 0);
    }

    #[tokio::test]
    async fn test_finished_sessions_are_pruned() {
        let transport = MemoryTransport::new();
        let engine = engine(&transport);
        for _ in 0..1000 {
            let sub = engine
                .subscribe(BLOCKS, SubscribeOptions::new(Duration::from_secs(10)))
                .await
                .unwrap();
            sub.cancel().await;
        }
        assert!(engine.tracked_count() <= 1);

        let _live = engine
            .subscribe(BLOCKS, SubscribeOptions::new(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(engine.tracked_count(), 1);
        assert_eq!(engine.active_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_teardown_releases_once() {
        for round in 0..50 {
            let transport = MemoryTransport::new();
            let engine = Arc::new(engine(&transport));
            let handle = engine
                .subscribe_with(
                    BLOCKS,
                    SubscribeOptions::new(Duration::from_secs(10)).with_count(3),
                    |_| {},
                )
                .await
                .unwrap();

            let publisher = transport.clone();
            let publishing = tokio::spawn(async move {
                for i in 0..5 {
                    publisher.publish_json(BLOCKS, &block(i));
                    tokio::task::yield_now().await;
                }
            });
            let cancel_handle = handle.clone();
            let cancelling = tokio::spawn(async move { cancel_handle.cancel().await });
            let closing_engine = Arc::clone(&engine);
            let closing = tokio::spawn(async move { closing_engine.close_all().await });

            let (published, cancelled, closed) = tokio::join!(publishing, cancelling, closing);
            published.unwrap();
            cancelled.unwrap();
            closed.unwrap();

            tokio::time::timeout(Duration::from_secs(2), handle.finished())
                .await
                .unwrap();
            assert_eq!(handle.state(), SubscriptionState::Closed, "round {}", round);
            assert!(matches!(
                handle.end_reason(),
                Some(EndReason::Cancelled) | Some(EndReason::CountReached)
            ));
            assert!(handle.delivered() <= 3);
            assert_eq!(transport.subscriber_count(BLOCKS), 0);
            assert_eq!(engine.active_count(), 0);
        }
    }

    #[tokio::test]
    async fn test_stream_adapter() {
        use futures::StreamExt;

        let transport = MemoryTransport::new();
        let engine = engine(&transport);
        let sub = engine
            .subscribe(BLOCKS, SubscribeOptions::new(Duration::from_secs(5)).with_count(2))
            .await
            .unwrap();
        transport.publish_json(BLOCKS, &block(7));
        transport.publish_json(BLOCKS, &block(8));

        let topics: Vec<String> = sub
            .into_stream()
            .map(|m| m.topic().to_string())
            .collect()
            .await;
        assert_eq!(topics, vec![BLOCKS.to_string(), BLOCKS.to_string()]);
    }
}
