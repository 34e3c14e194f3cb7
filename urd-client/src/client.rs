//! URD Client - service discovery, dynamic methods and subscriptions
//!
//! Connecting runs discovery once and binds every advertised service to a
//! [`ServiceMethod`]. The catalog never changes afterwards; reconnecting
//! means building a new client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::invoker::RpcInvoker;
use crate::method::{CallArgs, ServiceMethod};
use crate::registry::{self, PublisherDescriptor, RegistryCatalog, ServiceDescriptor};
use crate::response::CallResponse;
use crate::subscription::{
    Message, SubscribeOptions, Subscription, SubscriptionEngine, SubscriptionHandle,
};
use crate::transport::Transport;

/// Client for URD RPC services.
pub struct Client {
    transport: Arc<dyn Transport>,
    catalog: RegistryCatalog,
    methods: Vec<ServiceMethod>,
    subscriptions: SubscriptionEngine,
    config: ClientConfig,
    closed: Arc<AtomicBool>,
}

impl Client {
    /// Discover services over `transport` and build the client.
    ///
    /// The transport is closed again if discovery fails.
    pub async fn connect(transport: Arc<dyn Transport>, config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let catalog = match registry::discover(
            transport.as_ref(),
            config.discovery_topic(),
            config.discovery_timeout(),
        )
        .await
        {
            Ok(catalog) => catalog,
            Err(e) => {
                if let Err(close_err) = transport.close().await {
                    debug!("Closing transport after failed discovery: {}", close_err);
                }
                return Err(e);
            }
        };

        let closed = Arc::new(AtomicBool::new(false));
        let invoker = RpcInvoker::with_closed_flag(
            Arc::clone(&transport),
            config.rpc_timeout(),
            Arc::clone(&closed),
        );
        let methods = catalog
            .services()
            .iter()
            .map(|service| ServiceMethod::new(Arc::clone(service), invoker.clone()))
            .collect();
        let subscriptions = SubscriptionEngine::with_closed_flag(
            Arc::clone(&transport),
            config.subscription_buffer(),
            Arc::clone(&closed),
        );

        info!(
            "URD client connected with {} services: {}",
            catalog.len(),
            catalog
                .services()
                .iter()
                .map(|s| s.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(Self {
            transport,
            catalog,
            methods,
            subscriptions,
            config,
            closed,
        })
    }

    /// Discovered services in discovery order.
    pub fn list_services(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.catalog.services().iter().map(|s| s.as_ref())
    }

    pub fn get_service_info(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.catalog.service(name).map(|s| s.as_ref())
    }

    /// Publishers advertised by the daemon.
    pub fn list_publishers(&self) -> impl Iterator<Item = &PublisherDescriptor> {
        self.catalog.publishers().iter().map(|p| p.as_ref())
    }

    pub fn get_publisher_info(&self, name: &str) -> Option<&PublisherDescriptor> {
        self.catalog.publisher(name).map(|p| p.as_ref())
    }

    /// Raw API description as discovered.
    pub fn api(&self) -> serde_json::Value {
        self.catalog.to_json()
    }

    pub fn catalog(&self) -> &RegistryCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Bound method for a service.
    pub fn method(&self, name: &str) -> Result<&ServiceMethod> {
        self.methods
            .iter()
            .find(|m| m.name() == name)
            .ok_or_else(|| ClientError::UnknownService(name.to_string()))
    }

    pub fn methods(&self) -> &[ServiceMethod] {
        &self.methods
    }

    /// Call service `name` with `args`.
    pub async fn invoke(&self, name: &str, args: CallArgs) -> Result<CallResponse> {
        self.method(name)?.call(args).await
    }

    /// Pull-mode subscription. `topic` may be a publisher name from discovery
    /// (e.g. `blocks`) or a literal key expression.
    pub async fn subscribe(&self, topic: &str, options: SubscribeOptions) -> Result<Subscription> {
        let key = self.resolve_topic(topic);
        self.subscriptions.subscribe(key, options).await
    }

    /// Push-mode subscription delivering to `callback` on a background task.
    pub async fn subscribe_with<F>(
        &self,
        topic: &str,
        options: SubscribeOptions,
        callback: F,
    ) -> Result<SubscriptionHandle>
    where
        F: FnMut(Message) + Send + 'static,
    {
        let key = self.resolve_topic(topic);
        self.subscriptions.subscribe_with(key, options, callback).await
    }

    /// Number of subscriptions currently delivering.
    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.active_count()
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Cancel all subscriptions and close the transport. Calling it again is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing URD client");
        self.subscriptions.close_all().await;
        if let Err(e) = self.transport.close().await {
            error!("Failed to close transport: {}", e);
        }
    }

    fn resolve_topic<'a>(&'a self, topic: &'a str) -> &'a str {
        match self.catalog.publisher(topic) {
            Some(publisher) => {
                debug!("Resolved topic '{}' to '{}'", topic, publisher.topic);
                &publisher.topic
            }
            None => topic,
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("URD client dropped without close(), cancelling subscriptions");
            self.subscriptions.cancel_all();
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("services", &self.methods)
            .field("connected", &self.is_connected())
            .finish()
    }
}
