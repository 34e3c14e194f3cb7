//! URD Client Zenoh - Zenoh transport for the URD client SDK
//!
//! Wraps `urd-client` with a Zenoh session so applications can reach a
//! running URD daemon's RPC services and telemetry topics.

pub mod config;
pub mod transport;

use std::sync::Arc;
use tracing::info;

// Re-export client functionality
pub use urd_client::{
    CallArgs, CallResponse, Client, ClientConfig, ClientError, Message, PublisherDescriptor,
    Result, ServiceDescriptor, ServiceMethod, SubscribeOptions, Subscription, SubscriptionHandle,
};

// Zenoh-specific exports
pub use config::{SdkConfig, ZenohSettings};
pub use transport::ZenohTransport;

/// Open a Zenoh session and connect a client over it.
pub async fn connect(zenoh: &ZenohSettings, client: ClientConfig) -> Result<Client> {
    let zenoh_config = zenoh.to_zenoh_config()?;
    let transport = ZenohTransport::open(zenoh_config)
        .await
        .map_err(|e| ClientError::Connection(e.to_string()))?;
    info!("Zenoh session opened, discovering URD services");
    Client::connect(Arc::new(transport), client).await
}

/// Connect using a full SDK config.
pub async fn connect_with(config: &SdkConfig) -> Result<Client> {
    connect(&config.zenoh, config.client.clone()).await
}
