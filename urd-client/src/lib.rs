//! URD Client - transport-agnostic client SDK for the URD robot daemon
//!
//! The daemon advertises its RPC services and telemetry publishers on a
//! discovery topic. This library discovers them once, validates and sends
//! calls, and consumes published topics, without depending on any
//! particular transport. A Zenoh transport lives in `urd-client-zenoh`.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use urd_client::{CallArgs, Client, ClientConfig, MemoryTransport, SubscribeOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(MemoryTransport::new());
//!     let client = Client::connect(transport, ClientConfig::default()).await?;
//!
//!     // Call a discovered service
//!     let status = client.invoke("status", CallArgs::new()).await?;
//!     println!("{}", status);
//!
//!     // Read a few block events
//!     let blocks = client
//!         .subscribe("blocks", SubscribeOptions::new(Duration::from_secs(10)).with_count(5))
//!         .await?
//!         .collect()
//!         .await;
//!     println!("received {} block events", blocks.len());
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **Client**: connection lifecycle, service table and subscriptions
//! - **RegistryCatalog**: services and publishers from discovery
//! - **ServiceMethod**: argument binding for one service
//! - **RpcInvoker**: one call, one query
//! - **SubscriptionEngine**: bounded pull and push subscriptions
//! - **Transport**: the seam to the messaging layer

pub mod client;
pub mod config;
pub mod error;
pub mod invoker;
pub mod memory;
pub mod method;
pub mod registry;
pub mod response;
pub mod schema;
pub mod subscription;
pub mod transport;

pub use client::Client;
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use invoker::RpcInvoker;
pub use memory::MemoryTransport;
pub use method::{CallArgs, ServiceMethod};
pub use registry::{PublisherDescriptor, RegistryCatalog, ServiceDescriptor};
pub use response::CallResponse;
pub use schema::{FieldType, Schema};
pub use subscription::{
    EndReason, Message, SubscribeOptions, Subscription, SubscriptionEngine, SubscriptionHandle,
    SubscriptionState,
};
pub use transport::{Transport, TransportError, TransportSubscription};
