//! Service discovery and the service catalog
//!
//! The daemon answers queries on its discovery topic with the list of RPC
//! services it hosts and the publishers it runs. The catalog built from that
//! reply is fixed for the lifetime of a client.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::schema::Schema;
use crate::transport::Transport;

/// Description of one callable RPC service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub topic: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub request_schema: Schema,
    #[serde(default)]
    pub response_schema: Schema,
}

/// Description of one telemetry publisher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublisherDescriptor {
    pub topic: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub message_schema: Schema,
    /// Publishing rate, 0 for event-driven topics
    #[serde(default)]
    pub rate_hz: u32,
    #[serde(default)]
    pub message_type: String,
}

/// Discovery reply payload.
///
/// Daemons send the services under `rpc_services` and repeat them under the
/// legacy `services` key; either one is enough.
#[derive(Debug, Deserialize)]
struct DiscoveryResponse {
    #[serde(default)]
    rpc_services: Option<Vec<ServiceDescriptor>>,
    #[serde(default)]
    services: Option<Vec<ServiceDescriptor>>,
    #[serde(default)]
    publishers: Vec<PublisherDescriptor>,
}

/// Immutable catalog of discovered services and publishers.
#[derive(Debug, Clone, Default)]
pub struct RegistryCatalog {
    services: Vec<Arc<ServiceDescriptor>>,
    publishers: Vec<Arc<PublisherDescriptor>>,
}

impl RegistryCatalog {
    /// Build a catalog from a raw discovery payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let response: DiscoveryResponse = serde_json::from_slice(payload)
            .map_err(|e| ClientError::Connection(format!("Invalid discovery response: {}", e)))?;

        if response.rpc_services.is_none() && response.services.is_none() {
            return Err(ClientError::Connection(
                "Invalid discovery response: missing 'services'".to_string(),
            ));
        }

        let mut catalog = RegistryCatalog::default();

        let services = response
            .rpc_services
            .into_iter()
            .flatten()
            .chain(response.services.into_iter().flatten());
        for service in services {
            if catalog.service(&service.name).is_some() {
                // rpc_services and services normally repeat each other
                debug!("Skipping repeated service record: {}", service.name);
                continue;
            }
            info!("Discovered RPC service: {} ({})", service.name, service.topic);
            catalog.services.push(Arc::new(service));
        }

        for publisher in response.publishers {
            if catalog.publisher(&publisher.name).is_some() {
                warn!("Duplicate publisher name in discovery response: {}", publisher.name);
                continue;
            }
            info!("Discovered publisher: {} ({})", publisher.name, publisher.topic);
            catalog.publishers.push(Arc::new(publisher));
        }

        Ok(catalog)
    }

    /// Services in discovery order.
    pub fn services(&self) -> &[Arc<ServiceDescriptor>] {
        &self.services
    }

    /// Publishers in discovery order.
    pub fn publishers(&self) -> &[Arc<PublisherDescriptor>] {
        &self.publishers
    }

    /// Look up a service by name.
    pub fn service(&self, name: &str) -> Option<&Arc<ServiceDescriptor>> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Look up a publisher by name.
    pub fn publisher(&self, name: &str) -> Option<&Arc<PublisherDescriptor>> {
        self.publishers.iter().find(|p| p.name == name)
    }

    /// Number of services.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// True when the daemon advertised no services.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// The catalog as JSON, keyed by service name.
    pub fn to_json(&self) -> serde_json::Value {
        let services: serde_json::Map<String, serde_json::Value> = self
            .services
            .iter()
            .map(|s| (s.name.clone(), serde_json::json!(s.as_ref())))
            .collect();
        let publishers: serde_json::Map<String, serde_json::Value> = self
            .publishers
            .iter()
            .map(|p| (p.name.clone(), serde_json::json!(p.as_ref())))
            .collect();
        serde_json::json!({ "services": services, "publishers": publishers })
    }
}

/// Query `discovery_topic` once and build the catalog from the first good reply.
pub async fn discover(
    transport: &dyn Transport,
    discovery_topic: &str,
    timeout: Duration,
) -> Result<RegistryCatalog> {
    info!("Discovering available services on '{}'", discovery_topic);
    let start = Instant::now();

    let mut replies = transport
        .query(discovery_topic, None, timeout)
        .await
        .map_err(|e| ClientError::Connection(format!("Service discovery failed: {}", e)))?;

    let first_reply = async {
        while let Some(reply) = replies.next().await {
            match reply {
                Ok(payload) => return Some(payload),
                Err(e) => warn!("Ignoring discovery error reply: {}", e),
            }
        }
        None
    };

    let payload = match tokio::time::timeout(timeout, first_reply).await {
        Ok(Some(payload)) => payload,
        Ok(None) | Err(_) => {
            return Err(ClientError::Connection(format!(
                "URD service discovery failed after {:.1}s. Make sure the urd daemon is running.",
                start.elapsed().as_secs_f64()
            )));
        }
    };

    let catalog = RegistryCatalog::from_payload(&payload)?;
    info!(
        "Service discovery completed. RPC services: {}, Publishers: {}",
        catalog.services.len(),
        catalog.publishers.len()
    );
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use crate::transport::TransportError;
    use serde_json::json;

    fn daemon_reply() -> serde_json::Value {
        let command = json!({
            "topic": "urd/command",
            "name": "command",
            "description": "Execute robot commands (halt, status, reconnect, etc.)",
            "request_schema": {"command_type": "string", "timeout_secs": "optional<u32>"},
            "response_schema": {"success": "bool", "message": "string", "duration_ms": "u64"}
        });
        let execute = json!({
            "topic": "urd/execute",
            "name": "execute",
            "description": "Execute URScript commands on the robot",
            "request_schema": {"urscript": "string", "group": "optional<bool>"},
            "response_schema": {"success": "bool", "message": "string"}
        });
        json!({
            "rpc_services": [command.clone(), execute.clone()],
            "services": [command, execute],
            "publishers": [{
                "topic": "urd/robot/blocks",
                "name": "blocks",
                "description": "URScript block execution events",
                "message_schema": {"block_id": "string", "status": "string"},
                "rate_hz": 0,
                "message_type": "BlockExecutionData"
            }]
        })
    }

    #[tokio::test]
    async fn test_discover_merges_service_lists() {
        let transport = MemoryTransport::new();
        transport.respond_json("urd/discover", daemon_reply());

        let catalog = discover(&transport, "urd/discover", Duration::from_secs(1))
            .await
            .unwrap();

        let names: Vec<&str> = catalog.services().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["command", "execute"]);
        assert_eq!(catalog.service("execute").unwrap().topic, "urd/execute");
        assert_eq!(catalog.publisher("blocks").unwrap().topic, "urd/robot/blocks");
        assert_eq!(transport.query_count(), 1);
    }

    #[tokio::test]
    async fn test_discover_legacy_format_only() {
        let transport = MemoryTransport::new();
        transport.respond_json(
            "urd/discover",
            json!({"services": [{
                "topic": "urd/status", "name": "status", "description": "",
                "request_schema": {}, "response_schema": {"success": "bool"}
            }]}),
        );

        let catalog = discover(&transport, "urd/discover", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(catalog.len(), 1);
        assert!(catalog.publishers().is_empty());
    }

    #[tokio::test]
    async fn test_discover_without_reply_is_connection_failure() {
        let transport = MemoryTransport::new();
        transport.silent("urd/discover");

        let start = Instant::now();
        let result = discover(&transport, "urd/discover", Duration::from_millis(100)).await;
        assert!(matches!(result, Err(ClientError::Connection(_))));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_discover_malformed_payload() {
        let transport = MemoryTransport::new();
        transport.respond("urd/discover", |_| vec![Ok(b"not json".to_vec())]);
        let result = discover(&transport, "urd/discover", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ClientError::Connection(msg)) if msg.contains("Invalid discovery")));

        transport.respond_json("urd/discover", json!({"publishers": []}));
        let result = discover(&transport, "urd/discover", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ClientError::Connection(_))));
    }

    #[tokio::test]
    async fn test_discover_skips_error_replies() {
        let transport = MemoryTransport::new();
        let good = daemon_reply().to_string().into_bytes();
        transport.respond("urd/discover", move |_| {
            vec![
                Err(TransportError::ErrorReply("busy".to_string())),
                Ok(good.clone()),
            ]
        });

        let catalog = discover(&transport, "urd/discover", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(catalog.len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_transport() {
        let transport = MemoryTransport::new();
        transport.set_unreachable(true);
        let result = discover(&transport, "urd/discover", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ClientError::Connection(msg)) if msg.contains("unreachable")));
    }
}
