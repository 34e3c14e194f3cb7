//! RPC invocation over the transport's query primitive
//!
//! One call is one query: validate, serialize, query, take the first
//! successful reply, decode, classify. Nothing is retried.

use futures::StreamExt;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::method::BoundRequest;
use crate::registry::ServiceDescriptor;
use crate::response::CallResponse;
use crate::transport::{Transport, TransportError};

enum Outcome {
    Reply(Vec<u8>),
    /// The stream ended; carries the last error reply seen, if any.
    Exhausted(Option<TransportError>),
}

/// Performs service calls for a client. Cheap to clone.
#[derive(Clone)]
pub struct RpcInvoker {
    transport: Arc<dyn Transport>,
    default_timeout: Duration,
    closed: Arc<AtomicBool>,
}

impl RpcInvoker {
    pub fn new(transport: Arc<dyn Transport>, default_timeout: Duration) -> Self {
        Self::with_closed_flag(transport, default_timeout, Arc::new(AtomicBool::new(false)))
    }

    pub(crate) fn with_closed_flag(
        transport: Arc<dyn Transport>,
        default_timeout: Duration,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            transport,
            default_timeout,
            closed,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub async fn call(
        &self,
        service: &Arc<ServiceDescriptor>,
        request: BoundRequest,
    ) -> Result<CallResponse> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::ClientClosed);
        }

        validate_request(service, &request.body)?;

        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let payload = serde_json::to_vec(&request.body).map_err(|e| ClientError::InvalidArgument {
            service: service.name.clone(),
            field: "*".to_string(),
            reason: format!("request is not serializable: {}", e),
        })?;

        debug!(
            "Calling RPC service '{}' on '{}' (timeout {:?})",
            service.name, service.topic, timeout
        );
        let start = Instant::now();

        let exchange = async {
            let mut replies = self
                .transport
                .query(&service.topic, Some(payload), timeout)
                .await?;

            let mut last_error = None;
            while let Some(reply) = replies.next().await {
                match reply {
                    Ok(bytes) => return Ok(Outcome::Reply(bytes)),
                    Err(e) => {
                        debug!("Error reply from '{}': {}", service.topic, e);
                        last_error = Some(e);
                    }
                }
            }
            Ok::<_, TransportError>(Outcome::Exhausted(last_error))
        };

        let outcome = match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(source)) => {
                return Err(ClientError::Rpc {
                    service: service.name.clone(),
                    source,
                });
            }
            Err(_) => {
                return Err(ClientError::Timeout {
                    service: service.name.clone(),
                    elapsed: start.elapsed(),
                });
            }
        };

        let bytes = match outcome {
            Outcome::Reply(bytes) => bytes,
            Outcome::Exhausted(Some(source)) => {
                return Err(ClientError::Rpc {
                    service: service.name.clone(),
                    source,
                });
            }
            Outcome::Exhausted(None) => {
                return Err(ClientError::Timeout {
                    service: service.name.clone(),
                    elapsed: start.elapsed(),
                });
            }
        };

        debug!(
            "Reply from '{}' after {:?} ({} bytes)",
            service.name,
            start.elapsed(),
            bytes.len()
        );

        let response = CallResponse::new(Arc::clone(service), decode_reply(service, &bytes)?);

        if response.success() == Some(false) {
            return Err(ClientError::RemoteOperation {
                service: service.name.clone(),
                message: response.message().map(str::to_string),
                details: response.data().cloned(),
            });
        }

        Ok(response)
    }
}

/// Every non-optional request field must be present.
fn validate_request(service: &ServiceDescriptor, body: &Map<String, Value>) -> Result<()> {
    match service.request_schema.required().find(|f| !body.contains_key(*f)) {
        Some(field) => Err(ClientError::Validation {
            service: service.name.clone(),
            field: field.to_string(),
        }),
        None => Ok(()),
    }
}

fn decode_reply(service: &ServiceDescriptor, bytes: &[u8]) -> Result<Map<String, Value>> {
    let malformed = |reason: String| ClientError::MalformedResponse {
        service: service.name.clone(),
        raw: String::from_utf8_lossy(bytes).into_owned(),
        reason,
    };

    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(malformed(format!("expected a JSON object, got {}", other))),
        Err(e) => Err(malformed(e.to_string())),
    }
}
