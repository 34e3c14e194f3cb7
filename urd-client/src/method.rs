//! Schema-driven method bindings
//!
//! Every discovered service becomes a [`ServiceMethod`]. Positional arguments
//! map onto the request schema's required fields followed by its optional
//! fields, both in declaration order; keyword arguments map by name and win
//! over positional values for the same field.

use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ClientError, Result};
use crate::invoker::RpcInvoker;
use crate::registry::ServiceDescriptor;
use crate::response::CallResponse;

/// Keyword reserved for the per-call timeout override, in seconds.
pub const TIMEOUT_KEYWORD: &str = "timeout";

/// Arguments for one service call.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    positional: Vec<Value>,
    keyword: Map<String, Value>,
    timeout: Option<Duration>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Set a keyword argument. `timeout` is interpreted as the call timeout.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keyword.insert(name.into(), value.into());
        self
    }

    /// Override the client's default RPC timeout for this call.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    pub fn keyword(&self) -> &Map<String, Value> {
        &self.keyword
    }
}

impl<V: Into<Value>> FromIterator<V> for CallArgs {
    fn from_iter<I: IntoIterator<Item = V>>(iter: I) -> Self {
        Self {
            positional: iter.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

/// Request body plus call options, ready for the invoker.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundRequest {
    pub body: Map<String, Value>,
    pub timeout: Option<Duration>,
}

/// Callable binding for one discovered service.
#[derive(Clone)]
pub struct ServiceMethod {
    descriptor: Arc<ServiceDescriptor>,
    /// Required fields then optional fields, each in declaration order.
    parameters: Vec<String>,
    invoker: RpcInvoker,
}

impl ServiceMethod {
    pub fn new(descriptor: Arc<ServiceDescriptor>, invoker: RpcInvoker) -> Self {
        let schema = &descriptor.request_schema;
        let parameters = schema
            .required()
            .chain(schema.optional())
            .map(str::to_string)
            .collect();
        Self {
            descriptor,
            parameters,
            invoker,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &Arc<ServiceDescriptor> {
        &self.descriptor
    }

    /// Parameter names in positional order.
    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }

    /// Map `args` onto the schema without touching the network.
    pub fn bind(&self, args: CallArgs) -> Result<BoundRequest> {
        let CallArgs {
            positional,
            mut keyword,
            timeout,
        } = args;

        if positional.len() > self.parameters.len() {
            return Err(ClientError::Arity {
                service: self.descriptor.name.clone(),
                max: self.parameters.len(),
                given: positional.len(),
            });
        }

        let keyword_timeout = keyword
            .remove(TIMEOUT_KEYWORD)
            .map(|value| self.parse_timeout(&value))
            .transpose()?;

        let mut body = Map::new();
        for (name, value) in self.parameters.iter().zip(positional) {
            body.insert(name.clone(), value);
        }
        for (name, value) in keyword {
            body.insert(name, value);
        }

        Ok(BoundRequest {
            body,
            timeout: keyword_timeout.or(timeout),
        })
    }

    /// Bind `args` and perform the call.
    pub async fn call(&self, args: CallArgs) -> Result<CallResponse> {
        let request = self.bind(args)?;
        self.invoker.call(&self.descriptor, request).await
    }

    /// Call signature, e.g. `execute(urscript: string, group: optional<bool> = null)`.
    pub fn signature(&self) -> String {
        let schema = &self.descriptor.request_schema;
        let params: Vec<String> = self
            .parameters
            .iter()
            .filter_map(|name| schema.get(name).map(|ty| (name, ty)))
            .map(|(name, ty)| {
                if ty.is_optional() {
                    format!("{}: {} = null", name, ty)
                } else {
                    format!("{}: {}", name, ty)
                }
            })
            .collect();
        format!("{}({})", self.descriptor.name, params.join(", "))
    }

    /// Human-readable documentation for the binding.
    pub fn help(&self) -> String {
        let schema = &self.descriptor.request_schema;
        let mut text = format!(
            "{}\n\n{}\n\nTopic: {}\n",
            self.signature(),
            self.descriptor.description,
            self.descriptor.topic
        );
        if !self.parameters.is_empty() {
            text.push_str("\nArgs:\n");
            for name in &self.parameters {
                if let Some(ty) = schema.get(name) {
                    let note = if ty.is_optional() { " (optional)" } else { "" };
                    text.push_str(&format!("    {}: {}{}\n", name, ty.type_name(), note));
                }
            }
        }
        text.push_str("    timeout: optional timeout override in seconds\n");
        text
    }

    fn parse_timeout(&self, value: &Value) -> Result<Duration> {
        value
            .as_f64()
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .ok_or_else(|| ClientError::InvalidArgument {
                service: self.descriptor.name.clone(),
                field: TIMEOUT_KEYWORD.to_string(),
                reason: format!("expected a non-negative, representable number of seconds, got {}", value),
            })
    }
}

impl std::fmt::Debug for ServiceMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceMethod")
            .field("name", &self.descriptor.name)
            .field("parameters", &self.parameters)
            .finish()
    }
}
