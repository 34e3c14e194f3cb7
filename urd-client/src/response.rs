//! Typed view over an RPC reply

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

use crate::registry::ServiceDescriptor;

/// Reply of one service call, restricted to the fields of its response schema.
///
/// Fields declared in the schema but missing from the reply read as `null`.
/// Fields in the reply that the schema does not declare are not kept.
#[derive(Debug, Clone)]
pub struct CallResponse {
    service: Arc<ServiceDescriptor>,
    fields: Map<String, Value>,
}

impl CallResponse {
    /// Project `reply` onto the service's response schema. Missing fields become null.
    pub fn new(service: Arc<ServiceDescriptor>, mut reply: Map<String, Value>) -> Self {
        let fields = service
            .response_schema
            .names()
            .map(|name| (name.to_string(), reply.remove(name).unwrap_or(Value::Null)))
            .collect();
        Self { service, fields }
    }

    /// Descriptor of the service that produced this reply.
    pub fn service(&self) -> &ServiceDescriptor {
        &self.service
    }

    /// Value of a schema field; `None` if the schema does not declare it.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Boolean field, `None` if absent or not a bool.
    pub fn get_bool(&self, field: &str) -> Option<bool> {
        self.get(field).and_then(Value::as_bool)
    }

    /// String field.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    /// Unsigned integer field.
    pub fn get_u64(&self, field: &str) -> Option<u64> {
        self.get(field).and_then(Value::as_u64)
    }

    /// Numeric field as `f64`.
    pub fn get_f64(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(Value::as_f64)
    }

    /// Deserialize a schema field into `T`. Absent or null fields give `Ok(None)`.
    pub fn field<T: DeserializeOwned>(&self, field: &str) -> Result<Option<T>, serde_json::Error> {
        match self.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some),
        }
    }

    /// Field names in schema order.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// `success` flag, when the reply carries one.
    pub fn success(&self) -> Option<bool> {
        self.get_bool("success")
    }

    /// `message` field, when it is a string.
    pub fn message(&self) -> Option<&str> {
        self.get_str("message")
    }

    /// Server-side execution time, if reported.
    pub fn duration_ms(&self) -> Option<u64> {
        self.get_u64("duration_ms")
    }

    /// `data` payload when present and not null.
    pub fn data(&self) -> Option<&Value> {
        self.get("data").filter(|v| !v.is_null())
    }

    /// Schema fields as a JSON object.
    pub fn to_json(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    /// Consume the response, keeping only its fields.
    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }
}

impl fmt::Display for CallResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.success().unwrap_or(true) { "✓" } else { "✗" };
        write!(
            f,
            "{} {}: {} ({}ms)",
            status,
            self.service.name,
            self.message().unwrap_or("No message"),
            self.duration_ms().unwrap_or(0)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldType;
    use serde_json::json;

    fn status_service() -> Arc<ServiceDescriptor> {
        Arc::new(ServiceDescriptor {
            topic: "urd/status".to_string(),
            name: "status".to_string(),
            description: String::new(),
            request_schema: Default::default(),
            response_schema: [
                ("success", FieldType::parse("bool")),
                ("message", FieldType::parse("string")),
                ("duration_ms", FieldType::parse("u64")),
                ("data", FieldType::parse("optional<object>")),
            ]
            .into_iter()
            .collect(),
        })
    }

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_extra_fields_are_dropped() {
        let response = CallResponse::new(
            status_service(),
            object(json!({"success": true, "message": "ok", "secret": 42})),
        );
        assert_eq!(response.get("secret"), None);
        assert_eq!(
            response.fields().collect::<Vec<_>>(),
            vec!["success", "message", "duration_ms", "data"]
        );
    }

    #[test]
    fn test_absent_fields_default_to_null() {
        let response = CallResponse::new(status_service(), object(json!({"success": true})));
        assert_eq!(response.get("message"), Some(&Value::Null));
        assert_eq!(response.message(), None);
        assert_eq!(response.data(), None);
        assert_eq!(response.field::<u64>("duration_ms").unwrap(), None);
    }

    #[test]
    fn test_typed_field_access() {
        let response = CallResponse::new(
            status_service(),
            object(json!({"success": true, "duration_ms": 12, "data": {"state": "RUNNING"}})),
        );
        assert_eq!(response.field::<u64>("duration_ms").unwrap(), Some(12));
        assert!(response.field::<String>("success").is_err());
        assert_eq!(response.data(), Some(&json!({"state": "RUNNING"})));
    }

    #[test]
    fn test_display() {
        let response = CallResponse::new(
            status_service(),
            object(json!({"success": true, "message": "ok", "duration_ms": 12})),
        );
        assert_eq!(response.to_string(), "✓ status: ok (12ms)");
    }
}
