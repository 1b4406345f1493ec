//! The validation seam.
//!
//! Schemas are opaque `serde_json::Value`s attached to handler definitions;
//! only the injected [`Validator`] ever inspects their shape. The core ships
//! no schema language of its own; wire up a JSON-Schema (or similar)
//! validator adapter at assembly time.

use schemars::JsonSchema;
use serde_json::Value;

/// A validation failure, surfaced to callers in the `details` field of
/// `VALIDATION_ERROR` / `OUTPUT_VALIDATION_ERROR` replies.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub message: String,
    pub details: Value,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: Value::Null,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// The JSON placed in the reply's `details` field.
    pub fn into_details(self) -> Value {
        if self.details.is_null() {
            serde_json::json!({ "message": self.message })
        } else {
            serde_json::json!({ "message": self.message, "errors": self.details })
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Validates payloads against handler schemas. Injected, not global.
pub trait Validator: Send + Sync {
    /// Validate `value` against `schema`, returning the (possibly coerced)
    /// value on success.
    fn validate(&self, schema: &Value, value: Value) -> Result<Value, Diagnostic>;

    /// Render the schema as JSON Schema, when the validator can. Used only
    /// by documentation tooling.
    fn to_json_schema(&self, schema: &Value) -> Option<Value> {
        Some(schema.clone())
    }
}

/// Derive the JSON schema for a Rust type, for attaching to a
/// [`HandlerDef`](crate::registry::HandlerDef).
pub fn schema_of<T: JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(JsonSchema)]
    #[allow(dead_code)]
    struct Greeting {
        name: String,
    }

    #[test]
    fn schema_of_derives_object_schema() {
        let schema = schema_of::<Greeting>();
        assert_eq!(schema["type"], "object");
        assert!(schema["properties"]["name"].is_object());
    }

    #[test]
    fn diagnostic_details_shape() {
        let d = Diagnostic::new("missing field").into_details();
        assert_eq!(d["message"], "missing field");

        let d = Diagnostic::new("bad fields")
            .with_details(serde_json::json!([{"field": "name"}]))
            .into_details();
        assert_eq!(d["errors"][0]["field"], "name");
    }
}
