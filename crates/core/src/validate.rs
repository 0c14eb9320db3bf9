//! Schema-agnostic payload validation.
//!
//! The runtime never couples to a schema language: a handler definition may
//! carry any [`Validator`] trait object, and the router runs it on the input
//! before the handler (and on the output after it, when configured). Plain
//! functions work directly:
//!
//! ```
//! use raffel_core::{RpcError, Validator};
//! use serde_json::Value;
//!
//! let non_null = |value: &Value| -> Result<(), RpcError> {
//!     if value.is_null() {
//!         Err(RpcError::validation("payload must not be null"))
//!     } else {
//!         Ok(())
//!     }
//! };
//! assert!(non_null.validate(&serde_json::json!({"ok": true})).is_ok());
//! ```

use serde_json::Value;

use crate::RpcError;

/// Validates one payload. Implementations wrap whatever schema library the
/// application uses.
pub trait Validator: Send + Sync + 'static {
    /// Check the payload; return a `VALIDATION_ERROR` describing the failure.
    fn validate(&self, value: &Value) -> Result<(), RpcError>;
}

impl<F> Validator for F
where
    F: Fn(&Value) -> Result<(), RpcError> + Send + Sync + 'static,
{
    fn validate(&self, value: &Value) -> Result<(), RpcError> {
        (self)(value)
    }
}

/// Requires the payload to be a JSON object containing the given keys.
///
/// Covers the common "required fields" case without any schema dependency.
#[derive(Clone, Debug)]
pub struct RequiredFields {
    fields: Vec<&'static str>,
}

impl RequiredFields {
    /// Require these keys to be present and non-null.
    #[must_use]
    pub fn new(fields: &[&'static str]) -> Self {
        Self {
            fields: fields.to_vec(),
        }
    }
}

impl Validator for RequiredFields {
    fn validate(&self, value: &Value) -> Result<(), RpcError> {
        let Some(object) = value.as_object() else {
            return Err(RpcError::validation("payload must be an object"));
        };
        for field in &self.fields {
            if object.get(*field).is_none_or(Value::is_null) {
                return Err(RpcError::validation(format!("missing required field `{field}`")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_fields() {
        let validator = RequiredFields::new(&["name"]);
        assert!(validator.validate(&serde_json::json!({"name": "World"})).is_ok());
        let err = validator.validate(&serde_json::json!({})).unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::ValidationError);
        assert!(err.message.contains("name"));
        assert!(validator.validate(&serde_json::json!(3)).is_err());
    }
}
