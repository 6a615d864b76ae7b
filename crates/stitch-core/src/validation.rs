//! Schema validation for interrupt inputs.

use jsonschema::JSONSchema;
use serde_json::Value;

/// Checks a value against a schema
pub trait SchemaValidator: Send + Sync {
    /// `Ok(())` when `value` conforms to `schema`, otherwise a readable reason
    fn validate(&self, value: &Value, schema: &Value) -> Result<(), String>;
}

/// JSON Schema validator
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSchemaValidator;

impl SchemaValidator for JsonSchemaValidator {
    fn validate(&self, value: &Value, schema: &Value) -> Result<(), String> {
        let compiled =
            JSONSchema::compile(schema).map_err(|e| format!("invalid input schema: {}", e))?;

        if let Err(errors) = compiled.validate(value) {
            let messages: Vec<String> = errors.map(|e| e.to_string()).collect();
            return Err(messages.join("; "));
        }
        Ok(())
    }
}
