//! Response schema contract
//!
//! Token and API responses can be checked against an injected [`Schema`].
//! The executor and credential manager only see the trait; [`JsonSchema`]
//! is the stock implementation backed by the `jsonschema` crate.
//!
//! Modes:
//! - `Off`: value passes through untouched
//! - `Permissive`: unknown properties are tolerated, everything else fails
//! - `Strict`: any violation fails

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

/// How strictly a response is checked against its schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    Off,
    #[default]
    Permissive,
    Strict,
}

/// One schema violation, located by JSON pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub path: String,
    pub expected: String,
    pub actual: String,
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Validates a decoded JSON value. Returns the (possibly normalized) value
/// on success, or every issue found.
pub trait Schema: Send + Sync {
    fn name(&self) -> &str;

    fn validate(
        &self,
        value: &Value,
        mode: ValidationMode,
    ) -> std::result::Result<Value, Vec<ValidationIssue>>;
}

/// JSON Schema backed validator.
pub struct JsonSchema {
    name: String,
    validator: jsonschema::Validator,
}

impl JsonSchema {
    /// Compile a JSON Schema document. Fails if the document itself is invalid.
    pub fn new(name: impl Into<String>, schema: &Value) -> crate::Result<Self> {
        let name = name.into();
        let validator = jsonschema::validator_for(schema)
            .map_err(|e| crate::Error::Schema(format!("{name}: {e}")))?;
        Ok(Self { name, validator })
    }

    /// Shorthand for sharing a compiled schema across requests.
    pub fn shared(name: impl Into<String>, schema: &Value) -> crate::Result<Arc<dyn Schema>> {
        Ok(Arc::new(Self::new(name, schema)?))
    }
}

impl fmt::Debug for JsonSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonSchema").field("name", &self.name).finish()
    }
}

impl Schema for JsonSchema {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(
        &self,
        value: &Value,
        mode: ValidationMode,
    ) -> std::result::Result<Value, Vec<ValidationIssue>> {
        if mode == ValidationMode::Off {
            return Ok(value.clone());
        }

        let issues: Vec<ValidationIssue> = self
            .validator
            .iter_errors(value)
            .filter_map(|error| {
                let keyword = keyword_of(&error.kind);
                if mode == ValidationMode::Permissive && keyword == "additionalproperties" {
                    return None;
                }
                let path = error.instance_path.to_string();
                let path = if path.is_empty() { "/".to_string() } else { path };
                Some(ValidationIssue {
                    actual: describe_type(&error.instance),
                    expected: keyword,
                    message: format!("{path}: {error}"),
                    path,
                })
            })
            .collect();

        if issues.is_empty() {
            Ok(value.clone())
        } else {
            Err(issues)
        }
    }
}

/// Lowercased keyword name taken from the error kind's debug form.
fn keyword_of(kind: &impl fmt::Debug) -> String {
    let debug = format!("{kind:?}");
    debug
        .split(|c: char| !c.is_alphanumeric())
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// JSON type name of a value, as reported in issues.
pub fn describe_type(value: &Value) -> String {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn token_schema() -> JsonSchema {
        JsonSchema::new(
            "OAuthTokenResponse",
            &json!({
                "type": "object",
                "required": ["access_token", "expires_in"],
                "properties": {
                    "access_token": { "type": "string" },
                    "expires_in": { "type": "number" }
                },
                "additionalProperties": false
            }),
        )
        .unwrap()
    }

    #[test]
    fn valid_value_passes() {
        let schema = token_schema();
        let value = json!({ "access_token": "at", "expires_in": 3600 });
        assert_eq!(
            schema.validate(&value, ValidationMode::Strict).unwrap(),
            value
        );
    }

    #[test]
    fn type_mismatch_reports_path_and_actual() {
        let schema = token_schema();
        let issues = schema
            .validate(
                &json!({ "access_token": 42, "expires_in": 3600 }),
                ValidationMode::Strict,
            )
            .unwrap_err();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].path, "/access_token");
        assert_eq!(issues[0].actual, "number");
        assert_eq!(issues[0].expected, "type");
    }

    #[test]
    fn permissive_tolerates_unknown_fields() {
        let schema = token_schema();
        let value = json!({ "access_token": "at", "expires_in": 1, "api_domain": "x" });
        assert!(schema.validate(&value, ValidationMode::Permissive).is_ok());
        assert!(schema.validate(&value, ValidationMode::Strict).is_err());
    }

    #[test]
    fn off_skips_validation() {
        let schema = token_schema();
        let value = json!("not even an object");
        assert!(schema.validate(&value, ValidationMode::Off).is_ok());
    }

    #[test]
    fn invalid_schema_document_is_rejected() {
        let err = JsonSchema::new("Broken", &json!({ "type": "not-a-type" })).unwrap_err();
        assert!(matches!(err, crate::Error::Schema(_)));
    }

    #[test]
    fn mode_deserializes_lowercase() {
        #[derive(Deserialize)]
        struct Wrapper {
            mode: ValidationMode,
        }
        let parsed: Wrapper = toml::from_str(r#"mode = "strict""#).unwrap();
        assert_eq!(parsed.mode, ValidationMode::Strict);
    }
}
