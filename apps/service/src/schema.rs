//! JSON Schema validation for content payloads.
//!
//! Covers the subset the content engine relies on: `type`, `required`,
//! `properties`, `additionalProperties` (boolean form), `items`, `enum`,
//! numeric bounds, and length bounds. Validators are compiled once per
//! content type and cached by `(content_type_id, schema_version)`;
//! violations carry the failing JSON pointer.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum SchemaParseError {
    #[error("schema is not valid JSON: {0}")]
    NotJson(String),
    #[error("schema must be a JSON object")]
    NotObject,
    #[error("unsupported type keyword '{0}'")]
    UnsupportedType(String),
}

/// One failed constraint, pointed at by a JSON pointer into the data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    pub pointer: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JsonType {
    Object,
    Array,
    String,
    Number,
    Integer,
    Boolean,
    Null,
}

impl JsonType {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "object" => Some(Self::Object),
            "array" => Some(Self::Array),
            "string" => Some(Self::String),
            "number" => Some(Self::Number),
            "integer" => Some(Self::Integer),
            "boolean" => Some(Self::Boolean),
            "null" => Some(Self::Null),
            _ => None,
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Null => value.is_null(),
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::Object => "object",
            Self::Array => "array",
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Null => "null",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompiledSchema {
    types: Vec<JsonType>,
    required: Vec<String>,
    properties: HashMap<String, CompiledSchema>,
    additional_properties: Option<bool>,
    items: Option<Box<CompiledSchema>>,
    enum_values: Option<Vec<Value>>,
    minimum: Option<f64>,
    maximum: Option<f64>,
    min_length: Option<u64>,
    max_length: Option<u64>,
    min_items: Option<u64>,
    max_items: Option<u64>,
}

impl CompiledSchema {
    pub fn compile(schema_json: &str) -> Result<Self, SchemaParseError> {
        let value: Value = serde_json::from_str(schema_json)
            .map_err(|error| SchemaParseError::NotJson(error.to_string()))?;
        let object = value.as_object().ok_or(SchemaParseError::NotObject)?;
        Self::compile_node(object)
    }

    fn compile_node(node: &Map<String, Value>) -> Result<Self, SchemaParseError> {
        let mut compiled = Self::default();

        match node.get("type") {
            Some(Value::String(name)) => {
                compiled.types.push(
                    JsonType::parse(name)
                        .ok_or_else(|| SchemaParseError::UnsupportedType(name.clone()))?,
                );
            }
            Some(Value::Array(names)) => {
                for name in names {
                    let name = name
                        .as_str()
                        .ok_or_else(|| SchemaParseError::UnsupportedType(name.to_string()))?;
                    compiled.types.push(
                        JsonType::parse(name)
                            .ok_or_else(|| SchemaParseError::UnsupportedType(name.to_string()))?,
                    );
                }
            }
            _ => {}
        }

        if let Some(Value::Array(required)) = node.get("required") {
            for field in required {
                if let Some(field) = field.as_str() {
                    compiled.required.push(field.to_string());
                }
            }
        }

        if let Some(Value::Object(properties)) = node.get("properties") {
            for (key, child) in properties {
                if let Some(child) = child.as_object() {
                    compiled
                        .properties
                        .insert(key.clone(), Self::compile_node(child)?);
                }
            }
        }

        if let Some(Value::Bool(allowed)) = node.get("additionalProperties") {
            compiled.additional_properties = Some(*allowed);
        }

        if let Some(Value::Object(items)) = node.get("items") {
            compiled.items = Some(Box::new(Self::compile_node(items)?));
        }

        if let Some(Value::Array(choices)) = node.get("enum") {
            compiled.enum_values = Some(choices.clone());
        }

        compiled.minimum = node.get("minimum").and_then(Value::as_f64);
        compiled.maximum = node.get("maximum").and_then(Value::as_f64);
        compiled.min_length = node.get("minLength").and_then(Value::as_u64);
        compiled.max_length = node.get("maxLength").and_then(Value::as_u64);
        compiled.min_items = node.get("minItems").and_then(Value::as_u64);
        compiled.max_items = node.get("maxItems").and_then(Value::as_u64);

        Ok(compiled)
    }

    pub fn validate(&self, data: &Value) -> Result<(), Vec<SchemaViolation>> {
        let mut violations = Vec::new();
        self.validate_at(data, "", &mut violations);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    fn validate_at(&self, value: &Value, pointer: &str, violations: &mut Vec<SchemaViolation>) {
        if !self.types.is_empty() && !self.types.iter().any(|t| t.matches(value)) {
            let expected = self
                .types
                .iter()
                .map(|t| t.name())
                .collect::<Vec<_>>()
                .join(" or ");
            violations.push(SchemaViolation {
                pointer: root_pointer(pointer),
                message: format!("expected {expected}"),
            });
            return;
        }

        if let Some(choices) = &self.enum_values {
            if !choices.contains(value) {
                violations.push(SchemaViolation {
                    pointer: root_pointer(pointer),
                    message: "value is not one of the allowed choices".to_string(),
                });
            }
        }

        match value {
            Value::Object(fields) => {
                for field in &self.required {
                    if !fields.contains_key(field) {
                        violations.push(SchemaViolation {
                            pointer: format!("{pointer}/{field}"),
                            message: format!("required field '{field}' is missing"),
                        });
                    }
                }
                for (key, child) in fields {
                    if let Some(child_schema) = self.properties.get(key) {
                        child_schema.validate_at(child, &format!("{pointer}/{key}"), violations);
                    } else if self.additional_properties == Some(false) {
                        violations.push(SchemaViolation {
                            pointer: format!("{pointer}/{key}"),
                            message: format!("unknown field '{key}' is not allowed"),
                        });
                    }
                }
            }
            Value::Array(entries) => {
                let count = entries.len() as u64;
                if let Some(min_items) = self.min_items {
                    if count < min_items {
                        violations.push(SchemaViolation {
                            pointer: root_pointer(pointer),
                            message: format!("expected at least {min_items} items"),
                        });
                    }
                }
                if let Some(max_items) = self.max_items {
                    if count > max_items {
                        violations.push(SchemaViolation {
                            pointer: root_pointer(pointer),
                            message: format!("expected at most {max_items} items"),
                        });
                    }
                }
                if let Some(items) = &self.items {
                    for (index, entry) in entries.iter().enumerate() {
                        items.validate_at(entry, &format!("{pointer}/{index}"), violations);
                    }
                }
            }
            Value::String(text) => {
                let length = text.chars().count() as u64;
                if let Some(min_length) = self.min_length {
                    if length < min_length {
                        violations.push(SchemaViolation {
                            pointer: root_pointer(pointer),
                            message: format!("expected at least {min_length} characters"),
                        });
                    }
                }
                if let Some(max_length) = self.max_length {
                    if length > max_length {
                        violations.push(SchemaViolation {
                            pointer: root_pointer(pointer),
                            message: format!("expected at most {max_length} characters"),
                        });
                    }
                }
            }
            Value::Number(number) => {
                if let Some(as_float) = number.as_f64() {
                    if let Some(minimum) = self.minimum {
                        if as_float < minimum {
                            violations.push(SchemaViolation {
                                pointer: root_pointer(pointer),
                                message: format!("value is below the minimum of {minimum}"),
                            });
                        }
                    }
                    if let Some(maximum) = self.maximum {
                        if as_float > maximum {
                            violations.push(SchemaViolation {
                                pointer: root_pointer(pointer),
                                message: format!("value is above the maximum of {maximum}"),
                            });
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

fn root_pointer(pointer: &str) -> String {
    if pointer.is_empty() {
        "/".to_string()
    } else {
        pointer.to_string()
    }
}

/// Compiled-validator cache keyed by `(content_type_id, schema_version)`.
/// A schema edit bumps the version, so stale entries simply stop being hit.
#[derive(Clone, Default)]
pub struct SchemaCache {
    entries: Arc<Mutex<HashMap<(i64, i64), Arc<CompiledSchema>>>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_compile(
        &self,
        content_type_id: i64,
        schema_version: i64,
        schema_json: &str,
    ) -> Result<Arc<CompiledSchema>, SchemaParseError> {
        let key = (content_type_id, schema_version);
        {
            let entries = self.entries.lock().await;
            if let Some(compiled) = entries.get(&key) {
                return Ok(compiled.clone());
            }
        }
        let compiled = Arc::new(CompiledSchema::compile(schema_json)?);
        let mut entries = self.entries.lock().await;
        entries.retain(|(type_id, _), _| *type_id != content_type_id);
        entries.insert(key, compiled.clone());
        Ok(compiled)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{CompiledSchema, SchemaCache, SchemaParseError};

    const BLOG_SCHEMA: &str = r#"{
        "type": "object",
        "required": ["title"],
        "properties": {
            "title": {"type": "string", "minLength": 1},
            "rating": {"type": "integer", "minimum": 0, "maximum": 5},
            "tags": {"type": "array", "items": {"type": "string"}, "maxItems": 3}
        }
    }"#;

    #[test]
    fn accepts_conforming_data() {
        let schema = CompiledSchema::compile(BLOG_SCHEMA).expect("compile");
        assert!(
            schema
                .validate(&json!({"title": "hello", "rating": 4, "tags": ["a", "b"]}))
                .is_ok()
        );
    }

    #[test]
    fn missing_required_field_points_at_the_field() {
        let schema = CompiledSchema::compile(BLOG_SCHEMA).expect("compile");
        let violations = schema.validate(&json!({})).expect_err("should fail");
        assert_eq!(violations[0].pointer, "/title");
        assert!(violations[0].message.contains("title"));
    }

    #[test]
    fn nested_violations_carry_json_pointers() {
        let schema = CompiledSchema::compile(BLOG_SCHEMA).expect("compile");
        let violations = schema
            .validate(&json!({"title": "x", "tags": ["ok", 7]}))
            .expect_err("should fail");
        assert_eq!(violations[0].pointer, "/tags/1");
    }

    #[test]
    fn numeric_and_length_bounds_are_enforced() {
        let schema = CompiledSchema::compile(BLOG_SCHEMA).expect("compile");
        assert!(schema.validate(&json!({"title": "", "rating": 2})).is_err());
        assert!(schema.validate(&json!({"title": "x", "rating": 9})).is_err());
        assert!(
            schema
                .validate(&json!({"title": "x", "tags": ["a", "b", "c", "d"]}))
                .is_err()
        );
    }

    #[test]
    fn rejects_unparseable_and_non_object_schemas() {
        assert!(matches!(
            CompiledSchema::compile("{not json"),
            Err(SchemaParseError::NotJson(_))
        ));
        assert!(matches!(
            CompiledSchema::compile("[1,2]"),
            Err(SchemaParseError::NotObject)
        ));
        assert!(matches!(
            CompiledSchema::compile(r#"{"type": "uuid"}"#),
            Err(SchemaParseError::UnsupportedType(_))
        ));
    }

    #[test]
    fn additional_properties_false_rejects_unknown_fields() {
        let schema = CompiledSchema::compile(
            r#"{"type": "object", "properties": {"a": {"type": "string"}}, "additionalProperties": false}"#,
        )
        .expect("compile");
        let violations = schema
            .validate(&json!({"a": "ok", "b": 1}))
            .expect_err("should fail");
        assert_eq!(violations[0].pointer, "/b");
    }

    #[tokio::test]
    async fn cache_drops_older_schema_revisions_of_the_same_type() {
        let cache = SchemaCache::new();
        let first = cache
            .get_or_compile(1, 1, r#"{"type": "object"}"#)
            .await
            .expect("compile v1");
        let again = cache
            .get_or_compile(1, 1, r#"{"type": "object"}"#)
            .await
            .expect("cached v1");
        assert!(std::sync::Arc::ptr_eq(&first, &again));

        cache
            .get_or_compile(1, 2, r#"{"type": "object", "required": ["x"]}"#)
            .await
            .expect("compile v2");
        let entries = cache.entries.lock().await;
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key(&(1, 2)));
    }
}
