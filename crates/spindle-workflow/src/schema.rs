//! Data shapes for step inputs, outputs and suspend/resume payloads.
//!
//! The engine only needs two things from a schema: validating a value at a
//! transition boundary, and a JSON Schema description it can compare at
//! build time. [`Schema`] is that capability, so applications can plug in
//! their own validator. [`JsonSchema`] is the built-in implementation and
//! understands a practical subset of JSON Schema:
//!
//! - `type` (a single name or a list of names)
//! - `properties`, `required`, `additionalProperties: false`
//! - `items`
//! - `enum`
//!
//! An empty schema (`{}`) accepts any value.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// A value failed a schema check.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("validation failed at '{path}': {message}")]
pub struct ValidationError {
  /// Location of the offending value, rooted at `$`.
  pub path: String,
  pub message: String,
  /// The (sub-)schema that rejected the value.
  pub schema: Value,
  /// The offending (sub-)value.
  pub value: Value,
}

/// Validation capability for step and workflow data.
pub trait Schema: fmt::Debug + Send + Sync {
  /// Check `value`, returning the accepted value.
  fn validate(&self, value: &Value) -> Result<Value, ValidationError>;

  /// JSON Schema document describing the accepted shape.
  fn json_schema(&self) -> Value;
}

/// JSON Schema primitive types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
  String,
  Number,
  Integer,
  Boolean,
  Null,
  Array,
  Object,
}

impl SchemaType {
  fn parse(name: &str) -> Option<Self> {
    match name {
      "string" => Some(Self::String),
      "number" => Some(Self::Number),
      "integer" => Some(Self::Integer),
      "boolean" => Some(Self::Boolean),
      "null" => Some(Self::Null),
      "array" => Some(Self::Array),
      "object" => Some(Self::Object),
      _ => None,
    }
  }

  fn as_str(self) -> &'static str {
    match self {
      Self::String => "string",
      Self::Number => "number",
      Self::Integer => "integer",
      Self::Boolean => "boolean",
      Self::Null => "null",
      Self::Array => "array",
      Self::Object => "object",
    }
  }

  /// Type of a concrete JSON value.
  pub fn of(value: &Value) -> Self {
    match value {
      Value::Null => Self::Null,
      Value::Bool(_) => Self::Boolean,
      Value::Number(n) if n.is_i64() || n.is_u64() => Self::Integer,
      Value::Number(_) => Self::Number,
      Value::String(_) => Self::String,
      Value::Array(_) => Self::Array,
      Value::Object(_) => Self::Object,
    }
  }

  fn matches(self, value: &Value) -> bool {
    match self {
      Self::Number => value.is_number(),
      Self::Integer => match value {
        Value::Number(n) => n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0),
        _ => false,
      },
      other => other == Self::of(value),
    }
  }

  /// Whether a value of type `other` is acceptable where `self` is expected.
  fn accepts(self, other: SchemaType) -> bool {
    self == other || (self == Self::Number && other == Self::Integer)
  }
}

impl fmt::Display for SchemaType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Built-in [`Schema`] backed by a JSON Schema document.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonSchema(Value);

impl JsonSchema {
  pub fn new(schema: Value) -> Self {
    Self(schema)
  }

  /// A schema that accepts any value.
  pub fn any() -> Self {
    Self(json!({}))
  }

  pub fn as_value(&self) -> &Value {
    &self.0
  }
}

impl Default for JsonSchema {
  fn default() -> Self {
    Self::any()
  }
}

impl Schema for JsonSchema {
  fn validate(&self, value: &Value) -> Result<Value, ValidationError> {
    validate_at(&self.0, value, "$")?;
    Ok(value.clone())
  }

  fn json_schema(&self) -> Value {
    self.0.clone()
  }
}

/// Declared types of a schema, or `None` when the schema does not constrain type.
fn declared_types(schema: &Value) -> Option<Vec<SchemaType>> {
  match schema.get("type")? {
    Value::String(name) => SchemaType::parse(name).map(|t| vec![t]),
    Value::Array(names) => {
      let types: Vec<SchemaType> = names
        .iter()
        .filter_map(Value::as_str)
        .filter_map(SchemaType::parse)
        .collect();
      (!types.is_empty()).then_some(types)
    }
    _ => None,
  }
}

fn describe(types: &[SchemaType]) -> String {
  types
    .iter()
    .map(|t| t.as_str())
    .collect::<Vec<_>>()
    .join(" | ")
}

fn properties(schema: &Value) -> Option<&Map<String, Value>> {
  schema.get("properties").and_then(Value::as_object)
}

fn required(schema: &Value) -> Vec<&str> {
  schema
    .get("required")
    .and_then(Value::as_array)
    .map(|names| names.iter().filter_map(Value::as_str).collect())
    .unwrap_or_default()
}

/// A schema with no constraints at all accepts (and may produce) anything.
pub fn is_unconstrained(schema: &Value) -> bool {
  match schema.as_object() {
    Some(map) => !["type", "properties", "required", "items", "enum"]
      .iter()
      .any(|key| map.contains_key(*key)),
    None => true,
  }
}

fn validate_at(schema: &Value, value: &Value, path: &str) -> Result<(), ValidationError> {
  let reject = |message: String| ValidationError {
    path: path.to_string(),
    message,
    schema: schema.clone(),
    value: value.clone(),
  };

  if let Some(types) = declared_types(schema)
    && !types.iter().any(|t| t.matches(value))
  {
    return Err(reject(format!(
      "expected {}, got {}",
      describe(&types),
      SchemaType::of(value)
    )));
  }

  if let Some(options) = schema.get("enum").and_then(Value::as_array)
    && !options.contains(value)
  {
    return Err(reject(format!("value is not one of {}", Value::Array(options.clone()))));
  }

  match value {
    Value::Object(fields) => {
      for name in required(schema) {
        if !fields.contains_key(name) {
          return Err(reject(format!("missing required property '{}'", name)));
        }
      }

      let props = properties(schema);
      if let Some(props) = props {
        for (name, prop_schema) in props {
          if let Some(field) = fields.get(name) {
            validate_at(prop_schema, field, &format!("{}.{}", path, name))?;
          }
        }
      }

      if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
        let unknown = fields
          .keys()
          .find(|key| !props.is_some_and(|p| p.contains_key(*key)));
        if let Some(key) = unknown {
          return Err(reject(format!("unexpected property '{}'", key)));
        }
      }
    }
    Value::Array(items) => {
      if let Some(item_schema) = schema.get("items") {
        for (index, item) in items.iter().enumerate() {
          validate_at(item_schema, item, &format!("{}[{}]", path, index))?;
        }
      }
    }
    _ => {}
  }

  Ok(())
}

/// Check that data shaped by `source` is always acceptable to `target`.
///
/// Returns a human readable reason on mismatch. An unconstrained side is
/// always compatible: the check only rejects what it can prove wrong.
pub fn check_assignable(source: &Value, target: &Value) -> Result<(), String> {
  assignable_at(source, target, "$")
}

fn assignable_at(source: &Value, target: &Value, path: &str) -> Result<(), String> {
  if is_unconstrained(source) || is_unconstrained(target) {
    return Ok(());
  }

  if let (Some(produced), Some(expected)) = (declared_types(source), declared_types(target))
    && let Some(bad) = produced
      .iter()
      .find(|p| !expected.iter().any(|e| e.accepts(**p)))
  {
    return Err(format!(
      "{}: produces {} where {} is expected",
      path,
      bad,
      describe(&expected)
    ));
  }

  let guaranteed = required(source);
  for name in required(target) {
    if !guaranteed.contains(&name) {
      return Err(format!(
        "{}: required field '{}' is not guaranteed by the producer",
        path, name
      ));
    }
  }

  if let (Some(produced), Some(expected)) = (properties(source), properties(target)) {
    for (name, target_prop) in expected {
      if let Some(source_prop) = produced.get(name) {
        assignable_at(source_prop, target_prop, &format!("{}.{}", path, name))?;
      }
    }
  }

  if let (Some(source_items), Some(target_items)) = (source.get("items"), target.get("items")) {
    assignable_at(source_items, target_items, &format!("{}[]", path))?;
  }

  Ok(())
}

/// Element schema of an array-shaped schema.
///
/// `Err` carries the declared types when the schema cannot describe an array.
pub(crate) fn array_items(schema: &Value) -> Result<Value, String> {
  if let Some(types) = declared_types(schema)
    && !types.contains(&SchemaType::Array)
  {
    return Err(format!("expected an array, found {}", describe(&types)));
  }
  Ok(schema.get("items").cloned().unwrap_or_else(|| json!({})))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn counter() -> JsonSchema {
    JsonSchema::new(json!({
      "type": "object",
      "properties": { "value": { "type": "integer" } },
      "required": ["value"]
    }))
  }

  #[test]
  fn test_empty_schema_accepts_anything() {
    let schema = JsonSchema::any();
    assert!(schema.validate(&json!(null)).is_ok());
    assert!(schema.validate(&json!({"a": [1, 2]})).is_ok());
  }

  #[test]
  fn test_missing_required_property() {
    let err = counter().validate(&json!({})).unwrap_err();
    assert_eq!(err.path, "$");
    assert!(err.message.contains("'value'"));
    assert_eq!(err.value, json!({}));
  }

  #[test]
  fn test_nested_type_mismatch_reports_path() {
    let err = counter().validate(&json!({"value": "ten"})).unwrap_err();
    assert_eq!(err.path, "$.value");
    assert_eq!(err.schema, json!({"type": "integer"}));
    assert_eq!(err.value, json!("ten"));
  }

  #[test]
  fn test_integer_accepts_whole_floats() {
    let schema = JsonSchema::new(json!({"type": "integer"}));
    assert!(schema.validate(&json!(4.0)).is_ok());
    assert!(schema.validate(&json!(4.5)).is_err());
  }

  #[test]
  fn test_array_items_and_enum() {
    let schema = JsonSchema::new(json!({
      "type": "array",
      "items": { "enum": ["a", "b"] }
    }));
    assert!(schema.validate(&json!(["a", "b", "a"])).is_ok());
    let err = schema.validate(&json!(["a", "c"])).unwrap_err();
    assert_eq!(err.path, "$[1]");
  }

  #[test]
  fn test_additional_properties_false() {
    let schema = JsonSchema::new(json!({
      "type": "object",
      "properties": { "a": {} },
      "additionalProperties": false
    }));
    assert!(schema.validate(&json!({"a": 1})).is_ok());
    assert!(schema.validate(&json!({"a": 1, "b": 2})).is_err());
  }

  #[test]
  fn test_type_list() {
    let schema = JsonSchema::new(json!({"type": ["string", "null"]}));
    assert!(schema.validate(&json!(null)).is_ok());
    assert!(schema.validate(&json!("x")).is_ok());
    assert!(schema.validate(&json!(1)).is_err());
  }

  #[test]
  fn test_assignable_requires_guaranteed_fields() {
    let source = json!({
      "type": "object",
      "properties": { "doubled": { "type": "number" } },
      "required": ["doubled"]
    });
    let target = json!({
      "type": "object",
      "properties": { "tripled": { "type": "number" } },
      "required": ["tripled"]
    });
    let reason = check_assignable(&source, &target).unwrap_err();
    assert!(reason.contains("'tripled'"));
    assert!(check_assignable(&source, &source).is_ok());
  }

  #[test]
  fn test_assignable_optional_field_is_not_enough() {
    let source = json!({
      "type": "object",
      "properties": { "value": { "type": "number" } }
    });
    let target = json!({
      "type": "object",
      "properties": { "value": { "type": "number" } },
      "required": ["value"]
    });
    assert!(check_assignable(&source, &target).is_err());
  }

  #[test]
  fn test_assignable_integer_into_number() {
    let int = json!({"type": "integer"});
    let num = json!({"type": "number"});
    assert!(check_assignable(&int, &num).is_ok());
    assert!(check_assignable(&num, &int).is_err());
  }

  #[test]
  fn test_assignable_checks_nested_properties() {
    let source = json!({
      "type": "object",
      "properties": { "value": { "type": "string" } },
      "required": ["value"]
    });
    let reason = check_assignable(&source, counter().as_value()).unwrap_err();
    assert!(reason.starts_with("$.value"));
  }

  #[test]
  fn test_unconstrained_side_is_compatible() {
    assert!(check_assignable(&json!({}), counter().as_value()).is_ok());
    assert!(check_assignable(counter().as_value(), &json!({})).is_ok());
  }

  #[test]
  fn test_array_items() {
    assert_eq!(
      array_items(&json!({"type": "array", "items": {"type": "string"}})).unwrap(),
      json!({"type": "string"})
    );
    assert_eq!(array_items(&json!({})).unwrap(), json!({}));
    assert!(array_items(&json!({"type": "object"})).is_err());
  }
}
