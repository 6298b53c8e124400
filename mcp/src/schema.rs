//! Parameter schema translation.
//!
//! Backends declare tool parameters as JSON Schema. [`ParamSchema::translate`]
//! turns that into a small tagged tree, once per discovery, which the gateway
//! uses to coerce and validate arguments and to declare its own proxy
//! signatures. Translation never fails: anything exotic becomes [`ParamKind::Any`].

use std::fmt;

use serde_json::{json, Map, Value};

/// Translated schema node with an optional description.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSchema {
    pub kind: ParamKind,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamKind {
    String,
    /// `integer` is kept so the re-declared schema stays faithful.
    Number {
        integer: bool,
    },
    Boolean,
    Array(Box<ParamSchema>),
    /// Declared properties in declaration order.
    Object(Vec<(String, ParamSchema)>),
    /// Object without declared properties: any map is accepted.
    Map,
    Any,
}

/// Path-qualified validation failure, e.g. `items[1].qty: expected number`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    pub path: String,
    pub message: String,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

impl ParamSchema {
    pub fn new(kind: ParamKind) -> Self {
        Self {
            kind,
            description: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn any() -> Self {
        Self::new(ParamKind::Any)
    }

    /// Translate the top-level input schema of a tool.
    ///
    /// The top level is always an object: a schema without `properties`
    /// becomes an object with no declared fields, accepting any arguments.
    pub fn translate_input(schema: &Map<String, Value>) -> Self {
        let fields = schema
            .get("properties")
            .and_then(Value::as_object)
            .map(translate_fields)
            .unwrap_or_default();

        let mut translated = Self::new(ParamKind::Object(fields));
        translated.description = description_of(schema);
        translated
    }

    /// Translate a single property schema.
    pub fn translate(schema: &Value) -> Self {
        let Some(obj) = schema.as_object() else {
            return Self::any();
        };

        let kind = match obj.get("type").and_then(Value::as_str) {
            Some("string") => ParamKind::String,
            Some("number") => ParamKind::Number { integer: false },
            Some("integer") => ParamKind::Number { integer: true },
            Some("boolean") => ParamKind::Boolean,
            Some("array") => {
                let items = obj.get("items").map(Self::translate).unwrap_or_else(Self::any);
                ParamKind::Array(Box::new(items))
            }
            Some("object") => match obj.get("properties").and_then(Value::as_object) {
                Some(props) => ParamKind::Object(translate_fields(props)),
                None => ParamKind::Map,
            },
            _ => ParamKind::Any,
        };

        Self {
            kind,
            description: description_of(obj),
        }
    }

    /// Whether a missing value satisfies this schema.
    pub fn accepts_absent(&self) -> bool {
        matches!(self.kind, ParamKind::Any)
    }

    /// Best-effort in-place coercion of string-encoded scalars.
    ///
    /// Callers often send `"5"` for a number or `"true"` for a boolean.
    pub fn coerce(&self, value: &mut Value) {
        match &self.kind {
            ParamKind::Number { .. } => {
                let parsed = value
                    .as_str()
                    .and_then(|s| s.trim().parse::<f64>().ok())
                    .and_then(number_value);
                if let Some(num) = parsed {
                    *value = num;
                }
            }
            ParamKind::Boolean => match value.as_str() {
                Some("true") => *value = Value::Bool(true),
                Some("false") => *value = Value::Bool(false),
                _ => {}
            },
            ParamKind::Array(items) => {
                if let Value::Array(values) = value {
                    for item in values.iter_mut() {
                        items.coerce(item);
                    }
                }
            }
            ParamKind::Object(fields) => {
                if let Value::Object(map) = value {
                    for (name, field) in fields {
                        if let Some(v) = map.get_mut(name) {
                            field.coerce(v);
                        }
                    }
                }
            }
            ParamKind::String | ParamKind::Map | ParamKind::Any => {}
        }
    }

    /// Validate a value against this schema.
    ///
    /// Declared object properties are required unless their schema is
    /// unconstrained. Undeclared properties are accepted.
    pub fn validate(&self, value: &Value) -> Result<(), SchemaViolation> {
        self.validate_at(value, "")
    }

    fn validate_at(&self, value: &Value, path: &str) -> Result<(), SchemaViolation> {
        let ok = match (&self.kind, value) {
            (ParamKind::Any, _) => true,
            (ParamKind::String, Value::String(_)) => true,
            (ParamKind::Number { .. }, Value::Number(_)) => true,
            (ParamKind::Boolean, Value::Bool(_)) => true,
            (ParamKind::Map, Value::Object(_)) => true,
            (ParamKind::Array(items), Value::Array(values)) => {
                for (idx, item) in values.iter().enumerate() {
                    items.validate_at(item, &format!("{}[{}]", path, idx))?;
                }
                true
            }
            (ParamKind::Object(fields), Value::Object(map)) => {
                for (name, field) in fields {
                    let field_path = if path.is_empty() {
                        name.clone()
                    } else {
                        format!("{}.{}", path, name)
                    };
                    match map.get(name) {
                        Some(v) => field.validate_at(v, &field_path)?,
                        None if field.accepts_absent() => {}
                        None => {
                            return Err(SchemaViolation {
                                path: field_path,
                                message: "required".to_string(),
                            })
                        }
                    }
                }
                true
            }
            _ => false,
        };

        if ok {
            Ok(())
        } else {
            Err(SchemaViolation {
                path: path.to_string(),
                message: format!("expected {}, got {}", self.kind.label(), type_label(value)),
            })
        }
    }

    /// Render back to JSON Schema for declaring the proxy upstream.
    pub fn to_json_schema(&self) -> Value {
        let mut schema = match &self.kind {
            ParamKind::String => json!({ "type": "string" }),
            ParamKind::Number { integer: false } => json!({ "type": "number" }),
            ParamKind::Number { integer: true } => json!({ "type": "integer" }),
            ParamKind::Boolean => json!({ "type": "boolean" }),
            ParamKind::Array(items) => json!({ "type": "array", "items": items.to_json_schema() }),
            ParamKind::Map => json!({ "type": "object" }),
            ParamKind::Object(fields) => {
                let properties: Map<String, Value> = fields
                    .iter()
                    .map(|(name, field)| (name.clone(), field.to_json_schema()))
                    .collect();
                let required: Vec<&str> = fields
                    .iter()
                    .filter(|(_, field)| !field.accepts_absent())
                    .map(|(name, _)| name.as_str())
                    .collect();
                let mut schema = json!({ "type": "object", "properties": properties });
                if !required.is_empty() {
                    schema["required"] = json!(required);
                }
                schema
            }
            ParamKind::Any => json!({}),
        };

        if let (Some(description), Some(obj)) = (&self.description, schema.as_object_mut()) {
            obj.insert("description".to_string(), json!(description));
        }
        schema
    }

    /// Top-level JSON Schema as the object map rmcp tool declarations expect.
    pub fn to_input_schema(&self) -> Map<String, Value> {
        match self.to_json_schema() {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

impl ParamKind {
    fn label(&self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Number { integer: false } => "number",
            ParamKind::Number { integer: true } => "integer",
            ParamKind::Boolean => "boolean",
            ParamKind::Array(_) => "array",
            ParamKind::Object(_) | ParamKind::Map => "object",
            ParamKind::Any => "any",
        }
    }
}

fn translate_fields(props: &Map<String, Value>) -> Vec<(String, ParamSchema)> {
    props
        .iter()
        .map(|(name, schema)| (name.clone(), ParamSchema::translate(schema)))
        .collect()
}

fn description_of(obj: &Map<String, Value>) -> Option<String> {
    obj.get("description")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Integral floats become JSON integers so `"5"` coerces to `5`, not `5.0`.
fn number_value(n: f64) -> Option<Value> {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Some(json!(n as i64))
    } else {
        serde_json::Number::from_f64(n).map(Value::Number)
    }
}

fn type_label(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
