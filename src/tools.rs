use std::collections::BTreeMap;
use std::fmt::Debug;

use anyhow::Context;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::errors::{Result, SimplemindError};

/// The argument types a tool may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    String,
    Integer,
    Boolean,
}

impl PropertyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyKind::String => "string",
            PropertyKind::Integer => "integer",
            PropertyKind::Boolean => "boolean",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolProperty {
    pub kind: PropertyKind,
    pub enum_values: Option<Vec<String>>,
    pub description: String,
}

impl ToolProperty {
    pub fn new(kind: PropertyKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            enum_values: None,
            description: description.into(),
        }
    }

    pub fn with_enum(mut self, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.enum_values = Some(values.into_iter().map(Into::into).collect());
        self
    }

    fn to_schema(&self) -> Value {
        let mut schema = json!({
            "type": self.kind.as_str(),
            "description": self.description,
        });
        if let Some(values) = &self.enum_values {
            schema["enum"] = json!(values);
        }
        schema
    }
}

pub type ToolFunction = Box<dyn Fn(&Value) -> anyhow::Result<Value> + Send + Sync>;

/// A caller-registered function the model may ask to run.
///
/// `tool_id` and `function_result` stay empty until the vendor requests the
/// tool and it has been executed.
pub struct Tool {
    pub name: String,
    pub description: String,
    pub properties: BTreeMap<String, ToolProperty>,
    pub required: Vec<String>,
    function: ToolFunction,
    pub tool_id: Option<String>,
    pub function_result: Option<String>,
}

impl Tool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        properties: BTreeMap<String, ToolProperty>,
        required: Vec<String>,
        function: impl Fn(&Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Tool {
            name: name.into(),
            description: description.into(),
            properties,
            required,
            function: Box::new(function),
            tool_id: None,
            function_result: None,
        }
    }

    /// Build a tool from a typed argument struct.
    ///
    /// Field doc comments become argument descriptions and `Option` fields are
    /// optional. Arguments must be strings, integers, booleans or unit enums;
    /// anything else is rejected here rather than at call time.
    pub fn from_fn<A, R, F>(
        name: impl Into<String>,
        description: impl Into<String>,
        function: F,
    ) -> Result<Self>
    where
        A: JsonSchema + DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(A) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        let name = name.into();
        let schema = serde_json::to_value(schemars::schema_for!(A))
            .map_err(|e| SimplemindError::Validation(e.to_string()))?;
        let (properties, required) = properties_from_schema(&schema)?;

        let tool_name = name.clone();
        let call = move |input: &Value| -> anyhow::Result<Value> {
            let args: A = serde_json::from_value(input.clone())
                .with_context(|| format!("Invalid arguments for tool '{}'", tool_name))?;
            Ok(serde_json::to_value(function(args)?)?)
        };

        Ok(Self::new(name, description, properties, required, call))
    }

    pub fn is_executed(&self) -> bool {
        self.function_result.is_some()
    }

    /// Argument name to JSON schema, the shape every vendor nests somewhere.
    pub fn properties_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .properties
            .iter()
            .map(|(name, property)| (name.clone(), property.to_schema()))
            .collect();
        Value::Object(properties)
    }

    pub fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": self.properties_schema(),
            "required": self.required,
        })
    }

    /// Run the function with vendor-supplied arguments and record the result.
    pub fn execute(&mut self, tool_id: &str, input: &Value) -> anyhow::Result<&str> {
        let output = (self.function)(input)
            .with_context(|| format!("Tool '{}' failed", self.name))?;
        self.tool_id = Some(tool_id.to_string());
        Ok(self.function_result.insert(stringify(output)).as_str())
    }
}

impl Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("properties", &self.properties)
            .field("required", &self.required)
            .field("function", &"<function>")
            .field("tool_id", &self.tool_id)
            .field("function_result", &self.function_result)
            .finish()
    }
}

fn stringify(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn properties_from_schema(schema: &Value) -> Result<(BTreeMap<String, ToolProperty>, Vec<String>)> {
    let definitions = schema.get("definitions");
    let mut properties = BTreeMap::new();

    if let Some(fields) = schema.get("properties").and_then(Value::as_object) {
        for (name, field) in fields {
            let resolved = resolve(field, definitions);
            let description = field
                .get("description")
                .or_else(|| resolved.get("description"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let (kind, enum_values) = property_kind(name, resolved)?;
            properties.insert(
                name.clone(),
                ToolProperty {
                    kind,
                    enum_values,
                    description,
                },
            );
        }
    }

    let required = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| {
            names
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok((properties, required))
}

/// Follow `$ref`s and single-variant wrappers down to the schema that says
/// what the value is.
fn resolve<'a>(schema: &'a Value, definitions: Option<&'a Value>) -> &'a Value {
    if let Some(target) = schema
        .get("$ref")
        .and_then(Value::as_str)
        .and_then(|r| r.strip_prefix("#/definitions/"))
        .and_then(|name| definitions.and_then(|d| d.get(name)))
    {
        return resolve(target, definitions);
    }

    for key in ["allOf", "anyOf", "oneOf"] {
        if let Some(variants) = schema.get(key).and_then(Value::as_array) {
            let non_null: Vec<&Value> = variants
                .iter()
                .filter(|v| v.get("type").and_then(Value::as_str) != Some("null"))
                .collect();
            if non_null.len() == 1 {
                return resolve(non_null[0], definitions);
            }
        }
    }
    schema
}

fn property_kind(name: &str, schema: &Value) -> Result<(PropertyKind, Option<Vec<String>>)> {
    if let Some(values) = enum_values(schema) {
        return Ok((PropertyKind::String, Some(values)));
    }

    let type_name = match schema.get("type") {
        Some(Value::String(t)) => t.as_str(),
        Some(Value::Array(types)) => types
            .iter()
            .filter_map(Value::as_str)
            .find(|t| *t != "null")
            .unwrap_or("null"),
        _ => "any",
    };

    match type_name {
        "string" => Ok((PropertyKind::String, None)),
        "integer" => Ok((PropertyKind::Integer, None)),
        "boolean" => Ok((PropertyKind::Boolean, None)),
        other => Err(SimplemindError::UnsupportedType {
            name: name.to_string(),
            kind: other.to_string(),
        }),
    }
}

fn enum_values(schema: &Value) -> Option<Vec<String>> {
    fn literal(value: &Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    if let Some(values) = schema.get("enum").and_then(Value::as_array) {
        return values.iter().map(literal).collect();
    }

    // Unit enums with documented variants come out as one `oneOf` entry each.
    let variants = schema.get("oneOf").and_then(Value::as_array)?;
    let mut values = Vec::new();
    for variant in variants {
        let single = variant
            .get("enum")
            .and_then(Value::as_array)
            .map(|v| v.as_slice())
            .or_else(|| variant.get("const").map(std::slice::from_ref))?;
        for value in single {
            values.push(literal(value)?);
        }
    }
    Some(values)
}
