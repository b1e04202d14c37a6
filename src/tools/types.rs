//! Tool parameter schemas.

use serde::{Deserialize, Serialize};

/// JSON Schema-based parameter definition for a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentToolParameters {
    /// JSON Schema object describing the parameters.
    pub schema: serde_json::Value,
}

impl AgentToolParameters {
    /// Create from a raw JSON Schema value.
    pub fn from_schema(schema: serde_json::Value) -> Self {
        Self { schema }
    }

    /// Create an empty parameter schema (no parameters).
    pub fn empty() -> Self {
        Self::object().build()
    }

    /// Builder: create an object schema with properties.
    pub fn object() -> ParameterBuilder {
        ParameterBuilder {
            properties: serde_json::Map::new(),
            required: Vec::new(),
        }
    }
}

/// Builder for constructing tool parameter schemas.
pub struct ParameterBuilder {
    properties: serde_json::Map<String, serde_json::Value>,
    required: Vec<String>,
}

impl ParameterBuilder {
    fn property(mut self, name: String, schema: serde_json::Value, required: bool) -> Self {
        if required {
            self.required.push(name.clone());
        }
        self.properties.insert(name, schema);
        self
    }

    /// Add a string property.
    pub fn string(self, name: impl Into<String>, description: impl Into<String>, required: bool) -> Self {
        let schema = serde_json::json!({ "type": "string", "description": description.into() });
        self.property(name.into(), schema, required)
    }

    /// Add an integer property.
    pub fn integer(self, name: impl Into<String>, description: impl Into<String>, required: bool) -> Self {
        let schema = serde_json::json!({ "type": "integer", "description": description.into() });
        self.property(name.into(), schema, required)
    }

    /// Build into AgentToolParameters.
    pub fn build(self) -> AgentToolParameters {
        AgentToolParameters {
            schema: serde_json::json!({
                "type": "object",
                "properties": self.properties,
                "required": self.required,
            }),
        }
    }
}
