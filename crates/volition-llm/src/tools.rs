//! Tool definitions and tool-call requests

use serde::{Deserialize, Serialize};

/// Tool definition advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// JSON schema for the tool input
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    /// Create a new tool definition.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// A structured tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Call id, echoed back on the matching tool result
    pub id: String,
    /// Tool name
    pub name: String,
    /// Parsed input object
    pub input: serde_json::Value,
}

impl ToolCall {
    /// Parse the input into a typed value.
    pub fn parse_input<T: serde::de::DeserializeOwned>(&self) -> crate::Result<T> {
        serde_json::from_value(self.input.clone())
            .map_err(|e| crate::Error::InvalidResponse(e.to_string()))
    }
}
