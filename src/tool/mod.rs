pub mod dispatch;
pub mod external;
pub mod registry;

pub use dispatch::ToolDispatcher;
pub use external::ExternalToolServerManager;
pub use registry::ToolRegistry;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::config::ValidationLevel;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolSource {
    Internal,
    External(String),
}

impl ToolSource {
    pub fn is_internal(&self) -> bool {
        matches!(self, ToolSource::Internal)
    }
}

#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub examples: Vec<Value>,
    pub source: ToolSource,
    pub risk_baseline: ValidationLevel,
}

#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: Value,
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(content: Value) -> Self {
        Self {
            content,
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: Value::String(message.into()),
            is_error: true,
        }
    }
}

/// An in-process tool handler. External tool-server tools are proxied
/// through `ExternalToolServerManager` rather than implementing this trait.
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;
    async fn execute(&self, input: Value) -> anyhow::Result<ToolResult>;
}

/// Produce a canonical JSON string with object keys sorted recursively, so
/// cache fingerprints are stable regardless of key insertion order.
pub fn canonical_json(value: &Value) -> String {
    serde_json::to_string(&canonical_value(value)).unwrap_or_default()
}

fn canonical_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonical_value(v))).collect();
            let mut out = Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), v);
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(canonical_value).collect()),
        other => other.clone(),
    }
}
