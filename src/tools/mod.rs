//! Tool contract, result envelope, registry and dispatch.

pub mod batch;
pub mod builtin;
pub mod cache;
pub mod dispatch;
pub mod registry;

pub use dispatch::ToolDispatcher;
pub use registry::{RegistryState, ToolRegistry};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    FileSystem,
    Web,
    Research,
    Writing,
    Analysis,
    Utility,
}

impl fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FileSystem => "filesystem",
            Self::Web => "web",
            Self::Research => "research",
            Self::Writing => "writing",
            Self::Analysis => "analysis",
            Self::Utility => "utility",
        };
        f.write_str(s)
    }
}

/// A named capability the agent loop can invoke.
///
/// `execute` only runs after the registry has confirmed the tool exists and
/// `validate` accepted the parameters, so implementations may rely on the
/// shape `validate` checked. Returned errors become failure envelopes.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn category(&self) -> ToolCategory;

    fn version(&self) -> &str {
        "1.0.0"
    }

    /// JSON schema of the parameters object.
    fn parameters(&self) -> Value;

    fn validate(&self, params: &Value) -> bool;

    async fn execute(&self, params: Value, cancel: &CancellationToken) -> anyhow::Result<Value>;

    fn help(&self) -> String {
        let schema = serde_json::to_string_pretty(&self.parameters()).unwrap_or_default();
        format!(
            "{} (v{}, {})\n{}\n\nParameters:\n{}",
            self.name(),
            self.version(),
            self.category(),
            self.description(),
            schema
        )
    }
}

/// Description of a tool, for prompts and listings.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub category: ToolCategory,
    pub version: String,
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn of(tool: &dyn Tool) -> Self {
        Self {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            category: tool.category(),
            version: tool.version().to_string(),
            parameters: tool.parameters(),
        }
    }
}

/// A request from the agent loop to run a tool.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ToolCall {
    #[serde(alias = "name")]
    pub tool: String,
    #[serde(default = "empty_object", alias = "params", alias = "input")]
    pub arguments: Value,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFailureKind {
    NotFound,
    InvalidParameters,
    Execution,
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Success(Value),
    Failure { kind: ToolFailureKind, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolMetadata {
    pub timestamp: DateTime<Utc>,
    pub tool_name: String,
    pub version: String,
    pub execution_time_ms: u64,
}

/// The envelope every invocation produces. Exactly one of data or error.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocationResult {
    pub outcome: ToolOutcome,
    pub metadata: ToolMetadata,
}

impl ToolInvocationResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Success(_))
    }

    pub fn data(&self) -> Option<&Value> {
        match &self.outcome {
            ToolOutcome::Success(v) => Some(v),
            ToolOutcome::Failure { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            ToolOutcome::Success(_) => None,
            ToolOutcome::Failure { message, .. } => Some(message),
        }
    }

    pub fn failure_kind(&self) -> Option<ToolFailureKind> {
        match &self.outcome {
            ToolOutcome::Success(_) => None,
            ToolOutcome::Failure { kind, .. } => Some(*kind),
        }
    }
}

impl Serialize for ToolInvocationResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("ToolInvocationResult", 3)?;
        s.serialize_field("success", &self.is_success())?;
        match &self.outcome {
            ToolOutcome::Success(data) => s.serialize_field("data", data)?,
            ToolOutcome::Failure { message, .. } => s.serialize_field("error", message)?,
        }
        s.serialize_field("metadata", &self.metadata)?;
        s.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metadata() -> ToolMetadata {
        ToolMetadata {
            timestamp: Utc::now(),
            tool_name: "t".into(),
            version: "1.0.0".into(),
            execution_time_ms: 3,
        }
    }

    #[test]
    fn envelope_serializes_one_branch() {
        let ok = ToolInvocationResult {
            outcome: ToolOutcome::Success(json!({"n": 1})),
            metadata: metadata(),
        };
        let v = serde_json::to_value(&ok).unwrap();
        assert_eq!(v["success"], true);
        assert_eq!(v["data"]["n"], 1);
        assert!(v.get("error").is_none());
        assert_eq!(v["metadata"]["toolName"], "t");

        let err = ToolInvocationResult {
            outcome: ToolOutcome::Failure {
                kind: ToolFailureKind::Execution,
                message: "boom".into(),
            },
            metadata: metadata(),
        };
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["success"], false);
        assert_eq!(v["error"], "boom");
        assert!(v.get("data").is_none());
    }

    #[test]
    fn tool_call_accepts_common_aliases() {
        let a: ToolCall =
            serde_json::from_value(json!({"tool": "x", "arguments": {"a": 1}})).unwrap();
        let b: ToolCall = serde_json::from_value(json!({"name": "x", "params": {"a": 1}})).unwrap();
        assert_eq!(a, b);
        let c: ToolCall = serde_json::from_value(json!({"tool": "x"})).unwrap();
        assert_eq!(c.arguments, json!({}));
    }
}
