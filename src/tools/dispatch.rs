use super::{ToolCall, ToolFailureKind, ToolInvocationResult, ToolRegistry};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Bridges model-issued tool calls to the registry and renders the
/// envelope as text for the conversation.
#[derive(Clone)]
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Run a call and render it. Returns `(result_text, is_error)`.
    pub async fn dispatch(&self, call: &ToolCall, cancel: &CancellationToken) -> (String, bool) {
        debug!(tool = %call.tool, "dispatching tool call");
        let result = self
            .registry
            .execute_tool(&call.tool, call.arguments.clone(), cancel)
            .await;
        render(&call.tool, &result)
    }
}

pub fn render(tool: &str, result: &ToolInvocationResult) -> (String, bool) {
    match (result.data(), result.error()) {
        (Some(data), _) => {
            let body = match data {
                Value::String(s) => s.clone(),
                other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
            };
            (format!("[{tool}] result:\n{body}"), false)
        }
        (None, message) => {
            let message = message.unwrap_or("unknown error");
            let hint = match result.failure_kind() {
                Some(ToolFailureKind::NotFound) => "Use one of the listed tool names.",
                Some(ToolFailureKind::InvalidParameters) => {
                    "Fix the arguments to match the tool's parameter schema and retry."
                }
                Some(ToolFailureKind::Timeout) => "Try a narrower request.",
                Some(ToolFailureKind::Cancelled) => "The call was cancelled.",
                _ => "Adjust the arguments or try a different approach.",
            };
            (format!("Tool '{tool}' failed: {message}\n{hint}"), true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ToolMetadata, ToolOutcome};
    use chrono::Utc;
    use serde_json::json;

    fn result(outcome: ToolOutcome) -> ToolInvocationResult {
        ToolInvocationResult {
            outcome,
            metadata: ToolMetadata {
                timestamp: Utc::now(),
                tool_name: "read_file".into(),
                version: "1.0.0".into(),
                execution_time_ms: 0,
            },
        }
    }

    #[test]
    fn strings_render_verbatim() {
        let (text, is_error) = render("read_file", &result(ToolOutcome::Success(json!("a\nb"))));
        assert!(!is_error);
        assert_eq!(text, "[read_file] result:\na\nb");
    }

    #[test]
    fn objects_render_pretty() {
        let (text, _) = render("x", &result(ToolOutcome::Success(json!({"k": 1}))));
        assert!(text.contains("\"k\": 1"));
    }

    #[test]
    fn failures_name_the_tool_and_hint() {
        let (text, is_error) = render(
            "read_file",
            &result(ToolOutcome::Failure {
                kind: ToolFailureKind::InvalidParameters,
                message: "Invalid parameters".into(),
            }),
        );
        assert!(is_error);
        assert!(text.starts_with("Tool 'read_file' failed: Invalid parameters"));
        assert!(text.contains("parameter schema"));
    }
}
