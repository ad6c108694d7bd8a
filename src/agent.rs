//! Multi-turn research agent: the model answers directly or asks for a
//! tool, the tool result is appended to the conversation, and the loop
//! repeats until a final answer or the turn limit.

use crate::config::AgentConfig;
use crate::error::Result;
use crate::llm::{
    ActiveSelection, ContentRouter, GenerateRequest, Message, ModelSelector, ProviderId, Usage,
};
use crate::tools::{ToolCall, ToolDispatcher};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const TOOL_FENCE: &str = "```tool";

const TOOL_PROTOCOL: &str = r#"## Tools

To use a tool, reply with exactly one fenced block and nothing after it:

```tool
{"tool": "<name>", "arguments": {...}}
```

The result is sent back to you in the next message. Call one tool at a time.
When you have enough information, answer normally without a tool block."#;

/// Outcome of one user turn.
#[derive(Debug, Clone, Default)]
pub struct TurnReport {
    pub text: String,
    /// Model calls made during the turn.
    pub turns: u32,
    pub tool_calls: u32,
    pub tool_errors: u32,
    /// Providers that served fallback hops during the turn.
    pub fallbacks: Vec<ProviderId>,
    pub hit_turn_limit: bool,
    pub usage: Usage,
}

impl TurnReport {
    pub fn used_fallback(&self) -> bool {
        !self.fallbacks.is_empty()
    }

    fn accumulate(&mut self, usage: &Usage) {
        self.turns += 1;
        self.usage.input_tokens += usage.input_tokens;
        self.usage.output_tokens += usage.output_tokens;
    }
}

pub struct Agent {
    router: Arc<ContentRouter>,
    selector: ModelSelector,
    dispatcher: ToolDispatcher,
    config: AgentConfig,
    history: Vec<Message>,
}

impl Agent {
    pub fn new(
        router: Arc<ContentRouter>,
        dispatcher: ToolDispatcher,
        config: AgentConfig,
    ) -> Self {
        Self {
            router,
            selector: ModelSelector::new(),
            dispatcher,
            config,
            history: Vec::new(),
        }
    }

    pub fn router(&self) -> &ContentRouter {
        &self.router
    }

    pub fn selector(&self) -> &ModelSelector {
        &self.selector
    }

    /// Switch the active selection, validated against this agent's router.
    pub async fn select_model(
        &mut self,
        provider: ProviderId,
        model: &str,
        cancel: &CancellationToken,
    ) -> Result<&ActiveSelection> {
        self.selector
            .select_model(&self.router, provider, model, cancel)
            .await
    }

    pub fn selection(&self) -> Option<&ActiveSelection> {
        self.selector.current_model()
    }

    pub fn dispatcher(&self) -> &ToolDispatcher {
        &self.dispatcher
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// System prompt: configured preamble, the tool protocol, and one line
    /// per registered tool.
    pub fn system_prompt(&self) -> String {
        let defs = self.dispatcher.registry().definitions();
        let mut prompt = self.config.system_prompt.trim().to_string();
        if defs.is_empty() {
            return prompt;
        }
        prompt.push_str("\n\n");
        prompt.push_str(TOOL_PROTOCOL);
        prompt.push_str("\n\nAvailable tools:\n");
        for def in defs {
            let params = serde_json::to_string(&def.parameters).unwrap_or_default();
            prompt.push_str(&format!(
                "- {} ({}): {} Parameters: {}\n",
                def.name, def.category, def.description, params
            ));
        }
        prompt
    }

    /// Run one user turn to completion. On error the conversation is left
    /// as it was before the turn.
    pub async fn run_turn(
        &mut self,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnReport> {
        let checkpoint = self.history.len();
        match self.drive(input, cancel).await {
            Ok(report) => Ok(report),
            Err(e) => {
                self.history.truncate(checkpoint);
                Err(e)
            }
        }
    }

    async fn drive(&mut self, input: &str, cancel: &CancellationToken) -> Result<TurnReport> {
        let system = self.system_prompt();
        let mut report = TurnReport::default();
        self.history.push(Message::user(input));

        info!(
            selection = ?self.selector.current_model().map(ToString::to_string),
            max_turns = self.config.max_turns,
            "starting turn"
        );

        loop {
            let request = GenerateRequest {
                system: Some(system.clone()),
                messages: self.history.clone(),
                ..Default::default()
            };
            let routed = self
                .router
                .generate(self.selector.current_model(), &request, cancel)
                .await?;
            if routed.fallback {
                report.fallbacks.push(routed.provider);
            }
            let response = routed.value;
            report.accumulate(&response.usage);
            debug!(
                turn = report.turns,
                provider = %routed.provider,
                model = %response.model,
                "model replied"
            );

            self.history.push(Message::assistant(response.text.clone()));
            report.text = response.text;

            let Some(call) = parse_tool_call(&report.text) else {
                break;
            };

            if report.turns >= self.config.max_turns {
                warn!(turns = report.turns, tool = %call.tool, "hit max turns limit");
                report.hit_turn_limit = true;
                break;
            }

            let (result, is_error) = self.dispatcher.dispatch(&call, cancel).await;
            report.tool_calls += 1;
            if is_error {
                report.tool_errors += 1;
            }
            debug!(tool = %call.tool, is_error, chars = result.len(), "tool finished");
            self.history.push(Message::user(format!("Tool result:\n{result}")));
        }

        info!(
            turns = report.turns,
            tool_calls = report.tool_calls,
            fallbacks = report.fallbacks.len(),
            "turn complete"
        );
        Ok(report)
    }
}

/// Find a fenced ```` ```tool ```` block and parse the call inside it.
pub fn parse_tool_call(text: &str) -> Option<ToolCall> {
    let start = text.find(TOOL_FENCE)? + TOOL_FENCE.len();
    let body = &text[start..];
    let end = body.find("```")?;
    let call: ToolCall = serde_json::from_str(body[..end].trim()).ok()?;
    (!call.tool.trim().is_empty()).then_some(call)
}
