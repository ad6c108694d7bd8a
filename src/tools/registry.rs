use super::{
    Tool, ToolCategory, ToolDefinition, ToolFailureKind, ToolInvocationResult, ToolMetadata,
    ToolOutcome,
};
use crate::error::{Error, Result};
use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    Uninitialized,
    Initializing,
    Initialized,
}

struct Inner {
    state: RegistryState,
    tools: HashMap<String, Arc<dyn Tool>>,
    by_category: BTreeMap<ToolCategory, BTreeSet<String>>,
}

impl Inner {
    fn empty() -> Self {
        Self {
            state: RegistryState::Uninitialized,
            tools: HashMap::new(),
            by_category: BTreeMap::new(),
        }
    }

    fn insert(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.by_category
            .entry(tool.category())
            .or_default()
            .insert(name.clone());
        self.tools.insert(name, tool);
    }
}

/// Name-indexed tool registry. Every invocation yields exactly one
/// [`ToolInvocationResult`]; tool errors, panics and timeouts are folded
/// into failure envelopes and never reach the caller.
pub struct ToolRegistry {
    inner: RwLock<Inner>,
    timeout: Option<Duration>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::empty()),
            timeout: Some(DEFAULT_TOOL_TIMEOUT),
        }
    }

    /// `None` disables the per-invocation timeout.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the default tool set. A second call is a no-op. On a
    /// duplicate name the registry is rolled back to empty.
    pub fn initialize(&self, tools: Vec<Arc<dyn Tool>>) -> Result<()> {
        let mut inner = self.write();
        if inner.state != RegistryState::Uninitialized {
            debug!(state = ?inner.state, "registry already initialized");
            return Ok(());
        }
        inner.state = RegistryState::Initializing;

        for tool in tools {
            if inner.tools.contains_key(tool.name()) {
                let name = tool.name().to_string();
                *inner = Inner::empty();
                return Err(Error::DuplicateTool(name));
            }
            debug!(tool = tool.name(), category = %tool.category(), "registering tool");
            inner.insert(tool);
        }

        inner.state = RegistryState::Initialized;
        info!(tools = inner.tools.len(), "tool registry initialized");
        Ok(())
    }

    /// Back to an empty, uninitialized registry.
    pub fn reset(&self) {
        *self.write() = Inner::empty();
    }

    /// Add a tool after start-up. Once initialized, a duplicate name is ignored.
    pub fn register_tool(&self, tool: Arc<dyn Tool>) -> Result<()> {
        let mut inner = self.write();
        if inner.tools.contains_key(tool.name()) {
            if inner.state == RegistryState::Initialized {
                debug!(tool = tool.name(), "tool already registered, skipping");
                return Ok(());
            }
            return Err(Error::DuplicateTool(tool.name().to_string()));
        }
        debug!(tool = tool.name(), category = %tool.category(), "registering tool");
        inner.insert(tool);
        Ok(())
    }

    pub fn unregister_tool(&self, name: &str) -> bool {
        let mut inner = self.write();
        let Some(tool) = inner.tools.remove(name) else {
            return false;
        };
        let category = tool.category();
        if let Some(names) = inner.by_category.get_mut(&category) {
            names.remove(name);
            if names.is_empty() {
                inner.by_category.remove(&category);
            }
        }
        true
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.read().tools.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn list_tools(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn tools_by_category(&self, category: ToolCategory) -> Vec<Arc<dyn Tool>> {
        let inner = self.read();
        inner
            .by_category
            .get(&category)
            .into_iter()
            .flatten()
            .filter_map(|name| inner.tools.get(name).cloned())
            .collect()
    }

    pub fn categories(&self) -> Vec<ToolCategory> {
        self.read().by_category.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.read().tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().tools.is_empty()
    }

    pub fn state(&self) -> RegistryState {
        self.read().state
    }

    pub fn help(&self, name: &str) -> Result<String> {
        self.get_tool(name)
            .map(|t| t.help())
            .ok_or_else(|| Error::UnknownTool(name.to_string()))
    }

    /// Definitions sorted by name, for prompt construction and listings.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let inner = self.read();
        let mut defs: Vec<ToolDefinition> = inner
            .tools
            .values()
            .map(|t| ToolDefinition::of(t.as_ref()))
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub async fn execute_tool(
        &self,
        name: &str,
        params: Value,
        cancel: &CancellationToken,
    ) -> ToolInvocationResult {
        let started = Instant::now();

        let Some(tool) = self.get_tool(name) else {
            warn!(tool = name, "tool not found");
            return envelope(
                name,
                "unknown",
                started,
                ToolOutcome::Failure {
                    kind: ToolFailureKind::NotFound,
                    message: format!(
                        "Tool '{name}' not found. Available tools: {}",
                        self.list_tools().join(", ")
                    ),
                },
            );
        };
        let version = tool.version().to_string();

        let rejected = match std::panic::catch_unwind(AssertUnwindSafe(|| tool.validate(&params))) {
            Ok(true) => None,
            Ok(false) => Some(format!(
                "Invalid parameters for tool '{name}'. Check its help for the expected schema"
            )),
            Err(panic) => Some(format!(
                "Invalid parameters for tool '{name}': validation panicked: {}",
                panic_message(panic.as_ref())
            )),
        };
        if let Some(message) = rejected {
            debug!(tool = name, error = %message, "parameter validation failed");
            return envelope(
                name,
                &version,
                started,
                ToolOutcome::Failure {
                    kind: ToolFailureKind::InvalidParameters,
                    message,
                },
            );
        }

        debug!(tool = name, "executing tool");
        let outcome = self.run(tool.as_ref(), params, cancel).await;
        if let ToolOutcome::Failure { kind, message } = &outcome {
            warn!(tool = name, ?kind, error = %message, "tool execution failed");
        }
        envelope(name, &version, started, outcome)
    }

    async fn run(&self, tool: &dyn Tool, params: Value, cancel: &CancellationToken) -> ToolOutcome {
        let exec = AssertUnwindSafe(tool.execute(params, cancel)).catch_unwind();
        let limited = async {
            match self.timeout {
                Some(limit) => tokio::time::timeout(limit, exec).await.ok(),
                None => Some(exec.await),
            }
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return ToolOutcome::Failure {
                    kind: ToolFailureKind::Cancelled,
                    message: "Operation cancelled".into(),
                };
            }
            r = limited => r,
        };

        match result {
            None => ToolOutcome::Failure {
                kind: ToolFailureKind::Timeout,
                message: format!(
                    "timed out after {}s",
                    self.timeout.map_or(0, |d| d.as_secs())
                ),
            },
            Some(Err(panic)) => ToolOutcome::Failure {
                kind: ToolFailureKind::Execution,
                message: format!("tool panicked: {}", panic_message(panic.as_ref())),
            },
            Some(Ok(Err(e))) => ToolOutcome::Failure {
                kind: ToolFailureKind::Execution,
                message: format!("{e:#}"),
            },
            Some(Ok(Ok(data))) => ToolOutcome::Success(data),
        }
    }
}

fn envelope(
    name: &str,
    version: &str,
    started: Instant,
    outcome: ToolOutcome,
) -> ToolInvocationResult {
    ToolInvocationResult {
        outcome,
        metadata: ToolMetadata {
            timestamp: Utc::now(),
            tool_name: name.to_string(),
            version: version.to_string(),
            execution_time_ms: started.elapsed().as_millis() as u64,
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
