//! Tool System
//!
//! Tools are identified by a closed set of [`ToolKind`]s and dispatched through
//! a [`ToolRegistry`]. Whatever happens inside a tool, the registry hands the
//! driver a serialized [`ToolOutcome`] envelope: one failing call never aborts
//! the round or the calls after it.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{ChatError, Result};
use crate::watchdog::Watchdog;

/// Tool call request from the LLM
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Call ID for tracking
    pub id: String,

    /// Tool identifier
    pub name: String,

    /// Arguments exactly as the model produced them (JSON text)
    #[serde(default)]
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// Parse the argument text. Blank text means no arguments.
    pub fn parsed_arguments(&self) -> Result<Map<String, Value>> {
        if self.arguments.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(&self.arguments)? {
            Value::Object(map) => Ok(map),
            Value::Null => Ok(Map::new()),
            other => Err(ChatError::ToolExecution(format!(
                "arguments must be a JSON object, got {other}"
            ))),
        }
    }
}

/// Structured result envelope every tool call produces
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Serialized form fed back to the model as the tool message content
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            json!({"success": false, "error": format!("failed to encode tool result: {e}")})
                .to_string()
        })
    }
}

/// The closed set of tools the engine knows how to dispatch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    GetCurrentTime,
    RunShell,
    ReadFile,
    SearchKnowledge,
}

impl ToolKind {
    pub const ALL: [Self; 4] = [
        Self::GetCurrentTime,
        Self::RunShell,
        Self::ReadFile,
        Self::SearchKnowledge,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GetCurrentTime => "get_current_time",
            Self::RunShell => "run_shell",
            Self::ReadFile => "read_file",
            Self::SearchKnowledge => "search_knowledge",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameter definition for tool schema
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParameterSchema {
    /// Parameter name
    pub name: String,

    /// JSON Schema type (string, number, boolean, object, array)
    #[serde(rename = "type")]
    pub param_type: String,

    /// Human-readable description
    pub description: String,

    /// Whether this parameter is required
    #[serde(default)]
    pub required: bool,

    /// Enum of allowed values
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
}

impl ParameterSchema {
    pub fn new(
        name: impl Into<String>,
        param_type: impl Into<String>,
        description: impl Into<String>,
        required: bool,
    ) -> Self {
        Self {
            name: name.into(),
            param_type: param_type.into(),
            description: description.into(),
            required,
            enum_values: None,
        }
    }
}

/// Tool definition schema (for LLM function calling)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolSchema {
    pub kind: ToolKind,

    /// Human-readable description (shown to LLM)
    pub description: String,

    /// Parameter definitions
    pub parameters: Vec<ParameterSchema>,
}

impl ToolSchema {
    /// OpenAI `tools` array entry
    pub fn to_openai(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            let mut prop = json!({
                "type": param.param_type,
                "description": param.description,
            });
            if let Some(values) = &param.enum_values {
                prop["enum"] = Value::Array(values.clone());
            }
            properties.insert(param.name.clone(), prop);
            if param.required {
                required.push(Value::String(param.name.clone()));
            }
        }

        let mut parameters = json!({"type": "object", "properties": properties});
        if !required.is_empty() {
            parameters["required"] = Value::Array(required);
        }

        json!({
            "type": "function",
            "function": {
                "name": self.kind.as_str(),
                "description": self.description,
                "parameters": parameters,
            }
        })
    }
}

/// Per-turn execution context handed to every tool
#[derive(Clone)]
pub struct ToolContext {
    /// Restrict tools to their conservative behavior
    pub safe_mode: bool,

    /// Root for file access
    pub root_path: PathBuf,

    /// Working directory for commands
    pub scratch_dir: PathBuf,

    /// Consulted periodically by long-running tools. `None` disables the
    /// inactivity check.
    pub watchdog: Option<Arc<dyn Watchdog>>,
}

impl ToolContext {
    pub fn new(root_path: impl Into<PathBuf>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            safe_mode: true,
            root_path: root_path.into(),
            scratch_dir: scratch_dir.into(),
            watchdog: None,
        }
    }

    pub const fn with_safe_mode(mut self, safe_mode: bool) -> Self {
        self.safe_mode = safe_mode;
        self
    }

    pub fn with_watchdog(mut self, watchdog: Arc<dyn Watchdog>) -> Self {
        self.watchdog = Some(watchdog);
        self
    }
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("safe_mode", &self.safe_mode)
            .field("root_path", &self.root_path)
            .field("scratch_dir", &self.scratch_dir)
            .field("watchdog", &self.watchdog.is_some())
            .finish()
    }
}

/// Tool trait - implement to add new capabilities
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool's schema for LLM function calling
    fn schema(&self) -> ToolSchema;

    /// Execute the tool with parsed arguments.
    ///
    /// Returning `Err` is allowed; the registry converts it to a failed outcome.
    async fn execute(&self, arguments: &Map<String, Value>, ctx: &ToolContext) -> Result<ToolOutcome>;

    /// Validate arguments before execution (optional)
    fn validate(&self, arguments: &Map<String, Value>) -> Result<()> {
        let schema = self.schema();

        for param in &schema.parameters {
            if param.required && !arguments.contains_key(&param.name) {
                return Err(ChatError::ToolExecution(format!(
                    "Missing required parameter: {}",
                    param.name
                )));
            }
        }

        Ok(())
    }
}

/// Dispatch table from tool identifier to implementation
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<ToolKind, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new tool
    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        self.register_arc(Arc::new(tool));
    }

    /// Register a shared tool
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let kind = tool.schema().kind;
        self.tools.insert(kind, tool);
    }

    /// Get a tool by wire name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        ToolKind::from_name(name).and_then(|kind| self.tools.get(&kind).cloned())
    }

    /// Execute a tool call and return the serialized outcome envelope.
    ///
    /// Never fails: unknown tools, bad arguments, tool errors and panics all
    /// come back as `success: false`.
    pub async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> String {
        self.execute_outcome(call, ctx).await.to_text()
    }

    pub async fn execute_outcome(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutcome {
        let Some(tool) = self.get(&call.name) else {
            tracing::warn!(tool = %call.name, "model requested unknown tool");
            return ToolOutcome::failure(ChatError::ToolNotFound(call.name.clone()).to_string());
        };

        let arguments = match call.parsed_arguments() {
            Ok(arguments) => arguments,
            Err(e) => return ToolOutcome::failure(format!("Invalid arguments: {e}")),
        };

        if let Err(e) = tool.validate(&arguments) {
            return ToolOutcome::failure(e.to_string());
        }

        let run = AssertUnwindSafe(tool.execute(&arguments, ctx)).catch_unwind();
        match run.await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                tracing::debug!(tool = %call.name, error = %e, "tool returned error");
                ToolOutcome::failure(e.to_string())
            }
            Err(_) => {
                tracing::error!(tool = %call.name, "tool panicked");
                ToolOutcome::failure(format!("tool '{}' panicked", call.name))
            }
        }
    }

    /// Schemas sorted by tool name
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<_> = self.tools.values().map(|t| t.schema()).collect();
        schemas.sort_by_key(|s| s.kind.as_str());
        schemas
    }

    /// `tools` payload for an OpenAI-compatible request
    pub fn openai_tools(&self) -> Vec<Value> {
        self.schemas().iter().map(ToolSchema::to_openai).collect()
    }

    /// Get tool names
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.tools.keys().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
