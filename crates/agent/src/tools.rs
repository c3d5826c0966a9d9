use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use opgate_core::domain::operation::AtomicOperation;
use opgate_core::execution::{ActionError, ActionOutput, ActionRunner, ExecutionRequest};

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    async fn execute(&self, input: Value) -> Result<Value>;
}

/// A concrete tool invocation for an operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub args: Value,
    #[serde(default)]
    pub touched_paths: Vec<PathBuf>,
}

impl From<ToolCall> for ExecutionRequest {
    fn from(call: ToolCall) -> Self {
        Self { name: call.name, args: call.args, touched_paths: call.touched_paths }
    }
}

/// Resolves an executing operation to a tool call. `None` leaves the
/// operation executing for an external runner.
#[async_trait]
pub trait ToolPlanner: Send + Sync {
    async fn plan(&self, operation: &AtomicOperation) -> Option<ToolCall>;
}

/// Planner that never plans.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExternalPlanner;

#[async_trait]
impl ToolPlanner for ExternalPlanner {
    async fn plan(&self, _operation: &AtomicOperation) -> Option<ToolCall> {
        None
    }
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn register<T>(&mut self, tool: T)
    where
        T: Tool + 'static,
    {
        self.tools.insert(tool.name().to_string(), Box::new(tool));
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[async_trait]
impl ActionRunner for ToolRegistry {
    async fn execute(&self, name: &str, args: &Value) -> Result<ActionOutput, ActionError> {
        let Some(tool) = self.tools.get(name) else {
            return Err(ActionError::new(format!("unknown tool `{name}`")));
        };

        match tool.execute(args.clone()).await {
            Ok(value) => Ok(action_output(value)),
            Err(error) => match error.downcast_ref::<ActionError>() {
                Some(action_error) => Err(action_error.clone()),
                None => Err(ActionError {
                    message: error.to_string(),
                    stderr: Some(format!("{error:#}")),
                    exit_code: None,
                }),
            },
        }
    }
}

/// Structured runner output when the tool returned one, otherwise the value
/// rendered as stdout.
fn action_output(value: Value) -> ActionOutput {
    if let Ok(output) = serde_json::from_value::<ActionOutput>(value.clone()) {
        return output;
    }
    let stdout = match value {
        Value::String(text) => text,
        Value::Null => String::new(),
        other => other.to_string(),
    };
    ActionOutput { stdout, ..ActionOutput::default() }
}
