use crate::error::AppError;
use crate::llm::ToolCall;
use crate::types::CallContext;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, warn};

/// A capability the model may call during a conversation.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON schema of the arguments object.
    fn parameters(&self) -> Value;
    async fn call(&self, ctx: &CallContext, args: Value) -> Result<String, AppError>;
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Every tool the process knows about.  Apps only ever see the subset on their allow-list.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(CurrentTime));
        registry.register(Arc::new(CallerNumber));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn definitions(&self, allowed: &[String]) -> Vec<ToolDefinition> {
        allowed
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect()
    }

    /// Run one tool call.  Failures are reported back to the model as text rather than aborting
    /// the turn.
    pub async fn invoke(&self, allowed: &[String], ctx: &CallContext, call: &ToolCall) -> String {
        if !allowed.iter().any(|name| name == &call.name) {
            warn!(
                call_sid=%ctx.call_sid,
                tool=%call.name,
                "model called a tool outside the allow-list"
            );
            return format!("error: tool '{}' is not available", call.name);
        }
        let Some(tool) = self.tools.get(&call.name) else {
            warn!(call_sid=%ctx.call_sid, tool=%call.name, "unknown tool");
            return format!("error: tool '{}' is not available", call.name);
        };
        let args = if call.arguments.trim().is_empty() {
            json!({})
        } else {
            match serde_json::from_str(&call.arguments) {
                Ok(args) => args,
                Err(e) => return format!("error: invalid arguments: {e}"),
            }
        };
        match tool.call(ctx, args).await {
            Ok(output) => {
                debug!(call_sid=%ctx.call_sid, tool=%call.name, "tool succeeded");
                output
            }
            Err(e) => {
                warn!(call_sid=%ctx.call_sid, tool=%call.name, error=%e, "tool failed");
                format!("error: {e}")
            }
        }
    }
}

pub struct CurrentTime;

#[async_trait]
impl Tool for CurrentTime {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time in UTC."
    }

    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn call(&self, _ctx: &CallContext, _args: Value) -> Result<String, AppError> {
        let now = OffsetDateTime::now_utc();
        Ok(format!(
            "{} {} {} {}, {:02}:{:02} UTC",
            now.weekday(),
            now.month(),
            now.day(),
            now.year(),
            now.hour(),
            now.minute()
        ))
    }
}

pub struct CallerNumber;

#[async_trait]
impl Tool for CallerNumber {
    fn name(&self) -> &str {
        "caller_number"
    }

    fn description(&self) -> &str {
        "Get the phone number the caller is calling from."
    }

    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn call(&self, ctx: &CallContext, _args: Value) -> Result<String, AppError> {
        Ok(ctx.from.clone())
    }
}
