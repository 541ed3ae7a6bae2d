pub mod adoption;
pub mod engine;
pub mod registry;
pub mod state;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::protocol::{Event, Response};
use crate::Result;
use state::{SessionState, Transition};

/// One requested line breakpoint, addressed by source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakpointSpec {
    pub path: String,
    pub line: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl BreakpointSpec {
    pub fn new(path: impl Into<String>, line: u64) -> Self {
        Self {
            path: path.into(),
            line,
            condition: None,
        }
    }

    /// DAP `SourceBreakpoint` shape (without the source wrapper).
    pub fn to_dap(&self) -> Value {
        let mut breakpoint = serde_json::Map::new();
        breakpoint.insert("line".to_string(), self.line.into());
        if let Some(condition) = &self.condition {
            breakpoint.insert("condition".to_string(), condition.clone().into());
        }
        Value::Object(breakpoint)
    }
}

/// Uniform controller-facing surface over both backend shapes: framed DAP
/// sessions and the REPL bridge.
#[async_trait]
pub trait DebugSession: Send + Sync {
    fn id(&self) -> &str;

    fn policy_name(&self) -> &'static str;

    async fn state(&self) -> SessionState;

    async fn submit_command(&self, command: &str, arguments: Option<Value>) -> Result<Response>;

    fn subscribe_events(&self) -> broadcast::Receiver<Event>;

    fn subscribe_transitions(&self) -> broadcast::Receiver<Transition>;

    async fn close(&self);
}
