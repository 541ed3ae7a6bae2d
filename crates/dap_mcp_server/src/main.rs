use std::collections::HashMap;
use std::sync::Arc;

use rmcp::{
    handler::server::{tool::ToolRouter, wrapper::Parameters, ServerHandler},
    model::*,
    tool, tool_handler, tool_router, transport, ErrorData as McpError, ServiceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use dap_bridge_core::{
    AdapterCommand, BreakpointSpec, ConnectMode, LaunchSpec, SessionConfig, SessionRegistry,
};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct BreakpointParam {
    path: String,
    line: u64,
    #[serde(default)]
    condition: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct CreateSessionParams {
    /// Backend policy name: python, dotnet, go, java, javascript, mock.
    policy: String,
    /// Already-resolved adapter executable.
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    /// TCP endpoint of the adapter; omitted means stdio pipes.
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    /// "launch" (default) or "attach".
    #[serde(default)]
    request: Option<String>,
    /// Adapter-defined launch/attach configuration.
    #[serde(default)]
    configuration: Option<Map<String, Value>>,
    #[serde(default)]
    stop_on_entry: Option<bool>,
    /// Breakpoints to install before or during the handshake.
    #[serde(default)]
    breakpoints: Vec<BreakpointParam>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct CommandParams {
    session_id: String,
    /// DAP command name, e.g. stackTrace, continue, evaluate.
    command: String,
    #[serde(default)]
    arguments: Option<Map<String, Value>>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct EventsParams {
    session_id: String,
    /// Return events with ring sequence >= this value.
    #[serde(default)]
    since: u64,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct CloseSessionParams {
    session_id: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct ListSessionsParams {}

fn to_mcp_error(message: impl Into<String>) -> McpError {
    McpError::internal_error(message.into(), None)
}

#[derive(Clone)]
struct DapMcpServer {
    tool_router: ToolRouter<Self>,
    registry: Arc<SessionRegistry>,
}

#[tool_router]
impl DapMcpServer {
    fn new() -> Self {
        Self {
            tool_router: Self::tool_router(),
            registry: Arc::new(SessionRegistry::new()),
        }
    }

    #[tool(description = "Create a debug session against a language backend")]
    async fn debug_create_session(
        &self,
        params: Parameters<CreateSessionParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;

        let connect = match (params.host, params.port) {
            (host, Some(port)) => ConnectMode::Tcp {
                host: host.unwrap_or_else(|| "127.0.0.1".to_string()),
                port,
            },
            _ => ConnectMode::Stdio,
        };

        let configuration = Value::Object(params.configuration.unwrap_or_default());
        let mut launch = match params.request.as_deref() {
            Some("attach") => LaunchSpec::attach(configuration),
            _ => LaunchSpec::launch(configuration),
        };
        launch.stop_on_entry = params.stop_on_entry;

        let mut adapter = AdapterCommand::new(params.command, params.args);
        adapter.env = params.env;

        let mut config = SessionConfig::new(adapter, connect, launch);
        config.initial_breakpoints = params
            .breakpoints
            .into_iter()
            .map(|bp| BreakpointSpec {
                path: bp.path,
                line: bp.line,
                condition: bp.condition,
            })
            .collect();

        let session_id = self
            .registry
            .create_session(&params.policy, config)
            .await
            .map_err(|e| to_mcp_error(format!("Failed to create debug session: {e}")))?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "session_id": session_id,
        })))
    }

    #[tool(description = "Submit a DAP command to a session")]
    async fn debug_command(
        &self,
        params: Parameters<CommandParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let arguments = params.arguments.map(Value::Object);

        let response = self
            .registry
            .submit_command(&params.session_id, &params.command, arguments)
            .await
            .map_err(|e| to_mcp_error(format!("Command '{}' failed: {e}", params.command)))?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "success": response.success,
            "body": response.body,
        })))
    }

    #[tool(description = "Poll buffered events from a session")]
    async fn debug_events(
        &self,
        params: Parameters<EventsParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let events = self
            .registry
            .recent_events(&params.session_id, params.since)
            .await
            .map_err(|e| to_mcp_error(format!("Failed to read events: {e}")))?;

        let next = events.last().map(|(seq, _)| seq + 1).unwrap_or(params.since);
        let events: Vec<Value> = events
            .into_iter()
            .map(|(seq, event)| json!({ "seq": seq, "event": event.event, "body": event.body }))
            .collect();

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "events": events,
            "next": next,
        })))
    }

    #[tool(description = "List live debug sessions")]
    async fn debug_list_sessions(
        &self,
        _params: Parameters<ListSessionsParams>,
    ) -> Result<CallToolResult, McpError> {
        let sessions: Vec<Value> = self
            .registry
            .list_sessions()
            .await
            .into_iter()
            .map(|summary| {
                json!({
                    "session_id": summary.id,
                    "policy": summary.policy,
                    "state": summary.state,
                })
            })
            .collect();

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "sessions": sessions,
        })))
    }

    #[tool(description = "Close a debug session and its backend process")]
    async fn debug_close_session(
        &self,
        params: Parameters<CloseSessionParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        self.registry
            .close_session(&params.session_id)
            .await
            .map_err(|e| to_mcp_error(format!("Failed to close session: {e}")))?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "closed": params.session_id,
        })))
    }
}

#[tool_handler]
impl ServerHandler for DapMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "DAP bridge MCP server: drive python/dotnet/go/java/javascript/mock debug backends through one protocol".into(),
            ),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let server = DapMcpServer::new();
    let transport = transport::stdio();

    tracing::info!("Starting DAP bridge MCP server on stdio...");

    server.serve(transport).await?.waiting().await?;

    Ok(())
}
