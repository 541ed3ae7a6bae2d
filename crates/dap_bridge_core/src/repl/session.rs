//! DAP-shaped session over the REPL bridge.
//!
//! Translates the controller's DAP commands into REPL commands and
//! synthesizes DAP responses and events, so the registry can treat a
//! jdb-style backend exactly like a framed one.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex};

use crate::config::{BindMode, SessionConfig, SessionTimeouts};
use crate::error::BridgeError;
use crate::policy::AdapterPolicy;
use crate::protocol::{Event, Response};
use crate::repl::bridge::ReplBridge;
use crate::repl::parser::ReplOutputParser;
use crate::session::state::{SessionState, StateTracker, Transition};
use crate::session::{BreakpointSpec, DebugSession};
use crate::Result;

const EVENT_CHANNEL_CAPACITY: usize = 256;
/// Synthetic variables reference for the single local scope.
const LOCALS_REFERENCE: u64 = 1;

struct ReplInner {
    state: StateTracker,
    /// Source path -> breakpoints installed in the REPL, by resolved class
    /// name and line (needed to clear them on update).
    installed: HashMap<String, Vec<(String, u64)>>,
    closed: bool,
}

pub struct ReplDebugSession {
    id: String,
    policy: Arc<dyn AdapterPolicy>,
    bridge: Arc<ReplBridge>,
    parser: ReplOutputParser,
    timeouts: SessionTimeouts,
    events_tx: broadcast::Sender<Event>,
    transitions_tx: broadcast::Sender<Transition>,
    inner: Mutex<ReplInner>,
}

impl ReplDebugSession {
    pub async fn create(
        id: String,
        policy: Arc<dyn AdapterPolicy>,
        config: SessionConfig,
    ) -> Result<Arc<Self>> {
        let bridge = ReplBridge::spawn(&config.adapter, config.timeouts.repl_spawn).await?;

        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let mut state = StateTracker::new();
        let transitions_tx = state.sender();
        state.transition(SessionState::Initializing, "REPL debugger spawned", &*policy)?;
        state.transition(SessionState::Ready, "REPL prompt detected", &*policy)?;
        state.transition(SessionState::Connected, "REPL session ready", &*policy)?;

        let session = Arc::new(Self {
            id,
            policy,
            bridge,
            parser: ReplOutputParser::new(),
            timeouts: config.timeouts.clone(),
            events_tx,
            transitions_tx,
            inner: Mutex::new(ReplInner {
                state,
                installed: HashMap::new(),
                closed: false,
            }),
        });

        session.clone().spawn_event_pump();

        for spec in &config.initial_breakpoints {
            let args = json!({
                "source": { "path": spec.path },
                "breakpoints": [spec.to_dap()],
            });
            if let Err(e) = session.set_breakpoints(Some(&args)).await {
                tracing::warn!(session = %session.id, path = %spec.path, error = %e, "initial breakpoint failed");
            }
        }

        // Launch mode: the debuggee only starts on `run`; a prompt will not
        // come back until it stops.
        if config.launch.bind == BindMode::Launch {
            session.bridge.send_direct("run").await?;
        }

        Ok(session)
    }

    /// Forward bridge events and keep the state machine in step with them.
    fn spawn_event_pump(self: Arc<Self>) {
        let session = self.clone();
        let mut events = self.bridge.subscribe_events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        {
                            let mut inner = session.inner.lock().await;
                            if inner.closed {
                                break;
                            }
                            let edge = match event.event.as_str() {
                                "stopped" => Some((SessionState::Debugging, "stopped event")),
                                "terminated" => Some((SessionState::Disconnected, "debuggee terminated")),
                                _ => None,
                            };
                            if let Some((to, cause)) = edge {
                                let _ = inner.state.transition(to, cause, &*session.policy);
                            }
                        }
                        let _ = session.events_tx.send(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn set_breakpoints(&self, arguments: Option<&Value>) -> Result<Response> {
        let path = arguments
            .and_then(|args| args.get("source"))
            .and_then(|source| source.get("path"))
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::Protocol("setBreakpoints requires source.path".to_string()))?
            .to_string();

        let lines: Vec<u64> = arguments
            .and_then(|args| args.get("breakpoints"))
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|bp| bp.get("line").and_then(Value::as_u64))
                    .collect()
            })
            .unwrap_or_default();

        let class_name = resolve_class_name(&self.parser, &path).await;

        // Clear what was previously installed for this file, then install
        // the new set.
        let previous = {
            let mut inner = self.inner.lock().await;
            inner.installed.remove(&path).unwrap_or_default()
        };
        for (class, line) in previous {
            if let Err(e) = self
                .bridge
                .execute(&format!("clear {class}:{line}"), self.timeouts.repl_command)
                .await
            {
                tracing::debug!(session = %self.id, error = %e, "clearing old breakpoint failed");
            }
        }

        let mut installed = Vec::new();
        let mut results = Vec::new();
        for line in lines {
            let output = self
                .bridge
                .execute(&format!("stop at {class_name}:{line}"), self.timeouts.repl_command)
                .await
                .unwrap_or_default();
            let verified = self.parser.parse_breakpoint_set(&output);
            if verified {
                installed.push((class_name.clone(), line));
            }
            results.push(json!({ "verified": verified, "line": line }));
        }

        self.inner.lock().await.installed.insert(path, installed);
        Ok(ok_response("setBreakpoints", json!({ "breakpoints": results })))
    }

    async fn stack_trace(&self) -> Result<Response> {
        let output = self.bridge.execute("where", self.timeouts.repl_command).await?;
        let frames: Vec<Value> = self
            .parser
            .parse_stack_trace(&output)
            .into_iter()
            .map(|frame| {
                json!({
                    "id": frame.id,
                    "name": format!("{}.{}", frame.class_name, frame.method_name),
                    "line": frame.line,
                    "column": 0,
                    "source": { "name": frame.file, "path": frame.file },
                })
            })
            .collect();
        Ok(ok_response(
            "stackTrace",
            json!({ "totalFrames": frames.len(), "stackFrames": frames }),
        ))
    }

    async fn threads(&self) -> Result<Response> {
        let output = self.bridge.execute("threads", self.timeouts.repl_command).await?;
        let mut threads: Vec<Value> = self
            .parser
            .parse_threads(&output)
            .into_iter()
            .map(|thread| json!({ "id": thread.id, "name": thread.name }))
            .collect();
        if threads.is_empty() {
            // The REPL sometimes answers before the listing is available;
            // DAP clients need at least the main thread.
            threads.push(json!({ "id": 1, "name": "main" }));
        }
        Ok(ok_response("threads", json!({ "threads": threads })))
    }

    async fn variables(&self, arguments: Option<&Value>) -> Result<Response> {
        let include_special = arguments
            .and_then(|args| args.get("includeSpecial"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let output = self.bridge.execute("locals", self.timeouts.repl_command).await?;
        let variables: Vec<Value> = self
            .parser
            .parse_locals(&output)
            .into_iter()
            .filter(|variable| self.policy.keep_variable(&variable.name, include_special))
            .map(|variable| {
                json!({
                    "name": variable.name,
                    "value": variable.value,
                    "type": variable.type_name,
                    "variablesReference": 0,
                })
            })
            .collect();
        Ok(ok_response("variables", json!({ "variables": variables })))
    }

    async fn evaluate(&self, arguments: Option<&Value>) -> Result<Response> {
        let expression = arguments
            .and_then(|args| args.get("expression"))
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::Protocol("evaluate requires an expression".to_string()))?;
        let output = self
            .bridge
            .execute(&format!("print {expression}"), self.timeouts.repl_command)
            .await?;
        let result = output
            .lines()
            .find_map(|line| line.split_once('=').map(|(_, value)| value.trim().to_string()))
            .unwrap_or_else(|| output.trim().to_string());
        Ok(ok_response(
            "evaluate",
            json!({ "result": result, "variablesReference": 0 }),
        ))
    }

    /// Resume-style commands never produce a prompt until the next stop;
    /// they are sent fire-and-forget.
    async fn resume_with(&self, command: &str, repl_command: &str) -> Result<Response> {
        self.bridge.send_direct(repl_command).await?;
        {
            let mut inner = self.inner.lock().await;
            if inner.state.current() == SessionState::Debugging {
                let _ = inner
                    .state
                    .transition(SessionState::Connected, "execution resumed", &*self.policy);
            }
        }
        if command == "continue" {
            let _ = self.events_tx.send(Event::new("continued", Some(json!({ "allThreadsContinued": true }))));
        }
        Ok(ok_response(command, json!({ "allThreadsContinued": true })))
    }
}

#[async_trait]
impl DebugSession for ReplDebugSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    async fn state(&self) -> SessionState {
        self.inner.lock().await.state.current()
    }

    async fn submit_command(&self, command: &str, arguments: Option<Value>) -> Result<Response> {
        if self.inner.lock().await.closed {
            return Err(BridgeError::SessionClosed);
        }

        match command {
            "setBreakpoints" => self.set_breakpoints(arguments.as_ref()).await,
            "stackTrace" => self.stack_trace().await,
            "threads" => self.threads().await,
            "variables" => self.variables(arguments.as_ref()).await,
            "evaluate" => self.evaluate(arguments.as_ref()).await,
            "scopes" => Ok(ok_response(
                "scopes",
                json!({ "scopes": [{
                    "name": self.policy.local_scope_names()[0],
                    "variablesReference": LOCALS_REFERENCE,
                    "expensive": false,
                }] }),
            )),
            "continue" => self.resume_with("continue", "resume").await,
            "next" => self.resume_with("next", "next").await,
            "stepIn" => self.resume_with("stepIn", "step").await,
            "stepOut" => self.resume_with("stepOut", "step up").await,
            "pause" => {
                self.bridge.execute("suspend", self.timeouts.repl_command).await?;
                Ok(ok_response("pause", Value::Null))
            }
            // The REPL has no handshake; these exist so generic controllers
            // can drive every backend identically.
            "initialize" | "configurationDone" | "setExceptionBreakpoints" | "launch" | "attach" => {
                Ok(ok_response(command, Value::Null))
            }
            "disconnect" => {
                self.close().await;
                Ok(ok_response("disconnect", Value::Null))
            }
            other => Err(BridgeError::command_failed(
                other,
                "command is not supported by the REPL bridge",
            )),
        }
    }

    fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.events_tx.subscribe()
    }

    fn subscribe_transitions(&self) -> broadcast::Receiver<Transition> {
        self.transitions_tx.subscribe()
    }

    async fn close(&self) {
        {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.state.force(SessionState::Uninitialized, "session disposed");
        }
        self.bridge.shutdown(self.timeouts.graceful_exit).await;
    }
}

fn ok_response(command: &str, body: Value) -> Response {
    Response {
        seq: 0,
        request_seq: 0,
        command: command.to_string(),
        success: true,
        message: None,
        body: if body.is_null() { None } else { Some(body) },
    }
}

/// Resolve a source file to the REPL debugger's class naming by reading its
/// package declaration. Advisory: any failure falls back to the bare
/// file-derived name.
pub(crate) async fn resolve_class_name(parser: &ReplOutputParser, path: &str) -> String {
    let base = Path::new(path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());

    match tokio::fs::read_to_string(path).await {
        Ok(source) => match parser.parse_package_declaration(&source) {
            Some(package) => format!("{package}.{base}"),
            None => base,
        },
        Err(e) => {
            tracing::debug!(path, error = %e, "could not read source for class resolution");
            base
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AdapterCommand, ConnectMode, LaunchSpec};
    use crate::policy::JavaPolicy;
    use std::io::Write;

    #[tokio::test]
    async fn test_class_resolution_uses_package_declaration() {
        let parser = ReplOutputParser::new();
        let mut file = tempfile::Builder::new()
            .suffix(".java")
            .tempfile()
            .expect("tempfile");
        writeln!(file, "package com.example.app;\n\npublic class Main {{}}").expect("write");
        let path = file.path().to_string_lossy().into_owned();
        let stem = Path::new(&path)
            .file_stem()
            .unwrap()
            .to_string_lossy()
            .into_owned();

        let resolved = resolve_class_name(&parser, &path).await;
        assert_eq!(resolved, format!("com.example.app.{stem}"));
    }

    #[tokio::test]
    async fn test_class_resolution_falls_back_to_file_name() {
        let parser = ReplOutputParser::new();
        let resolved = resolve_class_name(&parser, "/nope/Missing.java").await;
        assert_eq!(resolved, "Missing");
    }

    /// A fake jdb: prints a startup banner, then echoes each command line
    /// followed by a prompt.
    #[cfg(unix)]
    fn fake_jdb() -> AdapterCommand {
        AdapterCommand::new(
            "sh",
            vec![
                "-c".to_string(),
                r#"echo "VM Started:"; echo "> "; while IFS= read -r line; do echo "$line"; echo "main[1] "; done"#
                    .to_string(),
            ],
        )
    }

    #[cfg(unix)]
    async fn fake_session() -> Arc<ReplDebugSession> {
        let config = SessionConfig::new(
            fake_jdb(),
            ConnectMode::Stdio,
            LaunchSpec::attach(json!({ "hostName": "localhost", "port": 5005 })),
        );
        ReplDebugSession::create("repl-test".to_string(), Arc::new(JavaPolicy), config)
            .await
            .expect("session starts")
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_session_reaches_connected_and_lists_default_thread() {
        let session = fake_session().await;
        assert_eq!(session.state().await, SessionState::Connected);

        let response = session
            .submit_command("threads", None)
            .await
            .expect("threads succeeds");
        let threads = response.body.unwrap()["threads"].clone();
        assert_eq!(threads[0]["id"], 1);
        assert_eq!(threads[0]["name"], "main");

        session.close().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unverified_breakpoint_when_repl_does_not_confirm() {
        let session = fake_session().await;

        let response = session
            .submit_command(
                "setBreakpoints",
                Some(json!({
                    "source": { "path": "/nope/Main.java" },
                    "breakpoints": [{ "line": 7 }],
                })),
            )
            .await
            .expect("setBreakpoints succeeds");
        let breakpoints = response.body.unwrap()["breakpoints"].clone();
        assert_eq!(breakpoints[0]["verified"], false);
        assert_eq!(breakpoints[0]["line"], 7);

        session.close().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unsupported_command_is_rejected() {
        let session = fake_session().await;
        let err = session
            .submit_command("readMemory", None)
            .await
            .expect_err("not supported");
        assert!(matches!(err, BridgeError::CommandFailed { .. }));
        session.close().await;
    }
}
