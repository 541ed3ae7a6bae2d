//! Per-backend adapter policies.
//!
//! The session engine is generic; everything backend-specific lives behind
//! [`AdapterPolicy`]. A policy is an immutable strategy value selected once
//! at session creation and shared by reference, never subclassed.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::config::BindMode;
use crate::error::BridgeError;
use crate::protocol::{Event, Request};
use crate::session::state::SessionState;
use crate::Result;

pub mod dotnet;
pub mod go;
pub mod java;
pub mod js;
pub mod mock;
pub mod python;

pub use dotnet::DotnetPolicy;
pub use go::GoPolicy;
pub use java::JavaPolicy;
pub use js::JsDebugPolicy;
pub use mock::MockPolicy;
pub use python::PythonPolicy;

/// Verdict for one submitted command: send now, hold in the queue, or hold
/// behind a prerequisite the engine must synthesize first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHandling {
    pub queue: bool,
    pub defer: bool,
    pub reason: &'static str,
}

impl CommandHandling {
    pub fn send(reason: &'static str) -> Self {
        Self {
            queue: false,
            defer: false,
            reason,
        }
    }

    pub fn queue(reason: &'static str) -> Self {
        Self {
            queue: true,
            defer: false,
            reason,
        }
    }

    pub fn defer(reason: &'static str) -> Self {
        Self {
            queue: false,
            defer: true,
            reason,
        }
    }
}

/// How (whether) a backend spawns child sessions via reverse
/// `startDebugging`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildSessionStrategy {
    None,
    /// Start the child with the pending-target identifier from the reverse
    /// request (js-debug style).
    LaunchWithPendingTarget,
    /// Attach the child straight to a known inspector port.
    AttachByPort,
}

/// The start request binding a child session to the real debuggee.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildStart {
    pub bind: BindMode,
    pub args: Value,
}

/// Policy-owned per-session bookkeeping. The engine stores and passes it
/// back but never interprets it.
#[derive(Debug, Clone, Default)]
pub struct AdapterState {
    pub initialize_responded: bool,
    pub initialized: bool,
    pub configuration_done: bool,
    pub launched: bool,
}

/// A submitted command held back by a gating condition. Plain data so queue
/// reordering stays a pure policy function.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCommand {
    pub request_id: u64,
    pub command: String,
    pub arguments: Option<Value>,
}

/// Handshake-shape flags, consulted once at session start.
#[derive(Debug, Clone, Default)]
pub struct InitializationBehavior {
    /// The backend will not emit `initialized` until after it has processed
    /// `attach`; waiting first would deadlock.
    pub send_attach_before_initialized: bool,
    /// Two-phase `initialized` handling: brief wait before `launch`, full
    /// wait after it (Delve may emit the event on either side).
    pub send_launch_before_config: bool,
    /// Hold the parent's `configurationDone` until a child session has been
    /// adopted and configured.
    pub defer_config_done: bool,
    /// Applied when the caller leaves `stop_on_entry` unset.
    pub default_stop_on_entry: bool,
    /// Extra client capabilities merged into the `initialize` arguments.
    pub extra_capabilities: Option<Value>,
}

/// Multi-session client behaviors, consulted by the adoption manager and
/// the command router.
#[derive(Debug, Clone, Default)]
pub struct ClientBehavior {
    /// Commands operating on live execution state that must go to the
    /// active child once one exists.
    pub child_routed_commands: &'static [&'static str],
    pub mirror_breakpoints_to_child: bool,
    pub pause_after_child_attach: bool,
    pub suppress_post_attach_config_done: bool,
    pub child_init_timeout: Option<Duration>,
}

impl ClientBehavior {
    pub fn routes_to_child(&self, command: &str) -> bool {
        self.child_routed_commands.contains(&command)
    }
}

/// Pure decision for one reverse request; the engine performs the IO.
#[derive(Debug, Clone, PartialEq)]
pub enum ReverseRequestDisposition {
    /// Answer with an empty success body.
    Acknowledge,
    /// Answer with success, then adopt a child session for this target.
    StartChild { pending_id: String },
    /// Policy declines; the engine's generic fallback acknowledges so the
    /// backend never hangs.
    Unhandled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionStrictness {
    /// Invalid transitions are fatal protocol errors.
    Strict,
    /// Invalid transitions are tolerated and logged (matches the looseness
    /// of most real backends).
    Permissive,
}

/// Minimal stack-frame shape used by per-backend frame filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct StackFrame {
    pub id: u64,
    pub name: String,
    pub source_path: Option<String>,
    pub line: u64,
}

impl StackFrame {
    pub fn from_body(frame: &Value) -> Option<Self> {
        Some(Self {
            id: frame.get("id")?.as_u64()?,
            name: frame
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            source_path: frame
                .get("source")
                .and_then(|source| source.get("path"))
                .and_then(Value::as_str)
                .map(str::to_string),
            line: frame.get("line").and_then(Value::as_u64).unwrap_or(0),
        })
    }
}

pub trait AdapterPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this policy was built for the given spawned command line.
    /// Diagnostics and tests only; selection normally goes by name.
    fn matches_adapter(&self, command: &str, args: &[String]) -> bool;

    fn create_initial_state(&self) -> AdapterState {
        AdapterState::default()
    }

    fn should_queue_command(&self, _command: &str, _state: &AdapterState) -> CommandHandling {
        CommandHandling::send("adapter does not queue commands")
    }

    /// Reorder the pending queue at flush time. Category order is policy
    /// business; FIFO within a category must be preserved.
    fn process_queued_commands(&self, queue: Vec<PendingCommand>) -> Vec<PendingCommand> {
        queue
    }

    fn update_state_on_command(&self, command: &str, _args: Option<&Value>, state: &mut AdapterState) {
        match command {
            "configurationDone" => state.configuration_done = true,
            "launch" | "attach" => state.launched = true,
            _ => {}
        }
    }

    fn update_state_on_response(&self, command: &str, success: bool, state: &mut AdapterState) {
        if command == "initialize" && success {
            state.initialize_responded = true;
        }
    }

    fn update_state_on_event(&self, event: &str, _body: Option<&Value>, state: &mut AdapterState) {
        if event == "initialized" {
            state.initialized = true;
        }
    }

    fn is_initialized(&self, state: &AdapterState) -> bool {
        state.initialized
    }

    fn is_connected(&self, state: &AdapterState) -> bool {
        state.initialized
    }

    fn initialization_behavior(&self) -> InitializationBehavior {
        InitializationBehavior::default()
    }

    /// Whether this backend is a line-oriented REPL debugger reached
    /// through the REPL bridge instead of a framed DAP connection.
    fn uses_repl_bridge(&self) -> bool {
        false
    }

    fn client_behavior(&self) -> ClientBehavior {
        ClientBehavior::default()
    }

    fn supports_reverse_start_debugging(&self) -> bool {
        false
    }

    fn child_session_strategy(&self) -> ChildSessionStrategy {
        ChildSessionStrategy::None
    }

    /// Asking a no-child policy for child start args is a programming
    /// error, not a recoverable condition.
    fn build_child_start_args(&self, _pending_id: &str, _parent_config: &Value) -> Result<ChildStart> {
        Err(BridgeError::ChildSessionsUnsupported(self.name()))
    }

    fn is_child_ready_event(&self, event: &Event) -> bool {
        event.event == "initialized"
    }

    fn reverse_request_disposition(&self, request: &Request) -> ReverseRequestDisposition {
        if request.command == "runInTerminal" {
            ReverseRequestDisposition::Acknowledge
        } else {
            ReverseRequestDisposition::Unhandled
        }
    }

    fn transition_strictness(&self) -> TransitionStrictness {
        TransitionStrictness::Permissive
    }

    fn valid_transition(&self, from: SessionState, to: SessionState) -> bool {
        default_valid_transition(from, to)
    }

    /// Safety invariant hook for `disconnect`. Returning `Some` overrides
    /// whatever `terminateDebuggee` the caller asked for.
    fn force_terminate_debuggee(&self, _attach_mode: bool) -> Option<bool> {
        None
    }

    /// Scope names holding local variables for this backend.
    fn local_scope_names(&self) -> &'static [&'static str] {
        &["Locals", "Local"]
    }

    /// Whether a variable survives the default (non-special) listing.
    fn keep_variable(&self, _name: &str, _include_special: bool) -> bool {
        true
    }

    fn is_internal_frame(&self, _frame: &StackFrame) -> bool {
        false
    }

    /// Drop internal frames. Policies may override with a fallback when
    /// every frame would be removed.
    fn filter_stack_frames(&self, frames: Vec<StackFrame>, include_internals: bool) -> Vec<StackFrame> {
        if include_internals {
            return frames;
        }
        frames
            .into_iter()
            .filter(|frame| !self.is_internal_frame(frame))
            .collect()
    }

    /// Additive hint for a backend error message (never replaces it).
    fn translate_error(&self, _command: &str, _message: &str) -> Option<String> {
        None
    }
}

/// Engine-side default transition table. `dispose` back to `Uninitialized`
/// and the jump to `Error` are always legal; the rest follows the normal
/// lifecycle, with `Debugging -> Debugging` allowed for consecutive stops.
pub fn default_valid_transition(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;
    if matches!(to, Uninitialized | Error | Disconnected) {
        return true;
    }
    matches!(
        (from, to),
        (Uninitialized, Initializing)
            | (Initializing, Ready)
            | (Ready, Connected)
            | (Connected, Debugging)
            | (Debugging, Connected)
            | (Debugging, Debugging)
            | (Disconnected, Initializing)
            | (Error, Initializing)
    )
}

/// Look a policy up by its backend name.
pub fn select_policy(name: &str) -> Result<Arc<dyn AdapterPolicy>> {
    match name {
        "python" => Ok(Arc::new(PythonPolicy)),
        "dotnet" => Ok(Arc::new(DotnetPolicy)),
        "go" => Ok(Arc::new(GoPolicy)),
        "java" => Ok(Arc::new(JavaPolicy)),
        "javascript" | "js-debug" => Ok(Arc::new(JsDebugPolicy)),
        "mock" => Ok(Arc::new(MockPolicy)),
        other => Err(BridgeError::Environment(format!(
            "no adapter policy registered for backend '{other}'"
        ))),
    }
}

/// Pick the policy whose `matches_adapter` recognizes a spawned command
/// line. Diagnostics only.
pub fn match_policy_for_command(command: &str, args: &[String]) -> Option<Arc<dyn AdapterPolicy>> {
    let policies: [Arc<dyn AdapterPolicy>; 6] = [
        Arc::new(PythonPolicy),
        Arc::new(DotnetPolicy),
        Arc::new(GoPolicy),
        Arc::new(JavaPolicy),
        Arc::new(JsDebugPolicy),
        Arc::new(MockPolicy),
    ];
    policies
        .into_iter()
        .find(|policy| policy.matches_adapter(command, args))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_policy_by_name() {
        assert_eq!(select_policy("python").expect("known").name(), "python");
        assert_eq!(select_policy("js-debug").expect("known").name(), "javascript");
        assert!(select_policy("cobol").is_err());
    }

    #[test]
    fn test_match_policy_for_command_line() {
        let policy = match_policy_for_command("python", &["-m".into(), "debugpy.adapter".into()])
            .expect("debugpy is recognized");
        assert_eq!(policy.name(), "python");

        let policy = match_policy_for_command("dlv", &["dap".into(), "--listen".into()])
            .expect("delve is recognized");
        assert_eq!(policy.name(), "go");

        assert!(match_policy_for_command("vim", &[]).is_none());
    }

    #[test]
    fn test_default_transition_table() {
        use SessionState::*;
        assert!(default_valid_transition(Uninitialized, Initializing));
        assert!(default_valid_transition(Connected, Debugging));
        assert!(default_valid_transition(Debugging, Connected));
        assert!(default_valid_transition(Debugging, Uninitialized));
        assert!(default_valid_transition(Ready, Error));
        assert!(!default_valid_transition(Uninitialized, Debugging));
        assert!(!default_valid_transition(Ready, Debugging));
    }

    #[test]
    fn test_child_start_args_are_a_programming_error_without_children() {
        let err = PythonPolicy
            .build_child_start_args("pending-1", &serde_json::json!({}))
            .expect_err("python has no child sessions");
        assert!(matches!(err, BridgeError::ChildSessionsUnsupported("python")));
    }

    #[test]
    fn test_stack_frame_from_body() {
        let frame = StackFrame::from_body(&serde_json::json!({
            "id": 2,
            "name": "main",
            "line": 14,
            "source": { "path": "/work/app.go" }
        }))
        .expect("parses");
        assert_eq!(frame.source_path.as_deref(), Some("/work/app.go"));
        assert!(StackFrame::from_body(&serde_json::json!({ "name": "no id" })).is_none());
    }
}
