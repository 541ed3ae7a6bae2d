//! Policy for the JavaScript backend (js-debug / pwa-node).
//!
//! js-debug is the multi-session backend: after `configurationDone` the
//! parent sends a reverse `startDebugging` request and the real debuggee is
//! bound by a child session attaching with the pending-target identifier.
//! Until the handshake completes, commands queue and are flushed in a fixed
//! category order.

use std::time::Duration;

use serde_json::{json, Value};

use crate::config::BindMode;
use crate::policy::{
    AdapterPolicy, AdapterState, ChildSessionStrategy, ChildStart, ClientBehavior,
    CommandHandling, InitializationBehavior, PendingCommand, ReverseRequestDisposition,
    StackFrame,
};
use crate::protocol::Request;
use crate::Result;

/// Execution-state commands that must reach the child once one is adopted.
const CHILD_ROUTED: &[&str] = &[
    "threads",
    "stackTrace",
    "scopes",
    "variables",
    "continue",
    "next",
    "stepIn",
    "stepOut",
    "pause",
    "evaluate",
    "setVariable",
];

pub struct JsDebugPolicy;

/// Flush-order category; lower flushes first, FIFO within a category.
fn category(command: &str) -> u8 {
    match command {
        "setBreakpoints" | "setExceptionBreakpoints" | "setFunctionBreakpoints" => 0,
        "configurationDone" => 1,
        "launch" | "attach" => 2,
        _ => 3,
    }
}

impl AdapterPolicy for JsDebugPolicy {
    fn name(&self) -> &'static str {
        "javascript"
    }

    fn matches_adapter(&self, command: &str, args: &[String]) -> bool {
        let command = command.to_lowercase();
        let args = args.join(" ").to_lowercase();
        command.contains("node") && (args.contains("js-debug") || args.contains("dapdebugserver"))
    }

    fn should_queue_command(&self, command: &str, state: &AdapterState) -> CommandHandling {
        if command == "initialize" {
            return CommandHandling::send("initialize opens the handshake");
        }
        if !state.initialize_responded {
            return CommandHandling::queue("waiting for initialize response");
        }
        if !(state.initialized && state.configuration_done) {
            return CommandHandling::queue("waiting for configuration to complete");
        }
        CommandHandling::send("session is configured")
    }

    fn process_queued_commands(&self, mut queue: Vec<PendingCommand>) -> Vec<PendingCommand> {
        // Stable sort: category order between groups, FIFO inside them.
        queue.sort_by_key(|pending| category(&pending.command));
        queue
    }

    fn is_connected(&self, state: &AdapterState) -> bool {
        state.initialize_responded && state.initialized
    }

    fn initialization_behavior(&self) -> InitializationBehavior {
        InitializationBehavior {
            defer_config_done: true,
            default_stop_on_entry: true,
            extra_capabilities: Some(json!({ "supportsStartDebuggingRequest": true })),
            ..InitializationBehavior::default()
        }
    }

    fn client_behavior(&self) -> ClientBehavior {
        ClientBehavior {
            child_routed_commands: CHILD_ROUTED,
            mirror_breakpoints_to_child: true,
            pause_after_child_attach: true,
            suppress_post_attach_config_done: false,
            child_init_timeout: Some(Duration::from_secs(12)),
        }
    }

    fn supports_reverse_start_debugging(&self) -> bool {
        true
    }

    fn child_session_strategy(&self) -> ChildSessionStrategy {
        ChildSessionStrategy::LaunchWithPendingTarget
    }

    fn build_child_start_args(&self, pending_id: &str, parent_config: &Value) -> Result<ChildStart> {
        let adapter_type = parent_config
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("pwa-node");
        Ok(ChildStart {
            bind: BindMode::Attach,
            args: json!({
                "type": adapter_type,
                "request": "attach",
                "__pendingTargetId": pending_id,
                "continueOnAttach": true,
            }),
        })
    }

    fn reverse_request_disposition(&self, request: &Request) -> ReverseRequestDisposition {
        match request.command.as_str() {
            "startDebugging" => {
                let pending_id = request
                    .arguments
                    .as_ref()
                    .and_then(|args| args.get("configuration"))
                    .and_then(|config| config.get("__pendingTargetId"))
                    .and_then(Value::as_str);
                match pending_id {
                    Some(id) => ReverseRequestDisposition::StartChild {
                        pending_id: id.to_string(),
                    },
                    // No target id: nothing to adopt, but the backend still
                    // blocks on an answer.
                    None => ReverseRequestDisposition::Acknowledge,
                }
            }
            "runInTerminal" => ReverseRequestDisposition::Acknowledge,
            _ => ReverseRequestDisposition::Unhandled,
        }
    }

    fn local_scope_names(&self) -> &'static [&'static str] {
        &["Local", "Locals"]
    }

    fn keep_variable(&self, name: &str, include_special: bool) -> bool {
        include_special || !(name == "this" || name == "__proto__")
    }

    fn is_internal_frame(&self, frame: &StackFrame) -> bool {
        frame
            .source_path
            .as_deref()
            .unwrap_or("")
            .starts_with("<node_internals>")
    }

    /// Unlike other backends, keep the top frame when everything is
    /// internal; an empty stack reads as a protocol failure upstream.
    fn filter_stack_frames(&self, frames: Vec<StackFrame>, include_internals: bool) -> Vec<StackFrame> {
        if include_internals {
            return frames;
        }
        let filtered: Vec<StackFrame> = frames
            .iter()
            .filter(|frame| !self.is_internal_frame(frame))
            .cloned()
            .collect();
        if filtered.is_empty() {
            frames.into_iter().take(1).collect()
        } else {
            filtered
        }
    }
}
