//! Policy for the Go backend (Delve in DAP mode).

use crate::policy::{AdapterPolicy, InitializationBehavior, StackFrame};

pub struct GoPolicy;

impl AdapterPolicy for GoPolicy {
    fn name(&self) -> &'static str {
        "go"
    }

    fn matches_adapter(&self, command: &str, args: &[String]) -> bool {
        let command = command.to_lowercase();
        let args = args.join(" ").to_lowercase();
        command == "dlv"
            || command.ends_with("/dlv")
            || args.contains("dlv dap")
            || args.contains("delve")
    }

    fn initialization_behavior(&self) -> InitializationBehavior {
        InitializationBehavior {
            // Delve may emit `initialized` immediately after `initialize` or
            // only after `launch`; the engine waits briefly on each side.
            send_launch_before_config: true,
            // Delve answers "unknown goroutine 1" to stack traces taken
            // right after stop-on-entry; run to the first breakpoint instead.
            default_stop_on_entry: false,
            ..InitializationBehavior::default()
        }
    }

    fn local_scope_names(&self) -> &'static [&'static str] {
        &["Locals", "Arguments"]
    }

    fn keep_variable(&self, name: &str, include_special: bool) -> bool {
        include_special || !(name.starts_with('_') && name != "_")
    }

    fn is_internal_frame(&self, frame: &StackFrame) -> bool {
        let path = frame.source_path.as_deref().unwrap_or("");
        path.contains("/runtime/") || path.contains("/testing/")
    }
}
