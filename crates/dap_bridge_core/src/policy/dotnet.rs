//! Policy for the .NET backend (vsdbg).
//!
//! vsdbg deviates from the textbook handshake in two ways that matter here:
//! it emits `initialized` only AFTER it has processed `attach`, so the
//! engine must send `attach` without waiting for the event (waiting is a
//! deadlock), and it must never terminate a live debuggee when an
//! attach-mode session disconnects, regardless of what the caller asked.

use crate::policy::{AdapterPolicy, InitializationBehavior, StackFrame, TransitionStrictness};

pub struct DotnetPolicy;

impl AdapterPolicy for DotnetPolicy {
    fn name(&self) -> &'static str {
        "dotnet"
    }

    fn matches_adapter(&self, command: &str, args: &[String]) -> bool {
        let command = command.to_lowercase();
        let args = args.join(" ").to_lowercase();
        command.contains("vsdbg")
            || command.contains("netcoredbg")
            || args.contains("vsdbg")
            || args.contains("netcoredbg")
            || args.contains("dotnet")
    }

    fn initialization_behavior(&self) -> InitializationBehavior {
        InitializationBehavior {
            send_attach_before_initialized: true,
            ..InitializationBehavior::default()
        }
    }

    fn transition_strictness(&self) -> TransitionStrictness {
        TransitionStrictness::Strict
    }

    fn force_terminate_debuggee(&self, attach_mode: bool) -> Option<bool> {
        attach_mode.then_some(false)
    }

    fn local_scope_names(&self) -> &'static [&'static str] {
        &["Locals"]
    }

    /// Hide C#/VB compiler-generated names (display classes, async state
    /// machines, closure captures) unless specials were requested.
    fn keep_variable(&self, name: &str, include_special: bool) -> bool {
        if include_special {
            return true;
        }
        !(name.starts_with("<>")
            || name.starts_with("CS$<>")
            || name.starts_with("$VB$"))
    }

    fn is_internal_frame(&self, frame: &StackFrame) -> bool {
        frame.source_path.as_deref().unwrap_or("").is_empty()
            || frame.name.starts_with("System.")
            || frame.name.starts_with("Microsoft.")
    }

    fn translate_error(&self, command: &str, message: &str) -> Option<String> {
        let lower = message.to_lowercase();
        if command == "attach"
            && (lower.contains("eperm")
                || lower.contains("ptrace")
                || lower.contains("operation not permitted"))
        {
            return Some(
                "attach was denied by the kernel; check ptrace scope or container privileges"
                    .to_string(),
            );
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reversed_handshake_flag() {
        assert!(DotnetPolicy.initialization_behavior().send_attach_before_initialized);
    }

    #[test]
    fn test_never_terminates_attached_debuggee() {
        assert_eq!(DotnetPolicy.force_terminate_debuggee(true), Some(false));
        assert_eq!(DotnetPolicy.force_terminate_debuggee(false), None);
    }

    #[test]
    fn test_compiler_generated_variables_are_hidden() {
        let policy = DotnetPolicy;
        assert!(!policy.keep_variable("<>c__DisplayClass0_0", false));
        assert!(!policy.keep_variable("CS$<>8__locals1", false));
        assert!(!policy.keep_variable("$VB$Local_x", false));
        assert!(!policy.keep_variable("<>t__builder", false));
        assert!(policy.keep_variable("customer", false));
        assert!(policy.keep_variable("<>t__builder", true));
    }

    #[test]
    fn test_runtime_frames_are_internal() {
        let policy = DotnetPolicy;
        let internal = StackFrame {
            id: 1,
            name: "System.Threading.Tasks.Task.Wait".to_string(),
            source_path: None,
            line: 0,
        };
        let user = StackFrame {
            id: 2,
            name: "App.Program.Main".to_string(),
            source_path: Some("/src/Program.cs".to_string()),
            line: 12,
        };
        assert!(policy.is_internal_frame(&internal));
        assert!(!policy.is_internal_frame(&user));

        let frames = policy.filter_stack_frames(vec![internal, user.clone()], false);
        assert_eq!(frames, vec![user]);
    }

    #[test]
    fn test_attach_eperm_hint_is_additive() {
        let policy = DotnetPolicy;
        let hint = policy
            .translate_error("attach", "ptrace: Operation not permitted (EPERM)")
            .expect("should hint");
        assert!(hint.contains("ptrace scope"));
        assert!(policy.translate_error("evaluate", "EPERM").is_none());
    }

    #[test]
    fn test_matches_vsdbg_and_netcoredbg() {
        let policy = DotnetPolicy;
        assert!(policy.matches_adapter("/opt/vsdbg/vsdbg", &[]));
        assert!(policy.matches_adapter("netcoredbg", &["--interpreter=vscode".into()]));
        assert!(!policy.matches_adapter("python", &["-m".into(), "debugpy.adapter".into()]));
    }
}
