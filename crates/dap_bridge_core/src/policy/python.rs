//! Policy for the Python backend (debugpy).

use crate::policy::AdapterPolicy;

pub struct PythonPolicy;

impl AdapterPolicy for PythonPolicy {
    fn name(&self) -> &'static str {
        "python"
    }

    fn matches_adapter(&self, command: &str, args: &[String]) -> bool {
        let command = command.to_lowercase();
        let args = args.join(" ").to_lowercase();
        command.contains("python") && args.contains("debugpy") || args.contains("debugpy.adapter")
    }

    fn local_scope_names(&self) -> &'static [&'static str] {
        &["Locals"]
    }

    /// debugpy surfaces grouping pseudo-variables and internals; hide them
    /// unless the caller asked for specials.
    fn keep_variable(&self, name: &str, include_special: bool) -> bool {
        if include_special {
            return true;
        }
        if name == "special variables" || name == "function variables" {
            return false;
        }
        if name.starts_with("__") && name.ends_with("__") {
            return matches!(name, "__name__" | "__file__" | "__doc__");
        }
        !(name.starts_with("_pydev") || name == "_")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{AdapterState, CommandHandling};

    #[test]
    fn test_no_command_queueing() {
        let policy = PythonPolicy;
        let state = policy.create_initial_state();
        assert_eq!(
            policy.should_queue_command("launch", &state),
            CommandHandling::send("adapter does not queue commands")
        );
    }

    #[test]
    fn test_variable_filtering_keeps_common_dunders() {
        let policy = PythonPolicy;
        assert!(policy.keep_variable("value", false));
        assert!(policy.keep_variable("__name__", false));
        assert!(policy.keep_variable("__file__", false));
        assert!(!policy.keep_variable("__loader__", false));
        assert!(!policy.keep_variable("special variables", false));
        assert!(!policy.keep_variable("_pydev_stop", false));
        assert!(policy.keep_variable("__loader__", true));
    }

    #[test]
    fn test_state_tracking_follows_handshake() {
        let policy = PythonPolicy;
        let mut state = AdapterState::default();
        assert!(!policy.is_initialized(&state));

        policy.update_state_on_response("initialize", true, &mut state);
        policy.update_state_on_event("initialized", None, &mut state);
        policy.update_state_on_command("configurationDone", None, &mut state);

        assert!(state.initialize_responded);
        assert!(policy.is_initialized(&state));
        assert!(policy.is_connected(&state));
        assert!(state.configuration_done);
    }

    #[test]
    fn test_matches_debugpy_command_lines() {
        let policy = PythonPolicy;
        assert!(policy.matches_adapter("python", &["-m".into(), "debugpy.adapter".into()]));
        assert!(!policy.matches_adapter("dlv", &["dap".into()]));
    }
}
