//! Policy for the JVM backend, a jdb process behind the REPL bridge. The
//! bridge already serializes commands, so nothing queues at this level.

use crate::policy::AdapterPolicy;

pub struct JavaPolicy;

impl AdapterPolicy for JavaPolicy {
    fn name(&self) -> &'static str {
        "java"
    }

    fn matches_adapter(&self, command: &str, args: &[String]) -> bool {
        let command = command.to_lowercase();
        let args = args.join(" ").to_lowercase();
        command.contains("jdb") || args.contains("jdb")
    }

    fn uses_repl_bridge(&self) -> bool {
        true
    }

    fn local_scope_names(&self) -> &'static [&'static str] {
        &["Local", "Locals"]
    }

    fn keep_variable(&self, name: &str, include_special: bool) -> bool {
        include_special || name != "this"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::CommandHandling;

    #[test]
    fn test_no_command_queueing() {
        let policy = JavaPolicy;
        let state = policy.create_initial_state();
        assert_eq!(
            policy.should_queue_command("setBreakpoints", &state),
            CommandHandling::send("adapter does not queue commands")
        );
    }

    #[test]
    fn test_this_is_a_special_variable() {
        let policy = JavaPolicy;
        assert!(!policy.keep_variable("this", false));
        assert!(policy.keep_variable("this", true));
        assert!(policy.keep_variable("counter", false));
    }

    #[test]
    fn test_matches_jdb() {
        let policy = JavaPolicy;
        assert!(policy.matches_adapter("jdb", &["-attach".into(), "localhost:5005".into()]));
        assert!(policy.matches_adapter("/usr/lib/jvm/bin/jdb", &[]));
        assert!(!policy.matches_adapter("java", &["-jar".into(), "app.jar".into()]));
    }
}
