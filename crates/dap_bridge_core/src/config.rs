use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fully-resolved backend invocation. Executable discovery and version
/// checking happen upstream; the engine only spawns what it is given and
/// never consults ambient process state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl AdapterCommand {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: HashMap::new(),
        }
    }
}

/// How the engine reaches the spawned backend's DAP endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum ConnectMode {
    /// Framed DAP over the child process's stdin/stdout pipes.
    Stdio,
    /// Framed DAP over a TCP socket the backend listens on. Multi-session
    /// backends accept several logical sessions on the same port.
    Tcp { host: String, port: u16 },
}

/// Whether the handshake binds to the debuggee with `launch` or `attach`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindMode {
    Launch,
    Attach,
}

impl BindMode {
    pub fn dap_command(self) -> &'static str {
        match self {
            BindMode::Launch => "launch",
            BindMode::Attach => "attach",
        }
    }
}

/// The adapter-defined configuration payload sent with `launch`/`attach`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub bind: BindMode,
    /// Opaque launch/attach arguments, passed through to the backend.
    pub configuration: Value,
    /// `None` defers to the policy's default.
    #[serde(default)]
    pub stop_on_entry: Option<bool>,
}

impl LaunchSpec {
    pub fn launch(configuration: Value) -> Self {
        Self {
            bind: BindMode::Launch,
            configuration,
            stop_on_entry: None,
        }
    }

    pub fn attach(configuration: Value) -> Self {
        Self {
            bind: BindMode::Attach,
            configuration,
            stop_on_entry: None,
        }
    }
}

/// Bounds for every suspension point in a session's life.
#[derive(Debug, Clone)]
pub struct SessionTimeouts {
    pub initialize: Duration,
    pub launch: Duration,
    pub configuration_done: Duration,
    pub initialized_event: Duration,
    pub request: Duration,
    /// How long to keep retrying the first TCP connection while a freshly
    /// spawned backend brings its listener up.
    pub adapter_listen: Duration,
    pub child_initialized: Duration,
    pub child_attach: Duration,
    pub repl_command: Duration,
    pub repl_spawn: Duration,
    pub graceful_exit: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            initialize: Duration::from_secs(5),
            launch: Duration::from_secs(10),
            configuration_done: Duration::from_secs(5),
            initialized_event: Duration::from_secs(5),
            request: Duration::from_secs(30),
            adapter_listen: Duration::from_secs(10),
            child_initialized: Duration::from_secs(12),
            child_attach: Duration::from_secs(20),
            repl_command: Duration::from_secs(5),
            repl_spawn: Duration::from_secs(30),
            graceful_exit: Duration::from_secs(2),
        }
    }
}

/// Everything session creation needs, assembled by the caller.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub adapter: AdapterCommand,
    pub connect: ConnectMode,
    pub launch: LaunchSpec,
    /// Breakpoints requested before the session exists; replayed during the
    /// handshake, one `setBreakpoints` per source file.
    pub initial_breakpoints: Vec<crate::session::BreakpointSpec>,
    pub timeouts: SessionTimeouts,
}

impl SessionConfig {
    pub fn new(adapter: AdapterCommand, connect: ConnectMode, launch: LaunchSpec) -> Self {
        Self {
            adapter,
            connect,
            launch,
            initial_breakpoints: Vec::new(),
            timeouts: SessionTimeouts::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_timeouts() {
        let timeouts = SessionTimeouts::default();
        assert_eq!(timeouts.initialize, Duration::from_secs(5));
        assert_eq!(timeouts.child_initialized, Duration::from_secs(12));
        assert_eq!(timeouts.graceful_exit, Duration::from_secs(2));
    }

    #[test]
    fn test_bind_mode_dap_command() {
        assert_eq!(BindMode::Launch.dap_command(), "launch");
        assert_eq!(BindMode::Attach.dap_command(), "attach");
    }

    #[test]
    fn test_connect_mode_serde() {
        let mode: ConnectMode =
            serde_json::from_value(json!({ "mode": "tcp", "host": "127.0.0.1", "port": 4711 }))
                .expect("tcp mode should deserialize");
        assert_eq!(
            mode,
            ConnectMode::Tcp {
                host: "127.0.0.1".to_string(),
                port: 4711
            }
        );

        let mode: ConnectMode =
            serde_json::from_value(json!({ "mode": "stdio" })).expect("stdio mode should deserialize");
        assert_eq!(mode, ConnectMode::Stdio);
    }

    #[test]
    fn test_launch_spec_defaults_stop_on_entry_to_policy() {
        let spec = LaunchSpec::launch(json!({ "program": "main.py" }));
        assert_eq!(spec.bind, BindMode::Launch);
        assert!(spec.stop_on_entry.is_none());
    }
}
