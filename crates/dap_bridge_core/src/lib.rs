//! dap-bridge core
//!
//! A session engine that drives heterogeneous language debuggers through
//! one uniform DAP-like request/response/event protocol. Backend quirks
//! (reversed handshakes, multi-session adoption, REPL transcripts, command
//! queueing) live in pluggable adapter policies; the engine itself stays
//! generic.

pub mod client;
pub mod config;
pub mod error;
pub mod policy;
pub mod protocol;
pub mod repl;
pub mod session;

// Re-export commonly used types
pub use client::DapClient;
pub use config::{AdapterCommand, BindMode, ConnectMode, LaunchSpec, SessionConfig, SessionTimeouts};
pub use error::BridgeError;
pub use policy::{select_policy, AdapterPolicy};
pub use protocol::{Event, ProtocolMessage, Request, Response};
pub use session::registry::{SessionRegistry, SessionSummary};
pub use session::state::{SessionState, Transition};
pub use session::{BreakpointSpec, DebugSession};

/// Result type alias using BridgeError
pub type Result<T> = std::result::Result<T, BridgeError>;
