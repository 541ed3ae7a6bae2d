pub mod bridge;
pub mod parser;
pub mod session;

pub use bridge::ReplBridge;
pub use parser::ReplOutputParser;
pub use session::ReplDebugSession;
