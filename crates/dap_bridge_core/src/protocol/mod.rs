pub mod framing;
pub mod message;

pub use framing::{encode_frame, encode_raw_frame, DecodedFrame, FrameDecoder};
pub use message::{Event, ProtocolMessage, Request, Response};
