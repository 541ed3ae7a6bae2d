//! Sans-IO framing for the `Content-Length: N\r\n\r\n<json>` wire format.
//!
//! The decoder owns a byte buffer; callers feed it raw reads from any
//! transport (TCP socket or child stdio) and drain complete messages.
//! Partial frames stay buffered untouched until more bytes arrive.

use serde_json::Value;

use crate::protocol::message::ProtocolMessage;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Serialize a message with its length-prefixed header.
pub fn encode_frame(message: &ProtocolMessage) -> Result<Vec<u8>, serde_json::Error> {
    let body = serde_json::to_vec(message)?;
    let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Serialize an arbitrary JSON payload with a framing header. Used where the
/// payload is built dynamically (reverse-request acks).
pub fn encode_raw_frame(payload: &Value) -> Result<Vec<u8>, serde_json::Error> {
    let body = serde_json::to_vec(payload)?;
    let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// One outcome per extracted frame. A malformed frame is consumed and
/// reported; the frames behind it are unaffected.
#[derive(Debug)]
pub enum DecodedFrame {
    Message(ProtocolMessage),
    /// The frame was consumed but could not be parsed (bad header or bad
    /// JSON). Carries a description for the error channel.
    Invalid(String),
}

#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and drain every complete frame. Never panics; parse
    /// failures surface as [`DecodedFrame::Invalid`] entries.
    pub fn feed(&mut self, data: &[u8]) -> Vec<DecodedFrame> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            let Some(header_end) = find_subsequence(&self.buffer, HEADER_TERMINATOR) else {
                break;
            };

            let header = String::from_utf8_lossy(&self.buffer[..header_end]).into_owned();
            let body_start = header_end + HEADER_TERMINATOR.len();

            let content_length = match parse_content_length(&header) {
                Some(length) => length,
                None => {
                    // Skip the malformed header so later frames still parse.
                    self.buffer.drain(..body_start);
                    frames.push(DecodedFrame::Invalid(format!(
                        "missing or invalid Content-Length in header: {header:?}"
                    )));
                    continue;
                }
            };

            if self.buffer.len() < body_start + content_length {
                // Incomplete body; wait for more bytes.
                break;
            }

            // Consume the frame before parsing so a bad payload is never
            // parsed twice.
            let body: Vec<u8> = self
                .buffer
                .drain(..body_start + content_length)
                .skip(body_start)
                .collect();

            match serde_json::from_slice::<ProtocolMessage>(&body) {
                Ok(message) => frames.push(DecodedFrame::Message(message)),
                Err(e) => frames.push(DecodedFrame::Invalid(format!(
                    "invalid DAP JSON payload: {e}"
                ))),
            }
        }

        frames
    }

    /// Bytes currently held back waiting for a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Parse `Content-Length` out of a header block, tolerating additional
/// `Name: value` lines in any order and any header-name casing.
fn parse_content_length(header: &str) -> Option<usize> {
    for line in header.split("\r\n") {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            return value.trim().parse::<usize>().ok();
        }
    }
    None
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
