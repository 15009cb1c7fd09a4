//! Text frame codec
//!
//! The peripheral speaks plain ASCII lines. Inbound buffers are interpreted
//! as UTF-8 text; anything that is not valid text degrades to a diagnostic
//! hex dump instead of an error:
//! ```text
//! [ 0x48 0x69 ]      -> Text("Hi")
//! [ 0xFF 0x00 0x41 ] -> Diagnostic("FF 00 41")
//! ```
//!
//! Outbound text is sent as its raw bytes. The codec adds no length prefix
//! and no terminator; callers append `\n` where the firmware expects one.

use bytes::Bytes;
use std::fmt;

/// A decoded inbound buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedMessage {
    /// Valid UTF-8 text
    Text(String),
    /// Space-separated uppercase hex dump of a non-text buffer
    Diagnostic(String),
}

impl DecodedMessage {
    /// The text payload, if this is a text message
    pub fn as_text(&self) -> Option<&str> {
        match self {
            DecodedMessage::Text(text) => Some(text),
            DecodedMessage::Diagnostic(_) => None,
        }
    }
}

impl fmt::Display for DecodedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodedMessage::Text(text) => write!(f, "Received: {}", text),
            DecodedMessage::Diagnostic(hex) => write!(f, "Received (HEX): {}", hex),
        }
    }
}

/// Decode a raw buffer. Never fails.
pub fn decode(bytes: &[u8]) -> DecodedMessage {
    match std::str::from_utf8(bytes) {
        Ok(text) => DecodedMessage::Text(text.to_owned()),
        Err(_) => DecodedMessage::Diagnostic(hex_dump(bytes)),
    }
}

/// Encode text into the bytes written to the transport
pub fn encode(text: &str) -> Bytes {
    Bytes::copy_from_slice(text.as_bytes())
}

/// Two-digit uppercase hex, one space between bytes
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{:02X}", byte));
    }
    out
}
