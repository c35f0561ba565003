//! Protocol errors

use serde_json::Value;
use thiserror::Error;

/// A single path whose device-reported value did not match the intended one.
#[derive(Debug, Clone, PartialEq)]
pub struct Mismatch {
    /// Configuration path, e.g. `app/brightness`
    pub path: String,
    /// Value the host intended to write
    pub expected: Value,
    /// Value the device reported, or `None` if the path was missing entirely
    pub actual: Option<Value>,
}

impl std::fmt::Display for Mismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.actual {
            Some(actual) => write!(f, "{}: expected {}, got {}", self.path, self.expected, actual),
            None => write!(f, "{}: expected {}, missing from response", self.path, self.expected),
        }
    }
}

/// Errors that can occur during protocol communication
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("framing error: invalid escape sequence 0xDB 0x{0:02X}")]
    InvalidEscape(u8),

    #[error("framing error: frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    #[error("reassembly buffer for channel 0x{channel:02X} exceeds {limit} bytes")]
    ReassemblyOverflow { channel: u8, limit: usize },

    #[error("malformed payload on channel 0x{channel:02X}: {source}")]
    MalformedPayload {
        channel: u8,
        #[source]
        source: serde_json::Error,
    },

    #[error("timed out waiting for a response on channel 0x{channel:02X}")]
    Timeout { channel: u8 },

    #[error("not connected to a device")]
    NotConnected,

    #[error("device did not come back after restart")]
    ReconnectTimeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid {what} length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid key slot {0}: device has key slots 0, 1 and 2")]
    InvalidKeySlot(u8),

    #[error("precondition failed: {0}")]
    Precondition(&'static str),

    #[error("verification failed on {} path(s): {}", .0.len(), summarize(.0))]
    VerificationFailed(Vec<Mismatch>),

    #[error("device rejected signed write, {} path(s) did not apply: {}", .0.len(), summarize(.0))]
    DeviceRejected(Vec<Mismatch>),

    #[error("invalid response from device: {0}")]
    InvalidResponse(String),

    #[error("signing failed: {0}")]
    Seal(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn summarize(mismatches: &[Mismatch]) -> String {
    mismatches
        .iter()
        .map(Mismatch::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
