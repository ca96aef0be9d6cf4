use serde::{Deserialize, Serialize};

/// Bounded description of a handler failure, stored as a result payload.
/// Stacks are never persisted (spec §7) — only a type name and message,
/// each capped so a misbehaving handler can't bloat the results table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorDescriptor {
    pub type_name: String,
    pub message: String,
}

const MAX_TYPE_NAME_LEN: usize = 256;
const MAX_MESSAGE_LEN: usize = 4096;

impl ErrorDescriptor {
    #[must_use]
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: truncate(type_name.into(), MAX_TYPE_NAME_LEN),
            message: truncate(message.into(), MAX_MESSAGE_LEN),
        }
    }

    #[must_use]
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    #[must_use]
    pub fn from_json(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

fn truncate(mut s: String, max: usize) -> String {
    if s.len() > max {
        s.truncate(max);
    }
    s
}

/// Failures from `Handler::encode_data`/`encode_result`/`decode_result`.
/// Per spec §7, a codec error during encoding is handled by the caller
/// as an ordinary handler-exception (retry path); this type exists so
/// handler implementations have something concrete to return.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode value: {0}")]
    Encode(String),
    #[error("failed to decode value: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_oversized_fields() {
        let descriptor = ErrorDescriptor::new("x".repeat(300), "y".repeat(5000));
        assert_eq!(descriptor.type_name.len(), MAX_TYPE_NAME_LEN);
        assert_eq!(descriptor.message.len(), MAX_MESSAGE_LEN);
    }

    #[test]
    fn json_round_trips() {
        let descriptor = ErrorDescriptor::new("ValueError", "bad input");
        let bytes = descriptor.to_json();
        let decoded = ErrorDescriptor::from_json(&bytes).expect("should decode");
        assert_eq!(decoded, descriptor);
    }
}
