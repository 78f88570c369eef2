//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding or decoding envelopes.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// An envelope inside a frame could not be parsed.
    #[error("malformed envelope at position {position}: {source}")]
    Malformed {
        /// Zero-based index of the line within its frame.
        position: usize,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// An envelope could not be serialized.
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_display_names_position() {
        let source = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = ProtocolError::Malformed {
            position: 3,
            source,
        };
        assert!(err.to_string().contains("position 3"));
    }
}
