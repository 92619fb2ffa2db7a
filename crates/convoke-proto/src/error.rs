// ABOUTME: Error types for the convoke-proto crate.
// ABOUTME: Separates recoverable malformed input from fatal transport failures.

use thiserror::Error;

use crate::envelope::MessageType;

/// Errors produced while decoding, validating, or moving envelopes.
#[derive(Error, Debug)]
pub enum ProtoError {
    /// Line was not a valid envelope.
    #[error("invalid envelope: {0}")]
    Json(#[from] serde_json::Error),

    /// Envelope parsed but is missing a field its type requires.
    #[error("missing field '{field}' for {kind} envelope")]
    MissingField {
        kind: MessageType,
        field: &'static str,
    },

    /// Payload did not match the shape its type requires.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// A line was not valid UTF-8.
    #[error("line is not valid UTF-8: {0}")]
    InvalidEncoding(std::str::Utf8Error),

    /// A single line exceeded the framing limit and was discarded.
    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),

    /// The underlying socket failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The other half of the link has gone away.
    #[error("link closed")]
    LinkClosed,
}

impl ProtoError {
    /// Whether the connection can no longer be used after this error.
    ///
    /// Malformed input is answered and skipped; only transport failures end
    /// the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtoError::Io(_) | ProtoError::LinkClosed)
    }
}
