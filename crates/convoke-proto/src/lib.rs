// ABOUTME: Wire protocol shared by the convoke router, connectors and clients.
// ABOUTME: Single source of truth for envelope types, error payloads and framing.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod link;

pub use codec::LineCodec;
pub use envelope::{Envelope, ErrorKind, ErrorPayload, MessageType, RegisterPayload};
pub use error::ProtoError;
pub use link::{
    decode, encode, spawn_link, EnvelopeReader, EnvelopeWriter, Link, StreamSender,
    DEFAULT_CHANNEL_BUFFER, MAX_LINE_BYTES,
};
