// ABOUTME: Outbound side used by the correlator to send a request.
// ABOUTME: Implemented for link senders and raw mpsc senders.

use async_trait::async_trait;
use convoke_proto::{Envelope, ProtoError, StreamSender};
use tokio::sync::mpsc;

/// Anything that can accept an envelope for delivery.
#[async_trait]
pub trait EnvelopeSink: Send + Sync {
    async fn send_envelope(&self, envelope: Envelope) -> Result<(), ProtoError>;
}

#[async_trait]
impl EnvelopeSink for StreamSender<Envelope> {
    async fn send_envelope(&self, envelope: Envelope) -> Result<(), ProtoError> {
        self.send(envelope).await
    }
}

#[async_trait]
impl EnvelopeSink for mpsc::Sender<Envelope> {
    async fn send_envelope(&self, envelope: Envelope) -> Result<(), ProtoError> {
        self.send(envelope).await.map_err(|_| ProtoError::LinkClosed)
    }
}
