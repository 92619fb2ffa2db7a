// ABOUTME: Newline-delimited JSON framing and socket-to-channel bridging.
// ABOUTME: Provides EnvelopeReader/Writer, StreamSender, and spawn_link for persistent connections.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::codec::LineCodec;
use crate::envelope::Envelope;
use crate::error::ProtoError;

/// Longest accepted line; longer lines are discarded and reported as malformed.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Default buffer size for outbound envelope channels.
pub const DEFAULT_CHANNEL_BUFFER: usize = 100;

/// Serialize an envelope to a single line (without the trailing newline).
pub fn encode(envelope: &Envelope) -> Result<String, ProtoError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Parse and validate a single line.
pub fn decode(line: &str) -> Result<Envelope, ProtoError> {
    let envelope: Envelope = serde_json::from_str(line)?;
    envelope.validate()?;
    Ok(envelope)
}

/// Reads envelopes from a byte stream, one JSON object per line.
///
/// Malformed lines (bad JSON, bad UTF-8, too long) are reported one by one
/// and reading continues with the next line.
pub struct EnvelopeReader<R> {
    inner: FramedRead<R, LineCodec>,
}

impl<R: AsyncRead + Unpin> EnvelopeReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: FramedRead::new(reader, LineCodec::new(MAX_LINE_BYTES)),
        }
    }

    /// Next envelope, `None` on end of stream. Blank lines are skipped.
    pub async fn next_envelope(&mut self) -> Option<Result<Envelope, ProtoError>> {
        loop {
            let line = match self.inner.next().await? {
                Ok(Ok(line)) => line,
                Ok(Err(malformed)) => return Some(Err(malformed)),
                Err(e) => return Some(Err(ProtoError::Io(e))),
            };
            if line.trim().is_empty() {
                continue;
            }
            return Some(decode(&line));
        }
    }
}

/// Writes envelopes to a byte stream, one JSON object per line.
pub struct EnvelopeWriter<W> {
    inner: FramedWrite<W, LineCodec>,
}

impl<W: AsyncWrite + Unpin> EnvelopeWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: FramedWrite::new(writer, LineCodec::new(MAX_LINE_BYTES)),
        }
    }

    pub async fn send(&mut self, envelope: &Envelope) -> Result<(), ProtoError> {
        let line = encode(envelope)?;
        self.inner.send(line).await?;
        Ok(())
    }

    /// Flush and shut down the write half so the peer sees end of stream.
    pub async fn close(&mut self) -> Result<(), ProtoError> {
        SinkExt::<String>::close(&mut self.inner).await?;
        Ok(())
    }
}

/// Sender half of a link.
///
/// Wraps an mpsc sender for outgoing envelopes with convenience methods.
#[derive(Debug, Clone)]
pub struct StreamSender<T> {
    inner: mpsc::Sender<T>,
}

impl<T> StreamSender<T> {
    pub fn new(sender: mpsc::Sender<T>) -> Self {
        Self { inner: sender }
    }

    pub async fn send(&self, msg: T) -> Result<(), ProtoError> {
        self.inner
            .send(msg)
            .await
            .map_err(|_| ProtoError::LinkClosed)
    }

    /// Try to send a message without waiting.
    pub fn try_send(&self, msg: T) -> Result<(), ProtoError> {
        self.inner.try_send(msg).map_err(|_| ProtoError::LinkClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Whether two senders feed the same link.
    pub fn same_link(&self, other: &Self) -> bool {
        self.inner.same_channel(&other.inner)
    }

    pub fn into_inner(self) -> mpsc::Sender<T> {
        self.inner
    }
}

/// A live connection expressed as a pair of channels.
///
/// Dropping every clone of `sender` flushes and closes the write half;
/// dropping `receiver` stops the read task.
pub struct Link {
    pub sender: StreamSender<Envelope>,
    pub receiver: mpsc::Receiver<Result<Envelope, ProtoError>>,
}

impl Link {
    /// An in-memory link pair, used by tests and in-process transports.
    ///
    /// Envelopes sent on one side arrive on the other.
    pub fn pair(buffer: usize) -> (Link, Link) {
        let (a_tx, a_rx) = mpsc::channel::<Envelope>(buffer);
        let (b_tx, b_rx) = mpsc::channel::<Envelope>(buffer);
        let left = Link::from_channels(a_tx, b_rx, buffer);
        let right = Link::from_channels(b_tx, a_rx, buffer);
        (left, right)
    }

    fn from_channels(
        tx: mpsc::Sender<Envelope>,
        mut rx: mpsc::Receiver<Envelope>,
        buffer: usize,
    ) -> Link {
        let (in_tx, in_rx) = mpsc::channel(buffer);
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if in_tx.send(Ok(envelope)).await.is_err() {
                    break;
                }
            }
        });
        Link {
            sender: StreamSender::new(tx),
            receiver: in_rx,
        }
    }

    pub fn split(
        self,
    ) -> (
        StreamSender<Envelope>,
        mpsc::Receiver<Result<Envelope, ProtoError>>,
    ) {
        (self.sender, self.receiver)
    }
}

/// Bridge a byte stream (usually a `TcpStream`) into a [`Link`].
///
/// Spawns one task writing outbound envelopes and one reading inbound lines.
/// Malformed lines are forwarded as recoverable errors; a transport error is
/// forwarded once and ends the read task.
pub fn spawn_link<S>(stream: S, buffer: usize) -> Link
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(buffer);
    let (in_tx, in_rx) = mpsc::channel(buffer);

    tokio::spawn(async move {
        let mut writer = EnvelopeWriter::new(write_half);
        while let Some(envelope) = out_rx.recv().await {
            if let Err(e) = writer.send(&envelope).await {
                tracing::debug!(error = %e, "Link write failed");
                return;
            }
        }
        let _ = writer.close().await;
    });

    tokio::spawn(async move {
        let mut reader = EnvelopeReader::new(read_half);
        loop {
            let item = tokio::select! {
                _ = in_tx.closed() => break,
                item = reader.next_envelope() => item,
            };
            let Some(item) = item else { break };
            let fatal = matches!(&item, Err(e) if e.is_fatal());
            if in_tx.send(item).await.is_err() || fatal {
                break;
            }
        }
    });

    Link {
        sender: StreamSender::new(out_tx),
        receiver: in_rx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageType;
    use serde_json::json;

    #[test]
    fn test_decode_validates() {
        assert!(decode(r#"{"type":"heartbeat"}"#).is_err());
        let env = decode(r#"{"type":"heartbeat","agent_id":"a1"}"#).unwrap();
        assert_eq!(env.kind, MessageType::Heartbeat);
    }

    #[test]
    fn test_encode_is_single_line() {
        let env = Envelope::task("planner", "plan", json!({"text": "line one\nline two"}));
        let line = encode(&env).unwrap();
        assert!(!line.contains('\n'));
        assert_eq!(decode(&line).unwrap(), env);
    }

    #[tokio::test]
    async fn test_reader_skips_blank_and_reports_malformed() {
        let input = b"\n{\"type\":\"heartbeat\",\"agent_id\":\"a1\"}\nnot json\n{\"type\":\"heartbeat_ack\"}\n";
        let mut reader = EnvelopeReader::new(&input[..]);

        let first = reader.next_envelope().await.unwrap().unwrap();
        assert_eq!(first.kind, MessageType::Heartbeat);

        let second = reader.next_envelope().await.unwrap();
        assert!(matches!(second, Err(ProtoError::Json(_))));

        let third = reader.next_envelope().await.unwrap().unwrap();
        assert_eq!(third.kind, MessageType::HeartbeatAck);

        assert!(reader.next_envelope().await.is_none());
    }

    #[tokio::test]
    async fn test_reader_survives_invalid_utf8() {
        let input = b"\xff\xfe\n{\"type\":\"heartbeat\",\"agent_id\":\"a1\"}\n";
        let mut reader = EnvelopeReader::new(&input[..]);

        let bad = reader.next_envelope().await.unwrap().unwrap_err();
        assert!(matches!(bad, ProtoError::InvalidEncoding(_)));
        assert!(!bad.is_fatal());

        let next = reader.next_envelope().await.unwrap().unwrap();
        assert_eq!(next.agent_id.as_deref(), Some("a1"));
        assert!(reader.next_envelope().await.is_none());
    }

    #[tokio::test]
    async fn test_spawn_link_over_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let client_link = spawn_link(client, 8);
        let mut server_link = spawn_link(server, 8);

        client_link
            .sender
            .send(Envelope::heartbeat("a1"))
            .await
            .unwrap();
        let received = server_link.receiver.recv().await.unwrap().unwrap();
        assert_eq!(received.kind, MessageType::Heartbeat);
        assert_eq!(received.agent_id.as_deref(), Some("a1"));

        // Dropping the client closes its write half; the server sees end of stream.
        drop(client_link);
        assert!(server_link.receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_link_pair() {
        let (left, mut right) = Link::pair(4);
        left.sender.send(Envelope::heartbeat_ack("a1")).await.unwrap();
        let got = right.receiver.recv().await.unwrap().unwrap();
        assert_eq!(got.kind, MessageType::HeartbeatAck);
    }

    #[tokio::test]
    async fn test_stream_sender_closed_detection() {
        let (tx, rx) = mpsc::channel::<Envelope>(1);
        let sender = StreamSender::new(tx);
        assert!(!sender.is_closed());
        drop(rx);
        assert!(sender.is_closed());
        assert!(matches!(
            sender.send(Envelope::heartbeat("a1")).await,
            Err(ProtoError::LinkClosed)
        ));
    }
}
