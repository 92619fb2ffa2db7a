// ABOUTME: Transport seam between the connector and the network.
// ABOUTME: TcpTransport opens a socket to the router and bridges it into a Link.

use std::time::Duration;

use async_trait::async_trait;
use convoke_proto::{spawn_link, Link, DEFAULT_CHANNEL_BUFFER};
use tokio::net::TcpStream;

use crate::error::ConnectorError;

/// Opens a fresh link to the router. Called once per (re)connect attempt.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<Link, ConnectorError>;

    /// Human-readable endpoint for logs.
    fn describe(&self) -> String;
}

/// Newline-delimited JSON over TCP.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    pub address: String,
    pub connect_timeout: Duration,
    pub buffer: usize,
}

impl TcpTransport {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: Duration::from_secs(10),
            buffer: DEFAULT_CHANNEL_BUFFER,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self) -> Result<Link, ConnectorError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| {
                ConnectorError::ConnectionFailed(format!(
                    "connect to {} timed out after {:?}",
                    self.address, self.connect_timeout
                ))
            })?
            .map_err(|e| ConnectorError::ConnectionFailed(format!("{}: {}", self.address, e)))?;

        stream.set_nodelay(true).ok();
        Ok(spawn_link(stream, self.buffer))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoke_proto::{Envelope, MessageType};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_connect_refused() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport =
            TcpTransport::new(addr.to_string()).with_connect_timeout(Duration::from_millis(500));
        let result = transport.connect().await;
        assert!(matches!(result, Err(ConnectorError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_tcp_link_exchanges_envelopes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut link = spawn_link(stream, 8);
            let env = link.receiver.recv().await.unwrap().unwrap();
            assert_eq!(env.kind, MessageType::Heartbeat);
            link.sender
                .send(Envelope::heartbeat_ack("a1"))
                .await
                .unwrap();
            // Keep the link open until the client has read the ack.
            link.receiver.recv().await;
        });

        let transport = TcpTransport::new(addr.to_string());
        assert_eq!(transport.describe(), format!("tcp://{}", addr));
        let mut link = transport.connect().await.unwrap();
        link.sender.send(Envelope::heartbeat("a1")).await.unwrap();
        let ack = link.receiver.recv().await.unwrap().unwrap();
        assert_eq!(ack.kind, MessageType::HeartbeatAck);

        drop(link);
        server.await.unwrap();
    }
}
