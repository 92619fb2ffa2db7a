// ABOUTME: Per-connection task: reads envelopes off a link and forwards them to the router actor.
// ABOUTME: Malformed input is answered with invalid_envelope; only transport failure or eviction ends it.

use convoke_proto::{spawn_link, Envelope, ErrorKind, ErrorPayload, Link, DEFAULT_CHANNEL_BUFFER};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::router::RouterHandle;

/// Serve one accepted TCP connection until it closes.
pub async fn handle_connection(stream: TcpStream, peer: std::net::SocketAddr, router: RouterHandle) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %e, "Could not disable Nagle");
    }
    let link = spawn_link(stream, DEFAULT_CHANNEL_BUFFER);
    serve_link(link, peer.to_string(), router).await;
}

/// Serve any link, socket-backed or in-memory.
pub async fn serve_link(link: Link, peer: String, router: RouterHandle) {
    let (sender, mut receiver) = link.split();
    let cancel = CancellationToken::new();
    let conn = match router.open(sender.clone(), cancel.clone()).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(peer = %peer, error = %e, "Router unavailable, dropping connection");
            return;
        }
    };
    info!(peer = %peer, conn, "Connection accepted");

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(conn, "Connection closed by router");
                break;
            }
            item = receiver.recv() => item,
        };

        match item {
            None => break,
            Some(Ok(envelope)) => {
                if let Err(e) = envelope.validate() {
                    debug!(conn, error = %e, "Invalid envelope");
                    let reply = Envelope::error(
                        envelope.task_id.clone(),
                        ErrorPayload::new(ErrorKind::InvalidEnvelope, e.to_string()),
                    );
                    if sender.send(reply).await.is_err() {
                        break;
                    }
                    continue;
                }
                if router.inbound(conn, envelope).await.is_err() {
                    break;
                }
            }
            Some(Err(e)) if e.is_fatal() => {
                debug!(conn, error = %e, "Connection failed");
                break;
            }
            Some(Err(e)) => {
                debug!(conn, error = %e, "Malformed input");
                let reply = Envelope::error(
                    None,
                    ErrorPayload::new(ErrorKind::InvalidEnvelope, e.to_string()),
                );
                if sender.send(reply).await.is_err() {
                    break;
                }
            }
        }
    }

    router.disconnect(conn).await;
    info!(peer = %peer, conn, "Connection closed");
}
