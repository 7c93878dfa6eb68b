use crate::Channel;
use bytes::Bytes;
use std::sync::Arc;

/// Serves the requests a peer sends over a connection. Handlers run to
/// completion on their own task; `peer` is the connection the request
/// arrived on, used to pull from or push into the requester's bulk regions
/// and to answer.
///
/// A handler returns the fully-encoded response payload, or an errno when
/// it could not produce one (undecodable request, unknown operation); the
/// dispatcher then answers with a bare errno payload.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, peer: Channel, op: &str, payload: Bytes) -> Result<Bytes, i32>;
}

/// Accept loop for the server's TCP endpoint (server↔server traffic).
pub async fn serve_tcp(
    listener: tokio::net::TcpListener,
    handler: Arc<dyn Handler>,
) -> std::io::Result<()> {
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        stream.set_nodelay(true)?;
        tracing::debug!(%peer_addr, "accepted peer connection");

        let channel = Channel::spawn(stream, Some(handler.clone()));
        tokio::spawn(async move {
            channel.closed().await;
            tracing::debug!(%peer_addr, "peer connection closed");
        });
    }
}

/// Accept loop for the server's Unix endpoint (co-located clients).
pub async fn serve_unix(
    listener: tokio::net::UnixListener,
    handler: Arc<dyn Handler>,
) -> std::io::Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        tracing::debug!("accepted client connection");

        let channel = Channel::spawn(stream, Some(handler.clone()));
        tokio::spawn(async move {
            channel.closed().await;
            tracing::debug!("client connection closed");
        });
    }
}
