//! TCP listener

use super::peer::{self, PeerEvent};
use crate::error::{NetworkError, Result};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Listening socket for inbound peers
pub struct Server {
    listener: TcpListener,
}

impl Server {
    /// Bind `host:port`; port 0 picks a free one
    pub async fn bind(host: &str, port: u16) -> Result<Self> {
        let addr = format!("{}:{}", host, port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| NetworkError::BindFailed { addr, source })?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until `shutdown` fires
    ///
    /// Each accepted connection runs on its own task and reports through
    /// `events`.
    pub async fn run(self, events: mpsc::UnboundedSender<PeerEvent>, shutdown: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Listening on {}", addr);
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        debug!("Inbound connection from {}", remote);
                        peer::accept(stream, remote, events.clone());
                    },
                    Err(e) => warn!("Accept failed: {}", e),
                },
            }
        }

        info!("Listener stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = Server::bind("127.0.0.1", 0).await.unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let first = Server::bind("127.0.0.1", 0).await.unwrap();
        let port = first.local_addr().unwrap().port();

        let err = Server::bind("127.0.0.1", port).await.err().unwrap();
        assert!(err.to_string().contains("Failed to bind"));
    }

    #[tokio::test]
    async fn test_accepted_connection_is_announced() {
        let server = Server::bind("127.0.0.1", 0).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (events, mut rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.run(events, shutdown.clone()));

        let _stream = TcpStream::connect(addr).await.unwrap();
        match rx.recv().await.unwrap() {
            PeerEvent::Connected(peer) => assert!(!peer.is_server()),
            other => panic!("unexpected event {:?}", other),
        }

        shutdown.cancel();
        task.await.unwrap();
    }
}
