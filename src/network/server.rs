//! Network Server
//!
//! TCP server accepting request/response connections. Requests on one
//! connection are handled one at a time, in order.

use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

use super::{encode_frame, read_message, write_frame, Message};
use crate::error::{Error, Result};

/// Handles one request and produces its response
#[async_trait::async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, peer: &str, message: Message) -> Message;
}

/// Network server for replica traffic
pub struct NetworkServer {
    /// Bind address
    bind_address: String,
    /// Request handler
    handler: Arc<dyn RequestHandler>,
    /// Shutdown signal
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl NetworkServer {
    /// Create a new network server
    pub fn new(bind_address: String, handler: Arc<dyn RequestHandler>) -> Self {
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);

        Self {
            bind_address,
            handler,
            shutdown: shutdown_tx,
        }
    }

    /// Bind and serve until stopped
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until stopped
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        tracing::info!("Network server listening on {}", local);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let handler = self.handler.clone();
                            let shutdown_rx = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, peer_addr.clone(), handler, shutdown_rx).await {
                                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Network server stopped");
        Ok(())
    }

    /// Stop the server and its connections
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Handle a single connection
async fn handle_connection(
    socket: TcpStream,
    peer_addr: String,
    handler: Arc<dyn RequestHandler>,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    loop {
        let message = tokio::select! {
            message = read_message(&mut reader) => message,
            _ = shutdown_rx.changed() => break,
        };

        match message {
            Ok(message) => {
                tracing::trace!("Received {} from {}", message.type_name(), peer_addr);
                let response = handler.handle(&peer_addr, message).await;
                let frame = match encode_frame(&response) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!("Cannot answer {}: {}", peer_addr, e);
                        encode_frame(&Message::error(&e))?
                    }
                };
                write_frame(&mut writer, &frame).await?;
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed
                break;
            }
            Err(e) => {
                tracing::warn!("Error reading message from {}: {}", peer_addr, e);
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkClient;
    use std::time::Duration;

    struct Echo;

    #[async_trait::async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, _peer: &str, message: Message) -> Message {
            match message {
                Message::Ping => Message::Pong,
                other => Message::error(&Error::InvalidState(format!(
                    "Unexpected {}",
                    other.type_name()
                ))),
            }
        }
    }

    #[tokio::test]
    async fn test_request_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = Arc::new(NetworkServer::new(address.clone(), Arc::new(Echo)));

        let running = server.clone();
        let task = tokio::spawn(async move { running.serve(listener).await });

        let client = NetworkClient::new(Duration::from_secs(1), Duration::from_secs(1));
        assert!(matches!(client.send(&address, Message::Ping).await, Ok(Message::Pong)));
        assert!(matches!(
            client.send(&address, Message::Open).await,
            Err(Error::InvalidState(_))
        ));
        assert_eq!(client.connection_count().await, 1);

        server.stop();
        task.await.unwrap().unwrap();
    }
}
