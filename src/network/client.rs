//! Network Client
//!
//! TCP client for talking to replica agents. Each replica gets one pooled
//! connection guarded by a mutex, so requests to a replica reach it in the
//! order they were issued.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;

use super::{encode_frame, read_message, write_frame, Message};
use crate::error::{Error, Result};

/// Pooled connection to one replica
struct Connection {
    stream: TcpStream,
    last_used: Instant,
}

impl Connection {
    async fn send(&mut self, frame: &[u8]) -> Result<()> {
        write_frame(&mut self.stream, frame).await
    }

    async fn receive(&mut self) -> Result<Message> {
        let response = read_message(&mut self.stream).await?;
        self.last_used = Instant::now();
        Ok(response)
    }
}

type Pool = RwLock<HashMap<String, Arc<Mutex<Connection>>>>;

/// Client side of the replica protocol
pub struct NetworkClient {
    pool: Pool,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl NetworkClient {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            pool: RwLock::new(HashMap::new()),
            connect_timeout,
            request_timeout,
        }
    }

    /// Send a request and wait for the response, bounded by the request timeout.
    ///
    /// Error responses are returned as typed errors. A request that does
    /// not fit in one frame fails with `TooLarge` without touching the
    /// connection.
    pub async fn send(&self, address: &str, message: Message) -> Result<Message> {
        let kind = message.type_name();
        let frame = encode_frame(&message)?;
        drop(message);
        match timeout(self.request_timeout, self.round_trip(address, &frame)).await {
            Ok(result) => result?.into_result(address),
            Err(_) => {
                // A late response would be read by the next request on this stream
                self.drop_connection(address).await;
                Err(Error::Timeout(format!("{} request to {}", kind, address)))
            }
        }
    }

    async fn round_trip(&self, address: &str, frame: &[u8]) -> Result<Message> {
        let pooled = self.pool.read().await.get(address).cloned();
        if let Some(connection) = pooled {
            let mut connection = connection.lock().await;
            // A stale pooled stream fails on send; the request never reached the replica
            if connection.send(frame).await.is_ok() {
                let response = connection.receive().await;
                drop(connection);
                return self.settle(address, response).await;
            }
            drop(connection);
            self.drop_connection(address).await;
            tracing::debug!("Pooled connection to {} is stale, reconnecting", address);
        }

        let connection = Arc::new(Mutex::new(Connection {
            stream: self.connect(address).await?,
            last_used: Instant::now(),
        }));
        self.pool
            .write()
            .await
            .insert(address.to_string(), connection.clone());

        let mut connection = connection.lock().await;
        let response = match connection.send(frame).await {
            Ok(()) => connection.receive().await,
            Err(e) => Err(e),
        };
        drop(connection);
        self.settle(address, response).await
    }

    /// Drop the connection after a failed exchange; its stream position is unknown
    async fn settle(&self, address: &str, response: Result<Message>) -> Result<Message> {
        match response {
            Ok(response) => Ok(response),
            Err(e) => {
                self.drop_connection(address).await;
                Err(Error::Network(format!("{}: {}", address, e)))
            }
        }
    }

    async fn connect(&self, address: &str) -> Result<TcpStream> {
        let failed = |reason: String| Error::ConnectionFailed {
            address: address.to_string(),
            reason,
        };
        let stream = timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| failed("connect timed out".into()))?
            .map_err(|e| failed(e.to_string()))?;
        stream.set_nodelay(true)?;
        tracing::debug!("Connected to replica {}", address);
        Ok(stream)
    }

    async fn drop_connection(&self, address: &str) {
        self.pool.write().await.remove(address);
    }

    /// Number of pooled connections
    pub async fn connection_count(&self) -> usize {
        self.pool.read().await.len()
    }
}
