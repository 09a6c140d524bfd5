//! Protocol listeners with shared backpressure.
//!
//! # Responsibilities
//! - Bind one endpoint per enabled protocol (TCP or UDP)
//! - Accept incoming TCP connections
//! - Enforce `max_connections` across all listeners via one semaphore
//! - Graceful handling of accept errors

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::protocols::ProtocolKind;

/// Error type for listener operations.
#[derive(Debug)]
pub enum ListenerError {
    /// Failed to bind to address.
    Bind {
        protocol: ProtocolKind,
        address: String,
        source: std::io::Error,
    },
    /// Failed to accept connection.
    Accept(std::io::Error),
    /// The worker pool was closed; no more sessions can be admitted.
    PoolClosed,
}

impl std::fmt::Display for ListenerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerError::Bind {
                protocol,
                address,
                source,
            } => write!(f, "Failed to bind {} listener on {}: {}", protocol, address, source),
            ListenerError::Accept(e) => write!(f, "Failed to accept: {}", e),
            ListenerError::PoolClosed => write!(f, "Worker pool closed"),
        }
    }
}

impl std::error::Error for ListenerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ListenerError::Bind { source, .. } => Some(source),
            ListenerError::Accept(e) => Some(e),
            ListenerError::PoolClosed => None,
        }
    }
}

/// Bounded pool of session slots shared by every listener.
///
/// When the limit is reached, accepts wait until a slot becomes available,
/// so exhaustion turns into backpressure instead of dropped connections.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    max_connections: usize,
}

impl WorkerPool {
    pub fn new(max_connections: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        }
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<ConnectionPermit, ListenerError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ListenerError::PoolClosed)?;
        Ok(ConnectionPermit { _permit: permit })
    }

    /// Get current available connection slots.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Get configured maximum connections.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// A permit representing a connection slot.
///
/// When dropped, the slot is released back to the pool, even if the
/// session task panics.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}

/// A TCP listener drawing its session slots from a shared [`WorkerPool`].
pub struct Listener {
    inner: TcpListener,
    protocol: ProtocolKind,
    pool: WorkerPool,
}

impl Listener {
    /// Bind `host:port` for `protocol`.
    pub async fn bind(
        protocol: ProtocolKind,
        host: &str,
        port: u16,
        pool: WorkerPool,
    ) -> Result<Self, ListenerError> {
        let address = format!("{}:{}", host, port);
        let bind_error = |source| ListenerError::Bind {
            protocol,
            address: address.clone(),
            source,
        };
        let listener = TcpListener::bind(&address).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        tracing::info!(
            protocol = %protocol,
            address = %local_addr,
            max_connections = pool.max_connections(),
            "Listener bound"
        );

        Ok(Self {
            inner: listener,
            protocol,
            pool,
        })
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// The permit is acquired before accepting. Both steps are cancel safe,
    /// so this can be raced against shutdown.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, ConnectionPermit), ListenerError> {
        let permit = self.pool.acquire().await?;
        let (stream, addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;

        tracing::debug!(
            protocol = %self.protocol,
            peer_addr = %addr,
            available_permits = self.pool.available_permits(),
            "Connection accepted"
        );

        Ok((stream, addr, permit))
    }

    pub fn protocol(&self) -> ProtocolKind {
        self.protocol
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }
}

/// Bind the datagram endpoint for a UDP protocol.
pub async fn bind_datagram(
    protocol: ProtocolKind,
    host: &str,
    port: u16,
) -> Result<UdpSocket, ListenerError> {
    let address = format!("{}:{}", host, port);
    let socket = UdpSocket::bind(&address)
        .await
        .map_err(|source| ListenerError::Bind {
            protocol,
            address: address.clone(),
            source,
        })?;
    tracing::info!(protocol = %protocol, address = %address, "Datagram endpoint bound");
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accept_holds_permit_for_connection_lifetime() {
        let pool = WorkerPool::new(2);
        let listener = Listener::bind(ProtocolKind::Telnet, "127.0.0.1", 0, pool.clone())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let (_stream, _peer, permit) = listener.accept().await.unwrap();
        assert_eq!(pool.available_permits(), 1);

        drop(permit);
        assert_eq!(pool.available_permits(), 2);
    }

    #[tokio::test]
    async fn exhausted_pool_blocks_accept() {
        let pool = WorkerPool::new(1);
        let listener = Listener::bind(ProtocolKind::Ftp, "127.0.0.1", 0, pool.clone())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let held = pool.acquire().await.unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let pending =
            tokio::time::timeout(std::time::Duration::from_millis(100), listener.accept()).await;
        assert!(pending.is_err());

        drop(held);
        assert!(listener.accept().await.is_ok());
    }

    #[tokio::test]
    async fn bind_error_names_protocol() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = Listener::bind(ProtocolKind::Http, "127.0.0.1", port, WorkerPool::new(1))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().starts_with("Failed to bind http listener"));
    }
}
