//! Connection dispatcher.
//!
//! Owns one listening endpoint per registered protocol and turns every
//! accepted client into a handler session on the shared worker pool. Also
//! the entry point for operator pause/resume of held packets.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::config::{ProxyConfig, RetryConfig};
use crate::inspect::{HeldPacket, HoldTable, InspectionServices};
use crate::lifecycle::ShutdownSignal;
use crate::net::connection::{SessionId, SessionTracker};
use crate::net::listener::{bind_datagram, ConnectionPermit, Listener, ListenerError, WorkerPool};
use crate::protocols::{ClientEndpoint, HandlerRegistry, ProtocolKind, Transport};
use crate::resilience::backoff::retry_delay;
use crate::session::SessionContext;

/// Pause after a failed accept so a persistent error (fd exhaustion) does
/// not spin.
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(50);

/// Bound endpoints, ready to serve.
pub struct BoundListeners {
    streams: Vec<Listener>,
    datagrams: Vec<(ProtocolKind, Arc<UdpSocket>)>,
}

impl BoundListeners {
    /// Local address of the endpoint serving `protocol`.
    pub fn local_addr(&self, protocol: ProtocolKind) -> Option<SocketAddr> {
        self.streams
            .iter()
            .find(|listener| listener.protocol() == protocol)
            .and_then(|listener| listener.local_addr().ok())
            .or_else(|| {
                self.datagrams
                    .iter()
                    .find(|(kind, _)| *kind == protocol)
                    .and_then(|(_, socket)| socket.local_addr().ok())
            })
    }
}

/// The multi-protocol proxy server.
#[derive(Clone)]
pub struct ProxyServer {
    config: Arc<ProxyConfig>,
    registry: Arc<HandlerRegistry>,
    services: InspectionServices,
    pool: WorkerPool,
    tracker: SessionTracker,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig, registry: HandlerRegistry, services: InspectionServices) -> Self {
        let pool = WorkerPool::new(config.server.max_connections);
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            services,
            pool,
            tracker: SessionTracker::new(),
        }
    }

    pub fn holds(&self) -> &HoldTable {
        &self.services.holds
    }

    /// Release a held packet. `false` for unknown or resolved ids.
    pub fn resume(&self, id: Uuid) -> bool {
        let applied = self.services.holds.resume(id);
        tracing::info!(packet_id = %id, applied, "Resume requested");
        applied
    }

    /// Re-arm the deadline of a held packet. `false` for unknown or resolved ids.
    pub fn pause(&self, id: Uuid) -> bool {
        let applied = self.services.holds.pause(id);
        tracing::info!(packet_id = %id, applied, "Pause requested");
        applied
    }

    pub fn held(&self) -> Vec<HeldPacket> {
        self.services.holds.list()
    }

    pub fn active_sessions(&self) -> u64 {
        self.tracker.total()
    }

    pub fn sessions_by_protocol(&self) -> HashMap<ProtocolKind, u64> {
        self.tracker.by_protocol()
    }

    /// Bind every registered protocol. Any bind failure is fatal.
    pub async fn bind(&self) -> Result<BoundListeners, ListenerError> {
        let host = &self.config.server.host;
        let mut bound = BoundListeners {
            streams: Vec::new(),
            datagrams: Vec::new(),
        };

        for protocol in self.registry.protocols() {
            let port = self.config.protocols.get(protocol).port;
            match protocol.transport() {
                Transport::Tcp => {
                    let listener = Listener::bind(protocol, host, port, self.pool.clone()).await?;
                    bound.streams.push(listener);
                }
                Transport::Udp => {
                    let socket = bind_datagram(protocol, host, port).await?;
                    bound.datagrams.push((protocol, Arc::new(socket)));
                }
            }
        }
        Ok(bound)
    }

    /// Serve until shutdown. In-flight sessions are not awaited; they observe
    /// the same shutdown signal and end on their own.
    pub async fn serve(&self, listeners: BoundListeners, shutdown: ShutdownSignal) {
        let mut loops = JoinSet::new();
        for listener in listeners.streams {
            loops.spawn(self.clone().accept_loop(listener, shutdown.clone()));
        }
        for (protocol, socket) in listeners.datagrams {
            loops.spawn(self.clone().datagram_loop(protocol, socket, shutdown.clone()));
        }

        while let Some(result) = loops.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Listener task failed");
            }
        }
        tracing::info!("All listeners closed");
    }

    fn context(&self, protocol: ProtocolKind, id: SessionId, shutdown: &ShutdownSignal) -> SessionContext {
        SessionContext {
            id,
            protocol,
            settings: self.config.protocols.get(protocol).clone(),
            connect_timeout: Duration::from_secs(self.config.server.timeout_secs),
            retries: self.config.retries.clone(),
            services: self.services.clone(),
            shutdown: shutdown.clone(),
        }
    }

    async fn accept_loop(self, listener: Listener, mut shutdown: ShutdownSignal) {
        let protocol = listener.protocol();
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.recv() => break,
            };

            match accepted {
                Ok((stream, peer, permit)) => {
                    self.spawn_session(protocol, stream, peer, permit, &shutdown);
                }
                Err(ListenerError::PoolClosed) => break,
                Err(e) => {
                    tracing::warn!(protocol = %protocol, error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                }
            }
        }
        tracing::info!(protocol = %protocol, "Listener stopped");
    }

    fn spawn_session(
        &self,
        protocol: ProtocolKind,
        stream: tokio::net::TcpStream,
        peer: SocketAddr,
        permit: ConnectionPermit,
        shutdown: &ShutdownSignal,
    ) {
        let guard = self.tracker.open(protocol);
        let context = self.context(protocol, guard.id(), shutdown);
        let handler = match self
            .registry
            .create(protocol, ClientEndpoint::Tcp { stream, peer }, context)
        {
            Some(Ok(handler)) => handler,
            Some(Err(e)) => {
                tracing::warn!(protocol = %protocol, peer_addr = %peer, error = %e, "Failed to construct handler");
                return;
            }
            None => {
                tracing::warn!(protocol = %protocol, "No handler registered");
                return;
            }
        };

        tokio::spawn(async move {
            let _permit = permit;
            let id = guard.id();
            // Outcome is logged inside the session span.
            let _ = handler.run(id, Some(peer)).await;
            drop(guard);
        });
    }

    /// One long-lived session per datagram endpoint, restarted with backoff
    /// when it fails. It does not take a worker slot.
    async fn datagram_loop(self, protocol: ProtocolKind, socket: Arc<UdpSocket>, mut shutdown: ShutdownSignal) {
        let restart = RetryConfig {
            enabled: true,
            ..self.config.retries.clone()
        };
        let mut failures = 0u32;

        while !shutdown.is_triggered() {
            let guard = self.tracker.open(protocol);
            let context = self.context(protocol, guard.id(), &shutdown);
            let handler = match self.registry.create(
                protocol,
                ClientEndpoint::Udp {
                    socket: Arc::clone(&socket),
                },
                context,
            ) {
                Some(Ok(handler)) => handler,
                Some(Err(e)) => {
                    tracing::error!(protocol = %protocol, error = %e, "Failed to construct handler");
                    break;
                }
                None => break,
            };

            let result = handler.run(guard.id(), None).await;
            drop(guard);

            match result {
                Ok(()) => failures = 0,
                Err(_) => {
                    failures = failures.saturating_add(1);
                    let delay = retry_delay(&restart, failures);
                    tracing::info!(
                        protocol = %protocol,
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        "Restarting datagram session"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.recv() => break,
                    }
                }
            }
        }
        tracing::info!(protocol = %protocol, "Datagram endpoint stopped");
    }
}
