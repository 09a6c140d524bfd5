//! Protocol handler framework.
//!
//! # Data Flow
//! ```text
//! Dispatcher accepts client
//!     → registry.rs (protocol → constructor)
//!     → Handler::{Http, Ftp, Dns, Telnet}
//!     → setup_upstream()   connect / handshake
//!     → relay_loop()       capture → inspect → hold → forward
//!     → cleanup()          close both sides exactly once
//! ```
//!
//! # Design Decisions
//! - Closed enum over the four variants; adding a protocol adds a variant
//! - Parsers are associated functions so the interceptor can hold them as
//!   plain function pointers
//! - Parsers return `Result<Metadata, ParseError>` internally; the failure is
//!   folded into a `parse_error` field at the packet boundary

pub mod dns;
pub mod ftp;
pub mod http;
pub mod registry;
pub mod telnet;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpStream, UdpSocket};
use tracing::Instrument;

use crate::config::TargetConfig;
use crate::observability::metrics;
use crate::session::SessionError;

pub use dns::DnsHandler;
pub use ftp::FtpHandler;
pub use http::HttpHandler;
pub use registry::HandlerRegistry;
pub use telnet::TelnetHandler;

/// Parsed, protocol-specific packet fields.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Protocols the proxy can terminate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Http,
    Ftp,
    Dns,
    Telnet,
}

impl ProtocolKind {
    pub const ALL: [ProtocolKind; 4] = [
        ProtocolKind::Http,
        ProtocolKind::Ftp,
        ProtocolKind::Dns,
        ProtocolKind::Telnet,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolKind::Http => "http",
            ProtocolKind::Ftp => "ftp",
            ProtocolKind::Dns => "dns",
            ProtocolKind::Telnet => "telnet",
        }
    }

    /// Case-insensitive lookup by protocol tag.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(name))
    }

    pub fn transport(self) -> Transport {
        match self {
            ProtocolKind::Dns => Transport::Udp,
            _ => Transport::Tcp,
        }
    }

    /// Upstream used when the configuration names none.
    ///
    /// HTTP has no default; the target comes from each request.
    pub fn default_target(self) -> Option<TargetConfig> {
        match self {
            ProtocolKind::Http => None,
            ProtocolKind::Ftp => Some(TargetConfig::new("127.0.0.1", 21)),
            ProtocolKind::Dns => Some(TargetConfig::new("8.8.8.8", 53)),
            ProtocolKind::Telnet => Some(TargetConfig::new("127.0.0.1", 23)),
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Socket type a protocol listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

/// Which way a packet travels through the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::ClientToServer => "client_to_server",
            Direction::ServerToClient => "server_to_client",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure inside a protocol parser. Never escapes a packet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ParseError(pub String);

impl ParseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Collapse a parser result into packet metadata.
pub fn fold_parse(result: Result<Metadata, ParseError>) -> Metadata {
    match result {
        Ok(metadata) => metadata,
        Err(e) => {
            let mut metadata = Metadata::new();
            metadata.insert("parse_error".into(), e.0.into());
            metadata
        }
    }
}

/// The client side of a session as handed over by a listener.
#[derive(Debug)]
pub enum ClientEndpoint {
    Tcp { stream: TcpStream, peer: SocketAddr },
    /// Datagram listeners are shared so a failed session can be restarted
    /// on the same socket.
    Udp { socket: Arc<UdpSocket> },
}

impl ClientEndpoint {
    pub fn transport(&self) -> Transport {
        match self {
            ClientEndpoint::Tcp { .. } => Transport::Tcp,
            ClientEndpoint::Udp { .. } => Transport::Udp,
        }
    }

    /// Unwrap a TCP endpoint or report the mismatch.
    pub fn into_tcp(self) -> Result<(TcpStream, SocketAddr), SessionError> {
        match self {
            ClientEndpoint::Tcp { stream, peer } => Ok((stream, peer)),
            ClientEndpoint::Udp { .. } => Err(SessionError::TransportMismatch),
        }
    }

    pub fn into_udp(self) -> Result<Arc<UdpSocket>, SessionError> {
        match self {
            ClientEndpoint::Udp { socket } => Ok(socket),
            ClientEndpoint::Tcp { .. } => Err(SessionError::TransportMismatch),
        }
    }
}

/// Capabilities every protocol variant provides.
#[allow(async_fn_in_trait)]
pub trait ProtocolHandler {
    fn protocol(&self) -> ProtocolKind;

    /// Best-effort decode of one packet. Never fails; problems are
    /// reported through a `parse_error` or `error` field.
    fn parse_packet(data: &[u8], direction: Direction) -> Metadata;

    /// Whether a packet goes through capture and the hold contract at all.
    fn should_inspect(_data: &[u8], _direction: Direction) -> bool {
        true
    }

    /// Establish the server side of the session.
    async fn setup_upstream(&mut self) -> Result<(), SessionError>;

    /// Forward traffic until EOF, reset or shutdown.
    async fn relay_loop(&mut self) -> Result<(), SessionError>;

    /// Close both sides and release protocol resources. Must tolerate
    /// sockets that were never opened or are already closed.
    async fn cleanup(&mut self);
}

/// A constructed session, ready to run on a worker.
pub enum Handler {
    Http(HttpHandler),
    Ftp(FtpHandler),
    Dns(DnsHandler),
    Telnet(TelnetHandler),
}

impl Handler {
    pub fn protocol(&self) -> ProtocolKind {
        match self {
            Handler::Http(h) => h.protocol(),
            Handler::Ftp(h) => h.protocol(),
            Handler::Dns(h) => h.protocol(),
            Handler::Telnet(h) => h.protocol(),
        }
    }

    /// Run the whole session: setup, relay, cleanup.
    ///
    /// Errors end only this session; they are logged and counted here and
    /// handed back for callers that restart sessions.
    pub async fn run(
        self,
        session_id: impl fmt::Display,
        peer: Option<SocketAddr>,
    ) -> Result<(), SessionError> {
        let protocol = self.protocol();
        let span = tracing::info_span!(
            "session",
            protocol = %protocol,
            session_id = %session_id,
            peer_addr = ?peer,
        );

        async move {
            metrics::record_session_started(protocol);
            let result = match self {
                Handler::Http(h) => drive(h).await,
                Handler::Ftp(h) => drive(h).await,
                Handler::Dns(h) => drive(h).await,
                Handler::Telnet(h) => drive(h).await,
            };
            metrics::record_session_finished(protocol);

            match &result {
                Ok(()) => tracing::info!("Session closed"),
                Err(SessionError::ConnectionReset) => tracing::debug!("Session reset by peer"),
                Err(e) => {
                    metrics::record_session_error(protocol, e.kind());
                    tracing::warn!(error = %e, "Session ended with error");
                }
            }
            result
        }
        .instrument(span)
        .await
    }
}

async fn drive<H: ProtocolHandler>(mut handler: H) -> Result<(), SessionError> {
    let result = match handler.setup_upstream().await {
        Ok(()) => handler.relay_loop().await,
        Err(e) => Err(e),
    };
    handler.cleanup().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_names_round_trip() {
        for kind in ProtocolKind::ALL {
            assert_eq!(ProtocolKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(ProtocolKind::from_name("TELNET"), Some(ProtocolKind::Telnet));
        assert_eq!(ProtocolKind::from_name("smtp"), None);
    }

    #[test]
    fn only_dns_is_datagram() {
        assert_eq!(ProtocolKind::Dns.transport(), Transport::Udp);
        assert_eq!(ProtocolKind::Ftp.transport(), Transport::Tcp);
    }

    #[test]
    fn direction_serializes_snake_case() {
        let json = serde_json::to_string(&Direction::ServerToClient).unwrap();
        assert_eq!(json, "\"server_to_client\"");
    }

    #[test]
    fn parse_failure_becomes_field() {
        let metadata = fold_parse(Err(ParseError::new("truncated name")));
        assert_eq!(metadata["parse_error"], "truncated name");
        assert_eq!(metadata.len(), 1);
    }
}
