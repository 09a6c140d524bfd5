//! Per-connection session plumbing shared by every protocol handler.
//!
//! # Responsibilities
//! - Session error type and classification of socket failures
//! - Per-session context: protocol settings, live inspection state, shutdown
//! - Upstream connects with timeout and retry (`upstream.rs`)
//! - Bidirectional TCP pumps with per-protocol framing (`relay.rs`)

pub mod relay;
pub mod upstream;

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::config::{ProtocolConfig, RetryConfig, TargetConfig};
use crate::inspect::{InspectionServices, Interceptor};
use crate::lifecycle::ShutdownSignal;
use crate::net::connection::SessionId;
use crate::protocols::{ProtocolHandler, ProtocolKind};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("upstream {addr} unreachable: {source}")]
    UpstreamUnreachable {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("I/O error: {0}")]
    Io(#[source] io::Error),

    #[error("client endpoint transport does not match the protocol")]
    TransportMismatch,
}

impl SessionError {
    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::UpstreamUnreachable { .. } => "upstream_unreachable",
            SessionError::ProtocolViolation(_) => "protocol_violation",
            SessionError::ConnectionReset => "connection_reset",
            SessionError::Io(_) => "io",
            SessionError::TransportMismatch => "transport_mismatch",
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => SessionError::ConnectionReset,
            _ => SessionError::Io(e),
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Everything a handler needs besides its client socket.
#[derive(Clone)]
pub struct SessionContext {
    pub id: SessionId,
    pub protocol: ProtocolKind,
    pub settings: ProtocolConfig,
    /// Deadline for upstream connects and handshakes.
    pub connect_timeout: Duration,
    pub retries: RetryConfig,
    pub services: InspectionServices,
    pub shutdown: ShutdownSignal,
}

impl SessionContext {
    /// Interceptor wired to `H`'s parser and this session's inspection mode.
    pub fn interceptor<H: ProtocolHandler>(&self) -> Interceptor {
        Interceptor::for_handler::<H>(
            self.protocol,
            self.settings.inspection_mode,
            self.services.clone(),
        )
    }

    /// Configured upstream, or the protocol default.
    pub fn target(&self) -> Option<TargetConfig> {
        self.settings.target_or_default(self.protocol)
    }
}
