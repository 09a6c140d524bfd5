//! Upstream connection setup.

use std::io;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::config::RetryConfig;
use crate::lifecycle::ShutdownSignal;
use crate::resilience::retries::retry_with_backoff;
use crate::session::SessionError;

async fn connect_once(authority: &str, timeout: Duration) -> Result<TcpStream, SessionError> {
    let unreachable = |source| SessionError::UpstreamUnreachable {
        addr: authority.to_string(),
        source,
    };

    match tokio::time::timeout(timeout, TcpStream::connect(authority)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(unreachable(e)),
        Err(_) => Err(unreachable(io::Error::new(
            io::ErrorKind::TimedOut,
            "connect timed out",
        ))),
    }
}

/// Connect to `authority` (`host:port`) with a per-attempt deadline.
///
/// Unreachable upstreams are retried per `retries`; shutdown aborts the
/// attempt.
pub async fn connect_upstream(
    authority: &str,
    timeout: Duration,
    retries: &RetryConfig,
    shutdown: &mut ShutdownSignal,
) -> Result<TcpStream, SessionError> {
    let attempt = retry_with_backoff(
        retries,
        "upstream_connect",
        |e| matches!(e, SessionError::UpstreamUnreachable { .. }),
        |_| connect_once(authority, timeout),
    );

    let stream = tokio::select! {
        result = attempt => result?,
        _ = shutdown.recv() => {
            return Err(SessionError::UpstreamUnreachable {
                addr: authority.to_string(),
                source: io::Error::new(io::ErrorKind::Interrupted, "shutdown in progress"),
            });
        }
    };

    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "Failed to set TCP_NODELAY on upstream");
    }
    tracing::debug!(upstream = %authority, "Upstream connected");
    Ok(stream)
}
