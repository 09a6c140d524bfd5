//! Bidirectional TCP relay.
//!
//! Each direction is a separate pump future polled inside the session task,
//! so a packet held in one direction never stalls the other. The relay ends
//! as soon as either pump ends.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::inspect::Interceptor;
use crate::lifecycle::ShutdownSignal;
use crate::protocols::Direction;
use crate::session::SessionResult;

/// Turns raw reads into forwardable units.
pub trait Framer: Send {
    /// Accept a read; return the bytes that are complete enough to inspect.
    fn feed(&mut self, data: &[u8]) -> Option<Vec<u8>>;

    /// Observe bytes after they passed inspection, just before the write.
    fn forwarded(&mut self, _chunk: &[u8]) {}
}

/// Every read is one unit.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl Framer for Passthrough {
    fn feed(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        Some(data.to_vec())
    }
}

/// Addresses of both ends of a relayed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    pub client: SocketAddr,
    pub upstream: SocketAddr,
}

impl Endpoints {
    /// `(source, destination)` for a direction.
    pub fn route(&self, direction: Direction) -> (SocketAddr, SocketAddr) {
        match direction {
            Direction::ClientToServer => (self.client, self.upstream),
            Direction::ServerToClient => (self.upstream, self.client),
        }
    }
}

/// One direction of a relay.
pub struct Pump<'a, F> {
    pub framer: F,
    pub interceptor: &'a Interceptor,
    pub direction: Direction,
    pub endpoints: Endpoints,
    pub buffer_size: usize,
}

impl<F: Framer> Pump<'_, F> {
    /// Copy from `reader` to `writer` until EOF, error or shutdown.
    pub async fn run<R, W>(
        mut self,
        reader: &mut R,
        writer: &mut W,
        mut shutdown: ShutdownSignal,
    ) -> SessionResult<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (source, destination) = self.endpoints.route(self.direction);
        let mut buf = vec![0u8; self.buffer_size.max(1)];

        loop {
            let n = tokio::select! {
                read = reader.read(&mut buf) => read?,
                _ = shutdown.recv() => return Ok(()),
            };
            if n == 0 {
                tracing::debug!(direction = %self.direction, "Peer closed");
                return Ok(());
            }

            let Some(unit) = self.framer.feed(&buf[..n]) else {
                continue;
            };
            let Some(unit) = self
                .interceptor
                .intercept(unit, self.direction, source, destination, &mut shutdown)
                .await
            else {
                continue;
            };

            self.framer.forwarded(&unit);
            writer.write_all(&unit).await?;
        }
    }
}

/// Relay between client and upstream until either side finishes.
#[allow(clippy::too_many_arguments)]
pub async fn relay<FC: Framer, FS: Framer>(
    client: &mut TcpStream,
    upstream: &mut TcpStream,
    client_framer: FC,
    server_framer: FS,
    interceptor: &Interceptor,
    endpoints: Endpoints,
    buffer_size: usize,
    shutdown: &ShutdownSignal,
) -> SessionResult<()> {
    let (mut client_read, mut client_write) = client.split();
    let (mut upstream_read, mut upstream_write) = upstream.split();

    let outbound = Pump {
        framer: client_framer,
        interceptor,
        direction: Direction::ClientToServer,
        endpoints,
        buffer_size,
    }
    .run(&mut client_read, &mut upstream_write, shutdown.clone());

    let inbound = Pump {
        framer: server_framer,
        interceptor,
        direction: Direction::ServerToClient,
        endpoints,
        buffer_size,
    }
    .run(&mut upstream_read, &mut client_write, shutdown.clone());

    tokio::select! {
        result = outbound => result,
        result = inbound => result,
    }
}

/// Close a stream, ignoring sockets that are already gone.
pub async fn close_stream(stream: &mut Option<TcpStream>) {
    if let Some(mut stream) = stream.take() {
        if let Err(e) = stream.shutdown().await {
            tracing::trace!(error = %e, "Socket already closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InspectionConfig, InspectionMode};
    use crate::inspect::InspectionServices;
    use crate::lifecycle::Shutdown;
    use crate::protocols::{HttpHandler, ProtocolKind};

    struct Lines {
        pending: Vec<u8>,
    }

    impl Framer for Lines {
        fn feed(&mut self, data: &[u8]) -> Option<Vec<u8>> {
            self.pending.extend_from_slice(data);
            let end = self.pending.iter().rposition(|&b| b == b'\n')? + 1;
            Some(self.pending.drain(..end).collect())
        }
    }

    #[tokio::test]
    async fn pump_forwards_framed_units_until_eof() {
        let services = InspectionServices::new(InspectionConfig::default());
        let interceptor =
            Interceptor::for_handler::<HttpHandler>(ProtocolKind::Http, InspectionMode::Headers, services);
        let shutdown = Shutdown::new();
        let endpoints = Endpoints {
            client: "127.0.0.1:1000".parse().unwrap(),
            upstream: "127.0.0.1:2000".parse().unwrap(),
        };

        let (mut feeder, mut reader) = tokio::io::duplex(64);
        let mut output = Vec::new();

        feeder.write_all(b"first\nsec").await.unwrap();
        feeder.write_all(b"ond\ntrailing").await.unwrap();
        drop(feeder);

        Pump {
            framer: Lines { pending: Vec::new() },
            interceptor: &interceptor,
            direction: Direction::ClientToServer,
            endpoints,
            buffer_size: 4,
        }
        .run(&mut reader, &mut output, shutdown.subscribe())
        .await
        .unwrap();

        assert_eq!(output, b"first\nsecond\n");
    }

    #[test]
    fn route_orders_addresses_by_direction() {
        let endpoints = Endpoints {
            client: "10.0.0.1:5000".parse().unwrap(),
            upstream: "10.0.0.2:80".parse().unwrap(),
        };
        assert_eq!(
            endpoints.route(Direction::ServerToClient),
            (endpoints.upstream, endpoints.client)
        );
    }
}
