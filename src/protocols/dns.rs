//! DNS relaying over UDP.
//!
//! One session owns the listening socket and serves datagrams in order:
//! each query is forwarded to the resolver and the reply carrying the same
//! transaction id is sent back to whoever asked.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;

use crate::inspect::Interceptor;
use crate::protocols::{
    ClientEndpoint, Direction, Handler, Metadata, ParseError, ProtocolHandler, ProtocolKind,
};
use crate::session::{SessionContext, SessionError, SessionResult};

const HEADER_LEN: usize = 12;
const MAX_ANSWERS_REPORTED: u16 = 10;
/// Largest datagram the relay will accept, regardless of `buffer_size`.
const MAX_DATAGRAM: usize = 65_535;

fn opcode_name(opcode: u16) -> String {
    match opcode {
        0 => "QUERY".into(),
        1 => "IQUERY".into(),
        2 => "STATUS".into(),
        3 => "NOTIFY".into(),
        4 => "UPDATE".into(),
        n => format!("UNKNOWN ({})", n),
    }
}

fn rcode_name(rcode: u16) -> String {
    match rcode {
        0 => "NOERROR".into(),
        1 => "FORMERR".into(),
        2 => "SERVFAIL".into(),
        3 => "NXDOMAIN".into(),
        4 => "NOTIMP".into(),
        5 => "REFUSED".into(),
        n => format!("UNKNOWN ({})", n),
    }
}

fn qtype_name(qtype: u16) -> String {
    match qtype {
        1 => "A".into(),
        2 => "NS".into(),
        5 => "CNAME".into(),
        6 => "SOA".into(),
        12 => "PTR".into(),
        15 => "MX".into(),
        16 => "TXT".into(),
        28 => "AAAA".into(),
        33 => "SRV".into(),
        255 => "ANY".into(),
        n => format!("TYPE{}", n),
    }
}

fn qclass_name(qclass: u16) -> String {
    match qclass {
        1 => "IN".into(),
        2 => "CS".into(),
        3 => "CH".into(),
        4 => "HS".into(),
        255 => "ANY".into(),
        n => format!("CLASS{}", n),
    }
}

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Decode the uncompressed name at `offset`. Returns the dotted name and
/// the offset just past it.
fn read_name(data: &[u8], mut offset: usize) -> Result<(String, usize), ParseError> {
    let mut labels = Vec::new();
    loop {
        let len = *data
            .get(offset)
            .ok_or_else(|| ParseError::new("query name runs past end of packet"))?
            as usize;
        offset += 1;
        if len == 0 {
            break;
        }
        let label = data
            .get(offset..offset + len)
            .ok_or_else(|| ParseError::new("query label runs past end of packet"))?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        offset += len;
    }
    Ok((labels.join("."), offset))
}

/// Offset just past the name at `offset`, following the rule that a label
/// byte with both top bits set is a pointer ending the name one byte later.
fn skip_name(data: &[u8], mut offset: usize) -> usize {
    while let Some(&len) = data.get(offset) {
        offset += 1;
        if len == 0 {
            break;
        }
        if len & 0xC0 == 0xC0 {
            offset += 1;
            break;
        }
        offset += len as usize;
    }
    offset
}

fn parse_question(data: &[u8], metadata: &mut Metadata) -> Result<(), ParseError> {
    let (name, offset) = read_name(data, HEADER_LEN)?;
    metadata.insert("query_name".into(), name.into());

    if let (Some(qtype), Some(qclass)) = (read_u16(data, offset), read_u16(data, offset + 2)) {
        metadata.insert("query_type".into(), qtype_name(qtype).into());
        metadata.insert("query_class".into(), qclass_name(qclass).into());
    }
    Ok(())
}

/// Decode a DNS message header and first question.
pub fn parse_message(data: &[u8]) -> Metadata {
    let mut metadata = Metadata::new();
    if data.len() < HEADER_LEN {
        metadata.insert("error".into(), "Packet too short for DNS header".into());
        return metadata;
    }

    let field = |i: usize| u16::from_be_bytes([data[i * 2], data[i * 2 + 1]]);
    let (id, flags, qdcount, ancount, nscount, arcount) =
        (field(0), field(1), field(2), field(3), field(4), field(5));

    let is_response = flags >> 15 & 0x1 == 1;
    let opcode = flags >> 11 & 0xF;
    let rcode = flags & 0xF;

    metadata.insert("transaction_id".into(), id.into());
    metadata.insert("query_count".into(), qdcount.into());
    metadata.insert("answer_count".into(), ancount.into());
    metadata.insert("authority_count".into(), nscount.into());
    metadata.insert("additional_count".into(), arcount.into());
    metadata.insert("is_response".into(), is_response.into());
    metadata.insert("opcode".into(), opcode.into());
    metadata.insert("opcode_name".into(), opcode_name(opcode).into());
    metadata.insert("authoritative".into(), (flags >> 10 & 0x1 == 1).into());
    metadata.insert("truncated".into(), (flags >> 9 & 0x1 == 1).into());
    metadata.insert("recursion_desired".into(), (flags >> 8 & 0x1 == 1).into());
    metadata.insert("recursion_available".into(), (flags >> 7 & 0x1 == 1).into());
    metadata.insert("z".into(), (flags >> 4 & 0x7).into());
    metadata.insert("response_code".into(), rcode.into());
    metadata.insert("response_code_name".into(), rcode_name(rcode).into());

    if qdcount > 0 {
        if let Err(e) = parse_question(data, &mut metadata) {
            metadata.insert("parse_error".into(), e.0.into());
            return metadata;
        }
    }

    if is_response && ancount > 0 {
        let mut offset = HEADER_LEN;
        for _ in 0..qdcount {
            offset = skip_name(data, offset) + 4;
        }
        tracing::trace!(answers_offset = offset, "Located DNS answer section");
        metadata.insert(
            "answers_parsed".into(),
            ancount.min(MAX_ANSWERS_REPORTED).into(),
        );
    }

    metadata
}

pub struct DnsHandler {
    context: SessionContext,
    interceptor: Interceptor,
    socket: Option<Arc<UdpSocket>>,
    local_addr: SocketAddr,
    upstream: Option<UdpSocket>,
    upstream_addr: Option<SocketAddr>,
}

impl DnsHandler {
    /// Registry constructor.
    pub fn create(client: ClientEndpoint, context: SessionContext) -> SessionResult<Handler> {
        let socket = client.into_udp()?;
        let local_addr = socket.local_addr()?;
        let interceptor = context.interceptor::<Self>();
        Ok(Handler::Dns(Self {
            context,
            interceptor,
            socket: Some(socket),
            local_addr,
            upstream: None,
            upstream_addr: None,
        }))
    }

    fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.context.settings.reply_timeout_secs.max(1))
    }

    /// Wait for the resolver reply matching `txid`, discarding stale ones.
    async fn await_reply(
        upstream: &UdpSocket,
        txid: Option<[u8; 2]>,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<usize>, std::io::Error> {
        let matching = async {
            loop {
                let n = upstream.recv(buf).await?;
                match txid {
                    Some(txid) if n < 2 || buf[..2] != txid => {
                        tracing::debug!(length = n, "Discarding stale resolver reply");
                    }
                    _ => return Ok::<usize, std::io::Error>(n),
                }
            }
        };
        match tokio::time::timeout(timeout, matching).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }
}

impl ProtocolHandler for DnsHandler {
    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Dns
    }

    fn parse_packet(data: &[u8], _direction: Direction) -> Metadata {
        parse_message(data)
    }

    async fn setup_upstream(&mut self) -> SessionResult<()> {
        let target = self
            .context
            .target()
            .ok_or_else(|| SessionError::ProtocolViolation("no DNS resolver configured".into()))?;
        let authority = target.authority();
        let unreachable = |source| SessionError::UpstreamUnreachable {
            addr: authority.clone(),
            source,
        };

        let resolver = tokio::net::lookup_host(&authority)
            .await
            .map_err(unreachable)?
            .next()
            .ok_or_else(|| {
                unreachable(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "resolver address did not resolve",
                ))
            })?;

        let bind: SocketAddr = if resolver.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let upstream = UdpSocket::bind(bind).await?;
        upstream.connect(resolver).await.map_err(unreachable)?;

        tracing::info!(
            listen = %self.local_addr,
            resolver = %resolver,
            "DNS relay ready"
        );
        self.upstream = Some(upstream);
        self.upstream_addr = Some(resolver);
        Ok(())
    }

    async fn relay_loop(&mut self) -> SessionResult<()> {
        let (Some(socket), Some(upstream), Some(resolver)) =
            (self.socket.clone(), self.upstream.as_ref(), self.upstream_addr)
        else {
            return Ok(());
        };
        let reply_timeout = self.reply_timeout();
        let size = self.context.settings.buffer_size.clamp(512, MAX_DATAGRAM);
        let mut query_buf = vec![0u8; size];
        let mut reply_buf = vec![0u8; size];
        let mut shutdown = self.context.shutdown.clone();

        loop {
            let (n, client) = tokio::select! {
                received = socket.recv_from(&mut query_buf) => received?,
                _ = shutdown.recv() => return Ok(()),
            };

            let Some(query) = self
                .interceptor
                .intercept(
                    query_buf[..n].to_vec(),
                    Direction::ClientToServer,
                    client,
                    resolver,
                    &mut shutdown,
                )
                .await
            else {
                continue;
            };

            if let Err(e) = upstream.send(&query).await {
                tracing::warn!(client = %client, error = %e, "Failed to forward DNS query");
                continue;
            }

            let txid = query.get(..2).map(|id| [id[0], id[1]]);
            let reply = tokio::select! {
                reply = Self::await_reply(upstream, txid, &mut reply_buf, reply_timeout) => reply,
                _ = shutdown.recv() => return Ok(()),
            };
            let n = match reply {
                Ok(Some(n)) => n,
                Ok(None) => {
                    tracing::warn!(
                        client = %client,
                        timeout_secs = reply_timeout.as_secs(),
                        "DNS resolver did not reply in time"
                    );
                    continue;
                }
                Err(e) => {
                    tracing::warn!(client = %client, error = %e, "DNS resolver read failed");
                    continue;
                }
            };

            let Some(reply) = self
                .interceptor
                .intercept(
                    reply_buf[..n].to_vec(),
                    Direction::ServerToClient,
                    resolver,
                    client,
                    &mut shutdown,
                )
                .await
            else {
                continue;
            };

            if let Err(e) = socket.send_to(&reply, client).await {
                tracing::warn!(client = %client, error = %e, "Failed to return DNS reply");
            }
        }
    }

    async fn cleanup(&mut self) {
        // UDP has no close handshake; dropping releases the resolver socket.
        // The listening socket stays with the listener.
        self.upstream.take();
        self.socket.take();
        tracing::debug!(listen = %self.local_addr, "DNS relay stopped");
    }
}
