//! FTP control-channel proxying with optional passive data-channel capture.
//!
//! The control connection is relayed line-agnostically. Announced addresses
//! are not rewritten, so clients open passive data connections to the server
//! directly. With `capture_data_channel` set, the handler instead connects to
//! each `227` endpoint itself and captures what the server sends there,
//! tagged `channel: "data"`; a server that accepts one connection per
//! passive port then serves the proxy, not the client. Active mode (`PORT`)
//! is reported but not proxied.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::inspect::Interceptor;
use crate::lifecycle::ShutdownSignal;
use crate::protocols::{
    fold_parse, ClientEndpoint, Direction, Handler, Metadata, ParseError, ProtocolHandler,
    ProtocolKind,
};
use crate::session::relay::{close_stream, relay, Endpoints, Framer};
use crate::session::upstream::connect_upstream;
use crate::session::{SessionContext, SessionError, SessionResult};

const MASKED_PASSWORD: &str = "********";

/// Parse `h1,h2,h3,h4,p1,p2`, optionally wrapped in parentheses.
pub fn parse_host_port(text: &str) -> Option<SocketAddrV4> {
    let inner = match (text.find('('), text.find(')')) {
        (Some(open), Some(close)) if open < close => &text[open + 1..close],
        _ => text,
    };

    let fields: Vec<u8> = inner
        .trim()
        .split(',')
        .map(|field| field.trim().parse::<u8>())
        .collect::<Result<_, _>>()
        .ok()?;
    let &[h1, h2, h3, h4, p1, p2] = fields.as_slice() else {
        return None;
    };

    let port = u16::from(p1) * 256 + u16::from(p2);
    Some(SocketAddrV4::new(Ipv4Addr::new(h1, h2, h3, h4), port))
}

fn response_type(code: &str) -> Option<&'static str> {
    match code.as_bytes().first()? {
        b'1' => Some("preliminary"),
        b'2' => Some("completion"),
        b'3' => Some("intermediate"),
        b'4' => Some("transient_negative"),
        b'5' => Some("permanent_negative"),
        _ => None,
    }
}

/// Parse the first command line of a chunk. Pipelined lines are counted,
/// not parsed.
fn parse_command(text: &str) -> Result<Metadata, ParseError> {
    let mut lines = text.lines().map(str::trim).filter(|line| !line.is_empty());
    let Some(text) = lines.next() else {
        return Err(ParseError::new("empty command line"));
    };

    let mut metadata = Metadata::new();
    let pipelined = lines.count();
    if pipelined > 0 {
        metadata.insert("pipelined_commands".into(), pipelined.into());
    }
    let (command, argument) = match text.split_once(' ') {
        Some((command, argument)) => (command.to_ascii_uppercase(), Some(argument)),
        None => (text.to_ascii_uppercase(), None),
    };
    metadata.insert("command".into(), command.as_str().into());
    if let Some(argument) = argument {
        metadata.insert("argument".into(), argument.into());
    }

    match command.as_str() {
        "USER" => {
            metadata.insert("username".into(), argument.unwrap_or_default().into());
        }
        "PASS" => {
            // The argument is the password itself.
            metadata.insert("argument".into(), MASKED_PASSWORD.into());
            metadata.insert("password".into(), MASKED_PASSWORD.into());
        }
        "CWD" | "CDUP" | "PWD" => {
            metadata.insert("directory_operation".into(), true.into());
        }
        "RETR" | "STOR" | "LIST" | "NLST" => {
            metadata.insert("data_channel_operation".into(), true.into());
            if let (true, Some(filename)) = (command == "RETR" || command == "STOR", argument) {
                metadata.insert("filename".into(), filename.into());
            }
        }
        "PORT" => {
            if let Some(addr) = argument.and_then(parse_host_port) {
                metadata.insert("active_ip".into(), addr.ip().to_string().into());
                metadata.insert("active_port".into(), addr.port().into());
            }
        }
        _ => {}
    }
    Ok(metadata)
}

fn parse_reply(text: &str) -> Result<Metadata, ParseError> {
    let code = text.get(..3).filter(|c| c.bytes().all(|b| b.is_ascii_digit()));
    let Some(code) = code else {
        return Err(ParseError::new("reply does not start with a status code"));
    };

    let mut metadata = Metadata::new();
    metadata.insert("response_code".into(), code.into());
    let message = text[3..].trim_start_matches(['-', ' ']);
    if !message.is_empty() {
        metadata.insert("response_message".into(), message.into());
    }
    if let Some(kind) = response_type(code) {
        metadata.insert("response_type".into(), kind.into());
    }

    if code == "227" {
        if let Some(addr) = parse_host_port(text) {
            metadata.insert("passive_ip".into(), addr.ip().to_string().into());
            metadata.insert("passive_port".into(), addr.port().into());
        }
    }
    Ok(metadata)
}

fn lines(chunk: &[u8]) -> impl Iterator<Item = String> + '_ {
    chunk
        .split(|&b| b == b'\n')
        .map(|line| String::from_utf8_lossy(line).trim().to_string())
        .filter(|line| !line.is_empty())
}

/// Client-side framer: reports active-mode requests.
struct CommandWatch;

impl Framer for CommandWatch {
    fn feed(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        Some(data.to_vec())
    }

    fn forwarded(&mut self, chunk: &[u8]) {
        for line in lines(chunk) {
            let Some((command, argument)) = line.split_once(' ') else {
                continue;
            };
            if command.eq_ignore_ascii_case("PORT") {
                tracing::warn!(
                    active = ?parse_host_port(argument),
                    "Active mode data channel requested; not proxied"
                );
            }
        }
    }
}

/// Server-side framer: reports passive-mode announcements and, when data
/// capture is on, hands them to the data channel driver.
struct ReplyWatch {
    passive: Option<mpsc::Sender<SocketAddr>>,
}

impl Framer for ReplyWatch {
    fn feed(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        Some(data.to_vec())
    }

    fn forwarded(&mut self, chunk: &[u8]) {
        for line in lines(chunk) {
            if !line.starts_with("227") {
                continue;
            }
            match parse_host_port(&line) {
                Some(addr) => {
                    tracing::info!(passive = %addr, "FTP passive mode");
                    let Some(passive) = &self.passive else {
                        continue;
                    };
                    if passive.try_send(SocketAddr::V4(addr)).is_err() {
                        tracing::warn!(passive = %addr, "Data channel driver busy; announcement skipped");
                    }
                }
                None => tracing::warn!(reply = %line, "Malformed passive mode reply"),
            }
        }
    }
}

/// Capture everything the server sends on one passive data connection.
pub async fn tap_data_channel(
    addr: SocketAddr,
    client_addr: SocketAddr,
    interceptor: Interceptor,
    connect_timeout: Duration,
    buffer_size: usize,
    mut shutdown: ShutdownSignal,
) {
    let mut stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::warn!(passive = %addr, error = %e, "Failed to open FTP data channel");
            return;
        }
        Err(_) => {
            tracing::warn!(passive = %addr, "Timed out opening FTP data channel");
            return;
        }
    };
    tracing::info!(passive = %addr, "FTP data channel established");

    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        let read = tokio::select! {
            read = stream.read(&mut buf) => read,
            _ = shutdown.recv() => break,
        };
        match read {
            Ok(0) => break,
            Ok(n) => {
                // The client has no connection of ours to receive these.
                let _ = interceptor
                    .intercept(
                        buf[..n].to_vec(),
                        Direction::ServerToClient,
                        addr,
                        client_addr,
                        &mut shutdown,
                    )
                    .await;
            }
            Err(e) => {
                tracing::debug!(passive = %addr, error = %e, "FTP data channel read failed");
                break;
            }
        }
    }
    tracing::info!(passive = %addr, "FTP data channel closed");
}

pub struct FtpHandler {
    context: SessionContext,
    interceptor: Interceptor,
    client: Option<TcpStream>,
    client_addr: SocketAddr,
    upstream: Option<TcpStream>,
    upstream_addr: Option<SocketAddr>,
}

impl FtpHandler {
    /// Registry constructor.
    pub fn create(client: ClientEndpoint, context: SessionContext) -> SessionResult<Handler> {
        let (stream, peer) = client.into_tcp()?;
        let interceptor = context.interceptor::<Self>();
        Ok(Handler::Ftp(Self {
            context,
            interceptor,
            client: Some(stream),
            client_addr: peer,
            upstream: None,
            upstream_addr: None,
        }))
    }

    /// Drive passive data channels announced on the control connection.
    /// A newer announcement replaces the current channel.
    async fn drive_data_channels(
        mut announcements: mpsc::Receiver<SocketAddr>,
        client_addr: SocketAddr,
        interceptor: Interceptor,
        context: SessionContext,
    ) {
        let mut current: Option<BoxFuture<'static, ()>> = None;
        loop {
            tokio::select! {
                next = announcements.recv() => match next {
                    Some(addr) => {
                        if current.is_some() {
                            tracing::info!(passive = %addr, "Replacing FTP data channel");
                        }
                        current = Some(Box::pin(tap_data_channel(
                            addr,
                            client_addr,
                            interceptor.clone(),
                            context.connect_timeout,
                            context.settings.buffer_size,
                            context.shutdown.clone(),
                        )));
                    }
                    None => return,
                },
                _ = async {
                    if let Some(channel) = current.as_mut() {
                        channel.await;
                    }
                }, if current.is_some() => {
                    current = None;
                }
            }
        }
    }
}

impl ProtocolHandler for FtpHandler {
    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Ftp
    }

    fn parse_packet(data: &[u8], direction: Direction) -> Metadata {
        let text = String::from_utf8_lossy(data);
        let text = text.trim();
        fold_parse(match direction {
            Direction::ClientToServer => parse_command(text),
            Direction::ServerToClient => parse_reply(text),
        })
    }

    async fn setup_upstream(&mut self) -> SessionResult<()> {
        let target = self
            .context
            .target()
            .ok_or_else(|| SessionError::ProtocolViolation("no FTP target configured".into()))?;
        let authority = target.authority();

        let mut shutdown = self.context.shutdown.clone();
        let mut upstream = connect_upstream(
            &authority,
            self.context.connect_timeout,
            &self.context.retries,
            &mut shutdown,
        )
        .await?;
        let upstream_addr = upstream.peer_addr()?;
        tracing::info!(upstream = %authority, "FTP control connection established");

        let mut buf = vec![0u8; self.context.settings.buffer_size.max(1)];
        let n = tokio::select! {
            read = tokio::time::timeout(self.context.connect_timeout, upstream.read(&mut buf)) => match read {
                Ok(read) => read?,
                Err(_) => return Err(SessionError::ProtocolViolation("no welcome banner from upstream".into())),
            },
            _ = shutdown.recv() => return Ok(()),
        };
        if n == 0 {
            return Err(SessionError::ProtocolViolation(
                "upstream closed before welcome banner".into(),
            ));
        }

        let banner = self
            .interceptor
            .intercept(
                buf[..n].to_vec(),
                Direction::ServerToClient,
                upstream_addr,
                self.client_addr,
                &mut shutdown,
            )
            .await;
        if let (Some(banner), Some(client)) = (banner, self.client.as_mut()) {
            client.write_all(&banner).await?;
        }

        self.upstream = Some(upstream);
        self.upstream_addr = Some(upstream_addr);
        Ok(())
    }

    async fn relay_loop(&mut self) -> SessionResult<()> {
        let (Some(client), Some(upstream), Some(upstream_addr)) =
            (self.client.as_mut(), self.upstream.as_mut(), self.upstream_addr)
        else {
            return Ok(());
        };
        let endpoints = Endpoints {
            client: self.client_addr,
            upstream: upstream_addr,
        };

        let capture = self.context.settings.capture_data_channel;
        let (passive_tx, passive_rx) = mpsc::channel(4);
        let data_channels = Self::drive_data_channels(
            passive_rx,
            self.client_addr,
            self.interceptor.with_tag("channel", "data"),
            self.context.clone(),
        );
        let data_channels = async move {
            if capture {
                data_channels.await;
            } else {
                std::future::pending::<()>().await;
            }
        };
        let control = relay(
            client,
            upstream,
            CommandWatch,
            ReplyWatch {
                passive: capture.then_some(passive_tx),
            },
            &self.interceptor,
            endpoints,
            self.context.settings.buffer_size,
            &self.context.shutdown,
        );

        // The data channel lives exactly as long as the control relay.
        tokio::select! {
            result = control => result,
            _ = data_channels => Ok(()),
        }
    }

    async fn cleanup(&mut self) {
        close_stream(&mut self.upstream).await;
        close_stream(&mut self.client).await;
    }
}
