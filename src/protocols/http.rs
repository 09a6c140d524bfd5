//! HTTP proxying, including `CONNECT` tunnels.
//!
//! The handler reads the client's header block first to learn where to
//! connect. Plain requests are forwarded upstream once and the relay takes
//! over; `CONNECT` requests get a `200 Connection Established` reply and the
//! tunnel is relayed opaquely. A `CONNECT` head dropped by inspection gets no
//! reply and ends the session.

use std::net::SocketAddr;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use url::Url;

use crate::inspect::Interceptor;
use crate::protocols::{
    fold_parse, ClientEndpoint, Direction, Handler, Metadata, ParseError, ProtocolHandler,
    ProtocolKind,
};
use crate::session::relay::{close_stream, relay, Endpoints, Passthrough};
use crate::session::upstream::connect_upstream;
use crate::session::{SessionContext, SessionError, SessionResult};

/// Upper bound on the buffered request head.
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

const HEADER_END: &[u8] = b"\r\n\r\n";
const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const PREVIEW_BYTES: usize = 100;

/// Where a request wants to go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTarget {
    pub host: String,
    pub port: u16,
    /// `CONNECT` tunnel rather than a plain request.
    pub tunnel: bool,
}

impl RequestTarget {
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn target_from_url(url: &str, tunnel: bool) -> Option<RequestTarget> {
    let url = Url::parse(url).ok()?;
    Some(RequestTarget {
        host: url.host_str()?.to_string(),
        port: url.port_or_known_default()?,
        tunnel,
    })
}

/// Work out the upstream from a request head.
///
/// `CONNECT host[:port]` defaults to 443, a `Host` header to 80, and an
/// absolute-URI request line to the scheme's port.
pub fn resolve_target(head: &[u8]) -> Option<RequestTarget> {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.split(' ');
    let method = parts.next()?;
    let uri = parts.next().unwrap_or_default();

    if method == "CONNECT" {
        return target_from_url(&format!("https://{}", uri), true);
    }

    let host = lines
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("host"))
        .map(|(_, value)| value.trim());
    if let Some(host) = host.filter(|h| !h.is_empty()) {
        return target_from_url(&format!("http://{}", host), false);
    }

    if uri.starts_with("http://") || uri.starts_with("https://") {
        return target_from_url(uri, false);
    }
    None
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Metadata {
    let mut headers = Metadata::new();
    for line in lines.take_while(|line| !line.is_empty()) {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_string(), Value::from(value.trim()));
        }
    }
    headers
}

fn is_textual(content_type: &str) -> bool {
    let content_type = content_type.to_ascii_lowercase();
    content_type.starts_with("text/")
        || content_type.starts_with("application/json")
        || content_type.starts_with("application/xml")
}

fn parse_message(data: &[u8], direction: Direction) -> Result<Metadata, ParseError> {
    let head_end = find(data, HEADER_END).unwrap_or(data.len());
    let head = std::str::from_utf8(&data[..head_end])
        .map_err(|_| ParseError::new("message head is not valid UTF-8"))?;

    let mut metadata = Metadata::new();
    let mut lines = head.split("\r\n");
    let start_line = lines.next().unwrap_or_default();

    match direction {
        Direction::ClientToServer => {
            let parts: Vec<&str> = start_line.split(' ').collect();
            if parts.len() >= 3 {
                metadata.insert("method".into(), parts[0].into());
                metadata.insert("path".into(), parts[1].into());
                metadata.insert("version".into(), parts[2].into());
            }
        }
        Direction::ServerToClient => {
            let parts: Vec<&str> = start_line.splitn(3, ' ').collect();
            if parts.len() == 3 {
                metadata.insert("version".into(), parts[0].into());
                metadata.insert("status_code".into(), parts[1].into());
                metadata.insert("status_message".into(), parts[2].into());
            }
        }
    }

    let headers = parse_headers(lines);
    let content_type = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
        .and_then(|(_, value)| value.as_str())
        .unwrap_or_default()
        .to_string();
    metadata.insert("headers".into(), Value::Object(headers));

    if head_end < data.len() {
        let body = &data[head_end + HEADER_END.len()..];
        metadata.insert("body_length".into(), body.len().into());
        if is_textual(&content_type) {
            let preview = &body[..body.len().min(PREVIEW_BYTES)];
            metadata.insert(
                "body_preview".into(),
                String::from_utf8_lossy(preview).into_owned().into(),
            );
        }
    }
    metadata.insert("content_type".into(), content_type.into());

    Ok(metadata)
}

pub struct HttpHandler {
    context: SessionContext,
    interceptor: Interceptor,
    client: Option<TcpStream>,
    client_addr: SocketAddr,
    upstream: Option<TcpStream>,
    upstream_addr: Option<SocketAddr>,
    target: Option<RequestTarget>,
}

impl HttpHandler {
    /// Registry constructor.
    pub fn create(client: ClientEndpoint, context: SessionContext) -> SessionResult<Handler> {
        let (stream, peer) = client.into_tcp()?;
        let interceptor = context.interceptor::<Self>();
        Ok(Handler::Http(Self {
            context,
            interceptor,
            client: Some(stream),
            client_addr: peer,
            upstream: None,
            upstream_addr: None,
            target: None,
        }))
    }

    async fn read_head(&mut self) -> SessionResult<Vec<u8>> {
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| SessionError::ProtocolViolation("client already closed".into()))?;
        let mut head = Vec::new();
        let mut buf = vec![0u8; self.context.settings.buffer_size.max(1)];
        let mut shutdown = self.context.shutdown.clone();

        let read = async {
            loop {
                let n = client.read(&mut buf).await?;
                if n == 0 {
                    return Err(SessionError::ProtocolViolation(
                        "client closed before completing request headers".into(),
                    ));
                }
                head.extend_from_slice(&buf[..n]);
                if find(&head, HEADER_END).is_some() {
                    return Ok::<(), SessionError>(());
                }
                if head.len() > MAX_HEADER_BYTES {
                    return Err(SessionError::ProtocolViolation(format!(
                        "request headers exceed {} bytes",
                        MAX_HEADER_BYTES
                    )));
                }
            }
        };

        tokio::select! {
            result = tokio::time::timeout(self.context.connect_timeout, read) => match result {
                Ok(result) => result?,
                Err(_) => {
                    return Err(SessionError::ProtocolViolation(
                        "timed out waiting for request headers".into(),
                    ))
                }
            },
            _ = shutdown.recv() => {
                return Err(SessionError::ProtocolViolation("shutdown before request headers".into()))
            }
        }
        Ok(head)
    }
}

impl ProtocolHandler for HttpHandler {
    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Http
    }

    fn parse_packet(data: &[u8], direction: Direction) -> Metadata {
        fold_parse(parse_message(data, direction))
    }

    async fn setup_upstream(&mut self) -> SessionResult<()> {
        let head = self.read_head().await?;

        let target = resolve_target(&head)
            .or_else(|| {
                self.context.target().map(|t| RequestTarget {
                    host: t.host,
                    port: t.port,
                    tunnel: false,
                })
            })
            .ok_or_else(|| {
                SessionError::ProtocolViolation("could not determine target server".into())
            })?;
        tracing::info!(target = %target.authority(), tunnel = target.tunnel, "HTTP connection");

        let mut shutdown = self.context.shutdown.clone();
        let mut upstream = connect_upstream(
            &target.authority(),
            self.context.connect_timeout,
            &self.context.retries,
            &mut shutdown,
        )
        .await?;
        let upstream_addr = upstream.peer_addr()?;
        self.upstream_addr = Some(upstream_addr);

        let inspected = self
            .interceptor
            .intercept(
                head.clone(),
                Direction::ClientToServer,
                self.client_addr,
                upstream_addr,
                &mut shutdown,
            )
            .await;

        if target.tunnel {
            if inspected.is_none() {
                tracing::info!(target = %target.authority(), "CONNECT request dropped; closing tunnel");
                close_stream(&mut Some(upstream)).await;
                return Ok(());
            }
            let client = self
                .client
                .as_mut()
                .ok_or_else(|| SessionError::ProtocolViolation("client already closed".into()))?;
            client.write_all(CONNECT_ESTABLISHED).await?;
            // Bytes the client pipelined after the CONNECT head belong to the tunnel.
            let head_end = find(&head, HEADER_END).map_or(head.len(), |i| i + HEADER_END.len());
            if head_end < head.len() {
                upstream.write_all(&head[head_end..]).await?;
            }
        } else if let Some(request) = inspected {
            upstream.write_all(&request).await?;
        }

        self.upstream = Some(upstream);
        self.target = Some(target);
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

        relay(
            client,
            upstream,
            Passthrough,
            Passthrough,
            &self.interceptor,
            endpoints,
            self.context.settings.buffer_size,
            &self.context.shutdown,
        )
        .await
    }

    async fn cleanup(&mut self) {
        close_stream(&mut self.upstream).await;
        close_stream(&mut self.client).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InspectionConfig, PauseTimeoutAction};
    use crate::session::test_support;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;

    /// Handler bound to the server side of a loopback pair, plus the client.
    async fn handler_pair(context: SessionContext) -> (HttpHandler, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        let Handler::Http(handler) =
            HttpHandler::create(ClientEndpoint::Tcp { stream, peer }, context).unwrap()
        else {
            panic!("registry constructor built the wrong variant");
        };
        (handler, client)
    }

    fn violation(result: SessionResult<()>) -> String {
        match result {
            Err(SessionError::ProtocolViolation(message)) => message,
            other => panic!("expected a protocol violation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn oversized_request_head_is_rejected() {
        let (context, _shutdown) = test_support::context(ProtocolKind::Http);
        let (mut handler, mut client) = handler_pair(context).await;
        tokio::spawn(async move {
            let _ = client.write_all(&vec![b'a'; MAX_HEADER_BYTES + 4096]).await;
            // Hold the socket open until the handler gives up.
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let message = violation(handler.setup_upstream().await);
        assert!(message.contains("exceed"), "{message}");
    }

    #[tokio::test]
    async fn eof_before_blank_line_is_rejected() {
        let (context, _shutdown) = test_support::context(ProtocolKind::Http);
        let (mut handler, mut client) = handler_pair(context).await;
        client.write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n").await.unwrap();
        client.shutdown().await.unwrap();

        let message = violation(handler.setup_upstream().await);
        assert!(message.contains("closed before"), "{message}");
    }

    #[tokio::test]
    async fn request_without_target_is_rejected() {
        let (context, _shutdown) = test_support::context(ProtocolKind::Http);
        let (mut handler, mut client) = handler_pair(context).await;
        client.write_all(b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n").await.unwrap();

        let message = violation(handler.setup_upstream().await);
        assert!(message.contains("target"), "{message}");
        assert!(handler.upstream.is_none());
    }

    #[tokio::test]
    async fn dropped_connect_gets_no_tunnel() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();

        let (context, _shutdown) = test_support::context(ProtocolKind::Http);
        context.services.settings.store(Arc::new(InspectionConfig {
            pause_by_default: true,
            pause_timeout_ms: 50,
            on_pause_timeout: PauseTimeoutAction::Drop,
            ..InspectionConfig::default()
        }));
        let (mut handler, mut client) = handler_pair(context).await;
        client
            .write_all(format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", upstream_addr).as_bytes())
            .await
            .unwrap();

        handler.setup_upstream().await.unwrap();
        assert!(handler.upstream.is_none());
        handler.relay_loop().await.unwrap();
        handler.cleanup().await;

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert!(reply.is_empty(), "client saw {:?}", String::from_utf8_lossy(&reply));
    }

    const REQUEST: &[u8] = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nUser-Agent: Mozilla/5.0\r\nAccept: text/html\r\n\r\n";
    const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 13\r\n\r\nHello, World!";

    #[test]
    fn parses_request_line_and_headers() {
        let metadata = HttpHandler::parse_packet(REQUEST, Direction::ClientToServer);
        assert_eq!(metadata["method"], "GET");
        assert_eq!(metadata["path"], "/index.html");
        assert_eq!(metadata["version"], "HTTP/1.1");
        assert_eq!(metadata["headers"]["Host"], "example.com");
        assert_eq!(metadata["headers"]["User-Agent"], "Mozilla/5.0");
        assert_eq!(metadata["headers"]["Accept"], "text/html");
        assert_eq!(metadata["content_type"], "");
        assert_eq!(metadata["body_length"], 0);
    }

    #[test]
    fn parses_response_with_body() {
        let metadata = HttpHandler::parse_packet(RESPONSE, Direction::ServerToClient);
        assert_eq!(metadata["version"], "HTTP/1.1");
        assert_eq!(metadata["status_code"], "200");
        assert_eq!(metadata["status_message"], "OK");
        assert_eq!(metadata["headers"]["Content-Length"], "13");
        assert_eq!(metadata["content_type"], "text/html");
        assert_eq!(metadata["body_length"], 13);
        assert_eq!(metadata["body_preview"], "Hello, World!");
    }

    #[test]
    fn preview_limited_to_textual_types() {
        let mut png = b"HTTP/1.1 200 OK\r\ncontent-type: image/png\r\n\r\n".to_vec();
        png.extend_from_slice(&[0x89, b'P', b'N', b'G']);
        let metadata = HttpHandler::parse_packet(&png, Direction::ServerToClient);
        assert_eq!(metadata["content_type"], "image/png");
        assert_eq!(metadata["body_length"], 4);
        assert!(!metadata.contains_key("body_preview"));

        let mut json = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n".to_vec();
        json.extend(std::iter::repeat(b'a').take(150));
        let metadata = HttpHandler::parse_packet(&json, Direction::ServerToClient);
        assert_eq!(metadata["body_preview"].as_str().unwrap().len(), 100);
    }

    #[test]
    fn opaque_tunnel_bytes_report_parse_error() {
        let metadata =
            HttpHandler::parse_packet(&[0x16, 0x03, 0x01, 0x02, 0x00, 0xc0, 0xff], Direction::ClientToServer);
        assert!(metadata.contains_key("parse_error"));
    }

    #[test]
    fn resolves_connect_host_and_absolute_uri() {
        let connect = resolve_target(b"CONNECT example.com:8443 HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(connect, RequestTarget { host: "example.com".into(), port: 8443, tunnel: true });

        let connect = resolve_target(b"CONNECT example.com HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(connect.port, 443);

        let host = resolve_target(REQUEST).unwrap();
        assert_eq!(host.authority(), "example.com:80");
        assert!(!host.tunnel);

        let host = resolve_target(b"GET / HTTP/1.1\r\nhost: 127.0.0.1:9000\r\n\r\n").unwrap();
        assert_eq!(host.authority(), "127.0.0.1:9000");

        let absolute = resolve_target(b"GET https://secure.example/a HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(absolute.authority(), "secure.example:443");

        assert!(resolve_target(b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n").is_none());
    }
}
