//! Telnet relaying with option-negotiation framing.
//!
//! Command sequences may straddle TCP reads, so each direction keeps an
//! accumulation buffer and only emits bytes that tokenize cleanly.

use std::net::SocketAddr;

use tokio::net::TcpStream;

use crate::inspect::Interceptor;
use crate::protocols::{ClientEndpoint, Direction, Handler, Metadata, ProtocolHandler, ProtocolKind};
use crate::session::relay::{close_stream, relay, Endpoints, Framer};
use crate::session::upstream::connect_upstream;
use crate::session::{SessionContext, SessionError, SessionResult};

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const SE: u8 = 240;

const MAX_TRACED_COMMANDS: usize = 10;
/// Floor for the per-direction hold-back buffer.
const MIN_PENDING_LIMIT: usize = 64 * 1024;
const PREVIEW_CHARS: usize = 100;

fn is_negotiation(command: u8) -> bool {
    matches!(command, DO | DONT | WILL | WONT)
}

fn command_name(command: u8) -> String {
    match command {
        DO => "DO".into(),
        DONT => "DONT".into(),
        WILL => "WILL".into(),
        WONT => "WONT".into(),
        SB => "SB".into(),
        SE => "SE".into(),
        n => n.to_string(),
    }
}

fn option_name(option: u8) -> String {
    match option {
        1 => "ECHO".into(),
        3 => "SGA".into(),
        24 => "TERM_TYPE".into(),
        31 => "NAWS".into(),
        32 => "TERM_SPEED".into(),
        34 => "LINEMODE".into(),
        36 => "ENV_VARS".into(),
        n => n.to_string(),
    }
}

/// Index of the `IAC SE` that closes a subnegotiation, searching from `from`.
fn find_subnegotiation_end(buffer: &[u8], from: usize) -> Option<usize> {
    buffer
        .get(from..)?
        .windows(2)
        .position(|pair| pair == [IAC, SE])
        .map(|pos| from + pos)
}

/// Split `buffer` into the prefix that tokenizes cleanly and the tail that
/// needs more bytes.
///
/// The tail starts at an unterminated `IAC SB`, a trailing lone `IAC`, or a
/// negotiation still missing its option byte.
pub fn process_commands(buffer: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut i = 0;
    while i < buffer.len() {
        if buffer[i] != IAC {
            i += 1;
            continue;
        }
        let Some(&command) = buffer.get(i + 1) else {
            break;
        };

        if is_negotiation(command) {
            let Some(&option) = buffer.get(i + 2) else {
                break;
            };
            tracing::debug!(
                command = %command_name(command),
                option = %option_name(option),
                "Telnet negotiation"
            );
            i += 3;
        } else if command == SB {
            let Some(end) = find_subnegotiation_end(buffer, i + 2) else {
                break;
            };
            tracing::debug!(length = end + 2 - i, "Telnet subnegotiation");
            i = end + 2;
        } else {
            tracing::trace!(command = %command_name(command), "Telnet command");
            i += 2;
        }
    }
    (buffer[..i].to_vec(), buffer[i..].to_vec())
}

/// Human-readable trace of the commands in a chunk.
fn trace_commands(data: &[u8]) -> Vec<String> {
    let mut commands = Vec::new();
    let mut i = 0;
    while i < data.len() {
        if data[i] != IAC || i + 1 >= data.len() {
            i += 1;
            continue;
        }
        let command = data[i + 1];

        if is_negotiation(command) && i + 2 < data.len() {
            commands.push(format!(
                "IAC {} {}",
                command_name(command),
                option_name(data[i + 2])
            ));
            i += 3;
        } else if command == SB && i + 2 < data.len() {
            let option = option_name(data[i + 2]);
            match find_subnegotiation_end(data, i + 3) {
                Some(end) => {
                    commands.push(format!(
                        "IAC SB {} {} IAC SE",
                        option,
                        hex::encode(&data[i + 3..end])
                    ));
                    i = end + 2;
                }
                None => {
                    commands.push(format!("IAC SB {} [incomplete]", option));
                    i = data.len();
                }
            }
        } else {
            commands.push(format!("IAC {}", command_name(command)));
            i += 2;
        }
    }
    commands
}

fn text_preview(data: &[u8]) -> Option<String> {
    let displayable: String = data
        .iter()
        .filter(|&&b| (32..127).contains(&b) || matches!(b, b'\t' | b'\n' | b'\r'))
        .map(|&b| b as char)
        .collect();
    let text = displayable.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.is_empty() {
        return None;
    }
    if text.len() > PREVIEW_CHARS {
        Some(format!("{}...", &text[..PREVIEW_CHARS]))
    } else {
        Some(text)
    }
}

/// Decode a Telnet chunk into a command trace and text preview.
pub fn parse_chunk(data: &[u8]) -> Metadata {
    let mut metadata = Metadata::new();
    let commands = trace_commands(data);

    metadata.insert("command_count".into(), commands.len().into());
    if !commands.is_empty() {
        if commands.len() > MAX_TRACED_COMMANDS {
            metadata.insert(
                "additional_commands".into(),
                (commands.len() - MAX_TRACED_COMMANDS).into(),
            );
        }
        let traced: Vec<_> = commands.into_iter().take(MAX_TRACED_COMMANDS).collect();
        metadata.insert("commands".into(), traced.into());
    }
    if let Some(preview) = text_preview(data) {
        metadata.insert("text_preview".into(), preview.into());
    }
    metadata
}

/// Per-direction accumulator that holds back incomplete sequences.
///
/// At most `limit` bytes are held; past that the tail is forwarded as-is.
#[derive(Debug)]
pub struct TelnetFramer {
    pending: Vec<u8>,
    limit: usize,
    /// Where to resume looking for `IAC SE` while `pending` is an open
    /// subnegotiation.
    resume_at: Option<usize>,
}

impl TelnetFramer {
    /// Framer sized for reads of `buffer_size` bytes.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            pending: Vec::new(),
            limit: buffer_size.saturating_mul(16).max(MIN_PENDING_LIMIT),
            resume_at: None,
        }
    }
}

impl Framer for TelnetFramer {
    fn feed(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        let resume_at = self.resume_at.take();
        self.pending.extend_from_slice(data);

        let still_open =
            resume_at.is_some_and(|from| find_subnegotiation_end(&self.pending, from).is_none());
        let mut emit = Vec::new();
        if !still_open {
            let (ready, remainder) = process_commands(&self.pending);
            emit = ready;
            self.pending = remainder;
        }

        if self.pending.len() > self.limit {
            tracing::warn!(
                held = self.pending.len(),
                limit = self.limit,
                "Unterminated Telnet sequence over limit; forwarding unframed"
            );
            emit.append(&mut self.pending);
        } else if self.pending.starts_with(&[IAC, SB]) {
            // The last byte may be the IAC of a split IAC SE.
            self.resume_at = Some(self.pending.len().saturating_sub(1).max(2));
        }
        (!emit.is_empty()).then_some(emit)
    }
}

pub struct TelnetHandler {
    context: SessionContext,
    interceptor: Interceptor,
    client: Option<TcpStream>,
    client_addr: SocketAddr,
    upstream: Option<TcpStream>,
    upstream_addr: Option<SocketAddr>,
}

impl TelnetHandler {
    /// Registry constructor.
    pub fn create(client: ClientEndpoint, context: SessionContext) -> SessionResult<Handler> {
        let (stream, peer) = client.into_tcp()?;
        let interceptor = context.interceptor::<Self>();
        Ok(Handler::Telnet(Self {
            context,
            interceptor,
            client: Some(stream),
            client_addr: peer,
            upstream: None,
            upstream_addr: None,
        }))
    }
}

impl ProtocolHandler for TelnetHandler {
    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Telnet
    }

    fn parse_packet(data: &[u8], _direction: Direction) -> Metadata {
        parse_chunk(data)
    }

    async fn setup_upstream(&mut self) -> SessionResult<()> {
        let target = self
            .context
            .target()
            .ok_or_else(|| SessionError::ProtocolViolation("no Telnet target configured".into()))?;
        let authority = target.authority();

        let mut shutdown = self.context.shutdown.clone();
        let upstream = connect_upstream(
            &authority,
            self.context.connect_timeout,
            &self.context.retries,
            &mut shutdown,
        )
        .await?;
        self.upstream_addr = Some(upstream.peer_addr()?);
        self.upstream = Some(upstream);
        tracing::info!(upstream = %authority, "Telnet connection established");
        Ok(())
    }

    async fn relay_loop(&mut self) -> SessionResult<()> {
        let (Some(client), Some(upstream), Some(upstream_addr)) =
            (self.client.as_mut(), self.upstream.as_mut(), self.upstream_addr)
        else {
            return Ok(());
        };
        relay(
            client,
            upstream,
            TelnetFramer::new(self.context.settings.buffer_size),
            TelnetFramer::new(self.context.settings.buffer_size),
            &self.interceptor,
            Endpoints {
                client: self.client_addr,
                upstream: upstream_addr,
            },
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

    #[test]
    fn plain_text_passes_through() {
        let (emit, remainder) = process_commands(b"login: ");
        assert_eq!(emit, b"login: ");
        assert!(remainder.is_empty());
    }

    #[test]
    fn negotiation_and_single_commands_pass_intact() {
        let input = [IAC, DO, 1, b'h', b'i', IAC, 241, IAC, WILL, 3];
        let (emit, remainder) = process_commands(&input);
        assert_eq!(emit, input);
        assert!(remainder.is_empty());
    }

    #[test]
    fn incomplete_sequences_are_retained() {
        let (emit, remainder) = process_commands(&[b'a', IAC]);
        assert_eq!((emit.as_slice(), remainder.as_slice()), (&b"a"[..], &[IAC][..]));

        let (emit, remainder) = process_commands(&[IAC, WONT]);
        assert!(emit.is_empty());
        assert_eq!(remainder, [IAC, WONT]);

        let input = [b'x', IAC, SB, 31, 0, 80, IAC, DO, 1];
        let (emit, remainder) = process_commands(&input);
        assert_eq!(emit, b"x");
        assert_eq!(remainder, &input[1..]);
    }

    #[test]
    fn subnegotiation_straddling_reads_is_emitted_once() {
        let mut framer = TelnetFramer::new(4096);
        let first = [b'o', b'k', IAC, SB, 31, 0, 80];
        let second = [0, 24, IAC, SE, b'!'];

        assert_eq!(framer.feed(&first), Some(b"ok".to_vec()));
        assert_eq!(
            framer.feed(&second),
            Some(vec![IAC, SB, 31, 0, 80, 0, 24, IAC, SE, b'!'])
        );
        assert!(framer.pending.is_empty());
    }

    #[test]
    fn framer_emits_nothing_until_sequence_completes() {
        let mut framer = TelnetFramer::new(4096);
        assert_eq!(framer.feed(&[IAC, SB, 24, 1]), None);
        assert_eq!(framer.feed(&[IAC, SE]), Some(vec![IAC, SB, 24, 1, IAC, SE]));
    }

    #[test]
    fn split_subnegotiation_end_is_found() {
        let mut framer = TelnetFramer::new(4096);
        assert_eq!(framer.feed(&[IAC, SB, 24, 0, b'x', IAC]), None);
        assert_eq!(framer.feed(&[b'y']), None);
        assert_eq!(framer.feed(&[IAC]), None);
        assert_eq!(
            framer.feed(&[SE, b'z']),
            Some(vec![IAC, SB, 24, 0, b'x', IAC, b'y', IAC, SE, b'z'])
        );
        assert!(framer.pending.is_empty());
        assert!(framer.resume_at.is_none());
    }

    #[test]
    fn unterminated_subnegotiation_is_flushed_at_limit() {
        let mut framer = TelnetFramer::new(1024);
        assert_eq!(framer.limit, MIN_PENDING_LIMIT);

        assert_eq!(framer.feed(&[b'a', IAC, SB, 24]), Some(b"a".to_vec()));
        let chunk = vec![b'.'; 4096];
        let mut emitted = Vec::new();
        for _ in 0..32 {
            if let Some(out) = framer.feed(&chunk) {
                emitted.extend(out);
            }
            assert!(framer.pending.len() <= framer.limit);
        }

        // Everything held back is released unchanged, in order.
        assert!(emitted.len() > MIN_PENDING_LIMIT);
        assert_eq!(&emitted[..3], &[IAC, SB, 24]);
        assert!(emitted[3..].iter().all(|&b| b == b'.'));
        assert_eq!(emitted.len() + framer.pending.len(), 3 + 32 * 4096);

        // Framing resumes normally afterwards.
        assert_eq!(framer.feed(&[IAC, DO, 1]), Some(vec![IAC, DO, 1]));
    }

    #[test]
    fn limit_scales_with_buffer_size() {
        assert_eq!(TelnetFramer::new(8192).limit, 8192 * 16);
    }

    #[test]
    fn trace_names_commands_and_options() {
        let data = [IAC, DO, 1, IAC, SB, 31, 0, 80, 0, 24, IAC, SE, IAC, WILL, 99, IAC, 241];
        let metadata = parse_chunk(&data);
        assert_eq!(metadata["command_count"], 4);
        assert_eq!(
            metadata["commands"],
            serde_json::json!([
                "IAC DO ECHO",
                "IAC SB NAWS 00500018 IAC SE",
                "IAC WILL 99",
                "IAC 241"
            ])
        );
        assert!(!metadata.contains_key("text_preview"));
    }

    #[test]
    fn trace_reports_incomplete_subnegotiation() {
        let metadata = parse_chunk(&[IAC, SB, 24, 1, 2]);
        assert_eq!(metadata["commands"][0], "IAC SB TERM_TYPE [incomplete]");
    }

    #[test]
    fn trace_is_capped_at_ten_commands() {
        let data: Vec<u8> = (0..12).flat_map(|_| [IAC, WONT, 3]).collect();
        let metadata = parse_chunk(&data);
        assert_eq!(metadata["command_count"], 12);
        assert_eq!(metadata["commands"].as_array().map(Vec::len), Some(10));
        assert_eq!(metadata["additional_commands"], 2);
    }

    #[test]
    fn preview_strips_control_bytes_and_collapses_whitespace() {
        let metadata = parse_chunk(b"\x1b[1mWelcome\r\n\r\n  to   host\x07\r\n");
        assert_eq!(metadata["text_preview"], "[1mWelcome to host");
        assert_eq!(metadata["command_count"], 0);

        let long = "a".repeat(150);
        let metadata = parse_chunk(long.as_bytes());
        let preview = metadata["text_preview"].as_str().unwrap();
        assert_eq!(preview.len(), 103);
        assert!(preview.ends_with("..."));
    }
}
