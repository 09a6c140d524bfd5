//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::protocols::ProtocolKind;

/// Root configuration for the intercepting proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Global listener settings shared by every protocol endpoint.
    pub server: ServerConfig,

    /// Per-protocol listener and upstream settings.
    pub protocols: ProtocolsConfig,

    /// Packet inspection and pause policy.
    pub inspection: InspectionConfig,

    /// Upstream connect retry configuration.
    pub retries: RetryConfig,

    /// Packet export to the search backend.
    pub telemetry: TelemetryConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Control surface settings.
    pub admin: AdminConfig,
}

/// Global server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host every protocol listener binds to.
    pub host: String,

    /// Size of the worker pool shared by all listeners (backpressure).
    pub max_connections: usize,

    /// Upstream connect and handshake timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            max_connections: 100,
            timeout_secs: 30,
        }
    }
}

/// The set of protocol endpoints.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProtocolsConfig {
    pub http: ProtocolConfig,
    pub ftp: ProtocolConfig,
    pub dns: ProtocolConfig,
    pub telnet: ProtocolConfig,
}

impl ProtocolsConfig {
    /// Configuration block for a protocol.
    pub fn get(&self, kind: ProtocolKind) -> &ProtocolConfig {
        match kind {
            ProtocolKind::Http => &self.http,
            ProtocolKind::Ftp => &self.ftp,
            ProtocolKind::Dns => &self.dns,
            ProtocolKind::Telnet => &self.telnet,
        }
    }

    /// Enabled protocols in a stable order.
    pub fn enabled(&self) -> impl Iterator<Item = (ProtocolKind, &ProtocolConfig)> {
        ProtocolKind::ALL
            .into_iter()
            .map(move |kind| (kind, self.get(kind)))
            .filter(|(_, config)| config.enabled)
    }
}

impl Default for ProtocolsConfig {
    fn default() -> Self {
        Self {
            http: ProtocolConfig {
                enabled: true,
                port: 8080,
                ..ProtocolConfig::default()
            },
            ftp: ProtocolConfig::default(),
            dns: ProtocolConfig::default(),
            telnet: ProtocolConfig::default(),
        }
    }
}

/// Settings for one protocol endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Whether a listener is opened for this protocol.
    pub enabled: bool,

    /// Listening port. Required when enabled.
    pub port: u16,

    /// Read buffer size per socket read.
    pub buffer_size: usize,

    /// Which inspection output is attached to captured packets.
    pub inspection_mode: InspectionMode,

    /// Upstream server. Protocol defaults apply when absent; HTTP derives
    /// its target from each request instead.
    pub target: Option<TargetConfig>,

    /// How long the DNS relay waits for a resolver reply.
    pub reply_timeout_secs: u64,

    /// FTP only: open announced passive endpoints from the proxy and capture
    /// what the server sends there. Servers that accept one connection per
    /// passive port then serve the proxy instead of the client.
    pub capture_data_channel: bool,
}

impl ProtocolConfig {
    /// Resolve the upstream target, falling back to the protocol default.
    pub fn target_or_default(&self, kind: ProtocolKind) -> Option<TargetConfig> {
        self.target.clone().or_else(|| kind.default_target())
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 0,
            buffer_size: 4096,
            inspection_mode: InspectionMode::Both,
            target: None,
            reply_timeout_secs: 5,
            capture_data_channel: false,
        }
    }
}

/// Upstream host and port.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TargetConfig {
    pub host: String,
    pub port: u16,
}

impl TargetConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port` form accepted by tokio's resolver.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Inspection output attached to each packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InspectionMode {
    /// Log the packet envelope only.
    Headers,
    /// Attach parsed protocol metadata.
    Parsed,
    /// Envelope and parsed metadata.
    #[default]
    Both,
}

impl InspectionMode {
    pub fn includes_parsed(self) -> bool {
        matches!(self, InspectionMode::Parsed | InspectionMode::Both)
    }
}

/// What happens to a held packet nobody resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PauseTimeoutAction {
    /// Forward the packet unchanged.
    #[default]
    Forward,
    /// Discard the packet; the session keeps running.
    Drop,
}

/// Packet inspection configuration. Hot-reloadable.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InspectionConfig {
    /// Hold every captured packet until resumed or timed out.
    pub pause_by_default: bool,

    /// Maximum time a packet is held, in milliseconds.
    pub pause_timeout_ms: u64,

    /// Resolution applied when the hold deadline passes.
    pub on_pause_timeout: PauseTimeoutAction,

    /// Persist every captured packet to `packet_storage_path`.
    pub save_captured_packets: bool,

    /// Directory for persisted packets.
    pub packet_storage_path: String,
}

impl Default for InspectionConfig {
    fn default() -> Self {
        Self {
            pause_by_default: false,
            pause_timeout_ms: 30_000,
            on_pause_timeout: PauseTimeoutAction::Forward,
            save_captured_packets: false,
            packet_storage_path: "data/packets".to_string(),
        }
    }
}

/// Retry configuration for upstream connects.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enable retries.
    pub enabled: bool,

    /// Maximum number of attempts, first one included.
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2000,
        }
    }
}

/// Search backend export configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Enable packet export.
    pub enabled: bool,

    /// Backend base URLs; the first reachable one receives each batch.
    pub hosts: Vec<String>,

    /// Index name prefix.
    pub index_prefix: String,

    /// Flush once this many records are buffered.
    pub batch_size: usize,

    /// Flush at least this often, in seconds.
    pub flush_interval_secs: u64,

    /// Records queued between relay loops and the exporter.
    pub channel_capacity: usize,

    /// Bulk request attempts before a batch is dropped.
    pub max_retries: u32,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            hosts: vec!["http://localhost:9200".to_string()],
            index_prefix: "proxy-logs".to_string(),
            batch_size: 100,
            flush_interval_secs: 5,
            channel_capacity: 10_000,
            max_retries: 3,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Multi-line human readable output instead of compact lines.
    pub pretty_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            pretty_logs: false,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin control surface configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_http_only() {
        let config = ProxyConfig::default();
        let enabled: Vec<_> = config.protocols.enabled().map(|(kind, _)| kind).collect();
        assert_eq!(enabled, vec![ProtocolKind::Http]);
        assert_eq!(config.protocols.http.port, 8080);
        assert!(!config.inspection.pause_by_default);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: ProxyConfig = toml::from_str(
            r#"
            [server]
            max_connections = 8

            [protocols.dns]
            enabled = true
            port = 5353
            inspection_mode = "parsed"

            [inspection]
            pause_by_default = true
            on_pause_timeout = "drop"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.max_connections, 8);
        assert_eq!(config.server.host, "0.0.0.0");
        assert!(config.protocols.dns.enabled);
        assert_eq!(config.protocols.dns.inspection_mode, InspectionMode::Parsed);
        assert_eq!(config.protocols.dns.buffer_size, 4096);
        assert_eq!(config.inspection.on_pause_timeout, PauseTimeoutAction::Drop);
        assert_eq!(config.inspection.pause_timeout_ms, 30_000);
    }

    #[test]
    fn target_falls_back_to_protocol_default() {
        let config = ProtocolConfig::default();
        let target = config.target_or_default(ProtocolKind::Ftp).unwrap();
        assert_eq!(target, TargetConfig::new("127.0.0.1", 21));
        assert!(config.target_or_default(ProtocolKind::Http).is_none());
    }

    #[test]
    fn headers_mode_skips_parsing() {
        assert!(!InspectionMode::Headers.includes_parsed());
        assert!(InspectionMode::Parsed.includes_parsed());
        assert!(InspectionMode::Both.includes_parsed());
    }
}
