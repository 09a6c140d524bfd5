//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, ports valid)
//! - Detect listener port conflicts between enabled protocols
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashMap;
use std::fmt;

use crate::config::schema::ProxyConfig;
use crate::protocols::ProtocolKind;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Check a parsed configuration for semantic errors.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.server.max_connections == 0 {
        errors.push(ValidationError::new(
            "server.max_connections",
            "must be greater than zero",
        ));
    }
    if config.server.timeout_secs == 0 {
        errors.push(ValidationError::new("server.timeout_secs", "must be greater than zero"));
    }

    let mut ports: HashMap<u16, ProtocolKind> = HashMap::new();
    let mut any_enabled = false;
    for (kind, protocol) in config.protocols.enabled() {
        any_enabled = true;
        let prefix = format!("protocols.{}", kind);

        if protocol.port == 0 {
            errors.push(ValidationError::new(
                format!("{}.port", prefix),
                "a listening port is required when enabled",
            ));
        } else if let Some(other) = ports.insert(protocol.port, kind) {
            errors.push(ValidationError::new(
                format!("{}.port", prefix),
                format!("port {} already used by {}", protocol.port, other),
            ));
        }

        if protocol.buffer_size == 0 {
            errors.push(ValidationError::new(
                format!("{}.buffer_size", prefix),
                "must be greater than zero",
            ));
        }

        if kind == ProtocolKind::Dns && protocol.reply_timeout_secs == 0 {
            errors.push(ValidationError::new(
                format!("{}.reply_timeout_secs", prefix),
                "must be greater than zero",
            ));
        }

        if let Some(target) = &protocol.target {
            if target.host.trim().is_empty() || target.port == 0 {
                errors.push(ValidationError::new(
                    format!("{}.target", prefix),
                    "host and port must both be set",
                ));
            }
        }
    }

    if !any_enabled {
        errors.push(ValidationError::new("protocols", "no protocol is enabled"));
    }

    if config.inspection.pause_timeout_ms == 0 {
        errors.push(ValidationError::new(
            "inspection.pause_timeout_ms",
            "must be greater than zero",
        ));
    }
    if config.inspection.save_captured_packets
        && config.inspection.packet_storage_path.trim().is_empty()
    {
        errors.push(ValidationError::new(
            "inspection.packet_storage_path",
            "required when save_captured_packets is set",
        ));
    }

    if config.telemetry.enabled {
        if config.telemetry.hosts.is_empty() {
            errors.push(ValidationError::new("telemetry.hosts", "at least one host is required"));
        }
        if config.telemetry.batch_size == 0 {
            errors.push(ValidationError::new("telemetry.batch_size", "must be greater than zero"));
        }
        if config.telemetry.channel_capacity == 0 {
            errors.push(ValidationError::new(
                "telemetry.channel_capacity",
                "must be greater than zero",
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::TargetConfig;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&ProxyConfig::default()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = ProxyConfig::default();
        config.server.max_connections = 0;
        config.protocols.ftp.enabled = true;
        config.protocols.ftp.port = 0;
        config.protocols.ftp.buffer_size = 0;
        config.inspection.pause_timeout_ms = 0;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"server.max_connections"));
        assert!(fields.contains(&"protocols.ftp.port"));
        assert!(fields.contains(&"protocols.ftp.buffer_size"));
        assert!(fields.contains(&"inspection.pause_timeout_ms"));
    }

    #[test]
    fn rejects_port_collision() {
        let mut config = ProxyConfig::default();
        config.protocols.telnet.enabled = true;
        config.protocols.telnet.port = config.protocols.http.port;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("already used by http"));
    }

    #[test]
    fn rejects_empty_target_and_no_protocols() {
        let mut config = ProxyConfig::default();
        config.protocols.http.target = Some(TargetConfig::new("", 80));
        assert!(validate_config(&config).is_err());

        let mut config = ProxyConfig::default();
        config.protocols.http.enabled = false;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "protocols");
    }
}
