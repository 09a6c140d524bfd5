//! Protocol name to handler constructor mapping.
//!
//! Built once at startup from the enabled protocols and never mutated
//! afterwards, so it is shared freely across listeners.

use std::collections::HashMap;

use crate::config::ProtocolsConfig;
use crate::protocols::{
    ClientEndpoint, DnsHandler, FtpHandler, Handler, HttpHandler, ProtocolKind, TelnetHandler,
};
use crate::session::{SessionContext, SessionResult};

/// Builds a handler around an accepted client.
pub type Constructor = fn(ClientEndpoint, SessionContext) -> SessionResult<Handler>;

fn constructor(kind: ProtocolKind) -> Constructor {
    match kind {
        ProtocolKind::Http => HttpHandler::create,
        ProtocolKind::Ftp => FtpHandler::create,
        ProtocolKind::Dns => DnsHandler::create,
        ProtocolKind::Telnet => TelnetHandler::create,
    }
}

#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    constructors: HashMap<ProtocolKind, Constructor>,
}

impl HandlerRegistry {
    /// Register a constructor for every enabled protocol.
    pub fn from_config(protocols: &ProtocolsConfig) -> Self {
        let constructors = protocols
            .enabled()
            .map(|(kind, _)| (kind, constructor(kind)))
            .collect();
        Self { constructors }
    }

    pub fn contains(&self, kind: ProtocolKind) -> bool {
        self.constructors.contains_key(&kind)
    }

    /// Registered protocols in a stable order.
    pub fn protocols(&self) -> Vec<ProtocolKind> {
        ProtocolKind::ALL
            .into_iter()
            .filter(|kind| self.contains(*kind))
            .collect()
    }

    /// Construct the handler for `kind`, or `None` if it is not registered.
    pub fn create(
        &self,
        kind: ProtocolKind,
        client: ClientEndpoint,
        context: SessionContext,
    ) -> Option<SessionResult<Handler>> {
        self.constructors
            .get(&kind)
            .map(|construct| construct(client, context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support;
    use crate::session::SessionError;
    use std::sync::Arc;

    #[test]
    fn registers_only_enabled_protocols() {
        let mut protocols = ProtocolsConfig::default();
        protocols.dns.enabled = true;
        protocols.dns.port = 5353;

        let registry = HandlerRegistry::from_config(&protocols);
        assert_eq!(
            registry.protocols(),
            vec![ProtocolKind::Http, ProtocolKind::Dns]
        );
        assert!(!registry.contains(ProtocolKind::Telnet));
    }

    #[tokio::test]
    async fn create_builds_matching_variant() {
        let mut protocols = ProtocolsConfig::default();
        protocols.dns.enabled = true;
        let registry = HandlerRegistry::from_config(&protocols);

        let socket = Arc::new(tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (context, _shutdown) = test_support::context(ProtocolKind::Dns);
        let handler = registry
            .create(ProtocolKind::Dns, ClientEndpoint::Udp { socket }, context)
            .unwrap()
            .unwrap();
        assert_eq!(handler.protocol(), ProtocolKind::Dns);

        let (context, _shutdown) = test_support::context(ProtocolKind::Telnet);
        let socket = Arc::new(tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap());
        assert!(registry
            .create(ProtocolKind::Telnet, ClientEndpoint::Udp { socket }, context)
            .is_none());
    }

    #[tokio::test]
    async fn transport_mismatch_is_reported() {
        let registry = HandlerRegistry::from_config(&ProtocolsConfig::default());
        let socket = Arc::new(tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (context, _shutdown) = test_support::context(ProtocolKind::Http);

        let result = registry
            .create(ProtocolKind::Http, ClientEndpoint::Udp { socket }, context)
            .unwrap();
        assert!(matches!(result, Err(SessionError::TransportMismatch)));
    }
}
