//! Intercepting multi-protocol proxy library.

pub mod admin;
pub mod config;
pub mod inspect;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod packet;
pub mod protocols;
pub mod resilience;
pub mod session;
pub mod telemetry;

pub use config::schema::ProxyConfig;
pub use lifecycle::Shutdown;
pub use net::ProxyServer;
