//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated)
//!     → registry + dispatcher built once at startup
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → atomic swap of Arc<InspectionConfig>
//!     → relay loops observe new pause policy on the next packet
//! ```
//!
//! # Design Decisions
//! - Listeners and the handler registry are fixed once started
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::{
    AdminConfig, InspectionConfig, InspectionMode, ObservabilityConfig, PauseTimeoutAction,
    ProtocolConfig, ProtocolsConfig, ProxyConfig, RetryConfig, ServerConfig, TargetConfig,
    TelemetryConfig,
};
