//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Upstream connect / telemetry flush:
//!     → retries.rs (retry with backoff while the error is transient)
//!     → backoff.rs (exponential delay + jitter)
//! ```
//!
//! # Design Decisions
//! - Every upstream connect has a deadline (`server.timeout_secs`)
//! - Only connection setup is retried, never relayed traffic

pub mod backoff;
pub mod retries;
