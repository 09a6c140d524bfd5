//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection / UDP datagram endpoint
//!     → listener.rs (bind, worker-pool permit, accept)
//!     → connection.rs (session id, live session count)
//!     → dispatcher.rs (registry lookup, spawn handler session)
//! ```
//!
//! # Design Decisions
//! - One semaphore shared by all listeners; the permit is taken before
//!   accept so exhaustion is backpressure, never a dropped connection
//! - Every accept is raced against shutdown
//! - Shutdown closes listeners and does not wait for in-flight sessions

pub mod connection;
pub mod dispatcher;
pub mod listener;

pub use dispatcher::{BoundListeners, ProxyServer};
