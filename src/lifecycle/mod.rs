//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (main.rs):
//!     Load config → Validate → Initialize subsystems → Bind listeners
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Release held packets → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then core, then listeners
//! - Shutdown is a level, not an edge: tasks that subscribe late still see it
//! - In-flight sessions are not drained; every blocking wait races the signal

pub mod shutdown;
pub mod signals;

pub use shutdown::{Shutdown, ShutdownSignal};
