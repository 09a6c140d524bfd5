//! Live session bookkeeping.
//!
//! Every session, stream or datagram, is tagged with a [`SessionId`] and
//! counted per protocol while its [`SessionGuard`] is alive.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::protocols::ProtocolKind;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Process-unique session tag, rendered as `s-<n>` in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn next() -> Self {
        Self(NEXT_SESSION.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s-{}", self.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionTracker {
    live: Arc<DashMap<ProtocolKind, u64>>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, protocol: ProtocolKind) -> SessionGuard {
        *self.live.entry(protocol).or_insert(0) += 1;
        SessionGuard {
            id: SessionId::next(),
            protocol,
            live: Arc::clone(&self.live),
        }
    }

    pub fn total(&self) -> u64 {
        self.live.iter().map(|entry| *entry.value()).sum()
    }

    /// Live counts, omitting protocols with no sessions.
    pub fn by_protocol(&self) -> HashMap<ProtocolKind, u64> {
        self.live
            .iter()
            .filter(|entry| *entry.value() > 0)
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }
}

/// Keeps one session counted until dropped.
#[derive(Debug)]
pub struct SessionGuard {
    id: SessionId,
    protocol: ProtocolKind,
    live: Arc<DashMap<ProtocolKind, u64>>,
}

impl SessionGuard {
    pub fn id(&self) -> SessionId {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(mut count) = self.live.get_mut(&self.protocol) {
            *count = count.saturating_sub(1);
        }
        tracing::trace!(session_id = %self.id, "Session released");
    }
}
