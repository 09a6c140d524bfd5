//! Hold table for paused packets.
//!
//! A relay task that decides to hold a packet registers it here and waits.
//! The operator resolves it through [`HoldTable::resume`]; otherwise the
//! deadline or shutdown resolves it. Re-pausing a held packet re-arms the
//! deadline.
//!
//! # Design Decisions
//! - One `watch` channel per held packet; the waiter sees the latest state only
//! - The waiter owns removal through a drop guard, so a cancelled session
//!   never leaves an orphaned entry
//! - Operations on unknown or resolved ids are no-ops returning `false`

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use crate::lifecycle::ShutdownSignal;
use crate::observability::metrics;
use crate::packet::Packet;
use crate::protocols::{Direction, ProtocolKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HoldSignal {
    Held { deadline: Instant },
    Resumed,
}

/// How a hold ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldOutcome {
    Resumed,
    TimedOut,
    Shutdown,
}

impl HoldOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            HoldOutcome::Resumed => "resumed",
            HoldOutcome::TimedOut => "timed_out",
            HoldOutcome::Shutdown => "shutdown",
        }
    }
}

/// Operator-facing view of a held packet.
#[derive(Debug, Clone, Serialize)]
pub struct HeldPacket {
    pub id: Uuid,
    pub protocol: ProtocolKind,
    pub direction: Direction,
    pub length: usize,
    pub held_ms: u64,
}

struct HoldEntry {
    protocol: ProtocolKind,
    direction: Direction,
    length: usize,
    held_since: Instant,
    timeout: Duration,
    signal: watch::Sender<HoldSignal>,
}

/// Shared table of held packets, keyed by packet id.
#[derive(Clone, Default)]
pub struct HoldTable {
    entries: Arc<DashMap<Uuid, HoldEntry>>,
}

impl HoldTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold `packet` until it is resumed, its deadline passes, or shutdown.
    pub async fn hold(
        &self,
        packet: &Packet,
        timeout: Duration,
        shutdown: &mut ShutdownSignal,
    ) -> HoldOutcome {
        if shutdown.is_triggered() {
            return HoldOutcome::Shutdown;
        }

        let now = Instant::now();
        let (tx, mut rx) = watch::channel(HoldSignal::Held {
            deadline: now + timeout,
        });
        self.entries.insert(
            packet.id,
            HoldEntry {
                protocol: packet.protocol,
                direction: packet.direction,
                length: packet.len(),
                held_since: now,
                timeout,
                signal: tx,
            },
        );
        let _guard = HoldGuard {
            table: self,
            id: packet.id,
        };
        metrics::set_held_packets(self.entries.len());

        let outcome = loop {
            let current = *rx.borrow_and_update();
            let deadline = match current {
                HoldSignal::Resumed => break HoldOutcome::Resumed,
                HoldSignal::Held { deadline } => deadline,
            };

            tokio::select! {
                changed = rx.changed() => {
                    // Sender gone without a resume means the entry was removed.
                    if changed.is_err() {
                        break HoldOutcome::Resumed;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => break HoldOutcome::TimedOut,
                _ = shutdown.recv() => break HoldOutcome::Shutdown,
            }
        };

        metrics::record_hold(outcome.as_str());
        outcome
    }

    /// Release a held packet for forwarding.
    pub fn resume(&self, id: Uuid) -> bool {
        match self.entries.remove(&id) {
            Some((_, entry)) => {
                entry.signal.send_replace(HoldSignal::Resumed);
                true
            }
            None => false,
        }
    }

    /// Re-arm the deadline of a held packet.
    pub fn pause(&self, id: Uuid) -> bool {
        match self.entries.get(&id) {
            Some(entry) => {
                let deadline = Instant::now() + entry.timeout;
                entry.signal.send_replace(HoldSignal::Held { deadline });
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Vec<HeldPacket> {
        let now = Instant::now();
        let mut held: Vec<_> = self
            .entries
            .iter()
            .map(|entry| HeldPacket {
                id: *entry.key(),
                protocol: entry.protocol,
                direction: entry.direction,
                length: entry.length,
                held_ms: now.saturating_duration_since(entry.held_since).as_millis() as u64,
            })
            .collect();
        held.sort_by(|a, b| b.held_ms.cmp(&a.held_ms));
        held
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct HoldGuard<'a> {
    table: &'a HoldTable,
    id: Uuid,
}

impl Drop for HoldGuard<'_> {
    fn drop(&mut self) {
        self.table.entries.remove(&self.id);
        metrics::set_held_packets(self.table.entries.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Shutdown;

    fn packet() -> Packet {
        Packet::capture(
            b"GET / HTTP/1.1\r\n\r\n".to_vec(),
            "127.0.0.1:50000".parse().unwrap(),
            "127.0.0.1:80".parse().unwrap(),
            ProtocolKind::Http,
            Direction::ClientToServer,
        )
    }

    async fn wait_until_held(table: &HoldTable) {
        while table.is_empty() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unresumed_hold_times_out_at_deadline() {
        let table = HoldTable::new();
        let shutdown = Shutdown::new();
        let mut signal = shutdown.subscribe();

        let started = Instant::now();
        let outcome = table
            .hold(&packet(), Duration::from_millis(1500), &mut signal)
            .await;

        assert_eq!(outcome, HoldOutcome::TimedOut);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1500) && elapsed < Duration::from_millis(1600));
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn resume_releases_immediately() {
        let table = HoldTable::new();
        let shutdown = Shutdown::new();
        let packet = packet();
        let id = packet.id;

        let waiter = {
            let table = table.clone();
            let mut signal = shutdown.subscribe();
            tokio::spawn(async move {
                let started = Instant::now();
                let outcome = table.hold(&packet, Duration::from_secs(30), &mut signal).await;
                (outcome, started.elapsed())
            })
        };

        wait_until_held(&table).await;
        assert_eq!(table.list()[0].id, id);
        assert!(table.resume(id));

        let (outcome, elapsed) = waiter.await.unwrap();
        assert_eq!(outcome, HoldOutcome::Resumed);
        assert!(elapsed < Duration::from_secs(1));
        assert!(!table.resume(id));
        assert!(!table.pause(id));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_rearms_deadline() {
        let table = HoldTable::new();
        let shutdown = Shutdown::new();
        let packet = packet();
        let id = packet.id;

        let waiter = {
            let table = table.clone();
            let mut signal = shutdown.subscribe();
            tokio::spawn(async move {
                let started = Instant::now();
                let outcome = table.hold(&packet, Duration::from_secs(10), &mut signal).await;
                (outcome, started.elapsed())
            })
        };

        wait_until_held(&table).await;
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(table.pause(id));

        let (outcome, elapsed) = waiter.await.unwrap();
        assert_eq!(outcome, HoldOutcome::TimedOut);
        assert!(elapsed >= Duration::from_secs(16));
    }

    #[tokio::test]
    async fn shutdown_releases_hold() {
        let table = HoldTable::new();
        let shutdown = Shutdown::new();

        let waiter = {
            let table = table.clone();
            let mut signal = shutdown.subscribe();
            tokio::spawn(async move { table.hold(&packet(), Duration::from_secs(30), &mut signal).await })
        };

        wait_until_held(&table).await;
        shutdown.trigger();
        assert_eq!(waiter.await.unwrap(), HoldOutcome::Shutdown);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn cancelled_hold_removes_entry() {
        let table = HoldTable::new();
        let shutdown = Shutdown::new();

        let waiter = {
            let table = table.clone();
            let mut signal = shutdown.subscribe();
            tokio::spawn(async move { table.hold(&packet(), Duration::from_secs(30), &mut signal).await })
        };

        wait_until_held(&table).await;
        waiter.abort();
        let _ = waiter.await;
        assert!(table.is_empty());
    }
}
