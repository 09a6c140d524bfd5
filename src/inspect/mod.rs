//! Packet inspection pipeline.
//!
//! # Data Flow
//! ```text
//! bytes read by a relay pump
//!     → should_inspect? (no → forward untouched)
//!     → Packet::capture
//!     → parse_packet (parsed / both modes only)
//!     → paused = pause_by_default (live settings)
//!     → hold.rs (wait for resume / deadline / shutdown)
//!     → persist (awaited before the bytes are handed back)
//!     → telemetry (queued; never blocks forwarding)
//!     → bytes handed back to the pump, or dropped
//! ```

pub mod hold;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::config::{InspectionConfig, InspectionMode, PauseTimeoutAction};
use crate::lifecycle::ShutdownSignal;
use crate::observability::metrics;
use crate::packet::store::PacketStore;
use crate::packet::Packet;
use crate::protocols::{Direction, Metadata, ProtocolHandler, ProtocolKind};
use crate::telemetry::TelemetryHandle;

pub use hold::{HeldPacket, HoldOutcome, HoldTable};

/// Process-wide collaborators shared by every session.
#[derive(Clone)]
pub struct InspectionServices {
    /// Live inspection settings, swapped on config reload.
    pub settings: Arc<ArcSwap<InspectionConfig>>,
    pub holds: HoldTable,
    pub telemetry: Option<TelemetryHandle>,
}

impl InspectionServices {
    pub fn new(settings: InspectionConfig) -> Self {
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            holds: HoldTable::new(),
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: TelemetryHandle) -> Self {
        self.telemetry = Some(telemetry);
        self
    }
}

type ParseFn = fn(&[u8], Direction) -> Metadata;
type FilterFn = fn(&[u8], Direction) -> bool;

/// Applies capture, parsing and the hold contract for one session.
#[derive(Clone)]
pub struct Interceptor {
    protocol: ProtocolKind,
    mode: InspectionMode,
    parse: ParseFn,
    filter: FilterFn,
    tags: Metadata,
    services: InspectionServices,
}

impl Interceptor {
    /// Interceptor using the parser and filter of handler type `H`.
    pub fn for_handler<H: ProtocolHandler>(
        protocol: ProtocolKind,
        mode: InspectionMode,
        services: InspectionServices,
    ) -> Self {
        Self {
            protocol,
            mode,
            parse: H::parse_packet,
            filter: H::should_inspect,
            tags: Metadata::new(),
            services,
        }
    }

    /// Copy that adds a fixed field to every parsed packet.
    pub fn with_tag(&self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        let mut tagged = self.clone();
        tagged.tags.insert(key.to_string(), value.into());
        tagged
    }

    pub fn holds(&self) -> &HoldTable {
        &self.services.holds
    }

    /// Capture and annotate a packet without holding or recording it.
    pub fn inspect(
        &self,
        data: Vec<u8>,
        direction: Direction,
        source: SocketAddr,
        destination: SocketAddr,
    ) -> Packet {
        let mut packet = Packet::capture(data, source, destination, self.protocol, direction);
        if self.mode.includes_parsed() {
            let mut metadata = (self.parse)(packet.data(), direction);
            metadata.extend(self.tags.clone());
            packet.metadata = metadata;
        }
        packet.set_pause(self.services.settings.load().pause_by_default);
        packet
    }

    /// Run one read through the full pipeline.
    ///
    /// Returns the bytes to forward, or `None` when the packet is dropped.
    pub async fn intercept(
        &self,
        data: Vec<u8>,
        direction: Direction,
        source: SocketAddr,
        destination: SocketAddr,
        shutdown: &mut ShutdownSignal,
    ) -> Option<Vec<u8>> {
        if !(self.filter)(&data, direction) {
            return Some(data);
        }

        let mut packet = self.inspect(data, direction, source, destination);
        metrics::record_packet(self.protocol, direction, packet.len());

        tracing::info!(
            packet_id = %packet.id,
            direction = %direction,
            paused = packet.paused,
            "{} {} -> {} ({} bytes)",
            self.protocol,
            source,
            destination,
            packet.len()
        );
        tracing::debug!(packet_id = %packet.id, metadata = ?packet.metadata, "Packet inspected");

        let settings = self.services.settings.load_full();
        let mut forward = true;
        if packet.paused {
            let timeout = Duration::from_millis(settings.pause_timeout_ms);
            match self.services.holds.hold(&packet, timeout, shutdown).await {
                HoldOutcome::Resumed => {
                    tracing::info!(packet_id = %packet.id, "Held packet resumed");
                    packet.set_pause(false);
                }
                HoldOutcome::TimedOut => {
                    forward = settings.on_pause_timeout == PauseTimeoutAction::Forward;
                    tracing::warn!(
                        packet_id = %packet.id,
                        timeout_ms = settings.pause_timeout_ms,
                        action = if forward { "forward" } else { "drop" },
                        "Hold timed out"
                    );
                    if forward {
                        packet.set_pause(false);
                    }
                }
                HoldOutcome::Shutdown => {
                    tracing::debug!(packet_id = %packet.id, "Hold released by shutdown");
                    packet.set_pause(false);
                }
            }
        }

        self.record(&packet, &settings).await;

        forward.then(|| packet.into_data())
    }

    /// Saves inline, so a slow packet store slows its own direction.
    async fn record(&self, packet: &Packet, settings: &InspectionConfig) {
        if settings.save_captured_packets {
            let store = PacketStore::new(&settings.packet_storage_path);
            if let Err(e) = store.save(packet).await {
                tracing::warn!(packet_id = %packet.id, error = %e, "Failed to persist packet");
            }
        }
        if let Some(telemetry) = &self.services.telemetry {
            telemetry.record(packet.to_record());
        }
    }
}
