//! Packet export to a search backend.
//!
//! # Data Flow
//! ```text
//! Interceptor
//!     → TelemetryHandle::record (try_send, never blocks)
//!     → bounded mpsc
//!     → TelemetrySink::run (batch by size or interval)
//!     → bulk.rs (NDJSON `_bulk` POST, retried with backoff)
//! ```
//!
//! # Design Decisions
//! - A full queue drops the record; forwarding always wins over export
//! - Hosts are tried in order for every attempt
//! - Whatever is buffered at shutdown gets one final flush

pub mod bulk;

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::config::{RetryConfig, TelemetryConfig};
use crate::lifecycle::ShutdownSignal;
use crate::observability::metrics;
use crate::packet::PacketRecord;
use crate::protocols::ProtocolKind;
use crate::resilience::retries::retry_with_backoff;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("bulk request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("bulk request to {host} returned status {status}")]
    Status { host: String, status: u16 },

    #[error("failed to encode bulk body: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("no telemetry hosts configured")]
    NoHosts,
}

/// Index a record is written to: `{prefix}-{protocol}-{yyyy.mm.dd}`.
pub fn index_name(prefix: &str, protocol: ProtocolKind, timestamp: DateTime<Utc>) -> String {
    format!("{}-{}-{}", prefix, protocol, timestamp.format("%Y.%m.%d"))
}

/// Cheap, cloneable sender side of the sink.
#[derive(Debug, Clone)]
pub struct TelemetryHandle {
    tx: mpsc::Sender<PacketRecord>,
}

impl TelemetryHandle {
    /// Queue a record for export without waiting.
    pub fn record(&self, record: PacketRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                tracing::warn!(packet_id = %record.id, "Telemetry queue full, record dropped");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("Telemetry sink stopped, record dropped");
            }
        }
    }
}

/// Background exporter owning the receiving side of the queue.
pub struct TelemetrySink {
    config: TelemetryConfig,
    client: reqwest::Client,
    rx: mpsc::Receiver<PacketRecord>,
}

/// Build a connected handle and sink pair.
pub fn channel(config: TelemetryConfig) -> (TelemetryHandle, TelemetrySink) {
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let sink = TelemetrySink {
        config,
        client: reqwest::Client::new(),
        rx,
    };
    (TelemetryHandle { tx }, sink)
}

impl TelemetrySink {
    pub async fn run(mut self, mut shutdown: ShutdownSignal) {
        let batch_size = self.config.batch_size.max(1);
        let mut batch: Vec<PacketRecord> = Vec::with_capacity(batch_size);
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.flush_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            hosts = ?self.config.hosts,
            batch_size,
            flush_interval_secs = self.config.flush_interval_secs,
            "Telemetry sink started"
        );

        loop {
            tokio::select! {
                record = self.rx.recv() => match record {
                    Some(record) => {
                        batch.push(record);
                        if batch.len() >= batch_size {
                            self.flush(&mut batch).await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                    }
                }
                _ = shutdown.recv() => {
                    while let Ok(record) = self.rx.try_recv() {
                        batch.push(record);
                    }
                    break;
                }
            }
        }

        if !batch.is_empty() {
            self.flush(&mut batch).await;
        }
        tracing::info!("Telemetry sink stopped");
    }

    async fn flush(&self, batch: &mut Vec<PacketRecord>) {
        let records = std::mem::take(batch);
        let count = records.len();

        let body = match bulk::encode(&self.config.index_prefix, &records) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(error = %e, records = count, "Failed to encode telemetry batch");
                metrics::record_telemetry_flush("error");
                return;
            }
        };

        let retry = RetryConfig {
            enabled: true,
            max_attempts: self.config.max_retries.max(1),
            base_delay_ms: 500,
            max_delay_ms: 5_000,
        };
        let result = retry_with_backoff(&retry, "telemetry_flush", |_| true, |_| {
            bulk::send(&self.client, &self.config.hosts, body.clone())
        })
        .await;

        match result {
            Ok(()) => {
                tracing::debug!(records = count, "Telemetry batch flushed");
                metrics::record_telemetry_flush("ok");
            }
            Err(e) => {
                tracing::error!(error = %e, records = count, "Dropping telemetry batch");
                metrics::record_telemetry_flush("error");
            }
        }
    }
}
