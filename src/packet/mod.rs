//! Captured traffic units.
//!
//! A [`Packet`] is one read from one side of a session, tagged with its
//! direction and the inspection state the operator can change while it is
//! held. Packets live only as long as their session unless persisted by
//! [`store::PacketStore`].

pub mod store;

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocols::{Direction, Metadata, ProtocolKind};

#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    data: Vec<u8>,
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub protocol: ProtocolKind,
    pub direction: Direction,
    pub paused: bool,
    pub modified: bool,
    pub metadata: Metadata,
}

impl Packet {
    /// Wrap freshly read bytes. Source and destination are already ordered
    /// by direction.
    pub fn capture(
        data: Vec<u8>,
        source: SocketAddr,
        destination: SocketAddr,
        protocol: ProtocolKind,
        direction: Direction,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            data,
            source,
            destination,
            protocol,
            direction,
            paused: false,
            modified: false,
            metadata: Metadata::new(),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Returns the new state.
    pub fn set_pause(&mut self, paused: bool) -> bool {
        self.paused = paused;
        self.paused
    }

    /// Replace the payload. An empty replacement is rejected.
    pub fn modify(&mut self, new_data: Vec<u8>) -> bool {
        if new_data.is_empty() {
            return false;
        }
        self.data = new_data;
        self.modified = true;
        true
    }

    /// Serializable snapshot used by storage and telemetry.
    pub fn to_record(&self) -> PacketRecord {
        PacketRecord {
            id: self.id,
            timestamp: self.timestamp,
            protocol: self.protocol,
            direction: self.direction,
            source: self.source,
            destination: self.destination,
            data_length: self.data.len(),
            data: hex::encode(&self.data),
            paused: self.paused,
            modified: self.modified,
            metadata: self.metadata.clone(),
        }
    }

    /// Rebuild a packet from its snapshot.
    pub fn from_record(record: PacketRecord) -> Result<Self, hex::FromHexError> {
        Ok(Self {
            id: record.id,
            timestamp: record.timestamp,
            data: hex::decode(&record.data)?,
            source: record.source,
            destination: record.destination,
            protocol: record.protocol,
            direction: record.direction,
            paused: record.paused,
            modified: record.modified,
            metadata: record.metadata,
        })
    }
}

/// Flat, JSON-friendly view of a [`Packet`]. Payload is hex encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub protocol: ProtocolKind,
    pub direction: Direction,
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub data_length: usize,
    pub data: String,
    pub paused: bool,
    pub modified: bool,
    pub metadata: Metadata,
}
