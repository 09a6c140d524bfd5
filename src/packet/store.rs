//! On-disk packet persistence.
//!
//! Each packet becomes two files under the storage root:
//! `{unix_seconds}_{protocol}_{id}.packet.json` holding the full record and
//! `{…}.packet.bin` holding the raw payload for external tools.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::packet::{Packet, PacketRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("packet store I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed packet record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed packet payload: {0}")]
    Hex(#[from] hex::FromHexError),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone)]
pub struct PacketStore {
    root: PathBuf,
}

impl PacketStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// File stem shared by the record and payload files.
    pub fn file_stem(packet: &Packet) -> String {
        format!(
            "{}_{}_{}.packet",
            packet.timestamp.timestamp(),
            packet.protocol,
            packet.id
        )
    }

    /// Persist a packet, creating the root on first use. Returns the path of
    /// the JSON record.
    pub async fn save(&self, packet: &Packet) -> Result<PathBuf, StoreError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(io_error(&self.root))?;

        let stem = Self::file_stem(packet);
        let json_path = self.root.join(format!("{}.json", stem));
        let bin_path = self.root.join(format!("{}.bin", stem));

        let json = serde_json::to_vec_pretty(&packet.to_record())?;
        tokio::fs::write(&json_path, json)
            .await
            .map_err(io_error(&json_path))?;
        tokio::fs::write(&bin_path, packet.data())
            .await
            .map_err(io_error(&bin_path))?;

        tracing::debug!(packet_id = %packet.id, path = %json_path.display(), "Packet saved");
        Ok(json_path)
    }

    /// Read a packet back from the JSON record written by [`save`](Self::save).
    pub async fn load(path: &Path) -> Result<Packet, StoreError> {
        let bytes = tokio::fs::read(path).await.map_err(io_error(path))?;
        let record: PacketRecord = serde_json::from_slice(&bytes)?;
        Ok(Packet::from_record(record)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::{Direction, ProtocolKind};

    fn temp_root(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("protocol-proxy-{}-{}", name, uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn load_reproduces_saved_packet() {
        let root = temp_root("store");
        let store = PacketStore::new(&root);

        let mut packet = Packet::capture(
            vec![0x12, 0x34, 0x01, 0x00, 0xff],
            "10.0.0.2:5353".parse().unwrap(),
            "8.8.8.8:53".parse().unwrap(),
            ProtocolKind::Dns,
            Direction::ClientToServer,
        );
        packet.set_pause(true);
        packet.metadata.insert("transaction_id".into(), 0x1234.into());
        packet.metadata.insert("opcode_name".into(), "QUERY".into());

        let path = store.save(&packet).await.unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with(&format!("_dns_{}.packet.json", packet.id)));

        let raw = tokio::fs::read(path.with_extension("bin")).await.unwrap();
        assert_eq!(raw, packet.data());

        let loaded = PacketStore::load(&path).await.unwrap();
        assert_eq!(loaded, packet);

        let _ = tokio::fs::remove_dir_all(&root).await;
    }

    #[tokio::test]
    async fn load_reports_missing_file() {
        let err = PacketStore::load(Path::new("/nonexistent/1_http_x.packet.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
    }
}
