//! Elasticsearch `_bulk` encoding and transport.

use crate::packet::PacketRecord;
use crate::telemetry::{index_name, TelemetryError};

/// Encode records as an NDJSON bulk body, one index action per record.
pub fn encode(prefix: &str, records: &[PacketRecord]) -> Result<String, serde_json::Error> {
    let mut body = String::new();
    for record in records {
        let action = serde_json::json!({
            "index": { "_index": index_name(prefix, record.protocol, record.timestamp) }
        });
        body.push_str(&serde_json::to_string(&action)?);
        body.push('\n');
        body.push_str(&serde_json::to_string(record)?);
        body.push('\n');
    }
    Ok(body)
}

/// POST a bulk body to the first host that accepts it.
pub async fn send(
    client: &reqwest::Client,
    hosts: &[String],
    body: String,
) -> Result<(), TelemetryError> {
    let mut last_error = TelemetryError::NoHosts;

    for host in hosts {
        let url = format!("{}/_bulk", host.trim_end_matches('/'));
        let response = client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body.clone())
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                // Per-item failures are reported in the body, not the status.
                if let Ok(summary) = response.json::<serde_json::Value>().await {
                    if summary["errors"].as_bool() == Some(true) {
                        tracing::warn!(host = %host, "Bulk request accepted with item errors");
                    }
                }
                return Ok(());
            }
            Ok(response) => {
                last_error = TelemetryError::Status {
                    host: host.clone(),
                    status: response.status().as_u16(),
                };
            }
            Err(e) => last_error = TelemetryError::Http(e),
        }
        tracing::debug!(host = %host, error = %last_error, "Telemetry host rejected batch");
    }

    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;
    use crate::protocols::{Direction, ProtocolKind};

    #[test]
    fn encodes_action_and_source_lines() {
        let mut packet = Packet::capture(
            b"\x12\x34".to_vec(),
            "127.0.0.1:5300".parse().unwrap(),
            "8.8.8.8:53".parse().unwrap(),
            ProtocolKind::Dns,
            Direction::ClientToServer,
        );
        packet.metadata.insert("transaction_id".into(), 4660.into());
        let day = packet.timestamp.format("%Y.%m.%d").to_string();

        let body = encode("proxy-logs", &[packet.to_record()]).unwrap();
        let lines: Vec<_> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(body.ends_with('\n'));

        let action: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(action["index"]["_index"], format!("proxy-logs-dns-{}", day));

        let source: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(source["data"], "1234");
        assert_eq!(source["metadata"]["transaction_id"], 4660);
    }

    #[tokio::test]
    async fn send_without_hosts_fails() {
        let client = reqwest::Client::new();
        let err = send(&client, &[], String::new()).await.unwrap_err();
        assert!(matches!(err, TelemetryError::NoHosts));
    }
}
