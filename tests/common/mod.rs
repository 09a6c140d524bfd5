//! Shared utilities for integration tests: mock upstreams and proxy setup.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UdpSocket};

use protocol_proxy::config::{InspectionConfig, ProxyConfig, TargetConfig};
use protocol_proxy::inspect::InspectionServices;
use protocol_proxy::lifecycle::Shutdown;
use protocol_proxy::net::ProxyServer;
use protocol_proxy::protocols::{HandlerRegistry, ProtocolKind};

/// Start a simple mock HTTP backend that returns a fixed response.
pub async fn start_mock_backend(addr: SocketAddr, response: &'static str) {
    let listener = TcpListener::bind(addr).await.unwrap();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 4096];
                        let _ = socket.read(&mut buf).await;
                        let response_str = format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            response.len(),
                            response
                        );
                        let _ = socket.write_all(response_str.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });
}

/// Start a TCP server that echoes everything back, optionally greeting first.
pub async fn start_echo_server(addr: SocketAddr, banner: Option<&'static [u8]>) {
    let listener = TcpListener::bind(addr).await.unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                if let Some(banner) = banner {
                    if socket.write_all(banner).await.is_err() {
                        return;
                    }
                }
                let mut buf = [0u8; 1024];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
}

/// Start a minimal FTP control server: greets, then answers each command
/// line with a canned reply. `PASV` opens a data port that accepts exactly
/// one connection and sends `payload` on it.
pub async fn start_mock_ftp(addr: SocketAddr) {
    start_mock_ftp_with_data(addr, b"file contents").await;
}

pub async fn start_mock_ftp_with_data(addr: SocketAddr, payload: &'static [u8]) {
    let listener = TcpListener::bind(addr).await.unwrap();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (read, mut write) = socket.into_split();
                if write.write_all(b"220 Mock FTP ready\r\n").await.is_err() {
                    return;
                }
                let mut lines = BufReader::new(read).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let command = line.split_whitespace().next().unwrap_or("").to_uppercase();
                    let reply: Vec<u8> = match command.as_str() {
                        "USER" => b"331 Password required\r\n".to_vec(),
                        "PASS" => b"230 Logged in\r\n".to_vec(),
                        "QUIT" => b"221 Bye\r\n".to_vec(),
                        "PASV" => {
                            let data = TcpListener::bind("127.0.0.1:0").await.unwrap();
                            let port = data.local_addr().unwrap().port();
                            tokio::spawn(async move {
                                // One accept, then the port closes.
                                if let Ok((mut conn, _)) = data.accept().await {
                                    let _ = conn.write_all(payload).await;
                                    let _ = conn.shutdown().await;
                                }
                            });
                            format!(
                                "227 Entering Passive Mode (127,0,0,1,{},{})\r\n",
                                port / 256,
                                port % 256
                            )
                            .into_bytes()
                        }
                        _ => b"502 Not implemented\r\n".to_vec(),
                    };
                    if write.write_all(&reply).await.is_err() || command == "QUIT" {
                        break;
                    }
                }
            });
        }
    });
}

/// Start a mock resolver that answers every query by echoing it back as a
/// response with one answer counted.
pub async fn start_mock_resolver(addr: SocketAddr) {
    let socket = UdpSocket::bind(addr).await.unwrap();

    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            if n < 12 {
                continue;
            }
            let mut reply = buf[..n].to_vec();
            reply[2] = 0x81;
            reply[3] = 0x80;
            reply[6..8].copy_from_slice(&1u16.to_be_bytes());
            let _ = socket.send_to(&reply, peer).await;
        }
    });
}

/// Build a DNS query for `name` (type A, class IN).
pub fn dns_query(txid: u16, name: &str) -> Vec<u8> {
    let mut packet = txid.to_be_bytes().to_vec();
    packet.extend_from_slice(&[0x01, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    for label in name.split('.') {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.extend_from_slice(&[0, 0, 1, 0, 1]);
    packet
}

/// Config on loopback with every protocol disabled.
pub fn base_config() -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.server.host = "127.0.0.1".into();
    config.server.timeout_secs = 2;
    config.protocols.http.enabled = false;
    config.retries.enabled = false;
    config
}

/// Enable `protocol` on `port`, relaying to `target` when given.
pub fn enable(config: &mut ProxyConfig, protocol: ProtocolKind, port: u16, target: Option<SocketAddr>) {
    let block = match protocol {
        ProtocolKind::Http => &mut config.protocols.http,
        ProtocolKind::Ftp => &mut config.protocols.ftp,
        ProtocolKind::Dns => &mut config.protocols.dns,
        ProtocolKind::Telnet => &mut config.protocols.telnet,
    };
    block.enabled = true;
    block.port = port;
    block.target = target.map(|addr| TargetConfig::new(addr.ip().to_string(), addr.port()));
}

/// Bind and serve a proxy built from `config`.
pub async fn start_proxy(config: ProxyConfig) -> (ProxyServer, Shutdown) {
    let registry = HandlerRegistry::from_config(&config.protocols);
    let services = InspectionServices::new(config.inspection.clone());
    let server = ProxyServer::new(config, registry, services);
    let listeners = server.bind().await.unwrap();

    let shutdown = Shutdown::new();
    let signal = shutdown.subscribe();
    let serving = server.clone();
    tokio::spawn(async move { serving.serve(listeners, signal).await });
    (server, shutdown)
}

/// Inspection settings that hold every packet.
pub fn holding(timeout_ms: u64) -> InspectionConfig {
    InspectionConfig {
        pause_by_default: true,
        pause_timeout_ms: timeout_ms,
        ..InspectionConfig::default()
    }
}

/// Poll until `server` holds at least `count` packets.
pub async fn wait_for_held(server: &ProxyServer, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.holds().len() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("packets were not held in time");
}
