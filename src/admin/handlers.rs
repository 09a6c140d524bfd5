use std::collections::HashMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AdminState;
use crate::inspect::HeldPacket;
use crate::protocols::ProtocolKind;

#[derive(Debug, Serialize, Deserialize)]
pub struct SystemStatus {
    pub version: String,
    pub active_sessions: u64,
    pub sessions_by_protocol: HashMap<ProtocolKind, u64>,
    pub held_packets: usize,
}

/// Result of a pause or resume request.
#[derive(Debug, Serialize, Deserialize)]
pub struct HoldAction {
    pub id: Uuid,
    pub applied: bool,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_sessions: state.server.active_sessions(),
        sessions_by_protocol: state.server.sessions_by_protocol(),
        held_packets: state.server.holds().len(),
    })
}

pub async fn get_held(State(state): State<AdminState>) -> Json<Vec<HeldPacket>> {
    Json(state.server.held())
}

fn packet_id(raw: &str) -> Result<Uuid, (StatusCode, String)> {
    Uuid::parse_str(raw).map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid packet id: {}", e)))
}

pub async fn resume_packet(
    State(state): State<AdminState>,
    Path(raw): Path<String>,
) -> Result<Json<HoldAction>, (StatusCode, String)> {
    let id = packet_id(&raw)?;
    Ok(Json(HoldAction {
        id,
        applied: state.server.resume(id),
    }))
}

pub async fn pause_packet(
    State(state): State<AdminState>,
    Path(raw): Path<String>,
) -> Result<Json<HoldAction>, (StatusCode, String)> {
    let id = packet_id(&raw)?;
    Ok(Json(HoldAction {
        id,
        applied: state.server.pause(id),
    }))
}
