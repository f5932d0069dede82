// sync/events.rs - Wire-level event envelope and payloads
//
// Event type names and payload field names are wire-stable; the host peer
// speaks the same vocabulary.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::sync::record::RecordOperation;

/// Framed event envelope exchanged on the sync channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    pub event_id: String,
    pub event_type: String,
    pub status: EventStatus,
    pub payload: Value,
}

impl SyncEvent {
    /// Build an outbound event with a fresh event id.
    pub fn new(event_type: EventType, status: EventStatus, payload: Value) -> Self {
        Self::with_event_id(Uuid::new_v4().to_string(), event_type, status, payload)
    }

    /// Build an outbound event with a caller-chosen event id.
    ///
    /// Used for `SYNC_DATA`, where the envelope id doubles as the id the
    /// peer's confirmation must echo.
    pub fn with_event_id(
        event_id: String,
        event_type: EventType,
        status: EventStatus,
        payload: Value,
    ) -> Self {
        Self {
            event_id,
            event_type: event_type.as_str().to_string(),
            status,
            payload,
        }
    }

    /// The recognized event type, if any.
    ///
    /// Unknown types are not an error at this layer; the engine logs and
    /// ignores them.
    pub fn kind(&self) -> Option<EventType> {
        EventType::parse(&self.event_type)
    }
}

/// Event types the engine sends or understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    SyncRequest,
    SyncAccept,
    SyncStart,
    SyncData,
    SyncDataConfirm,
    SyncComplete,
    SyncFinalize,
    SyncReject,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::SyncRequest => "SYNC_REQUEST",
            EventType::SyncAccept => "SYNC_ACCEPT",
            EventType::SyncStart => "SYNC_START",
            EventType::SyncData => "SYNC_DATA",
            EventType::SyncDataConfirm => "SYNC_DATA_CONFIRM",
            EventType::SyncComplete => "SYNC_COMPLETE",
            EventType::SyncFinalize => "SYNC_FINALIZE",
            EventType::SyncReject => "SYNC_REJECT",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "SYNC_REQUEST" => Some(EventType::SyncRequest),
            "SYNC_ACCEPT" => Some(EventType::SyncAccept),
            "SYNC_START" => Some(EventType::SyncStart),
            "SYNC_DATA" => Some(EventType::SyncData),
            "SYNC_DATA_CONFIRM" => Some(EventType::SyncDataConfirm),
            "SYNC_COMPLETE" => Some(EventType::SyncComplete),
            "SYNC_FINALIZE" => Some(EventType::SyncFinalize),
            "SYNC_REJECT" => Some(EventType::SyncReject),
            _ => None,
        }
    }
}

/// Envelope status field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    New,
    Pending,
    Success,
    Done,
    Error,
}

/// Outbound `SYNC_REQUEST` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequestPayload {
    pub device_id: String,
    pub device_name: String,
    pub device_type: String,
    pub device_platform: String,
    pub current_utc_timestamp: i64,
    pub last_sync_timestamp: i64,
}

/// Inbound acceptance payload, carried on `SYNC_REQUEST` or `SYNC_ACCEPT`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncAcceptPayload {
    pub sync_session_id: String,
    #[serde(default)]
    pub current_utc_timestamp: Option<i64>,
    #[serde(default)]
    pub clock_drift_seconds: Option<i64>,
    #[serde(default)]
    pub last_sync_timestamp: Option<i64>,
}

/// Session-only payload used by `SYNC_START`, `SYNC_COMPLETE` and
/// `SYNC_FINALIZE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPayload {
    pub sync_session_id: String,
}

/// `SYNC_DATA` payload: one row change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncDataPayload {
    pub sync_session_id: String,
    pub event_id: String,
    pub table: String,
    pub operation: RecordOperation,
    pub record: Map<String, Value>,
}

/// `SYNC_DATA_CONFIRM` payload acknowledging one `SYNC_DATA`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncDataConfirmPayload {
    pub sync_session_id: String,
    pub event_id: String,
    pub status: EventStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// `SYNC_REJECT` (and request-error) payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectPayload {
    #[serde(default)]
    pub message: Option<String>,
}
