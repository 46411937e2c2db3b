//! Bus envelope and the closed enumeration of metadata message tags.
//!
//! Encoding is self-describing text (JSON) rather than the binary,
//! manually-framed messages a lower-level RPC layer might use: a message
//! whose payload does not parse against its declared tag is logged and
//! discarded, never fatal, which a textual format makes far easier to
//! reason about than a length-prefixed binary one.

use crate::consensus::DatabaseChecksum;
use crate::placement::{Placement, PlacementStatus, PortMapping, PortPair};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The closed set of message payloads carried over the single metadata
/// topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessagePayload {
    CreateRequest {
        name: String,
        requester: String,
        rf: usize,
    },
    CreateResponse {
        name: String,
        node: String,
        pair: PortPair,
    },
    CreateConfirm {
        name: String,
        selected_nodes: Vec<String>,
        coordinator: String,
    },
    StatusUpdate {
        name: String,
        node: String,
        status: PlacementStatus,
        ports: Option<PortMapping>,
    },
    Delete {
        name: String,
    },
    IdleNotification {
        name: String,
        node: String,
        last_activity: DateTime<Utc>,
    },
    ShutdownCoordinated {
        name: String,
        shutdown_time: DateTime<Utc>,
    },
    WakeupRequest {
        name: String,
        requester: String,
    },
    CapacityAnnouncement {
        node: String,
        max: usize,
        current: usize,
        http_range: (u16, u16),
        raft_range: (u16, u16),
    },
    HealthPing {
        node: String,
        current: usize,
    },
    HealthPong {
        node: String,
        healthy: bool,
        ping_from: String,
    },
    ReplacementNeeded {
        name: String,
        failed_node: String,
        current_members: Vec<String>,
        rf: usize,
    },
    ReplacementOffer {
        name: String,
        new_node: String,
        pair: PortPair,
    },
    ReplacementConfirm {
        name: String,
        new_node: String,
        replaced_node: String,
        pair: PortPair,
        join_address: String,
    },
    Cleanup {
        name: String,
    },
    MetadataSync {
        placement: Placement,
    },
    ChecksumRequest {
        request_id: String,
    },
    ChecksumResponse {
        request_id: String,
        checksums: Vec<DatabaseChecksum>,
    },
}

impl MessagePayload {
    /// Short name used for debug/trace logging; matches the tag set in
    /// the payload's own `type` discriminant.
    pub fn kind(&self) -> &'static str {
        match self {
            MessagePayload::CreateRequest { .. } => "CreateRequest",
            MessagePayload::CreateResponse { .. } => "CreateResponse",
            MessagePayload::CreateConfirm { .. } => "CreateConfirm",
            MessagePayload::StatusUpdate { .. } => "StatusUpdate",
            MessagePayload::Delete { .. } => "Delete",
            MessagePayload::IdleNotification { .. } => "IdleNotification",
            MessagePayload::ShutdownCoordinated { .. } => "ShutdownCoordinated",
            MessagePayload::WakeupRequest { .. } => "WakeupRequest",
            MessagePayload::CapacityAnnouncement { .. } => "CapacityAnnouncement",
            MessagePayload::HealthPing { .. } => "HealthPing",
            MessagePayload::HealthPong { .. } => "HealthPong",
            MessagePayload::ReplacementNeeded { .. } => "ReplacementNeeded",
            MessagePayload::ReplacementOffer { .. } => "ReplacementOffer",
            MessagePayload::ReplacementConfirm { .. } => "ReplacementConfirm",
            MessagePayload::Cleanup { .. } => "Cleanup",
            MessagePayload::MetadataSync { .. } => "MetadataSync",
            MessagePayload::ChecksumRequest { .. } => "ChecksumRequest",
            MessagePayload::ChecksumResponse { .. } => "ChecksumResponse",
        }
    }
}

/// The uniform envelope every bus message is wrapped in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataMessage {
    pub sender_node_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: MessagePayload,
}

impl MetadataMessage {
    pub fn new(sender_node_id: impl Into<String>, payload: MessagePayload) -> Self {
        Self {
            sender_node_id: sender_node_id.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Encode as the self-describing textual wire format.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode a received envelope. Per the spec, a payload that does not
    /// parse against its declared tag is never fatal — callers log and
    /// discard on `Err`.
    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// The single well-known topic all metadata traffic flows over.
pub const METADATA_TOPIC: &str = "/dbfleet/metadata/v1";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_json() {
        let msg = MetadataMessage::new(
            "A",
            MessagePayload::HealthPing {
                node: "A".into(),
                current: 3,
            },
        );
        let bytes = msg.encode().unwrap();
        let decoded = MetadataMessage::decode(&bytes).unwrap();
        assert_eq!(decoded.sender_node_id, "A");
        assert_eq!(decoded.payload.kind(), "HealthPing");
    }

    #[test]
    fn garbage_bytes_fail_to_decode_without_panicking() {
        let err = MetadataMessage::decode(b"not json at all");
        assert!(err.is_err());
    }

    #[test]
    fn unknown_tag_fails_to_decode() {
        let bytes = br#"{"sender_node_id":"A","timestamp":"2024-01-01T00:00:00Z","payload":{"type":"NotARealTag"}}"#;
        assert!(MetadataMessage::decode(bytes).is_err());
    }
}
