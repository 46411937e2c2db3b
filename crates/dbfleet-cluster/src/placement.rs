//! Core data model: placements, node capacity, port pairs and instances.

use crate::clock::VectorClock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle status of a placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlacementStatus {
    Initializing,
    Active,
    Hibernating,
    Waking,
}

/// A `(http_port, raft_port, host)` triple owned by a node for one database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortPair {
    pub http_port: u16,
    pub raft_port: u16,
}

/// A port pair together with the host it is advertised on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub http_port: u16,
    pub raft_port: u16,
    pub host: String,
}

/// The cluster-wide record describing which nodes host a replicated
/// database and on which ports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub name: String,
    pub members: Vec<String>,
    pub port_mappings: HashMap<String, PortMapping>,
    pub status: PlacementStatus,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub leader_node: String,
    pub version: u64,
    pub vector_clock: VectorClock,
}

impl Placement {
    /// Build a freshly-initializing placement for `members`, authored by
    /// `author` (typically the local node applying a `CreateConfirm`).
    pub fn new_initializing(name: impl Into<String>, members: Vec<String>, author: &str) -> Self {
        let now = Utc::now();
        let leader_node = members.first().cloned().unwrap_or_default();
        let mut vector_clock = VectorClock::new();
        vector_clock.increment(author);
        Self {
            name: name.into(),
            members,
            port_mappings: HashMap::new(),
            status: PlacementStatus::Initializing,
            created_at: now,
            last_accessed: now,
            leader_node,
            version: 1,
            vector_clock,
        }
    }

    pub fn is_member(&self, node: &str) -> bool {
        self.members.iter().any(|m| m == node)
    }
}

/// A node's advertised capacity, refreshed by capacity announcements and
/// health pings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCapacity {
    pub node_id: String,
    pub max_databases: usize,
    pub current_databases: usize,
    pub http_port_range: (u16, u16),
    pub raft_port_range: (u16, u16),
    pub last_health_check: DateTime<Utc>,
    pub is_healthy: bool,
}

/// Considered stale, and thus unhealthy, after this long without an update.
pub const CAPACITY_STALE_AFTER_SECS: i64 = 30;

impl NodeCapacity {
    pub fn has_capacity(&self) -> bool {
        self.is_healthy && self.current_databases < self.max_databases
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        (now - self.last_health_check).num_seconds() > CAPACITY_STALE_AFTER_SECS
    }
}

/// Lifecycle status of the local subprocess handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    Initializing,
    Active,
    Hibernating,
    Waking,
}

/// A handle on the locally-running engine subprocess for one database.
#[derive(Debug, Clone)]
pub struct InstanceMeta {
    pub name: String,
    pub ports: PortPair,
    pub data_dir: String,
    pub advertised_http: String,
    pub advertised_raft: String,
    pub last_query: DateTime<Utc>,
    pub status: InstanceStatus,
}

impl InstanceMeta {
    pub fn is_idle(&self, timeout: chrono::Duration) -> bool {
        if timeout <= chrono::Duration::zero() {
            return false;
        }
        Utc::now() - self.last_query > timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_initializing_placement_has_version_one_and_self_incremented_clock() {
        let p = Placement::new_initializing("app1", vec!["A".into(), "B".into()], "A");
        assert_eq!(p.version, 1);
        assert_eq!(p.leader_node, "A");
        assert_eq!(p.vector_clock.get("A"), 1);
        assert_eq!(p.vector_clock.get("B"), 0);
    }

    #[test]
    fn zero_timeout_never_idle() {
        let inst = InstanceMeta {
            name: "x".into(),
            ports: PortPair {
                http_port: 1,
                raft_port: 2,
            },
            data_dir: "/tmp".into(),
            advertised_http: "h".into(),
            advertised_raft: "r".into(),
            last_query: Utc::now() - chrono::Duration::days(1),
            status: InstanceStatus::Active,
        };
        assert!(!inst.is_idle(chrono::Duration::zero()));
    }

    #[test]
    fn stale_capacity_detected_after_threshold() {
        let cap = NodeCapacity {
            node_id: "A".into(),
            max_databases: 10,
            current_databases: 1,
            http_port_range: (5000, 6000),
            raft_port_range: (7000, 8000),
            last_health_check: Utc::now() - chrono::Duration::seconds(31),
            is_healthy: true,
        };
        assert!(cap.is_stale(Utc::now()));
    }
}
