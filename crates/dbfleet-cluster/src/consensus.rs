//! Deterministic coordinator selection, conflict resolution, and checksums.
//!
//! Every function here is a pure computation over already-known state so
//! that any two nodes observing the same inputs reach the same answer
//! without exchanging additional messages.

use crate::clock::VectorClockOrdering;
use crate::placement::{NodeCapacity, Placement};
use sha2::{Digest, Sha256};

/// Lowest node identifier under lexicographic order; `None` for an empty
/// input.
pub fn select_coordinator(nodes: &[String]) -> Option<String> {
    nodes.iter().min().cloned()
}

/// Sort healthy nodes lexicographically and take the first `rf`.
pub fn select_nodes_for_placement(healthy: &[String], rf: usize) -> Vec<String> {
    let mut sorted: Vec<String> = healthy.to_vec();
    sorted.sort();
    sorted.truncate(rf);
    sorted
}

/// Resolve a conflicting pair of placement views for the same database
/// name, returning the winner.
///
/// If one vector clock strictly precedes the other, the later one wins.
/// If concurrent, the tiebreak order is: higher `version`, then earlier
/// `created_at`, then lexicographically smaller `name`.
pub fn resolve_conflict(local: Placement, remote: Placement) -> Placement {
    match local.vector_clock.compare(&remote.vector_clock) {
        VectorClockOrdering::Before => remote,
        VectorClockOrdering::After => local,
        VectorClockOrdering::Equal => local,
        VectorClockOrdering::Concurrent => {
            if local.version != remote.version {
                if local.version > remote.version {
                    local
                } else {
                    remote
                }
            } else if local.created_at != remote.created_at {
                if local.created_at < remote.created_at {
                    local
                } else {
                    remote
                }
            } else if local.name <= remote.name {
                local
            } else {
                remote
            }
        }
    }
}

/// SHA-256 over a canonical serialization of `(name, sorted members,
/// port_mappings, status)`, independent of member ordering.
pub fn compute_checksum(placement: &Placement) -> String {
    let mut members = placement.members.clone();
    members.sort();

    let mut mappings: Vec<(&String, u16, u16, &str)> = placement
        .port_mappings
        .iter()
        .map(|(node, pm)| (node, pm.http_port, pm.raft_port, pm.host.as_str()))
        .collect();
    mappings.sort_by(|a, b| a.0.cmp(b.0));

    let mut hasher = Sha256::new();
    hasher.update(placement.name.as_bytes());
    for m in &members {
        hasher.update(b"|");
        hasher.update(m.as_bytes());
    }
    for (node, http, raft, host) in &mappings {
        hasher.update(b"|");
        hasher.update(node.as_bytes());
        hasher.update(http.to_be_bytes());
        hasher.update(raft.to_be_bytes());
        hasher.update(host.as_bytes());
    }
    hasher.update(format!("{:?}", placement.status).as_bytes());

    hex::encode(hasher.finalize())
}

/// One entry of a whole-state checksum listing, sorted by name.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DatabaseChecksum {
    pub name: String,
    pub checksum: String,
}

/// Compute the whole-state checksum list, sorted by database name.
pub fn compute_whole_state_checksum(placements: &[Placement]) -> Vec<DatabaseChecksum> {
    let mut out: Vec<DatabaseChecksum> = placements
        .iter()
        .map(|p| DatabaseChecksum {
            name: p.name.clone(),
            checksum: compute_checksum(p),
        })
        .collect();
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
}

/// Increment `version`, bump `node`'s vector clock entry, and refresh
/// `last_accessed` on a locally-originated update.
pub fn update_metadata(placement: &mut Placement, node: &str) {
    placement.version += 1;
    placement.vector_clock.increment(node);
    placement.last_accessed = chrono::Utc::now();
}

/// Filter `capacities` down to nodes that are healthy and have spare
/// capacity.
pub fn healthy_nodes(capacities: &[NodeCapacity]) -> Vec<String> {
    capacities
        .iter()
        .filter(|c| c.has_capacity())
        .map(|c| c.node_id.clone())
        .collect()
}

/// Quorum predicate: `active >= floor(members / 2) + 1`.
pub fn has_quorum(active: usize, members: usize) -> bool {
    active >= members / 2 + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placement::PlacementStatus;

    #[test]
    fn select_coordinator_is_lexicographic_min() {
        let nodes = vec!["C".to_string(), "A".to_string(), "B".to_string()];
        assert_eq!(select_coordinator(&nodes), Some("A".to_string()));
    }

    #[test]
    fn select_coordinator_empty_input_is_none() {
        let nodes: Vec<String> = Vec::new();
        assert_eq!(select_coordinator(&nodes), None);
    }

    #[test]
    fn select_nodes_for_placement_sorts_and_truncates() {
        let healthy = vec!["C".to_string(), "A".to_string(), "B".to_string(), "D".to_string()];
        let selected = select_nodes_for_placement(&healthy, 2);
        assert_eq!(selected, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn checksum_is_invariant_to_member_order() {
        let mut p1 = Placement::new_initializing("app1", vec!["A".into(), "B".into()], "A");
        p1.status = PlacementStatus::Active;
        let mut p2 = p1.clone();
        p2.members = vec!["B".into(), "A".into()];
        assert_eq!(compute_checksum(&p1), compute_checksum(&p2));
    }

    #[test]
    fn resolve_conflict_prefers_strictly_later_clock() {
        let mut local = Placement::new_initializing("db", vec!["A".into()], "A");
        let mut remote = local.clone();
        remote.vector_clock.increment("A");
        remote.version += 1;
        let winner = resolve_conflict(local.clone(), remote.clone());
        assert_eq!(winner.version, remote.version);
        local.vector_clock.increment("A");
        local.vector_clock.increment("A");
        let winner2 = resolve_conflict(local.clone(), remote);
        assert_eq!(winner2.vector_clock.get("A"), local.vector_clock.get("A"));
    }

    #[test]
    fn resolve_conflict_concurrent_tiebreaks_on_version_then_created_at() {
        let mut a = Placement::new_initializing("c", vec!["A".into(), "B".into()], "A");
        a.vector_clock.increment("A");
        a.vector_clock.increment("A");
        a.version = 5;

        let mut b = Placement::new_initializing("c", vec!["A".into(), "B".into()], "B");
        b.vector_clock.increment("B");
        b.vector_clock.increment("B");
        b.version = 5;
        // make a's created_at strictly earlier than b's
        a.created_at = b.created_at - chrono::Duration::seconds(1);

        assert!(a.vector_clock.is_concurrent(&b.vector_clock));

        let winner = resolve_conflict(a.clone(), b.clone());
        // equal version, earlier created_at wins per S6
        assert_eq!(winner.created_at, a.created_at);

        // result must be the same regardless of argument order
        let winner2 = resolve_conflict(b, a.clone());
        assert_eq!(winner2.created_at, winner.created_at);
    }

    #[test]
    fn has_quorum_matches_floor_half_plus_one() {
        assert!(!has_quorum(1, 3));
        assert!(has_quorum(2, 3));
        assert!(has_quorum(3, 3));
        assert!(has_quorum(3, 5));
        assert!(!has_quorum(2, 5));
    }
}
