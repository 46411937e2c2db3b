//! Create-coordinator: accumulates offer responses for one in-flight
//! `CreateDatabase` and deterministically selects the final member set.

use crate::placement::PortPair;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Accumulates `CreateResponse` payloads for one pending
/// `CreateDatabase(name, rf)` under a single mutex.
pub struct CreateCoordinator {
    pub name: String,
    pub rf: usize,
    pub requester: String,
    responses: Mutex<HashMap<String, PortPair>>,
}

impl CreateCoordinator {
    pub fn new(name: impl Into<String>, rf: usize, requester: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rf,
            requester: requester.into(),
            responses: Mutex::new(HashMap::new()),
        }
    }

    /// Record a candidate's offer. Later offers from the same node
    /// overwrite earlier ones.
    pub fn add_response(&self, node: impl Into<String>, pair: PortPair) {
        self.responses.lock().insert(node.into(), pair);
    }

    pub fn response_count(&self) -> usize {
        self.responses.lock().len()
    }

    /// Block, polling at roughly [`POLL_INTERVAL`], until either the
    /// received count reaches `rf` or `timeout` elapses.
    pub async fn wait_for_responses(&self, timeout: Duration) -> HashMap<String, PortPair> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.response_count() >= self.rf || Instant::now() >= deadline {
                return self.responses.lock().clone();
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Sort accumulated responses lexicographically by node id and
    /// return the first `rf`.
    pub fn select_nodes(&self) -> Vec<(String, PortPair)> {
        let mut entries: Vec<(String, PortPair)> = self
            .responses
            .lock()
            .iter()
            .map(|(node, pair)| (node.clone(), *pair))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.truncate(self.rf);
        entries
    }
}

/// Maps `db_name -> CreateCoordinator` and forwards `CreateResponse`
/// messages to the matching coordinator.
#[derive(Default)]
pub struct CoordinatorRegistry {
    coordinators: Mutex<HashMap<String, Arc<CreateCoordinator>>>,
}

impl CoordinatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, coordinator: Arc<CreateCoordinator>) {
        self.coordinators
            .lock()
            .insert(coordinator.name.clone(), coordinator);
    }

    pub fn get(&self, name: &str) -> Option<Arc<CreateCoordinator>> {
        self.coordinators.lock().get(name).cloned()
    }

    /// Route an incoming `CreateResponse` to its coordinator, if any is
    /// still registered. Returns `true` if a coordinator accepted it.
    pub fn route_response(&self, name: &str, node: String, pair: PortPair) -> bool {
        match self.get(name) {
            Some(coordinator) => {
                coordinator.add_response(node, pair);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, name: &str) {
        self.coordinators.lock().remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(n: u16) -> PortPair {
        PortPair {
            http_port: n,
            raft_port: n + 1000,
        }
    }

    #[tokio::test]
    async fn wait_for_responses_returns_as_soon_as_rf_is_met() {
        let coordinator = Arc::new(CreateCoordinator::new("app1", 2, "A"));
        coordinator.add_response("A", pair(1));
        let c2 = coordinator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            c2.add_response("B", pair(2));
        });

        let start = Instant::now();
        let responses = coordinator
            .wait_for_responses(Duration::from_secs(2))
            .await;
        assert_eq!(responses.len(), 2);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn wait_for_responses_times_out_with_partial_set() {
        let coordinator = Arc::new(CreateCoordinator::new("x", 3, "A"));
        coordinator.add_response("A", pair(1));
        let responses = coordinator
            .wait_for_responses(Duration::from_millis(150))
            .await;
        assert_eq!(responses.len(), 1);
    }

    #[test]
    fn select_nodes_is_lexicographic_and_truncated() {
        let coordinator = CreateCoordinator::new("app1", 2, "A");
        coordinator.add_response("C", pair(3));
        coordinator.add_response("A", pair(1));
        coordinator.add_response("B", pair(2));
        let selected = coordinator.select_nodes();
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].0, "A");
        assert_eq!(selected[1].0, "B");
    }

    #[test]
    fn registry_routes_to_the_matching_coordinator() {
        let registry = CoordinatorRegistry::new();
        let coordinator = Arc::new(CreateCoordinator::new("app1", 1, "A"));
        registry.register(coordinator.clone());

        assert!(registry.route_response("app1", "B".into(), pair(1)));
        assert!(!registry.route_response("unknown", "B".into(), pair(1)));
        assert_eq!(coordinator.response_count(), 1);
    }
}
