//! Lifecycle handlers: one function per bus message type, dispatched by
//! `ClusterManager::dispatch`. Each handler is non-blocking with respect
//! to the bus — anything that spawns or stops a subprocess runs in its
//! own task so the dispatcher never stalls behind a slow instance.

use crate::consensus;
use crate::manager::ClusterManager;
use crate::messages::{MessagePayload, MetadataMessage, METADATA_TOPIC};
use crate::placement::{Placement, PlacementStatus, PortMapping, PortPair};
use chrono::{DateTime, Utc};
use tracing::warn;

impl ClusterManager {
    #[tracing::instrument(skip(self, message), fields(kind = %message.payload.kind()))]
    pub async fn dispatch(&self, message: MetadataMessage) {
        if message.sender_node_id == self.node_id()
            && !matches!(message.payload, MessagePayload::CreateConfirm { .. })
        {
            return;
        }

        match message.payload {
            MessagePayload::CreateRequest { name, requester, rf } => {
                self.handle_create_request(name, requester, rf).await
            }
            MessagePayload::CreateResponse { name, node, pair } => {
                self.handle_create_response(name, node, pair).await
            }
            MessagePayload::CreateConfirm {
                name,
                selected_nodes,
                coordinator,
            } => self.handle_create_confirm(name, selected_nodes, coordinator).await,
            MessagePayload::StatusUpdate {
                name,
                node,
                status,
                ports,
            } => self.handle_status_update(name, node, status, ports).await,
            MessagePayload::Delete { name } => self.handle_delete(name).await,
            MessagePayload::IdleNotification {
                name,
                node,
                last_activity,
            } => self.handle_idle_notification(name, node, last_activity).await,
            MessagePayload::ShutdownCoordinated { name, shutdown_time } => {
                self.handle_shutdown_coordinated(name, shutdown_time).await
            }
            MessagePayload::WakeupRequest { name, requester } => {
                self.handle_wakeup_request(name, requester).await
            }
            MessagePayload::CapacityAnnouncement {
                node,
                max,
                current,
                http_range,
                raft_range,
            } => {
                self.handle_capacity_announcement(node, max, current, http_range, raft_range)
                    .await
            }
            MessagePayload::HealthPing { node, current } => {
                self.handle_health_ping(node, current).await
            }
            MessagePayload::HealthPong {
                node,
                healthy,
                ping_from,
            } => self.handle_health_pong(node, healthy, ping_from).await,
            MessagePayload::ReplacementNeeded {
                name,
                failed_node,
                current_members,
                rf,
            } => {
                self.handle_replacement_needed(name, failed_node, current_members, rf)
                    .await
            }
            MessagePayload::ReplacementOffer { name, new_node, pair } => {
                self.handle_replacement_offer(name, new_node, pair).await
            }
            MessagePayload::ReplacementConfirm {
                name,
                new_node,
                replaced_node,
                pair,
                join_address,
            } => {
                self.handle_replacement_confirm(name, new_node, replaced_node, pair, join_address)
                    .await
            }
            MessagePayload::Cleanup { name } => self.handle_cleanup(name).await,
            MessagePayload::MetadataSync { placement } => self.handle_metadata_sync(placement).await,
            MessagePayload::ChecksumRequest { request_id } => {
                self.handle_checksum_request(request_id).await
            }
            // No asynchronous checksum-reconciliation consumer exists in
            // the core; responses are logged at debug level elsewhere.
            MessagePayload::ChecksumResponse { .. } => {}
        }
    }

    async fn handle_create_request(&self, name: String, _requester: String, _rf: usize) {
        let is_system_db = name == self.config.system_database.name;
        let at_capacity = self
            .store
            .get_node(self.node_id())
            .map(|c| !c.has_capacity())
            .unwrap_or(false);
        if at_capacity && !is_system_db {
            return;
        }

        let pair = if is_system_db {
            if !self.config.system_database.has_fixed_ports() {
                return;
            }
            let fixed = PortPair {
                http_port: self.config.system_database.http_port,
                raft_port: self.config.system_database.raft_port,
            };
            match self.allocator.allocate_specific_pair(fixed) {
                Ok(()) => fixed,
                Err(_) => return,
            }
        } else {
            match self.allocate_pair_preferring_persisted(&name).await {
                Ok(p) => p,
                Err(err) => {
                    warn!(%name, %err, "no ports available to respond to create request");
                    return;
                }
            }
        };

        self.local.lock().pending_create_ports.insert(name.clone(), pair);

        let response = MetadataMessage::new(
            self.node_id(),
            MessagePayload::CreateResponse {
                name: name.clone(),
                node: self.node_id().to_string(),
                pair,
            },
        );
        if let Err(err) = self.bus.publish(METADATA_TOPIC, &response).await {
            warn!(%name, %err, "create response publish failed, releasing allocated ports");
            self.allocator.release_pair(pair);
            self.local.lock().pending_create_ports.remove(&name);
        }
    }

    async fn handle_create_response(&self, name: String, node: String, pair: PortPair) {
        self.local
            .lock()
            .pending_create_offers
            .entry(name.clone())
            .or_default()
            .insert(node.clone(), pair);
        self.coordinators.route_response(&name, node, pair);
    }

    async fn handle_create_confirm(
        &self,
        name: String,
        selected_nodes: Vec<String>,
        _coordinator: String,
    ) {
        if !selected_nodes.iter().any(|n| n == self.node_id()) {
            return;
        }

        {
            let mut local = self.local.lock();
            if self.store.get(&name).is_some() || local.initializing.contains(&name) {
                return;
            }
            local.initializing.insert(name.clone());
        }

        let own_pair = self.local.lock().pending_create_ports.remove(&name);
        let pair = match own_pair {
            Some(p) => p,
            None => match self.allocate_pair_preferring_persisted(&name).await {
                Ok(p) => p,
                Err(err) => {
                    warn!(%name, %err, "could not allocate ports while applying create confirm");
                    self.local.lock().initializing.remove(&name);
                    return;
                }
            },
        };

        let is_leader = selected_nodes.first().map(String::as_str) == Some(self.node_id());
        let placement = Placement::new_initializing(&name, selected_nodes.clone(), self.node_id());
        self.store.upsert(placement);

        let join = if is_leader {
            None
        } else {
            let leader = selected_nodes[0].clone();
            let leader_pair = self
                .local
                .lock()
                .pending_create_offers
                .get(&name)
                .and_then(|offers| offers.get(&leader))
                .copied();
            match leader_pair {
                Some(lp) => {
                    let host = self.peer_advertise_host(&leader).await;
                    Some((
                        format!("{host}:{}", lp.raft_port),
                        format!("{}:{}", self.config.advertise_host, pair.raft_port),
                    ))
                }
                None => {
                    warn!(%name, %leader, "no offer on record for the leader's port pair");
                    None
                }
            }
        };

        let this = self.clone();
        let db_name = name.clone();
        tokio::spawn(async move {
            this.activate_new_placement(db_name, pair, is_leader, join).await;
        });
    }

    async fn activate_new_placement(
        &self,
        name: String,
        pair: PortPair,
        is_leader: bool,
        join: Option<(String, String)>,
    ) {
        match self.supervisor.start(&self.config, &name, pair, is_leader, join).await {
            Ok(instance) => {
                let _ = crate::ports::persist_pair(
                    &self.config.data_dir,
                    &name,
                    pair,
                    &self.config.advertise_host,
                )
                .await;
                self.instances.write().await.insert(name.clone(), instance);
                self.local.lock().initializing.remove(&name);

                if let Some(mut placement) = self.store.get(&name) {
                    placement.status = PlacementStatus::Active;
                    placement.port_mappings.insert(
                        self.node_id().to_string(),
                        PortMapping {
                            http_port: pair.http_port,
                            raft_port: pair.raft_port,
                            host: self.config.advertise_host.clone(),
                        },
                    );
                    consensus::update_metadata(&mut placement, self.node_id());
                    self.store.upsert(placement.clone());

                    let status = MetadataMessage::new(
                        self.node_id(),
                        MessagePayload::StatusUpdate {
                            name: name.clone(),
                            node: self.node_id().to_string(),
                            status: placement.status,
                            ports: placement.port_mappings.get(self.node_id()).cloned(),
                        },
                    );
                    let _ = self.bus.publish(METADATA_TOPIC, &status).await;

                    let sync = MetadataMessage::new(
                        self.node_id(),
                        MessagePayload::MetadataSync { placement },
                    );
                    let _ = self.bus.publish(METADATA_TOPIC, &sync).await;
                }
            }
            Err(err) => {
                warn!(%name, %err, "engine instance failed to start for create confirm");
                self.local.lock().initializing.remove(&name);
                let status = MetadataMessage::new(
                    self.node_id(),
                    MessagePayload::StatusUpdate {
                        name: name.clone(),
                        node: self.node_id().to_string(),
                        status: PlacementStatus::Initializing,
                        ports: None,
                    },
                );
                let _ = self.bus.publish(METADATA_TOPIC, &status).await;
            }
        }
    }

    async fn handle_status_update(
        &self,
        name: String,
        _node: String,
        status: PlacementStatus,
        _ports: Option<PortMapping>,
    ) {
        if let Some(mut placement) = self.store.get(&name) {
            placement.status = status;
            placement.last_accessed = Utc::now();
            self.store.upsert(placement);
        }
    }

    async fn handle_delete(&self, name: String) {
        let Some(placement) = self.store.get(&name) else {
            return;
        };
        if placement.is_member(self.node_id()) {
            let mut instances = self.instances.write().await;
            if let Some(mut instance) = instances.remove(&name) {
                drop(instances);
                let _ = self.supervisor.stop(&mut instance).await;
                self.allocator.release_pair(instance.meta.ports);
            }
        }
        self.store.delete(&name);
    }

    async fn handle_idle_notification(&self, name: String, node: String, _last_activity: DateTime<Utc>) {
        let Some(placement) = self.store.get(&name) else {
            return;
        };
        if !placement.is_member(&node) {
            return;
        }

        let all_reported = {
            let mut local = self.local.lock();
            let reporters = local.idle_reporters.entry(name.clone()).or_default();
            reporters.insert(node);
            placement.members.iter().all(|m| reporters.contains(m))
        };
        if !all_reported {
            return;
        }
        self.local.lock().idle_reporters.remove(&name);

        let Some(coordinator) = consensus::select_coordinator(&placement.members) else {
            return;
        };
        if coordinator != self.node_id() {
            return;
        }

        let msg = MetadataMessage::new(
            self.node_id(),
            MessagePayload::ShutdownCoordinated {
                name: name.clone(),
                shutdown_time: Utc::now() + crate::manager::SHUTDOWN_GRACE,
            },
        );
        if let Err(err) = self.bus.publish(METADATA_TOPIC, &msg).await {
            warn!(%name, %err, "shutdown-coordinated publish failed");
        }
    }

    async fn handle_shutdown_coordinated(&self, name: String, shutdown_time: DateTime<Utc>) {
        let Some(placement) = self.store.get(&name) else {
            return;
        };
        if !placement.is_member(self.node_id()) {
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            let now = Utc::now();
            if shutdown_time > now {
                if let Ok(d) = (shutdown_time - now).to_std() {
                    tokio::time::sleep(d).await;
                }
            }
            this.complete_coordinated_shutdown(name).await;
        });
    }

    async fn complete_coordinated_shutdown(&self, name: String) {
        let mut instances = self.instances.write().await;
        if let Some(mut instance) = instances.remove(&name) {
            drop(instances);
            let _ = self.supervisor.stop(&mut instance).await;
            self.allocator.release_pair(instance.meta.ports);
        }

        if let Some(mut placement) = self.store.get(&name) {
            placement.status = PlacementStatus::Hibernating;
            consensus::update_metadata(&mut placement, self.node_id());
            self.store.upsert(placement);
        }

        let msg = MetadataMessage::new(
            self.node_id(),
            MessagePayload::StatusUpdate {
                name: name.clone(),
                node: self.node_id().to_string(),
                status: PlacementStatus::Hibernating,
                ports: None,
            },
        );
        if let Err(err) = self.bus.publish(METADATA_TOPIC, &msg).await {
            warn!(%name, %err, "hibernation status-update publish failed");
        }
    }

    async fn handle_wakeup_request(&self, name: String, _requester: String) {
        let Some(mut placement) = self.store.get(&name) else {
            return;
        };
        if !placement.is_member(self.node_id()) || placement.status != PlacementStatus::Hibernating {
            return;
        }

        placement.status = PlacementStatus::Waking;
        self.store.upsert(placement.clone());

        let this = self.clone();
        tokio::spawn(async move {
            this.wake_instance(placement).await;
        });
    }

    async fn wake_instance(&self, mut placement: Placement) {
        let name = placement.name.clone();
        let pair = match self.allocate_pair_preferring_persisted(&name).await {
            Ok(p) => p,
            Err(err) => {
                warn!(%name, %err, "no ports available to wake instance");
                return;
            }
        };

        let is_leader = placement.members.first().map(String::as_str) == Some(self.node_id());
        let join = if is_leader {
            None
        } else {
            placement
                .port_mappings
                .get(&placement.members[0])
                .map(|m| {
                    (
                        format!("{}:{}", m.host, m.raft_port),
                        format!("{}:{}", self.config.advertise_host, pair.raft_port),
                    )
                })
        };

        match self.supervisor.start(&self.config, &name, pair, is_leader, join).await {
            Ok(instance) => {
                let _ = crate::ports::persist_pair(
                    &self.config.data_dir,
                    &name,
                    pair,
                    &self.config.advertise_host,
                )
                .await;
                self.instances.write().await.insert(name.clone(), instance);

                placement.status = PlacementStatus::Active;
                placement.port_mappings.insert(
                    self.node_id().to_string(),
                    PortMapping {
                        http_port: pair.http_port,
                        raft_port: pair.raft_port,
                        host: self.config.advertise_host.clone(),
                    },
                );
                consensus::update_metadata(&mut placement, self.node_id());
                self.store.upsert(placement.clone());

                let status = MetadataMessage::new(
                    self.node_id(),
                    MessagePayload::StatusUpdate {
                        name: name.clone(),
                        node: self.node_id().to_string(),
                        status: placement.status,
                        ports: placement.port_mappings.get(self.node_id()).cloned(),
                    },
                );
                let _ = self.bus.publish(METADATA_TOPIC, &status).await;
            }
            Err(err) => {
                warn!(%name, %err, "engine instance failed to wake");
            }
        }
    }

    async fn handle_capacity_announcement(
        &self,
        node: String,
        max: usize,
        current: usize,
        http_range: (u16, u16),
        raft_range: (u16, u16),
    ) {
        self.store.set_node(crate::manager::capacity_from_announcement(
            node, max, current, http_range, raft_range,
        ));
    }

    async fn handle_health_ping(&self, node: String, _current: usize) {
        let pong = MetadataMessage::new(
            self.node_id(),
            MessagePayload::HealthPong {
                node: self.node_id().to_string(),
                healthy: true,
                ping_from: node,
            },
        );
        if let Err(err) = self.bus.publish(METADATA_TOPIC, &pong).await {
            warn!(%err, "health pong publish failed");
        }
    }

    async fn handle_health_pong(&self, node: String, healthy: bool, _ping_from: String) {
        if let Some(mut cap) = self.store.get_node(&node) {
            cap.is_healthy = healthy;
            cap.last_health_check = Utc::now();
            self.store.set_node(cap);
        }
    }

    async fn handle_replacement_needed(
        &self,
        name: String,
        _failed_node: String,
        current_members: Vec<String>,
        _rf: usize,
    ) {
        if current_members.iter().any(|m| m == self.node_id()) {
            return;
        }
        let has_capacity = self
            .store
            .get_node(self.node_id())
            .map(|c| c.has_capacity())
            .unwrap_or(true);
        if !has_capacity {
            return;
        }

        let pair = match self.allocator.allocate_pair() {
            Ok(p) => p,
            Err(err) => {
                warn!(%name, %err, "no ports available to offer as a replacement");
                return;
            }
        };

        let offer = MetadataMessage::new(
            self.node_id(),
            MessagePayload::ReplacementOffer {
                name,
                new_node: self.node_id().to_string(),
                pair,
            },
        );
        if let Err(err) = self.bus.publish(METADATA_TOPIC, &offer).await {
            warn!(%err, "replacement-offer publish failed");
            self.allocator.release_pair(pair);
        }
    }

    /// First-offer-wins: only the deterministic coordinator among the
    /// surviving members (excluding the inferred failed member) confirms
    /// a given offer, and only once per `(name, failed_node)`.
    async fn handle_replacement_offer(&self, name: String, new_node: String, pair: PortPair) {
        let Some(placement) = self.store.get(&name) else {
            return;
        };
        if !placement.is_member(self.node_id()) {
            return;
        }

        let now = Utc::now();
        let failed_node = placement.members.iter().find(|m| {
            *m != &new_node
                && self
                    .store
                    .get_node(m)
                    .map(|c| c.is_stale(now) || !c.is_healthy)
                    .unwrap_or(false)
        });
        let Some(failed_node) = failed_node.cloned() else {
            return;
        };

        let key = format!("{name}:{failed_node}");
        {
            let mut local = self.local.lock();
            if local.replacement_inflight.contains(&key) {
                return;
            }
            local.replacement_inflight.insert(key);
        }

        let surviving: Vec<String> = placement
            .members
            .iter()
            .filter(|m| **m != failed_node)
            .cloned()
            .collect();
        if consensus::select_coordinator(&surviving).as_deref() != Some(self.node_id()) {
            return;
        }

        let join_address = placement
            .port_mappings
            .get(self.node_id())
            .map(|m| format!("{}:{}", m.host, m.raft_port))
            .unwrap_or_default();

        let confirm = MetadataMessage::new(
            self.node_id(),
            MessagePayload::ReplacementConfirm {
                name,
                new_node,
                replaced_node: failed_node,
                pair,
                join_address,
            },
        );
        if let Err(err) = self.bus.publish(METADATA_TOPIC, &confirm).await {
            warn!(%err, "replacement-confirm publish failed");
        }
    }

    async fn handle_replacement_confirm(
        &self,
        name: String,
        new_node: String,
        replaced_node: String,
        pair: PortPair,
        join_address: String,
    ) {
        if let Some(mut placement) = self.store.get(&name) {
            if let Some(pos) = placement.members.iter().position(|m| *m == replaced_node) {
                placement.members[pos] = new_node.clone();
            }
            placement.port_mappings.remove(&replaced_node);
            consensus::update_metadata(&mut placement, self.node_id());
            self.store.upsert(placement);

            self.local
                .lock()
                .replacement_inflight
                .remove(&format!("{name}:{replaced_node}"));
        }

        if new_node == self.node_id() {
            let this = self.clone();
            tokio::spawn(async move {
                this.join_as_replacement(name, pair, join_address).await;
            });
        }
    }

    async fn join_as_replacement(&self, name: String, pair: PortPair, join_address: String) {
        if let Err(err) = self.allocator.allocate_specific_pair(pair) {
            warn!(%name, %err, "could not claim the offered replacement ports");
            return;
        }

        let join = Some((
            join_address,
            format!("{}:{}", self.config.advertise_host, pair.raft_port),
        ));
        match self.supervisor.start(&self.config, &name, pair, false, join).await {
            Ok(instance) => {
                let _ = crate::ports::persist_pair(
                    &self.config.data_dir,
                    &name,
                    pair,
                    &self.config.advertise_host,
                )
                .await;
                self.instances.write().await.insert(name.clone(), instance);

                if let Some(mut placement) = self.store.get(&name) {
                    placement.status = PlacementStatus::Active;
                    placement.port_mappings.insert(
                        self.node_id().to_string(),
                        PortMapping {
                            http_port: pair.http_port,
                            raft_port: pair.raft_port,
                            host: self.config.advertise_host.clone(),
                        },
                    );
                    consensus::update_metadata(&mut placement, self.node_id());
                    self.store.upsert(placement.clone());

                    let status = MetadataMessage::new(
                        self.node_id(),
                        MessagePayload::StatusUpdate {
                            name: name.clone(),
                            node: self.node_id().to_string(),
                            status: placement.status,
                            ports: placement.port_mappings.get(self.node_id()).cloned(),
                        },
                    );
                    let _ = self.bus.publish(METADATA_TOPIC, &status).await;
                }
            }
            Err(err) => {
                warn!(%name, %err, "engine instance failed to join as replacement");
                self.allocator.release_pair(pair);
            }
        }
    }

    async fn handle_cleanup(&self, name: String) {
        let known_member = self
            .store
            .get(&name)
            .map(|p| p.is_member(self.node_id()))
            .unwrap_or(false);
        if known_member {
            return;
        }
        let dir = std::path::Path::new(&self.config.data_dir).join(&name);
        if dir.exists() {
            if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
                warn!(%name, %err, "cleanup failed to remove directory");
            }
        }
    }

    /// Unknown locally: accept as-is. Known: resolve and upsert only if
    /// the remote view won.
    async fn handle_metadata_sync(&self, placement: Placement) {
        match self.store.get(&placement.name) {
            None => self.store.upsert(placement),
            Some(local) => {
                let remote = placement.clone();
                let winner = consensus::resolve_conflict(local, placement);
                if winner == remote {
                    self.store.upsert(winner);
                }
            }
        }
    }

    async fn handle_checksum_request(&self, request_id: String) {
        let checksums = consensus::compute_whole_state_checksum(&self.store.list());
        let response = MetadataMessage::new(
            self.node_id(),
            MessagePayload::ChecksumResponse {
                request_id,
                checksums,
            },
        );
        if let Err(err) = self.bus.publish(METADATA_TOPIC, &response).await {
            warn!(%err, "checksum response publish failed");
        }
    }

    /// Try the persisted pair for `name` first (per §4.3's sticky-port
    /// rule), falling back to dynamic allocation.
    pub(crate) async fn allocate_pair_preferring_persisted(
        &self,
        name: &str,
    ) -> crate::error::Result<PortPair> {
        if let Some(persisted) =
            crate::ports::load_persisted_pair(&self.config.data_dir, name).await
        {
            let candidate = PortPair {
                http_port: persisted.http_port,
                raft_port: persisted.raft_port,
            };
            if self.allocator.allocate_specific_pair(candidate).is_ok() {
                return Ok(candidate);
            }
        }
        self.allocator.allocate_pair()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterManagerConfig;
    use crate::external::bus::fake::InMemoryBus;
    use crate::external::discovery::fake::StaticDiscovery;
    use std::sync::Arc;

    fn test_config(node_id: &str, http_start: u16, raft_start: u16) -> ClusterManagerConfig {
        let mut cfg = ClusterManagerConfig::default();
        cfg.node_id = node_id.to_string();
        cfg.ports.http.start = http_start;
        cfg.ports.http.end = http_start + 50;
        cfg.ports.raft.start = raft_start;
        cfg.ports.raft.end = raft_start + 50;
        cfg.data_dir = std::env::temp_dir()
            .join(format!("dbfleet-handlers-test-{node_id}-{http_start}"))
            .to_string_lossy()
            .into_owned();
        cfg
    }

    async fn new_manager(node_id: &str, http_start: u16, raft_start: u16, bus: Arc<dyn crate::external::bus::Bus>) -> ClusterManager {
        ClusterManager::new(
            test_config(node_id, http_start, raft_start),
            bus,
            Arc::new(StaticDiscovery::new(Vec::new())),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn create_request_responds_with_a_port_offer() {
        let bus = InMemoryBus::new();
        let mgr = new_manager("A", 22000, 23000, bus.clone()).await;
        mgr.handle_create_request("app1".into(), "A".into(), 1).await;
        assert!(mgr.local.lock().pending_create_ports.contains_key("app1"));
    }

    #[tokio::test]
    async fn create_request_is_skipped_at_capacity_for_non_system_db() {
        let bus = InMemoryBus::new();
        let mgr = new_manager("A", 22100, 23100, bus).await;
        mgr.store.set_node(crate::placement::NodeCapacity {
            node_id: "A".into(),
            max_databases: 1,
            current_databases: 1,
            http_port_range: (22100, 22150),
            raft_port_range: (23100, 23150),
            last_health_check: Utc::now(),
            is_healthy: true,
        });
        mgr.handle_create_request("app1".into(), "A".into(), 1).await;
        assert!(!mgr.local.lock().pending_create_ports.contains_key("app1"));
    }

    #[tokio::test]
    async fn status_update_refreshes_known_placement() {
        let bus = InMemoryBus::new();
        let mgr = new_manager("A", 22200, 23200, bus).await;
        let placement = Placement::new_initializing("app1", vec!["A".into()], "A");
        mgr.store.upsert(placement);
        mgr.handle_status_update("app1".into(), "A".into(), PlacementStatus::Active, None)
            .await;
        assert_eq!(mgr.store.get("app1").unwrap().status, PlacementStatus::Active);
    }

    #[tokio::test]
    async fn health_ping_triggers_a_pong() {
        let bus = InMemoryBus::new();
        let mgr = new_manager("A", 22300, 23300, bus.clone()).await;
        let received: Arc<parking_lot::Mutex<Vec<MessagePayload>>> = Arc::default();
        struct Recorder(Arc<parking_lot::Mutex<Vec<MessagePayload>>>);
        #[async_trait::async_trait]
        impl crate::external::bus::MessageHandler for Recorder {
            async fn handle(&self, _topic: &str, message: MetadataMessage) {
                self.0.lock().push(message.payload);
            }
        }
        bus.subscribe(METADATA_TOPIC, Arc::new(Recorder(received.clone())))
            .await
            .unwrap();

        mgr.handle_health_ping("B".into(), 2).await;
        let msgs = received.lock();
        assert!(msgs
            .iter()
            .any(|p| matches!(p, MessagePayload::HealthPong { healthy: true, .. })));
    }

    #[tokio::test]
    async fn metadata_sync_accepts_unknown_placement() {
        let bus = InMemoryBus::new();
        let mgr = new_manager("A", 22400, 23400, bus).await;
        let placement = Placement::new_initializing("app1", vec!["A".into()], "A");
        mgr.handle_metadata_sync(placement.clone()).await;
        assert_eq!(mgr.store.get("app1").unwrap().version, placement.version);
    }

    #[tokio::test]
    async fn idle_notification_requires_every_member_to_report() {
        let bus = InMemoryBus::new();
        let mgr = new_manager("A", 22500, 23500, bus).await;
        let placement = Placement::new_initializing("app1", vec!["A".into(), "B".into()], "A");
        mgr.store.upsert(placement);

        mgr.handle_idle_notification("app1".into(), "A".into(), Utc::now()).await;
        assert!(mgr.local.lock().idle_reporters.get("app1").unwrap().len() == 1);
    }

    #[tokio::test]
    async fn checksum_request_replies_with_current_state() {
        let bus = InMemoryBus::new();
        let mgr = new_manager("A", 22600, 23600, bus.clone()).await;
        let placement = Placement::new_initializing("app1", vec!["A".into()], "A");
        mgr.store.upsert(placement);

        let received: Arc<parking_lot::Mutex<Vec<MessagePayload>>> = Arc::default();
        struct Recorder(Arc<parking_lot::Mutex<Vec<MessagePayload>>>);
        #[async_trait::async_trait]
        impl crate::external::bus::MessageHandler for Recorder {
            async fn handle(&self, _topic: &str, message: MetadataMessage) {
                self.0.lock().push(message.payload);
            }
        }
        bus.subscribe(METADATA_TOPIC, Arc::new(Recorder(received.clone())))
            .await
            .unwrap();

        mgr.handle_checksum_request("req-1".into()).await;
        let msgs = received.lock();
        assert!(msgs.iter().any(|p| matches!(
            p,
            MessagePayload::ChecksumResponse { request_id, checksums } if request_id == "req-1" && checksums.len() == 1
        )));
    }
}
