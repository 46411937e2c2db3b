//! The per-node Cluster Manager: owns every component and runs the
//! periodic loops described in the top-level component design.

use crate::config::ClusterManagerConfig;
use crate::consensus;
use crate::coordinator::{CoordinatorRegistry, CreateCoordinator};
use crate::error::{ClusterError, Result};
use crate::external::bus::{Bus, MessageHandler};
use crate::external::discovery::Discovery;
use crate::external::engine::EngineStatus;
use crate::messages::{MessagePayload, MetadataMessage, METADATA_TOPIC};
use crate::placement::{NodeCapacity, Placement, PlacementStatus, PortMapping, PortPair};
use crate::ports::PortAllocator;
use crate::store::MetadataStore;
use crate::supervisor::{InstanceSupervisor, RunningInstance};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const CREATE_RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);
const CAPACITY_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);
const IDLE_DETECTION_INTERVAL: Duration = Duration::from_secs(10);
const ORPHAN_RECONCILE_DELAY: Duration = Duration::from_secs(10);
const SYSTEM_DB_PEER_WAIT: Duration = Duration::from_secs(15);
const SYSTEM_DB_CREATE_RETRIES: u32 = 3;
const SYSTEM_DB_RETRY_INTERVAL: Duration = Duration::from_secs(3);
const SYSTEM_DB_ACTIVE_WAIT: Duration = Duration::from_secs(60);
const SPLIT_BRAIN_WARMUP: Duration = Duration::from_secs(30);
const SPLIT_BRAIN_CHECK_INTERVAL: Duration = Duration::from_secs(60);
pub(crate) const SHUTDOWN_GRACE: chrono::Duration = chrono::Duration::seconds(5);

/// Per-placement bookkeeping that is not itself part of the replicated
/// metadata: which nodes have reported idle, offers a create is still
/// waiting on, and whether a create or replacement is in flight locally.
#[derive(Default)]
pub(crate) struct LocalState {
    pub(crate) initializing: HashSet<String>,
    pub(crate) idle_reporters: HashMap<String, HashSet<String>>,
    pub(crate) replacement_inflight: HashSet<String>,
    pub(crate) pending_create_ports: HashMap<String, PortPair>,
    pub(crate) pending_create_offers: HashMap<String, HashMap<String, PortPair>>,
}

/// Owns all cluster-manager components for one node.
#[derive(Clone)]
pub struct ClusterManager {
    pub(crate) config: Arc<ClusterManagerConfig>,
    pub(crate) store: Arc<MetadataStore>,
    pub(crate) allocator: Arc<PortAllocator>,
    pub(crate) coordinators: Arc<CoordinatorRegistry>,
    pub(crate) supervisor: Arc<InstanceSupervisor>,
    pub(crate) bus: Arc<dyn Bus>,
    pub(crate) discovery: Arc<dyn Discovery>,
    pub(crate) instances: Arc<RwLock<HashMap<String, RunningInstance>>>,
    pub(crate) local: Arc<Mutex<LocalState>>,
    pub(crate) running: Arc<RwLock<bool>>,
}

impl ClusterManager {
    pub fn new(
        config: ClusterManagerConfig,
        bus: Arc<dyn Bus>,
        discovery: Arc<dyn Discovery>,
    ) -> Result<Self> {
        config.validate()?;
        let allocator = PortAllocator::new(config.ports.http, config.ports.raft);
        Ok(Self {
            config: Arc::new(config),
            store: Arc::new(MetadataStore::new()),
            allocator: Arc::new(allocator),
            coordinators: Arc::new(CoordinatorRegistry::new()),
            supervisor: Arc::new(InstanceSupervisor::new()),
            bus,
            discovery,
            instances: Arc::new(RwLock::new(HashMap::new())),
            local: Arc::new(Mutex::new(LocalState::default())),
            running: Arc::new(RwLock::new(false)),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Subscribe to the metadata topic, attempt system-database bootstrap,
    /// then launch the background loops.
    pub async fn start(&self) -> Result<()> {
        {
            let mut running = self.running.write().await;
            if *running {
                return Ok(());
            }
            *running = true;
        }

        self.bus
            .subscribe(METADATA_TOPIC, Arc::new(DispatchHandler(self.clone())))
            .await?;

        self.initialize_system_database().await;

        let capacity_task = self.clone();
        tokio::spawn(async move { capacity_task.capacity_announce_loop().await });

        let health_task = self.clone();
        tokio::spawn(async move { health_task.health_loop().await });

        let idle_task = self.clone();
        tokio::spawn(async move { idle_task.idle_detection_loop().await });

        let orphan_task = self.clone();
        tokio::spawn(async move { orphan_task.orphan_reconciliation_once().await });

        let split_brain_task = self.clone();
        tokio::spawn(async move { split_brain_task.split_brain_loop().await });

        Ok(())
    }

    /// Cancel all background loops and stop every active instance.
    pub async fn stop(&self) -> Result<()> {
        *self.running.write().await = false;

        let names: Vec<String> = self.instances.read().await.keys().cloned().collect();
        for name in names {
            let mut instances = self.instances.write().await;
            if let Some(mut instance) = instances.remove(&name) {
                drop(instances);
                if let Err(err) = self.supervisor.stop(&mut instance).await {
                    warn!(%name, %err, "error stopping instance during shutdown");
                }
                self.allocator.release_pair(instance.meta.ports);
            }
        }
        Ok(())
    }

    async fn initialize_system_database(&self) {
        let name = self.config.system_database.name.clone();

        self.wait_for_min_cluster_size().await;

        if self.config.min_cluster_size <= 1 {
            if let Some(join_address) = self.config.rqlite_join_address.clone() {
                self.bootstrap_system_database_via_join(&name, join_address).await;
                self.apply_migrations(&name).await;
                return;
            }
        }

        tokio::time::sleep(SYSTEM_DB_PEER_WAIT).await;

        if self.store.get(&name).is_none() {
            for attempt in 0..SYSTEM_DB_CREATE_RETRIES {
                if self.store.get(&name).is_some() {
                    break;
                }
                let rf = self.config.system_database.replication_factor;
                if let Err(err) = self.create_database(&name, rf).await {
                    debug!(attempt, %err, "system database create attempt did not complete");
                }
                tokio::time::sleep(SYSTEM_DB_RETRY_INTERVAL).await;
            }
        }

        let deadline = tokio::time::Instant::now() + SYSTEM_DB_ACTIVE_WAIT;
        loop {
            if let Some(p) = self.store.get(&name) {
                if matches!(p.status, PlacementStatus::Active) {
                    info!("system database active");
                    self.apply_migrations(&name).await;
                    return;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("system database did not become active within the startup window");
                return;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Block until at least `min_cluster_size` nodes (this one included)
    /// are visible via discovery. A configured size of 0 or 1 never waits.
    async fn wait_for_min_cluster_size(&self) {
        if self.config.min_cluster_size <= 1 {
            return;
        }
        loop {
            let seen = self.discovery.get_active_peers().await.len() + 1;
            if seen >= self.config.min_cluster_size {
                return;
            }
            if !self.is_running().await {
                return;
            }
            debug!(
                seen,
                required = self.config.min_cluster_size,
                "waiting for minimum cluster size before starting the local engine"
            );
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    /// Single-engine mode: instead of running the placement protocol,
    /// start the local engine directly as a follower joining a
    /// pre-existing address and record a single-member placement for it.
    async fn bootstrap_system_database_via_join(&self, name: &str, join_address: String) {
        if self.store.get(name).is_some() {
            return;
        }

        let pair = if self.config.system_database.has_fixed_ports() {
            let fixed = PortPair {
                http_port: self.config.system_database.http_port,
                raft_port: self.config.system_database.raft_port,
            };
            match self.allocator.allocate_specific_pair(fixed) {
                Ok(()) => fixed,
                Err(err) => {
                    warn!(%name, %err, "fixed system database ports unavailable for join bootstrap");
                    return;
                }
            }
        } else {
            match self.allocator.allocate_pair() {
                Ok(p) => p,
                Err(err) => {
                    warn!(%name, %err, "no ports available for join bootstrap");
                    return;
                }
            }
        };

        let join = Some((
            join_address.clone(),
            format!("{}:{}", self.config.advertise_host, pair.raft_port),
        ));

        match self.supervisor.start(&self.config, name, pair, false, join).await {
            Ok(instance) => {
                let _ = crate::ports::persist_pair(
                    &self.config.data_dir,
                    name,
                    pair,
                    &self.config.advertise_host,
                )
                .await;
                self.instances.write().await.insert(name.to_string(), instance);

                let mut placement =
                    Placement::new_initializing(name, vec![self.node_id().to_string()], self.node_id());
                placement.status = PlacementStatus::Active;
                placement.port_mappings.insert(
                    self.node_id().to_string(),
                    PortMapping {
                        http_port: pair.http_port,
                        raft_port: pair.raft_port,
                        host: self.config.advertise_host.clone(),
                    },
                );
                self.store.upsert(placement);
                info!(%name, %join_address, "system database joined external address in single-engine mode");
            }
            Err(err) => {
                self.allocator.release_pair(pair);
                warn!(%name, %err, "failed to join external address for system database");
            }
        }
    }

    /// Apply ordered `.sql` files from `migrations_path` against the
    /// system database once it is Active. Only the leader applies
    /// migrations; followers forward writes to it anyway, so running
    /// this on every member would just be redundant traffic.
    async fn apply_migrations(&self, name: &str) {
        let Some(path) = self.config.migrations_path.clone() else {
            return;
        };
        if let Some(placement) = self.store.get(name) {
            if placement.leader_node != self.node_id() {
                return;
            }
        }

        let http_port = match self.instances.read().await.get(name).map(|i| i.http_port()) {
            Some(port) => port,
            None => {
                warn!(%name, "no local instance for system database, skipping migrations");
                return;
            }
        };

        let mut entries = match tokio::fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(%path, %err, "failed to read migrations directory");
                return;
            }
        };
        let mut files = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let p = entry.path();
            if p.extension().and_then(|e| e.to_str()) == Some("sql") {
                files.push(p);
            }
        }
        files.sort();

        let client = reqwest::Client::new();
        for file in files {
            let sql = match tokio::fs::read_to_string(&file).await {
                Ok(s) => s,
                Err(err) => {
                    warn!(?file, %err, "failed to read migration file");
                    continue;
                }
            };
            let statements: Vec<&str> = sql
                .split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect();
            if statements.is_empty() {
                continue;
            }

            let url = format!("http://localhost:{http_port}/db/execute?transaction");
            match client.post(&url).json(&statements).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!(?file, "migration applied");
                }
                Ok(resp) => {
                    warn!(?file, status = %resp.status(), "migration request returned an error status");
                }
                Err(err) => {
                    warn!(?file, %err, "migration request failed");
                }
            }
        }
    }

    /// Create a new replicated database across `rf` nodes.
    pub async fn create_database(&self, name: &str, rf: usize) -> Result<()> {
        if self.store.get(name).is_some() {
            return Err(ClusterError::PlacementExists(name.to_string()));
        }

        let coordinator = Arc::new(CreateCoordinator::new(name, rf, self.node_id()));
        self.coordinators.register(coordinator.clone());

        let is_system_db = name == self.config.system_database.name;
        let self_has_capacity = self
            .store
            .get_node(self.node_id())
            .map(|cap| cap.has_capacity())
            .unwrap_or(true);
        if self_has_capacity || is_system_db {
            let offered = if is_system_db {
                if self.config.system_database.has_fixed_ports() {
                    let fixed = PortPair {
                        http_port: self.config.system_database.http_port,
                        raft_port: self.config.system_database.raft_port,
                    };
                    self.allocator.allocate_specific_pair(fixed).map(|()| fixed)
                } else {
                    Err(ClusterError::PortUnavailable)
                }
            } else {
                self.allocator.allocate_pair()
            };
            if let Ok(pair) = offered {
                coordinator.add_response(self.node_id().to_string(), pair);
                self.local.lock().pending_create_ports.insert(name.to_string(), pair);
            }
        }

        let request = MetadataMessage::new(
            self.node_id(),
            MessagePayload::CreateRequest {
                name: name.to_string(),
                requester: self.node_id().to_string(),
                rf,
            },
        );
        self.bus.publish(METADATA_TOPIC, &request).await?;

        let responses = coordinator.wait_for_responses(CREATE_RESPONSE_TIMEOUT).await;
        self.coordinators.remove(name);

        if responses.len() < rf {
            return Err(ClusterError::InsufficientNodes {
                name: name.to_string(),
                got: responses.len(),
                needed: rf,
            });
        }

        let selected = coordinator.select_nodes();
        let selected_nodes: Vec<String> = selected.iter().map(|(n, _)| n.clone()).collect();

        let confirm = MetadataMessage::new(
            self.node_id(),
            MessagePayload::CreateConfirm {
                name: name.to_string(),
                selected_nodes: selected_nodes.clone(),
                coordinator: self.node_id().to_string(),
            },
        );
        self.bus.publish(METADATA_TOPIC, &confirm).await?;

        // Every selected node, including this one if it was chosen,
        // builds and activates the placement when its own dispatcher
        // processes this CreateConfirm; the self-published copy is the
        // one exception to the "ignore messages from self" rule.
        Ok(())
    }

    pub async fn get_database(&self, name: &str) -> Option<crate::placement::Placement> {
        self.store.get(name)
    }

    pub async fn list_databases(&self) -> Vec<String> {
        self.store.list().into_iter().map(|p| p.name).collect()
    }

    /// Count members that are "self" or healthy (last check < 30s ago
    /// and healthy) and compare against the majority requirement.
    pub fn has_quorum(&self, members: &[String]) -> bool {
        let active = members
            .iter()
            .filter(|m| {
                if m.as_str() == self.node_id() {
                    return true;
                }
                self.store
                    .get_node(m)
                    .map(|cap| cap.is_healthy && !cap.is_stale(Utc::now()))
                    .unwrap_or(false)
            })
            .count();
        consensus::has_quorum(active, members.len())
    }

    async fn capacity_announce_loop(&self) {
        let mut ticker = tokio::time::interval(CAPACITY_ANNOUNCE_INTERVAL);
        loop {
            ticker.tick().await;
            if !self.is_running().await {
                return;
            }
            let current = self.instances.read().await.len();
            let msg = MetadataMessage::new(
                self.node_id(),
                MessagePayload::CapacityAnnouncement {
                    node: self.node_id().to_string(),
                    max: self.config.max_databases,
                    current,
                    http_range: (self.config.ports.http.start, self.config.ports.http.end),
                    raft_range: (self.config.ports.raft.start, self.config.ports.raft.end),
                },
            );
            if let Err(err) = self.bus.publish(METADATA_TOPIC, &msg).await {
                warn!(%err, "capacity announcement publish failed");
            }
        }
    }

    async fn health_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.discovery.health_check_interval);
        loop {
            ticker.tick().await;
            if !self.is_running().await {
                return;
            }
            let ping = MetadataMessage::new(
                self.node_id(),
                MessagePayload::HealthPing {
                    node: self.node_id().to_string(),
                    current: self.instances.read().await.len(),
                },
            );
            if let Err(err) = self.bus.publish(METADATA_TOPIC, &ping).await {
                warn!(%err, "health ping publish failed");
            }
            self.health_tick().await;
            self.failure_detection_tick().await;
        }
    }

    /// For every placement with a stale member, if the local node is also
    /// a member and is the lexicographically-smallest surviving one,
    /// broadcast `ReplacementNeeded` once per `(name, failed_node)`.
    async fn failure_detection_tick(&self) {
        let now = Utc::now();
        let stale: HashSet<String> = self
            .store
            .all_nodes()
            .into_iter()
            .filter(|n| n.is_stale(now))
            .map(|n| n.node_id)
            .collect();
        if stale.is_empty() {
            return;
        }

        for placement in self.store.list() {
            if !placement.is_member(self.node_id()) {
                continue;
            }
            for failed_node in placement.members.iter().filter(|m| stale.contains(*m)) {
                let key = format!("{}:{}", placement.name, failed_node);
                {
                    let mut local = self.local.lock();
                    if local.replacement_inflight.contains(&key) {
                        continue;
                    }
                }
                let surviving: Vec<String> = placement
                    .members
                    .iter()
                    .filter(|m| *m != failed_node)
                    .cloned()
                    .collect();
                if consensus::select_coordinator(&surviving).as_deref() != Some(self.node_id()) {
                    continue;
                }

                self.local.lock().replacement_inflight.insert(key);
                let msg = MetadataMessage::new(
                    self.node_id(),
                    MessagePayload::ReplacementNeeded {
                        name: placement.name.clone(),
                        failed_node: failed_node.clone(),
                        current_members: placement.members.clone(),
                        rf: placement.members.len(),
                    },
                );
                if let Err(err) = self.bus.publish(METADATA_TOPIC, &msg).await {
                    warn!(%err, "replacement-needed publish failed");
                }
            }
        }
    }

    async fn health_tick(&self) {
        let names: Vec<String> = self.instances.read().await.keys().cloned().collect();
        for name in names {
            let still_running = {
                let mut instances = self.instances.write().await;
                match instances.get_mut(&name) {
                    Some(instance) => self.supervisor.is_running(instance),
                    None => continue,
                }
            };
            if still_running {
                continue;
            }

            let Some(placement) = self.store.get(&name) else {
                let mut instances = self.instances.write().await;
                instances.remove(&name);
                continue;
            };

            if !placement.is_member(self.node_id()) {
                let mut instances = self.instances.write().await;
                if let Some(mut instance) = instances.remove(&name) {
                    self.allocator.release_pair(instance.meta.ports);
                    let _ = self.supervisor.stop(&mut instance).await;
                }
                continue;
            }

            if !self.has_quorum(&placement.members) {
                warn!(%name, "quorum unavailable, deferring recovery to next health tick");
                continue;
            }

            let pair = {
                let mut instances = self.instances.write().await;
                instances.remove(&name).map(|inst| inst.meta.ports)
            };
            let Some(pair) = pair else { continue };

            let is_leader = placement.leader_node == self.node_id();
            let join = if is_leader {
                None
            } else {
                placement.port_mappings.get(&placement.leader_node).map(|pm| {
                    (
                        format!("{}:{}", pm.host, pm.raft_port),
                        format!("{}:{}", self.config.advertise_host, pair.raft_port),
                    )
                })
            };

            warn!(%name, "local instance is dead with quorum available, restarting");
            match self.supervisor.start(&self.config, &name, pair, is_leader, join).await {
                Ok(restarted) => {
                    self.instances.write().await.insert(name.clone(), restarted);
                    info!(%name, "local instance restarted");
                }
                Err(err) => {
                    warn!(%name, %err, "failed to restart dead local instance");
                }
            }
        }
    }

    async fn idle_detection_loop(&self) {
        if self.config.hibernation_timeout.is_zero() {
            return;
        }
        let mut ticker = tokio::time::interval(IDLE_DETECTION_INTERVAL);
        loop {
            ticker.tick().await;
            if !self.is_running().await {
                return;
            }
            let idle_names: Vec<(String, chrono::DateTime<Utc>)> = {
                let instances = self.instances.read().await;
                instances
                    .iter()
                    .filter(|(_, inst)| {
                        matches!(inst.meta.status, crate::placement::InstanceStatus::Active)
                            && inst.is_idle(
                                chrono::Duration::from_std(self.config.hibernation_timeout)
                                    .unwrap_or(chrono::Duration::zero()),
                            )
                    })
                    .map(|(name, inst)| (name.clone(), inst.meta.last_query))
                    .collect()
            };
            for (name, last_activity) in idle_names {
                let msg = MetadataMessage::new(
                    self.node_id(),
                    MessagePayload::IdleNotification {
                        name,
                        node: self.node_id().to_string(),
                        last_activity,
                    },
                );
                if let Err(err) = self.bus.publish(METADATA_TOPIC, &msg).await {
                    warn!(%err, "idle notification publish failed");
                }
            }
        }
    }

    async fn orphan_reconciliation_once(&self) {
        tokio::time::sleep(ORPHAN_RECONCILE_DELAY).await;
        if !self.is_running().await {
            return;
        }
        let Ok(mut entries) = tokio::fs::read_dir(&self.config.data_dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == "logs" {
                continue;
            }
            let known_member = self
                .store
                .get(&name)
                .map(|p| p.is_member(self.node_id()))
                .unwrap_or(false);
            if !known_member {
                info!(%name, "removing orphaned database directory");
                if let Err(err) = tokio::fs::remove_dir_all(entry.path()).await {
                    warn!(%name, %err, "failed to remove orphaned directory");
                }
            }
        }
    }

    async fn split_brain_loop(&self) {
        tokio::time::sleep(SPLIT_BRAIN_WARMUP).await;
        let mut ticker = tokio::time::interval(SPLIT_BRAIN_CHECK_INTERVAL);
        loop {
            ticker.tick().await;
            if !self.is_running().await {
                return;
            }
            self.split_brain_tick().await;
        }
    }

    async fn split_brain_tick(&self) {
        let http_client = reqwest::Client::new();
        let names: Vec<(String, u16)> = {
            let instances = self.instances.read().await;
            instances
                .values()
                .map(|inst| (inst.meta.name.clone(), inst.http_port()))
                .collect()
        };

        for (name, http_port) in names {
            let Some(local_status) = fetch_status(&http_client, http_port).await else {
                continue;
            };
            if !local_status.is_split_brain() {
                continue;
            }

            let peers = self.discovery.get_active_peers().await;
            let mut all_peers_split = true;
            for peer in &peers {
                match fetch_peer_status(&http_client, &peer.http_address).await {
                    Some(status) if status.is_split_brain() => {}
                    _ => {
                        all_peers_split = false;
                        break;
                    }
                }
            }

            if !all_peers_split {
                continue;
            }

            warn!(%name, "split-brain detected across all reachable peers, attempting recovery");
            self.discovery.trigger_peer_exchange().await;

            let local_index = local_status
                .store
                .as_ref()
                .and_then(|s| s.raft.last_log_index)
                .unwrap_or(0);
            let peer_max_index = peers.iter().map(|p| p.raft_log_index).max().unwrap_or(0);

            if peer_max_index > local_index || (peer_max_index == 0 && local_index == 0) {
                self.discovery.force_write_peers_json().await;
                self.recover_from_split_brain(&name, &http_client).await;
            }
        }
    }

    /// Clear local Raft state, force a fresh peers.json, and restart the
    /// engine, then verify the split-brain indicator cleared.
    async fn recover_from_split_brain(&self, name: &str, http_client: &reqwest::Client) {
        let Some(placement) = self.store.get(name) else {
            return;
        };
        let Some(mut instance) = self.instances.write().await.remove(name) else {
            return;
        };
        let pair = instance.meta.ports;

        if let Err(err) = self.supervisor.stop(&mut instance).await {
            warn!(%name, %err, "failed to stop instance before split-brain restart");
        }

        let raft_dir = std::path::Path::new(&self.config.data_dir)
            .join(name)
            .join("rqlite");
        let _ = tokio::fs::remove_file(raft_dir.join("raft.db")).await;
        let _ = tokio::fs::remove_file(raft_dir.join("raft").join("peers.json")).await;

        self.discovery.trigger_sync().await;

        let is_leader = placement.leader_node == self.node_id();
        let join = if is_leader {
            None
        } else {
            placement.port_mappings.get(&placement.leader_node).map(|pm| {
                (
                    format!("{}:{}", pm.host, pm.raft_port),
                    format!("{}:{}", self.config.advertise_host, pair.raft_port),
                )
            })
        };

        match self
            .supervisor
            .start(&self.config, name, pair, is_leader, join)
            .await
        {
            Ok(restarted) => {
                let http_port = restarted.http_port();
                self.instances.write().await.insert(name.to_string(), restarted);
                match fetch_status(http_client, http_port).await {
                    Some(status) if !status.is_split_brain() => {
                        info!(%name, "split-brain recovery succeeded, leader elected");
                    }
                    _ => {
                        warn!(%name, "split-brain indicator still present after restart");
                    }
                }
            }
            Err(err) => {
                warn!(%name, %err, "failed to restart engine during split-brain recovery");
            }
        }
    }

    /// Best-effort lookup of the host part of a peer's advertised raft
    /// address via discovery, falling back to this node's own advertise
    /// host (correct for single-host dev/test clusters).
    pub(crate) async fn peer_advertise_host(&self, node: &str) -> String {
        let peers = self.discovery.get_all_peers().await;
        peers
            .into_iter()
            .find(|p| p.node_id == node)
            .and_then(|p| p.raft_address.split(':').next().map(str::to_string))
            .unwrap_or_else(|| self.config.advertise_host.clone())
    }
}

async fn fetch_status(client: &reqwest::Client, http_port: u16) -> Option<EngineStatus> {
    let url = format!("http://localhost:{http_port}/status");
    client.get(&url).send().await.ok()?.json().await.ok()
}

async fn fetch_peer_status(client: &reqwest::Client, http_address: &str) -> Option<EngineStatus> {
    let url = format!("http://{http_address}/status");
    client.get(&url).send().await.ok()?.json().await.ok()
}

/// Adapts the `Bus` subscription callback into a dispatch to the
/// manager's handlers.
struct DispatchHandler(ClusterManager);

#[async_trait::async_trait]
impl MessageHandler for DispatchHandler {
    async fn handle(&self, _topic: &str, message: MetadataMessage) {
        self.0.dispatch(message).await;
    }
}

pub(crate) fn capacity_from_announcement(
    node: String,
    max: usize,
    current: usize,
    http_range: (u16, u16),
    raft_range: (u16, u16),
) -> NodeCapacity {
    NodeCapacity {
        node_id: node,
        max_databases: max,
        current_databases: current,
        http_port_range: http_range,
        raft_port_range: raft_range,
        last_health_check: Utc::now(),
        is_healthy: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::bus::fake::InMemoryBus;
    use crate::external::discovery::fake::StaticDiscovery;

    fn test_config(node_id: &str, http_start: u16, raft_start: u16) -> ClusterManagerConfig {
        let mut cfg = ClusterManagerConfig::default();
        cfg.node_id = node_id.to_string();
        cfg.ports.http.start = http_start;
        cfg.ports.http.end = http_start + 50;
        cfg.ports.raft.start = raft_start;
        cfg.ports.raft.end = raft_start + 50;
        cfg.data_dir = std::env::temp_dir()
            .join(format!("dbfleet-mgr-test-{node_id}-{http_start}"))
            .to_string_lossy()
            .into_owned();
        cfg
    }

    fn new_manager(node_id: &str, http_start: u16, raft_start: u16, bus: Arc<dyn Bus>) -> ClusterManager {
        ClusterManager::new(
            test_config(node_id, http_start, raft_start),
            bus,
            Arc::new(StaticDiscovery::new(Vec::new())),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn quorum_counts_self_and_healthy_members() {
        let bus = InMemoryBus::new();
        let mgr = new_manager("A", 20000, 21000, bus);
        assert!(mgr.has_quorum(&["A".to_string()]));
        assert!(!mgr.has_quorum(&["A".to_string(), "B".to_string(), "C".to_string()]));
    }

    #[tokio::test]
    async fn create_database_rejects_duplicate_name() {
        let bus = InMemoryBus::new();
        let mgr = new_manager("A", 20100, 21100, bus);
        let placement = crate::placement::Placement::new_initializing("dup", vec!["A".into()], "A");
        mgr.store.upsert(placement);
        let err = mgr.create_database("dup", 1).await.unwrap_err();
        assert!(matches!(err, ClusterError::PlacementExists(_)));
    }

    #[tokio::test]
    async fn create_database_offers_the_configured_fixed_pair_for_the_system_database() {
        let bus = InMemoryBus::new();
        let mut cfg = test_config("A", 20200, 21200);
        cfg.system_database.http_port = 20220;
        cfg.system_database.raft_port = 21220;
        let mgr = ClusterManager::new(
            cfg,
            bus,
            Arc::new(StaticDiscovery::new(Vec::new())),
        )
        .unwrap();

        let name = mgr.config.system_database.name.clone();
        mgr.create_database(&name, 1).await.unwrap();

        let pending = mgr.local.lock().pending_create_ports.get(&name).copied();
        assert_eq!(
            pending,
            Some(PortPair {
                http_port: 20220,
                raft_port: 21220
            })
        );
        assert!(mgr.allocator.is_allocated(20220));
        assert!(mgr.allocator.is_allocated(21220));
    }

    #[tokio::test]
    async fn create_database_declines_system_offer_without_fixed_ports_configured() {
        let bus = InMemoryBus::new();
        let mgr = new_manager("A", 20300, 21300, bus);
        let name = mgr.config.system_database.name.clone();

        let err = mgr.create_database(&name, 1).await.unwrap_err();
        assert!(matches!(err, ClusterError::InsufficientNodes { .. }));
        assert!(mgr.local.lock().pending_create_ports.get(&name).is_none());
    }

    #[tokio::test]
    async fn wait_for_min_cluster_size_returns_immediately_when_not_configured() {
        let bus = InMemoryBus::new();
        let mut cfg = test_config("A", 20400, 21400);
        cfg.min_cluster_size = 1;
        let mgr = ClusterManager::new(cfg, bus, Arc::new(StaticDiscovery::new(Vec::new()))).unwrap();

        let start = tokio::time::Instant::now();
        mgr.wait_for_min_cluster_size().await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
