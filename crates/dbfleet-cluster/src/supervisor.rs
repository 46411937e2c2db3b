//! Per-database subprocess manager: spawn, readiness probing, and
//! liveness tracking for the local engine instance.

use crate::config::{ClusterManagerConfig, TlsConfig};
use crate::error::{ClusterError, Result};
use crate::external::engine::{build_engine_command, EngineStartParams, EngineStatus};
use crate::placement::{InstanceMeta, InstanceStatus, PortPair};
use chrono::Utc;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Child;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(1);
const STATUS_POLL_TIMEOUT: Duration = Duration::from_secs(180);
const SQL_CLIENT_MAX_ATTEMPTS: u32 = 10;
const SQL_CLIENT_BACKOFF_CAP: Duration = Duration::from_secs(5);
const SQL_POLL_INTERVAL: Duration = Duration::from_secs(1);
const LEADER_SQL_READY_TIMEOUT: Duration = Duration::from_secs(2 * 60);
const FOLLOWER_SQL_READY_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// A running engine subprocess and the metadata the rest of the manager
/// needs about it.
pub struct RunningInstance {
    pub meta: InstanceMeta,
    child: Option<Child>,
    http_port: u16,
}

/// Spawns, probes, and stops the local engine subprocess for one
/// database. Supervisors never retry on their own: a start failure is
/// returned to the caller, which is always the Cluster Manager's health
/// loop or a lifecycle handler.
pub struct InstanceSupervisor {
    http: reqwest::Client,
}

impl Default for InstanceSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceSupervisor {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// Start the local engine instance for `db`. `join` is `Some((host,
    /// raft_adv))` when this node must join as a follower; `None` means
    /// leader (no join).
    #[instrument(skip(self, config), fields(db = %db))]
    pub async fn start(
        &self,
        config: &ClusterManagerConfig,
        db: &str,
        ports: PortPair,
        is_leader: bool,
        join: Option<(String, String)>,
    ) -> Result<RunningInstance> {
        let data_dir = PathBuf::from(&config.data_dir).join(db).join("rqlite");
        tokio::fs::create_dir_all(&data_dir).await?;

        let advertised_http = format!("{}:{}", config.advertise_host, ports.http_port);
        let advertised_raft = format!("{}:{}", config.advertise_host, ports.raft_port);

        let join_ref = join.as_ref().map(|(addr, as_addr)| (addr.as_str(), as_addr.as_str()));
        let params = EngineStartParams {
            binary: &config.engine_binary,
            ports,
            advertise_host: &config.advertise_host,
            data_dir: &data_dir,
            tls: &config.tls,
            join: join_ref,
        };
        let mut cmd = build_engine_command(&params);

        if let Some(logs_dir) = &config.logs_dir {
            let node_type = if is_leader { "leader" } else { "follower" };
            let log_path = PathBuf::from(logs_dir).join(format!("rqlite-{node_type}.log"));
            if let Some(parent) = log_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let log_file = std::fs::File::create(&log_path)?;
            let log_file_err = log_file.try_clone()?;
            cmd.stdout(std::process::Stdio::from(log_file));
            cmd.stderr(std::process::Stdio::from(log_file_err));
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ClusterError::EngineFailed(format!("spawn failed: {e}")))?;

        match self
            .bring_up(&mut child, ports.http_port, is_leader)
            .await
        {
            Ok(()) => {
                info!(db, "engine instance active");
                Ok(RunningInstance {
                    meta: InstanceMeta {
                        name: db.to_string(),
                        ports,
                        data_dir: data_dir.to_string_lossy().into_owned(),
                        advertised_http,
                        advertised_raft,
                        last_query: Utc::now(),
                        status: InstanceStatus::Active,
                    },
                    child: Some(child),
                    http_port: ports.http_port,
                })
            }
            Err(err) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(err)
            }
        }
    }

    async fn bring_up(&self, child: &mut Child, http_port: u16, is_leader: bool) -> Result<()> {
        self.wait_for_status_ready(child, http_port).await?;
        self.open_sql_client_with_retry(http_port).await?;
        let deadline = if is_leader {
            LEADER_SQL_READY_TIMEOUT
        } else {
            FOLLOWER_SQL_READY_TIMEOUT
        };
        self.wait_for_sql_ready(http_port, deadline).await
    }

    async fn wait_for_status_ready(&self, child: &mut Child, http_port: u16) -> Result<()> {
        let deadline = Instant::now() + STATUS_POLL_TIMEOUT;
        let url = format!("http://localhost:{http_port}/status");

        loop {
            if let Some(status) = child.try_wait().map_err(ClusterError::Io)? {
                return Err(ClusterError::EngineFailed(format!(
                    "engine exited before becoming ready: {status}"
                )));
            }

            if let Ok(resp) = self.http.get(&url).send().await {
                if resp.status().is_success() {
                    if let Ok(parsed) = resp.json::<EngineStatus>().await {
                        if parsed.is_ready() {
                            return Ok(());
                        }
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(ClusterError::EngineNotReady);
            }
            tokio::time::sleep(STATUS_POLL_INTERVAL).await;
        }
    }

    async fn open_sql_client_with_retry(&self, http_port: u16) -> Result<()> {
        let mut backoff = Duration::from_millis(200);
        for attempt in 0..SQL_CLIENT_MAX_ATTEMPTS {
            match self.query_select_one(http_port).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt + 1 < SQL_CLIENT_MAX_ATTEMPTS => {
                    warn!(attempt, %err, "sql client not open yet, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(SQL_CLIENT_BACKOFF_CAP);
                }
                Err(err) => return Err(err),
            }
        }
        Err(ClusterError::EngineNotReady)
    }

    async fn wait_for_sql_ready(&self, http_port: u16, deadline: Duration) -> Result<()> {
        let until = Instant::now() + deadline;
        loop {
            if self.query_select_one(http_port).await.is_ok() {
                return Ok(());
            }
            if Instant::now() >= until {
                return Err(ClusterError::EngineNotReady);
            }
            tokio::time::sleep(SQL_POLL_INTERVAL).await;
        }
    }

    async fn query_select_one(&self, http_port: u16) -> Result<()> {
        let url = format!("http://localhost:{http_port}/db/query?q=SELECT%201");
        let resp = self.http.get(&url).send().await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ClusterError::EngineFailed(format!(
                "query failed with status {}",
                resp.status()
            )))
        }
    }

    /// Stop the instance: close the SQL client, terminate, wait up to 5s,
    /// then force kill. Idempotent.
    #[instrument(skip(self, instance))]
    pub async fn stop(&self, instance: &mut RunningInstance) -> Result<()> {
        let Some(child) = instance.child.as_mut() else {
            instance.meta.status = InstanceStatus::Hibernating;
            return Ok(());
        };

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        let _ = child.start_kill();

        let exited = tokio::time::timeout(STOP_GRACE_PERIOD, child.wait()).await;
        if exited.is_err() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }

        instance.child = None;
        instance.meta.status = InstanceStatus::Hibernating;
        Ok(())
    }

    /// Probe-signal the subprocess with a no-op signal.
    pub fn is_running(&self, instance: &mut RunningInstance) -> bool {
        match instance.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

impl RunningInstance {
    pub fn is_idle(&self, timeout: chrono::Duration) -> bool {
        self.meta.is_idle(timeout)
    }

    pub fn record_query(&mut self) {
        self.meta.last_query = Utc::now();
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tls_config_has_no_flags() {
        let tls = TlsConfig::default();
        assert!(tls.node_cert.is_none());
        assert!(!tls.no_verify);
    }

    #[test]
    fn backoff_cap_is_respected() {
        let mut backoff = Duration::from_millis(200);
        for _ in 0..10 {
            backoff = (backoff * 2).min(SQL_CLIENT_BACKOFF_CAP);
        }
        assert_eq!(backoff, SQL_CLIENT_BACKOFF_CAP);
    }
}
