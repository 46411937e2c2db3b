//! Cluster manager configuration settings.

use crate::error::{ClusterError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration for a single node's cluster manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterManagerConfig {
    /// This node's identifier, used for lexicographic coordinator selection.
    pub node_id: String,

    /// Host advertised to peers for this node's engine instances.
    pub advertise_host: String,

    /// Root directory under which `<db>/` subdirectories are created.
    pub data_dir: String,

    /// Path to the engine binary (`rqlited`-compatible command line).
    pub engine_binary: String,

    /// Directory stdout/stderr logs are optionally written under.
    pub logs_dir: Option<String>,

    /// Per-node capacity limit; the system database is exempt.
    pub max_databases: usize,

    /// Default replication factor for `create_database`.
    pub replication_factor: usize,

    /// Idle-to-hibernation threshold; zero disables hibernation.
    pub hibernation_timeout: Duration,

    /// Minimum number of nodes (this one included) that must be visible
    /// via discovery before the local engine is started. Values above 1
    /// make node startup wait indefinitely until that many peers appear.
    /// Defaults to 1 so a standalone node is never blocked.
    pub min_cluster_size: usize,

    pub ports: PortRangeConfig,
    pub system_database: SystemDatabaseConfig,
    pub tls: TlsConfig,
    pub discovery: DiscoveryConfig,

    /// Directory of ordered `.sql` files applied to the system database
    /// once it becomes Active. `None` skips migrations.
    pub migrations_path: Option<String>,

    /// If set and `min_cluster_size <= 1`, the system database's local
    /// engine joins this address directly instead of running the
    /// placement protocol against fleet peers.
    pub rqlite_join_address: Option<String>,
}

impl Default for ClusterManagerConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            advertise_host: "127.0.0.1".to_string(),
            data_dir: "./data".to_string(),
            engine_binary: "rqlited".to_string(),
            logs_dir: None,
            max_databases: 50,
            replication_factor: 3,
            hibernation_timeout: Duration::from_secs(30 * 60),
            min_cluster_size: 1,
            ports: PortRangeConfig::default(),
            system_database: SystemDatabaseConfig::default(),
            tls: TlsConfig::default(),
            discovery: DiscoveryConfig::default(),
            migrations_path: None,
            rqlite_join_address: None,
        }
    }
}

impl ClusterManagerConfig {
    /// Validate internal consistency of the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(ClusterError::FatalConfig("node_id must not be empty".into()));
        }
        if self.advertise_host.trim().is_empty() {
            return Err(ClusterError::FatalConfig(
                "advertise_host must not be empty".into(),
            ));
        }
        if self.max_databases == 0 {
            return Err(ClusterError::FatalConfig(
                "max_databases must be positive".into(),
            ));
        }
        self.ports.validate()?;
        Ok(())
    }
}

/// A half-open `[start, end)` port range.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Range {
    pub start: u16,
    pub end: u16,
}

impl Range {
    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port < self.end
    }

    pub fn len(&self) -> usize {
        (self.end.saturating_sub(self.start)) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// HTTP and Raft port ranges handed out by the port allocator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PortRangeConfig {
    pub http: Range,
    pub raft: Range,
}

impl Default for PortRangeConfig {
    fn default() -> Self {
        Self {
            http: Range {
                start: 5001,
                end: 6000,
            },
            raft: Range {
                start: 7001,
                end: 8000,
            },
        }
    }
}

impl PortRangeConfig {
    fn validate(&self) -> Result<()> {
        if self.http.start >= self.http.end {
            return Err(ClusterError::FatalConfig(
                "http port range is empty or inverted".into(),
            ));
        }
        if self.raft.start >= self.raft.end {
            return Err(ClusterError::FatalConfig(
                "raft port range is empty or inverted".into(),
            ));
        }
        let overlap = self.http.start < self.raft.end && self.raft.start < self.http.end;
        if overlap {
            return Err(ClusterError::FatalConfig(
                "http and raft port ranges must not overlap".into(),
            ));
        }
        Ok(())
    }
}

/// Name and sticky fixed ports for the distinguished system database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemDatabaseConfig {
    pub name: String,
    pub http_port: u16,
    pub raft_port: u16,
    pub replication_factor: usize,
}

impl Default for SystemDatabaseConfig {
    fn default() -> Self {
        Self {
            name: "system".to_string(),
            http_port: 0,
            raft_port: 0,
            replication_factor: 3,
        }
    }
}

impl SystemDatabaseConfig {
    /// Fixed ports are only mandatory when both are configured (non-zero).
    pub fn has_fixed_ports(&self) -> bool {
        self.http_port > 0 && self.raft_port > 0
    }
}

/// TLS flags passed through verbatim to the engine command line.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    pub node_cert: Option<String>,
    pub node_key: Option<String>,
    pub node_ca_cert: Option<String>,
    pub no_verify: bool,
}

/// Discovery-related tunables consumed by the cluster manager's loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub health_check_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid_once_node_id_is_set() {
        let mut cfg = ClusterManagerConfig::default();
        cfg.node_id = "node-a".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn empty_node_id_is_rejected() {
        let cfg = ClusterManagerConfig::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn overlapping_port_ranges_are_rejected() {
        let mut cfg = ClusterManagerConfig::default();
        cfg.node_id = "node-a".to_string();
        cfg.ports.raft.start = cfg.ports.http.start;
        cfg.ports.raft.end = cfg.ports.http.end;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn discovery_health_check_interval_defaults_to_ten_seconds() {
        let cfg = DiscoveryConfig::default();
        assert_eq!(cfg.health_check_interval, Duration::from_secs(10));
    }
}
