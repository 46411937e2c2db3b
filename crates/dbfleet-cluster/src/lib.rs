//! Per-node cluster manager for a multi-tenant fleet of independently
//! replicated SQL databases.
//!
//! Each node in the cluster runs one [`manager::ClusterManager`]. It
//! tracks which databases are placed on which nodes ([`placement`]),
//! allocates the HTTP/Raft port pairs each local engine subprocess binds
//! to ([`ports`]), supervises those subprocesses ([`supervisor`]), and
//! keeps its view of the fleet's metadata converged with its peers by
//! exchanging messages over a broadcast bus ([`messages`], [`handlers`])
//! using vector clocks for conflict resolution ([`clock`], [`consensus`]).
//!
//! The bus transport, peer-discovery service, and the engine subprocess
//! itself are external collaborators this crate only contracts with; see
//! [`external`].
//!
//! ```no_run
//! use dbfleet_cluster::{ClusterManager, ClusterManagerConfig};
//! use std::sync::Arc;
//!
//! # async fn run(bus: Arc<dyn dbfleet_cluster::external::Bus>, discovery: Arc<dyn dbfleet_cluster::external::Discovery>) -> dbfleet_cluster::Result<()> {
//! let mut config = ClusterManagerConfig::default();
//! config.node_id = "node-a".to_string();
//!
//! let manager = ClusterManager::new(config, bus, discovery)?;
//! manager.start().await?;
//! manager.create_database("app1", 3).await?;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod consensus;
pub mod coordinator;
pub mod error;
pub mod external;
mod handlers;
pub mod logging;
pub mod manager;
pub mod messages;
pub mod placement;
pub mod ports;
pub mod store;
pub mod supervisor;

pub use config::ClusterManagerConfig;
pub use error::{ClusterError, Result};
pub use manager::ClusterManager;
pub use placement::{Placement, PlacementStatus};

/// The crate's own version, as published in `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
