//! Cluster manager error types.

use thiserror::Error;

/// Result type for cluster manager operations.
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Errors surfaced by the cluster manager and its subsystems.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("no free ports available after {attempts} attempts")]
    NoPortsAvailable { attempts: u32 },

    #[error("port {0} is outside its configured range")]
    PortOutOfRange(u16),

    #[error("port {0} is already allocated")]
    AlreadyAllocated(u16),

    #[error("placement not found: {0}")]
    PlacementNotFound(String),

    #[error("placement already exists: {0}")]
    PlacementExists(String),

    #[error("insufficient nodes responded for placement {name} ({got}/{needed})")]
    InsufficientNodes {
        name: String,
        got: usize,
        needed: usize,
    },

    #[error("quorum not reached for placement {name}: {current}/{required}")]
    QuorumUnavailable {
        name: String,
        current: usize,
        required: usize,
    },

    #[error("local node is at capacity")]
    CapacityExhausted,

    #[error("fixed port for the system database is unavailable")]
    PortUnavailable,

    #[error("conflicting concurrent update for placement {0}")]
    Conflict(String),

    #[error("fatal configuration error: {0}")]
    FatalConfig(String),

    #[error("unrecognized or undecodable message: {0}")]
    UnknownMessage(String),

    #[error("engine subprocess failed: {0}")]
    EngineFailed(String),

    #[error("engine did not become ready before the deadline")]
    EngineNotReady,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::Serialization(err.to_string())
    }
}
