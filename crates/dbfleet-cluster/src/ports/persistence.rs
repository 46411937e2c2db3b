//! Sticky port persistence: `<dataDir>/<db>/ports.json`.

use crate::placement::PortPair;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// On-disk record of the last port pair assigned to a database, so a
/// restart can try to reclaim the same pair first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedPorts {
    pub http_port: u16,
    pub raft_port: u16,
    pub host: String,
}

fn ports_file(data_dir: &str, db: &str) -> PathBuf {
    Path::new(data_dir).join(db).join("ports.json")
}

/// Best-effort: write failures are logged by the caller and never fatal.
pub async fn persist_pair(
    data_dir: &str,
    db: &str,
    pair: PortPair,
    host: &str,
) -> std::io::Result<()> {
    let path = ports_file(data_dir, db);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let record = PersistedPorts {
        http_port: pair.http_port,
        raft_port: pair.raft_port,
        host: host.to_string(),
    };
    let bytes = serde_json::to_vec_pretty(&record)?;
    tokio::fs::write(path, bytes).await
}

/// Returns `None` if no persisted record exists or it fails to parse.
pub async fn load_persisted_pair(data_dir: &str, db: &str) -> Option<PersistedPorts> {
    let path = ports_file(data_dir, db);
    let bytes = tokio::fs::read(path).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn persist_then_load_round_trips() {
        let tmp = tempdir();
        let pair = PortPair {
            http_port: 5123,
            raft_port: 7123,
        };
        persist_pair(&tmp, "u", pair, "10.0.0.1").await.unwrap();

        let loaded = load_persisted_pair(&tmp, "u").await.unwrap();
        assert_eq!(loaded.http_port, 5123);
        assert_eq!(loaded.raft_port, 7123);
        assert_eq!(loaded.host, "10.0.0.1");

        std::fs::remove_dir_all(&tmp).ok();
    }

    #[tokio::test]
    async fn missing_record_returns_none() {
        let tmp = tempdir();
        assert!(load_persisted_pair(&tmp, "missing").await.is_none());
        std::fs::remove_dir_all(&tmp).ok();
    }

    fn tempdir() -> String {
        let dir = std::env::temp_dir().join(format!(
            "dbfleet-ports-test-{}-{}",
            std::process::id(),
            rand_suffix()
        ));
        dir.to_string_lossy().into_owned()
    }

    fn rand_suffix() -> u64 {
        use rand::Rng;
        rand::thread_rng().gen()
    }
}
