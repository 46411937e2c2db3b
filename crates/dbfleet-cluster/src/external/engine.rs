//! Engine subprocess command-line surface and `/status` response shape.
//!
//! The engine subprocess itself — the consensus-replicated SQL server —
//! is out of scope. Only its command-line flags, HTTP health endpoints,
//! and join semantics are contracted here.

use crate::config::TlsConfig;
use crate::placement::PortPair;
use serde::Deserialize;
use std::path::Path;
use tokio::process::Command;

/// Parameters needed to build one engine subprocess invocation.
pub struct EngineStartParams<'a> {
    pub binary: &'a str,
    pub ports: PortPair,
    pub advertise_host: &'a str,
    pub data_dir: &'a Path,
    pub tls: &'a TlsConfig,
    /// `Some((join_host_port, self_raft_adv))` when joining as a follower.
    pub join: Option<(&'a str, &'a str)>,
}

/// Build the `rqlited`-style command line described in the external
/// interfaces contract. The data directory is always the last positional
/// argument.
pub fn build_engine_command(params: &EngineStartParams<'_>) -> Command {
    let mut cmd = Command::new(params.binary);

    cmd.arg("-http-addr")
        .arg(format!("0.0.0.0:{}", params.ports.http_port))
        .arg("-raft-addr")
        .arg(format!("0.0.0.0:{}", params.ports.raft_port))
        .arg("-http-adv-addr")
        .arg(format!(
            "{}:{}",
            params.advertise_host, params.ports.http_port
        ))
        .arg("-raft-adv-addr")
        .arg(format!(
            "{}:{}",
            params.advertise_host, params.ports.raft_port
        ));

    if let Some(cert) = &params.tls.node_cert {
        cmd.arg("-node-cert").arg(cert);
    }
    if let Some(key) = &params.tls.node_key {
        cmd.arg("-node-key").arg(key);
    }
    if let Some(ca_cert) = &params.tls.node_ca_cert {
        cmd.arg("-node-ca-cert").arg(ca_cert);
    }
    if params.tls.no_verify {
        cmd.arg("-node-no-verify");
    }

    if let Some((join_addr, join_as)) = params.join {
        cmd.arg("-join")
            .arg(join_addr)
            .arg("-join-as")
            .arg(join_as)
            .arg("-join-attempts")
            .arg("30")
            .arg("-join-interval")
            .arg("10s");
    }

    cmd.arg(params.data_dir);
    cmd
}

/// The `store.raft` sub-object of a `/status` response.
#[derive(Debug, Clone, Deserialize)]
pub struct RaftStatus {
    pub state: Option<String>,
    pub term: Option<u64>,
    pub num_peers: Option<u32>,
    pub voter: Option<bool>,
    pub leader_addr: Option<String>,
    pub last_log_index: Option<u64>,
    pub applied_index: Option<u64>,
    pub commit_index: Option<u64>,
}

/// The relevant slice of a `/status` response.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct EngineStatus {
    pub store: Option<StoreStatus>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreStatus {
    pub raft: RaftStatus,
}

impl EngineStatus {
    /// HTTP 200 alone is "ready" when the engine omits the raft field
    /// (boundary condition in the spec); otherwise ready means the raft
    /// state is leader or follower.
    pub fn is_ready(&self) -> bool {
        match self.store.as_ref().map(|s| &s.raft.state) {
            None => true,
            Some(None) => true,
            Some(Some(state)) => state == "leader" || state == "follower",
        }
    }

    /// The split-brain indicator: an isolated follower with term 0 and
    /// no peers.
    pub fn is_split_brain(&self) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        let raft = &store.raft;
        raft.state.as_deref() == Some("Follower")
            && raft.term == Some(0)
            && raft.num_peers == Some(0)
            && raft.voter == Some(false)
            && raft.leader_addr.as_deref().unwrap_or("").is_empty()
    }
}

/// One entry of a `GET /nodes?ver=2` response.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub address: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_includes_advertised_addresses_and_data_dir() {
        let params = EngineStartParams {
            binary: "rqlited",
            ports: PortPair {
                http_port: 5001,
                raft_port: 7001,
            },
            advertise_host: "10.0.0.5",
            data_dir: Path::new("/data/app1/rqlite"),
            tls: &TlsConfig::default(),
            join: None,
        };
        let cmd = build_engine_command(&params);
        let rendered = format!("{:?}", cmd.as_std());
        assert!(rendered.contains("10.0.0.5:5001"));
        assert!(rendered.contains("10.0.0.5:7001"));
        assert!(rendered.contains("/data/app1/rqlite"));
    }

    #[test]
    fn join_flags_present_only_when_joining() {
        let params = EngineStartParams {
            binary: "rqlited",
            ports: PortPair {
                http_port: 5001,
                raft_port: 7001,
            },
            advertise_host: "10.0.0.5",
            data_dir: Path::new("/data/app1/rqlite"),
            tls: &TlsConfig::default(),
            join: Some(("10.0.0.1:7001", "10.0.0.5:7001")),
        };
        let cmd = build_engine_command(&params);
        let rendered = format!("{:?}", cmd.as_std());
        assert!(rendered.contains("-join"));
        assert!(rendered.contains("-join-attempts"));
    }

    #[test]
    fn missing_raft_field_is_treated_as_ready() {
        let status = EngineStatus { store: None };
        assert!(status.is_ready());
    }

    #[test]
    fn split_brain_indicator_matches_the_documented_condition() {
        let status: EngineStatus = serde_json::from_str(
            r#"{"store":{"raft":{"state":"Follower","term":0,"num_peers":0,"voter":false,"leader_addr":""}}}"#,
        )
        .unwrap();
        assert!(status.is_split_brain());
        assert!(!status.is_ready());
    }

    #[test]
    fn leader_state_is_ready_and_not_split_brain() {
        let status: EngineStatus = serde_json::from_str(
            r#"{"store":{"raft":{"state":"leader","term":2,"num_peers":2,"voter":true,"leader_addr":"a"}}}"#,
        )
        .unwrap();
        assert!(status.is_ready());
        assert!(!status.is_split_brain());
    }
}
