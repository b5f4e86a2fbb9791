//! JSON configuration file, the single argument of the daemon.
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use raftkvd_api::NodeId;
use serde::Deserialize;

use crate::node::Parameters;

#[derive(Debug, Clone, Deserialize)]
pub struct MemberConfig {
    pub host: String,
    pub port: u16,
}

/// Durations are seconds (floating point). Unknown keys are ignored, so
/// transport tunables of other deployments can stay in the file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub id: u64,
    pub members: Vec<MemberConfig>,
    pub port: u16,
    pub dir: PathBuf,

    pub heartbeat_timeout: f64,
    pub heartbeat_interval: f64,
    pub election_timeout: f64,
    pub rotate_interval: f64,
    pub flush_interval: f64,

    pub rpc_max_batch: usize,
    pub applied_backlog: i64,

    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default)]
    pub log_level: Option<String>,
}

fn default_max_message_size() -> usize {
    Parameters::DEFAULT_MAX_MESSAGE_SIZE
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("opening config file {}", path.display()))?;
        let config: Config = serde_json::from_reader(file)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        anyhow::ensure!(!config.members.is_empty(), "empty cluster membership");
        anyhow::ensure!(
            (config.id as usize) < config.members.len(),
            "node id {} outside the {}-member cluster",
            config.id,
            config.members.len()
        );
        Ok(config)
    }

    pub fn to_parameters(&self) -> anyhow::Result<Parameters> {
        let mut members = Vec::with_capacity(self.members.len());
        for member in &self.members {
            let addr = resolve(&member.host, member.port)
                .with_context(|| format!("resolving member {}:{}", member.host, member.port))?;
            members.push(addr);
        }

        Ok(Parameters::builder()
            .id(NodeId(self.id))
            .listen(SocketAddr::new("0.0.0.0".parse().expect("can't fail"), self.port))
            .members(members)
            .data_dir(self.dir.clone())
            .heartbeat_timeout(Duration::from_secs_f64(self.heartbeat_timeout))
            .heartbeat_interval(Duration::from_secs_f64(self.heartbeat_interval))
            .election_timeout(Duration::from_secs_f64(self.election_timeout))
            .rotate_interval(Duration::from_secs_f64(self.rotate_interval))
            .flush_interval(Duration::from_secs_f64(self.flush_interval))
            .rpc_max_batch(self.rpc_max_batch)
            .applied_backlog(self.applied_backlog)
            .max_message_size(self.max_message_size)
            .build())
    }
}

fn resolve(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow::anyhow!("no address for {host}:{port}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_config() {
        let raw = r#"{
            "id": 1,
            "members": [
                {"host": "127.0.0.1", "port": 4001},
                {"host": "127.0.0.1", "port": 4002},
                {"host": "127.0.0.1", "port": 4003}
            ],
            "port": 4002,
            "dir": "/var/lib/raftkvd",
            "heartbeat_timeout": 0.5,
            "heartbeat_interval": 0.1,
            "election_timeout": 2.5,
            "rotate_interval": 30,
            "flush_interval": 0.05,
            "rpc_max_batch": 128,
            "applied_backlog": 1024,
            "pool_size": 4,
            "max_batch": 64,
            "log_level": "debug"
        }"#;

        let config: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(config.id, 1);
        assert_eq!(config.members.len(), 3);
        assert_eq!(config.log_level.as_deref(), Some("debug"));

        let params = config.to_parameters().unwrap();
        assert_eq!(params.id, NodeId(1));
        assert_eq!(params.election_timeout, Duration::from_secs_f64(2.5));
        assert_eq!(params.heartbeat_interval, Duration::from_millis(100));
        assert_eq!(params.members.len(), 3);
    }
}
