//! Configuration for the agent.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

/// Top-level configuration for the agent.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// This agent's target identity.
    #[serde(default = "default_target_id")]
    pub target_id: String,

    /// Labels this agent carries, for `TAG-` addressing.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Root below which per-task directories live (`tasks/<id>/`).
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Manager connection.
    #[serde(default)]
    pub manager: ManagerEndpoints,

    /// Path to this agent's Z85 public key file.
    #[serde(default)]
    pub key_file: Option<PathBuf>,

    /// Seconds between advertisements.
    #[serde(default = "default_advertise_interval_secs")]
    pub advertise_interval_secs: u64,

    /// Milliseconds between response flushes.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Seconds a stopped child gets before it is given up on.
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,

    /// Bounded queue depth for the connection.
    #[serde(default = "default_queue")]
    pub queue: usize,
}

impl AgentConfig {
    /// Load configuration from the default sources.
    ///
    /// Later sources override earlier ones:
    /// 1. Default values
    /// 2. `agent.toml` in the current directory (if present)
    /// 3. Environment variables with `CONVOY_AGENT_` prefix
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("agent.toml"))
            .merge(Env::prefixed("CONVOY_AGENT_").split("__"))
            .extract()
    }

    /// The advertisement interval as a duration.
    #[must_use]
    pub const fn advertise_interval(&self) -> Duration {
        Duration::from_secs(self.advertise_interval_secs)
    }

    /// The response flush interval as a duration.
    #[must_use]
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// The stop grace period as a duration.
    #[must_use]
    pub const fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            target_id: default_target_id(),
            tags: Vec::new(),
            work_dir: default_work_dir(),
            manager: ManagerEndpoints::default(),
            key_file: None,
            advertise_interval_secs: default_advertise_interval_secs(),
            flush_interval_ms: default_flush_interval_ms(),
            stop_grace_secs: default_stop_grace_secs(),
            queue: default_queue(),
        }
    }
}

/// Manager endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerEndpoints {
    /// The manager's publish address, subscribed for requests.
    #[serde(default = "default_publish_addr")]
    pub publish_addr: SocketAddr,

    /// The manager's collect address, responses go here.
    #[serde(default = "default_collect_addr")]
    pub collect_addr: SocketAddr,
}

fn default_publish_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5556)
}

fn default_collect_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5557)
}

impl Default for ManagerEndpoints {
    fn default() -> Self {
        Self {
            publish_addr: default_publish_addr(),
            collect_addr: default_collect_addr(),
        }
    }
}

fn default_target_id() -> String {
    uuid_like_host_id()
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/var/lib/convoy/agent")
}

const fn default_advertise_interval_secs() -> u64 {
    30
}

const fn default_flush_interval_ms() -> u64 {
    500
}

const fn default_stop_grace_secs() -> u64 {
    5
}

const fn default_queue() -> usize {
    64
}

/// Hostname when available, so unconfigured agents still advertise a
/// stable identity.
fn uuid_like_host_id() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "convoy-agent".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AgentConfig::default();
        assert!(!config.target_id.is_empty());
        assert_eq!(config.manager.publish_addr.port(), 5556);
        assert_eq!(config.advertise_interval(), Duration::from_secs(30));
    }

    #[test]
    fn config_from_toml() {
        let toml = r#"
            target_id = "edge-7"
            tags = ["edge", "eu"]
            work_dir = "/tmp/agent"

            [manager]
            publish_addr = "10.0.0.1:5556"
            collect_addr = "10.0.0.1:5557"
        "#;

        let config: AgentConfig = toml::from_str(toml).expect("parse");
        assert_eq!(config.target_id, "edge-7");
        assert_eq!(config.tags.len(), 2);
        assert_eq!(config.manager.publish_addr.port(), 5556);
        assert_eq!(config.work_dir, PathBuf::from("/tmp/agent"));
    }
}
