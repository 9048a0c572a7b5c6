//! Configuration for the manager.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

/// Top-level configuration for the manager service.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ManagerConfig {
    /// Pipe transport configuration.
    #[serde(default)]
    pub pipe: PipeConfig,

    /// Orchestration behaviour.
    #[serde(default)]
    pub orchestration: OrchestrationConfig,

    /// Working directory layout.
    #[serde(default)]
    pub paths: PathsConfig,

    /// Event bus configuration.
    #[serde(default)]
    pub events: EventsConfig,
}

impl ManagerConfig {
    /// Load configuration from the default sources.
    ///
    /// Later sources override earlier ones:
    /// 1. Default values
    /// 2. `convoy.toml` in the current directory (if present)
    /// 3. Environment variables with `CONVOY_MANAGER_` prefix
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("convoy.toml"))
            .merge(Env::prefixed("CONVOY_MANAGER_").split("__"))
            .extract()
    }
}

/// Pipe transport configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PipeConfig {
    /// Address agents subscribe on.
    #[serde(default = "default_publish_addr")]
    pub publish_addr: SocketAddr,

    /// Address agents deliver responses on.
    #[serde(default = "default_collect_addr")]
    pub collect_addr: SocketAddr,

    /// Bounded queue depth for each pipe direction.
    #[serde(default = "default_queue")]
    pub queue: usize,
}

fn default_publish_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 5556)
}

fn default_collect_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 5557)
}

const fn default_queue() -> usize {
    64
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            publish_addr: default_publish_addr(),
            collect_addr: default_collect_addr(),
            queue: default_queue(),
        }
    }
}

/// Announce/send/confirm loop behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestrationConfig {
    /// Pause between the announcement and the task body, giving agents
    /// time to subscribe to the task topic.
    #[serde(default = "default_announce_delay_ms")]
    pub announce_delay_ms: u64,

    /// First confirm-loop backoff.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Backoff growth per unacknowledged iteration.
    #[serde(default = "default_backoff_step_ms")]
    pub backoff_step_ms: u64,

    /// Backoff ceiling.
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

const fn default_announce_delay_ms() -> u64 {
    1_000
}

const fn default_backoff_base_ms() -> u64 {
    10_000
}

const fn default_backoff_step_ms() -> u64 {
    10_000
}

const fn default_backoff_cap_ms() -> u64 {
    60_000
}

impl OrchestrationConfig {
    /// The announce delay as a duration.
    #[must_use]
    pub const fn announce_delay(&self) -> Duration {
        Duration::from_millis(self.announce_delay_ms)
    }

    /// The starting backoff as a duration.
    #[must_use]
    pub const fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    /// The backoff increment as a duration.
    #[must_use]
    pub const fn backoff_step(&self) -> Duration {
        Duration::from_millis(self.backoff_step_ms)
    }

    /// The backoff ceiling as a duration.
    #[must_use]
    pub const fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            announce_delay_ms: default_announce_delay_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_step_ms: default_backoff_step_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
        }
    }
}

/// Working directory layout.
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Root below which per-order directories live (`orders/<id>/`).
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/var/lib/convoy/manager")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
        }
    }
}

/// Event bus configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    /// Unread events retained per subscriber before drop-oldest applies.
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

const fn default_event_capacity() -> usize {
    256
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}
