use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use lodestone_discovery::{LivenessConfig, NotifyConfig};

#[derive(Parser, Debug, Clone)]
#[command(name = "lodestone-server")]
#[command(about = "Lodestone service registry", long_about = None)]
pub struct Config {
    #[arg(long, env = "LODESTONE_DB", default_value = "lodestone.db")]
    pub db: String,

    #[arg(long, env = "LODESTONE_ADDR", default_value = "127.0.0.1:30100")]
    pub addr: SocketAddr,

    /// Heartbeat workers, 0 uses every available core
    #[arg(long, env = "LODESTONE_HEARTBEAT_WORKERS", default_value_t = 0)]
    pub heartbeat_workers: usize,

    #[arg(long, env = "LODESTONE_HEARTBEAT_QUEUE_CAPACITY", default_value_t = 10_000)]
    pub heartbeat_queue_capacity: usize,

    /// How long a heartbeat may wait for queue space
    #[arg(long, env = "LODESTONE_HEARTBEAT_TIMEOUT_SECS", default_value_t = 10)]
    pub heartbeat_timeout_secs: u64,

    #[arg(long, env = "LODESTONE_DEFAULT_TTL_SECS", default_value_t = 30)]
    pub default_ttl_secs: i64,

    #[arg(long, env = "LODESTONE_REAP_INTERVAL_MS", default_value_t = 1_000)]
    pub reap_interval_ms: u64,

    #[arg(long, env = "LODESTONE_EVICTION_TIMEOUT_SECS", default_value_t = 5)]
    pub eviction_timeout_secs: u64,

    /// Per-watcher delivery queue
    #[arg(long, env = "LODESTONE_NOTIFY_QUEUE_CAPACITY", default_value_t = 32)]
    pub notify_queue_capacity: usize,

    #[arg(long, env = "LODESTONE_SYNC_QUEUE_CAPACITY", default_value_t = 1_000)]
    pub sync_queue_capacity: usize,

    #[arg(long, env = "LODESTONE_SYNC_ENABLED", default_value_t = true, action = clap::ArgAction::Set)]
    pub sync_enabled: bool,

    #[arg(long, env = "LODESTONE_SHUTDOWN_GRACE_SECS", default_value_t = 10)]
    pub shutdown_grace_secs: u64,
}

impl Config {
    pub fn liveness(&self) -> LivenessConfig {
        LivenessConfig {
            workers: self.heartbeat_workers,
            queue_capacity: self.heartbeat_queue_capacity,
            enqueue_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            default_ttl_secs: self.default_ttl_secs,
            reap_interval: Duration::from_millis(self.reap_interval_ms.max(1)),
        }
    }

    pub fn notify(&self) -> NotifyConfig {
        NotifyConfig {
            queue_capacity: self.notify_queue_capacity,
        }
    }

    pub fn eviction_timeout(&self) -> Duration {
        Duration::from_secs(self.eviction_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
