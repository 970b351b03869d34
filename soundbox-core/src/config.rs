//! Engine configuration.
//!
//! All knobs have deployment-tested defaults; a TOML file (or any serde
//! source) can override them field by field.

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Address the device listener binds to.
    pub bind_addr: String,
    /// Device TCP port.
    pub port: u16,
    /// Key the devices sign their login tokens with.
    pub secret_key: String,
    /// Key the server signs its acknowledgement tokens with.
    pub api_key: String,

    /// Seconds a fresh connection may stay unauthenticated.
    pub login_timeout_secs: u64,
    /// Seconds before the heartbeat watchdog fires the first time.
    pub heartbeat_delay_secs: u64,
    /// Heartbeat watchdog period in seconds.
    pub heartbeat_period_secs: u64,
    /// Watchdog ticks without inbound traffic before the connection is
    /// declared dead.
    pub heartbeat_max_missed: u32,

    /// Per-attempt wait for a command reply, in seconds.
    pub reply_timeout_secs: u64,
    /// Socket write deadline in seconds.
    pub send_timeout_secs: u64,
    /// Attempts per reliability loop.
    pub retry_limit: u32,

    /// Capacity of the per-connection work queues (inbound frames,
    /// outbound frames, transfer jobs). Producers block when full.
    pub queue_depth: usize,

    /// Seconds between supervisor sweeps over the registry.
    pub supervisor_period_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 10808,
            secret_key: String::new(),
            api_key: String::new(),
            login_timeout_secs: 10,
            heartbeat_delay_secs: 30,
            heartbeat_period_secs: 25,
            heartbeat_max_missed: 3,
            reply_timeout_secs: 10,
            send_timeout_secs: 5,
            retry_limit: 3,
            queue_depth: 20,
            supervisor_period_secs: 10,
        }
    }
}

impl EngineConfig {
    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }

    pub fn heartbeat_delay(&self) -> Duration {
        Duration::from_secs(self.heartbeat_delay_secs)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_period_secs)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn supervisor_period(&self) -> Duration {
        Duration::from_secs(self.supervisor_period_secs)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}
