use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Interval used when `poll_interval` is unset or non-positive.
const DEFAULT_POLL_INTERVAL: u64 = 5;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// HAProxy statistics listener port; zero or negative disables it.
    pub stats_port: i32,
    /// Seconds between inventory polls.
    pub poll_interval: u64,
    /// PID file HAProxy writes its master PID to.
    pub pid_file: PathBuf,
    /// Stats socket used for listener handoff between masters.
    pub sock_file: PathBuf,
    /// Path the rendered configuration is written to.
    pub config_file: PathBuf,
    /// Optional override template; replaces the built-in one when present.
    pub template_file: PathBuf,
    /// Name of the load-balancer binary to resolve on PATH.
    pub binary: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stats_port: 0,
            poll_interval: DEFAULT_POLL_INTERVAL,
            pid_file: "/tmp/haproxy.pid".into(),
            sock_file: "/tmp/haproxy.sock".into(),
            config_file: "/usr/local/etc/haproxy/haproxy.cfg".into(),
            template_file: "/haproxy.tmpl".into(),
            binary: "haproxy".into(),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("tether.toml"))
            .merge(Json::file("tether.json"))
            .merge(Env::prefixed("TETHER_"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        if config.poll_interval == 0 {
            config.poll_interval = DEFAULT_POLL_INTERVAL;
        }

        Ok(config)
    }
}
