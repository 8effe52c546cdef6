use std::path::PathBuf;

use satlink_codec::Value;
use satlink_reliable::ReliableConfig;
use satlink_utils::backoff::Backoff;
use serde::{Deserialize, Deserializer};

use crate::json::json_to_value;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub factor: f64,
    /// Random spread applied to every delay, as a ratio of it.
    pub jitter: f64,
    /// Consecutive failures tolerated before giving up. `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 1000,
            max_ms: 20_000,
            factor: 1.4,
            jitter: 0.1,
            max_retries: None,
        }
    }
}

impl BackoffConfig {
    pub fn build(&self) -> Backoff {
        Backoff::new(self.initial_ms, self.max_ms, self.factor).with_jitter(self.jitter)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MplexConfig {
    /// Rendezvous socket. A bare name lives in `$XDG_RUNTIME_DIR`.
    pub socket: PathBuf,
    pub reliable: ReliableConfig,
    pub backoff: BackoffConfig,
    /// Satellite watchdog ping interval, 0 disables it.
    pub watchdog_ms: u64,
    pub watchdog_timeout_ms: u64,
    /// Fetch `sys.cfg` from the satellite after connecting.
    pub fetch_config: bool,
    /// Cap for the reliable handshake.
    pub connect_timeout_ms: u64,
    pub call_timeout_ms: u64,
    /// Local app setup: `{apps: {name: type}, <name>: <app config>}`.
    #[serde(deserialize_with = "plain_value")]
    pub apps: Value,
}

impl Default for MplexConfig {
    fn default() -> Self {
        Self {
            socket: PathBuf::from("satlink"),
            reliable: ReliableConfig::default(),
            backoff: BackoffConfig::default(),
            watchdog_ms: 0,
            watchdog_timeout_ms: 2000,
            fetch_config: false,
            connect_timeout_ms: 10_000,
            call_timeout_ms: 10_000,
            apps: Value::Nil,
        }
    }
}

impl MplexConfig {
    pub fn socket_path(&self) -> PathBuf {
        if self.socket.components().count() > 1 || self.socket.is_absolute() {
            return self.socket.clone();
        }
        match std::env::var_os("XDG_RUNTIME_DIR") {
            Some(dir) => PathBuf::from(dir).join(&self.socket),
            None => std::env::temp_dir().join(&self.socket),
        }
    }
}

/// Reads a value from its plain serde form instead of the tagged one.
fn plain_value<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Value, D::Error> {
    serde_json::Value::deserialize(deserializer).map(json_to_value)
}

/// Remote config overlaid with the local one, key by key at the top level.
pub(crate) fn merge_config(remote: Value, local: &Value) -> Value {
    match (remote, local) {
        (Value::Map(mut remote), Value::Map(local)) => {
            for (k, v) in local {
                remote.insert(k.clone(), v.clone());
            }
            Value::Map(remote)
        }
        (remote, Value::Nil) => remote,
        (_, local) => local.clone(),
    }
}
