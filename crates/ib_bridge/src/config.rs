//! Bridge tunables. Loaded from a JSON file, then overridden by
//! `IB_BRIDGE_*` environment variables.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Each state must be left within this long, unless the timeout is benign.
    pub protocol_timeout_ms: u64,
    /// How long the browser gets to come back after it disconnected.
    pub reconnection_timeout_ms: u64,
    pub keepalive_interval_ms: u64,
    /// Reconnect before the relay's two-hour idle cut.
    pub proactive_reconnect_ms: u64,
    pub proactive_reconnect_jitter_ms: u64,
    /// A disconnect this soon after an unexpected re-registration is stale.
    pub anti_flap_window_ms: u64,
    pub upload_completion_timeout_ms: u64,
    pub download_chunk_size: usize,
    /// Outbound frames queued on the transport before downloads back off.
    pub backlog_threshold: usize,
    pub backpressure_delay_ms: u64,
    pub dedup_capacity: usize,
    /// Scratch directory for uploads; the system temp dir when unset.
    pub upload_dir: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            protocol_timeout_ms: 30_000,
            reconnection_timeout_ms: 60_000,
            keepalive_interval_ms: 30_000,
            proactive_reconnect_ms: 60 * 60 * 1000,
            proactive_reconnect_jitter_ms: 20 * 60 * 1000,
            anti_flap_window_ms: 30_000,
            upload_completion_timeout_ms: 10_000,
            download_chunk_size: 64 * 1024,
            backlog_threshold: 32,
            backpressure_delay_ms: 100,
            dedup_capacity: 1024,
            upload_dir: None,
        }
    }
}

impl BridgeConfig {
    /// Read `path` if it exists (defaults otherwise), then apply the
    /// environment.
    pub fn load(path: &Path) -> Result<Self, BridgeError> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str(&raw)
                .map_err(|e| BridgeError::Config(format!("{}: {e}", path.display())))?
        } else {
            Self::default()
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), BridgeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| -> Result<Option<u64>, BridgeError> {
            lookup(name)
                .map(|raw| {
                    raw.trim()
                        .parse::<u64>()
                        .map_err(|_| BridgeError::Config(format!("{name}={raw} is not a number")))
                })
                .transpose()
        };

        if let Some(v) = read("IB_BRIDGE_PROTOCOL_TIMEOUT_MS")? {
            self.protocol_timeout_ms = v;
        }
        if let Some(v) = read("IB_BRIDGE_RECONNECTION_TIMEOUT_MS")? {
            self.reconnection_timeout_ms = v;
        }
        if let Some(v) = read("IB_BRIDGE_KEEPALIVE_INTERVAL_MS")? {
            self.keepalive_interval_ms = v;
        }
        if let Some(v) = read("IB_BRIDGE_PROACTIVE_RECONNECT_MS")? {
            self.proactive_reconnect_ms = v;
        }
        if let Some(v) = read("IB_BRIDGE_PROACTIVE_RECONNECT_JITTER_MS")? {
            self.proactive_reconnect_jitter_ms = v;
        }
        if let Some(v) = read("IB_BRIDGE_ANTI_FLAP_WINDOW_MS")? {
            self.anti_flap_window_ms = v;
        }
        if let Some(v) = read("IB_BRIDGE_UPLOAD_COMPLETION_TIMEOUT_MS")? {
            self.upload_completion_timeout_ms = v;
        }
        if let Some(v) = read("IB_BRIDGE_DOWNLOAD_CHUNK_SIZE")? {
            self.download_chunk_size = v as usize;
        }
        if let Some(v) = read("IB_BRIDGE_BACKLOG_THRESHOLD")? {
            self.backlog_threshold = v as usize;
        }
        if let Some(v) = read("IB_BRIDGE_BACKPRESSURE_DELAY_MS")? {
            self.backpressure_delay_ms = v;
        }
        if let Some(v) = read("IB_BRIDGE_DEDUP_CAPACITY")? {
            self.dedup_capacity = v as usize;
        }
        if let Some(dir) = lookup("IB_BRIDGE_UPLOAD_DIR") {
            self.upload_dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.download_chunk_size == 0 {
            return Err(BridgeError::Config("download_chunk_size must be positive".into()));
        }
        if self.dedup_capacity == 0 {
            return Err(BridgeError::Config("dedup_capacity must be positive".into()));
        }
        if self.keepalive_interval_ms == 0 || self.proactive_reconnect_ms == 0 {
            return Err(BridgeError::Config("periodic timers need a non-zero period".into()));
        }
        Ok(())
    }

    pub fn protocol_timeout(&self) -> Duration {
        Duration::from_millis(self.protocol_timeout_ms)
    }

    pub fn reconnection_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnection_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    /// Base period plus a fresh random jitter.
    pub fn proactive_reconnect_delay(&self) -> Duration {
        use rand::Rng;
        let jitter = if self.proactive_reconnect_jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.proactive_reconnect_jitter_ms)
        };
        Duration::from_millis(self.proactive_reconnect_ms.saturating_add(jitter))
    }

    pub fn anti_flap_window(&self) -> Duration {
        Duration::from_millis(self.anti_flap_window_ms)
    }

    pub fn upload_completion_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_completion_timeout_ms)
    }

    pub fn backpressure_delay(&self) -> Duration {
        Duration::from_millis(self.backpressure_delay_ms)
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.upload_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("ib-uploads"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_keeps_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bridge.json");
        std::fs::write(&path, r#"{ "backlog_threshold": 4 }"#).unwrap();
        let config = BridgeConfig::load(&path).unwrap();
        assert_eq!(config.backlog_threshold, 4);
        assert_eq!(config.anti_flap_window_ms, 30_000);
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("IB_BRIDGE_PROTOCOL_TIMEOUT_MS", "500"),
            ("IB_BRIDGE_UPLOAD_DIR", "/tmp/ib-test-uploads"),
        ]
        .into_iter()
        .collect();
        let mut config = BridgeConfig::default();
        config
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.protocol_timeout(), Duration::from_millis(500));
        assert_eq!(config.upload_dir(), PathBuf::from("/tmp/ib-test-uploads"));
    }

    #[test]
    fn malformed_override_is_a_config_error() {
        let mut config = BridgeConfig::default();
        let err = config
            .apply_overrides(|name| (name == "IB_BRIDGE_DEDUP_CAPACITY").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn proactive_delay_stays_within_jitter() {
        let config = BridgeConfig::default();
        for _ in 0..32 {
            let delay = config.proactive_reconnect_delay();
            assert!(delay >= Duration::from_secs(3600));
            assert!(delay <= Duration::from_secs(3600 + 20 * 60));
        }
    }

    #[test]
    fn huge_proactive_period_saturates() {
        let config = BridgeConfig {
            proactive_reconnect_ms: u64::MAX,
            proactive_reconnect_jitter_ms: 1_000,
            ..BridgeConfig::default()
        };
        assert_eq!(config.proactive_reconnect_delay(), Duration::from_millis(u64::MAX));
    }
}
