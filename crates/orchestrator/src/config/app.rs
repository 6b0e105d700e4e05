//! Runtime configuration for the orchestrator and its workers.

use std::time::Duration;

use serde::Deserialize;

/// Orchestrator configuration loaded from environment variables.
///
/// Environment variables are prefixed with `NOETL_`:
/// - `NOETL_WORKER_COUNT`: Workers polling the queue in this process (default: 4)
/// - `NOETL_WORKER_ID_PREFIX`: Prefix for generated worker ids (default: "worker")
/// - `NOETL_LEASE_SECONDS`: Lease visibility timeout (default: 60)
/// - `NOETL_HEARTBEAT_SECONDS`: Lease extension interval (default: 20)
/// - `NOETL_POLL_INTERVAL_MS`: Idle worker poll interval (default: 500)
/// - `NOETL_ORCHESTRATOR_INTERVAL_MS`: Event sweep interval (default: 250)
/// - `NOETL_PLAYBOOK_DIR`: Directory catalog root (default: "playbooks")
/// - `NOETL_LOG_FORMAT`: "text" or "json" (default: "text")
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    #[serde(default = "default_worker_id_prefix")]
    pub worker_id_prefix: String,

    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,

    #[serde(default = "default_heartbeat_seconds")]
    pub heartbeat_seconds: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_orchestrator_interval_ms")]
    pub orchestrator_interval_ms: u64,

    #[serde(default = "default_playbook_dir")]
    pub playbook_dir: String,

    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_worker_count() -> usize {
    4
}

fn default_worker_id_prefix() -> String {
    "worker".to_string()
}

fn default_lease_seconds() -> u64 {
    60
}

fn default_heartbeat_seconds() -> u64 {
    20
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_orchestrator_interval_ms() -> u64 {
    250
}

fn default_playbook_dir() -> String {
    "playbooks".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl OrchestratorConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables are prefixed with `NOETL_`.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("NOETL_").from_env::<OrchestratorConfig>()
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_seconds)
    }

    /// Heartbeat interval, clamped below the lease timeout so a live worker
    /// always extends before expiry.
    pub fn heartbeat_interval(&self) -> Duration {
        let lease = self.lease_seconds.max(1);
        let heartbeat = self.heartbeat_seconds.clamp(1, lease.saturating_sub(1).max(1));
        Duration::from_secs(heartbeat)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn orchestrator_interval(&self) -> Duration {
        Duration::from_millis(self.orchestrator_interval_ms)
    }

    pub fn json_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            worker_id_prefix: default_worker_id_prefix(),
            lease_seconds: default_lease_seconds(),
            heartbeat_seconds: default_heartbeat_seconds(),
            poll_interval_ms: default_poll_interval_ms(),
            orchestrator_interval_ms: default_orchestrator_interval_ms(),
            playbook_dir: default_playbook_dir(),
            log_format: default_log_format(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.lease_timeout(), Duration::from_secs(60));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(20));
        assert!(!config.json_logs());
    }

    #[test]
    fn test_heartbeat_clamped_below_lease() {
        let config = OrchestratorConfig {
            lease_seconds: 10,
            heartbeat_seconds: 30,
            ..Default::default()
        };
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(9));
    }
}
