//! Configuration surface (§6) — layered CLI/env > TOML file > built-in default,
//! grounded on `config::DaemonConfig`'s precedence rule.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::error;

const DEFAULT_PORT: u16 = 7300;
const DEFAULT_REST_PORT: u16 = 7301;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
const DEFAULT_AGENT_GRACE_PERIOD_SECS: u64 = 120;
const DEFAULT_POLLING_INTERVAL_MS: u64 = 250;
const DEFAULT_MAX_CONCURRENCY: usize = 16;
const DEFAULT_MAX_DISPATCH_RETRIES: u32 = 3;
const DEFAULT_CHECK_INTERVAL_MS: u64 = 1_000;
const DEFAULT_JOB_TIMEOUT_SECS: u64 = 300;
const DEFAULT_ACK_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_TIMEOUT_RETRIES: u32 = 1;
const DEFAULT_IDEMPOTENCY_TTL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_RESILIENCE_MAX_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_RESILIENCE_BASE_DELAY_MS: u64 = 200;
const DEFAULT_RESILIENCE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_RESILIENCE_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_RESILIENCE_BREAK_SECS: u64 = 30;

// ─── TOML config file ───────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
struct TomlConfig {
    port: Option<u16>,
    rest_port: Option<u16>,
    log: Option<String>,
    heartbeat_interval_secs: Option<u64>,
    agent_grace_period_secs: Option<u64>,
    work_item_processor: Option<TomlWorkItemProcessor>,
    timeout_monitor: Option<TomlTimeoutMonitor>,
    idempotency: Option<TomlIdempotency>,
    resilience: Option<TomlResilience>,
}

#[derive(Deserialize, Default)]
struct TomlWorkItemProcessor {
    polling_interval_ms: Option<u64>,
    max_concurrency: Option<usize>,
    max_dispatch_retries: Option<u32>,
}

#[derive(Deserialize, Default)]
struct TomlTimeoutMonitor {
    check_interval_ms: Option<u64>,
    default_job_timeout_secs: Option<u64>,
    ack_timeout_secs: Option<u64>,
    max_timeout_retries: Option<u32>,
}

#[derive(Deserialize, Default)]
struct TomlIdempotency {
    ttl_secs: Option<u64>,
}

#[derive(Deserialize, Default)]
struct TomlResilience {
    max_retry_attempts: Option<u32>,
    base_delay_ms: Option<u64>,
    timeout_secs: Option<u64>,
    failure_threshold: Option<u32>,
    break_duration_secs: Option<u64>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── Resolved config ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WorkItemProcessorConfig {
    pub polling_interval: Duration,
    pub max_concurrency: usize,
    pub max_dispatch_retries: u32,
}

#[derive(Debug, Clone)]
pub struct TimeoutMonitorConfig {
    pub check_interval: Duration,
    pub default_job_timeout: Duration,
    pub ack_timeout: Duration,
    pub max_timeout_retries: u32,
}

#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    pub ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    pub max_retry_attempts: u32,
    pub base_delay: Duration,
    pub timeout: Duration,
    pub failure_threshold: u32,
    pub break_duration: Duration,
}

#[derive(Debug, Clone)]
pub struct OrbitMeshConfig {
    pub port: u16,
    pub rest_port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    pub heartbeat_interval: Duration,
    pub agent_grace_period: Duration,
    pub work_item_processor: WorkItemProcessorConfig,
    pub timeout_monitor: TimeoutMonitorConfig,
    pub idempotency: IdempotencyConfig,
    pub resilience: ResilienceConfig,
}

impl OrbitMeshConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest): CLI/env (`Some(value)`) > TOML file at
    /// `{data_dir}/config.toml` > built-in default.
    pub fn new(port: Option<u16>, data_dir: Option<PathBuf>, log: Option<String>) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let rest_port = toml.rest_port.unwrap_or(DEFAULT_REST_PORT);
        let log = std::env::var("ORBITMESH_LOG")
            .ok()
            .or(log)
            .or(toml.log)
            .unwrap_or_else(|| "info".to_string());

        let heartbeat_interval = Duration::from_secs(
            toml.heartbeat_interval_secs
                .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_SECS),
        );
        let agent_grace_period = Duration::from_secs(
            toml.agent_grace_period_secs
                .unwrap_or(DEFAULT_AGENT_GRACE_PERIOD_SECS),
        );

        let wip = toml.work_item_processor.unwrap_or_default();
        let work_item_processor = WorkItemProcessorConfig {
            polling_interval: Duration::from_millis(
                wip.polling_interval_ms.unwrap_or(DEFAULT_POLLING_INTERVAL_MS),
            ),
            max_concurrency: wip.max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY),
            max_dispatch_retries: wip
                .max_dispatch_retries
                .unwrap_or(DEFAULT_MAX_DISPATCH_RETRIES),
        };

        let tm = toml.timeout_monitor.unwrap_or_default();
        let timeout_monitor = TimeoutMonitorConfig {
            check_interval: Duration::from_millis(
                tm.check_interval_ms.unwrap_or(DEFAULT_CHECK_INTERVAL_MS),
            ),
            default_job_timeout: Duration::from_secs(
                tm.default_job_timeout_secs.unwrap_or(DEFAULT_JOB_TIMEOUT_SECS),
            ),
            ack_timeout: Duration::from_secs(tm.ack_timeout_secs.unwrap_or(DEFAULT_ACK_TIMEOUT_SECS)),
            max_timeout_retries: tm.max_timeout_retries.unwrap_or(DEFAULT_MAX_TIMEOUT_RETRIES),
        };

        let idem = toml.idempotency.unwrap_or_default();
        let idempotency = IdempotencyConfig {
            ttl: Duration::from_secs(idem.ttl_secs.unwrap_or(DEFAULT_IDEMPOTENCY_TTL_SECS)),
        };

        let res = toml.resilience.unwrap_or_default();
        let resilience = ResilienceConfig {
            max_retry_attempts: res
                .max_retry_attempts
                .unwrap_or(DEFAULT_RESILIENCE_MAX_RETRY_ATTEMPTS),
            base_delay: Duration::from_millis(
                res.base_delay_ms.unwrap_or(DEFAULT_RESILIENCE_BASE_DELAY_MS),
            ),
            timeout: Duration::from_secs(
                res.timeout_secs.unwrap_or(DEFAULT_RESILIENCE_TIMEOUT_SECS),
            ),
            failure_threshold: res
                .failure_threshold
                .unwrap_or(DEFAULT_RESILIENCE_FAILURE_THRESHOLD),
            break_duration: Duration::from_secs(
                res.break_duration_secs.unwrap_or(DEFAULT_RESILIENCE_BREAK_SECS),
            ),
        };

        Self {
            port,
            rest_port,
            data_dir,
            log,
            heartbeat_interval,
            agent_grace_period,
            work_item_processor,
            timeout_monitor,
            idempotency,
            resilience,
        }
    }
}

impl Default for OrbitMeshConfig {
    fn default() -> Self {
        Self::new(None, None, None)
    }
}

fn default_data_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg).join("orbitmesh");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local").join("share").join("orbitmesh");
    }
    PathBuf::from(".orbitmesh")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn toml_file_fills_in_values_absent_from_cli() {
        let dir = TempDir::new().expect("tempdir");
        fs::write(
            dir.path().join("config.toml"),
            "rest_port = 9000\n\n[resilience]\nmax_retry_attempts = 7\n",
        )
        .expect("write config.toml");

        let config = OrbitMeshConfig::new(None, Some(dir.path().to_path_buf()), None);
        assert_eq!(config.rest_port, 9000);
        assert_eq!(config.resilience.max_retry_attempts, 7);
        // Port wasn't set in the file, so it falls all the way back to the
        // built-in default.
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn cli_port_overrides_the_toml_file() {
        let dir = TempDir::new().expect("tempdir");
        fs::write(dir.path().join("config.toml"), "port = 1111\n").expect("write config.toml");

        let config = OrbitMeshConfig::new(Some(2222), Some(dir.path().to_path_buf()), None);
        assert_eq!(config.port, 2222);
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let config = OrbitMeshConfig::new(None, Some(dir.path().to_path_buf()), None);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.rest_port, DEFAULT_REST_PORT);
        assert_eq!(config.idempotency.ttl, Duration::from_secs(DEFAULT_IDEMPOTENCY_TTL_SECS));
    }

    #[test]
    fn malformed_config_file_is_ignored_with_defaults_used() {
        let dir = TempDir::new().expect("tempdir");
        fs::write(dir.path().join("config.toml"), "not valid toml {{{").expect("write config.toml");

        let config = OrbitMeshConfig::new(None, Some(dir.path().to_path_buf()), None);
        assert_eq!(config.port, DEFAULT_PORT);
    }
}
