//! Engine configuration
//!
//! Defaults carry the documented values; `from_env` applies the recognized
//! environment overrides. Unknown variables are ignored, malformed values are
//! rejected so a typo cannot silently run with defaults.

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub queue: QueueConfig,
    pub executor: ExecutorConfig,
    pub scheduler: SchedulerConfig,
    pub breaker: BreakerConfig,
    pub sandbox: SandboxConfig,
    pub server: ServerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            executor: ExecutorConfig::default(),
            scheduler: SchedulerConfig::default(),
            breaker: BreakerConfig::default(),
            sandbox: SandboxConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

/// Queue adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Concurrent in-flight executions per worker
    pub prefetch: usize,
    /// Lease duration before an unacked message is redelivered
    pub visibility_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            prefetch: 1,
            visibility_timeout: Duration::from_secs(300),
        }
    }
}

/// Node executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Per-attempt handler timeout
    pub node_timeout: Duration,
    /// Maximum attempts per node, including the first
    pub max_attempts: u32,
    /// Base backoff delay, doubled per attempt
    pub base_delay: Duration,
    /// Backoff ceiling
    pub max_delay: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            node_timeout: Duration::from_secs(30),
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Per-execution node parallelism cap
    pub max_in_flight: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { max_in_flight: 4 }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens
    pub threshold: u32,
    /// Open-state cooldown before a half-open probe
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Sandbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Hard wall-clock limit on one evaluation
    pub timeout: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind: String,
    /// Sled data directory
    pub data_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8088".to_string(),
            data_dir: "./strand-data".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load defaults with environment overrides applied.
    pub fn from_env() -> EngineResult<Self> {
        let mut config = Self::default();

        if let Some(v) = env_var("QUEUE_PREFETCH")? {
            config.queue.prefetch = parse_int(&v, "QUEUE_PREFETCH")? as usize;
        }
        if let Some(v) = env_var("NODE_EXECUTION_TIMEOUT")? {
            config.executor.node_timeout = parse_duration(&v, "NODE_EXECUTION_TIMEOUT")?;
        }
        if let Some(v) = env_var("MAX_RETRIES")? {
            config.executor.max_attempts = parse_int(&v, "MAX_RETRIES")?;
        }
        if let Some(v) = env_var("CIRCUIT_BREAKER_THRESHOLD")? {
            config.breaker.threshold = parse_int(&v, "CIRCUIT_BREAKER_THRESHOLD")?;
        }
        if let Some(v) = env_var("CIRCUIT_BREAKER_COOLDOWN")? {
            config.breaker.cooldown = parse_duration(&v, "CIRCUIT_BREAKER_COOLDOWN")?;
        }
        if let Some(v) = env_var("SANDBOX_TIMEOUT")? {
            config.sandbox.timeout = parse_duration(&v, "SANDBOX_TIMEOUT")?;
        }
        if let Some(v) = env_var("STRAND_BIND")? {
            config.server.bind = v;
        }
        if let Some(v) = env_var("STRAND_DATA_DIR")? {
            config.server.data_dir = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot run.
    pub fn validate(&self) -> EngineResult<()> {
        if self.queue.prefetch < 1 {
            return Err(EngineError::Config(
                "QUEUE_PREFETCH must be at least 1".to_string(),
            ));
        }
        if self.executor.max_attempts < 1 {
            return Err(EngineError::Config(
                "MAX_RETRIES must be at least 1".to_string(),
            ));
        }
        if self.scheduler.max_in_flight < 1 {
            return Err(EngineError::Config(
                "maxInFlight must be at least 1".to_string(),
            ));
        }
        if self.breaker.threshold < 1 {
            return Err(EngineError::Config(
                "CIRCUIT_BREAKER_THRESHOLD must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_var(name: &str) -> EngineResult<Option<String>> {
    match std::env::var(name) {
        Ok(v) if v.is_empty() => Ok(None),
        Ok(v) => Ok(Some(v)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(EngineError::Config(format!("{}: {}", name, e))),
    }
}

fn parse_int(value: &str, name: &str) -> EngineResult<u32> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|_| EngineError::Config(format!("{} must be an integer, got {:?}", name, value)))
}

/// Parse `500ms`, `30s`, `5m`, or a bare integer (seconds).
pub fn parse_duration(value: &str, name: &str) -> EngineResult<Duration> {
    let v = value.trim();
    let parse_num = |s: &str| -> EngineResult<u64> {
        s.parse::<u64>()
            .map_err(|_| EngineError::Config(format!("{} has invalid duration {:?}", name, value)))
    };
    if let Some(ms) = v.strip_suffix("ms") {
        return Ok(Duration::from_millis(parse_num(ms)?));
    }
    if let Some(m) = v.strip_suffix('m') {
        return Ok(Duration::from_secs(parse_num(m)? * 60));
    }
    if let Some(s) = v.strip_suffix('s') {
        return Ok(Duration::from_secs(parse_num(s)?));
    }
    Ok(Duration::from_secs(parse_num(v)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.queue.prefetch, 1);
        assert_eq!(config.executor.node_timeout, Duration::from_secs(30));
        assert_eq!(config.executor.max_attempts, 3);
        assert_eq!(config.breaker.threshold, 5);
        assert_eq!(config.breaker.cooldown, Duration::from_secs(60));
        assert_eq!(config.sandbox.timeout, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn duration_suffixes() {
        assert_eq!(
            parse_duration("500ms", "X").unwrap(),
            Duration::from_millis(500)
        );
        assert_eq!(parse_duration("45s", "X").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("2m", "X").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("10", "X").unwrap(), Duration::from_secs(10));
        assert!(parse_duration("soon", "X").is_err());
    }

    #[test]
    #[serial]
    fn env_overrides_apply() {
        std::env::set_var("QUEUE_PREFETCH", "8");
        std::env::set_var("MAX_RETRIES", "5");
        std::env::set_var("NODE_EXECUTION_TIMEOUT", "10s");
        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.queue.prefetch, 8);
        assert_eq!(config.executor.max_attempts, 5);
        assert_eq!(config.executor.node_timeout, Duration::from_secs(10));
        std::env::remove_var("QUEUE_PREFETCH");
        std::env::remove_var("MAX_RETRIES");
        std::env::remove_var("NODE_EXECUTION_TIMEOUT");
    }

    #[test]
    #[serial]
    fn malformed_env_is_rejected() {
        std::env::set_var("QUEUE_PREFETCH", "many");
        assert!(EngineConfig::from_env().is_err());
        std::env::remove_var("QUEUE_PREFETCH");
    }
}
