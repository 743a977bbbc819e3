//! Master and worker configuration.
//!
//! Every struct has working defaults and can be overridden from `COLONY_*`
//! environment variables; CLI flags are applied on top by the binary.

use colony_core::ConfigError;
use colony_core::WorkerId;
use colony_core::config::{get_env_duration, get_env_parse, get_env_string, get_env_u64};
use colony_mesh::RuntimeConfig;
use std::time::Duration;

pub const DEFAULT_MASTER_PORT: u16 = 50051;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Bounded exponential backoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let mut policy = Self::default();
        if let Some(attempts) = get_env_parse::<u32>("COLONY_RETRY_MAX_ATTEMPTS")? {
            policy.max_attempts = attempts;
        }
        if let Some(initial) = get_env_duration("COLONY_RETRY_INITIAL_BACKOFF")? {
            policy.initial_backoff = initial;
        }
        if let Some(max) = get_env_duration("COLONY_RETRY_MAX_BACKOFF")? {
            policy.max_backoff = max;
        }
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Successes in half-open state before it closes again
    pub success_threshold: u32,
    /// How long the circuit stays open before a trial call
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(10),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(threshold) = get_env_parse::<u32>("COLONY_BREAKER_FAILURE_THRESHOLD")? {
            config.failure_threshold = threshold;
        }
        if let Some(threshold) = get_env_parse::<u32>("COLONY_BREAKER_SUCCESS_THRESHOLD")? {
            config.success_threshold = threshold;
        }
        if let Some(timeout) = get_env_duration("COLONY_BREAKER_OPEN_TIMEOUT")? {
            config.open_timeout = timeout;
        }
        Ok(config)
    }
}

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub bind_host: String,
    /// 0 picks an ephemeral port
    pub port: u16,
    pub request_timeout: Duration,
    /// Workers silent for longer are dropped by the sweeper
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
    /// How often expired lock leases are reclaimed
    pub eviction_interval: Duration,
    pub breaker: CircuitBreakerConfig,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            port: DEFAULT_MASTER_PORT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            heartbeat_timeout: Duration::from_secs(15),
            sweep_interval: Duration::from_secs(5),
            eviction_interval: Duration::from_secs(10),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl MasterConfig {
    /// Defaults overridden by `COLONY_MASTER_*` variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(host) = get_env_string("COLONY_MASTER_HOST") {
            config.bind_host = host;
        }
        if let Some(port) = get_env_parse::<u16>("COLONY_MASTER_PORT")? {
            config.port = port;
        }
        if let Some(timeout) = get_env_duration("COLONY_REQUEST_TIMEOUT")? {
            config.request_timeout = timeout;
        }
        if let Some(timeout) = get_env_duration("COLONY_HEARTBEAT_TIMEOUT")? {
            config.heartbeat_timeout = timeout;
        }
        if let Some(interval) = get_env_duration("COLONY_SWEEP_INTERVAL")? {
            config.sweep_interval = interval;
        }
        config.breaker = CircuitBreakerConfig::from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_timeout.is_zero() || self.sweep_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "heartbeat_timeout and sweep_interval must be greater than 0".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "request_timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: WorkerId,
    pub bind_host: String,
    /// 0 picks an ephemeral port
    pub port: u16,
    /// Host other nodes use to reach this worker
    pub advertise_host: String,
    pub master_url: String,
    pub heartbeat_interval: Duration,
    pub request_timeout: Duration,
    /// Grace period for in-flight handlers on stop
    pub shutdown_grace: Duration,
    pub retry: RetryPolicy,
    pub breaker: CircuitBreakerConfig,
    pub runtime: RuntimeConfig,
}

impl WorkerConfig {
    pub fn new(worker_id: WorkerId, master_url: impl Into<String>) -> Self {
        Self {
            worker_id,
            bind_host: "127.0.0.1".to_string(),
            port: 0,
            advertise_host: "127.0.0.1".to_string(),
            master_url: master_url.into(),
            heartbeat_interval: Duration::from_secs(5),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            shutdown_grace: Duration::from_secs(2),
            retry: RetryPolicy::default(),
            breaker: CircuitBreakerConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }

    /// `COLONY_WORKER_ID` and `COLONY_MASTER_URL` are required
    pub fn from_env() -> Result<Self, ConfigError> {
        let worker_id = get_env_parse::<WorkerId>("COLONY_WORKER_ID")?.ok_or_else(|| {
            ConfigError::ValidationError("COLONY_WORKER_ID is required".to_string())
        })?;
        let master_url = get_env_string("COLONY_MASTER_URL").ok_or_else(|| {
            ConfigError::ValidationError("COLONY_MASTER_URL is required".to_string())
        })?;

        let mut config = Self::new(worker_id, master_url);
        if let Some(host) = get_env_string("COLONY_WORKER_HOST") {
            config.bind_host = host.clone();
            config.advertise_host = host;
        }
        if let Some(host) = get_env_string("COLONY_WORKER_ADVERTISE_HOST") {
            config.advertise_host = host;
        }
        if let Some(port) = get_env_parse::<u16>("COLONY_WORKER_PORT")? {
            config.port = port;
        }
        if let Some(interval) = get_env_duration("COLONY_HEARTBEAT_INTERVAL")? {
            config.heartbeat_interval = interval;
        }
        if let Some(timeout) = get_env_duration("COLONY_REQUEST_TIMEOUT")? {
            config.request_timeout = timeout;
        }
        if let Some(secs) = get_env_u64("COLONY_DATA_TIMEOUT_SECS")? {
            config.runtime.data.request_timeout = Duration::from_secs(secs);
        }
        if let Some(interval) = get_env_duration("COLONY_EVICTION_INTERVAL")? {
            config.runtime.eviction_interval = interval;
        }
        config.retry = RetryPolicy::from_env()?;
        config.breaker = CircuitBreakerConfig::from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.master_url.starts_with("http://") && !self.master_url.starts_with("https://") {
            return Err(ConfigError::ValidationError(format!(
                "master_url must start with http:// or https://, got '{}'",
                self.master_url
            )));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "heartbeat_interval must be greater than 0".to_string(),
            ));
        }
        if self.runtime.eviction_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "eviction_interval must be greater than 0".to_string(),
            ));
        }
        self.retry.validate()
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_runtime(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = runtime;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(700),
            multiplier: 2,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(700));
        assert_eq!(policy.backoff(40), Duration::from_millis(700));
    }

    #[test]
    #[serial]
    fn test_worker_from_env() {
        unsafe {
            env::set_var("COLONY_WORKER_ID", "w7");
            env::set_var("COLONY_MASTER_URL", "http://10.0.0.1:50051");
            env::set_var("COLONY_WORKER_PORT", "9007");
            env::set_var("COLONY_HEARTBEAT_INTERVAL", "750ms");
            env::set_var("COLONY_EVICTION_INTERVAL", "250ms");
        }
        let config = WorkerConfig::from_env().unwrap();
        assert_eq!(config.worker_id.as_str(), "w7");
        assert_eq!(config.port, 9007);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(750));
        assert_eq!(config.runtime.eviction_interval, Duration::from_millis(250));

        unsafe { env::set_var("COLONY_MASTER_URL", "10.0.0.1:50051") };
        assert!(WorkerConfig::from_env().is_err());

        unsafe {
            env::remove_var("COLONY_WORKER_ID");
            env::remove_var("COLONY_MASTER_URL");
            env::remove_var("COLONY_WORKER_PORT");
            env::remove_var("COLONY_HEARTBEAT_INTERVAL");
            env::remove_var("COLONY_EVICTION_INTERVAL");
        }
        assert!(WorkerConfig::from_env().is_err());
    }

    #[test]
    #[serial]
    fn test_master_from_env() {
        unsafe { env::set_var("COLONY_MASTER_PORT", "not-a-port") };
        assert!(matches!(
            MasterConfig::from_env(),
            Err(ConfigError::InvalidEnvVar { key, .. }) if key == "COLONY_MASTER_PORT"
        ));
        unsafe { env::set_var("COLONY_MASTER_PORT", "6000") };
        assert_eq!(MasterConfig::from_env().unwrap().port, 6000);
        unsafe { env::remove_var("COLONY_MASTER_PORT") };
        assert_eq!(MasterConfig::from_env().unwrap().port, DEFAULT_MASTER_PORT);
    }
}
