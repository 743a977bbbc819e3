use colony_core::config::{
    ConfigError, get_env_duration, get_env_parse, get_env_string, get_env_u64,
};
use colony_core::{Address, AgentId};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// How the simulation advances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SimulationMode {
    /// Next round starts once the current one is complete
    Round,
    /// Start events fire every `interval` regardless of progress
    Timed {
        #[serde(with = "humantime_serde_compat")]
        interval: Duration,
    },
}

impl FromStr for SimulationMode {
    type Err = ConfigError;

    /// `round`, or `timed:<duration>` such as `timed:500ms`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("round") {
            return Ok(Self::Round);
        }
        match s.split_once(':') {
            Some((mode, interval)) if mode.eq_ignore_ascii_case("timed") => {
                humantime::parse_duration(interval.trim())
                    .map(|interval| Self::Timed { interval })
                    .map_err(|e| ConfigError::ValidationError(format!("bad timed interval: {e}")))
            }
            _ => Err(ConfigError::ValidationError(format!(
                "unknown simulation mode '{s}', expected 'round' or 'timed:<duration>'"
            ))),
        }
    }
}

mod humantime_serde_compat {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub mode: SimulationMode,
    /// Rounds (round mode) or scheduler firings (timed mode)
    pub max_steps: u64,
    /// Quiet period after which a round or the timed run counts as finished
    pub idle_timeout: Duration,
    /// How often completion criteria are re-checked
    pub poll_interval: Duration,
    /// Agents that must report `EndEvent` each round. Empty means idle-only.
    pub termination_set: Vec<AgentId>,
    /// Recipients of each step's `StartEvent`
    pub start_target: Address,
    pub trail_id: String,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            mode: SimulationMode::Round,
            max_steps: 10,
            idle_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
            termination_set: Vec::new(),
            start_target: Address::All,
            trail_id: "colony".to_string(),
        }
    }
}

impl SimulationConfig {
    /// Defaults overridden by `COLONY_SIM_*` variables
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for malformed values or a config that fails
    /// [`SimulationConfig::validate`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(mode) = get_env_parse::<SimulationMode>("COLONY_SIM_MODE")? {
            config.mode = mode;
        }
        if let Some(max_steps) = get_env_u64("COLONY_SIM_MAX_STEPS")? {
            config.max_steps = max_steps;
        }
        if let Some(idle) = get_env_duration("COLONY_SIM_IDLE_TIMEOUT")? {
            config.idle_timeout = idle;
        }
        if let Some(poll) = get_env_duration("COLONY_SIM_POLL_INTERVAL")? {
            config.poll_interval = poll;
        }
        if let Some(target) = get_env_string("COLONY_SIM_START_TARGET") {
            config.start_target =
                Address::parse(&target).map_err(|e| ConfigError::InvalidEnvVar {
                    key: "COLONY_SIM_START_TARGET".to_string(),
                    message: e.to_string(),
                })?;
        }
        if let Some(trail_id) = get_env_string("COLONY_TRAIL_ID") {
            config.trail_id = trail_id;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_steps == 0 {
            return Err(ConfigError::ValidationError(
                "max_steps must be greater than 0".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "poll_interval must be greater than 0".to_string(),
            ));
        }
        if let SimulationMode::Timed { interval } = self.mode {
            if interval.is_zero() {
                return Err(ConfigError::ValidationError(
                    "timed interval must be greater than 0".to_string(),
                ));
            }
        }
        if self.trail_id.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "trail_id must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_mode(mut self, mode: SimulationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_termination_set(mut self, agents: impl IntoIterator<Item = AgentId>) -> Self {
        self.termination_set = agents.into_iter().collect();
        self
    }

    pub fn with_start_target(mut self, target: Address) -> Self {
        self.start_target = target;
        self
    }

    pub fn with_trail_id(mut self, trail_id: impl Into<String>) -> Self {
        self.trail_id = trail_id.into();
        self
    }
}
