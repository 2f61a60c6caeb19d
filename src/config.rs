//! Session policy: pacing, timeouts, breaker and recovery limits

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// A policy value outside its allowed range
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("{field} must be between 0 and 1, got {value}")]
    NotARatio { field: &'static str, value: f64 },
    #[error("pacing.min_delay_ms ({min}) exceeds pacing.max_delay_ms ({max})")]
    PacingRange { min: u64, max: u64 },
    #[error("{field} must not be negative, got {value}")]
    Negative { field: &'static str, value: f64 },
    #[error("invalid service URL '{0}'")]
    ServiceUrl(String),
}

/// Delay between keystrokes, drawn uniformly from the range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 30,
            max_delay_ms: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Failures within the window that open the breaker
    pub failure_threshold: u32,
    pub window_secs: u64,
    /// Time spent open before a single trial call is allowed
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_secs: 60,
            cooldown_secs: 30,
        }
    }
}

impl BreakerConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Softening of service and fallback answers so they read like a person wrote them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShapingConfig {
    pub enabled: bool,
    /// Share of text answers that get an uncertainty prefix
    pub uncertainty_rate: f64,
    /// Share of text answers that get a trailing hedge
    pub hedging_rate: f64,
    pub confidence_floor: f64,
}

impl Default for ShapingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            uncertainty_rate: 0.3,
            hedging_rate: 0.2,
            confidence_floor: 0.2,
        }
    }
}

/// Every bounded wait, in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub service_call_ms: u64,
    /// One field's complete input action
    pub field_ms: u64,
    /// Wait for a success signal after submitting
    pub submit_wait_ms: u64,
    /// Primary flow blocking on a spawned tab
    pub tab_wait_ms: u64,
    /// Whole session
    pub session_ms: u64,
    pub page_ready_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            service_call_ms: 30_000,
            field_ms: 10_000,
            submit_wait_ms: 5_000,
            tab_wait_ms: 60_000,
            session_ms: 300_000,
            page_ready_ms: 10_000,
        }
    }
}

impl TimeoutConfig {
    pub fn service_call(&self) -> Duration {
        Duration::from_millis(self.service_call_ms)
    }

    pub fn field(&self) -> Duration {
        Duration::from_millis(self.field_ms)
    }

    pub fn submit_wait(&self) -> Duration {
        Duration::from_millis(self.submit_wait_ms)
    }

    pub fn tab_wait(&self) -> Duration {
        Duration::from_millis(self.tab_wait_ms)
    }

    pub fn session(&self) -> Duration {
        Duration::from_millis(self.session_ms)
    }

    pub fn page_ready(&self) -> Duration {
        Duration::from_millis(self.page_ready_ms)
    }
}

/// Complete policy of an automation session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub pacing: PacingConfig,
    pub breaker: BreakerConfig,
    pub timeouts: TimeoutConfig,
    pub shaping: ShapingConfig,
    /// RECOVER cycles before the session fails
    pub max_recover_cycles: u32,
    /// Attempts of one phase before a retry escalates to a reload
    pub max_phase_attempts: u32,
    /// Minimum filled/(filled+failed) ratio to proceed to submission
    pub low_fill_threshold: f64,
    /// Simultaneous outstanding reasoning-service calls
    pub max_concurrent_calls: usize,
    pub service_url: String,
    /// Free text forwarded with every service request
    pub context: Option<String>,
    /// Pause before re-entering a phase after recovery
    pub retry_delay_ms: u64,
    /// Estimated price of one answered service call
    pub cost_per_call: f64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            pacing: PacingConfig::default(),
            breaker: BreakerConfig::default(),
            timeouts: TimeoutConfig::default(),
            shaping: ShapingConfig::default(),
            max_recover_cycles: 5,
            max_phase_attempts: 3,
            low_fill_threshold: 0.6,
            max_concurrent_calls: 3,
            service_url: "http://127.0.0.1:5000".to_string(),
            context: None,
            retry_delay_ms: 500,
            cost_per_call: 0.002,
        }
    }
}

impl FlowConfig {
    /// `~/.formpilot/config.json`
    pub fn default_path() -> Result<PathBuf> {
        let home_dir = dirs::home_dir().context("Unable to determine home directory")?;
        Ok(home_dir.join(".formpilot").join("config.json"))
    }

    /// Load from an explicit path, or the default location; a missing default file
    /// yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (Self::default_path()?, false),
        };

        if !path.exists() {
            if explicit {
                anyhow::bail!("Config file '{}' does not exist", path.display());
            }
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let json = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
        let config: FlowConfig = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse config file '{}'", path.display()))?;
        config.validate()?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pacing.min_delay_ms > self.pacing.max_delay_ms {
            return Err(ConfigError::PacingRange {
                min: self.pacing.min_delay_ms,
                max: self.pacing.max_delay_ms,
            });
        }
        let positive = [
            ("breaker.failure_threshold", self.breaker.failure_threshold as u64),
            ("breaker.window_secs", self.breaker.window_secs),
            ("timeouts.service_call_ms", self.timeouts.service_call_ms),
            ("timeouts.field_ms", self.timeouts.field_ms),
            ("timeouts.submit_wait_ms", self.timeouts.submit_wait_ms),
            ("timeouts.tab_wait_ms", self.timeouts.tab_wait_ms),
            ("timeouts.session_ms", self.timeouts.session_ms),
            ("max_phase_attempts", self.max_phase_attempts as u64),
            ("max_concurrent_calls", self.max_concurrent_calls as u64),
        ];
        if let Some(&(field, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero { field });
        }
        let ratios = [
            ("low_fill_threshold", self.low_fill_threshold),
            ("shaping.uncertainty_rate", self.shaping.uncertainty_rate),
            ("shaping.hedging_rate", self.shaping.hedging_rate),
            ("shaping.confidence_floor", self.shaping.confidence_floor),
        ];
        if let Some(&(field, value)) = ratios.iter().find(|(_, v)| !(0.0..=1.0).contains(v)) {
            return Err(ConfigError::NotARatio { field, value });
        }
        if self.cost_per_call.is_nan() || self.cost_per_call < 0.0 {
            return Err(ConfigError::Negative {
                field: "cost_per_call",
                value: self.cost_per_call,
            });
        }
        if url::Url::parse(&self.service_url).is_err() {
            return Err(ConfigError::ServiceUrl(self.service_url.clone()));
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
