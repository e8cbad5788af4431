// src/config.rs
//
// Environment configuration with env-var overrides.
//
// Defaults match the standard tuning setup. Every field can be
// overridden through an `AIGIS_*` variable; unparseable values are logged
// and the default is kept.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::groups::TUNABLE_KEYS;
use crate::reward::{RewardVariant, RewardWeights};
use crate::session::RetryPolicy;

pub const DEFAULT_HARNESS_URL: &str = "http://127.0.0.1:8321/";
pub const DEFAULT_LIMITS_PATH: &str = "action.max.yaml";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 900;
pub const DEFAULT_FAILURE_PENALTY: f64 = -100.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("unknown mode {0:?} (expected 'single' or 'multi')")]
    UnknownMode(String),
}

/// Single-agent (one flat action) or cooperative multi-agent (one action
/// per agent group).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvMode {
    Single,
    Multi,
}

impl EnvMode {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvMode::Single => "single",
            EnvMode::Multi => "multi",
        }
    }
}

impl fmt::Display for EnvMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" | "single-agent" | "gym" => Ok(EnvMode::Single),
            "multi" | "multi-agent" | "maddpg" => Ok(EnvMode::Multi),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvConfig {
    /// Base URL of the harness session service.
    pub harness_url: String,
    /// Configuration-limits document.
    pub limits_path: PathBuf,
    /// Per-request timeout (covers deploy + load test).
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub mode: EnvMode,
    /// Prefix of the tunable allow-list agents control.
    pub act_importance: usize,
    /// Weight overrides; None uses the mode's default.
    pub c_t: Option<f64>,
    pub c_l: Option<f64>,
    /// Exponential reward sharpness (multi-agent).
    pub eta: f64,
    /// Reward for a failed step.
    pub failure_penalty: f64,
    /// Optional JSONL step log.
    pub telemetry_path: Option<PathBuf>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            harness_url: DEFAULT_HARNESS_URL.to_string(),
            limits_path: PathBuf::from(DEFAULT_LIMITS_PATH),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
            mode: EnvMode::Multi,
            act_importance: TUNABLE_KEYS.len(),
            c_t: None,
            c_l: None,
            eta: RewardVariant::DEFAULT_ETA,
            failure_penalty: DEFAULT_FAILURE_PENALTY,
            telemetry_path: None,
        }
    }
}

fn parse_var<T: FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        var,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

/// Apply `var` through `apply` when set; log the override or the rejection.
fn override_with<T, F>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str, apply: F)
where
    T: FromStr,
    T::Err: fmt::Display,
    F: FnOnce(T),
{
    let Some(raw) = lookup(var) else {
        return;
    };
    if raw.trim().is_empty() {
        return;
    }
    match parse_var::<T>(var, &raw) {
        Ok(value) => {
            info!(var, value = %raw.trim(), "config override");
            apply(value);
        }
        Err(err) => warn!(error = %err, "ignoring config override"),
    }
}

impl EnvConfig {
    /// Defaults overridden from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overridden through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        override_with::<String, _>(&lookup, "AIGIS_HARNESS_URL", |v| cfg.harness_url = v);
        override_with::<PathBuf, _>(&lookup, "AIGIS_LIMITS_PATH", |v| cfg.limits_path = v);
        override_with::<u64, _>(&lookup, "AIGIS_REQUEST_TIMEOUT_SECS", |v| {
            cfg.request_timeout = Duration::from_secs(v.max(1))
        });
        override_with::<u32, _>(&lookup, "AIGIS_MAX_ATTEMPTS", |v| {
            cfg.retry.max_attempts = v.max(1)
        });
        override_with::<u64, _>(&lookup, "AIGIS_BACKOFF_MS", |v| {
            cfg.retry.backoff = Duration::from_millis(v)
        });
        override_with::<EnvMode, _>(&lookup, "AIGIS_MODE", |v| cfg.mode = v);
        override_with::<usize, _>(&lookup, "AIGIS_ACT_IMPORTANCE", |v| cfg.act_importance = v);
        override_with::<f64, _>(&lookup, "AIGIS_C_T", |v| cfg.c_t = Some(v.max(0.0)));
        override_with::<f64, _>(&lookup, "AIGIS_C_L", |v| cfg.c_l = Some(v.max(0.0)));
        override_with::<f64, _>(&lookup, "AIGIS_ETA", |v| cfg.eta = v);
        override_with::<f64, _>(&lookup, "AIGIS_FAILURE_PENALTY", |v| cfg.failure_penalty = v);
        override_with::<PathBuf, _>(&lookup, "AIGIS_TELEMETRY_PATH", |v| {
            cfg.telemetry_path = Some(v)
        });

        cfg
    }

    /// Reward weights: explicit overrides, else the mode's defaults.
    pub fn reward_weights(&self) -> RewardWeights {
        let defaults = match self.mode {
            EnvMode::Single => RewardWeights::single_agent(),
            EnvMode::Multi => RewardWeights::multi_agent(),
        };
        RewardWeights::new(
            self.c_t.unwrap_or(defaults.c_t),
            self.c_l.unwrap_or(defaults.c_l),
        )
    }

    pub fn reward_variant(&self) -> RewardVariant {
        match self.mode {
            EnvMode::Single => RewardVariant::Quadratic,
            EnvMode::Multi => RewardVariant::Exponential { eta: self.eta },
        }
    }

    /// Reject values that would make the environment meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.harness_url.trim().is_empty() {
            return Err(ConfigError::Invalid {
                var: "AIGIS_HARNESS_URL",
                value: self.harness_url.clone(),
                reason: "must not be empty".to_string(),
            });
        }
        if !self.eta.is_finite() {
            return Err(ConfigError::Invalid {
                var: "AIGIS_ETA",
                value: self.eta.to_string(),
                reason: "must be finite".to_string(),
            });
        }
        if !self.failure_penalty.is_finite() {
            return Err(ConfigError::Invalid {
                var: "AIGIS_FAILURE_PENALTY",
                value: self.failure_penalty.to_string(),
                reason: "must be finite".to_string(),
            });
        }
        Ok(())
    }
}

/// Stable fingerprint of a configuration, for startup logs and telemetry.
pub fn config_hash(cfg: &EnvConfig) -> u64 {
    fnv1a64(&format!("{cfg:?}"))
}

fn fnv1a64(s: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut h = FNV_OFFSET;
    for b in s.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}
