// src/observation.rs
//
// Observation normalizer: raw load-test metrics -> bounded [0, 1] vectors.
//
// Every agent sees the same three features:
//   [throughput / throughput_limit, latency / latency_limit, success_rate / 1.0]
//
// Scaling limits are derived once from the boot baseline and frozen for the
// episode.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

/// Observation dimension (throughput, latency, success rate).
pub const OBS_DIM: usize = 3;

/// Normalized observation for one agent.
pub type Observation = [f64; OBS_DIM];

/// Observation returned for failed steps.
pub const ZERO_OBSERVATION: Observation = [0.0; OBS_DIM];

/// Throughput/latency floors for the scaling limits.
pub const MIN_THROUGHPUT_LIMIT: f64 = 5000.0;
pub const MIN_LATENCY_LIMIT: f64 = 30.0;
/// Baseline multiple used for the scaling limits.
pub const LIMIT_HEADROOM: f64 = 5.0;

/// Performance metrics of one load-test run.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PerfMetrics {
    /// Transactions per second.
    pub throughput: f64,
    /// Average latency (seconds).
    pub latency: f64,
    /// succ / (succ + fail), 0 when nothing completed.
    pub success_rate: f64,
}

impl PerfMetrics {
    pub fn new(throughput: f64, latency: f64, success_rate: f64) -> Self {
        Self {
            throughput,
            latency,
            success_rate,
        }
    }

    /// Baseline installed when the boot run fails.
    pub fn fallback_baseline() -> Self {
        Self::new(100.0, 1.0, 1.0)
    }
}

/// Per-feature normalization limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalingLimits {
    pub throughput: f64,
    pub latency: f64,
    pub success_rate: f64,
}

impl Default for ScalingLimits {
    fn default() -> Self {
        Self::fallback()
    }
}

impl ScalingLimits {
    /// Limits installed when the boot run fails.
    pub fn fallback() -> Self {
        Self {
            throughput: MIN_THROUGHPUT_LIMIT,
            latency: MIN_LATENCY_LIMIT,
            success_rate: 1.0,
        }
    }

    /// `max(5 x baseline, floor)` for throughput and latency.
    pub fn from_baseline(baseline: &PerfMetrics) -> Self {
        Self {
            throughput: (LIMIT_HEADROOM * baseline.throughput).max(MIN_THROUGHPUT_LIMIT),
            latency: (LIMIT_HEADROOM * baseline.latency).max(MIN_LATENCY_LIMIT),
            success_rate: 1.0,
        }
    }
}

#[inline]
fn ratio_01(value: f64, limit: f64) -> f64 {
    if limit <= 0.0 {
        return 0.0;
    }
    let r = value / limit;
    if r.is_nan() {
        0.0
    } else {
        r.clamp(0.0, 1.0)
    }
}

/// Normalize raw metrics against the scaling limits.
pub fn normalize(metrics: &PerfMetrics, limits: &ScalingLimits) -> Observation {
    [
        ratio_01(metrics.throughput, limits.throughput),
        ratio_01(metrics.latency, limits.latency),
        ratio_01(metrics.success_rate, limits.success_rate),
    ]
}

/// One copy of `obs` per agent.
pub fn broadcast(obs: Observation, agents: usize) -> Vec<Observation> {
    vec![obs; agents]
}

/// Read a numeric field that may be serialized as a number or a string.
fn numeric_field(metrics: &JsonValue, names: &[&str]) -> f64 {
    names
        .iter()
        .find_map(|name| match metrics.get(*name)? {
            JsonValue::Number(n) => n.as_f64(),
            JsonValue::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        })
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

/// Extract metrics from a harness test result.
///
/// Expected shape: `{"result": {"<target>": {"throughput", "avg-lat", "succ",
/// "fail", ...}}}`. Only the first target is consulted. Each field falls
/// back to 0.0 on its own when missing or unreadable.
pub fn parse_test_result(result: &JsonValue) -> PerfMetrics {
    let Some(first) = result
        .get("result")
        .and_then(JsonValue::as_object)
        .and_then(|targets| targets.values().next())
    else {
        debug!("test result has no sub-results, metrics default to zero");
        return PerfMetrics::default();
    };

    let throughput = numeric_field(first, &["throughput", "tps"]);
    let latency = numeric_field(first, &["avg-lat", "avg_latency"]);
    let succ = numeric_field(first, &["succ", "success_count"]);
    let fail = numeric_field(first, &["fail", "fail_count"]);
    let total = succ + fail;
    let success_rate = if total > 0.0 { succ / total } else { 0.0 };

    PerfMetrics {
        throughput,
        latency,
        success_rate,
    }
}
