// src/reward.rs
//
// Reward shaping from the metric trajectory of an episode.
//
// Two variants:
// - Quadratic (single-agent): amplifies improvement over the baseline by the
//   step-over-step change. Latency uses the same formula as throughput.
// - Exponential (multi-agent): latency deltas are negated so lower latency
//   is an improvement; sharpness `eta` controls the exponent.
//
// Both compare `current` against `initial` (delta0) and `last` (delta1).

use serde::{Deserialize, Serialize};

use crate::observation::{PerfMetrics, ScalingLimits};

/// Replacement for a throughput basis <= 0.
pub const THROUGHPUT_BASIS_FLOOR: f64 = 1.0;
/// Replacement for a latency basis <= 0.
pub const LATENCY_BASIS_FLOOR: f64 = 0.1;
/// Bound on the exponential variant's exponent, keeping rewards finite.
pub const MAX_EXPONENT: f64 = 50.0;

/// Episode state threaded through `step`.
///
/// `initial` is written once at boot. `last` becomes `current` only after
/// the step's reward has been computed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpisodeState {
    pub initial: PerfMetrics,
    pub last: PerfMetrics,
    pub current: PerfMetrics,
    pub limits: ScalingLimits,
    /// Steps taken since boot (failed steps included).
    pub steps: u64,
}

impl EpisodeState {
    /// State after a successful baseline run.
    pub fn from_baseline(baseline: PerfMetrics) -> Self {
        Self {
            initial: baseline,
            last: baseline,
            current: baseline,
            limits: ScalingLimits::from_baseline(&baseline),
            steps: 0,
        }
    }

    /// State installed when the baseline run fails.
    pub fn fallback() -> Self {
        let baseline = PerfMetrics::fallback_baseline();
        Self {
            limits: ScalingLimits::fallback(),
            ..Self::from_baseline(baseline)
        }
    }

    /// Record a step's measured metrics and compute its reward.
    ///
    /// Returns the successor state (with `last := current`) and the reward
    /// breakdown.
    pub fn observe(
        self,
        measured: PerfMetrics,
        variant: RewardVariant,
        weights: &RewardWeights,
    ) -> (Self, RewardComponents) {
        let scored = Self {
            current: measured,
            ..self
        };
        let components = compute_reward(&scored, variant, weights);
        let next = Self {
            last: measured,
            steps: self.steps + 1,
            ..scored
        };
        (next, components)
    }

    /// Successor state for a failed step: metrics untouched, step counted.
    pub fn failed(self) -> Self {
        Self {
            steps: self.steps + 1,
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RewardVariant {
    Quadratic,
    Exponential { eta: f64 },
}

impl RewardVariant {
    pub const DEFAULT_ETA: f64 = 10.0;

    pub fn exponential() -> Self {
        RewardVariant::Exponential {
            eta: Self::DEFAULT_ETA,
        }
    }
}

/// Non-negative weights on the throughput and latency terms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RewardWeights {
    pub c_t: f64,
    pub c_l: f64,
}

impl RewardWeights {
    pub fn new(c_t: f64, c_l: f64) -> Self {
        Self {
            c_t: c_t.max(0.0),
            c_l: c_l.max(0.0),
        }
    }

    pub fn single_agent() -> Self {
        Self::new(0.5, 0.5)
    }

    pub fn multi_agent() -> Self {
        Self::new(0.8, 0.2)
    }
}

/// Reward breakdown for logging and reward reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RewardComponents {
    /// Throughput change relative to the baseline.
    pub throughput_delta_initial: f64,
    /// Throughput change relative to the previous step.
    pub throughput_delta_last: f64,
    /// Latency change relative to the baseline (negated for the exponential variant).
    pub latency_delta_initial: f64,
    /// Latency change relative to the previous step (negated for the exponential variant).
    pub latency_delta_last: f64,
    pub throughput_term: f64,
    pub latency_term: f64,
    /// `c_t * throughput_term + c_l * latency_term`.
    pub reward: f64,
}

#[inline]
fn basis(value: f64, floor: f64) -> f64 {
    if value > 0.0 {
        value
    } else {
        floor
    }
}

#[inline]
fn relative(current: f64, base: f64) -> f64 {
    (current - base) / base
}

fn quadratic_term(delta0: f64, delta1: f64) -> f64 {
    if delta0 > 0.0 {
        ((1.0 + delta0).powi(2) - 1.0) * (1.0 + delta1).abs()
    } else {
        -((1.0 - delta0).powi(2) - 1.0) * (1.0 - delta1).abs()
    }
}

#[inline]
fn bounded_exp(x: f64) -> f64 {
    x.clamp(-MAX_EXPONENT, MAX_EXPONENT).exp()
}

fn exponential_throughput(delta0: f64, delta1: f64, eta: f64) -> f64 {
    if delta1 > 0.0 {
        bounded_exp(eta * delta0 * delta1)
    } else {
        -bounded_exp(-eta * delta0 * delta1)
    }
}

fn exponential_latency(delta0: f64, delta1: f64, eta: f64) -> f64 {
    if delta1 > 0.0 {
        -bounded_exp(eta * delta0 * delta1)
    } else {
        bounded_exp(-eta * delta0 * delta1)
    }
}

/// Reward for `state.current` against `state.initial` and `state.last`.
pub fn compute_reward(
    state: &EpisodeState,
    variant: RewardVariant,
    weights: &RewardWeights,
) -> RewardComponents {
    let init_t = basis(state.initial.throughput, THROUGHPUT_BASIS_FLOOR);
    let last_t = basis(state.last.throughput, THROUGHPUT_BASIS_FLOOR);
    let init_l = basis(state.initial.latency, LATENCY_BASIS_FLOOR);
    let last_l = basis(state.last.latency, LATENCY_BASIS_FLOOR);

    let t0 = relative(state.current.throughput, init_t);
    let t1 = relative(state.current.throughput, last_t);
    let mut l0 = relative(state.current.latency, init_l);
    let mut l1 = relative(state.current.latency, last_l);

    let (throughput_term, latency_term) = match variant {
        RewardVariant::Quadratic => (quadratic_term(t0, t1), quadratic_term(l0, l1)),
        RewardVariant::Exponential { eta } => {
            l0 = -l0;
            l1 = -l1;
            (
                exponential_throughput(t0, t1, eta),
                exponential_latency(l0, l1, eta),
            )
        }
    };

    RewardComponents {
        throughput_delta_initial: t0,
        throughput_delta_last: t1,
        latency_delta_initial: l0,
        latency_delta_last: l1,
        throughput_term,
        latency_term,
        reward: weights.c_t * throughput_term + weights.c_l * latency_term,
    }
}
