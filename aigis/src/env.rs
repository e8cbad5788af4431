// src/env.rs
//
// Environment facade: reset/step over the codec, session driver, normalizer
// and reward shaper.
//
// The facade is synchronous. Harness calls are async and run to completion
// on a current-thread runtime owned by the environment, so at most one step
// is ever in flight.
//
// Episode state is an explicit value: `transition` maps (state, action) to
// (next state, step result) and `step` stores the next state.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::{Builder, Runtime};
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::codec::{ActionCodec, ConfigDocument};
use crate::config::{EnvConfig, EnvMode};
use crate::groups::{AgentGroup, TunableSet};
use crate::harness::{HarnessClient, HttpHarnessClient};
use crate::observation::{
    broadcast, normalize, parse_test_result, Observation, PerfMetrics, OBS_DIM, ZERO_OBSERVATION,
};
use crate::reward::{EpisodeState, RewardComponents, RewardVariant, RewardWeights};
use crate::session::{SessionDriver, SessionOutcome, SleepFn, StepFailure};
use crate::telemetry::{StepRecord, StepTelemetry};

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("failed to start runtime: {0}")]
    Runtime(#[source] std::io::Error),
    #[error("failed to build harness client: {0}")]
    Harness(#[from] crate::harness::HarnessError),
}

/// Action for one step: one flat vector over every catalog key, or one
/// vector per agent group. Components are expected in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Action {
    Flat(Vec<f64>),
    Groups(Vec<Vec<f64>>),
}

/// Where the episode's baseline came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselineSource {
    Measured,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInfo {
    pub step: u64,
    /// Measured metrics (the raw throughput/latency/success-rate scalars);
    /// None when the step failed.
    pub metrics: Option<PerfMetrics>,
    pub components: Option<RewardComponents>,
    pub attempts: u32,
    pub cleanups: u32,
    /// Failure category (`retries_exhausted`, `timeout`, ...).
    pub failure: Option<String>,
    /// Human-readable failure message.
    pub failure_detail: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// One observation per agent (a single entry in single-agent mode).
    pub observations: Vec<Observation>,
    /// One reward per agent.
    pub rewards: Vec<f64>,
    /// One done flag per agent.
    pub dones: Vec<bool>,
    pub info: StepInfo,
    /// Configuration that was deployed (empty if the action was rejected).
    pub config: ConfigDocument,
}

impl StepResult {
    pub fn reward(&self) -> f64 {
        self.rewards.first().copied().unwrap_or(0.0)
    }

    pub fn failed(&self) -> bool {
        self.info.failure.is_some()
    }
}

pub struct AigisEnv<C> {
    mode: EnvMode,
    codec: ActionCodec,
    driver: SessionDriver<C>,
    runtime: Runtime,
    variant: RewardVariant,
    weights: RewardWeights,
    failure_penalty: f64,
    state: EpisodeState,
    baseline: Option<BaselineSource>,
    telemetry: StepTelemetry,
}

impl AigisEnv<HttpHarnessClient> {
    /// Environment talking to the HTTP harness named in `config`, with the
    /// catalog loaded from `config.limits_path` (empty if unavailable).
    pub fn from_config(config: &EnvConfig) -> Result<Self, EnvError> {
        let client = HttpHarnessClient::new(config.harness_url.clone(), config.request_timeout)?;
        let catalog = Catalog::load_or_empty(&config.limits_path);
        Self::new(config, &catalog, client)
    }
}

impl<C> AigisEnv<C>
where
    C: HarnessClient,
{
    /// Build an environment. The baseline run happens on the first
    /// `boot`, `reset` or `step`.
    pub fn new(config: &EnvConfig, catalog: &Catalog, client: C) -> Result<Self, EnvError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(EnvError::Runtime)?;
        let tunable = TunableSet::from_importance(config.act_importance);
        let codec = ActionCodec::new(catalog, &tunable);

        info!(
            mode = %config.mode,
            catalog_keys = catalog.len(),
            action_dims = ?action_dims_for(config.mode, &codec),
            tunable = tunable.len(),
            "environment created"
        );

        Ok(Self {
            mode: config.mode,
            codec,
            driver: SessionDriver::new(client, config.retry.clone()),
            runtime,
            variant: config.reward_variant(),
            weights: config.reward_weights(),
            failure_penalty: config.failure_penalty,
            state: EpisodeState::fallback(),
            baseline: None,
            telemetry: StepTelemetry::open_or_disabled(config.telemetry_path.as_deref()),
        })
    }

    pub fn with_sleep_fn(mut self, sleep_fn: SleepFn) -> Self {
        self.driver = self.driver.with_sleep_fn(sleep_fn);
        self
    }

    pub fn with_telemetry(mut self, telemetry: StepTelemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn mode(&self) -> EnvMode {
        self.mode
    }

    pub fn codec(&self) -> &ActionCodec {
        &self.codec
    }

    pub fn client(&self) -> &C {
        self.driver.client()
    }

    pub fn state(&self) -> &EpisodeState {
        &self.state
    }

    pub fn baseline_source(&self) -> Option<BaselineSource> {
        self.baseline
    }

    /// Number of agents (1 in single-agent mode).
    pub fn num_agents(&self) -> usize {
        match self.mode {
            EnvMode::Single => 1,
            EnvMode::Multi => AgentGroup::ALL.len(),
        }
    }

    /// Action dimension per agent.
    pub fn action_dims(&self) -> Vec<usize> {
        action_dims_for(self.mode, &self.codec)
    }

    pub fn observation_dim(&self) -> usize {
        OBS_DIM
    }

    /// Run the baseline test with an empty configuration and initialize the
    /// episode state from it. A failed baseline installs fallback metrics and
    /// limits. The baseline is measured once per episode: later calls return
    /// the stored source without touching the harness.
    pub fn boot(&mut self) -> BaselineSource {
        match self.baseline {
            Some(source) => source,
            None => self.measure_baseline(),
        }
    }

    /// Start a new episode: re-measure the baseline and reset the step
    /// count. Scaling limits are re-derived from the new baseline.
    pub fn new_episode(&mut self) -> BaselineSource {
        info!(steps = self.state.steps, "starting new episode");
        self.measure_baseline()
    }

    fn measure_baseline(&mut self) -> BaselineSource {
        let outcome = self.runtime.block_on(self.driver.run(ConfigDocument::new()));
        let source = match &outcome.result {
            Ok(raw) => {
                let baseline = parse_test_result(raw);
                self.state = EpisodeState::from_baseline(baseline);
                info!(
                    throughput = baseline.throughput,
                    latency = baseline.latency,
                    success_rate = baseline.success_rate,
                    throughput_limit = self.state.limits.throughput,
                    latency_limit = self.state.limits.latency,
                    "baseline measured"
                );
                BaselineSource::Measured
            }
            Err(err) => {
                self.state = EpisodeState::fallback();
                warn!(error = %err, "baseline run failed, using fallback baseline");
                BaselineSource::Fallback
            }
        };
        self.baseline = Some(source);
        source
    }

    /// Initial observation per agent.
    ///
    /// Single-agent mode observes the latest metrics; multi-agent mode
    /// observes the baseline.
    pub fn reset(&mut self) -> Vec<Observation> {
        self.boot();
        let metrics = match self.mode {
            EnvMode::Single => self.state.current,
            EnvMode::Multi => self.state.initial,
        };
        broadcast(normalize(&metrics, &self.state.limits), self.num_agents())
    }

    /// Apply `action`, run one load test, and score it. Never fails: harness
    /// and action errors become a penalized step.
    pub fn step(&mut self, action: &Action) -> StepResult {
        self.boot();
        let (next, result) = self.transition(self.state, action);
        self.state = next;

        self.telemetry.record(&StepRecord {
            step: result.info.step,
            mode: self.mode,
            config: result.config.clone(),
            metrics: result.info.metrics,
            reward: result.reward(),
            components: result.info.components,
            failed: result.failed(),
            reason: result.info.failure.clone(),
            attempts: result.info.attempts,
            cleanups: result.info.cleanups,
            elapsed_ms: result.info.elapsed_ms,
        });
        result
    }

    /// Pure step function over an explicit episode state (apart from the
    /// harness round trip).
    pub fn transition(&self, state: EpisodeState, action: &Action) -> (EpisodeState, StepResult) {
        let started = Instant::now();
        let step = state.steps + 1;

        let decoded = match action {
            Action::Flat(v) => self.codec.decode_flat(v),
            // an empty outer list carries no group structure
            Action::Groups(g) if g.is_empty() => self.codec.decode_flat(&[]),
            Action::Groups(g) => self.codec.decode_groups(g),
        };
        let (config, outcome) = match decoded {
            Ok(config) => {
                let outcome = self.runtime.block_on(self.driver.run(config.clone()));
                (config, outcome)
            }
            Err(err) => {
                warn!(step, error = %err, "rejecting malformed action");
                let outcome = SessionOutcome {
                    result: Err(StepFailure::InvalidAction(err)),
                    attempts: 0,
                    cleanups: 0,
                    trace: Vec::new(),
                };
                (ConfigDocument::new(), outcome)
            }
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let agents = self.num_agents();

        match outcome.result {
            Ok(raw) => {
                let metrics = parse_test_result(&raw);
                let (next, components) = state.observe(metrics, self.variant, &self.weights);
                let obs = normalize(&metrics, &next.limits);
                info!(
                    step,
                    throughput = metrics.throughput,
                    latency = metrics.latency,
                    success_rate = metrics.success_rate,
                    reward = components.reward,
                    elapsed_ms,
                    "step complete"
                );
                let result = StepResult {
                    observations: broadcast(obs, agents),
                    rewards: vec![components.reward; agents],
                    dones: vec![self.mode == EnvMode::Single; agents],
                    info: StepInfo {
                        step,
                        metrics: Some(metrics),
                        components: Some(components),
                        attempts: outcome.attempts,
                        cleanups: outcome.cleanups,
                        failure: None,
                        failure_detail: None,
                        elapsed_ms,
                    },
                    config,
                };
                (next, result)
            }
            Err(failure) => {
                warn!(
                    step,
                    reason = failure.reason_label(),
                    penalty = self.failure_penalty,
                    "step failed"
                );
                let result = StepResult {
                    observations: broadcast(ZERO_OBSERVATION, agents),
                    rewards: vec![self.failure_penalty; agents],
                    dones: vec![self.mode == EnvMode::Single; agents],
                    info: StepInfo {
                        step,
                        metrics: None,
                        components: None,
                        attempts: outcome.attempts,
                        cleanups: outcome.cleanups,
                        failure: Some(failure.reason_label().to_string()),
                        failure_detail: Some(failure.to_string()),
                        elapsed_ms,
                    },
                    config,
                };
                (state.failed(), result)
            }
        }
    }
}

fn action_dims_for(mode: EnvMode, codec: &ActionCodec) -> Vec<usize> {
    match mode {
        EnvMode::Single => vec![codec.layout().len()],
        EnvMode::Multi => codec.layout().group_dims(),
    }
}
