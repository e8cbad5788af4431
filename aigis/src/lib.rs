//! Aigis core library.
//!
//! A reinforcement-learning environment for tuning a ledger network's
//! runtime configuration. One environment step deploys a configuration
//! through a remote test harness, runs a load test and turns the measured
//! throughput / latency / success rate into an observation and a reward.
//! The binary (`src/main.rs`) is a thin CLI around these components; the
//! `aigis_env` crate exposes the environment to Python trainers.
//!
//! # Architecture
//!
//! Leaves first:
//!
//! - **Catalog** (`catalog`): the configuration-limits document parsed into
//!   an ordered `section -> key -> Limit` map.
//! - **Groups** (`groups`): tunable allow-list and the partition of keys
//!   across the three cooperating agents.
//! - **Codec** (`codec`): flat / per-agent action vectors <-> deployable
//!   configuration documents.
//! - **Observation** (`observation`): raw metrics -> bounded observations.
//! - **Reward** (`reward`): episode state and the two reward variants.
//! - **Harness** (`harness`): the remote session protocol (HTTP client plus
//!   a scripted in-process implementation).
//! - **Session** (`session`): the start/test/end state machine with
//!   conflict cleanup and bounded retries.
//! - **Env** (`env`): the reset/step facade composing all of the above.
//!
//! Supporting modules: `config` (env-var configuration), `telemetry`
//! (JSONL step log, best-configuration search), `policy` (seeded uniform
//! policy for smoke runs).

pub mod catalog;
pub mod codec;
pub mod config;
pub mod env;
pub mod groups;
pub mod harness;
pub mod observation;
pub mod policy;
pub mod reward;
pub mod session;
pub mod telemetry;

// --- Re-exports for ergonomic external use ---------------------------------

pub use catalog::{parse_limit, Catalog, CatalogError, Limit, LimitParseError};
pub use codec::{ActionCodec, ActionLayout, ActionShapeError, ConfigDocument, GroupActions};
pub use config::{config_hash, ConfigError, EnvConfig, EnvMode};
pub use env::{Action, AigisEnv, BaselineSource, EnvError, StepInfo, StepResult};
pub use groups::{assign_group, AgentGroup, TunableSet, MUST_BE_POSITIVE, TUNABLE_KEYS};
pub use harness::{
    reset_stale_session, HarnessClient, HarnessError, HarnessErrorKind, HttpHarnessClient,
    ScriptedHarness, SessionHandle, SessionStatus,
};
pub use observation::{
    broadcast, normalize, parse_test_result, Observation, PerfMetrics, ScalingLimits, OBS_DIM,
};
pub use policy::UniformPolicy;
pub use reward::{compute_reward, EpisodeState, RewardComponents, RewardVariant, RewardWeights};
pub use session::{RetryPolicy, SessionDriver, SessionOutcome, SessionPhase, SleepFn, StepFailure};
pub use telemetry::{best_record, StepRecord, StepTelemetry, TelemetryError};
