// aigis_env/src/lib.rs
//
// Python bindings for the Aigis tuning environment.
//
// Provides a Gym-style API for training agents against a live harness:
// - Env: reset() and step(action) over one harness connection
//
// Single-agent mode returns scalar reward/done and one observation;
// multi-agent mode returns one entry per agent.

use std::path::PathBuf;

use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use aigis::{
    Action, AigisEnv, BaselineSource, EnvConfig, EnvMode, HttpHarnessClient, Observation,
    StepResult, OBS_DIM,
};

fn observations_to_py(py: Python<'_>, mode: EnvMode, obs: &[Observation]) -> PyObject {
    let rows: Vec<Vec<f64>> = obs.iter().map(|o| o.to_vec()).collect();
    match mode {
        EnvMode::Single => rows.into_iter().next().unwrap_or_default().into_py(py),
        EnvMode::Multi => rows.into_py(py),
    }
}

/// Convert StepInfo (plus the deployed configuration) to a Python dictionary.
fn step_info_to_dict(py: Python<'_>, result: &StepResult) -> PyResult<Py<PyDict>> {
    let info = &result.info;
    let dict = PyDict::new_bound(py);

    dict.set_item("step", info.step)?;
    dict.set_item("attempts", info.attempts)?;
    dict.set_item("cleanups", info.cleanups)?;
    dict.set_item("elapsed_ms", info.elapsed_ms)?;
    dict.set_item("failure", info.failure.as_deref())?;
    dict.set_item("failure_detail", info.failure_detail.as_deref())?;

    if let Some(m) = &info.metrics {
        dict.set_item("throughput", m.throughput)?;
        dict.set_item("latency", m.latency)?;
        dict.set_item("success_rate", m.success_rate)?;
    }
    if let Some(c) = &info.components {
        dict.set_item("throughput_term", c.throughput_term)?;
        dict.set_item("latency_term", c.latency_term)?;
    }

    let config = PyDict::new_bound(py);
    for (key, value) in &result.config {
        config.set_item(key, value)?;
    }
    dict.set_item("config", config)?;

    Ok(dict.into())
}

/// Accept either a flat list of floats or a list of per-agent lists.
///
/// The mode's native shape is tried first, so `[]` is an empty flat action
/// in single-agent mode.
fn parse_action(mode: EnvMode, action: &Bound<'_, PyAny>) -> PyResult<Action> {
    let flat = || action.extract::<Vec<f64>>().map(Action::Flat);
    let groups = || action.extract::<Vec<Vec<f64>>>().map(Action::Groups);
    let parsed = match mode {
        EnvMode::Single => flat().or_else(|_| groups()),
        EnvMode::Multi => groups().or_else(|_| flat()),
    };
    parsed.map_err(|_| {
        PyValueError::new_err("action must be a list of floats or a list of lists of floats")
    })
}

fn baseline_label(source: BaselineSource) -> &'static str {
    match source {
        BaselineSource::Measured => "measured",
        BaselineSource::Fallback => "fallback",
    }
}

/// Ledger-configuration tuning environment.
///
/// Gym-style API:
/// - reset() -> observation
/// - step(action) -> (observation, reward, done, info)
#[pyclass]
pub struct Env {
    inner: AigisEnv<HttpHarnessClient>,
}

#[pymethods]
impl Env {
    /// Create a new environment.
    ///
    /// Unset arguments fall back to the AIGIS_* environment variables.
    ///
    /// Args:
    ///     harness_url: Harness base URL
    ///     limits_path: Configuration-limits YAML document
    ///     mode: "single" or "multi"
    ///     telemetry_path: Optional JSONL step log
    #[new]
    #[pyo3(signature = (harness_url=None, limits_path=None, mode=None, telemetry_path=None))]
    fn new(
        harness_url: Option<String>,
        limits_path: Option<PathBuf>,
        mode: Option<&str>,
        telemetry_path: Option<PathBuf>,
    ) -> PyResult<Self> {
        let mut cfg = EnvConfig::from_env();
        if let Some(url) = harness_url {
            cfg.harness_url = url;
        }
        if let Some(path) = limits_path {
            cfg.limits_path = path;
        }
        if let Some(mode) = mode {
            cfg.mode = mode
                .parse()
                .map_err(|e| PyValueError::new_err(format!("{e}")))?;
        }
        if telemetry_path.is_some() {
            cfg.telemetry_path = telemetry_path;
        }
        cfg.validate()
            .map_err(|e| PyValueError::new_err(e.to_string()))?;

        let inner =
            AigisEnv::from_config(&cfg).map_err(|e| PyRuntimeError::new_err(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Reset the environment. Runs the baseline test on first use.
    ///
    /// Returns:
    ///     observation: List[float] (single) or List[List[float]] (multi)
    fn reset(&mut self, py: Python<'_>) -> PyObject {
        let inner = &mut self.inner;
        let obs = py.allow_threads(|| inner.reset());
        observations_to_py(py, self.inner.mode(), &obs)
    }

    /// Take a step in the environment.
    ///
    /// Args:
    ///     action: List[float] over every catalog key, or one List[float]
    ///         per agent; components in [0, 1]
    ///
    /// Returns:
    ///     Tuple of (observation, reward, done, info); reward and done are
    ///     lists in multi-agent mode
    fn step(
        &mut self,
        py: Python<'_>,
        action: &Bound<'_, PyAny>,
    ) -> PyResult<(PyObject, PyObject, PyObject, Py<PyDict>)> {
        let action = parse_action(self.inner.mode(), action)?;
        let inner = &mut self.inner;
        let result = py.allow_threads(|| inner.step(&action));

        let mode = self.inner.mode();
        let obs = observations_to_py(py, mode, &result.observations);
        let (reward, done) = match mode {
            EnvMode::Single => (
                result.reward().into_py(py),
                result.dones.first().copied().unwrap_or(true).into_py(py),
            ),
            EnvMode::Multi => (
                result.rewards.clone().into_py(py),
                result.dones.clone().into_py(py),
            ),
        };
        let info = step_info_to_dict(py, &result)?;
        Ok((obs, reward, done, info))
    }

    /// Measure the baseline if this episode has none yet. Returns
    /// "measured" or "fallback".
    fn boot(&mut self, py: Python<'_>) -> &'static str {
        let inner = &mut self.inner;
        baseline_label(py.allow_threads(|| inner.boot()))
    }

    /// Start a new episode: re-measure the baseline and reset the step
    /// count. Returns "measured" or "fallback".
    fn new_episode(&mut self, py: Python<'_>) -> &'static str {
        let inner = &mut self.inner;
        baseline_label(py.allow_threads(|| inner.new_episode()))
    }

    /// Baseline metrics and scaling limits of the current episode.
    fn baseline(&self, py: Python<'_>) -> PyResult<Py<PyDict>> {
        let state = self.inner.state();
        let dict = PyDict::new_bound(py);
        dict.set_item("throughput", state.initial.throughput)?;
        dict.set_item("latency", state.initial.latency)?;
        dict.set_item("success_rate", state.initial.success_rate)?;
        dict.set_item("throughput_limit", state.limits.throughput)?;
        dict.set_item("latency_limit", state.limits.latency)?;
        Ok(dict.into())
    }

    #[getter]
    fn mode(&self) -> &'static str {
        self.inner.mode().as_str()
    }

    #[getter]
    fn num_agents(&self) -> usize {
        self.inner.num_agents()
    }

    /// Action dimension per agent.
    #[getter]
    fn action_dims(&self) -> Vec<usize> {
        self.inner.action_dims()
    }

    #[getter]
    fn observation_dim(&self) -> usize {
        self.inner.observation_dim()
    }

    /// Steps taken this episode.
    #[getter]
    fn steps(&self) -> u64 {
        self.inner.state().steps
    }
}

/// Observation dimension (throughput, latency, success rate).
#[pyfunction]
fn observation_dim() -> usize {
    OBS_DIM
}

/// Python module definition.
#[pymodule]
fn aigis_env(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<Env>()?;
    m.add_function(wrap_pyfunction!(observation_dim, m)?)?;
    Ok(())
}
