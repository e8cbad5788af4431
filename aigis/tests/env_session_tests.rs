// Environment behaviour over a scripted harness: stale-session recovery,
// retry exhaustion, lenient metric parsing and the JSONL step log.

use std::sync::Arc;

use serde_json::json;

use aigis::harness::scripted::metrics_result;
use aigis::harness::BoxFuture;
use aigis::{
    best_record, Action, AigisEnv, Catalog, EnvConfig, EnvMode, HarnessError, Limit, PerfMetrics,
    ScriptedHarness, SleepFn, StepTelemetry,
};

const LIMITS_YAML: &str = r#"
configtx:
  BatchTimeout: 10s
  MaxMessageCount: 1000
peer:
  CORE_PEER_KEEPALIVE_MININTERVAL: 120s
  CORE_PEER_GOSSIP_PULLINTERVAL: 20s
"#;

fn catalog() -> Catalog {
    Catalog::from_yaml_str(LIMITS_YAML).unwrap()
}

fn no_sleep() -> SleepFn {
    Arc::new(|_d| Box::pin(async {}) as BoxFuture<'static, ()>)
}

fn make_env(mode: EnvMode, harness: &ScriptedHarness) -> AigisEnv<ScriptedHarness> {
    let cfg = EnvConfig {
        mode,
        ..EnvConfig::default()
    };
    AigisEnv::new(&cfg, &catalog(), harness.clone())
        .unwrap()
        .with_sleep_fn(no_sleep())
}

fn mid_action() -> Action {
    Action::Groups(vec![vec![0.5, 0.5], vec![0.5], vec![0.5]])
}

#[test]
fn catalog_limits_drive_rendered_values() {
    let catalog = catalog();
    assert_eq!(catalog.limit("BatchTimeout"), Some(&Limit::new(10.0, Some("s"))));
    assert_eq!(catalog.len(), 4);
}

#[test]
fn stale_session_is_cleaned_up_before_the_step() {
    let harness = ScriptedHarness::new();
    let mut env = make_env(EnvMode::Multi, &harness);
    env.boot();

    harness.open_session("stale-7");
    harness.push_test_result(Ok(metrics_result(400.0, 0.5, 50, 0)));
    let result = env.step(&mid_action());

    assert!(!result.failed());
    assert_eq!(result.info.attempts, 2);
    assert_eq!(result.info.cleanups, 1);
    assert!(harness.end_calls().contains(&"stale-7".to_string()));
    assert_eq!(harness.open_session_id(), None);
    assert_eq!(result.info.metrics.unwrap().throughput, 400.0);
}

#[test]
fn persistent_conflicts_exhaust_retries_and_penalize() {
    let harness = ScriptedHarness::new();
    let mut env = make_env(EnvMode::Single, &harness);
    env.boot();
    let tests_before = harness.test_call_count();

    for _ in 0..3 {
        harness.push_start_failure(HarnessError::conflict(None, "session already active"));
    }
    let result = env.step(&Action::Flat(vec![0.5; 4]));

    assert_eq!(result.info.failure.as_deref(), Some("retries_exhausted"));
    assert_eq!(result.info.attempts, 3);
    // no session id reported, nothing to clean up
    assert_eq!(result.info.cleanups, 0);
    assert_eq!(result.rewards, vec![-100.0]);
    assert_eq!(result.observations, vec![[0.0; 3]]);
    assert_eq!(harness.test_call_count(), tests_before);

    // the next step runs normally against the unchanged baseline
    let result = env.step(&Action::Flat(vec![0.5; 4]));
    assert!(!result.failed());
    assert_eq!(result.info.step, 2);
}

#[test]
fn transport_failure_is_not_retried() {
    let harness = ScriptedHarness::new();
    let mut env = make_env(EnvMode::Multi, &harness);
    env.boot();
    let starts = harness.start_call_count();

    harness.push_start_failure(HarnessError::transport("connection reset"));
    let result = env.step(&mid_action());

    assert_eq!(result.info.failure.as_deref(), Some("transport"));
    assert_eq!(result.info.attempts, 1);
    assert_eq!(harness.start_call_count(), starts + 1);
    assert_eq!(result.rewards, vec![-100.0; 3]);
}

#[test]
fn unparseable_metrics_default_to_zero() {
    let harness = ScriptedHarness::new();
    let mut env = make_env(EnvMode::Multi, &harness);
    env.boot();

    harness.push_test_result(Ok(json!({
        "status": 200,
        "result": {"peer0": {"tps": "n/a", "avg_latency": "2.5", "succ": 3}}
    })));
    let result = env.step(&mid_action());

    assert!(!result.failed());
    assert_eq!(result.info.metrics, Some(PerfMetrics::new(0.0, 2.5, 1.0)));
    assert!(result.reward().is_finite());
}

#[test]
fn reset_observes_baseline_in_multi_mode() {
    let harness = ScriptedHarness::new();
    harness.push_test_result(Ok(metrics_result(2500.0, 3.0, 9, 1)));
    harness.push_test_result(Ok(metrics_result(10_000.0, 1.0, 10, 0)));
    let mut env = make_env(EnvMode::Multi, &harness);

    let first = env.reset();
    env.step(&mid_action());
    let again = env.reset();

    assert_eq!(first, again);
    // 2500 / (5 * 2500), 3 / 30, 9 / 10
    assert_eq!(first[0], [0.2, 0.1, 0.9]);
}

#[test]
fn step_log_records_every_step_and_finds_the_best() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("steps.jsonl");

    let harness = ScriptedHarness::new();
    harness.push_test_result(Ok(metrics_result(1000.0, 1.0, 10, 0)));
    let mut env =
        make_env(EnvMode::Multi, &harness).with_telemetry(StepTelemetry::open(&path).unwrap());
    env.boot();

    harness.push_test_result(Ok(metrics_result(1200.0, 1.0, 10, 0)));
    env.step(&Action::Groups(vec![vec![0.1, 0.1], vec![0.1], vec![0.1]]));
    harness.push_test_result(Ok(metrics_result(3000.0, 0.5, 10, 0)));
    env.step(&Action::Groups(vec![vec![0.9, 0.9], vec![0.9], vec![0.9]]));
    harness.push_start_failure(HarnessError::timeout("deploy took too long"));
    env.step(&mid_action());

    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents.lines().count(), 3);

    let best = best_record(&path).unwrap().unwrap();
    assert_eq!(best.step, 2);
    assert_eq!(best.config["BatchTimeout"], "9s");
    assert_eq!(best.config["MaxMessageCount"], "900");

    let yaml = env.codec().sectioned_yaml(&best.config).unwrap();
    let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
    assert_eq!(parsed["configtx"]["BatchTimeout"], serde_yaml::Value::from("9s"));
    assert_eq!(parsed["peer"]["CORE_PEER_GOSSIP_PULLINTERVAL"], serde_yaml::Value::from("18s"));
}

#[test]
fn missing_limits_file_yields_zero_dimensional_actions() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = Catalog::load_or_empty(dir.path().join("action.max.yaml"));
    assert!(catalog.is_empty());

    for (mode, dims) in [(EnvMode::Single, vec![0]), (EnvMode::Multi, vec![0, 0, 0])] {
        let harness = ScriptedHarness::new();
        let cfg = EnvConfig {
            mode,
            ..EnvConfig::default()
        };
        let mut env = AigisEnv::new(&cfg, &catalog, harness.clone())
            .unwrap()
            .with_sleep_fn(no_sleep());
        assert_eq!(env.action_dims(), dims);

        let obs = env.reset();
        assert_eq!(obs.len(), env.num_agents());

        let actions = match mode {
            EnvMode::Single => vec![Action::Flat(Vec::new()), Action::Groups(Vec::new())],
            EnvMode::Multi => vec![
                Action::Groups(vec![Vec::new(); 3]),
                Action::Flat(Vec::new()),
                Action::Groups(Vec::new()),
            ],
        };
        for action in &actions {
            let result = env.step(action);
            assert!(!result.failed(), "{mode}: {:?}", result.info.failure_detail);
            assert!(result.config.is_empty());
            assert_eq!(result.observations.len(), env.num_agents());
        }
        // baseline plus one session per step, each deploying nothing
        let starts = harness.start_calls();
        assert_eq!(starts.len(), 1 + actions.len());
        assert!(starts.iter().all(|doc| doc.is_empty()));
    }
}
