// src/session.rs
//
// Session driver: one environment step against the remote harness.
//
// State machine:
//   IDLE -> SESSION_STARTING -> TESTING -> COLLECTING -> IDLE      (success)
//   IDLE -> SESSION_STARTING -> CONFLICT -> CLEANUP -> SESSION_STARTING ...
//   ... -> FAILED                 (retries exhausted / non-conflict error)
//
// A session that was opened is always ended before `run` returns; if the
// step future is dropped first, the session's lease parks its id and the
// next `run` ends it before starting a new one. Conflicts
// are the only retried error; the wait between attempts goes through an
// injectable sleep function so tests never block on wall-clock time.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::codec::{ActionShapeError, ConfigDocument};
use crate::harness::{BoxFuture, HarnessClient, HarnessError, SessionHandle};

pub type SleepFn = Arc<dyn Fn(Duration) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionPhase {
    Idle,
    SessionStarting,
    Testing,
    Collecting,
    Conflict,
    Cleanup,
    Failed,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionPhase::Idle => "IDLE",
            SessionPhase::SessionStarting => "SESSION_STARTING",
            SessionPhase::Testing => "TESTING",
            SessionPhase::Collecting => "COLLECTING",
            SessionPhase::Conflict => "CONFLICT",
            SessionPhase::Cleanup => "CLEANUP",
            SessionPhase::Failed => "FAILED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Session starts attempted before giving up (at least 1).
    pub max_attempts: u32,
    /// Fixed wait after a conflict before the next attempt.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

/// Why a step produced no metrics.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StepFailure {
    #[error("session conflicts persisted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: HarnessError },
    #[error("harness error: {0}")]
    Harness(HarnessError),
    #[error("invalid action: {0}")]
    InvalidAction(#[from] ActionShapeError),
}

impl StepFailure {
    pub fn reason_label(&self) -> &'static str {
        match self {
            StepFailure::RetriesExhausted { .. } => "retries_exhausted",
            StepFailure::Harness(err) => err.reason_label(),
            StepFailure::InvalidAction(_) => "invalid_action",
        }
    }
}

/// Result of one driven step plus what it took to get there.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
    /// Raw test-result document, or why there is none.
    pub result: Result<JsonValue, StepFailure>,
    /// Session starts attempted.
    pub attempts: u32,
    /// Stale sessions ended after conflicts.
    pub cleanups: u32,
    /// Phases visited, in order.
    pub trace: Vec<SessionPhase>,
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Lease on an open session. Released once the session is ended; dropped
/// unreleased, it leaves the id in the driver's abandoned slot.
struct SessionLease<'a> {
    slot: &'a Mutex<Option<String>>,
    id: String,
    released: bool,
}

impl<'a> SessionLease<'a> {
    fn acquire(slot: &'a Mutex<Option<String>>, id: String) -> Self {
        *lock_slot(slot) = Some(id.clone());
        Self {
            slot,
            id,
            released: false,
        }
    }

    fn release(mut self) {
        self.released = true;
        lock_slot(self.slot).take();
    }
}

impl Drop for SessionLease<'_> {
    fn drop(&mut self) {
        if !self.released {
            warn!(session_id = %self.id, "session left open, ending it before the next start");
        }
    }
}

fn lock_slot(slot: &Mutex<Option<String>>) -> MutexGuard<'_, Option<String>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SessionDriver<C> {
    client: C,
    policy: RetryPolicy,
    sleep_fn: SleepFn,
    abandoned: Mutex<Option<String>>,
}

impl<C> SessionDriver<C>
where
    C: HarnessClient,
{
    pub fn new(client: C, policy: RetryPolicy) -> Self {
        Self {
            client,
            policy,
            sleep_fn: Arc::new(|duration| Box::pin(sleep(duration)) as BoxFuture<'static, ()>),
            abandoned: Mutex::new(None),
        }
    }

    pub fn with_sleep_fn(mut self, sleep_fn: SleepFn) -> Self {
        self.sleep_fn = sleep_fn;
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Session a previous `run` opened but could not end.
    pub fn abandoned_session(&self) -> Option<String> {
        lock_slot(&self.abandoned).clone()
    }

    /// Deploy `configs`, run the load test, and return the raw result.
    pub async fn run(&self, configs: ConfigDocument) -> SessionOutcome {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut trace = vec![SessionPhase::Idle];
        let mut cleanups = 0u32;
        let mut last_conflict = None;

        let abandoned = lock_slot(&self.abandoned).take();
        if let Some(stale) = abandoned {
            trace.push(SessionPhase::Cleanup);
            cleanups += 1;
            info!(session_id = %stale, "ending session left open by an earlier step");
            if let Err(err) = self.client.end(stale.clone()).await {
                warn!(session_id = %stale, error = %err, "cleanup failed");
            }
        }

        for attempt in 1..=max_attempts {
            trace.push(SessionPhase::SessionStarting);
            match self.client.start(configs.clone()).await {
                Ok(session) => {
                    info!(attempt, session_id = %session.id, "session started");
                    trace.push(SessionPhase::Testing);
                    let result = self.test_in_session(session).await;
                    let result = match result {
                        Ok(raw) => {
                            trace.push(SessionPhase::Collecting);
                            trace.push(SessionPhase::Idle);
                            Ok(raw)
                        }
                        Err(err) => {
                            warn!(attempt, error = %err, "load test failed");
                            trace.push(SessionPhase::Failed);
                            Err(StepFailure::Harness(err))
                        }
                    };
                    return SessionOutcome {
                        result,
                        attempts: attempt,
                        cleanups,
                        trace,
                    };
                }
                Err(err) if err.is_conflict() => {
                    trace.push(SessionPhase::Conflict);
                    warn!(
                        attempt,
                        max_attempts,
                        session_id = err.conflict_session_id().unwrap_or("-"),
                        "session conflict"
                    );
                    if let Some(stale) = err.conflict_session_id() {
                        trace.push(SessionPhase::Cleanup);
                        cleanups += 1;
                        if let Err(cleanup_err) = self.client.end(stale.to_string()).await {
                            warn!(session_id = stale, error = %cleanup_err, "cleanup failed");
                        }
                    }
                    last_conflict = Some(err);
                    if attempt < max_attempts {
                        (self.sleep_fn)(self.policy.backoff).await;
                    }
                }
                Err(err) => {
                    warn!(attempt, error = %err, "session start failed");
                    trace.push(SessionPhase::Failed);
                    return SessionOutcome {
                        result: Err(StepFailure::Harness(err)),
                        attempts: attempt,
                        cleanups,
                        trace,
                    };
                }
            }
        }

        trace.push(SessionPhase::Failed);
        let last = last_conflict
            .unwrap_or_else(|| HarnessError::conflict(None, "no attempt completed"));
        warn!(attempts = max_attempts, cleanups, "session retries exhausted");
        SessionOutcome {
            result: Err(StepFailure::RetriesExhausted {
                attempts: max_attempts,
                last,
            }),
            attempts: max_attempts,
            cleanups,
            trace,
        }
    }

    /// Run the test inside `session`, then end the session whatever the
    /// test's outcome. A failed `end` is logged and does not override the
    /// test result; the session stays leased until a later `end` succeeds.
    async fn test_in_session(&self, session: SessionHandle) -> Result<JsonValue, HarnessError> {
        let lease = SessionLease::acquire(&self.abandoned, session.id.clone());
        let result = self.client.run_test(session).await;
        match self.client.end(lease.id.clone()).await {
            Ok(()) => {
                debug!(session_id = %lease.id, "session ended");
                lease.release();
            }
            Err(err) => warn!(session_id = %lease.id, error = %err, "failed to end session"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::harness::scripted::{metrics_result, ScriptedHarness};
    use crate::harness::{HarnessResult, SessionStatus};

    fn recording_sleep() -> (SleepFn, Arc<Mutex<Vec<Duration>>>) {
        let sleeps = Arc::new(Mutex::new(Vec::new()));
        let sink = sleeps.clone();
        let sleep_fn: SleepFn = Arc::new(move |d| {
            sink.lock().unwrap().push(d);
            Box::pin(async {}) as BoxFuture<'static, ()>
        });
        (sleep_fn, sleeps)
    }

    fn driver(harness: &ScriptedHarness) -> (SessionDriver<ScriptedHarness>, Arc<Mutex<Vec<Duration>>>) {
        let (sleep_fn, sleeps) = recording_sleep();
        let driver =
            SessionDriver::new(harness.clone(), RetryPolicy::default()).with_sleep_fn(sleep_fn);
        (driver, sleeps)
    }

    fn ghost_conflict(id: &str) -> HarnessError {
        HarnessError::conflict(Some(id.to_string()), "session busy")
    }

    #[tokio::test]
    async fn success_walks_the_happy_path() {
        let harness = ScriptedHarness::new();
        harness.push_test_result(Ok(metrics_result(250.0, 0.8, 10, 0)));
        let (driver, sleeps) = driver(&harness);

        let outcome = driver.run(ConfigDocument::new()).await;
        let raw = outcome.result.clone().unwrap();
        assert_eq!(raw["result"]["default"]["throughput"], 250.0);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.cleanups, 0);
        assert_eq!(
            outcome.trace,
            vec![
                SessionPhase::Idle,
                SessionPhase::SessionStarting,
                SessionPhase::Testing,
                SessionPhase::Collecting,
                SessionPhase::Idle,
            ]
        );
        assert_eq!(harness.end_calls(), vec!["session-1".to_string()]);
        assert!(harness.open_session_id().is_none());
        assert!(sleeps.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn two_conflicts_then_success() {
        let harness = ScriptedHarness::new();
        harness.push_start_failure(ghost_conflict("ghost-1"));
        harness.push_start_failure(ghost_conflict("ghost-2"));
        let (driver, sleeps) = driver(&harness);

        let outcome = driver.run(ConfigDocument::new()).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.cleanups, 2);
        assert_eq!(harness.test_call_count(), 1);
        assert_eq!(
            harness.end_calls(),
            vec!["ghost-1".to_string(), "ghost-2".to_string(), "session-1".to_string()]
        );
        assert_eq!(*sleeps.lock().unwrap(), vec![Duration::from_secs(2); 2]);
        assert_eq!(
            outcome.trace[..5],
            [
                SessionPhase::Idle,
                SessionPhase::SessionStarting,
                SessionPhase::Conflict,
                SessionPhase::Cleanup,
                SessionPhase::SessionStarting,
            ]
        );
    }

    #[tokio::test]
    async fn stale_session_is_cleaned_up() {
        let harness = ScriptedHarness::new();
        harness.open_session("left-over");
        let (driver, _) = driver(&harness);

        let outcome = driver.run(ConfigDocument::new()).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.cleanups, 1);
        assert_eq!(harness.end_calls()[0], "left-over");
    }

    #[tokio::test]
    async fn retries_exhaust_after_three_conflicts() {
        let harness = ScriptedHarness::new();
        for i in 0..3 {
            harness.push_start_failure(ghost_conflict(&format!("ghost-{i}")));
        }
        let (driver, sleeps) = driver(&harness);

        let outcome = driver.run(ConfigDocument::new()).await;
        match &outcome.result {
            Err(StepFailure::RetriesExhausted { attempts, last }) => {
                assert_eq!(*attempts, 3);
                assert_eq!(last.conflict_session_id(), Some("ghost-2"));
            }
            other => panic!("expected retries exhausted, got {other:?}"),
        }
        assert_eq!(outcome.result.as_ref().unwrap_err().reason_label(), "retries_exhausted");
        assert_eq!(outcome.cleanups, 3);
        assert_eq!(harness.start_call_count(), 3);
        assert_eq!(harness.test_call_count(), 0);
        // no wait after the final attempt
        assert_eq!(sleeps.lock().unwrap().len(), 2);
        assert_eq!(outcome.trace.last(), Some(&SessionPhase::Failed));
    }

    #[tokio::test]
    async fn non_conflict_start_error_is_not_retried() {
        let harness = ScriptedHarness::new();
        harness.push_start_failure(HarnessError::rejected(500, "deploy failed"));
        let (driver, sleeps) = driver(&harness);

        let outcome = driver.run(ConfigDocument::new()).await;
        assert!(matches!(outcome.result, Err(StepFailure::Harness(_))));
        assert_eq!(outcome.attempts, 1);
        assert_eq!(harness.start_call_count(), 1);
        assert!(sleeps.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn session_is_ended_when_the_test_fails() {
        let harness = ScriptedHarness::new();
        harness.push_test_result(Err(HarnessError::timeout("load test timed out")));
        let (driver, _) = driver(&harness);

        let outcome = driver.run(ConfigDocument::new()).await;
        assert_eq!(outcome.result.unwrap_err().reason_label(), "timeout");
        assert_eq!(harness.end_calls(), vec!["session-1".to_string()]);
        assert!(harness.open_session_id().is_none());
    }

    #[tokio::test]
    async fn failed_end_keeps_the_test_result() {
        let harness = ScriptedHarness::new();
        harness.push_end_failure(HarnessError::transport("connection reset"));
        let (driver, _) = driver(&harness);

        let outcome = driver.run(ConfigDocument::new()).await;
        assert!(outcome.is_success());
        assert_eq!(driver.abandoned_session().as_deref(), Some("session-1"));

        // the next run retries the end before starting
        let outcome = driver.run(ConfigDocument::new()).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.cleanups, 1);
        assert_eq!(
            harness.end_calls(),
            vec!["session-1".to_string(), "session-1".to_string(), "session-2".to_string()]
        );
        assert!(driver.abandoned_session().is_none());
    }

    #[tokio::test]
    async fn conflict_without_session_id_retries_without_cleanup() {
        let harness = ScriptedHarness::new();
        harness.push_start_failure(HarnessError::conflict(None, "busy"));
        let (driver, sleeps) = driver(&harness);

        let outcome = driver.run(ConfigDocument::new()).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.cleanups, 0);
        assert_eq!(sleeps.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn zero_attempts_still_tries_once() {
        let harness = ScriptedHarness::new();
        let (sleep_fn, _) = recording_sleep();
        let policy = RetryPolicy {
            max_attempts: 0,
            backoff: Duration::from_millis(1),
        };
        let driver = SessionDriver::new(harness.clone(), policy).with_sleep_fn(sleep_fn);

        let outcome = driver.run(ConfigDocument::new()).await;
        assert!(outcome.is_success());
        assert_eq!(harness.start_call_count(), 1);
    }

    #[tokio::test]
    async fn configs_are_sent_on_every_attempt() {
        let harness = ScriptedHarness::new();
        harness.push_start_failure(ghost_conflict("ghost"));
        let (driver, _) = driver(&harness);

        let mut configs = ConfigDocument::new();
        configs.insert("BatchTimeout".to_string(), "2s".to_string());
        driver.run(configs.clone()).await;
        assert_eq!(harness.start_calls(), vec![configs.clone(), configs]);
    }

    /// Scripted harness whose load test can be made to never finish.
    struct StallingHarness {
        inner: ScriptedHarness,
        stall: AtomicBool,
    }

    impl HarnessClient for StallingHarness {
        fn start(&self, configs: ConfigDocument) -> BoxFuture<'_, HarnessResult<SessionHandle>> {
            self.inner.start(configs)
        }

        fn run_test(&self, session: SessionHandle) -> BoxFuture<'_, HarnessResult<JsonValue>> {
            if self.stall.load(Ordering::SeqCst) {
                Box::pin(std::future::pending())
            } else {
                self.inner.run_test(session)
            }
        }

        fn end(&self, session_id: String) -> BoxFuture<'_, HarnessResult<()>> {
            self.inner.end(session_id)
        }

        fn status(&self) -> BoxFuture<'_, HarnessResult<SessionStatus>> {
            self.inner.status()
        }
    }

    #[tokio::test]
    async fn dropped_step_ends_its_session_on_next_run() {
        let harness = ScriptedHarness::new();
        let client = StallingHarness {
            inner: harness.clone(),
            stall: AtomicBool::new(true),
        };
        let (sleep_fn, _) = recording_sleep();
        let driver = SessionDriver::new(client, RetryPolicy::default()).with_sleep_fn(sleep_fn);

        let timed_out =
            tokio::time::timeout(Duration::from_millis(20), driver.run(ConfigDocument::new())).await;
        assert!(timed_out.is_err());
        assert_eq!(harness.open_session_id().as_deref(), Some("session-1"));
        assert_eq!(driver.abandoned_session().as_deref(), Some("session-1"));

        driver.client().stall.store(false, Ordering::SeqCst);
        let outcome = driver.run(ConfigDocument::new()).await;
        assert!(outcome.is_success());
        // ended up front, so no conflict round trip
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.cleanups, 1);
        assert_eq!(outcome.trace[1], SessionPhase::Cleanup);
        assert_eq!(
            harness.end_calls(),
            vec!["session-1".to_string(), "session-2".to_string()]
        );
        assert!(driver.abandoned_session().is_none());
    }
}
