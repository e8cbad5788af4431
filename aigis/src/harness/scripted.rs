//! In-process harness with scripted responses.
//!
//! Behaves like the remote service (one open session at a time, a `start`
//! while a session is open conflicts with that session's id) and lets tests
//! queue failures and test results. Clones share state, so a test can hand
//! one clone to the environment and inspect call counters through another.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{json, Value as JsonValue};

use super::{BoxFuture, HarnessClient, HarnessError, HarnessResult, SessionHandle, SessionStatus};
use crate::codec::ConfigDocument;

/// Test-result document in the harness's shape with a single target.
pub fn metrics_result(throughput: f64, avg_latency: f64, succ: u64, fail: u64) -> JsonValue {
    json!({
        "result": {
            "default": {
                "throughput": throughput,
                "avg-lat": avg_latency,
                "succ": succ,
                "fail": fail,
            }
        }
    })
}

#[derive(Debug)]
struct ScriptState {
    open: Option<String>,
    next_id: u64,
    start_failures: VecDeque<HarnessError>,
    test_results: VecDeque<HarnessResult<JsonValue>>,
    end_failures: VecDeque<HarnessError>,
    default_result: JsonValue,
    start_calls: Vec<ConfigDocument>,
    test_calls: usize,
    end_calls: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ScriptedHarness {
    state: Arc<Mutex<ScriptState>>,
}

impl Default for ScriptedHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedHarness {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ScriptState {
                open: None,
                next_id: 1,
                start_failures: VecDeque::new(),
                test_results: VecDeque::new(),
                end_failures: VecDeque::new(),
                default_result: metrics_result(100.0, 1.0, 100, 0),
                start_calls: Vec::new(),
                test_calls: 0,
                end_calls: Vec::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Result returned by `run_test` once the queue is drained.
    pub fn with_default_result(self, result: JsonValue) -> Self {
        self.state().default_result = result;
        self
    }

    /// Fail the next `start` with `err` (before any session check).
    pub fn push_start_failure(&self, err: HarnessError) {
        self.state().start_failures.push_back(err);
    }

    /// Queue the next `run_test` outcome.
    pub fn push_test_result(&self, result: HarnessResult<JsonValue>) {
        self.state().test_results.push_back(result);
    }

    /// Fail the next `end` with `err` (the session still closes).
    pub fn push_end_failure(&self, err: HarnessError) {
        self.state().end_failures.push_back(err);
    }

    /// Leave a session open, as a crashed client would.
    pub fn open_session(&self, id: impl Into<String>) {
        self.state().open = Some(id.into());
    }

    pub fn open_session_id(&self) -> Option<String> {
        self.state().open.clone()
    }

    pub fn start_calls(&self) -> Vec<ConfigDocument> {
        self.state().start_calls.clone()
    }

    pub fn start_call_count(&self) -> usize {
        self.state().start_calls.len()
    }

    pub fn test_call_count(&self) -> usize {
        self.state().test_calls
    }

    pub fn end_calls(&self) -> Vec<String> {
        self.state().end_calls.clone()
    }

    fn do_start(&self, configs: ConfigDocument) -> HarnessResult<SessionHandle> {
        let mut state = self.state();
        state.start_calls.push(configs);
        if let Some(err) = state.start_failures.pop_front() {
            return Err(err);
        }
        if let Some(open) = &state.open {
            return Err(HarnessError::conflict(
                Some(open.clone()),
                format!("session {open} is still active"),
            ));
        }
        let id = format!("session-{}", state.next_id);
        state.next_id += 1;
        state.open = Some(id.clone());
        Ok(SessionHandle::new(id))
    }

    fn do_run_test(&self, session: SessionHandle) -> HarnessResult<JsonValue> {
        let mut state = self.state();
        state.test_calls += 1;
        if state.open.as_deref() != Some(session.id.as_str()) {
            return Err(HarnessError::rejected(
                404,
                format!("session {} is not open", session.id),
            ));
        }
        match state.test_results.pop_front() {
            Some(result) => result,
            None => Ok(state.default_result.clone()),
        }
    }

    fn do_end(&self, session_id: String) -> HarnessResult<()> {
        let mut state = self.state();
        if state.open.as_deref() == Some(session_id.as_str()) {
            state.open = None;
        }
        state.end_calls.push(session_id);
        match state.end_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl HarnessClient for ScriptedHarness {
    fn start(&self, configs: ConfigDocument) -> BoxFuture<'_, HarnessResult<SessionHandle>> {
        let result = self.do_start(configs);
        Box::pin(async move { result })
    }

    fn run_test(&self, session: SessionHandle) -> BoxFuture<'_, HarnessResult<JsonValue>> {
        let result = self.do_run_test(session);
        Box::pin(async move { result })
    }

    fn end(&self, session_id: String) -> BoxFuture<'_, HarnessResult<()>> {
        let result = self.do_end(session_id);
        Box::pin(async move { result })
    }

    fn status(&self) -> BoxFuture<'_, HarnessResult<SessionStatus>> {
        let open = self.open_session_id();
        Box::pin(async move {
            Ok(SessionStatus {
                active: open.is_some(),
                session_id: open,
            })
        })
    }
}
