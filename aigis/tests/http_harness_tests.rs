// HttpHarnessClient against an in-process tiny_http harness.

use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value as JsonValue};
use tiny_http::{Response, Server};

use aigis::harness::BoxFuture;
use aigis::{
    reset_stale_session, AigisEnv, Catalog, EnvConfig, EnvMode, HarnessClient, HarnessErrorKind,
    HttpHarnessClient, Limit, RetryPolicy, SessionDriver, SessionHandle, SleepFn, StepFailure,
};

#[derive(Default)]
struct FakeState {
    open: Option<String>,
    next_id: u32,
    methods: Vec<String>,
    configs: Vec<JsonValue>,
    broken_tests: bool,
    anonymous_start: bool,
}

type Shared = Arc<Mutex<FakeState>>;

fn handle(state: &Shared, req: &JsonValue) -> (u16, String) {
    let mut st = state.lock().unwrap();
    let method = req["method"].as_str().unwrap_or_default().to_string();
    st.methods.push(method.clone());
    let session = req["session_id"].as_str();

    match method.as_str() {
        "SESSION_START" => match st.open.clone() {
            Some(open) => (
                409,
                json!({"error": "session already active", "session_id": open}).to_string(),
            ),
            None => {
                st.next_id += 1;
                let id = format!("s{}", st.next_id);
                st.open = Some(id.clone());
                st.configs.push(req["configs"].clone());
                if st.anonymous_start {
                    (200, json!({"status": 200}).to_string())
                } else {
                    (200, json!({"status": 200, "session_id": id}).to_string())
                }
            }
        },
        "TEST" if st.broken_tests => (500, "internal error".to_string()),
        "TEST" if st.open.is_some() && st.open.as_deref() == session => (
            200,
            json!({
                "status": 200,
                "result": {"peer0": {"throughput": "512.5", "avg-lat": "0.8", "succ": "99", "fail": "1"}}
            })
            .to_string(),
        ),
        "TEST" => (404, json!({"error": "no such session"}).to_string()),
        "SESSION_END" => {
            if st.open.as_deref() == session {
                st.open = None;
            }
            (200, json!({"status": 200}).to_string())
        }
        "SESSION_STATUS" => (
            200,
            json!({"active": st.open.is_some(), "session_id": st.open}).to_string(),
        ),
        _ => (400, json!({"error": "unknown method"}).to_string()),
    }
}

/// Start a fake harness; returns its URL and shared state.
fn spawn_harness(initial_open: Option<&str>) -> (String, Shared) {
    let server = Server::http("127.0.0.1:0").expect("bind server");
    let url = format!("http://{}", server.server_addr());
    let state: Shared = Arc::new(Mutex::new(FakeState {
        open: initial_open.map(str::to_string),
        ..FakeState::default()
    }));
    let shared = state.clone();
    std::thread::spawn(move || {
        for mut request in server.incoming_requests() {
            let mut body = String::new();
            let _ = request.as_reader().read_to_string(&mut body);
            let req: JsonValue = serde_json::from_str(&body).unwrap_or(JsonValue::Null);
            let (status, reply) = handle(&shared, &req);
            let _ = request.respond(Response::from_string(reply).with_status_code(status));
        }
    });
    (url, state)
}

fn client(url: &str) -> HttpHarnessClient {
    HttpHarnessClient::new(url, Duration::from_secs(5)).unwrap()
}

fn no_sleep() -> SleepFn {
    Arc::new(|_d| Box::pin(async {}) as BoxFuture<'static, ()>)
}

#[tokio::test]
async fn start_test_end_round_trip() {
    let (url, state) = spawn_harness(None);
    let client = client(&url);

    let session = client.start(Default::default()).await.unwrap();
    assert_eq!(session, SessionHandle::new("s1"));
    let raw = client.run_test(session.clone()).await.unwrap();
    assert_eq!(raw["result"]["peer0"]["succ"], "99");
    client.end(session.id).await.unwrap();

    let st = state.lock().unwrap();
    assert_eq!(st.methods, vec!["SESSION_START", "TEST", "SESSION_END"]);
    assert_eq!(st.open, None);
}

#[tokio::test]
async fn conflict_carries_the_open_session_id() {
    let (url, _state) = spawn_harness(Some("ghost"));
    let err = client(&url).start(Default::default()).await.unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(err.conflict_session_id(), Some("ghost"));
    assert_eq!(err.status, Some(409));
}

#[tokio::test]
async fn driver_cleans_up_stale_session_over_http() {
    let (url, state) = spawn_harness(Some("ghost"));
    let driver = SessionDriver::new(client(&url), RetryPolicy::default()).with_sleep_fn(no_sleep());

    let outcome = driver.run(Default::default()).await;
    assert!(outcome.is_success());
    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.cleanups, 1);

    let st = state.lock().unwrap();
    assert_eq!(
        st.methods,
        vec!["SESSION_START", "SESSION_END", "SESSION_START", "TEST", "SESSION_END"]
    );
    assert_eq!(st.open, None);
}

#[tokio::test]
async fn server_error_fails_without_retry_and_still_ends_session() {
    let (url, state) = spawn_harness(None);
    state.lock().unwrap().broken_tests = true;
    let driver = SessionDriver::new(client(&url), RetryPolicy::default()).with_sleep_fn(no_sleep());

    let outcome = driver.run(Default::default()).await;
    match &outcome.result {
        Err(StepFailure::Harness(err)) => {
            assert_eq!(err.kind, HarnessErrorKind::Rejected);
            assert_eq!(err.status, Some(500));
        }
        other => panic!("expected rejected harness error, got {other:?}"),
    }
    assert_eq!(outcome.attempts, 1);
    assert_eq!(state.lock().unwrap().open, None);
}

#[tokio::test]
async fn reset_stale_session_ends_active_session_once() {
    let (url, state) = spawn_harness(Some("left-over"));
    let client = client(&url);

    assert_eq!(reset_stale_session(&client).await.unwrap(), Some("left-over".to_string()));
    assert_eq!(reset_stale_session(&client).await.unwrap(), None);
    assert_eq!(state.lock().unwrap().open, None);
}

#[tokio::test]
async fn start_reply_without_session_id_ends_the_opened_session() {
    let (url, state) = spawn_harness(None);
    state.lock().unwrap().anonymous_start = true;

    let err = client(&url).start(Default::default()).await.unwrap_err();
    assert_eq!(err.kind, HarnessErrorKind::Protocol);

    let st = state.lock().unwrap();
    assert_eq!(st.open, None);
    assert_eq!(st.methods, vec!["SESSION_START", "SESSION_STATUS", "SESSION_END"]);
}

#[tokio::test]
async fn unreachable_harness_is_a_transport_error() {
    // bind then drop to get a port nobody listens on
    let port = {
        let server = Server::http("127.0.0.1:0").expect("bind server");
        server.server_addr().to_ip().expect("ip listener").port()
    };
    let err = client(&format!("http://127.0.0.1:{port}"))
        .status()
        .await
        .unwrap_err();
    assert_eq!(err.kind, HarnessErrorKind::Transport);
}

#[test]
fn environment_steps_against_http_harness() {
    let (url, state) = spawn_harness(None);
    let mut catalog = Catalog::new();
    catalog.insert("configtx", "BatchTimeout", Limit::new(10.0, Some("s")));
    catalog.insert("configtx", "MaxMessageCount", Limit::new(1000.0, None));
    catalog.insert("peer", "CORE_PEER_GOSSIP_PULLINTERVAL", Limit::new(20.0, Some("s")));

    let cfg = EnvConfig {
        harness_url: url.clone(),
        mode: EnvMode::Single,
        ..EnvConfig::default()
    };
    let mut env = AigisEnv::new(&cfg, &catalog, client(&url))
        .unwrap()
        .with_sleep_fn(no_sleep());

    let obs = env.reset();
    assert_eq!(obs.len(), 1);
    assert!((obs[0][0] - 512.5 / 5000.0).abs() < 1e-12);
    assert!((obs[0][2] - 0.99).abs() < 1e-12);

    let result = env.step(&aigis::Action::Flat(vec![0.0, 0.5, 1.0]));
    assert!(!result.failed());
    assert_eq!(result.dones, vec![true]);
    // same metrics as the baseline
    assert_eq!(result.reward(), 0.0);

    let st = state.lock().unwrap();
    assert_eq!(st.configs.len(), 2);
    assert_eq!(st.configs[0], json!({}));
    assert_eq!(
        st.configs[1],
        json!({"BatchTimeout": "1s", "MaxMessageCount": "500", "CORE_PEER_GOSSIP_PULLINTERVAL": "20s"})
    );
}
