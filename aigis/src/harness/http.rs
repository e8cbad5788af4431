//! JSON-over-HTTP harness client.
//!
//! Every call is a `POST` of `{"method": ..., ...}` to the harness base URL:
//!
//! | method           | extra fields  | reply                                |
//! |------------------|---------------|--------------------------------------|
//! | `SESSION_START`  | `configs`     | `{"session_id": "..."}`              |
//! | `TEST`           | `session_id`  | `{"result": {<target>: {...}}}`      |
//! | `SESSION_END`    | `session_id`  | anything 2xx                         |
//! | `SESSION_STATUS` |               | `{"active": bool, "session_id": ..}` |
//!
//! A conflict is signalled either by HTTP 409 or by `"status": 409` in the
//! body, with the open session's id in `session_id`. A start reply without
//! a `session_id` is a protocol error; before returning it the client ends
//! whatever session `SESSION_STATUS` reports.

use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};

use super::{
    BoxFuture, HarnessClient, HarnessError, HarnessResult, SessionHandle, SessionStatus,
    CONFLICT_STATUS,
};
use crate::codec::ConfigDocument;

#[derive(Debug, Clone)]
pub struct HttpHarnessClient {
    base_url: String,
    http: Client,
}

impl HttpHarnessClient {
    /// Client for `base_url` whose requests give up after `timeout`.
    ///
    /// The timeout bounds a whole deploy-and-test round trip, so it is
    /// typically minutes, not seconds.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> HarnessResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HarnessError::transport(format!("http client build: {e}")))?;
        Ok(Self {
            base_url: base_url.into(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn call(&self, body: JsonValue) -> HarnessResult<JsonValue> {
        let method = body
            .get("method")
            .and_then(JsonValue::as_str)
            .unwrap_or("?")
            .to_string();
        debug!(method = %method, url = %self.base_url, "harness request");

        let resp = self
            .http
            .post(&self.base_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| request_error(&method, e))?;
        let status = resp.status().as_u16();
        let text = resp.text().await.map_err(|e| request_error(&method, e))?;
        let parsed: Option<JsonValue> = serde_json::from_str(&text).ok();

        classify(&method, status, &text, parsed)
    }
}

fn request_error(method: &str, err: reqwest::Error) -> HarnessError {
    if err.is_timeout() {
        HarnessError::timeout(format!("{method}: {err}"))
    } else {
        HarnessError::transport(format!("{method}: {err}"))
    }
}

/// Map an HTTP reply to the protocol's success/conflict/error outcomes.
fn classify(
    method: &str,
    http_status: u16,
    text: &str,
    body: Option<JsonValue>,
) -> HarnessResult<JsonValue> {
    let body_status = body
        .as_ref()
        .and_then(|b| b.get("status"))
        .and_then(JsonValue::as_u64)
        .and_then(|s| u16::try_from(s).ok());
    let message = body
        .as_ref()
        .and_then(|b| b.get("error").or_else(|| b.get("message")))
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| text.chars().take(200).collect());

    if http_status == CONFLICT_STATUS || body_status == Some(CONFLICT_STATUS) {
        let session_id = body
            .as_ref()
            .and_then(|b| b.get("session_id"))
            .and_then(JsonValue::as_str)
            .map(str::to_string);
        return Err(HarnessError::conflict(session_id, format!("{method}: {message}")));
    }
    if !(200..300).contains(&http_status) {
        return Err(HarnessError::rejected(http_status, format!("{method}: {message}")));
    }
    if let Some(status) = body_status.filter(|s| *s >= 400) {
        return Err(HarnessError::rejected(status, format!("{method}: {message}")));
    }
    body.ok_or_else(|| HarnessError::protocol(format!("{method}: reply is not JSON")))
}

impl HarnessClient for HttpHarnessClient {
    fn start(&self, configs: ConfigDocument) -> BoxFuture<'_, HarnessResult<SessionHandle>> {
        Box::pin(async move {
            let reply = self
                .call(json!({"method": "SESSION_START", "configs": configs}))
                .await?;
            if let Some(id) = reply.get("session_id").and_then(JsonValue::as_str) {
                return Ok(SessionHandle::new(id));
            }
            // the harness may have opened a session we cannot name
            warn!("SESSION_START reply has no session_id, asking the harness for its status");
            match super::reset_stale_session(self).await {
                Ok(Some(id)) => info!(session_id = %id, "ended unnamed session"),
                Ok(None) => {}
                Err(err) => warn!(error = %err, "could not end unnamed session"),
            }
            Err(HarnessError::protocol("SESSION_START: reply has no session_id"))
        })
    }

    fn run_test(&self, session: SessionHandle) -> BoxFuture<'_, HarnessResult<JsonValue>> {
        Box::pin(async move {
            self.call(json!({"method": "TEST", "session_id": session.id}))
                .await
        })
    }

    fn end(&self, session_id: String) -> BoxFuture<'_, HarnessResult<()>> {
        Box::pin(async move {
            self.call(json!({"method": "SESSION_END", "session_id": session_id}))
                .await
                .map(|_| ())
        })
    }

    fn status(&self) -> BoxFuture<'_, HarnessResult<SessionStatus>> {
        Box::pin(async move {
            let reply = self.call(json!({"method": "SESSION_STATUS"})).await?;
            serde_json::from_value(reply)
                .map_err(|e| HarnessError::protocol(format!("SESSION_STATUS: {e}")))
        })
    }
}
