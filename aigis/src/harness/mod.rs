//! Remote test-harness session protocol.
//!
//! The harness is a black-box session service: `start(configs)` deploys a
//! configuration and opens a session, `run_test` runs a load test inside it,
//! `end` closes it. Only one session may be open at a time; a second `start`
//! fails with a conflict naming the session that is still open.

pub mod http;
pub mod scripted;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::info;

use crate::codec::ConfigDocument;

pub use http::HttpHarnessClient;
pub use scripted::ScriptedHarness;

pub type HarnessResult<T> = Result<T, HarnessError>;
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// HTTP status the harness uses for "a session is already open".
pub const CONFLICT_STATUS: u16 = 409;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarnessErrorKind {
    /// Another session is open (status 409).
    Conflict,
    /// Connection refused, reset, DNS failure, ...
    Transport,
    /// Request exceeded the configured timeout.
    Timeout,
    /// The harness answered with a non-conflict error status.
    Rejected,
    /// The response could not be understood.
    Protocol,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct HarnessError {
    pub kind: HarnessErrorKind,
    pub message: String,
    /// HTTP (or in-body) status, when the harness sent one.
    pub status: Option<u16>,
    /// Session named by a conflict response.
    pub session_id: Option<String>,
}

impl HarnessErrorKind {
    pub fn label(self) -> &'static str {
        match self {
            HarnessErrorKind::Conflict => "conflict",
            HarnessErrorKind::Transport => "transport",
            HarnessErrorKind::Timeout => "timeout",
            HarnessErrorKind::Rejected => "rejected",
            HarnessErrorKind::Protocol => "protocol",
        }
    }
}

impl fmt::Display for HarnessErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl HarnessError {
    fn new(kind: HarnessErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            session_id: None,
        }
    }

    pub fn conflict(session_id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            status: Some(CONFLICT_STATUS),
            session_id,
            ..Self::new(HarnessErrorKind::Conflict, message)
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(HarnessErrorKind::Transport, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(HarnessErrorKind::Timeout, message)
    }

    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            ..Self::new(HarnessErrorKind::Rejected, message)
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(HarnessErrorKind::Protocol, message)
    }

    pub fn is_conflict(&self) -> bool {
        self.kind == HarnessErrorKind::Conflict
    }

    /// Session id to clean up, for conflicts that name one.
    pub fn conflict_session_id(&self) -> Option<&str> {
        if self.is_conflict() {
            self.session_id.as_deref()
        } else {
            None
        }
    }

    pub fn reason_label(&self) -> &'static str {
        self.kind.label()
    }
}

/// An open harness session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    pub id: String,
}

impl SessionHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Reply to a status query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub active: bool,
    #[serde(default)]
    pub session_id: Option<String>,
}

pub trait HarnessClient: Send + Sync {
    /// Deploy `configs` and open a session.
    fn start(&self, configs: ConfigDocument) -> BoxFuture<'_, HarnessResult<SessionHandle>>;

    /// Run the load test inside an open session; returns the raw result
    /// document (`{"result": {<target>: {...}}}`).
    fn run_test(&self, session: SessionHandle) -> BoxFuture<'_, HarnessResult<JsonValue>>;

    /// Close a session by id.
    fn end(&self, session_id: String) -> BoxFuture<'_, HarnessResult<()>>;

    /// Report whether a session is currently open.
    fn status(&self) -> BoxFuture<'_, HarnessResult<SessionStatus>>;
}

impl<T> HarnessClient for Arc<T>
where
    T: HarnessClient + ?Sized,
{
    fn start(&self, configs: ConfigDocument) -> BoxFuture<'_, HarnessResult<SessionHandle>> {
        self.as_ref().start(configs)
    }

    fn run_test(&self, session: SessionHandle) -> BoxFuture<'_, HarnessResult<JsonValue>> {
        self.as_ref().run_test(session)
    }

    fn end(&self, session_id: String) -> BoxFuture<'_, HarnessResult<()>> {
        self.as_ref().end(session_id)
    }

    fn status(&self) -> BoxFuture<'_, HarnessResult<SessionStatus>> {
        self.as_ref().status()
    }
}

/// End whatever session the harness reports as open.
///
/// Returns the id of the session that was closed, or None when the harness
/// was idle.
pub async fn reset_stale_session<C>(client: &C) -> HarnessResult<Option<String>>
where
    C: HarnessClient + ?Sized,
{
    let status = client.status().await?;
    match (status.active, status.session_id) {
        (true, Some(id)) => {
            info!(session_id = %id, "ending stale session");
            client.end(id.clone()).await?;
            Ok(Some(id))
        }
        (true, None) => Err(HarnessError::protocol(
            "harness reports an active session without an id",
        )),
        (false, _) => {
            info!("no active session");
            Ok(None)
        }
    }
}
