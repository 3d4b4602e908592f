//! Checkpoint / progress channel.
//!
//! During remote script execution a worker emits structured messages back
//! to the orchestrator over an abstract bidirectional transport. Two
//! message subtypes matter:
//!
//! - `rexx-require`: the worker asks the director to resolve a dynamic
//!   library. The router resolves it (local file or HTTPS fetch from the
//!   fixed library origin) and answers with `rexx-require-response`.
//!   Resolution failure is carried **inside** the response
//!   (`success: false`); the enclosing deployment call never throws.
//! - anything else: an ordinary progress update, appended to the session's
//!   result list tagged `source: "remote"` and handed to the registered
//!   progress callback. Progress messages must never reach the resolver.

use crate::constants::LIBRARY_ORIGIN;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Message type discriminator for library resolution requests.
pub const REQUIRE_TYPE: &str = "rexx-require";
/// Message type discriminator for library resolution responses.
pub const REQUIRE_RESPONSE_TYPE: &str = "rexx-require-response";

// =============================================================================
// Messages
// =============================================================================

/// Payload of a `rexx-require` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequireRequest {
    /// Library the worker wants loaded.
    pub library_name: String,
    /// Correlation id echoed back in the response.
    pub require_id: String,
}

/// One progress record kept in a checkpoint session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    /// The raw message as received.
    pub message: Value,
    /// Where the record came from; remote worker messages are `"remote"`.
    pub source: String,
    /// Arrival time.
    pub received_at: DateTime<Utc>,
}

/// Lifecycle of a checkpoint session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Session is relaying messages.
    Active,
    /// Transport closed; no more messages will arrive.
    Closed,
}

/// One worker's progress/require session.
#[derive(Debug)]
pub struct CheckpointSession {
    /// Session identifier (typically the deployment target name).
    pub id: String,
    /// Ordered progress records received so far.
    pub records: Vec<ProgressRecord>,
    /// Current status.
    pub status: SessionStatus,
}

impl CheckpointSession {
    /// Opens a session.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            records: Vec::new(),
            status: SessionStatus::Active,
        }
    }
}

/// Callback invoked for every progress message: `(checkpoint_key, values)`.
pub type ProgressCallback = Box<dyn Fn(&str, &Value) + Send + Sync>;

// =============================================================================
// Library Resolution
// =============================================================================

/// Resolves library names for the remote require protocol.
///
/// Names containing a path separator or a `.rexx` suffix are read from
/// the local filesystem relative to the configured root; anything else is
/// fetched over HTTPS from the fixed library-hosting origin.
pub struct LibraryResolver {
    root: PathBuf,
    origin: String,
    client: reqwest::Client,
}

impl LibraryResolver {
    /// Creates a resolver rooted at `root` with the default origin.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            origin: LIBRARY_ORIGIN.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Overrides the library-hosting origin (tests point this at a local
    /// server).
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// True if the name resolves against the local filesystem.
    pub fn is_local(name: &str) -> bool {
        name.contains('/') || name.ends_with(".rexx")
    }

    /// Resolves a library to its source text.
    pub async fn resolve(&self, name: &str) -> Result<String> {
        if Self::is_local(name) {
            let path = self.root.join(name);
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => {}
                _ => return Err(Error::LibraryNotFound(path.display().to_string())),
            }
            return Ok(tokio::fs::read_to_string(&path).await?);
        }

        let url = format!("{}/{}.rexx", self.origin, name);
        debug!(library = name, url = %url, "fetching registry-hosted library");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::LibraryFetchFailed {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(Error::LibraryFetchFailed {
                name: name.to_string(),
                reason: format!("HTTP {}", response.status().as_u16()),
            });
        }
        response
            .text()
            .await
            .map_err(|e| Error::LibraryFetchFailed {
                name: name.to_string(),
                reason: e.to_string(),
            })
    }
}

// =============================================================================
// Routing
// =============================================================================

/// Routes incoming checkpoint messages for one session.
pub struct CheckpointRouter {
    resolver: LibraryResolver,
    callback: Option<ProgressCallback>,
    session: CheckpointSession,
}

impl CheckpointRouter {
    /// Creates a router for a session.
    pub fn new(session_id: impl Into<String>, resolver: LibraryResolver) -> Self {
        Self {
            resolver,
            callback: None,
            session: CheckpointSession::new(session_id),
        }
    }

    /// Registers the progress callback.
    pub fn set_callback(&mut self, callback: ProgressCallback) {
        self.callback = Some(callback);
    }

    /// The session's accumulated state.
    pub fn session(&self) -> &CheckpointSession {
        &self.session
    }

    /// Marks the session closed.
    pub fn close(&mut self) {
        self.session.status = SessionStatus::Closed;
    }

    /// Routes one incoming message.
    ///
    /// Require requests produce the response message to send back; every
    /// other message is recorded as progress and produces nothing.
    /// Resolution failures are folded into the response — this method
    /// never fails on a worker-supplied message.
    pub async fn route(&mut self, message: Value) -> Option<Value> {
        let msg_type = message.get("type").and_then(Value::as_str);
        if msg_type == Some(REQUIRE_TYPE) {
            return Some(self.handle_require(&message).await);
        }

        let key = message
            .get("key")
            .and_then(Value::as_str)
            .unwrap_or("progress")
            .to_string();
        self.session.records.push(ProgressRecord {
            message: message.clone(),
            source: "remote".to_string(),
            received_at: Utc::now(),
        });
        if let Some(callback) = &self.callback {
            callback(&key, &message);
        }
        None
    }

    async fn handle_require(&self, message: &Value) -> Value {
        let request: RequireRequest =
            match serde_json::from_value(message.get("data").cloned().unwrap_or(Value::Null)) {
                Ok(req) => req,
                Err(e) => {
                    warn!(error = %e, "malformed require request");
                    return json!({
                        "type": REQUIRE_RESPONSE_TYPE,
                        "requireId": message
                            .get("data")
                            .and_then(|d| d.get("requireId"))
                            .cloned()
                            .unwrap_or(Value::Null),
                        "success": false,
                        "error": format!("malformed require request: {}", e),
                    });
                }
            };

        match self.resolver.resolve(&request.library_name).await {
            Ok(source) => json!({
                "type": REQUIRE_RESPONSE_TYPE,
                "requireId": request.require_id,
                "success": true,
                "payload": source,
            }),
            Err(e) => {
                debug!(library = %request.library_name, error = %e, "library resolution failed");
                json!({
                    "type": REQUIRE_RESPONSE_TYPE,
                    "requireId": request.require_id,
                    "success": false,
                    "error": e.to_string(),
                })
            }
        }
    }
}

// =============================================================================
// Transport
// =============================================================================

/// Abstract bidirectional message transport between director and worker.
#[async_trait]
pub trait CheckpointTransport: Send + Sync {
    /// Sends a message to the peer.
    async fn send(&self, message: Value) -> Result<()>;

    /// Receives the next message; `None` when the peer closed.
    async fn recv(&self) -> Result<Option<Value>>;
}

/// In-process transport over a pair of tokio channels.
///
/// Used by tests and by local workers sharing the director's process.
pub struct ChannelTransport {
    tx: mpsc::Sender<Value>,
    rx: Mutex<mpsc::Receiver<Value>>,
}

impl ChannelTransport {
    /// Creates two cross-wired endpoints.
    pub fn pair(capacity: usize) -> (ChannelTransport, ChannelTransport) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (
            ChannelTransport {
                tx: a_tx,
                rx: Mutex::new(b_rx),
            },
            ChannelTransport {
                tx: b_tx,
                rx: Mutex::new(a_rx),
            },
        )
    }
}

#[async_trait]
impl CheckpointTransport for ChannelTransport {
    async fn send(&self, message: Value) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| Error::Internal("checkpoint peer closed".to_string()))
    }

    async fn recv(&self) -> Result<Option<Value>> {
        Ok(self.rx.lock().await.recv().await)
    }
}

/// Drives a router against a transport until the peer closes.
///
/// Require responses are sent back over the same transport; progress
/// messages accumulate in the router's session.
pub async fn serve(router: &mut CheckpointRouter, transport: &dyn CheckpointTransport) -> Result<()> {
    while let Some(message) = transport.recv().await? {
        if let Some(response) = router.route(message).await {
            transport.send(response).await?;
        }
    }
    router.close();
    Ok(())
}
