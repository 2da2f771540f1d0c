//! Callback-mode result delivery
//!
//! An ephemeral HTTP listener on loopback accepts exactly one result POST
//! from the agent. The URL (with its ephemeral port) is handed to the agent
//! through its command line by the caller.
//!
//! Responses: 200 "ok" on first accepted result, 400 with a human-readable
//! reason (malformed JSON, schema violation, invalid request stream), 404
//! for wrong paths, 405 for wrong methods. A schema violation does NOT
//! resolve the result, so the agent may fix its payload and resubmit. The
//! listener shuts down right after the first accepted POST.

use super::payload::{parse_payload, AgentResult, PayloadFormat, ResultSchema};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use corral_foundation::{Error, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::debug;

/// Result submission path.
pub const CALLBACK_PATH: &str = "/agent-result";

struct CallbackState {
    schema: Option<Arc<dyn ResultSchema>>,
    result_tx: Mutex<Option<oneshot::Sender<AgentResult>>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl CallbackState {
    fn trigger_shutdown(&self) {
        if let Ok(mut slot) = self.shutdown_tx.lock() {
            if let Some(tx) = slot.take() {
                let _ = tx.send(());
            }
        }
    }
}

/// A running one-shot callback listener.
pub struct CallbackServer {
    url: String,
    result_rx: oneshot::Receiver<AgentResult>,
    state: Arc<CallbackState>,
    serve_task: tokio::task::JoinHandle<()>,
}

impl CallbackServer {
    /// Bind an ephemeral loopback port and start serving.
    pub async fn start(schema: Option<Arc<dyn ResultSchema>>) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;

        let (result_tx, result_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let state = Arc::new(CallbackState {
            schema,
            result_tx: Mutex::new(Some(result_tx)),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
        });

        let app = Router::new()
            .route(CALLBACK_PATH, post(accept_result))
            .with_state(Arc::clone(&state));

        let serve_task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(err) = serve.await {
                debug!("callback listener ended: {err}");
            }
        });

        let url = format!("http://127.0.0.1:{}{CALLBACK_PATH}", addr.port());
        debug!("callback listener at {url}");

        Ok(Self {
            url,
            result_rx,
            state,
            serve_task,
        })
    }

    /// Full submission URL for the agent's command line.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Await the first accepted result.
    pub async fn recv(&mut self) -> Result<AgentResult> {
        (&mut self.result_rx)
            .await
            .map_err(|_| Error::Channel("callback listener closed without a result".into()))
    }

    /// Harvest a result that already arrived, without waiting. Used by the
    /// runner after process exit to close the submit-then-exit race.
    pub fn try_take(&mut self) -> Option<AgentResult> {
        self.result_rx.try_recv().ok()
    }

    /// Stop the listener. Idempotent.
    pub fn shutdown(&self) {
        self.state.trigger_shutdown();
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        self.state.trigger_shutdown();
        self.serve_task.abort();
    }
}

async fn accept_result(
    State(state): State<Arc<CallbackState>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, String) {
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("json"));
    let format = if is_json {
        PayloadFormat::Json
    } else {
        PayloadFormat::Text
    };

    let value = match parse_payload(&body, format) {
        Ok(value) => value,
        Err(reason) => return (StatusCode::BAD_REQUEST, reason),
    };

    if let Some(schema) = &state.schema {
        if let Err(issue) = schema.validate(&value) {
            // Not resolved: the agent may fix the payload and retry.
            return (StatusCode::BAD_REQUEST, issue);
        }
    }

    let sender = state.result_tx.lock().ok().and_then(|mut slot| slot.take());
    match sender {
        Some(tx) => {
            let _ = tx.send(AgentResult::new(value));
            state.trigger_shutdown();
            (StatusCode::OK, "ok".to_string())
        }
        None => (
            StatusCode::BAD_REQUEST,
            "result already accepted".to_string(),
        ),
    }
}
