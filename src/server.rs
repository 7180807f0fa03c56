//! HTTP and WebSocket front-end
//!
//! | Route          | Purpose                                  |
//! |----------------|------------------------------------------|
//! | `GET /health`  | liveness and which ports are live        |
//! | `POST /run`    | run to completion, return the report     |
//! | `GET /runs`    | recent entries of the run-log            |
//! | `GET /ws/run`  | streaming bridge, one session per socket |

use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::agent::{Capabilities, ResearchAgent, RunOutcome};
use crate::bridge::StreamingBridge;
use crate::config::Config;
use crate::state::ResearchState;
use crate::storage::{RunLog, RunRecord, DEFAULT_LIST_LIMIT};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    agent: ResearchAgent,
    bridge: StreamingBridge,
    run_log: Option<Arc<RunLog>>,
}

impl AppState {
    pub fn new(agent: ResearchAgent, run_log: Option<Arc<RunLog>>) -> Self {
        let mut bridge = StreamingBridge::new(agent.clone());
        if let Some(log) = &run_log {
            bridge = bridge.with_run_log(log.clone());
        }
        Self { agent, bridge, run_log }
    }

    pub fn from_config(config: &Config) -> Self {
        let agent = ResearchAgent::new(Capabilities::from_config(config));
        Self::new(agent, Some(Arc::new(RunLog::new(config.runs_path.clone()))))
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("topic must not be empty")]
    EmptyTopic,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match self {
            ApiError::EmptyTopic => (StatusCode::BAD_REQUEST, "bad_request"),
        };
        let body = Json(json!({ "error": code, "message": self.to_string() }));
        (status, body).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub topic: String,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum RunResponse {
    Report { report: String, messages: Vec<String> },
    State { state: ResearchState },
}

impl From<ResearchState> for RunResponse {
    fn from(state: ResearchState) -> Self {
        let messages = state.messages.iter().map(|m| m.content.clone()).collect();
        match RunOutcome::from(state) {
            RunOutcome::Report(report) => RunResponse::Report { report, messages },
            RunOutcome::State(state) => RunResponse::State { state },
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    pub limit: Option<usize>,
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/run", post(run))
        .route("/runs", get(runs))
        .route("/ws/run", get(ws_run))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let caps = state.agent.capabilities();
    Json(json!({
        "status": "ok",
        "live_completion": caps.live_completion,
        "live_search": caps.live_search,
    }))
}

async fn run(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> Result<Json<RunResponse>, ApiError> {
    let topic = request.topic.trim();
    if topic.is_empty() {
        return Err(ApiError::EmptyTopic);
    }

    let result = state.agent.run(topic).await;

    if let Some(log) = &state.run_log {
        let metadata = json!({ "source": "http", "steps": result.steps_taken });
        let report = result.report().unwrap_or_default();
        if let Err(e) = log.save(topic, report, metadata).await {
            warn!(error = %e, "Failed to save run");
        }
    }

    Ok(Json(RunResponse::from(result)))
}

async fn runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> Json<Vec<RunRecord>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    let records = match &state.run_log {
        Some(log) => log.list(limit).await,
        None => Vec::new(),
    };
    Json(records)
}

async fn ws_run(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| async move {
        state.bridge.serve(socket).await;
    })
}

/// Bind and serve until Ctrl-C.
pub async fn serve(config: &Config) -> std::io::Result<()> {
    let app = router(AppState::from_config(config));
    let listener = tokio::net::TcpListener::bind(config.address()).await?;

    info!(address = %listener.local_addr()?, "Research server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
