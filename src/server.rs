//! HTTP run-control surface.
//!
//! | Route | Effect |
//! |-------|--------|
//! | `POST /run/:mode` | start a run (`{"tests": [...]}` body for `selected`) |
//! | `POST /stop` | stop the active run and return its log |
//! | `GET /progress` | Server-Sent Events with run snapshots |
//! | `GET /tests` | registered test names |
//! | `GET /devices/:host/logs?follow=` | captured log lines for a device |

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::io;
use tracing::{info, warn};

use crate::runner::{RunError, RunMode, Runner};

type Reply = (StatusCode, Json<Value>);

#[derive(Debug, Default, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub tests: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    #[serde(default)]
    pub follow: bool,
    /// Cursor owner for follow reads
    pub caller: Option<String>,
}

pub fn router(runner: Runner) -> Router {
    Router::new()
        .route("/run/:mode", post(start_run))
        .route("/stop", post(stop_run))
        .route("/progress", get(progress))
        .route("/tests", get(list_tests))
        .route("/devices/:host/logs", get(device_logs))
        .with_state(runner)
}

/// Serve the router until the process is interrupted
pub async fn serve(runner: Runner, bind: &str) -> io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "run-control surface listening");
    axum::serve(listener, router(runner))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}

async fn start_run(
    State(runner): State<Runner>,
    Path(mode): Path<String>,
    body: Option<Json<RunRequest>>,
) -> Reply {
    let tests = body.map(|Json(req)| req.tests).unwrap_or_default();
    let mode = match RunMode::from_name(&mode, tests) {
        Ok(mode) => mode,
        Err(e) => return error_reply(StatusCode::BAD_REQUEST, &e),
    };
    let name = mode.name();

    match runner.start(mode).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "started", "mode": name })),
        ),
        Err(RunError::Busy) => (StatusCode::CONFLICT, Json(json!({ "status": "busy" }))),
        Err(e) => {
            warn!(error = %e, "run could not start");
            error_reply(StatusCode::INTERNAL_SERVER_ERROR, &e)
        }
    }
}

async fn stop_run(State(runner): State<Runner>) -> Reply {
    match runner.stop().await {
        Some(status) => (
            StatusCode::OK,
            Json(json!({ "status": "stopped", "result": status.result })),
        ),
        None => (StatusCode::OK, Json(json!({ "status": "idle" }))),
    }
}

async fn progress(
    State(runner): State<Runner>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = runner.events().map(|status| {
        let data = serde_json::to_string(&status).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().data(data))
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

async fn list_tests(State(runner): State<Runner>) -> Reply {
    (StatusCode::OK, Json(json!({ "tests": runner.registry().names() })))
}

async fn device_logs(
    State(runner): State<Runner>,
    Path(host): Path<String>,
    Query(query): Query<LogQuery>,
) -> Reply {
    let caller = query.caller.unwrap_or_else(|| "http".to_string());
    match runner.capture().read(&host, &caller, query.follow).await {
        Ok(records) => {
            let lines: Vec<&str> = records.iter().map(|r| r.line.as_str()).collect();
            (
                StatusCode::OK,
                Json(json!({ "host": host, "follow": query.follow, "records": lines })),
            )
        }
        Err(e) => {
            warn!(host = %host, error = %e, "log read failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "error", "reason": e.to_string() })),
            )
        }
    }
}

fn error_reply(status: StatusCode, error: &RunError) -> Reply {
    (
        status,
        Json(json!({ "status": "error", "reason": error.to_string() })),
    )
}
