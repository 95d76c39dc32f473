//! HTTP control surface.
//!
//! Requests pass through an auth stage, then routing, then a handler that
//! calls into the [`Supervisor`] or [`Distributed`]. Every handler answers
//! with an [`Envelope`], except the log and event streams which are plain
//! newline delimited text.

pub mod auth;
mod envelope;

pub use self::envelope::{ApiError, Envelope};

use crate::configs::{AuthConfig, ProgramConfig};
use crate::distributed::{AggregatedStatus, Distributed, NodeStatus, PeerView};
use crate::process::log::LogTail;
use crate::process::types::{Control, ProgramState, StatusEvent};
use crate::supervisor::{ProgramSummary, Supervisor};
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub distributed: Arc<Distributed>,
    /// Ends open log and event streams so the server can drain.
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState, auth: Option<AuthConfig>) -> Router {
    Router::new()
        .route("/api/status", get(health))
        .route("/api/programs", get(list_programs).post(create_program))
        .route(
            "/api/programs/:name",
            get(program_status).delete(remove_program),
        )
        .route("/api/programs/:name/log", get(tail_log))
        .route("/api/programs/:name/:action", post(control_program))
        .route("/api/events", get(events))
        .route("/api/aggregate", get(aggregate))
        .route("/api/peers/:peer", get(query_peer))
        .route(
            "/api/peers/:peer/programs/:name/:action",
            post(forward_command),
        )
        .route(
            "/distributed/status",
            get(node_status).post(receive_report),
        )
        .layer(middleware::from_fn_with_state(
            Arc::new(auth),
            auth::require_auth,
        ))
        .with_state(state)
}

type ApiResult<T> = Result<Envelope<T>, ApiError>;

fn parse_action(action: &str) -> Result<Control, ApiError> {
    action.parse().map_err(ApiError::BadRequest)
}

async fn health() -> Envelope<&'static str> {
    Envelope::ok("ok")
}

async fn list_programs(State(state): State<AppState>) -> Envelope<Vec<ProgramSummary>> {
    Envelope::ok(state.supervisor.list())
}

async fn create_program(
    State(state): State<AppState>,
    payload: Result<Json<ProgramConfig>, JsonRejection>,
) -> ApiResult<ProgramSummary> {
    let Json(config) = payload.map_err(|err| ApiError::BadRequest(err.body_text()))?;
    Ok(Envelope::ok(state.supervisor.create_program(config).await?))
}

async fn program_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<ProgramSummary> {
    Ok(Envelope::ok(state.supervisor.status(&name)?))
}

async fn remove_program(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<String> {
    state.supervisor.remove_program(&name).await?;
    Ok(Envelope::ok(name))
}

async fn control_program(
    State(state): State<AppState>,
    Path((name, action)): Path<(String, String)>,
) -> ApiResult<ProgramState> {
    let control = parse_action(&action)?;
    info!(program = %name, %control, "Control request");
    Ok(Envelope::ok(state.supervisor.control(&name, control).await?))
}

fn default_lines() -> usize {
    100
}

#[derive(Debug, Deserialize)]
struct TailQuery {
    #[serde(default = "default_lines")]
    lines: usize,
    #[serde(default)]
    follow: bool,
}

async fn tail_log(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<TailQuery>,
) -> Result<Response, ApiError> {
    let tail = state
        .supervisor
        .tail_log(&name, query.lines, query.follow)?;
    Ok(text_stream(
        "text/plain; charset=utf-8",
        log_lines(tail),
        state.shutdown,
    ))
}

async fn events(State(state): State<AppState>) -> Response {
    text_stream(
        "application/x-ndjson",
        status_events(state.supervisor.subscribe()),
        state.shutdown,
    )
}

async fn aggregate(State(state): State<AppState>) -> Envelope<AggregatedStatus> {
    Envelope::ok(state.distributed.aggregated())
}

async fn query_peer(
    State(state): State<AppState>,
    Path(peer): Path<String>,
) -> ApiResult<PeerView> {
    Ok(Envelope::ok(state.distributed.query_peer(&peer).await?))
}

async fn forward_command(
    State(state): State<AppState>,
    Path((peer, name, action)): Path<(String, String, String)>,
) -> ApiResult<ProgramState> {
    let control = parse_action(&action)?;
    let result = state
        .distributed
        .forward_command(&peer, &name, control)
        .await?;
    Ok(Envelope::ok(result))
}

async fn node_status(State(state): State<AppState>) -> Envelope<NodeStatus> {
    Envelope::ok(state.distributed.local_status())
}

async fn receive_report(
    State(state): State<AppState>,
    payload: Result<Json<NodeStatus>, JsonRejection>,
) -> ApiResult<bool> {
    let Json(report) = payload.map_err(|err| ApiError::BadRequest(err.body_text()))?;
    if !state.distributed.receive_report(report) {
        return Err(ApiError::BadRequest(format!(
            "report carries this node's id {}",
            state.distributed.node_id()
        )));
    }
    Ok(Envelope::ok(true))
}

fn text_stream(
    content_type: &'static str,
    lines: impl Stream<Item = String> + Send + 'static,
    shutdown: CancellationToken,
) -> Response {
    let lines = lines.take_until(async move { shutdown.cancelled().await });
    let body = Body::from_stream(lines.map(Ok::<_, Infallible>));
    ([(CONTENT_TYPE, content_type)], body).into_response()
}

/// Replayed lines first, then live lines while following.
fn log_lines(tail: LogTail) -> impl Stream<Item = String> + Send + 'static {
    let replay = stream::iter(tail.replay.into_iter().map(|line| line + "\n"));
    let live = stream::unfold(tail.live, |live| async move {
        let mut live = live?;
        loop {
            match live.recv().await {
                Ok(line) => return Some((line, Some(live))),
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "Log follower lagged"),
                Err(RecvError::Closed) => return None,
            }
        }
    });
    replay.chain(live)
}

fn status_events(
    events: broadcast::Receiver<StatusEvent>,
) -> impl Stream<Item = String> + Send + 'static {
    stream::unfold(events, |mut events| async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => return Some((json + "\n", events)),
                    Err(err) => debug!(?err, "Unserializable status event"),
                },
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "Event follower lagged"),
                Err(RecvError::Closed) => return None,
            }
        }
    })
}
