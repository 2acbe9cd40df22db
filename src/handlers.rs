//! HTTP surface: session listing and the SSE attach endpoint.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::debug;

use crate::session_info::{SessionInfo, SessionInfoStore};
use crate::sse::{ChannelSink, SseSink};
use crate::stream_watcher::StreamWatcher;

#[derive(Clone)]
pub struct AppState {
    pub streams: StreamWatcher,
    pub info_store: SessionInfoStore,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/:session_id/stream", get(stream_session))
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(&'static str),
    Internal,
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, what),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
        };
        (status, Json(ApiErrorBody { error })).into_response()
    }
}

#[derive(Debug, Serialize)]
struct SessionEntry {
    session_id: String,
    #[serde(flatten)]
    info: SessionInfo,
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionEntry>> {
    let store = state.info_store.clone();
    let sessions = tokio::task::spawn_blocking(move || store.list())
        .await
        .unwrap_or_default();
    Json(
        sessions
            .into_iter()
            .map(|(session_id, info)| SessionEntry { session_id, info })
            .collect(),
    )
}

/// Attach the caller as an SSE subscriber of one session's stream. The body
/// is fed by the stream core; dropping it (client disconnect or exit event)
/// detaches exactly once via the guard owned by the body stream.
async fn stream_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    if !state.info_store.session_dir(&session_id).is_dir() {
        return Err(ApiError::NotFound("unknown session"));
    }

    let stream_path = state.info_store.stream_path(&session_id);
    let (sink, rx) = ChannelSink::new();
    let sink: Arc<dyn SseSink> = sink;
    state
        .streams
        .attach(&session_id, &stream_path, sink.clone())
        .await;

    let guard = DetachOnDrop {
        streams: state.streams.clone(),
        session_id,
        sink,
    };
    let body = Body::from_stream(UnboundedReceiverStream::new(rx).map(move |chunk| {
        let _keep_alive = &guard;
        Ok::<_, Infallible>(chunk)
    }));

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("x-accel-buffering", "no")
        .body(body)
        .map_err(|_| ApiError::Internal)
}

/// Issues the one `detach` owed for a successful `attach`, whichever way the
/// response body ends.
struct DetachOnDrop {
    streams: StreamWatcher,
    session_id: String,
    sink: Arc<dyn SseSink>,
}

impl Drop for DetachOnDrop {
    fn drop(&mut self) {
        debug!(session = %self.session_id, "sse stream closed, detaching subscriber");
        let streams = self.streams.clone();
        let session_id = std::mem::take(&mut self.session_id);
        let sink = self.sink.clone();
        tokio::spawn(async move {
            streams.detach(&session_id, &sink).await;
        });
    }
}
