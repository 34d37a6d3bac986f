use crate::{
    clock::{Clock, SystemClock},
    config::Config,
    housekeeping,
    live::{sse, LiveSession},
    store::{self, SnapshotStore, StoreError},
};
use anyhow::{Context, Result};
use axum::{
    body::{Bytes, StreamBody},
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use view_api::{normalize, validate_image, CodeError, ImageError, RoomCode, RoomsResponse};

const NO_STORE: &str = "no-cache, no-store";
const EVENT_STREAM: &str = "text/event-stream; charset=utf-8";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SnapshotStore>,
    pub clock: Arc<dyn Clock>,
    pub config: Config,
    /// Parent of every live session's token; cancelled on shutdown.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Open the configured backend against the system clock.
    pub fn new(config: Config) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = store::open(&config, clock.clone())?;
        Ok(Self::with_store(store, clock, config))
    }

    pub fn with_store(store: Arc<dyn SnapshotStore>, clock: Arc<dyn Clock>, config: Config) -> Self {
        Self {
            store,
            clock,
            config,
            shutdown: CancellationToken::new(),
        }
    }
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    let body_limit = state.config.max_body_bytes();
    Router::new()
        .route("/api/health", get(health))
        .route("/api/view", get(list_rooms))
        .route("/api/view/:code", get(get_snapshot).post(put_snapshot))
        .route("/api/view/:code/touch", post(touch_room))
        .route("/api/view/:code/stream", any(stream_snapshot))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// Failures surfaced to HTTP callers as plain-text reasons.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Room code required")]
    InvalidCode(#[from] CodeError),
    #[error("Invalid payload")]
    InvalidBody,
    #[error("{0}")]
    Image(#[from] ImageError),
    #[error("Method not allowed")]
    MethodNotAllowed,
    #[error("Failed to store snapshot")]
    Storage(#[from] StoreError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidCode(_) | ApiError::InvalidBody => StatusCode::BAD_REQUEST,
            ApiError::Image(ImageError::Missing) => StatusCode::BAD_REQUEST,
            ApiError::Image(ImageError::UnsupportedType) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::Image(ImageError::TooLarge) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut resp = (self.status(), self.to_string()).into_response();
        let headers = resp.headers_mut();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(NO_STORE));
        if matches!(self, ApiError::MethodNotAllowed) {
            headers.insert(header::ALLOW, HeaderValue::from_static("GET"));
        }
        resp
    }
}

fn no_store_json<T: Serialize>(value: T) -> Response {
    ([(header::CACHE_CONTROL, NO_STORE)], Json(value)).into_response()
}

fn room_code(raw: &str) -> Result<RoomCode, ApiError> {
    Ok(normalize(raw)?)
}

async fn get_snapshot(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> Result<Response, ApiError> {
    let code = room_code(&raw)?;
    let snapshot = state.store.load(&code).await;
    Ok(no_store_json(snapshot))
}

/// Extract the image from a JSON body, rejecting anything that is not
/// an object with a string `image`.
fn parse_image(body: &[u8]) -> Result<String, ApiError> {
    let value: Value = serde_json::from_slice(body).map_err(|_| ApiError::InvalidBody)?;
    match value.get("image") {
        Some(Value::String(image)) => Ok(image.clone()),
        _ => Err(ImageError::Missing.into()),
    }
}

async fn put_snapshot(
    State(state): State<AppState>,
    Path(raw): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let code = room_code(&raw)?;
    let image = parse_image(&body)?;
    validate_image(&image)?;
    let now = state.clock.now_ms();
    if let Err(e) = state.store.save(&code, Some(image), now).await {
        error!(room = %code, error = %e, "failed to store snapshot");
        return Err(e.into());
    }
    debug!(room = %code, updated_at = now, "snapshot stored");
    Ok(StatusCode::NO_CONTENT)
}

async fn touch_room(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> Result<StatusCode, ApiError> {
    let code = room_code(&raw)?;
    let now = state.clock.now_ms();
    if let Err(e) = state.store.touch(&code, now).await {
        error!(room = %code, error = %e, "failed to touch room");
        return Err(e.into());
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn list_rooms(State(state): State<AppState>) -> Response {
    let rooms = match state.store.list_active().await {
        Ok(rooms) => rooms,
        Err(e) => {
            warn!(error = %e, "listing active rooms failed; answering empty");
            Vec::new()
        }
    };
    no_store_json(RoomsResponse { rooms })
}

async fn stream_snapshot(
    State(state): State<AppState>,
    method: Method,
    Path(raw): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let code = room_code(&raw)?;
    if method != Method::GET {
        return Err(ApiError::MethodNotAllowed);
    }
    if !state.config.streaming {
        let snapshot = state.store.load(&code).await;
        return Ok(no_store_json(snapshot));
    }

    let force_fast = params.get("fast").map(String::as_str) == Some("1")
        || params.get("mode").map(String::as_str) == Some("live");
    let session = LiveSession::new(
        state.store.clone(),
        state.clock.clone(),
        code.clone(),
        state.config.stream,
        force_fast,
    );
    let cancel = state.shutdown.child_token();
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let reason = session.run(tx, cancel).await;
            debug!(room = %code, ?reason, "live session closed");
        }
    });

    // dropping the body (client gone) cancels the session
    let guard = cancel.drop_guard();
    let events = ReceiverStream::new(rx).map(move |event| {
        let _ = &guard;
        sse::encode(&event)
    });
    Ok((
        [
            (header::CONTENT_TYPE, EVENT_STREAM),
            (header::CACHE_CONTROL, NO_STORE),
        ],
        StreamBody::new(events),
    )
        .into_response())
}

/// Run the HTTP server until ctrl-c, sweeping expired entries in the background.
pub async fn run_http_server(config: Config) -> Result<()> {
    let addr: SocketAddr = config
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.bind))?;
    let state = AppState::new(config)?;
    let sweeper = housekeeping::spawn(state.store.clone(), state.config.storage.housekeeping);
    let shutdown = state.shutdown.clone();
    info!(%addr, backend = ?state.store.backend(), "view server listening");
    axum::Server::bind(&addr)
        .serve(build_router(state).into_make_service())
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
            shutdown.cancel();
        })
        .await?;
    sweeper.abort();
    Ok(())
}
