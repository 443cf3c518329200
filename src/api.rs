//! HTTP endpoints for publishing and streaming.

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::HubError;
use crate::hub::Hub;
use crate::models::{HubStats, Topic};
use crate::session::StreamSession;
use crate::transport::SseSink;

/// Topic used by the `/publish` and `/stream` routes when none is given.
pub const DEFAULT_TOPIC: &str = "events";

// =============================================================================
// API Types and Responses
// =============================================================================

/// Standard API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub meta: ResponseMeta,
}

#[derive(Debug, Serialize)]
pub struct ResponseMeta {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub version: &'static str,
}

impl ResponseMeta {
    fn now() -> Self {
        Self {
            timestamp: Utc::now(),
            request_id: uuid::Uuid::new_v4().to_string(),
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            meta: ResponseMeta::now(),
        }
    }

    pub fn error(msg: &str) -> ApiResponse<()> {
        ApiResponse {
            success: false,
            data: None,
            error: Some(msg.to_string()),
            meta: ResponseMeta::now(),
        }
    }
}

/// Hub errors rendered as HTTP responses.
pub struct ApiError(HubError);

impl From<HubError> for ApiError {
    fn from(e: HubError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            HubError::InvalidTopic(_) | HubError::InvalidCapacity => StatusCode::BAD_REQUEST,
            HubError::SubscribeAfterShutdown | HubError::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        (status, Json(ApiResponse::<()>::error(&self.0.to_string()))).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Published {
    pub topic: String,
    pub sequence: u64,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub topics: usize,
    pub subscribers: usize,
}

// =============================================================================
// Query Parameters
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub topic: Option<String>,
    pub capacity: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PublishQuery {
    pub topic: Option<String>,
    pub data: Option<String>,
}

// =============================================================================
// App State
// =============================================================================

/// Application state shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub config: Arc<Config>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(hub: Hub, config: Config) -> Self {
        Self {
            hub,
            config: Arc::new(config),
            started_at: Utc::now(),
        }
    }

    fn uptime_seconds(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }
}

// =============================================================================
// Handlers
// =============================================================================

fn publish(state: &AppState, raw_topic: &str, payload: Vec<u8>) -> Result<Json<ApiResponse<Published>>, ApiError> {
    let topic = Topic::parse(raw_topic)?;
    let sequence = state.hub.publish(&topic, payload)?;
    debug!("Published seq {} to {}", sequence, topic);
    Ok(Json(ApiResponse::success(Published {
        topic: topic.to_string(),
        sequence,
    })))
}

/// Publish the request body to a topic.
pub async fn publish_handler(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    body: Bytes,
) -> Result<Json<ApiResponse<Published>>, ApiError> {
    publish(&state, &topic, body.to_vec())
}

/// `POST /publish?topic=`: body is the payload.
pub async fn compat_publish_post_handler(
    State(state): State<AppState>,
    Query(query): Query<PublishQuery>,
    body: Bytes,
) -> Result<Json<ApiResponse<Published>>, ApiError> {
    let topic = query.topic.as_deref().unwrap_or(DEFAULT_TOPIC);
    publish(&state, topic, body.to_vec())
}

/// `GET /publish?topic=&data=`: payload comes from the query string.
pub async fn compat_publish_get_handler(
    State(state): State<AppState>,
    Query(query): Query<PublishQuery>,
) -> Result<Json<ApiResponse<Published>>, ApiError> {
    let topic = query.topic.as_deref().unwrap_or(DEFAULT_TOPIC);
    publish(&state, topic, query.data.unwrap_or_default().into_bytes())
}

/// Open a long-lived event stream for one client.
fn stream(state: &AppState, raw_topic: &str, capacity: Option<usize>) -> Result<Response, ApiError> {
    let topic = Topic::parse(raw_topic)?;
    let capacity = state.config.capacity_for(capacity);

    let mut session = StreamSession::new(state.hub.clone(), topic, capacity);
    let control = session.subscribe()?;
    let session_id = session.id();
    info!("Stream session {} opened on {}", session_id, session.topic());

    let (tx, rx) = mpsc::channel(state.config.sink_buffer);

    // The response body owns `rx`; once the client disconnects it is
    // dropped and `closed()` resolves.
    let watch_tx = tx.clone();
    let watch_control = control.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = watch_tx.closed() => watch_control.cancel(),
            _ = watch_control.token().cancelled() => {}
        }
    });

    tokio::spawn(async move {
        let mut sink = SseSink::new(tx);
        let reason = session.run(&mut sink).await;
        // Releases the watcher and its sender so the body can end.
        control.token().cancel();
        info!("Stream session {} closed: {}", session_id, reason);
    });

    let keep_alive = KeepAlive::new()
        .interval(Duration::from_secs(state.config.keep_alive_secs))
        .text("keep-alive");
    Ok(Sse::new(ReceiverStream::new(rx))
        .keep_alive(keep_alive)
        .into_response())
}

/// Server-Sent Events stream for one topic.
pub async fn stream_handler(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Result<Response, ApiError> {
    stream(&state, &topic, query.capacity)
}

/// `GET /stream?topic=`
pub async fn compat_stream_handler(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Result<Response, ApiError> {
    let topic = query.topic.as_deref().unwrap_or(DEFAULT_TOPIC);
    stream(&state, topic, query.capacity)
}

/// Health check endpoint
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.hub.stats();
    let status = if stats.shutting_down {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    let body = ApiResponse::success(HealthResponse {
        status: if stats.shutting_down { "draining" } else { "healthy" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_seconds(),
        topics: stats.topics.len(),
        subscribers: stats.total_subscribers,
    });
    (status, Json(body))
}

/// Per-topic hub statistics
pub async fn stats_handler(State(state): State<AppState>) -> Json<ApiResponse<HubStats>> {
    Json(ApiResponse::success(state.hub.stats()))
}

// =============================================================================
// Router Builder
// =============================================================================

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/v1/stats", get(stats_handler))
        .route("/api/v1/topics/:topic/events", post(publish_handler))
        .route("/api/v1/topics/:topic/stream", get(stream_handler))
        .route(
            "/publish",
            get(compat_publish_get_handler).post(compat_publish_post_handler),
        )
        .route("/stream", get(compat_stream_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the web server until Ctrl-C, then drain the hub and stop.
pub async fn run_web_server(config: Config, hub: Hub) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.http_port).parse()?;
    let state = AppState::new(hub.clone(), config);
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Web server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutdown requested; draining stream sessions");
            hub.shutdown();
        })
        .await?;

    info!("Web server stopped");
    Ok(())
}
