use crate::cluster::{HorizontalScaler, LoadBalancer, ServiceDiscovery};
use crate::images::ImageRegistry;
use crate::network::NetworkManager;
use crate::resources::ResourceManager;
use crate::vnc::VncManager;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub mod model;
pub mod routes;

pub use routes::routes;

pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// API error rendered as `{"detail": "..."}` with the matching status.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl ApiError {
    pub fn bad_request(detail: impl ToString) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.to_string(),
        }
    }

    pub fn not_found(detail: impl ToString) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            detail: detail.to_string(),
        }
    }

    pub fn internal(detail: impl ToString) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: detail.to_string(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        Self::internal(value)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "detail": self.detail })),
        )
            .into_response()
    }
}

/// Request counter backing the `requests_per_second` metric.
pub struct RequestStats {
    started: Instant,
    requests: AtomicU64,
}

impl Default for RequestStats {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            requests: AtomicU64::new(0),
        }
    }
}

impl RequestStats {
    pub fn record(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests_per_second(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            0.0
        } else {
            self.requests.load(Ordering::Relaxed) as f64 / elapsed
        }
    }
}

/// Counts every API request for the `requests_per_second` metric.
pub async fn track_requests(
    State(state): State<RouterState>,
    request: Request,
    next: Next,
) -> Response {
    state.stats.record();
    next.run(request).await
}

/// Shared handler state; every manager is constructed once at process init.
#[derive(Clone)]
pub struct RouterState {
    pub resources: Arc<ResourceManager>,
    pub network: Arc<NetworkManager>,
    pub images: Arc<ImageRegistry>,
    pub vnc: Arc<VncManager>,
    pub discovery: Arc<ServiceDiscovery>,
    pub balancer: Arc<LoadBalancer>,
    pub scaler: Arc<HorizontalScaler>,
    pub stats: Arc<RequestStats>,
}
