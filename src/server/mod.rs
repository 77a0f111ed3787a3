//! Server side of replay: `POST /api/sync`.
//!
//! The client sends every call, first attempt or replay, as a
//! [`RemoteRequest`]. The endpoint checks it against the allow-list in
//! `routes`, forwards it to GitHub through an [`Upstream`] and answers with
//! the upstream JSON or a classified error.

mod routes;
mod upstream;

pub use routes::{ReplayRoute, RouteError, UpstreamCall};
pub use upstream::{GithubUpstream, Upstream};

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::Instrument;

use crate::remote::{RemoteError, RemoteRequest};

#[derive(Clone)]
pub struct AppState {
  upstream: Arc<dyn Upstream>,
}

/// Why a replay request failed, as reported to the client.
#[derive(Debug, Error)]
pub enum ReplayError {
  #[error(transparent)]
  Route(#[from] RouteError),
  #[error(transparent)]
  Upstream(#[from] RemoteError),
}

impl ReplayError {
  fn status(&self) -> StatusCode {
    match self {
      ReplayError::Route(_) => StatusCode::BAD_REQUEST,
      ReplayError::Upstream(RemoteError::Rejected { status, .. }) => {
        StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST)
      }
      ReplayError::Upstream(RemoteError::Server { .. }) => StatusCode::BAD_GATEWAY,
      ReplayError::Upstream(RemoteError::Network(_)) => StatusCode::SERVICE_UNAVAILABLE,
    }
  }

  fn retryable(&self) -> bool {
    match self {
      ReplayError::Route(_) => false,
      ReplayError::Upstream(e) => e.is_retryable(),
    }
  }
}

impl IntoResponse for ReplayError {
  fn into_response(self) -> Response {
    let body = json!({ "error": self.to_string(), "retryable": self.retryable() });
    (self.status(), Json(body)).into_response()
  }
}

pub fn router(upstream: Arc<dyn Upstream>) -> Router {
  Router::new()
    .route("/api/sync", post(sync_handler))
    .route("/api/health", get(health_handler))
    .with_state(AppState { upstream })
}

/// Serve the replay endpoint until `shutdown` resolves.
pub async fn serve<F>(
  listener: TcpListener,
  upstream: Arc<dyn Upstream>,
  shutdown: F,
) -> std::io::Result<()>
where
  F: Future<Output = ()> + Send + 'static,
{
  if let Ok(addr) = listener.local_addr() {
    tracing::info!(%addr, "replay endpoint listening");
  }
  axum::serve(listener, router(upstream))
    .with_graceful_shutdown(shutdown)
    .await
}

/// Validate one request and run it against the upstream.
pub async fn dispatch(upstream: &dyn Upstream, request: &RemoteRequest) -> Result<Value, ReplayError> {
  let span = tracing::info_span!(
    "dispatch",
    op_id = request.id.as_deref().unwrap_or("-"),
    method = %request.method,
    endpoint = %request.endpoint,
  );
  async {
    let route = ReplayRoute::resolve(request.method, &request.endpoint)?;
    let call = route.upstream(request.body.clone())?;
    let value = upstream.call(&call).await?;
    tracing::debug!("upstream call succeeded");
    Ok::<_, ReplayError>(value)
  }
  .instrument(span)
  .await
}

async fn sync_handler(
  State(state): State<AppState>,
  payload: Result<Json<RemoteRequest>, JsonRejection>,
) -> Result<Json<Value>, ReplayError> {
  let Json(request) = payload.map_err(|e| RouteError::InvalidBody(e.body_text()))?;
  match dispatch(state.upstream.as_ref(), &request).await {
    Ok(value) => Ok(Json(value)),
    Err(e) => {
      tracing::warn!(endpoint = %request.endpoint, error = %e, "replay request failed");
      Err(e)
    }
  }
}

async fn health_handler() -> Json<Value> {
  Json(json!({ "status": "ok" }))
}
