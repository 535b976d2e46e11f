use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use devjail_core::{Dispatcher, JailError, Request};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Body of `POST /dispatch`.
#[derive(Debug, Deserialize)]
pub struct DispatchBody {
    pub kind: String,
    #[serde(default = "empty_args")]
    pub args: Value,
}

fn empty_args() -> Value {
    json!({})
}

#[derive(Debug)]
pub enum ApiError {
    /// Body, kind or args could not be decoded
    InvalidRequest(String),
    Engine(JailError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let payload = match self {
            ApiError::InvalidRequest(message) => json!({
                "kind": "InvalidRequest",
                "message": message,
            }),
            ApiError::Engine(err) => {
                if matches!(err, JailError::Io { .. }) {
                    tracing::error!(error = %err, "dispatch failed");
                }
                json!(err.to_payload())
            }
        };
        (StatusCode::BAD_REQUEST, Json(json!({ "error": payload }))).into_response()
    }
}

pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/dispatch", post(dispatch))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(dispatcher)
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(dispatcher: Arc<Dispatcher>, host: &str, port: u16, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid bind address {host}:{port}"))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, root = %dispatcher.root().display(), "devjaild listening");

    axum::serve(listener, router(dispatcher))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server encountered an unrecoverable error")?;

    Ok(())
}

async fn dispatch(
    State(dispatcher): State<Arc<Dispatcher>>,
    body: Result<Json<DispatchBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = body.map_err(|rejection| ApiError::InvalidRequest(rejection.body_text()))?;
    let request = Request::from_parts(&body.kind, body.args)
        .map_err(|e| ApiError::InvalidRequest(format!("{}: {e}", body.kind)))?;

    let result = dispatcher.dispatch(request).await.map_err(ApiError::Engine)?;
    Ok(Json(json!({ "result": result })))
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
