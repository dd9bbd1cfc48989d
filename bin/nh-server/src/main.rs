//! NotifyHub HTTP façade.
//!
//! Endpoints:
//! - `POST /send`    - one message in, one receipt out
//! - `POST /batch`   - a list of messages, one receipt each
//! - `GET  /health`  - aggregated connector health (503 when unhealthy)
//! - `GET  /metrics` - retry statistics, queue stats and circuit states
//!
//! Connectors come from the environment (`NH_WEBHOOK_URL`,
//! `NH_FEISHU_URL`/`NH_FEISHU_SECRET`, `NH_SMTP_*`); with none set, a
//! mock connector named `mock` is mounted for smoke use.

use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use nh_common::{ErrorCategory, ErrorCode, NotifyError};
use nh_sdk::{Client, ClientOptions, Message, Receipt};

#[derive(Debug, Error)]
enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("bind failed: {0}")]
    Bind(#[from] std::io::Error),
}

#[derive(Clone)]
struct AppState {
    client: Client,
}

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Assemble client options from the environment.
fn options_from_env() -> Result<ClientOptions, ServerError> {
    let mut options = ClientOptions::new();
    let mut configured = false;

    if let Some(url) = env("NH_WEBHOOK_URL") {
        options = options.with_webhook_basic(url);
        configured = true;
    }
    if let Some(url) = env("NH_FEISHU_URL") {
        options = options.with_feishu_webhook(url, env("NH_FEISHU_SECRET"));
        configured = true;
    }
    if let Some(host) = env("NH_SMTP_HOST") {
        let port = env("NH_SMTP_PORT")
            .map(|p| p.parse::<u16>())
            .transpose()
            .map_err(|e| ServerError::Config(format!("NH_SMTP_PORT: {e}")))?
            .unwrap_or(587);
        options = options.with_email_smtp(
            host,
            port,
            env("NH_SMTP_USER").unwrap_or_default(),
            env("NH_SMTP_PASS").unwrap_or_default(),
            env("NH_SMTP_FROM")
                .ok_or_else(|| ServerError::Config("NH_SMTP_FROM is required with NH_SMTP_HOST".into()))?,
        );
        configured = true;
    }
    if !configured {
        info!("no connectors configured, mounting mock connector 'mock'");
        options = options.with_mock_notifier("mock");
    }

    if let Some(secs) = env("NH_TIMEOUT_SECS") {
        let secs: u64 = secs
            .parse()
            .map_err(|e| ServerError::Config(format!("NH_TIMEOUT_SECS: {e}")))?;
        options = options.with_timeout(Duration::from_secs(secs));
    }
    if let (Some(buffer), Some(workers)) = (env("NH_QUEUE_BUFFER"), env("NH_QUEUE_WORKERS")) {
        let buffer: usize = buffer
            .parse()
            .map_err(|e| ServerError::Config(format!("NH_QUEUE_BUFFER: {e}")))?;
        let workers: usize = workers
            .parse()
            .map_err(|e| ServerError::Config(format!("NH_QUEUE_WORKERS: {e}")))?;
        options = options.with_queue(buffer, workers);
    }

    Ok(options)
}

/// Deterministic mapping from error code categories to HTTP statuses.
fn status_for(code: ErrorCode) -> StatusCode {
    match code.category() {
        ErrorCategory::Validation
        | ErrorCategory::Message
        | ErrorCategory::Configuration
        | ErrorCategory::Template => StatusCode::BAD_REQUEST,
        ErrorCategory::Queue => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCategory::Network | ErrorCategory::Platform => StatusCode::BAD_GATEWAY,
        ErrorCategory::System => {
            if code.is_retryable() {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// API error body: the structured error with whitelisted context only.
fn error_body(error: &NotifyError) -> Value {
    let mut body = error.to_json();
    body["context"] = json!(error.api_context());
    json!({ "error": body })
}

fn receipt_status(receipt: &Receipt) -> StatusCode {
    if receipt.results.is_empty() || receipt.all_succeeded() {
        StatusCode::OK
    } else if receipt.all_failed() {
        StatusCode::BAD_GATEWAY
    } else {
        StatusCode::MULTI_STATUS
    }
}

async fn send(
    State(state): State<AppState>,
    Json(message): Json<Message>,
) -> (StatusCode, Json<Value>) {
    match state.client.send(message).await {
        Ok(receipt) => (receipt_status(&receipt), Json(json!(receipt))),
        Err(error) => (status_for(error.code), Json(error_body(&error))),
    }
}

async fn batch(
    State(state): State<AppState>,
    Json(messages): Json<Vec<Message>>,
) -> (StatusCode, Json<Value>) {
    match state.client.send_batch(messages).await {
        Ok(receipts) => {
            let status = if receipts.iter().all(Receipt::all_succeeded) {
                StatusCode::OK
            } else {
                StatusCode::MULTI_STATUS
            };
            (status, Json(json!({ "receipts": receipts })))
        }
        Err(error) => (status_for(error.code), Json(error_body(&error))),
    }
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.client.health().await {
        Ok(snapshot) => {
            let status = if snapshot.is_healthy() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            (status, Json(json!(snapshot)))
        }
        Err(error) => (status_for(error.code), Json(error_body(&error))),
    }
}

async fn metrics(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "retry": state.client.statistics(),
        "queue": state.client.queue_stats(),
        "circuits": state.client.circuit_states(),
        "recommendations": state.client.recommendations(),
    }))
}

fn router(client: Client) -> Router {
    Router::new()
        .route("/send", post(send))
        .route("/batch", post(batch))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { client })
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    nh_common::logging::init_logging("nh-server");

    let options = options_from_env()?;
    let client = Client::new(options).map_err(|e| ServerError::Config(e.to_string()))?;

    let listen = env("NH_LISTEN").unwrap_or_else(|| "127.0.0.1:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!(listen = %listen, "nh-server listening");

    let app = router(client.clone());
    let result = axum::serve(listener, app).await;

    if let Err(e) = client.close().await {
        error!(error = %e, "client close failed during shutdown");
    }
    result.map_err(ServerError::Bind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_categories() {
        assert_eq!(status_for(ErrorCode::ValidationFailed), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorCode::NoValidTarget), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorCode::QueueFull), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(ErrorCode::ConnectionFailed), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for(ErrorCode::Cancelled), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(ErrorCode::InternalError), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn error_body_whitelists_context() {
        let error = NotifyError::new(ErrorCode::PlatformSendFailed, "boom")
            .with_context("platform", "email")
            .with_context("secret_detail", "hidden");
        let body = error_body(&error);
        assert_eq!(body["error"]["context"]["platform"], "email");
        assert!(body["error"]["context"].get("secret_detail").is_none());
    }
}
