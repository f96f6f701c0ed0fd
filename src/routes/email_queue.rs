use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{error, info};

use super::AppState;
use crate::services::email_queue_service::{self, QueueWorkerConfig};

/// Trigger endpoint for the email queue worker, typically hit by an
/// external cron. Method-agnostic; the shared secret is the only gate and
/// an empty configured secret disables the check.
pub async fn run_email_queue(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let secret = &state.config.cron_secret;
    if !secret.is_empty() {
        let presented = headers
            .get("x-cron-secret")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if presented != secret {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"ok": false, "error": "unauthorized"})),
            )
                .into_response();
        }
    }

    let cfg = QueueWorkerConfig {
        batch_size: state.config.email_batch_size,
        max_attempts: state.config.email_max_attempts,
        app_base_url: state.config.app_base_url.clone(),
    };
    match email_queue_service::run_once(state.db.as_ref(), state.mailer.as_ref(), &cfg).await {
        Ok(report) => {
            info!(
                claimed = report.claimed,
                sent = report.sent,
                failed = report.failed,
                "email queue run finished"
            );
            (
                StatusCode::OK,
                Json(json!({
                    "ok": true,
                    "claimed": report.claimed,
                    "sent": report.sent,
                    "failed": report.failed,
                })),
            )
                .into_response()
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "email queue run failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"ok": false, "error": format!("{e:#}")})),
            )
                .into_response()
        }
    }
}
