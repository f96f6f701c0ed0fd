use std::sync::Arc;

use anyhow::Result;
use axum::routing::{any, get};
use axum::Router;

use crate::config::Config;
use crate::db::DbClient;
use crate::mailer::EmailClient;
use crate::rate_limit::RateLimiter;

pub mod email_queue;
pub mod public;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbClient>,
    pub mailer: Arc<EmailClient>,
    pub limiter: Arc<RateLimiter>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let db = Arc::new(DbClient::new(&config.database_url, &config.database_service_key)?);
        let mailer = Arc::new(EmailClient::new(
            &config.email_api_url,
            &config.email_api_key,
            &config.email_from,
        )?);
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit_max_requests,
            config.rate_limit_window_ms,
        ));
        Ok(AppState { db, mailer, limiter, config: Arc::new(config) })
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        // Version parsing and method gating happen inside the handler, so
        // the whole /public surface funnels through one entry point.
        .route("/public/*path", any(public::public_entry))
        .route("/internal/email-queue/run", any(email_queue::run_email_queue))
        .with_state(state)
}
