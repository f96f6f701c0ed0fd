use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::Config;
use crate::db::DbClient;
use crate::mailer::EmailClient;
use crate::services::email_queue_service::{self, QueueWorkerConfig};

/// Starts the in-process queue trigger for deployments without an external
/// cron. Disabled when the interval is 0. Overlap with an external trigger
/// is harmless: the claim RPC hands each row to exactly one run.
pub fn start(db: Arc<DbClient>, mailer: Arc<EmailClient>, config: Arc<Config>) {
    let interval_secs = config.email_queue_interval_secs;
    if interval_secs == 0 {
        return;
    }
    info!(interval_secs, "starting email queue scheduler");
    tokio::spawn(async move {
        let cfg = QueueWorkerConfig {
            batch_size: config.email_batch_size,
            max_attempts: config.email_max_attempts,
            app_base_url: config.app_base_url.clone(),
        };
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match email_queue_service::run_once(db.as_ref(), mailer.as_ref(), &cfg).await {
                Ok(report) if report.claimed > 0 => {
                    info!(
                        claimed = report.claimed,
                        sent = report.sent,
                        failed = report.failed,
                        "scheduled email queue run finished"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(error = %format!("{e:#}"), "scheduled email queue run failed"),
            }
        }
    });
}
