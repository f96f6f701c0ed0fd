use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::db::EmailQueueStore;
use crate::mailer::{Mailer, OutboundEmail};
use crate::models::QueueItem;
use crate::services::template_service;

#[derive(Debug, Clone)]
pub struct QueueWorkerConfig {
    pub batch_size: usize,
    pub max_attempts: i32,
    pub app_base_url: String,
}

/// Aggregate outcome of one worker invocation.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct RunReport {
    pub claimed: usize,
    pub sent: usize,
    pub failed: usize,
}

/// Processes one bounded batch of due queue rows.
///
/// The claim RPC has already moved every returned row to `sending` and
/// incremented its attempt counter, so each row must finish here as `sent`
/// or `failed`. Per-row errors are recorded on the row and never abort the
/// batch; only a failed claim is fatal for the invocation.
pub async fn run_once<S, M>(store: &S, mailer: &M, cfg: &QueueWorkerConfig) -> Result<RunReport>
where
    S: EmailQueueStore + Sync,
    M: Mailer + Sync,
{
    let batch = store
        .claim_batch(cfg.batch_size, cfg.max_attempts)
        .await
        .context("claim email batch")?;
    let claimed = batch.len();
    if claimed == 0 {
        return Ok(RunReport { claimed: 0, sent: 0, failed: 0 });
    }
    info!(claimed, "email queue: processing batch");

    let mut sent = 0usize;
    let mut failed = 0usize;
    for item in &batch {
        match deliver(store, mailer, cfg, item).await {
            Ok(()) => match store.mark_sent(&item.id).await {
                Ok(()) => {
                    sent += 1;
                    info!(id = %item.id, template = %item.template_type, to = %item.to_email, "email sent");
                }
                Err(e) => {
                    // The message went out but the row would stay `sending`;
                    // record it as failed so the outcome is never ambiguous.
                    // A later retry may duplicate the send (at-least-once).
                    failed += 1;
                    warn!(id = %item.id, error = %format!("{e:#}"), "sent but status update failed");
                    if let Err(e2) = store.mark_failed(&item.id, "sent but status update failed").await {
                        error!(id = %item.id, error = %format!("{e2:#}"), "could not record row failure");
                    }
                }
            },
            Err(e) => {
                failed += 1;
                let reason = format!("{e:#}");
                warn!(id = %item.id, template = %item.template_type, error = %reason, "email delivery failed");
                if let Err(e2) = store.mark_failed(&item.id, &reason).await {
                    error!(id = %item.id, error = %format!("{e2:#}"), "could not record row failure");
                }
            }
        }
    }

    Ok(RunReport { claimed, sent, failed })
}

async fn deliver<S, M>(store: &S, mailer: &M, cfg: &QueueWorkerConfig, item: &QueueItem) -> Result<()>
where
    S: EmailQueueStore + Sync,
    M: Mailer + Sync,
{
    let template = store
        .template(item.template_type, &item.lang)
        .await?
        .with_context(|| format!("no template for {}/{}", item.template_type, item.lang))?;

    // Templates may embed portal links; the row payload wins on conflict.
    let mut vars = item.payload.clone();
    vars.entry("app_url".to_string())
        .or_insert_with(|| Value::String(cfg.app_base_url.clone()));

    let email = OutboundEmail {
        to_email: item.to_email.clone(),
        to_name: item.to_name.clone(),
        subject: template_service::render(&template.subject, &vars),
        html: template_service::render(&template.body_html, &vars),
        text: template_service::render(&template.body_text, &vars),
    };
    mailer.send(&email).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::models::{EmailTemplate, TemplateKind};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Status {
        Pending,
        Sending,
        Sent,
        Failed,
    }

    struct Row {
        item: QueueItem,
        status: Status,
        last_error: Option<String>,
    }

    /// In-memory stand-in for the database service. Its claim mirrors the
    /// real RPC: atomic mark-sending plus attempt increment, FIFO order,
    /// predicate `pending && attempts < max_attempts`.
    struct MemStore {
        rows: Mutex<Vec<Row>>,
        templates: Vec<(TemplateKind, String, EmailTemplate)>,
        fail_claim: bool,
        fail_mark_sent: bool,
    }

    impl MemStore {
        fn new(items: Vec<QueueItem>) -> Self {
            MemStore {
                rows: Mutex::new(
                    items
                        .into_iter()
                        .map(|item| Row { item, status: Status::Pending, last_error: None })
                        .collect(),
                ),
                templates: vec![(
                    TemplateKind::Confirmation,
                    "en".to_string(),
                    EmailTemplate {
                        subject: "Your purchase, {{name}}".to_string(),
                        body_text: "Hi {{name}}, see {{app_url}}/account".to_string(),
                        body_html: "<p>Hi {{name}}, amount {{amount}}</p>".to_string(),
                    },
                )],
                fail_claim: false,
                fail_mark_sent: false,
            }
        }

        fn status_of(&self, id: &str) -> Status {
            self.rows
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.item.id == id)
                .map(|r| r.status)
                .unwrap()
        }

        fn row_error(&self, id: &str) -> Option<String> {
            self.rows
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.item.id == id)
                .and_then(|r| r.last_error.clone())
        }

        fn attempts_of(&self, id: &str) -> i32 {
            self.rows
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.item.id == id)
                .map(|r| r.item.attempts)
                .unwrap()
        }
    }

    #[async_trait]
    impl EmailQueueStore for MemStore {
        async fn claim_batch(&self, batch_size: usize, max_attempts: i32) -> Result<Vec<QueueItem>> {
            if self.fail_claim {
                anyhow::bail!("database unreachable");
            }
            let mut rows = self.rows.lock().unwrap();
            let mut claimed = Vec::new();
            for row in rows.iter_mut() {
                if claimed.len() == batch_size {
                    break;
                }
                if row.status == Status::Pending && row.item.attempts < max_attempts {
                    row.status = Status::Sending;
                    row.item.attempts += 1;
                    claimed.push(row.item.clone());
                }
            }
            Ok(claimed)
        }

        async fn template(&self, kind: TemplateKind, lang: &str) -> Result<Option<EmailTemplate>> {
            Ok(self
                .templates
                .iter()
                .find(|(k, l, _)| *k == kind && l == lang)
                .map(|(_, _, t)| t.clone()))
        }

        async fn mark_sent(&self, id: &str) -> Result<()> {
            if self.fail_mark_sent {
                anyhow::bail!("status update rejected");
            }
            let mut rows = self.rows.lock().unwrap();
            let row = rows.iter_mut().find(|r| r.item.id == id).unwrap();
            row.status = Status::Sent;
            row.last_error = None;
            Ok(())
        }

        async fn mark_failed(&self, id: &str, error: &str) -> Result<()> {
            let mut rows = self.rows.lock().unwrap();
            let row = rows.iter_mut().find(|r| r.item.id == id).unwrap();
            row.status = Status::Failed;
            row.last_error = Some(error.to_string());
            Ok(())
        }
    }

    /// Mailer that rejects configured recipients and records the rest.
    struct FlakyMailer {
        reject: Vec<String>,
        delivered: Mutex<Vec<OutboundEmail>>,
    }

    impl FlakyMailer {
        fn new(reject: &[&str]) -> Self {
            FlakyMailer {
                reject: reject.iter().map(|s| s.to_string()).collect(),
                delivered: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Mailer for FlakyMailer {
        async fn send(&self, email: &OutboundEmail) -> Result<()> {
            if self.reject.contains(&email.to_email) {
                anyhow::bail!("email provider returned 500");
            }
            self.delivered.lock().unwrap().push(email.clone());
            Ok(())
        }
    }

    fn item(id: &str, to: &str) -> QueueItem {
        QueueItem {
            id: id.to_string(),
            template_type: TemplateKind::Confirmation,
            lang: "en".to_string(),
            to_email: to.to_string(),
            to_name: None,
            payload: json!({"name": "Ana", "amount": "120.50"}).as_object().unwrap().clone(),
            attempts: 0,
            created_at: None,
        }
    }

    fn cfg() -> QueueWorkerConfig {
        QueueWorkerConfig {
            batch_size: 10,
            max_attempts: 3,
            app_base_url: "https://portal.example".to_string(),
        }
    }

    #[tokio::test]
    async fn all_rows_sent_on_happy_path() {
        let store = MemStore::new(vec![item("q-1", "a@example.com"), item("q-2", "b@example.com")]);
        let mailer = FlakyMailer::new(&[]);

        let report = run_once(&store, &mailer, &cfg()).await.unwrap();

        assert_eq!(report.claimed, 2);
        assert_eq!(report.sent, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(store.status_of("q-1"), Status::Sent);
        assert_eq!(store.status_of("q-2"), Status::Sent);
        assert_eq!(mailer.delivered.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn claimed_rows_never_finish_as_sending() {
        let store = MemStore::new(vec![
            item("q-1", "ok@example.com"),
            item("q-2", "down@example.com"),
            item("q-3", "ok2@example.com"),
        ]);
        let mailer = FlakyMailer::new(&["down@example.com"]);

        let report = run_once(&store, &mailer, &cfg()).await.unwrap();

        assert_eq!(report.claimed, 3);
        assert_eq!(report.sent, 2);
        assert_eq!(report.failed, 1);
        for id in ["q-1", "q-2", "q-3"] {
            assert_ne!(store.status_of(id), Status::Sending);
            assert_eq!(store.attempts_of(id), 1, "attempts incremented once per claim");
        }
        assert_eq!(store.status_of("q-2"), Status::Failed);
        assert!(store.row_error("q-2").unwrap().contains("provider"));
    }

    #[tokio::test]
    async fn missing_template_is_a_hard_failure_for_that_row_only() {
        let mut bad = item("q-bad", "x@example.com");
        bad.template_type = TemplateKind::Rejection; // no template seeded
        let store = MemStore::new(vec![bad, item("q-ok", "y@example.com")]);
        let mailer = FlakyMailer::new(&[]);

        let report = run_once(&store, &mailer, &cfg()).await.unwrap();

        assert_eq!(report.sent, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(store.status_of("q-bad"), Status::Failed);
        assert!(store.row_error("q-bad").unwrap().contains("no template"));
        assert_eq!(store.status_of("q-ok"), Status::Sent);
    }

    #[tokio::test]
    async fn rows_at_the_attempt_ceiling_are_not_claimed() {
        let mut exhausted = item("q-old", "a@example.com");
        exhausted.attempts = 3;
        let store = MemStore::new(vec![exhausted, item("q-new", "b@example.com")]);
        let mailer = FlakyMailer::new(&[]);

        let report = run_once(&store, &mailer, &cfg()).await.unwrap();

        assert_eq!(report.claimed, 1);
        assert_eq!(store.status_of("q-old"), Status::Pending);
        assert_eq!(store.attempts_of("q-old"), 3);
        assert_eq!(store.status_of("q-new"), Status::Sent);
    }

    #[tokio::test]
    async fn batch_size_bounds_the_claim() {
        let store = MemStore::new(vec![
            item("q-1", "a@example.com"),
            item("q-2", "b@example.com"),
            item("q-3", "c@example.com"),
        ]);
        let mailer = FlakyMailer::new(&[]);
        let mut small = cfg();
        small.batch_size = 2;

        let report = run_once(&store, &mailer, &small).await.unwrap();

        assert_eq!(report.claimed, 2);
        assert_eq!(store.status_of("q-3"), Status::Pending);
    }

    #[tokio::test]
    async fn claim_failure_aborts_the_invocation() {
        let mut store = MemStore::new(vec![item("q-1", "a@example.com")]);
        store.fail_claim = true;
        let mailer = FlakyMailer::new(&[]);

        let err = run_once(&store, &mailer, &cfg()).await.unwrap_err();
        assert!(format!("{err:#}").contains("claim email batch"));
        assert_eq!(store.status_of("q-1"), Status::Pending);
    }

    #[tokio::test]
    async fn failed_status_update_after_send_counts_as_failed() {
        let mut store = MemStore::new(vec![item("q-1", "a@example.com")]);
        store.fail_mark_sent = true;
        let mailer = FlakyMailer::new(&[]);

        let report = run_once(&store, &mailer, &cfg()).await.unwrap();

        assert_eq!(report.sent, 0);
        assert_eq!(report.failed, 1);
        assert_eq!(store.status_of("q-1"), Status::Failed);
        assert_eq!(mailer.delivered.lock().unwrap().len(), 1, "the email did go out");
    }

    #[tokio::test]
    async fn payload_and_app_url_flow_into_the_rendered_email() {
        let store = MemStore::new(vec![item("q-1", "a@example.com")]);
        let mailer = FlakyMailer::new(&[]);

        run_once(&store, &mailer, &cfg()).await.unwrap();

        let delivered = mailer.delivered.lock().unwrap();
        assert_eq!(delivered[0].subject, "Your purchase, Ana");
        assert_eq!(delivered[0].text, "Hi Ana, see https://portal.example/account");
        assert_eq!(delivered[0].html, "<p>Hi Ana, amount 120.50</p>");
    }

    #[tokio::test]
    async fn payload_app_url_wins_over_config() {
        let mut it = item("q-1", "a@example.com");
        it.payload
            .insert("app_url".to_string(), Value::String("https://override.example".into()));
        let store = MemStore::new(vec![it]);
        let mailer = FlakyMailer::new(&[]);

        run_once(&store, &mailer, &cfg()).await.unwrap();

        let delivered = mailer.delivered.lock().unwrap();
        assert!(delivered[0].text.contains("https://override.example/account"));
    }
}
