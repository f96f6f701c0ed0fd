use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::models::{EmailTemplate, QueueItem, TemplateKind};

/// Queue operations the email worker needs from the database service.
///
/// The claim RPC is atomic on the database side: it selects due rows,
/// marks them `sending` and increments `attempts` in one statement, so
/// overlapping worker runs cannot double-claim.
#[async_trait]
pub trait EmailQueueStore {
    async fn claim_batch(&self, batch_size: usize, max_attempts: i32) -> Result<Vec<QueueItem>>;
    async fn template(&self, kind: TemplateKind, lang: &str) -> Result<Option<EmailTemplate>>;
    async fn mark_sent(&self, id: &str) -> Result<()>;
    async fn mark_failed(&self, id: &str, error: &str) -> Result<()>;
}

/// RPC client for the hosted database service.
///
/// Every operation is a named stored procedure under
/// `{base}/rest/v1/rpc/{function}`; row shapes come back as JSON.
pub struct DbClient {
    http: reqwest::Client,
    base_url: String,
    service_key: String,
}

impl DbClient {
    pub fn new(base_url: &str, service_key: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("build database http client")?;
        Ok(DbClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key: service_key.to_string(),
        })
    }

    async fn rpc(&self, function: &str, params: Value) -> Result<Value> {
        let url = format!("{}/rest/v1/rpc/{}", self.base_url, function);
        let resp = self
            .http
            .post(&url)
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
            .json(&params)
            .send()
            .await
            .with_context(|| format!("rpc {function}: request failed"))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .with_context(|| format!("rpc {function}: read response body"))?;
        if !status.is_success() {
            anyhow::bail!("rpc {function}: {status}: {body}");
        }
        if body.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).with_context(|| format!("rpc {function}: decode response"))
    }

    // Public read operations, one per gateway endpoint.

    pub async fn presale_metrics(&self) -> Result<Value> {
        self.rpc("get_presale_metrics", json!({})).await
    }

    pub async fn daily_stats(&self, days: i64) -> Result<Value> {
        self.rpc("get_daily_stats", json!({ "p_days": days })).await
    }

    pub async fn daily_stats_extended(&self, days: i64) -> Result<Value> {
        self.rpc("get_daily_stats_extended", json!({ "p_days": days })).await
    }

    pub async fn wallet_distribution(&self) -> Result<Value> {
        self.rpc("get_wallet_distribution", json!({})).await
    }

    pub async fn recent_batches(&self, limit: i64) -> Result<Value> {
        self.rpc("get_recent_batches", json!({ "p_limit": limit })).await
    }

    pub async fn batch_detail(&self, batch_id: &str) -> Result<Value> {
        self.rpc("get_batch_detail", json!({ "p_batch_id": batch_id })).await
    }

    pub async fn changelog(&self, limit: i64) -> Result<Value> {
        self.rpc("get_changelog", json!({ "p_limit": limit })).await
    }
}

#[async_trait]
impl EmailQueueStore for DbClient {
    async fn claim_batch(&self, batch_size: usize, max_attempts: i32) -> Result<Vec<QueueItem>> {
        let rows = self
            .rpc(
                "claim_email_batch",
                json!({ "p_batch_size": batch_size, "p_max_attempts": max_attempts }),
            )
            .await?;
        if rows.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(rows).context("decode claimed queue rows")
    }

    async fn template(&self, kind: TemplateKind, lang: &str) -> Result<Option<EmailTemplate>> {
        let value = self
            .rpc(
                "get_email_template",
                json!({ "p_template_type": kind.as_str(), "p_lang": lang }),
            )
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        let template = serde_json::from_value(value).context("decode email template")?;
        Ok(Some(template))
    }

    async fn mark_sent(&self, id: &str) -> Result<()> {
        self.rpc("mark_email_sent", json!({ "p_id": id })).await?;
        Ok(())
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<()> {
        self.rpc("mark_email_failed", json!({ "p_id": id, "p_error": error }))
            .await?;
        Ok(())
    }
}
