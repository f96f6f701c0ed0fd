use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;

/// One rendered message, ready for the provider.
#[derive(Debug, Clone)]
pub struct OutboundEmail {
    pub to_email: String,
    pub to_name: Option<String>,
    pub subject: String,
    pub html: String,
    pub text: String,
}

#[async_trait]
pub trait Mailer {
    async fn send(&self, email: &OutboundEmail) -> Result<()>;
}

/// HTTP email provider client (Resend-style JSON API).
///
/// Provider failures surface as errors so the worker can record them as the
/// row's failure reason. The request timeout bounds each send, keeping one
/// slow delivery from stalling the rest of the batch.
pub struct EmailClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    from: String,
}

impl EmailClient {
    pub fn new(api_url: &str, api_key: &str, from: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .context("build email http client")?;
        Ok(EmailClient {
            http,
            api_url: api_url.to_string(),
            api_key: api_key.to_string(),
            from: from.to_string(),
        })
    }
}

#[async_trait]
impl Mailer for EmailClient {
    async fn send(&self, email: &OutboundEmail) -> Result<()> {
        let body = json!({
            "from": self.from,
            "to": format_recipient(&email.to_email, email.to_name.as_deref()),
            "subject": email.subject,
            "html": email.html,
            "text": email.text,
        });
        let resp = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("email provider request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            anyhow::bail!("email provider returned {status}: {}", truncate(&detail, 300));
        }
        Ok(())
    }
}

/// `Name <addr>` when a display name is present, bare address otherwise.
fn format_recipient(email: &str, name: Option<&str>) -> String {
    match name {
        Some(name) if !name.trim().is_empty() => format!("{} <{}>", name.trim(), email),
        _ => email.to_string(),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
