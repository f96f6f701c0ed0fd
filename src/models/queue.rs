use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Which transactional message a queue row renders.
///
/// The set mirrors the templates table owned by the database service. Tags
/// we do not recognize decode to `Unknown` so one bad row cannot fail the
/// whole claimed batch; lookup then fails for that row alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    InvoiceNotice,
    Confirmation,
    Approval,
    Rejection,
    AdminNotification,
    AccountUpdated,
    VerificationApproved,
    VerificationRejected,
    #[serde(other)]
    Unknown,
}

impl TemplateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvoiceNotice => "invoice_notice",
            Self::Confirmation => "confirmation",
            Self::Approval => "approval",
            Self::Rejection => "rejection",
            Self::AdminNotification => "admin_notification",
            Self::AccountUpdated => "account_updated",
            Self::VerificationApproved => "verification_approved",
            Self::VerificationRejected => "verification_rejected",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One claimed unit of outbound email work, as returned by the claim RPC.
///
/// The row itself (status transitions, attempt counting, FIFO ordering)
/// is owned by the database service; this is the worker-facing projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub template_type: TemplateKind,
    pub lang: String,
    pub to_email: String,
    #[serde(default)]
    pub to_name: Option<String>,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub attempts: i32,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Subject and bodies for one `(template_type, lang)` pair, with
/// `{{placeholder}}` tokens still in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailTemplate {
    pub subject: String,
    pub body_text: String,
    pub body_html: String,
}
