//! The durable send-queue data model and the store trait the delivery
//! components run against. The daemon talks to a database in
//! production; [`MemoryStore`] is the reference implementation used in
//! dev mode and throughout the test suites.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub mod memory;

pub use memory::MemoryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailStatus {
    Pending,
    Sent,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    Pending,
    Sent,
    Failed,
    PermanentlyFailed,
}

impl SendStatus {
    /// Terminal states are never overwritten, with one exception:
    /// a failed send that later succeeds moves to sent.
    pub fn is_terminal(self) -> bool {
        matches!(self, SendStatus::Sent | SendStatus::PermanentlyFailed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Scheduled,
    Sending,
    Paused,
    Sent,
    Failed,
}

/// Which HTML shell wraps the rendered content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    #[default]
    None,
    Simple,
    Branded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Marketing,
    #[default]
    Transactional,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub confirmed: bool,
}

impl Contact {
    pub fn first_name(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or("")
    }
}

/// A sending identity. The SMTP ingress authenticates submissions
/// against `api_credential`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub api_credential: String,
    pub from_email: String,
    pub from_name: String,
    pub reply_to: String,
}

/// A piece of reusable content. When `sequence_id` is set the template
/// is one step of a drip sequence, ordered by `position` and delayed
/// by `delay_hours` from the previous step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: Uuid,
    pub name: String,
    pub subject: String,
    pub html: String,
    pub kind: TemplateKind,
    /// Transactional templates carry no unsubscribe affordances.
    pub is_transactional: bool,
    pub sequence_id: Option<Uuid>,
    pub position: i32,
    pub delay_hours: i64,
}

/// One sequence or ad-hoc message waiting for the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedEmail {
    pub id: Uuid,
    pub contact_id: Uuid,
    pub template_id: Uuid,
    pub sequence_id: Option<Uuid>,
    pub scheduled_for: DateTime<Utc>,
    pub tracking_token: String,
    pub attempt_count: u32,
    pub status: EmailStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One campaign recipient. At most one row exists per
/// (campaign_id, contact_id); creation goes through
/// [`QueueStore::insert_send_if_absent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignSend {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub contact_id: Uuid,
    pub list_id: Uuid,
    pub tracking_token: String,
    pub status: SendStatus,
    pub retry_count: u32,
    pub failed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    pub subject: String,
    pub html: String,
    pub status: CampaignStatus,
    pub list_ids: Vec<Uuid>,
    pub exclude_list_ids: Vec<Uuid>,
    pub from_name: String,
    pub from_email: String,
    pub reply_to: String,
    pub scheduled_at: DateTime<Utc>,
    pub recipients_count: u32,
    pub sent_count: u32,
}

/// A message accepted over the SMTP ingress. Recorded for status and
/// audit; delivery happens inline rather than through a poller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionalSend {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub recipient: String,
    pub subject: String,
    pub html: String,
    pub tracking_token: String,
    pub message_type: MessageType,
    pub track_opens: bool,
    pub track_clicks: bool,
    pub list: Option<String>,
    pub template: Option<String>,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub status: EmailStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Dispatcher batch row: the queued email joined with what the worker
/// needs to render it.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEmail {
    pub email: QueuedEmail,
    pub contact: Contact,
    pub template: Template,
}

/// Campaign worker batch row: the send joined with the recipient and
/// the campaign content and sender identity.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSend {
    pub send: CampaignSend,
    pub contact: Contact,
    pub campaign_id: Uuid,
    pub subject: String,
    pub html: String,
    pub from_name: String,
    pub from_email: String,
    pub reply_to: String,
}

/// Everything the delivery core asks of the durable queue. All writes
/// must be safe under concurrent callers; `insert_send_if_absent` is
/// the idempotency guard for campaign expansion.
#[async_trait]
pub trait QueueStore: Send + Sync + 'static {
    // Dispatcher path.
    async fn fetch_pending_emails(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PendingEmail>>;
    async fn mark_email_sent(&self, id: Uuid) -> Result<()>;
    async fn mark_email_failed(&self, id: Uuid, error: &str) -> Result<()>;

    // Sequence advancement.
    async fn template_by_id(&self, id: Uuid) -> Result<Option<Template>>;
    async fn next_template(
        &self,
        sequence_id: Uuid,
        after_position: i32,
    ) -> Result<Option<Template>>;
    async fn update_sequence_position(
        &self,
        contact_id: Uuid,
        sequence_id: Uuid,
        position: i32,
    ) -> Result<()>;
    async fn complete_sequence(&self, contact_id: Uuid, sequence_id: Uuid) -> Result<()>;
    async fn enqueue_email(&self, email: QueuedEmail) -> Result<()>;

    // Campaign expansion and delivery.
    async fn due_campaigns(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>>;
    async fn campaign_by_id(&self, id: Uuid) -> Result<Option<Campaign>>;
    async fn update_campaign_status(&self, id: Uuid, status: CampaignStatus) -> Result<()>;
    async fn active_subscribers(&self, list_id: Uuid) -> Result<Vec<Contact>>;
    /// Returns true when the row was created, false when a send for
    /// this (campaign, contact) already existed.
    async fn insert_send_if_absent(&self, send: CampaignSend) -> Result<bool>;
    async fn set_campaign_recipients(&self, id: Uuid, count: u32) -> Result<()>;
    async fn increment_campaign_sent(&self, id: Uuid) -> Result<()>;
    async fn fetch_pending_campaign_sends(&self, limit: usize) -> Result<Vec<PendingSend>>;
    async fn count_pending_sends(&self, campaign_id: Uuid) -> Result<usize>;
    async fn mark_send_sent(&self, id: Uuid) -> Result<()>;
    async fn mark_send_failed(
        &self,
        id: Uuid,
        error: &str,
        failed_at: DateTime<Utc>,
    ) -> Result<()>;
    async fn mark_send_permanently_failed(&self, id: Uuid, error: &str) -> Result<()>;
    /// Increment retry_count and return the new value.
    async fn increment_send_retry(&self, id: Uuid) -> Result<u32>;
    async fn failed_sends_for_retry(&self, limit: usize) -> Result<Vec<PendingSend>>;

    // SMTP ingress.
    async fn tenant_by_credential(&self, credential: &str) -> Result<Option<Tenant>>;
    async fn insert_transactional_send(&self, send: TransactionalSend) -> Result<()>;
    async fn update_transactional_status(
        &self,
        id: Uuid,
        status: EmailStatus,
        error: Option<&str>,
    ) -> Result<()>;

    // Suppression list maintained by the (out of scope) webhook
    // ingester; consulted read-only before every campaign send.
    async fn is_blocked(&self, email: &str) -> Result<bool>;
}
