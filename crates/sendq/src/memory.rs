//! In-memory [`QueueStore`]: a single mutex over plain maps. Fast
//! enough for dev mode and deterministic for tests; the production
//! deployment points the daemon at a real database instead.

use crate::{
    Campaign, CampaignSend, CampaignStatus, Contact, EmailStatus, PendingEmail, PendingSend,
    QueueStore, QueuedEmail, SendStatus, Template, Tenant, TransactionalSend,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

#[derive(Default)]
struct SequenceState {
    position: i32,
    completed: bool,
}

#[derive(Default)]
struct Inner {
    emails: HashMap<Uuid, QueuedEmail>,
    contacts: HashMap<Uuid, Contact>,
    templates: HashMap<Uuid, Template>,
    campaigns: HashMap<Uuid, Campaign>,
    sends: HashMap<Uuid, CampaignSend>,
    /// (campaign_id, contact_id) pairs that already have a send row.
    send_index: HashSet<(Uuid, Uuid)>,
    /// list id -> subscribed contact ids.
    list_members: HashMap<Uuid, Vec<Uuid>>,
    /// (contact_id, sequence_id) -> progress.
    sequences: HashMap<(Uuid, Uuid), SequenceState>,
    tenants: Vec<Tenant>,
    transactional: Vec<TransactionalSend>,
    blocklist: HashSet<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Seeding helpers for dev mode and tests.

    pub fn add_contact(&self, contact: Contact) {
        self.inner.lock().contacts.insert(contact.id, contact);
    }

    pub fn add_template(&self, template: Template) {
        self.inner.lock().templates.insert(template.id, template);
    }

    pub fn add_campaign(&self, campaign: Campaign) {
        self.inner.lock().campaigns.insert(campaign.id, campaign);
    }

    pub fn add_tenant(&self, tenant: Tenant) {
        self.inner.lock().tenants.push(tenant);
    }

    pub fn subscribe(&self, list_id: Uuid, contact_id: Uuid) {
        self.inner
            .lock()
            .list_members
            .entry(list_id)
            .or_default()
            .push(contact_id);
    }

    pub fn block(&self, email: &str) {
        self.inner.lock().blocklist.insert(email.to_ascii_lowercase());
    }

    // Read-back helpers for assertions.

    pub fn email(&self, id: Uuid) -> Option<QueuedEmail> {
        self.inner.lock().emails.get(&id).cloned()
    }

    pub fn send(&self, id: Uuid) -> Option<CampaignSend> {
        self.inner.lock().sends.get(&id).cloned()
    }

    pub fn campaign(&self, id: Uuid) -> Option<Campaign> {
        self.inner.lock().campaigns.get(&id).cloned()
    }

    pub fn sends_for_campaign(&self, campaign_id: Uuid) -> Vec<CampaignSend> {
        let mut sends: Vec<_> = self
            .inner
            .lock()
            .sends
            .values()
            .filter(|send| send.campaign_id == campaign_id)
            .cloned()
            .collect();
        sends.sort_by_key(|send| send.created_at);
        sends
    }

    pub fn transactional_sends(&self) -> Vec<TransactionalSend> {
        self.inner.lock().transactional.clone()
    }

    pub fn sequence_progress(&self, contact_id: Uuid, sequence_id: Uuid) -> Option<(i32, bool)> {
        self.inner
            .lock()
            .sequences
            .get(&(contact_id, sequence_id))
            .map(|state| (state.position, state.completed))
    }
}

fn join_send(inner: &Inner, send: &CampaignSend) -> Option<PendingSend> {
    let contact = inner.contacts.get(&send.contact_id)?;
    let campaign = inner.campaigns.get(&send.campaign_id)?;
    Some(PendingSend {
        send: send.clone(),
        contact: contact.clone(),
        campaign_id: campaign.id,
        subject: campaign.subject.clone(),
        html: campaign.html.clone(),
        from_name: campaign.from_name.clone(),
        from_email: campaign.from_email.clone(),
        reply_to: campaign.reply_to.clone(),
    })
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn fetch_pending_emails(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PendingEmail>> {
        let inner = self.inner.lock();
        let mut due: Vec<_> = inner
            .emails
            .values()
            .filter(|email| email.status == EmailStatus::Pending && email.scheduled_for <= before)
            .collect();
        due.sort_by_key(|email| email.scheduled_for);
        Ok(due
            .into_iter()
            .take(limit)
            .filter_map(|email| {
                let contact = inner.contacts.get(&email.contact_id)?;
                let template = inner.templates.get(&email.template_id)?;
                Some(PendingEmail {
                    email: email.clone(),
                    contact: contact.clone(),
                    template: template.clone(),
                })
            })
            .collect())
    }

    async fn mark_email_sent(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(email) = inner.emails.get_mut(&id) {
            if email.status != EmailStatus::Sent {
                email.status = EmailStatus::Sent;
                email.last_error = None;
            }
        }
        Ok(())
    }

    async fn mark_email_failed(&self, id: Uuid, error: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(email) = inner.emails.get_mut(&id) {
            if email.status != EmailStatus::Sent {
                email.status = EmailStatus::Failed;
                email.attempt_count += 1;
                email.last_error = Some(error.to_string());
            }
        }
        Ok(())
    }

    async fn template_by_id(&self, id: Uuid) -> Result<Option<Template>> {
        Ok(self.inner.lock().templates.get(&id).cloned())
    }

    async fn next_template(
        &self,
        sequence_id: Uuid,
        after_position: i32,
    ) -> Result<Option<Template>> {
        let inner = self.inner.lock();
        Ok(inner
            .templates
            .values()
            .filter(|template| {
                template.sequence_id == Some(sequence_id) && template.position > after_position
            })
            .min_by_key(|template| template.position)
            .cloned())
    }

    async fn update_sequence_position(
        &self,
        contact_id: Uuid,
        sequence_id: Uuid,
        position: i32,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = inner
            .sequences
            .entry((contact_id, sequence_id))
            .or_default();
        state.position = position;
        Ok(())
    }

    async fn complete_sequence(&self, contact_id: Uuid, sequence_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .sequences
            .entry((contact_id, sequence_id))
            .or_default()
            .completed = true;
        Ok(())
    }

    async fn enqueue_email(&self, email: QueuedEmail) -> Result<()> {
        self.inner.lock().emails.insert(email.id, email);
        Ok(())
    }

    async fn due_campaigns(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>> {
        let inner = self.inner.lock();
        let mut due: Vec<_> = inner
            .campaigns
            .values()
            .filter(|campaign| {
                campaign.status == CampaignStatus::Scheduled && campaign.scheduled_at <= now
            })
            .cloned()
            .collect();
        due.sort_by_key(|campaign| campaign.scheduled_at);
        Ok(due)
    }

    async fn campaign_by_id(&self, id: Uuid) -> Result<Option<Campaign>> {
        Ok(self.inner.lock().campaigns.get(&id).cloned())
    }

    async fn update_campaign_status(&self, id: Uuid, status: CampaignStatus) -> Result<()> {
        if let Some(campaign) = self.inner.lock().campaigns.get_mut(&id) {
            campaign.status = status;
        }
        Ok(())
    }

    async fn active_subscribers(&self, list_id: Uuid) -> Result<Vec<Contact>> {
        let inner = self.inner.lock();
        let Some(members) = inner.list_members.get(&list_id) else {
            return Ok(Vec::new());
        };
        Ok(members
            .iter()
            .filter_map(|id| inner.contacts.get(id))
            .filter(|contact| contact.confirmed)
            .cloned()
            .collect())
    }

    async fn insert_send_if_absent(&self, send: CampaignSend) -> Result<bool> {
        let mut inner = self.inner.lock();
        let key = (send.campaign_id, send.contact_id);
        if !inner.send_index.insert(key) {
            return Ok(false);
        }
        inner.sends.insert(send.id, send);
        Ok(true)
    }

    async fn set_campaign_recipients(&self, id: Uuid, count: u32) -> Result<()> {
        if let Some(campaign) = self.inner.lock().campaigns.get_mut(&id) {
            campaign.recipients_count = count;
        }
        Ok(())
    }

    async fn increment_campaign_sent(&self, id: Uuid) -> Result<()> {
        if let Some(campaign) = self.inner.lock().campaigns.get_mut(&id) {
            campaign.sent_count += 1;
        }
        Ok(())
    }

    async fn fetch_pending_campaign_sends(&self, limit: usize) -> Result<Vec<PendingSend>> {
        let inner = self.inner.lock();
        let mut pending: Vec<_> = inner
            .sends
            .values()
            .filter(|send| {
                send.status == SendStatus::Pending
                    && inner
                        .campaigns
                        .get(&send.campaign_id)
                        .is_some_and(|campaign| campaign.status == CampaignStatus::Sending)
            })
            .collect();
        pending.sort_by_key(|send| send.created_at);
        Ok(pending
            .into_iter()
            .take(limit)
            .filter_map(|send| join_send(&inner, send))
            .collect())
    }

    async fn count_pending_sends(&self, campaign_id: Uuid) -> Result<usize> {
        Ok(self
            .inner
            .lock()
            .sends
            .values()
            .filter(|send| {
                send.campaign_id == campaign_id && send.status == SendStatus::Pending
            })
            .count())
    }

    async fn mark_send_sent(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(send) = inner.sends.get_mut(&id) {
            // A failed send that finally went out becomes sent;
            // permanently failed stays put.
            if send.status != SendStatus::PermanentlyFailed {
                send.status = SendStatus::Sent;
                send.last_error = None;
            }
        }
        Ok(())
    }

    async fn mark_send_failed(
        &self,
        id: Uuid,
        error: &str,
        failed_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(send) = inner.sends.get_mut(&id) {
            if !send.status.is_terminal() {
                send.status = SendStatus::Failed;
                send.failed_at = Some(failed_at);
                send.last_error = Some(error.to_string());
            }
        }
        Ok(())
    }

    async fn mark_send_permanently_failed(&self, id: Uuid, error: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(send) = inner.sends.get_mut(&id) {
            if send.status != SendStatus::Sent {
                send.status = SendStatus::PermanentlyFailed;
                send.last_error = Some(error.to_string());
            }
        }
        Ok(())
    }

    async fn increment_send_retry(&self, id: Uuid) -> Result<u32> {
        let mut inner = self.inner.lock();
        match inner.sends.get_mut(&id) {
            Some(send) => {
                send.retry_count += 1;
                Ok(send.retry_count)
            }
            None => Ok(0),
        }
    }

    async fn failed_sends_for_retry(&self, limit: usize) -> Result<Vec<PendingSend>> {
        let inner = self.inner.lock();
        let mut failed: Vec<_> = inner
            .sends
            .values()
            .filter(|send| {
                send.status == SendStatus::Failed
                    && inner
                        .campaigns
                        .get(&send.campaign_id)
                        .is_none_or(|campaign| campaign.status != CampaignStatus::Paused)
            })
            .collect();
        failed.sort_by_key(|send| send.failed_at);
        Ok(failed
            .into_iter()
            .take(limit)
            .filter_map(|send| join_send(&inner, send))
            .collect())
    }

    async fn tenant_by_credential(&self, credential: &str) -> Result<Option<Tenant>> {
        if credential.is_empty() {
            return Ok(None);
        }
        Ok(self
            .inner
            .lock()
            .tenants
            .iter()
            .find(|tenant| tenant.api_credential == credential)
            .cloned())
    }

    async fn insert_transactional_send(&self, send: TransactionalSend) -> Result<()> {
        self.inner.lock().transactional.push(send);
        Ok(())
    }

    async fn update_transactional_status(
        &self,
        id: Uuid,
        status: EmailStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(send) = inner.transactional.iter_mut().find(|send| send.id == id) {
            send.status = status;
            send.last_error = error.map(|err| err.to_string());
        }
        Ok(())
    }

    async fn is_blocked(&self, email: &str) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .blocklist
            .contains(&email.to_ascii_lowercase()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    fn contact(email: &str) -> Contact {
        Contact {
            id: Uuid::new_v4(),
            email: email.to_string(),
            name: "Ada Lovelace".to_string(),
            confirmed: true,
        }
    }

    fn send_for(campaign_id: Uuid, contact_id: Uuid) -> CampaignSend {
        CampaignSend {
            id: Uuid::new_v4(),
            campaign_id,
            contact_id,
            list_id: Uuid::new_v4(),
            tracking_token: "tok".to_string(),
            status: SendStatus::Pending,
            retry_count: 0,
            failed_at: None,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_send_is_idempotent() {
        let store = MemoryStore::new();
        let campaign_id = Uuid::new_v4();
        let contact_id = Uuid::new_v4();

        assert!(store
            .insert_send_if_absent(send_for(campaign_id, contact_id))
            .await
            .unwrap());
        assert!(!store
            .insert_send_if_absent(send_for(campaign_id, contact_id))
            .await
            .unwrap());
        // A different contact in the same campaign is a new row.
        assert!(store
            .insert_send_if_absent(send_for(campaign_id, Uuid::new_v4()))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn send_status_never_regresses_from_terminal() {
        let store = MemoryStore::new();
        let send = send_for(Uuid::new_v4(), Uuid::new_v4());
        let id = send.id;
        store.insert_send_if_absent(send).await.unwrap();

        // pending -> failed -> sent is the retry-success path.
        store.mark_send_failed(id, "451 later", Utc::now()).await.unwrap();
        assert_equal!(store.send(id).unwrap().status, SendStatus::Failed);
        store.mark_send_sent(id).await.unwrap();
        assert_equal!(store.send(id).unwrap().status, SendStatus::Sent);

        // sent is terminal.
        store.mark_send_failed(id, "nope", Utc::now()).await.unwrap();
        store.mark_send_permanently_failed(id, "nope").await.unwrap();
        assert_equal!(store.send(id).unwrap().status, SendStatus::Sent);
    }

    #[tokio::test]
    async fn permanently_failed_is_immutable() {
        let store = MemoryStore::new();
        let send = send_for(Uuid::new_v4(), Uuid::new_v4());
        let id = send.id;
        store.insert_send_if_absent(send).await.unwrap();

        store.mark_send_permanently_failed(id, "550").await.unwrap();
        store.mark_send_sent(id).await.unwrap();
        store.mark_send_failed(id, "451", Utc::now()).await.unwrap();
        assert_equal!(
            store.send(id).unwrap().status,
            SendStatus::PermanentlyFailed
        );
    }

    #[tokio::test]
    async fn pending_emails_respect_schedule_and_limit() {
        let store = MemoryStore::new();
        let ada = contact("ada@example.com");
        let template = Template {
            id: Uuid::new_v4(),
            name: "welcome".to_string(),
            subject: "hi".to_string(),
            html: "<p>hi</p>".to_string(),
            kind: crate::TemplateKind::None,
            is_transactional: true,
            sequence_id: None,
            position: 0,
            delay_hours: 0,
        };
        store.add_contact(ada.clone());
        store.add_template(template.clone());

        let now = Utc::now();
        for offset in [-2i64, -1, 1] {
            store
                .enqueue_email(QueuedEmail {
                    id: Uuid::new_v4(),
                    contact_id: ada.id,
                    template_id: template.id,
                    sequence_id: None,
                    scheduled_for: now + chrono::Duration::hours(offset),
                    tracking_token: "tok".to_string(),
                    attempt_count: 0,
                    status: EmailStatus::Pending,
                    last_error: None,
                    created_at: now,
                })
                .await
                .unwrap();
        }

        let due = store.fetch_pending_emails(now, 10).await.unwrap();
        assert_equal!(due.len(), 2);
        assert!(due[0].email.scheduled_for <= due[1].email.scheduled_for);

        let due = store.fetch_pending_emails(now, 1).await.unwrap();
        assert_equal!(due.len(), 1);
    }

    #[tokio::test]
    async fn blocklist_lookup_is_case_insensitive() {
        let store = MemoryStore::new();
        store.block("Spam.Trap@Example.com");
        assert!(store.is_blocked("spam.trap@example.com").await.unwrap());
        assert!(!store.is_blocked("fine@example.com").await.unwrap());
    }

    #[tokio::test]
    async fn paused_campaign_sends_are_not_fetched() {
        let store = MemoryStore::new();
        let ada = contact("ada@example.com");
        store.add_contact(ada.clone());
        let campaign = Campaign {
            id: Uuid::new_v4(),
            name: "launch".to_string(),
            subject: "news".to_string(),
            html: "<p>news</p>".to_string(),
            status: CampaignStatus::Sending,
            list_ids: vec![],
            exclude_list_ids: vec![],
            from_name: "Outlet".to_string(),
            from_email: "news@example.com".to_string(),
            reply_to: String::new(),
            scheduled_at: Utc::now(),
            recipients_count: 0,
            sent_count: 0,
        };
        store.add_campaign(campaign.clone());

        let mut send = send_for(campaign.id, ada.id);
        send.contact_id = ada.id;
        store.insert_send_if_absent(send).await.unwrap();

        assert_equal!(store.fetch_pending_campaign_sends(10).await.unwrap().len(), 1);
        store
            .update_campaign_status(campaign.id, CampaignStatus::Paused)
            .await
            .unwrap();
        assert_equal!(store.fetch_pending_campaign_sends(10).await.unwrap().len(), 0);
    }
}
