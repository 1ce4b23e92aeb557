//! Background retry of failed campaign sends. Escalating wait
//! intervals are indexed by how often a send has been retried; once
//! the retry budget is spent the send is marked permanently failed.

use crate::campaign::render_campaign_mail;
use crate::metrics;
use crate::render::Renderer;
use crate::transport::MailTransport;
use chrono::Utc;
use parking_lot::Mutex;
use sendq::{PendingSend, QueueStore};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub poll_interval: Duration,
    pub max_retries: u32,
    /// Wait before retry N; the last entry covers every later retry.
    pub intervals: Vec<Duration>,
    pub batch_size: usize,
    pub shutdown_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            max_retries: 3,
            intervals: vec![
                Duration::from_secs(5 * 60),
                Duration::from_secs(30 * 60),
                Duration::from_secs(2 * 60 * 60),
            ],
            batch_size: 100,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

pub struct RetryWorker {
    state: Arc<RetryState>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct RetryState {
    config: RetryConfig,
    store: Arc<dyn QueueStore>,
    transport: Arc<dyn MailTransport>,
    renderer: Renderer,
    recovered: AtomicU64,
    exhausted: AtomicU64,
}

impl RetryWorker {
    pub fn new(
        store: Arc<dyn QueueStore>,
        transport: Arc<dyn MailTransport>,
        renderer: Renderer,
        config: RetryConfig,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            state: Arc::new(RetryState {
                config,
                store,
                transport,
                renderer,
                recovered: AtomicU64::new(0),
                exhausted: AtomicU64::new(0),
            }),
            stop_tx,
            task: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        tracing::info!(
            "retry worker starting: max_retries={} poll={:?}",
            self.state.config.max_retries,
            self.state.config.poll_interval
        );
        let state = self.state.clone();
        let mut stop = self.stop_tx.subscribe();
        *self.task.lock() = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(state.config.poll_interval);
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = tick.tick() => {}
                }
                state.process_batch(&mut stop).await;
            }
        }));
    }

    pub async fn stop(&self) {
        tracing::info!("retry worker stopping");
        self.stop_tx.send(true).ok();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let timeout = self.state.config.shutdown_timeout;
            if tokio::time::timeout(timeout, task).await.is_err() {
                tracing::error!("retry worker did not stop in time, abandoning it");
                return;
            }
        }
        tracing::info!(
            "retry worker stopped (recovered={} exhausted={})",
            self.state.recovered.load(Ordering::Relaxed),
            self.state.exhausted.load(Ordering::Relaxed)
        );
    }
}

impl RetryState {
    async fn process_batch(&self, stop: &mut watch::Receiver<bool>) {
        let batch = match self
            .store
            .failed_sends_for_retry(self.config.batch_size)
            .await
        {
            Ok(batch) => batch,
            Err(err) => {
                tracing::error!("failed to fetch sends for retry: {err:#}");
                return;
            }
        };
        for row in batch {
            if *stop.borrow() {
                return;
            }
            self.retry_send(row).await;
        }
    }

    async fn retry_send(&self, row: PendingSend) {
        let send = &row.send;
        if send.retry_count >= self.config.max_retries {
            let reason = format!("gave up after {} retries", send.retry_count);
            if let Err(err) = self
                .store
                .mark_send_permanently_failed(send.id, &reason)
                .await
            {
                tracing::error!("failed to mark send {} permanently failed: {err:#}", send.id);
                return;
            }
            self.exhausted.fetch_add(1, Ordering::Relaxed);
            tracing::info!("send {} to {} {reason}", send.id, row.contact.email);
            return;
        }

        let wait = required_wait(&self.config.intervals, send.retry_count);
        if let Some(failed_at) = send.failed_at {
            let age = (Utc::now() - failed_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if age < wait {
                return;
            }
        }

        // Bump the count before attempting so a crash mid-send cannot
        // retry forever.
        let attempt = match self.store.increment_send_retry(send.id).await {
            Ok(attempt) => attempt,
            Err(err) => {
                tracing::error!("failed to bump retry count for {}: {err:#}", send.id);
                return;
            }
        };
        metrics::CAMPAIGN_SENDS_RETRIED.inc();
        tracing::info!(
            "retrying send {} to {} (attempt {attempt}/{})",
            send.id,
            row.contact.email,
            self.config.max_retries
        );

        let mail = render_campaign_mail(&self.renderer, &row);
        match self.transport.send(&mail).await {
            Ok(()) => {
                if let Err(err) = self.store.mark_send_sent(send.id).await {
                    tracing::error!("failed to mark send {} sent: {err:#}", send.id);
                }
                if let Err(err) = self.store.increment_campaign_sent(row.campaign_id).await {
                    tracing::error!("failed to bump sent count: {err:#}");
                }
                self.recovered.fetch_add(1, Ordering::Relaxed);
                metrics::CAMPAIGN_SENDS_SENT.inc();
            }
            Err(err) => {
                tracing::warn!("retry of send {} failed: {err}", send.id);
                if let Err(err) = self
                    .store
                    .mark_send_failed(send.id, &err.to_string(), Utc::now())
                    .await
                {
                    tracing::error!("failed to mark send {} failed: {err:#}", send.id);
                }
            }
        }
    }
}

/// Wait required before retry number `retry_count`, clamping past the
/// end of the table.
fn required_wait(intervals: &[Duration], retry_count: u32) -> Duration {
    intervals
        .get(retry_count as usize)
        .or_else(|| intervals.last())
        .copied()
        .unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::RecordingTransport;
    use k9::assert_equal;
    use sendq::{
        Campaign, CampaignSend, CampaignStatus, Contact, MemoryStore, SendStatus,
    };
    use uuid::Uuid;

    fn fast_config() -> RetryConfig {
        RetryConfig {
            poll_interval: Duration::from_millis(20),
            max_retries: 3,
            intervals: vec![Duration::from_millis(1)],
            batch_size: 100,
            shutdown_timeout: Duration::from_secs(1),
        }
    }

    fn worker(
        store: Arc<MemoryStore>,
        transport: Arc<RecordingTransport>,
        config: RetryConfig,
    ) -> RetryWorker {
        RetryWorker::new(
            store,
            transport,
            Renderer::new("https://outlet.example"),
            config,
        )
    }

    /// Seed one campaign with one failed send, `retries` retries deep.
    async fn seed_failed(
        store: &MemoryStore,
        failed_at: chrono::DateTime<Utc>,
        retries: u32,
    ) -> (Uuid, Uuid) {
        let contact = Contact {
            id: Uuid::new_v4(),
            email: "ada@example.org".to_string(),
            name: "Ada".to_string(),
            confirmed: true,
        };
        let campaign = Campaign {
            id: Uuid::new_v4(),
            name: "retry me".to_string(),
            subject: "hello".to_string(),
            html: "<p>hi {{name}}</p>".to_string(),
            status: CampaignStatus::Sending,
            list_ids: vec![Uuid::new_v4()],
            exclude_list_ids: vec![],
            from_name: "Outlet".to_string(),
            from_email: "news@example.com".to_string(),
            reply_to: String::new(),
            scheduled_at: Utc::now(),
            recipients_count: 1,
            sent_count: 0,
        };
        let send = CampaignSend {
            id: Uuid::new_v4(),
            campaign_id: campaign.id,
            contact_id: contact.id,
            list_id: campaign.list_ids[0],
            tracking_token: crate::render::tracking_token(),
            status: SendStatus::Pending,
            retry_count: 0,
            failed_at: None,
            last_error: None,
            created_at: Utc::now(),
        };
        let send_id = send.id;
        let campaign_id = campaign.id;
        store.add_contact(contact);
        store.add_campaign(campaign);
        store.insert_send_if_absent(send).await.unwrap();
        store
            .mark_send_failed(send_id, "smtp timeout", failed_at)
            .await
            .unwrap();
        for _ in 0..retries {
            store.increment_send_retry(send_id).await.unwrap();
        }
        (send_id, campaign_id)
    }

    #[test]
    fn wait_table_clamps_to_the_last_interval() {
        let intervals = [
            Duration::from_secs(300),
            Duration::from_secs(1800),
            Duration::from_secs(7200),
        ];
        assert_equal!(required_wait(&intervals, 0), Duration::from_secs(300));
        assert_equal!(required_wait(&intervals, 1), Duration::from_secs(1800));
        assert_equal!(required_wait(&intervals, 2), Duration::from_secs(7200));
        assert_equal!(required_wait(&intervals, 7), Duration::from_secs(7200));
        assert_equal!(required_wait(&[], 0), Duration::ZERO);
    }

    #[tokio::test]
    async fn eligible_failure_is_retried_and_recovers() {
        let store = Arc::new(MemoryStore::new());
        let (send_id, campaign_id) =
            seed_failed(&store, Utc::now() - chrono::Duration::hours(1), 0).await;

        let transport = RecordingTransport::new();
        let state = worker(store.clone(), transport.clone(), fast_config()).state;
        let (_tx, mut stop) = watch::channel(false);
        state.process_batch(&mut stop).await;

        let send = store.send(send_id).unwrap();
        assert_equal!(send.status, SendStatus::Sent);
        assert_equal!(send.retry_count, 1);
        assert_equal!(store.campaign(campaign_id).unwrap().sent_count, 1);
        assert_equal!(transport.attempts(), 1);
        assert!(transport.sent()[0].html.contains("hi Ada"));
    }

    #[tokio::test]
    async fn recent_failures_wait_out_their_interval() {
        let store = Arc::new(MemoryStore::new());
        let (send_id, _) = seed_failed(&store, Utc::now(), 0).await;

        let transport = RecordingTransport::new();
        let config = RetryConfig {
            intervals: vec![Duration::from_secs(600)],
            ..fast_config()
        };
        let state = worker(store.clone(), transport.clone(), config).state;
        let (_tx, mut stop) = watch::channel(false);
        state.process_batch(&mut stop).await;

        let send = store.send(send_id).unwrap();
        assert_equal!(send.status, SendStatus::Failed);
        assert_equal!(send.retry_count, 0);
        assert_equal!(transport.attempts(), 0);
    }

    #[tokio::test]
    async fn exhausted_sends_are_permanently_failed_without_an_attempt() {
        let store = Arc::new(MemoryStore::new());
        let (send_id, _) =
            seed_failed(&store, Utc::now() - chrono::Duration::hours(1), 3).await;

        let transport = RecordingTransport::new();
        let state = worker(store.clone(), transport.clone(), fast_config()).state;
        let (_tx, mut stop) = watch::channel(false);
        state.process_batch(&mut stop).await;

        let send = store.send(send_id).unwrap();
        assert_equal!(send.status, SendStatus::PermanentlyFailed);
        assert_equal!(transport.attempts(), 0);
    }

    #[tokio::test]
    async fn failed_retry_is_rescheduled_with_a_fresh_timestamp() {
        let store = Arc::new(MemoryStore::new());
        let old = Utc::now() - chrono::Duration::hours(1);
        let (send_id, _) = seed_failed(&store, old, 0).await;

        let transport = RecordingTransport::new();
        transport.fail_address("ada@example.org");
        let state = worker(store.clone(), transport.clone(), fast_config()).state;
        let (_tx, mut stop) = watch::channel(false);
        state.process_batch(&mut stop).await;

        let send = store.send(send_id).unwrap();
        assert_equal!(send.status, SendStatus::Failed);
        assert_equal!(send.retry_count, 1);
        assert!(send.failed_at.unwrap() > old);
        assert_equal!(transport.attempts(), 1);
    }
}
