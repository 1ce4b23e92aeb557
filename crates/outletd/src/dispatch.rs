//! The send dispatcher: drains the queued-email table through a pool
//! of workers, paced by a token bucket and guarded by a circuit
//! breaker. Failed attempts are retried in-process with exponential
//! backoff; exhausted attempts mark the email failed. A successful
//! sequence email advances the contact to the next step.

use crate::breaker::{BreakerState, CircuitBreaker, Decision};
use crate::metrics;
use crate::render::{tracking_token, Renderer, TemplateVars};
use crate::transport::{MailTransport, RenderedMail, TransportError};
use chrono::Utc;
use parking_lot::Mutex;
use ratelimit::TokenBucket;
use sendq::{EmailStatus, PendingEmail, QueueStore, QueuedEmail};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub workers: usize,
    /// Sends per second across all workers.
    pub rate_limit: f64,
    pub rate_burst: usize,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_factor: f64,
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
    /// How often the retry processor re-examines deferred jobs.
    pub retry_tick: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            rate_limit: 14.0,
            rate_burst: 50,
            batch_size: 100,
            poll_interval: Duration::from_secs(5),
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_factor: 2.0,
            breaker_threshold: 10,
            breaker_cooldown: Duration::from_secs(60),
            retry_tick: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
struct EmailJob {
    row: PendingEmail,
    attempt: u32,
    next_attempt: Instant,
}

pub struct Dispatcher {
    state: Arc<DispatchState>,
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct DispatchState {
    config: DispatcherConfig,
    store: Arc<dyn QueueStore>,
    transport: Arc<dyn MailTransport>,
    renderer: Renderer,
    limiter: TokenBucket,
    breaker: CircuitBreaker,
    jobs_tx: flume::Sender<EmailJob>,
    jobs_rx: flume::Receiver<EmailJob>,
    retries_tx: flume::Sender<EmailJob>,
    retries_rx: flume::Receiver<EmailJob>,
    /// Ids currently queued or being worked; keeps the poller from
    /// double-fetching rows whose status has not changed yet.
    in_flight: Mutex<HashSet<Uuid>>,
    sent: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn QueueStore>,
        transport: Arc<dyn MailTransport>,
        renderer: Renderer,
        config: DispatcherConfig,
    ) -> Self {
        let (jobs_tx, jobs_rx) = flume::bounded(config.batch_size * 2);
        let (retries_tx, retries_rx) = flume::bounded(config.batch_size);
        let (stop_tx, _) = watch::channel(false);
        let state = Arc::new(DispatchState {
            limiter: TokenBucket::new(config.rate_limit, config.rate_burst),
            breaker: CircuitBreaker::new(config.breaker_threshold, config.breaker_cooldown),
            config,
            store,
            transport,
            renderer,
            jobs_tx,
            jobs_rx,
            retries_tx,
            retries_rx,
            in_flight: Mutex::new(HashSet::new()),
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
        });
        Self {
            state,
            stop_tx,
            tasks: Mutex::new(vec![]),
        }
    }

    pub fn start(&self) {
        let config = &self.state.config;
        tracing::info!(
            "dispatcher starting: workers={} rate={}/s batch={}",
            config.workers,
            config.rate_limit,
            config.batch_size
        );
        let mut tasks = self.tasks.lock();
        for idx in 0..config.workers {
            tasks.push(tokio::spawn(worker(
                self.state.clone(),
                self.stop_tx.subscribe(),
                idx,
            )));
        }
        tasks.push(tokio::spawn(retry_processor(
            self.state.clone(),
            self.stop_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(batch_fetcher(
            self.state.clone(),
            self.stop_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(reporter(
            self.state.clone(),
            self.stop_tx.subscribe(),
        )));
    }

    /// Signal every task and wait for them to drain, up to the
    /// configured timeout. Jobs still in the queues stay pending in
    /// the store and are picked up again on the next run.
    pub async fn stop(&self) {
        tracing::info!("dispatcher stopping");
        self.stop_tx.send(true).ok();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let drain = async move {
            for task in tasks {
                task.await.ok();
            }
        };
        if tokio::time::timeout(self.state.config.shutdown_timeout, drain)
            .await
            .is_err()
        {
            tracing::error!("dispatcher workers did not stop in time, abandoning them");
        } else {
            tracing::info!("dispatcher stopped");
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            sent: self.state.sent.load(Ordering::Relaxed),
            failed: self.state.failed.load(Ordering::Relaxed),
            retried: self.state.retried.load(Ordering::Relaxed),
            breaker: self.state.breaker.current(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DispatcherStats {
    pub sent: u64,
    pub failed: u64,
    pub retried: u64,
    pub breaker: BreakerState,
}

async fn worker(state: Arc<DispatchState>, mut stop: watch::Receiver<bool>, idx: usize) {
    tracing::debug!("send worker {idx} started");
    loop {
        let job = tokio::select! {
            _ = stop.changed() => break,
            job = state.jobs_rx.recv_async() => match job {
                Ok(job) => job,
                Err(_) => break,
            },
        };
        state.handle_job(job, &mut stop).await;
    }
    tracing::debug!("send worker {idx} stopped");
}

/// Holds jobs waiting out their backoff and feeds them back to the
/// workers once due.
async fn retry_processor(state: Arc<DispatchState>, mut stop: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(state.config.retry_tick);
    let mut waiting: Vec<EmailJob> = Vec::new();
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            job = state.retries_rx.recv_async() => match job {
                Ok(job) => waiting.push(job),
                Err(_) => break,
            },
            _ = tick.tick() => {
                let now = Instant::now();
                let mut keep = Vec::new();
                for job in waiting.drain(..) {
                    if job.next_attempt > now {
                        keep.push(job);
                        continue;
                    }
                    if let Err(
                        flume::TrySendError::Full(job) | flume::TrySendError::Disconnected(job),
                    ) = state.jobs_tx.try_send(job)
                    {
                        keep.push(job);
                    }
                }
                waiting = keep;
            }
        }
    }
}

async fn batch_fetcher(state: Arc<DispatchState>, mut stop: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(state.config.poll_interval);
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = tick.tick() => {}
        }
        state.fetch_batch(&mut stop).await;
    }
}

async fn reporter(state: Arc<DispatchState>, mut stop: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = tick.tick() => {}
        }
        let sent = state.sent.load(Ordering::Relaxed);
        let failed = state.failed.load(Ordering::Relaxed);
        let retried = state.retried.load(Ordering::Relaxed);
        if sent + failed + retried > 0 {
            tracing::info!(
                "dispatcher stats: sent={sent} failed={failed} retried={retried} breaker={}",
                state.breaker.current()
            );
        }
    }
}

impl DispatchState {
    async fn fetch_batch(&self, stop: &mut watch::Receiver<bool>) {
        // No point fetching work we would immediately defer.
        if self.breaker.current() == BreakerState::Open {
            return;
        }
        let batch = match self
            .store
            .fetch_pending_emails(Utc::now(), self.config.batch_size)
            .await
        {
            Ok(batch) => batch,
            Err(err) => {
                tracing::error!("failed to fetch pending emails: {err:#}");
                return;
            }
        };
        if batch.is_empty() {
            return;
        }
        tracing::debug!("fetched {} pending emails", batch.len());
        for row in batch {
            if !self.in_flight.lock().insert(row.email.id) {
                continue;
            }
            let job = EmailJob {
                row,
                attempt: 0,
                next_attempt: Instant::now(),
            };
            tokio::select! {
                _ = stop.changed() => return,
                sent = self.jobs_tx.send_async(job) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn handle_job(&self, mut job: EmailJob, stop: &mut watch::Receiver<bool>) {
        if self.breaker.check() == Decision::Defer {
            // Re-check once half the cooldown has passed. If the
            // retry queue is full the backlog has to be shed.
            job.next_attempt = Instant::now() + self.breaker.cooldown() / 2;
            if let Err(flume::TrySendError::Full(job) | flume::TrySendError::Disconnected(job)) =
                self.retries_tx.try_send(job)
            {
                self.fail_permanently(&job, "circuit breaker open and retry queue full")
                    .await;
            }
            return;
        }

        tokio::select! {
            // Shutdown while pacing: leave the row pending for the
            // next run rather than marking anything.
            _ = stop.changed() => return,
            _ = self.limiter.wait() => {}
        }

        match self.attempt(&job).await {
            Ok(()) => self.handle_success(&job).await,
            Err(TransportError::NotConfigured) => {
                self.fail_permanently(&job, "no outbound transport is configured")
                    .await;
            }
            Err(err) => self.handle_failure(job, err).await,
        }
    }

    async fn attempt(&self, job: &EmailJob) -> Result<(), TransportError> {
        let row = &job.row;
        let vars = TemplateVars {
            name: &row.contact.name,
            email: &row.contact.email,
            tracking_token: &row.email.tracking_token,
            verification_token: None,
        };
        let subject = self.renderer.substitute(&row.template.subject, &vars);
        let mut html = self.renderer.substitute(&row.template.html, &vars);
        if !row.email.tracking_token.is_empty() {
            html = self.renderer.rewrite_links(&html, &row.email.tracking_token);
        }
        let html = self.renderer.wrap(
            row.template.kind,
            &html,
            row.template.is_transactional,
            &row.email.tracking_token,
        );
        let list_unsubscribe = if row.template.is_transactional || row.email.tracking_token.is_empty()
        {
            None
        } else {
            Some(self.renderer.unsubscribe_url(&row.email.tracking_token))
        };
        let mail = RenderedMail {
            to: row.contact.email.clone(),
            subject,
            html,
            list_unsubscribe,
            ..RenderedMail::default()
        };
        self.transport.send(&mail).await
    }

    async fn handle_success(&self, job: &EmailJob) {
        let email = &job.row.email;
        if let Err(err) = self.store.mark_email_sent(email.id).await {
            tracing::error!("failed to mark email {} sent: {err:#}", email.id);
        }
        self.breaker.record_success();
        self.sent.fetch_add(1, Ordering::Relaxed);
        metrics::EMAILS_SENT.inc();
        tracing::debug!("email {} delivered to {}", email.id, job.row.contact.email);
        self.advance_sequence(&job.row).await;
        self.in_flight.lock().remove(&email.id);
    }

    /// Record the step just sent and queue the next one, or mark the
    /// sequence complete when there is no next step.
    async fn advance_sequence(&self, row: &PendingEmail) {
        let template = &row.template;
        let Some(sequence_id) = template.sequence_id else {
            return;
        };
        let contact_id = row.contact.id;
        if let Err(err) = self
            .store
            .update_sequence_position(contact_id, sequence_id, template.position)
            .await
        {
            tracing::error!("failed to record sequence position for {contact_id}: {err:#}");
        }
        match self.store.next_template(sequence_id, template.position).await {
            Ok(Some(next)) => {
                let delay = chrono::Duration::hours(next.delay_hours);
                let email = QueuedEmail {
                    id: Uuid::new_v4(),
                    contact_id,
                    template_id: next.id,
                    sequence_id: Some(sequence_id),
                    scheduled_for: Utc::now() + delay,
                    tracking_token: tracking_token(),
                    attempt_count: 0,
                    status: EmailStatus::Pending,
                    last_error: None,
                    created_at: Utc::now(),
                };
                match self.store.enqueue_email(email).await {
                    Ok(()) => tracing::debug!(
                        "queued sequence step {} for {contact_id} in {}h",
                        next.position,
                        next.delay_hours
                    ),
                    Err(err) => {
                        tracing::error!("failed to queue next sequence step for {contact_id}: {err:#}")
                    }
                }
            }
            Ok(None) => {
                if let Err(err) = self.store.complete_sequence(contact_id, sequence_id).await {
                    tracing::error!("failed to complete sequence for {contact_id}: {err:#}");
                } else {
                    tracing::info!("sequence {sequence_id} complete for contact {contact_id}");
                }
            }
            Err(err) => tracing::error!("failed to look up next sequence step: {err:#}"),
        }
    }

    async fn handle_failure(&self, mut job: EmailJob, err: TransportError) {
        if self.breaker.record_failure() {
            tracing::error!(
                "circuit breaker opened after {} consecutive delivery failures",
                self.config.breaker_threshold
            );
        }
        job.attempt += 1;
        if job.attempt >= self.config.max_retries {
            let reason = format!("delivery failed after {} attempts: {err}", job.attempt);
            self.fail_permanently(&job, &reason).await;
            return;
        }

        let delay = backoff_with_jitter(&self.config, job.attempt);
        job.next_attempt = Instant::now() + delay;
        let id = job.row.email.id;
        match self.retries_tx.try_send(job) {
            Ok(()) => {
                self.retried.fetch_add(1, Ordering::Relaxed);
                metrics::EMAILS_RETRIED.inc();
                tracing::debug!("email {id} failed ({err}), retrying in {delay:?}");
            }
            Err(flume::TrySendError::Full(job) | flume::TrySendError::Disconnected(job)) => {
                let reason = format!("retry queue full after failure: {err}");
                self.fail_permanently(&job, &reason).await;
            }
        }
    }

    async fn fail_permanently(&self, job: &EmailJob, reason: &str) {
        let email = &job.row.email;
        if let Err(err) = self.store.mark_email_failed(email.id, reason).await {
            tracing::error!("failed to mark email {} failed: {err:#}", email.id);
        }
        self.failed.fetch_add(1, Ordering::Relaxed);
        metrics::EMAILS_FAILED.inc();
        tracing::error!(
            "email {} to {} failed: {reason}",
            email.id,
            job.row.contact.email
        );
        self.in_flight.lock().remove(&email.id);
    }
}

/// Exponential backoff with 10-20% jitter, capped at `max_backoff`.
fn backoff_with_jitter(config: &DispatcherConfig, attempt: u32) -> Duration {
    use rand::Rng;
    let exponent = attempt.saturating_sub(1).min(30) as i32;
    let base = config.initial_backoff.as_secs_f64() * config.backoff_factor.powi(exponent);
    let capped = base.min(config.max_backoff.as_secs_f64());
    let jitter = 1.0 + rand::thread_rng().gen_range(0.10..0.20);
    Duration::from_secs_f64(capped * jitter)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::RecordingTransport;
    use k9::assert_equal;
    use sendq::{Contact, MemoryStore, Template, TemplateKind};

    fn fast_config() -> DispatcherConfig {
        DispatcherConfig {
            workers: 2,
            rate_limit: 10_000.0,
            rate_burst: 1_000,
            batch_size: 10,
            poll_interval: Duration::from_millis(20),
            max_retries: 3,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            backoff_factor: 2.0,
            breaker_threshold: 100,
            breaker_cooldown: Duration::from_secs(60),
            retry_tick: Duration::from_millis(10),
            shutdown_timeout: Duration::from_secs(1),
        }
    }

    fn contact(email: &str) -> Contact {
        Contact {
            id: Uuid::new_v4(),
            email: email.to_string(),
            name: "Ada Lovelace".to_string(),
            confirmed: true,
        }
    }

    fn template(name: &str, sequence_id: Option<Uuid>, position: i32, delay_hours: i64) -> Template {
        Template {
            id: Uuid::new_v4(),
            name: name.to_string(),
            subject: format!("{name} for {{{{first_name}}}}"),
            html: "<p>Hello {{name}}</p>".to_string(),
            kind: TemplateKind::None,
            is_transactional: false,
            sequence_id,
            position,
            delay_hours,
        }
    }

    fn queued(contact: &Contact, template: &Template) -> QueuedEmail {
        QueuedEmail {
            id: Uuid::new_v4(),
            contact_id: contact.id,
            template_id: template.id,
            sequence_id: template.sequence_id,
            scheduled_for: Utc::now(),
            tracking_token: tracking_token(),
            attempt_count: 0,
            status: EmailStatus::Pending,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached within 5s");
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let config = DispatcherConfig {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_factor: 2.0,
            ..DispatcherConfig::default()
        };
        let first = backoff_with_jitter(&config, 1);
        assert!(first >= Duration::from_millis(1_100) && first <= Duration::from_millis(1_200));

        let second = backoff_with_jitter(&config, 2);
        assert!(second >= Duration::from_millis(2_200) && second <= Duration::from_millis(2_400));

        // Far past the cap the jittered value stays near max_backoff.
        let late = backoff_with_jitter(&config, 20);
        assert!(late >= Duration::from_secs(33) && late <= Duration::from_secs(36));
    }

    #[tokio::test]
    async fn failing_transport_exhausts_retries_and_marks_failed() {
        let store = Arc::new(MemoryStore::new());
        let ada = contact("ada@example.com");
        let welcome = template("welcome", None, 0, 0);
        let email = queued(&ada, &welcome);
        let email_id = email.id;
        store.add_contact(ada);
        store.add_template(welcome);
        store.enqueue_email(email).await.unwrap();

        let transport = RecordingTransport::failing();
        let dispatcher = Dispatcher::new(
            store.clone(),
            transport.clone(),
            Renderer::new("https://outlet.example"),
            fast_config(),
        );
        dispatcher.start();

        wait_until(|| {
            store
                .email(email_id)
                .is_some_and(|email| email.status == EmailStatus::Failed)
        })
        .await;
        dispatcher.stop().await;

        assert_equal!(transport.attempts(), 3);
        let email = store.email(email_id).unwrap();
        assert!(email.last_error.unwrap().contains("after 3 attempts"));

        let stats = dispatcher.stats();
        assert_equal!(stats.sent, 0);
        assert_equal!(stats.failed, 1);
        assert_equal!(stats.retried, 2);
        assert_equal!(stats.breaker, crate::breaker::BreakerState::Closed);
    }

    #[tokio::test]
    async fn open_breaker_defers_jobs_without_attempting_delivery() {
        let store = Arc::new(MemoryStore::new());
        let ada = contact("ada@example.com");
        let welcome = template("welcome", None, 0, 0);
        let email = queued(&ada, &welcome);
        let email_id = email.id;
        store.add_contact(ada);
        store.add_template(welcome);
        store.enqueue_email(email).await.unwrap();

        let transport = RecordingTransport::failing();
        let config = DispatcherConfig {
            breaker_threshold: 1,
            ..fast_config()
        };
        let dispatcher = Dispatcher::new(
            store.clone(),
            transport.clone(),
            Renderer::new("https://outlet.example"),
            config,
        );
        dispatcher.start();

        // The first failure trips the breaker open.
        wait_until(|| dispatcher.stats().breaker == BreakerState::Open).await;
        assert_equal!(transport.attempts(), 1);

        // While open (cooldown is 60s) the job cycles through the
        // retry queue without ever reaching the transport.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_equal!(transport.attempts(), 1);
        let email = store.email(email_id).unwrap();
        assert_equal!(email.status, EmailStatus::Pending);

        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn full_retry_queue_fails_the_email_instead_of_dropping_it() {
        let store = Arc::new(MemoryStore::new());
        let ada = contact("ada@example.com");
        let welcome = template("welcome", None, 0, 0);
        store.add_contact(ada.clone());
        store.add_template(welcome.clone());
        let email = queued(&ada, &welcome);
        let email_id = email.id;
        store.enqueue_email(email.clone()).await.unwrap();

        // batch_size 1 gives the retry queue a single slot; nothing is
        // started, so the slot stays occupied.
        let config = DispatcherConfig {
            batch_size: 1,
            ..fast_config()
        };
        let dispatcher = Dispatcher::new(
            store.clone(),
            RecordingTransport::failing(),
            Renderer::new("https://outlet.example"),
            config,
        );
        let occupant = EmailJob {
            row: PendingEmail {
                email: queued(&ada, &welcome),
                contact: ada.clone(),
                template: welcome.clone(),
            },
            attempt: 1,
            next_attempt: Instant::now() + Duration::from_secs(600),
        };
        assert!(dispatcher.state.retries_tx.try_send(occupant).is_ok());

        let job = EmailJob {
            row: PendingEmail {
                email,
                contact: ada,
                template: welcome,
            },
            attempt: 0,
            next_attempt: Instant::now(),
        };
        let mut stop = dispatcher.stop_tx.subscribe();
        dispatcher.state.handle_job(job, &mut stop).await;

        // The failure could not be queued for retry, so the email is
        // marked failed rather than vanishing.
        let failed = store.email(email_id).unwrap();
        assert_equal!(failed.status, EmailStatus::Failed);
        assert!(failed.last_error.unwrap().contains("retry queue full"));
        assert_equal!(dispatcher.stats().failed, 1);
    }

    #[tokio::test]
    async fn successful_send_queues_the_next_sequence_step() {
        let store = Arc::new(MemoryStore::new());
        let sequence_id = Uuid::new_v4();
        let ada = contact("ada@example.com");
        let welcome = template("welcome", Some(sequence_id), 1, 0);
        let followup = template("followup", Some(sequence_id), 2, 24);
        let email = queued(&ada, &welcome);
        let email_id = email.id;
        store.add_contact(ada.clone());
        store.add_template(welcome);
        store.add_template(followup.clone());
        store.enqueue_email(email).await.unwrap();

        let transport = RecordingTransport::new();
        let dispatcher = Dispatcher::new(
            store.clone(),
            transport.clone(),
            Renderer::new("https://outlet.example"),
            fast_config(),
        );
        dispatcher.start();

        wait_until(|| {
            store
                .email(email_id)
                .is_some_and(|email| email.status == EmailStatus::Sent)
        })
        .await;
        // Advancement happens after the status flips; poll for it.
        wait_until(|| store.sequence_progress(ada.id, sequence_id) == Some((1, false))).await;
        dispatcher.stop().await;

        // The next step is queued a day out, with a fresh token.
        let horizon = Utc::now() + chrono::Duration::hours(25);
        let pending = store.fetch_pending_emails(horizon, 10).await.unwrap();
        assert_equal!(pending.len(), 1);
        let next = &pending[0];
        assert_equal!(next.template.id, followup.id);
        assert!(next.email.scheduled_for > Utc::now() + chrono::Duration::hours(23));
        assert!(next.email.tracking_token.len() == 64);

        // Substitution reached the transport.
        let mails = transport.sent();
        assert_equal!(mails.len(), 1);
        assert_equal!(mails[0].subject.as_str(), "welcome for Ada");
        assert!(mails[0].html.contains("Hello Ada Lovelace"));
    }

    #[tokio::test]
    async fn final_sequence_step_completes_the_sequence() {
        let store = Arc::new(MemoryStore::new());
        let sequence_id = Uuid::new_v4();
        let ada = contact("ada@example.com");
        let last = template("followup", Some(sequence_id), 2, 0);
        let email = queued(&ada, &last);
        store.add_contact(ada.clone());
        store.add_template(last);
        store.enqueue_email(email).await.unwrap();

        let dispatcher = Dispatcher::new(
            store.clone(),
            RecordingTransport::new(),
            Renderer::new("https://outlet.example"),
            fast_config(),
        );
        dispatcher.start();

        wait_until(|| store.sequence_progress(ada.id, sequence_id) == Some((2, true))).await;
        dispatcher.stop().await;
    }
}
