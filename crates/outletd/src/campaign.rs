//! Campaign delivery: a scheduler loop expands due campaigns into
//! per-recipient send rows, a fetcher feeds pending rows to a worker
//! pool, and per-campaign pipes track error streaks so one broken
//! campaign pauses itself without stalling the others.

use crate::metrics;
use crate::render::{tracking_token, Renderer, TemplateVars};
use crate::transport::{MailTransport, RenderedMail, TransportError};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use ratelimit::SlidingWindow;
use sendq::{Campaign, CampaignSend, CampaignStatus, PendingSend, QueueStore, SendStatus};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct CampaignConfig {
    /// How often due campaigns are looked for and expanded.
    pub schedule_interval: Duration,
    /// How often pending sends are fetched for the workers.
    pub send_poll_interval: Duration,
    pub workers: usize,
    /// Sends admitted per one-second window, shared by all campaigns.
    pub rate_limit: usize,
    pub batch_size: usize,
    /// Consecutive failures within one campaign before it pauses
    /// itself.
    pub error_threshold: u64,
    pub pipe_sweep_interval: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            schedule_interval: Duration::from_secs(10),
            send_poll_interval: Duration::from_secs(2),
            workers: 10,
            rate_limit: 14,
            batch_size: 1000,
            error_threshold: 100,
            pipe_sweep_interval: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Per-campaign delivery state shared by the workers.
struct CampaignPipe {
    sent: AtomicU64,
    consecutive_errors: AtomicU64,
    paused: AtomicBool,
    errors_paused: AtomicBool,
}

impl CampaignPipe {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: AtomicU64::new(0),
            consecutive_errors: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            errors_paused: AtomicBool::new(false),
        })
    }

    fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::SeqCst);
        // A success breaks the error streak.
        self.consecutive_errors.store(0, Ordering::SeqCst);
    }

    fn record_error(&self) -> u64 {
        self.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst) || self.errors_paused.load(Ordering::SeqCst)
    }
}

pub struct CampaignScheduler {
    state: Arc<CampaignState>,
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct CampaignState {
    config: CampaignConfig,
    store: Arc<dyn QueueStore>,
    transport: Arc<dyn MailTransport>,
    renderer: Renderer,
    limiter: SlidingWindow,
    pipes: DashMap<Uuid, Arc<CampaignPipe>>,
    queue_tx: flume::Sender<PendingSend>,
    queue_rx: flume::Receiver<PendingSend>,
    in_flight: Mutex<HashSet<Uuid>>,
    expanded: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
}

impl CampaignScheduler {
    pub fn new(
        store: Arc<dyn QueueStore>,
        transport: Arc<dyn MailTransport>,
        renderer: Renderer,
        config: CampaignConfig,
    ) -> Self {
        let (queue_tx, queue_rx) = flume::bounded(config.batch_size);
        let (stop_tx, _) = watch::channel(false);
        let state = Arc::new(CampaignState {
            limiter: SlidingWindow::new(Duration::from_secs(1), config.rate_limit),
            config,
            store,
            transport,
            renderer,
            pipes: DashMap::new(),
            queue_tx,
            queue_rx,
            in_flight: Mutex::new(HashSet::new()),
            expanded: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
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
            "campaign scheduler starting: workers={} rate={}/s batch={}",
            config.workers,
            config.rate_limit,
            config.batch_size
        );
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(scheduler_loop(
            self.state.clone(),
            self.stop_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(fetcher(
            self.state.clone(),
            self.stop_tx.subscribe(),
        )));
        for idx in 0..config.workers {
            tasks.push(tokio::spawn(worker(
                self.state.clone(),
                self.stop_tx.subscribe(),
                idx,
            )));
        }
        tasks.push(tokio::spawn(pipe_sweep(
            self.state.clone(),
            self.stop_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(reporter(
            self.state.clone(),
            self.stop_tx.subscribe(),
        )));
    }

    pub async fn stop(&self) {
        tracing::info!("campaign scheduler stopping");
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
            tracing::error!("campaign workers did not stop in time, abandoning them");
        } else {
            tracing::info!("campaign scheduler stopped");
        }
    }
}

async fn scheduler_loop(state: Arc<CampaignState>, mut stop: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(state.config.schedule_interval);
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = tick.tick() => {}
        }
        let due = match state.store.due_campaigns(Utc::now()).await {
            Ok(due) => due,
            Err(err) => {
                tracing::error!("failed to fetch due campaigns: {err:#}");
                continue;
            }
        };
        for campaign in due {
            state.expand_campaign(&campaign).await;
        }
    }
}

async fn fetcher(state: Arc<CampaignState>, mut stop: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(state.config.send_poll_interval);
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = tick.tick() => {}
        }
        state.fetch_sends(&mut stop).await;
    }
}

async fn worker(state: Arc<CampaignState>, mut stop: watch::Receiver<bool>, idx: usize) {
    tracing::debug!("campaign worker {idx} started");
    loop {
        let row = tokio::select! {
            _ = stop.changed() => break,
            row = state.queue_rx.recv_async() => match row {
                Ok(row) => row,
                Err(_) => break,
            },
        };
        state.handle_send(row, &mut stop).await;
    }
    tracing::debug!("campaign worker {idx} stopped");
}

/// Drop pipes for campaigns with nothing pending; they are recreated
/// on demand if, say, a paused campaign is resumed.
async fn pipe_sweep(state: Arc<CampaignState>, mut stop: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(state.config.pipe_sweep_interval);
    // The first tick fires immediately and would sweep nothing.
    tick.tick().await;
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = tick.tick() => {}
        }
        let ids: Vec<Uuid> = state.pipes.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            match state.store.count_pending_sends(id).await {
                Ok(0) => {
                    state.pipes.remove(&id);
                    tracing::debug!("swept idle campaign pipe {id}");
                }
                Ok(_) => {}
                Err(err) => tracing::error!("pipe sweep count for {id}: {err:#}"),
            }
        }
    }
}

async fn reporter(state: Arc<CampaignState>, mut stop: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = tick.tick() => {}
        }
        let sent = state.sent.load(Ordering::Relaxed);
        let failed = state.failed.load(Ordering::Relaxed);
        if sent + failed > 0 {
            let (in_window, limit) = state.limiter.stats();
            tracing::info!(
                "campaign stats: sent={sent} failed={failed} expanded={} window={in_window}/{limit}",
                state.expanded.load(Ordering::Relaxed)
            );
        }
    }
}

impl CampaignState {
    fn pipe(&self, campaign_id: Uuid) -> Arc<CampaignPipe> {
        self.pipes
            .entry(campaign_id)
            .or_insert_with(CampaignPipe::new)
            .clone()
    }

    /// Turn a due campaign into one send row per recipient. Safe to
    /// run twice for the same campaign: row creation is idempotent per
    /// (campaign, contact).
    async fn expand_campaign(&self, campaign: &Campaign) {
        tracing::info!("expanding campaign {} ({})", campaign.id, campaign.name);
        self.pipe(campaign.id);
        if let Err(err) = self
            .store
            .update_campaign_status(campaign.id, CampaignStatus::Sending)
            .await
        {
            tracing::error!("failed to mark campaign {} sending: {err:#}", campaign.id);
            return;
        }
        if campaign.list_ids.is_empty() {
            tracing::error!("campaign {} targets no lists", campaign.id);
            if let Err(err) = self
                .store
                .update_campaign_status(campaign.id, CampaignStatus::Failed)
                .await
            {
                tracing::error!("failed to mark campaign {} failed: {err:#}", campaign.id);
            }
            return;
        }

        // Union of the target lists, first list wins per contact.
        let mut recipients: HashMap<Uuid, (sendq::Contact, Uuid)> = HashMap::new();
        for list_id in &campaign.list_ids {
            match self.store.active_subscribers(*list_id).await {
                Ok(subscribers) => {
                    for contact in subscribers {
                        recipients.entry(contact.id).or_insert((contact, *list_id));
                    }
                }
                Err(err) => tracing::error!("failed to load list {list_id}: {err:#}"),
            }
        }
        for list_id in &campaign.exclude_list_ids {
            match self.store.active_subscribers(*list_id).await {
                Ok(excluded) => {
                    for contact in excluded {
                        recipients.remove(&contact.id);
                    }
                }
                Err(err) => tracing::error!("failed to load exclude list {list_id}: {err:#}"),
            }
        }

        let mut created = 0u32;
        for (contact, list_id) in recipients.values() {
            let send = CampaignSend {
                id: Uuid::new_v4(),
                campaign_id: campaign.id,
                contact_id: contact.id,
                list_id: *list_id,
                tracking_token: tracking_token(),
                status: SendStatus::Pending,
                retry_count: 0,
                failed_at: None,
                last_error: None,
                created_at: Utc::now(),
            };
            match self.store.insert_send_if_absent(send).await {
                Ok(true) => created += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::error!("failed to create send for {}: {err:#}", contact.email)
                }
            }
        }
        if let Err(err) = self.store.set_campaign_recipients(campaign.id, created).await {
            tracing::error!("failed to record recipient count: {err:#}");
        }
        self.expanded.fetch_add(1, Ordering::Relaxed);
        metrics::CAMPAIGNS_EXPANDED.inc();
        tracing::info!("campaign {} queued {} recipients", campaign.id, created);

        // A campaign that expanded to nobody is already complete.
        if created == 0 {
            self.check_complete(campaign.id).await;
        }
    }

    async fn fetch_sends(&self, stop: &mut watch::Receiver<bool>) {
        let batch = match self
            .store
            .fetch_pending_campaign_sends(self.config.batch_size)
            .await
        {
            Ok(batch) => batch,
            Err(err) => {
                tracing::error!("failed to fetch pending sends: {err:#}");
                return;
            }
        };
        for row in batch {
            if let Some(pipe) = self.pipes.get(&row.campaign_id) {
                if pipe.is_paused() {
                    continue;
                }
            }
            if !self.in_flight.lock().insert(row.send.id) {
                continue;
            }
            tokio::select! {
                _ = stop.changed() => return,
                sent = self.queue_tx.send_async(row) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn handle_send(&self, row: PendingSend, stop: &mut watch::Receiver<bool>) {
        let pipe = self.pipe(row.campaign_id);
        if pipe.is_paused() {
            self.in_flight.lock().remove(&row.send.id);
            return;
        }

        tokio::select! {
            _ = stop.changed() => return,
            _ = self.limiter.wait() => {}
        }

        match self.store.is_blocked(&row.contact.email).await {
            Ok(true) => {
                tracing::info!("skipping blocklisted recipient {}", row.contact.email);
                if let Err(err) = self
                    .store
                    .mark_send_permanently_failed(row.send.id, "recipient address is blocklisted")
                    .await
                {
                    tracing::error!("failed to mark send {} skipped: {err:#}", row.send.id);
                }
                self.finish(row.send.id, row.campaign_id).await;
                return;
            }
            Ok(false) => {}
            // Fail open: a broken suppression lookup should not stop
            // the campaign.
            Err(err) => tracing::error!("blocklist lookup for {}: {err:#}", row.contact.email),
        }

        let mail = render_campaign_mail(&self.renderer, &row);
        match self.transport.send(&mail).await {
            Ok(()) => {
                if let Err(err) = self.store.mark_send_sent(row.send.id).await {
                    tracing::error!("failed to mark send {} sent: {err:#}", row.send.id);
                }
                if let Err(err) = self.store.increment_campaign_sent(row.campaign_id).await {
                    tracing::error!("failed to bump sent count: {err:#}");
                }
                pipe.record_sent();
                self.sent.fetch_add(1, Ordering::Relaxed);
                metrics::CAMPAIGN_SENDS_SENT.inc();
            }
            Err(TransportError::NotConfigured) => {
                if let Err(err) = self
                    .store
                    .mark_send_permanently_failed(row.send.id, "no outbound transport is configured")
                    .await
                {
                    tracing::error!("failed to mark send {} failed: {err:#}", row.send.id);
                }
                self.failed.fetch_add(1, Ordering::Relaxed);
                metrics::CAMPAIGN_SENDS_FAILED.inc();
            }
            Err(err) => {
                tracing::warn!("send {} to {} failed: {err}", row.send.id, row.contact.email);
                if let Err(err) = self
                    .store
                    .mark_send_failed(row.send.id, &err.to_string(), Utc::now())
                    .await
                {
                    tracing::error!("failed to mark send {} failed: {err:#}", row.send.id);
                }
                self.failed.fetch_add(1, Ordering::Relaxed);
                metrics::CAMPAIGN_SENDS_FAILED.inc();

                let streak = pipe.record_error();
                if streak >= self.config.error_threshold
                    && !pipe.errors_paused.swap(true, Ordering::SeqCst)
                {
                    tracing::error!(
                        "campaign {} auto-paused after {streak} consecutive errors",
                        row.campaign_id
                    );
                    if let Err(err) = self
                        .store
                        .update_campaign_status(row.campaign_id, CampaignStatus::Paused)
                        .await
                    {
                        tracing::error!("failed to pause campaign {}: {err:#}", row.campaign_id);
                    }
                }
            }
        }
        self.finish(row.send.id, row.campaign_id).await;
    }

    async fn finish(&self, send_id: Uuid, campaign_id: Uuid) {
        self.in_flight.lock().remove(&send_id);
        self.check_complete(campaign_id).await;
    }

    async fn check_complete(&self, campaign_id: Uuid) {
        match self.store.count_pending_sends(campaign_id).await {
            Ok(0) => {
                if let Err(err) = self
                    .store
                    .update_campaign_status(campaign_id, CampaignStatus::Sent)
                    .await
                {
                    tracing::error!("failed to complete campaign {campaign_id}: {err:#}");
                    return;
                }
                if let Some((_, pipe)) = self.pipes.remove(&campaign_id) {
                    tracing::info!(
                        "campaign {campaign_id} completed ({} sends from this process)",
                        pipe.sent.load(Ordering::SeqCst)
                    );
                } else {
                    tracing::info!("campaign {campaign_id} completed");
                }
            }
            Ok(_) => {}
            Err(err) => tracing::error!("pending count for {campaign_id}: {err:#}"),
        }
    }
}

/// Render one campaign send into a transport-ready message. Shared
/// with the retry worker so retried sends look identical.
pub(crate) fn render_campaign_mail(renderer: &Renderer, row: &PendingSend) -> RenderedMail {
    let vars = TemplateVars {
        name: &row.contact.name,
        email: &row.contact.email,
        tracking_token: &row.send.tracking_token,
        verification_token: None,
    };
    let subject = renderer.substitute(&row.subject, &vars);
    let html = renderer.substitute(&row.html, &vars);
    let html = renderer.rewrite_links(&html, &row.send.tracking_token);
    let html = renderer.inject_pixel(&html, &row.send.tracking_token);
    RenderedMail {
        from_name: row.from_name.clone(),
        from_email: row.from_email.clone(),
        reply_to: row.reply_to.clone(),
        to: row.contact.email.clone(),
        subject,
        html,
        list_unsubscribe: Some(renderer.unsubscribe_url(&row.send.tracking_token)),
    }
}
