//! Prometheus counters for the delivery core, registered in the
//! default registry so an embedding process can export them.

use prometheus::IntCounter;
use std::sync::LazyLock;

pub static EMAILS_SENT: LazyLock<IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!("outlet_emails_sent_total", "queued emails delivered").unwrap()
});
pub static EMAILS_FAILED: LazyLock<IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "outlet_emails_failed_total",
        "queued emails that permanently failed"
    )
    .unwrap()
});
pub static EMAILS_RETRIED: LazyLock<IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "outlet_emails_retried_total",
        "queued email delivery attempts that were requeued"
    )
    .unwrap()
});

pub static CAMPAIGNS_EXPANDED: LazyLock<IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "outlet_campaigns_expanded_total",
        "campaigns expanded into per-recipient sends"
    )
    .unwrap()
});
pub static CAMPAIGN_SENDS_SENT: LazyLock<IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "outlet_campaign_sends_sent_total",
        "campaign sends delivered"
    )
    .unwrap()
});
pub static CAMPAIGN_SENDS_FAILED: LazyLock<IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "outlet_campaign_sends_failed_total",
        "campaign send attempts that failed"
    )
    .unwrap()
});
pub static CAMPAIGN_SENDS_RETRIED: LazyLock<IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "outlet_campaign_sends_retried_total",
        "failed campaign sends picked up by the retry worker"
    )
    .unwrap()
});

pub static INGRESS_MESSAGES: LazyLock<IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "outlet_ingress_messages_total",
        "messages accepted over the SMTP ingress"
    )
    .unwrap()
});
pub static INGRESS_AUTH_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "outlet_ingress_auth_failures_total",
        "rejected SMTP ingress authentication attempts"
    )
    .unwrap()
});
