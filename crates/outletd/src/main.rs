use crate::campaign::{CampaignConfig, CampaignScheduler};
use crate::dispatch::{Dispatcher, DispatcherConfig};
use crate::lifecycle::LifeCycle;
use crate::render::Renderer;
use crate::retry::{RetryConfig, RetryWorker};
use crate::smtp_server::{SmtpIngress, SmtpServerConfig};
use crate::transport::{HttpApiTransport, MailTransport, SmtpRelayTransport, Unconfigured};
use anyhow::Context;
use clap::{Parser, ValueEnum};
use sendq::{MemoryStore, Tenant};
use smtp_relay::{Pool, PoolConfig};
use std::sync::Arc;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

mod breaker;
mod campaign;
mod dispatch;
mod lifecycle;
mod metrics;
mod render;
mod retry;
mod smtp_server;
#[cfg(test)]
mod testutil;
mod transport;

#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "kebab_case")]
enum DiagnosticFormat {
    Pretty,
    Full,
    Compact,
    Json,
}

#[derive(Debug, Parser)]
#[command(about = "outlet delivery daemon")]
struct Opt {
    /// Address the SMTP ingress listens on.
    #[arg(long, default_value = "127.0.0.1:2525")]
    listen: String,

    /// Public base URL for tracking pixels, click redirects and
    /// unsubscribe links.
    #[arg(long, default_value = "http://localhost:8888")]
    base_url: String,

    /// How diagnostic logs render. full, compact and pretty are intended
    /// for human consumption. json outputs machine readable records.
    #[arg(long, default_value = "full")]
    diag_format: DiagnosticFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    run(Opt::parse()).await
}

async fn run(opts: Opt) -> anyhow::Result<()> {
    let layer = fmt::layer()
        .with_thread_names(true)
        .with_writer(std::io::stderr);
    let layer = match opts.diag_format {
        DiagnosticFormat::Pretty => layer.pretty().boxed(),
        DiagnosticFormat::Full => layer.boxed(),
        DiagnosticFormat::Compact => layer.compact().boxed(),
        DiagnosticFormat::Json => layer.json().boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(EnvFilter::from_env("OUTLETD_LOG"))
        .init();

    let store = Arc::new(MemoryStore::new());
    seed_dev_tenant(&store);

    let renderer = Renderer::new(opts.base_url);
    let (transport, relay) = build_transport();

    let dispatcher = Dispatcher::new(
        store.clone(),
        transport.clone(),
        renderer.clone(),
        DispatcherConfig::default(),
    );
    dispatcher.start();

    let scheduler = CampaignScheduler::new(
        store.clone(),
        transport.clone(),
        renderer.clone(),
        CampaignConfig::default(),
    );
    scheduler.start();

    let retry_worker = RetryWorker::new(
        store.clone(),
        transport.clone(),
        renderer.clone(),
        RetryConfig::default(),
    );
    retry_worker.start();

    let ingress = SmtpIngress::new(
        SmtpServerConfig {
            listen: opts.listen.clone(),
            ..SmtpServerConfig::default()
        },
        store.clone(),
        transport.clone(),
        renderer,
    );
    ingress.start().await.context("starting SMTP ingress")?;

    let mut life_cycle = LifeCycle::new()?;
    life_cycle.wait_for_shutdown().await;

    // Stop taking new work before draining the delivery paths.
    ingress.stop().await;
    scheduler.stop().await;
    dispatcher.stop().await;
    retry_worker.stop().await;
    if let Some(relay) = relay {
        relay.close();
    }
    tracing::info!("shutdown complete");
    Ok(())
}

/// Pick the outbound transport from the environment: an SMTP relay if
/// OUTLET_SMTP_HOST is set, otherwise the send API if
/// OUTLET_SEND_API_URL is set, otherwise a placeholder that fails
/// every send until one of them is configured.
fn build_transport() -> (Arc<dyn MailTransport>, Option<Arc<SmtpRelayTransport>>) {
    use std::env;
    let from_name = env::var("OUTLET_FROM_NAME").unwrap_or_default();
    let from_email = env::var("OUTLET_FROM_EMAIL").unwrap_or_default();
    let reply_to = env::var("OUTLET_REPLY_TO").unwrap_or_default();

    if let Ok(host) = env::var("OUTLET_SMTP_HOST") {
        let port: u16 = env::var("OUTLET_SMTP_PORT")
            .ok()
            .and_then(|port| port.parse().ok())
            .unwrap_or(587);
        let config = PoolConfig {
            addr: format!("{host}:{port}"),
            ehlo_domain: env::var("OUTLET_SMTP_EHLO").unwrap_or_else(|_| "localhost".to_string()),
            username: env::var("OUTLET_SMTP_USERNAME").unwrap_or_default(),
            password: env::var("OUTLET_SMTP_PASSWORD").unwrap_or_default(),
            ..PoolConfig::default()
        };
        tracing::info!("outbound transport: SMTP relay via {host}:{port}");
        let relay = Arc::new(SmtpRelayTransport::new(
            Pool::new(config),
            from_name,
            from_email,
            reply_to,
        ));
        return (relay.clone(), Some(relay));
    }

    if let Ok(endpoint) = env::var("OUTLET_SEND_API_URL") {
        let api_key = env::var("OUTLET_SEND_API_KEY").unwrap_or_default();
        tracing::info!("outbound transport: send API at {endpoint}");
        return (
            Arc::new(HttpApiTransport::new(
                endpoint, api_key, from_name, from_email, reply_to,
            )),
            None,
        );
    }

    tracing::warn!(
        "no outbound transport configured; sends will fail until \
         OUTLET_SMTP_HOST or OUTLET_SEND_API_URL is set"
    );
    (Arc::new(Unconfigured), None)
}

/// The in-memory store starts empty, so give the ingress a tenant to
/// authenticate against and log the credential for the operator.
fn seed_dev_tenant(store: &MemoryStore) {
    let credential =
        std::env::var("OUTLET_INGRESS_KEY").unwrap_or_else(|_| render::tracking_token());
    store.add_tenant(Tenant {
        id: Uuid::new_v4(),
        name: "default".to_string(),
        api_credential: credential.clone(),
        from_email: std::env::var("OUTLET_FROM_EMAIL").unwrap_or_default(),
        from_name: std::env::var("OUTLET_FROM_NAME").unwrap_or_default(),
        reply_to: std::env::var("OUTLET_REPLY_TO").unwrap_or_default(),
    });
    tracing::info!("SMTP ingress credential for the default tenant: {credential}");
}
