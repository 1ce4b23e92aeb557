//! Process lifecycle: a single place that waits for the operator to
//! ask the daemon to wind down, so main can tear the components down
//! in order.

use tokio::signal::unix::{signal, Signal, SignalKind};

pub struct LifeCycle {
    sigterm: Signal,
}

impl LifeCycle {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for ctrl-c or SIGTERM.
    pub async fn wait_for_shutdown(&mut self) {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received");
            }
            _ = self.sigterm.recv() => {
                tracing::info!("SIGTERM received");
            }
        }
    }
}
