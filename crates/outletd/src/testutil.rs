//! Shared test doubles for the delivery components.

use crate::transport::{MailTransport, RenderedMail, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Transport that records every message it is asked to send. Can be
/// told to fail everything, or only specific recipient addresses.
#[derive(Default)]
pub struct RecordingTransport {
    mails: Mutex<Vec<RenderedMail>>,
    fail_addresses: Mutex<HashSet<String>>,
    fail_all: AtomicBool,
    attempts: AtomicUsize,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let transport = Self::default();
        transport.fail_all.store(true, Ordering::SeqCst);
        Arc::new(transport)
    }

    pub fn fail_address(&self, address: &str) {
        self.fail_addresses.lock().insert(address.to_string());
    }

    pub fn sent(&self) -> Vec<RenderedMail> {
        self.mails.lock().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn send(&self, mail: &RenderedMail) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_all.load(Ordering::SeqCst) || self.fail_addresses.lock().contains(&mail.to) {
            return Err(TransportError::Transient(format!(
                "scripted failure for {}",
                mail.to
            )));
        }
        self.mails.lock().push(mail.clone());
        Ok(())
    }
}
