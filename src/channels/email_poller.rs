//! IMAP poller feeding the inbound matcher.
//!
//! Each tick:
//! 1. Fetches unseen mail (`BODY.PEEK[]`, nothing flagged yet)
//! 2. Skips self-sent and non-allowlisted senders
//! 3. Runs the rest through `InboundMatcher::ingest()`
//! 4. Marks handled messages `\Seen`
//!
//! Events whose capture fails stay recorded for the sweep in
//! `pipeline::event_processor`, so they are still flagged.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channels::email::{self, EmailConfig, FetchedMail, is_sender_allowed};
use crate::pipeline::matcher::InboundMatcher;
use crate::pipeline::types::IngestOutcome;

/// Counters exposed on `/api/poller/status`.
#[derive(Debug, Default)]
pub struct PollerStatus {
    enabled: AtomicBool,
    polls: AtomicU64,
    fetched: AtomicU64,
    captured: AtomicU64,
    duplicates: AtomicU64,
    unmatched: AtomicU64,
    skipped: AtomicU64,
    failures: AtomicU64,
    last_poll_at: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
}

/// Point-in-time copy of `PollerStatus`.
#[derive(Debug, Clone, Serialize)]
pub struct PollerSnapshot {
    pub enabled: bool,
    pub polls: u64,
    pub fetched: u64,
    pub captured: u64,
    pub duplicates: u64,
    pub unmatched: u64,
    pub skipped: u64,
    pub failures: u64,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl PollerStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> PollerSnapshot {
        PollerSnapshot {
            enabled: self.enabled.load(Ordering::Relaxed),
            polls: self.polls.load(Ordering::Relaxed),
            fetched: self.fetched.load(Ordering::Relaxed),
            captured: self.captured.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            last_poll_at: *self.last_poll_at.read().await,
            last_error: self.last_error.read().await.clone(),
        }
    }

    fn record(&self, outcome: &IngestOutcome) {
        let counter = match outcome {
            IngestOutcome::Captured { .. } => &self.captured,
            IngestOutcome::Duplicate { .. } => &self.duplicates,
            IngestOutcome::Unmatched { .. } => &self.unmatched,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Spawn the poll loop. Returns a `JoinHandle` and shutdown flag.
pub fn spawn_email_poller(
    config: EmailConfig,
    matcher: Arc<InboundMatcher>,
    status: Arc<PollerStatus>,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);
    status.enabled.store(true, Ordering::Relaxed);

    let handle = tokio::spawn(async move {
        info!(
            host = %config.imap_host,
            mailbox = %config.mailbox,
            interval_secs = config.poll_interval.as_secs(),
            "Email poller started"
        );
        let mut tick = tokio::time::interval(config.poll_interval);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Email poller shutting down");
                status.enabled.store(false, Ordering::Relaxed);
                return;
            }

            poll_once(&config, &matcher, &status).await;
        }
    });

    (handle, shutdown_flag)
}

async fn poll_once(config: &EmailConfig, matcher: &InboundMatcher, status: &PollerStatus) {
    status.polls.fetch_add(1, Ordering::Relaxed);
    *status.last_poll_at.write().await = Some(Utc::now());

    let cfg = config.clone();
    let fetched = match tokio::task::spawn_blocking(move || email::fetch_unseen(&cfg)).await {
        Ok(Ok(mails)) => mails,
        Ok(Err(e)) => {
            error!(error = %e, "Email poll failed");
            status.failures.fetch_add(1, Ordering::Relaxed);
            *status.last_error.write().await = Some(e.to_string());
            return;
        }
        Err(e) => {
            error!(error = %e, "Email poll task panicked");
            status.failures.fetch_add(1, Ordering::Relaxed);
            *status.last_error.write().await = Some(e.to_string());
            return;
        }
    };
    if fetched.is_empty() {
        return;
    }
    debug!(count = fetched.len(), "Fetched unseen mail");
    status
        .fetched
        .fetch_add(fetched.len() as u64, Ordering::Relaxed);

    let mut handled = Vec::with_capacity(fetched.len());
    for mail in fetched {
        if let Some(reason) = skip_reason(config, &mail) {
            debug!(sender = %mail.sender, reason, "Skipping mail");
            status.skipped.fetch_add(1, Ordering::Relaxed);
            handled.push(mail.uid);
            continue;
        }

        match matcher.ingest(&mail.event).await {
            Ok(outcome) => status.record(&outcome),
            Err(e) => {
                warn!(message_id = %mail.event.message_id, error = %e, "Ingest failed");
                status.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        handled.push(mail.uid);
    }

    let cfg = config.clone();
    match tokio::task::spawn_blocking(move || email::mark_seen(&cfg, &handled)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Failed to mark mail as seen"),
        Err(e) => warn!(error = %e, "Mark-seen task panicked"),
    }
}

fn skip_reason(config: &EmailConfig, mail: &FetchedMail) -> Option<&'static str> {
    if mail.sender.is_empty() {
        return Some("no sender");
    }
    if mail.sender.eq_ignore_ascii_case(&config.own_address) {
        return Some("self-sent");
    }
    if !is_sender_allowed(&config.allowed_senders, &mail.sender) {
        return Some("not allowlisted");
    }
    None
}
