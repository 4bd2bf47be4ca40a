//! Approver notifications.
//!
//! The approval gate hands every newly created request to a `Notifier`.
//! Delivery is best-effort: a failed notification never blocks the gate.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ChannelError;

/// One approver asked to sign off one step.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalNotification {
    pub request_id: Uuid,
    pub instance_id: Uuid,
    pub step_detail_id: Uuid,
    pub step_name: String,
    pub approver_id: String,
    pub candidate_name: Option<String>,
    pub job_title: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ApprovalNotification {
    /// One-line human summary.
    pub fn summary(&self) -> String {
        let who = self.candidate_name.as_deref().unwrap_or("a candidate");
        match &self.job_title {
            Some(title) => format!("Approval needed: {} for {who} ({title})", self.step_name),
            None => format!("Approval needed: {} for {who}", self.step_name),
        }
    }
}

/// Delivery seam for approval requests.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, notification: &ApprovalNotification) -> Result<(), ChannelError>;
}

/// Writes notifications to the log. Used when nothing else is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, notification: &ApprovalNotification) -> Result<(), ChannelError> {
        info!(
            request_id = %notification.request_id,
            approver = %notification.approver_id,
            "{}",
            notification.summary()
        );
        Ok(())
    }
}

/// Publishes notifications to in-process subscribers (the `/ws/approvals` feed).
pub struct BroadcastNotifier {
    tx: broadcast::Sender<ApprovalNotification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ApprovalNotification> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    fn name(&self) -> &str {
        "broadcast"
    }

    async fn notify(&self, notification: &ApprovalNotification) -> Result<(), ChannelError> {
        // No subscribers is not an error.
        let receivers = self.tx.send(notification.clone()).unwrap_or(0);
        debug!(request_id = %notification.request_id, receivers, "Approval broadcast");
        Ok(())
    }
}

/// SMTP settings for outbound approval mail.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl SmtpConfig {
    /// Returns `None` if `EMAIL_SMTP_HOST` is not set.
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("EMAIL_SMTP_HOST").ok()?;
        let port = std::env::var("EMAIL_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);
        let username = std::env::var("EMAIL_USERNAME").unwrap_or_default();
        let password = SecretString::from(std::env::var("EMAIL_PASSWORD").unwrap_or_default());
        let from_address =
            std::env::var("EMAIL_FROM_ADDRESS").unwrap_or_else(|_| username.clone());
        Some(Self {
            host,
            port,
            username,
            password,
            from_address,
        })
    }
}

/// Mails approvers whose identity is an email address.
pub struct EmailNotifier {
    config: SmtpConfig,
}

impl EmailNotifier {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn send(config: &SmtpConfig, to: &str, subject: &str, body: &str) -> Result<(), ChannelError> {
        let send_failed = |reason: String| ChannelError::SendFailed {
            name: "email".into(),
            reason,
        };

        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );
        let transport = SmtpTransport::relay(&config.host)
            .map_err(|e| send_failed(format!("SMTP relay error: {e}")))?
            .port(config.port)
            .credentials(creds)
            .build();

        let email = Message::builder()
            .from(
                config
                    .from_address
                    .parse()
                    .map_err(|e| send_failed(format!("Invalid from address: {e}")))?,
            )
            .to(to
                .parse()
                .map_err(|e| send_failed(format!("Invalid to address: {e}")))?)
            .subject(subject)
            .body(body.to_string())
            .map_err(|e| send_failed(format!("Failed to build email: {e}")))?;

        transport
            .send(&email)
            .map_err(|e| send_failed(format!("SMTP send failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn name(&self) -> &str {
        "email"
    }

    async fn notify(&self, notification: &ApprovalNotification) -> Result<(), ChannelError> {
        if !notification.approver_id.contains('@') {
            debug!(approver = %notification.approver_id, "Approver has no email address, skipping");
            return Ok(());
        }

        let config = self.config.clone();
        let to = notification.approver_id.clone();
        let subject = notification.summary();
        let body = format!(
            "{}\n\nApproval request: {}\nWorkflow instance: {}\n",
            notification.summary(),
            notification.request_id,
            notification.instance_id
        );

        tokio::task::spawn_blocking(move || Self::send(&config, &to, &subject, &body))
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "email".into(),
                reason: format!("send task failed: {e}"),
            })??;

        info!(approver = %notification.approver_id, "Approval email sent");
        Ok(())
    }
}

/// Delivers to every inner notifier, logging individual failures.
pub struct FanoutNotifier {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self { notifiers }
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    fn name(&self) -> &str {
        "fanout"
    }

    async fn notify(&self, notification: &ApprovalNotification) -> Result<(), ChannelError> {
        let results = join_all(self.notifiers.iter().map(|n| n.notify(notification))).await;
        for (notifier, result) in self.notifiers.iter().zip(results) {
            if let Err(e) = result {
                warn!(
                    notifier = notifier.name(),
                    request_id = %notification.request_id,
                    error = %e,
                    "Notification failed"
                );
            }
        }
        Ok(())
    }
}
