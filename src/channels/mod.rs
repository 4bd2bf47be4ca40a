//! Mail intake and approver notification channels.

pub mod email;
pub mod email_poller;
pub mod notify;

pub use email::EmailConfig;
pub use email_poller::{PollerSnapshot, PollerStatus, spawn_email_poller};
pub use notify::{
    ApprovalNotification, BroadcastNotifier, EmailNotifier, FanoutNotifier, LogNotifier, Notifier,
    SmtpConfig,
};
