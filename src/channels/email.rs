//! Candidate mailbox intake over raw IMAP.
//!
//! Blocking I/O on rustls; callers run it inside `spawn_blocking`. Messages
//! are fetched with `BODY.PEEK[]` so nothing is flagged `\Seen` until the
//! poller has recorded them.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;

use crate::error::ChannelError;
use crate::pipeline::types::InboundEvent;

// ── Configuration ───────────────────────────────────────────────────

/// Mailbox intake configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub username: String,
    pub password: SecretString,
    pub mailbox: String,
    pub poll_interval: Duration,
    /// Our own address; mail from it is skipped.
    pub own_address: String,
    pub allowed_senders: Vec<String>,
}

impl EmailConfig {
    /// Returns `None` if `EMAIL_IMAP_HOST` is not set (intake disabled).
    pub fn from_env() -> Option<Self> {
        let imap_host = std::env::var("EMAIL_IMAP_HOST").ok()?;

        let imap_port = std::env::var("EMAIL_IMAP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);
        let username = std::env::var("EMAIL_USERNAME").unwrap_or_default();
        let password = SecretString::from(std::env::var("EMAIL_PASSWORD").unwrap_or_default());
        let mailbox = std::env::var("EMAIL_MAILBOX").unwrap_or_else(|_| "INBOX".to_string());
        let own_address =
            std::env::var("EMAIL_FROM_ADDRESS").unwrap_or_else(|_| username.clone());
        let poll_interval = Duration::from_secs(
            std::env::var("EMAIL_POLL_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(60),
        );

        // Candidates write from anywhere, so an unset allowlist means everyone.
        let allowed_senders: Vec<String> = std::env::var("EMAIL_ALLOWED_SENDERS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Some(Self {
            imap_host,
            imap_port,
            username,
            password,
            mailbox,
            poll_interval,
            own_address,
            allowed_senders,
        })
    }
}

/// One unseen message, converted to an inbound event.
#[derive(Debug, Clone)]
pub struct FetchedMail {
    pub uid: String,
    /// Bare sender address, for allowlist and self-loop checks.
    pub sender: String,
    pub received_at: DateTime<Utc>,
    pub event: InboundEvent,
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Check a sender address against an allowlist.
///
/// - Empty list → deny all
/// - `*` in list → allow all
/// - `@domain.com` or `domain.com` → domain match
/// - `user@domain.com` → exact match
pub fn is_sender_allowed(allowed: &[String], email: &str) -> bool {
    if allowed.is_empty() {
        return false;
    }
    if allowed.iter().any(|a| a == "*") {
        return true;
    }
    let email = email.to_lowercase();
    allowed.iter().any(|entry| {
        let entry = entry.to_lowercase();
        if entry.starts_with('@') {
            email.ends_with(&entry)
        } else if entry.contains('@') {
            entry == email
        } else {
            email.ends_with(&format!("@{entry}"))
        }
    })
}

/// Strip HTML tags and collapse whitespace.
pub fn strip_html(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                text.push(' ');
            }
            _ if !in_tag => text.push(ch),
            _ => {}
        }
    }
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Quote a string for an IMAP command argument.
fn imap_quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Convert a raw RFC 822 message to a fetched mail.
pub fn parse_raw_mail(uid: &str, raw: &[u8]) -> Option<FetchedMail> {
    let parsed = MessageParser::default().parse(raw)?;

    let addr = parsed.from().and_then(|a| a.first());
    let sender = addr
        .and_then(|a| a.address())
        .map(str::to_string)
        .unwrap_or_default();
    let from = match addr.and_then(|a| a.name()) {
        Some(name) if !name.trim().is_empty() => format!("{} <{sender}>", name.trim()),
        _ => sender.clone(),
    };

    let body = if let Some(text) = parsed.body_text(0) {
        text.to_string()
    } else if let Some(html) = parsed.body_html(0) {
        strip_html(&html)
    } else {
        parsed
            .attachments()
            .find(|part| {
                part.content_type()
                    .is_some_and(|ct| ct.ctype() == "text")
            })
            .and_then(|part| std::str::from_utf8(part.contents()).ok())
            .map(str::to_string)
            .unwrap_or_default()
    };

    let message_id = parsed
        .message_id()
        .map(str::to_string)
        .unwrap_or_else(|| format!("gen-{}", Uuid::new_v4()));
    let received_at = parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    Some(FetchedMail {
        uid: uid.to_string(),
        sender,
        received_at,
        event: InboundEvent::new(
            from,
            parsed.subject().unwrap_or_default(),
            body,
            message_id,
        ),
    })
}

// ── IMAP session ────────────────────────────────────────────────────

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

struct ImapSession {
    tls: TlsStream,
    next_tag: u32,
}

impl ImapSession {
    fn open(config: &EmailConfig) -> Result<Self, ChannelError> {
        let tcp = TcpStream::connect((config.imap_host.as_str(), config.imap_port))
            .map_err(|e| ChannelError::Imap(format!("connect: {e}")))?;
        tcp.set_read_timeout(Some(Duration::from_secs(30)))
            .map_err(|e| ChannelError::Imap(format!("socket: {e}")))?;

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        );
        let server_name = rustls_pki_types::ServerName::try_from(config.imap_host.clone())
            .map_err(|e| ChannelError::Imap(format!("server name: {e}")))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| ChannelError::Imap(format!("tls: {e}")))?;

        let mut session = Self {
            tls: rustls::StreamOwned::new(conn, tcp),
            next_tag: 1,
        };
        session.read_line()?;

        let login = session.command(&format!(
            "LOGIN {} {}",
            imap_quote(&config.username),
            imap_quote(config.password.expose_secret())
        ))?;
        if !tagged_ok(&login) {
            return Err(ChannelError::Imap("login rejected".into()));
        }
        let select = session.command(&format!("SELECT {}", imap_quote(&config.mailbox)))?;
        if !tagged_ok(&select) {
            return Err(ChannelError::Imap(format!("cannot select {}", config.mailbox)));
        }
        Ok(session)
    }

    fn read_line(&mut self) -> Result<Vec<u8>, ChannelError> {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.tls.read(&mut byte) {
                Ok(0) => return Err(ChannelError::Imap("connection closed".into())),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(buf);
                    }
                }
                Err(e) => return Err(ChannelError::Imap(format!("read: {e}"))),
            }
        }
    }

    /// Send a command and collect raw response lines up to the tagged status.
    fn command(&mut self, cmd: &str) -> Result<Vec<Vec<u8>>, ChannelError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;
        self.tls
            .write_all(format!("{tag} {cmd}\r\n").as_bytes())
            .and_then(|()| self.tls.flush())
            .map_err(|e| ChannelError::Imap(format!("write: {e}")))?;

        let mut lines = Vec::new();
        loop {
            let line = self.read_line()?;
            let done = line.starts_with(tag.as_bytes());
            lines.push(line);
            if done {
                return Ok(lines);
            }
        }
    }

    fn search_unseen(&mut self) -> Result<Vec<String>, ChannelError> {
        let lines = self.command("UID SEARCH UNSEEN")?;
        Ok(lines
            .iter()
            .map(|l| String::from_utf8_lossy(l))
            .filter(|l| l.starts_with("* SEARCH"))
            .flat_map(|l| {
                l.split_whitespace()
                    .skip(2)
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect())
    }

    fn fetch_raw(&mut self, uid: &str) -> Result<Vec<u8>, ChannelError> {
        let lines = self.command(&format!("UID FETCH {uid} BODY.PEEK[]"))?;
        // Drop the untagged header line, the closing paren and the tagged status.
        let body_lines = lines.len().saturating_sub(3);
        Ok(lines.into_iter().skip(1).take(body_lines).flatten().collect())
    }

    fn logout(mut self) {
        let _ = self.command("LOGOUT");
    }
}

fn tagged_ok(lines: &[Vec<u8>]) -> bool {
    lines
        .last()
        .is_some_and(|l| String::from_utf8_lossy(l).contains(" OK"))
}

/// Fetch unseen messages without flagging them.
pub fn fetch_unseen(config: &EmailConfig) -> Result<Vec<FetchedMail>, ChannelError> {
    let mut session = ImapSession::open(config)?;
    let mut mails = Vec::new();
    for uid in session.search_unseen()? {
        let raw = session.fetch_raw(&uid)?;
        match parse_raw_mail(&uid, &raw) {
            Some(mail) => mails.push(mail),
            None => tracing::warn!(%uid, "Unparseable message skipped"),
        }
    }
    session.logout();
    Ok(mails)
}

/// Flag messages `\Seen`.
pub fn mark_seen(config: &EmailConfig, uids: &[String]) -> Result<(), ChannelError> {
    if uids.is_empty() {
        return Ok(());
    }
    let mut session = ImapSession::open(config)?;
    let set = uids.join(",");
    let resp = session.command(&format!("UID STORE {set} +FLAGS (\\Seen)"))?;
    session.logout();
    if tagged_ok(&resp) {
        Ok(())
    } else {
        Err(ChannelError::Imap("STORE rejected".into()))
    }
}

/// TCP reachability of the IMAP host.
pub async fn health_check(config: &EmailConfig) -> Result<(), ChannelError> {
    let addr = (config.imap_host.clone(), config.imap_port);
    let ok = tokio::task::spawn_blocking(move || TcpStream::connect(addr).is_ok())
        .await
        .unwrap_or(false);
    if ok {
        Ok(())
    } else {
        Err(ChannelError::HealthCheckFailed {
            name: "email".into(),
        })
    }
}
