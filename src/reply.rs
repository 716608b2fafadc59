//! Reply Sender — plain-text replies over SMTP via lettre.

use std::sync::Arc;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use tracing::info;

use crate::config::{SmtpConfig, SmtpSecurity, reply_subject};
use crate::error::SendError;

/// A reply ready to be submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyEnvelope {
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl ReplyEnvelope {
    /// Reply to `to` with the fixed `Re:<tag>` subject.
    pub fn new(to: impl Into<String>, tag: &str, body: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            subject: reply_subject(tag),
            body: body.into(),
        }
    }
}

/// Submits replies to the Mail Transfer service.
#[async_trait]
pub trait ReplyTransport: Send + Sync {
    async fn send(&self, envelope: &ReplyEnvelope) -> Result<(), SendError>;
}

/// Build the outgoing message.
pub fn build_message(from: &str, envelope: &ReplyEnvelope) -> Result<Message, SendError> {
    let from: Mailbox = from.parse().map_err(|e| SendError::Address {
        field: "from",
        address: from.to_string(),
        reason: format!("{e}"),
    })?;
    let to: Mailbox = envelope.to.parse().map_err(|e| SendError::Address {
        field: "to",
        address: envelope.to.clone(),
        reason: format!("{e}"),
    })?;
    Message::builder()
        .from(from)
        .to(to)
        .subject(envelope.subject.as_str())
        .header(ContentType::TEXT_PLAIN)
        .body(envelope.body.clone())
        .map_err(|e| SendError::Build(e.to_string()))
}

/// SMTP sender with PLAIN authentication. The SMTP username is the From address.
pub struct SmtpReplySender {
    transport: Arc<SmtpTransport>,
    from_address: String,
}

impl SmtpReplySender {
    pub fn new(config: &SmtpConfig) -> Result<Self, SendError> {
        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );

        let builder = match config.security {
            SmtpSecurity::Tls => SmtpTransport::relay(&config.host),
            SmtpSecurity::StartTls => SmtpTransport::starttls_relay(&config.host),
        }
        .map_err(|e| SendError::Transport(format!("SMTP relay error: {e}")))?;

        let transport = builder
            .port(config.port)
            .credentials(creds)
            .authentication(vec![Mechanism::Plain])
            .timeout(Some(config.timeout))
            .build();

        Ok(Self {
            transport: Arc::new(transport),
            from_address: config.username.clone(),
        })
    }
}

#[async_trait]
impl ReplyTransport for SmtpReplySender {
    async fn send(&self, envelope: &ReplyEnvelope) -> Result<(), SendError> {
        let email = build_message(&self.from_address, envelope)?;
        let transport = Arc::clone(&self.transport);

        tokio::task::spawn_blocking(move || transport.send(&email))
            .await
            .map_err(|e| SendError::Task(e.to_string()))?
            .map_err(|e| SendError::Transport(format!("SMTP send failed: {e}")))?;

        info!(to = %envelope.to, subject = %envelope.subject, "Reply sent");
        Ok(())
    }
}
