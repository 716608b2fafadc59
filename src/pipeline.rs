//! Pipeline Orchestrator — one poll cycle: open session, search, stream the
//! matches through decode → complete → reply, close session.
//!
//! Per-message failure policy:
//! - no sender / no body: skipped
//! - decode failure: aborts the rest of the cycle
//! - completion failure: replaced by the fallback reply
//! - send failure: logged, next message
//!
//! The session is closed exactly once on every path out of `run_cycle`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::completion::{ChatCompletionClient, CompletionService};
use crate::config::ResponderConfig;
use crate::decoder;
use crate::error::{DecodeError, MailboxError, PipelineError};
use crate::mailbox::{
    CandidateMessage, FETCH_BUFFER, ImapConnector, MailboxConnector, MailboxSession,
    SearchCriteria,
};
use crate::reply::{ReplyEnvelope, ReplyTransport, SmtpReplySender};

/// Collaborators the orchestrator drives.
pub struct ResponderDeps {
    pub mailbox: Arc<dyn MailboxConnector>,
    pub completion: Arc<dyn CompletionService>,
    pub replies: Arc<dyn ReplyTransport>,
}

/// Policy values for a cycle.
#[derive(Debug, Clone)]
pub struct ResponderSettings {
    pub subject_tag: String,
    pub fallback_reply: String,
    /// Upper bound on each session step (open, select, search, close).
    pub step_timeout: Duration,
}

impl ResponderSettings {
    pub fn from_config(config: &ResponderConfig) -> Self {
        Self {
            subject_tag: config.subject_tag.clone(),
            fallback_reply: config.fallback_reply.clone(),
            // Opening spans connect, TLS, greeting and LOGIN, each bounded by the
            // network timeout on its own.
            step_timeout: config.mailbox.timeout * 4,
        }
    }
}

/// Counters for one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Identifiers returned by the search.
    pub matched: usize,
    /// Messages taken off the fetch stream.
    pub processed: usize,
    /// Replies submitted, fallbacks included.
    pub replied: usize,
    /// Replies that carried the fallback text.
    pub fallbacks: usize,
    /// Messages skipped for lack of a sender or a body.
    pub skipped: usize,
    pub send_failures: usize,
}

/// What happened to a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Replied { fallback: bool },
    SkippedNoSender,
    SkippedNoBody,
    SendFailed,
}

impl MessageOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Replied { fallback: false } => "replied",
            Self::Replied { fallback: true } => "replied_fallback",
            Self::SkippedNoSender => "skipped_no_sender",
            Self::SkippedNoBody => "skipped_no_body",
            Self::SendFailed => "send_failed",
        }
    }
}

impl CycleReport {
    fn record(&mut self, outcome: MessageOutcome) {
        self.processed += 1;
        match outcome {
            MessageOutcome::Replied { fallback } => {
                self.replied += 1;
                if fallback {
                    self.fallbacks += 1;
                }
            }
            MessageOutcome::SkippedNoSender | MessageOutcome::SkippedNoBody => self.skipped += 1,
            MessageOutcome::SendFailed => self.send_failures += 1,
        }
    }
}

/// Runs poll cycles against the configured collaborators.
pub struct Responder {
    mailbox: Arc<dyn MailboxConnector>,
    completion: Arc<dyn CompletionService>,
    replies: Arc<dyn ReplyTransport>,
    settings: ResponderSettings,
}

impl Responder {
    pub fn new(deps: ResponderDeps, settings: ResponderSettings) -> Self {
        Self {
            mailbox: deps.mailbox,
            completion: deps.completion,
            replies: deps.replies,
            settings,
        }
    }

    /// Wire the IMAP, completion and SMTP clients described by `config`.
    pub fn from_config(config: &ResponderConfig) -> crate::error::Result<Self> {
        let completion = ChatCompletionClient::new(&config.completion)?;
        let replies = SmtpReplySender::new(&config.smtp)?;
        Ok(Self::new(
            ResponderDeps {
                mailbox: Arc::new(ImapConnector::new(config.mailbox.clone())),
                completion: Arc::new(completion),
                replies: Arc::new(replies),
            },
            ResponderSettings::from_config(config),
        ))
    }

    /// One full poll cycle.
    pub async fn run_cycle(&self) -> Result<CycleReport, PipelineError> {
        let mut session = self.step("open", self.mailbox.open()).await?;

        let result = self.drive(session.as_mut()).await;

        match self.step("logout", session.close()).await {
            Ok(()) => {}
            Err(e) => warn!(error = %e, "Failed to close mailbox session"),
        }
        result
    }

    async fn step<T, F>(&self, operation: &'static str, fut: F) -> Result<T, MailboxError>
    where
        F: Future<Output = Result<T, MailboxError>>,
    {
        let timeout = self.settings.step_timeout;
        tokio::time::timeout(timeout, fut)
            .await
            .unwrap_or(Err(MailboxError::Timeout { operation, timeout }))
    }

    async fn drive(&self, session: &mut dyn MailboxSession) -> Result<CycleReport, PipelineError> {
        self.step("select", session.select_inbox()).await?;

        let criteria = SearchCriteria::unseen_with_subject(self.settings.subject_tag.as_str());
        let ids = self.step("search", session.search(&criteria)).await?;
        if ids.is_empty() {
            info!(tag = %self.settings.subject_tag, "No unseen messages match the subject tag");
            return Ok(CycleReport::default());
        }
        info!(count = ids.len(), "Fetching matching messages");

        let (tx, rx) = mpsc::channel(FETCH_BUFFER);
        let (fetched, (mut report, consumed)) =
            tokio::join!(session.stream_fetch(&ids, tx), self.consume(rx));
        report.matched = ids.len();

        consumed?;
        match fetched {
            Ok(delivered) => {
                debug!(delivered, "Fetch stream complete");
                Ok(report)
            }
            Err(e) => {
                warn!(processed = report.processed, "Fetch ended early");
                Err(e.into())
            }
        }
    }

    /// Drain the fetch stream in order. Stops at the first decode failure,
    /// dropping the receiver so the producer stops delivering.
    async fn consume(
        &self,
        rx: mpsc::Receiver<CandidateMessage>,
    ) -> (CycleReport, Result<(), DecodeError>) {
        let mut report = CycleReport::default();
        let mut stream = ReceiverStream::new(rx);
        while let Some(message) = stream.next().await {
            match self.process_message(&message).await {
                Ok(outcome) => {
                    debug!(seq = message.seq, outcome = outcome.label(), "Message handled");
                    report.record(outcome);
                }
                Err(e) => {
                    error!(seq = message.seq, error = %e, "Decode failed, abandoning cycle");
                    return (report, Err(e));
                }
            }
        }
        (report, Ok(()))
    }

    /// Steps 1-5 for a single candidate.
    pub async fn process_message(
        &self,
        message: &CandidateMessage,
    ) -> Result<MessageOutcome, DecodeError> {
        let Some(sender) = message.sender() else {
            warn!(seq = message.seq, "Message has no sender, skipping");
            return Ok(MessageOutcome::SkippedNoSender);
        };
        let envelope = message.envelope.as_ref();
        let age_secs = envelope
            .and_then(|e| e.sent_at())
            .map(|sent| (Utc::now() - sent).num_seconds());
        info!(
            seq = message.seq,
            sender = %sender,
            subject = %message.subject(),
            message_id = ?envelope.and_then(|e| e.message_id.as_deref()),
            age_secs = ?age_secs,
            "Processing message"
        );

        if message.body.is_none() {
            warn!(seq = message.seq, "Message has no body, skipping");
            return Ok(MessageOutcome::SkippedNoBody);
        }

        let decoded = decoder::decode(message)?;

        let (reply_text, fallback) = match self.completion.complete(&decoded.text).await {
            Ok(text) => (text, false),
            Err(e) => {
                warn!(
                    seq = message.seq,
                    model = %self.completion.model_name(),
                    error = %e,
                    "Completion failed, sending fallback reply"
                );
                (self.settings.fallback_reply.clone(), true)
            }
        };

        let envelope = ReplyEnvelope::new(sender, &self.settings.subject_tag, reply_text);
        match self.replies.send(&envelope).await {
            Ok(()) => Ok(MessageOutcome::Replied { fallback }),
            Err(e) => {
                error!(seq = message.seq, to = %envelope.to, error = %e, "Failed to send reply");
                Ok(MessageOutcome::SendFailed)
            }
        }
    }
}
