//! Mailbox Client — session, search and streamed fetch against the Mailbox Service.

pub mod imap;
pub mod response;

pub use imap::{ImapConnector, ImapSession};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::MailboxError;

/// Capacity of the handoff channel between the fetch producer and the consumer.
pub const FETCH_BUFFER: usize = 10;

/// Opens authenticated sessions against the Mailbox Service.
#[async_trait]
pub trait MailboxConnector: Send + Sync {
    /// Connect, secure and log in. Connection and credential failures are
    /// reported as `MailboxError::Connection` and `MailboxError::Auth`.
    async fn open(&self) -> Result<Box<dyn MailboxSession>, MailboxError>;
}

/// An authenticated session, owned by exactly one poll cycle.
#[async_trait]
pub trait MailboxSession: Send {
    async fn select_inbox(&mut self) -> Result<(), MailboxError>;

    /// Sequence numbers of messages matching `criteria`. No match is an empty vec.
    async fn search(&mut self, criteria: &SearchCriteria) -> Result<Vec<u32>, MailboxError>;

    /// Issue one fetch for all `ids` and push each message into `sink` as soon
    /// as it has been read off the wire. Returns the number delivered.
    ///
    /// When the receiving side is dropped the remaining responses are drained
    /// so the session can still be closed cleanly.
    async fn stream_fetch(
        &mut self,
        ids: &[u32],
        sink: mpsc::Sender<CandidateMessage>,
    ) -> Result<usize, MailboxError>;

    /// Log out. Consumes the session.
    async fn close(self: Box<Self>) -> Result<(), MailboxError>;
}

/// Unseen messages whose subject contains a tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchCriteria {
    pub unseen: bool,
    pub subject: String,
}

impl SearchCriteria {
    pub fn unseen_with_subject(subject: impl Into<String>) -> Self {
        Self {
            unseen: true,
            subject: subject.into(),
        }
    }

    /// Render as IMAP SEARCH keys.
    pub fn to_command(&self) -> String {
        let mut keys = Vec::new();
        if self.unseen {
            keys.push("UNSEEN".to_string());
        }
        if !self.subject.is_empty() {
            keys.push(format!("SUBJECT {}", imap::quote(&self.subject)));
        }
        if keys.is_empty() {
            keys.push("ALL".to_string());
        }
        format!("SEARCH {}", keys.join(" "))
    }
}

/// One mailbox address from an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub name: Option<String>,
    pub mailbox: Option<String>,
    pub host: Option<String>,
}

impl Address {
    /// `mailbox@host`, or `None` for group markers and incomplete addresses.
    pub fn email(&self) -> Option<String> {
        match (self.mailbox.as_deref(), self.host.as_deref()) {
            (Some(m), Some(h)) if !m.is_empty() && !h.is_empty() => Some(format!("{m}@{h}")),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub date: Option<String>,
    pub subject: Option<String>,
    pub from: Vec<Address>,
    pub message_id: Option<String>,
}

impl Envelope {
    /// Address of the first `From` entry.
    pub fn sender(&self) -> Option<String> {
        self.from.first().and_then(Address::email)
    }

    /// The envelope `Date`, when it parses as RFC 2822.
    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        let date = self.date.as_deref()?;
        DateTime::parse_from_rfc2822(date.trim())
            .ok()
            .map(|d| d.with_timezone(&Utc))
    }
}

/// A message matched by the search, alive for one poll cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateMessage {
    pub seq: u32,
    pub envelope: Option<Envelope>,
    /// Full RFC 822 message, `BODY[]`.
    pub body: Option<Vec<u8>>,
}

impl CandidateMessage {
    pub fn sender(&self) -> Option<String> {
        self.envelope.as_ref().and_then(Envelope::sender)
    }

    pub fn subject(&self) -> &str {
        self.envelope
            .as_ref()
            .and_then(|e| e.subject.as_deref())
            .unwrap_or("(no subject)")
    }
}

/// Compact sequence numbers into an IMAP sequence set, e.g. `1:3,7`.
pub fn sequence_set(ids: &[u32]) -> String {
    let mut sorted = ids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut ranges: Vec<String> = Vec::new();
    let mut iter = sorted.into_iter();
    let Some(first) = iter.next() else {
        return String::new();
    };
    let (mut start, mut end) = (first, first);
    for id in iter {
        if id == end + 1 {
            end = id;
            continue;
        }
        ranges.push(render_range(start, end));
        start = id;
        end = id;
    }
    ranges.push(render_range(start, end));
    ranges.join(",")
}

fn render_range(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{start}:{end}")
    }
}
