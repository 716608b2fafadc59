//! IMAP over TLS — a minimal async client covering the commands a poll cycle
//! needs: LOGIN, SELECT, SEARCH, FETCH, LOGOUT.
//!
//! The session is generic over its transport so it can run on a
//! `tokio_rustls` stream in production and on an in-memory duplex in tests.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::bytes::Regex;
use secrecy::ExposeSecret;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};

use crate::config::MailboxConfig;
use crate::error::MailboxError;
use crate::mailbox::response::{self, Status};
use crate::mailbox::{CandidateMessage, MailboxConnector, MailboxSession, SearchCriteria};

/// `{123}` or `{123+}` at the end of a line announces a literal.
static LITERAL_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(\d+)\+?\}\r?\n$").expect("literal marker regex"));

/// Items requested for every candidate. `BODY[]` rather than `BODY.PEEK[]`,
/// so the server flags fetched messages `\Seen`.
const FETCH_ITEMS: &str = "(ENVELOPE BODY[])";

/// Quote a string for use as an IMAP argument.
pub fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

// ── Session ─────────────────────────────────────────────────────────

/// An authenticated IMAP session.
pub struct ImapSession<S> {
    stream: BufReader<S>,
    tag_counter: u32,
    timeout: Duration,
    mailbox: String,
}

impl<S> ImapSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Read the server greeting on a freshly connected stream, then LOGIN.
    pub async fn establish(
        stream: S,
        config: &MailboxConfig,
    ) -> Result<Self, MailboxError> {
        let mut session = Self {
            stream: BufReader::new(stream),
            tag_counter: 0,
            timeout: config.timeout,
            mailbox: config.mailbox.clone(),
        };

        let greeting = session.read_unit("greeting").await?;
        let greeting = String::from_utf8_lossy(&greeting).trim_end().to_string();
        let upper = greeting.to_ascii_uppercase();
        if !upper.starts_with("* OK") && !upper.starts_with("* PREAUTH") {
            return Err(MailboxError::Connection {
                host: config.host.clone(),
                port: config.port,
                reason: format!("unexpected greeting: {greeting}"),
            });
        }
        debug!(greeting = %greeting, "IMAP connected");

        if !upper.starts_with("* PREAUTH") {
            session
                .login(&config.username, config.password.expose_secret())
                .await?;
        }
        Ok(session)
    }

    async fn login(&mut self, username: &str, password: &str) -> Result<(), MailboxError> {
        let command = format!("LOGIN {} {}", quote(username), quote(password));
        let (_, status) = self.command(&command, "login").await?;
        if !status.ok {
            return Err(MailboxError::Auth {
                username: username.to_string(),
                reason: status.text,
            });
        }
        info!(username = %username, "IMAP login succeeded");
        Ok(())
    }

    /// Send a tagged command. Returns the tag.
    async fn send(&mut self, command: &str, operation: &'static str) -> Result<String, MailboxError> {
        self.tag_counter += 1;
        let tag = format!("A{:04}", self.tag_counter);
        let line = format!("{tag} {command}\r\n");
        let stream = &mut self.stream;
        with_timeout(self.timeout, operation, async {
            stream.write_all(line.as_bytes()).await?;
            stream.flush().await
        })
        .await?;
        Ok(tag)
    }

    async fn read_line(&mut self, operation: &'static str) -> Result<Vec<u8>, MailboxError> {
        let mut line = Vec::new();
        let n = with_timeout(
            self.timeout,
            operation,
            self.stream.read_until(b'\n', &mut line),
        )
        .await?;
        if n == 0 {
            return Err(MailboxError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "IMAP connection closed unexpectedly",
            )));
        }
        Ok(line)
    }

    /// Read one complete response, following any literals it announces.
    async fn read_unit(&mut self, operation: &'static str) -> Result<Vec<u8>, MailboxError> {
        let mut unit = self.read_line(operation).await?;
        loop {
            let Some(len) = literal_len(&unit) else {
                return Ok(unit);
            };
            let mut literal = vec![0u8; len];
            with_timeout(
                self.timeout,
                operation,
                self.stream.read_exact(&mut literal),
            )
            .await?;
            unit.extend_from_slice(&literal);
            let tail = self.read_line(operation).await?;
            unit.extend_from_slice(&tail);
        }
    }

    /// Run a command to completion, collecting the untagged responses.
    async fn command(
        &mut self,
        command: &str,
        operation: &'static str,
    ) -> Result<(Vec<Vec<u8>>, Status), MailboxError> {
        let tag = self.send(command, operation).await?;
        let mut untagged = Vec::new();
        loop {
            let unit = self.read_unit(operation).await?;
            if let Some(status) = response::tagged_status(&unit, &tag) {
                return Ok((untagged, status));
            }
            untagged.push(unit);
        }
    }
}

/// Bound an I/O step by the session timeout.
async fn with_timeout<T, F>(
    timeout: Duration,
    operation: &'static str,
    fut: F,
) -> Result<T, MailboxError>
where
    F: Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(MailboxError::from),
        Err(_) => Err(MailboxError::Timeout { operation, timeout }),
    }
}

/// Length of the literal announced at the end of `line`, if any.
fn literal_len(line: &[u8]) -> Option<usize> {
    let caps = LITERAL_MARKER.captures(line)?;
    std::str::from_utf8(caps.get(1)?.as_bytes()).ok()?.parse().ok()
}

#[async_trait]
impl<S> MailboxSession for ImapSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn select_inbox(&mut self) -> Result<(), MailboxError> {
        let command = format!("SELECT {}", quote(&self.mailbox));
        let (_, status) = self.command(&command, "select").await?;
        if !status.ok {
            return Err(MailboxError::Select {
                mailbox: self.mailbox.clone(),
                reason: status.text,
            });
        }
        debug!(mailbox = %self.mailbox, "Mailbox selected");
        Ok(())
    }

    async fn search(&mut self, criteria: &SearchCriteria) -> Result<Vec<u32>, MailboxError> {
        let (untagged, status) = self.command(&criteria.to_command(), "search").await?;
        if !status.ok {
            return Err(MailboxError::Search(status.text));
        }
        Ok(response::parse_search(&untagged))
    }

    async fn stream_fetch(
        &mut self,
        ids: &[u32],
        sink: mpsc::Sender<CandidateMessage>,
    ) -> Result<usize, MailboxError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let command = format!("FETCH {} {FETCH_ITEMS}", super::sequence_set(ids));
        let tag = self.send(&command, "fetch").await?;

        let mut assembly = FetchAssembly::new(ids);
        let mut delivered = 0;
        let mut consumer_gone = false;
        let mut malformed: Option<MailboxError> = None;
        loop {
            let unit = self.read_unit("fetch").await?;
            if let Some(status) = response::tagged_status(&unit, &tag) {
                for message in assembly.drain_partial() {
                    if consumer_gone {
                        break;
                    }
                    warn!(
                        seq = message.seq,
                        has_envelope = message.envelope.is_some(),
                        has_body = message.body.is_some(),
                        "FETCH completed without full message data"
                    );
                    if sink.send(message).await.is_err() {
                        consumer_gone = true;
                    } else {
                        delivered += 1;
                    }
                }
                if !status.ok {
                    return Err(MailboxError::Fetch(status.text));
                }
                return match malformed {
                    Some(e) => Err(e),
                    None => Ok(delivered),
                };
            }
            if consumer_gone {
                continue;
            }
            match response::parse_fetch(&unit) {
                Ok(Some(part)) => {
                    let Some(message) = assembly.merge(part) else {
                        continue;
                    };
                    let seq = message.seq;
                    if sink.send(message).await.is_err() {
                        debug!(seq, "Fetch consumer stopped, draining remaining responses");
                        consumer_gone = true;
                    } else {
                        delivered += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(
                        seq = ?response::fetch_seq(&unit),
                        error = %e,
                        "Unparseable FETCH response, message will not be answered"
                    );
                    if malformed.is_none() {
                        malformed = Some(e);
                    }
                }
            }
        }
    }

    async fn close(mut self: Box<Self>) -> Result<(), MailboxError> {
        let (_, status) = self.command("LOGOUT", "logout").await?;
        if !status.ok {
            warn!(status = %status.text, "LOGOUT not acknowledged");
        }
        debug!("IMAP session closed");
        Ok(())
    }
}

/// FETCH data collected per requested sequence number.
///
/// Servers may interleave unsolicited FLAGS updates, answer for messages that
/// were not asked for, or split one message's items over several responses.
/// A message is released once it has both its envelope and its body.
struct FetchAssembly {
    pending: BTreeMap<u32, CandidateMessage>,
}

impl FetchAssembly {
    fn new(ids: &[u32]) -> Self {
        let pending = ids
            .iter()
            .map(|&seq| {
                (
                    seq,
                    CandidateMessage {
                        seq,
                        envelope: None,
                        body: None,
                    },
                )
            })
            .collect();
        Self { pending }
    }

    fn merge(&mut self, part: CandidateMessage) -> Option<CandidateMessage> {
        let seq = part.seq;
        let entry = self.pending.get_mut(&seq)?;
        if part.envelope.is_some() {
            entry.envelope = part.envelope;
        }
        if part.body.is_some() {
            entry.body = part.body;
        }
        if entry.envelope.is_some() && entry.body.is_some() {
            self.pending.remove(&seq)
        } else {
            None
        }
    }

    /// Messages that got some data but never both halves, in sequence order.
    fn drain_partial(&mut self) -> Vec<CandidateMessage> {
        std::mem::take(&mut self.pending)
            .into_values()
            .filter(|m| m.envelope.is_some() || m.body.is_some())
            .collect()
    }
}

// ── Connector ───────────────────────────────────────────────────────

/// Opens IMAP sessions over implicit TLS.
pub struct ImapConnector {
    config: MailboxConfig,
    tls: TlsConnector,
}

impl ImapConnector {
    pub fn new(config: MailboxConfig) -> Self {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        Self {
            config,
            tls: TlsConnector::from(Arc::new(tls_config)),
        }
    }

    fn connection_error(&self, reason: impl std::fmt::Display) -> MailboxError {
        MailboxError::Connection {
            host: self.config.host.clone(),
            port: self.config.port,
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl MailboxConnector for ImapConnector {
    async fn open(&self) -> Result<Box<dyn MailboxSession>, MailboxError> {
        let cfg = &self.config;
        let tcp = tokio::time::timeout(cfg.timeout, TcpStream::connect((cfg.host.as_str(), cfg.port)))
            .await
            .map_err(|_| self.connection_error(format!("connect timed out after {:?}", cfg.timeout)))?
            .map_err(|e| self.connection_error(e))?;

        let server_name = rustls::pki_types::ServerName::try_from(cfg.host.clone())
            .map_err(|e| self.connection_error(format!("invalid server name: {e}")))?;
        let tls = tokio::time::timeout(cfg.timeout, self.tls.connect(server_name, tcp))
            .await
            .map_err(|_| self.connection_error("TLS handshake timed out"))?
            .map_err(|e| self.connection_error(format!("TLS handshake failed: {e}")))?;

        let session = ImapSession::establish(tls, cfg).await.map_err(|e| match e {
            MailboxError::Auth { .. } | MailboxError::Connection { .. } => e,
            other => self.connection_error(other),
        })?;
        Ok(Box::new(session))
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;
    use tokio::io::{DuplexStream, duplex};

    use super::*;

    fn config() -> MailboxConfig {
        MailboxConfig {
            host: "imap.test.com".into(),
            port: 993,
            mailbox: "INBOX".into(),
            username: "bot@test.com".into(),
            password: SecretString::from("p\"ss"),
            timeout: Duration::from_secs(2),
        }
    }

    /// Scripted server: for each expected client line, write the canned reply.
    fn spawn_server(
        server: DuplexStream,
        greeting: &'static str,
        script: Vec<(&'static str, String)>,
    ) -> tokio::task::JoinHandle<Vec<String>> {
        tokio::spawn(async move {
            let mut server = BufReader::new(server);
            server.write_all(greeting.as_bytes()).await.unwrap();
            let mut received = Vec::new();
            for (expected, reply) in script {
                let mut line = String::new();
                if server.read_line(&mut line).await.unwrap() == 0 {
                    break;
                }
                assert_eq!(line.trim_end(), expected);
                received.push(line.trim_end().to_string());
                server.write_all(reply.as_bytes()).await.unwrap();
            }
            received
        })
    }

    fn fetch_response(seq: u32, subject: &str, body: &str) -> String {
        format!(
            "* {seq} FETCH (ENVELOPE (NIL \"{subject}\" ((NIL NIL \"alice\" \"example.com\")) NIL NIL NIL NIL NIL NIL NIL) BODY[] {{{}}}\r\n{body})\r\n",
            body.len()
        )
    }

    #[tokio::test]
    async fn login_select_search_logout() {
        let (client, server) = duplex(64 * 1024);
        let server = spawn_server(
            server,
            "* OK IMAP4rev1 ready\r\n",
            vec![
                (r#"A0001 LOGIN "bot@test.com" "p\"ss""#, "A0001 OK LOGIN completed\r\n".into()),
                (r#"A0002 SELECT "INBOX""#, "* 3 EXISTS\r\nA0002 OK [READ-WRITE] SELECT completed\r\n".into()),
                (
                    r#"A0003 SEARCH UNSEEN SUBJECT "gpt-go-email""#,
                    "* SEARCH 1 3\r\nA0003 OK SEARCH completed\r\n".into(),
                ),
                ("A0004 LOGOUT", "* BYE logging out\r\nA0004 OK LOGOUT completed\r\n".into()),
            ],
        );

        let mut session = ImapSession::establish(client, &config()).await.unwrap();
        session.select_inbox().await.unwrap();
        let ids = session
            .search(&SearchCriteria::unseen_with_subject("gpt-go-email"))
            .await
            .unwrap();
        assert_eq!(ids, vec![1, 3]);
        Box::new(session).close().await.unwrap();

        assert_eq!(server.await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn rejected_login_is_auth_error() {
        let (client, server) = duplex(4096);
        let _server = spawn_server(
            server,
            "* OK ready\r\n",
            vec![(
                r#"A0001 LOGIN "bot@test.com" "p\"ss""#,
                "A0001 NO [AUTHENTICATIONFAILED] Invalid credentials\r\n".into(),
            )],
        );
        let err = ImapSession::establish(client, &config()).await.err().unwrap();
        assert!(matches!(err, MailboxError::Auth { .. }));
    }

    #[tokio::test]
    async fn bye_greeting_is_connection_error() {
        let (client, server) = duplex(4096);
        let _server = spawn_server(server, "* BYE too many connections\r\n", vec![]);
        let err = ImapSession::establish(client, &config()).await.err().unwrap();
        assert!(matches!(err, MailboxError::Connection { .. }));
    }

    #[tokio::test]
    async fn failed_select_reported() {
        let (client, server) = duplex(4096);
        let _server = spawn_server(
            server,
            "* PREAUTH ready\r\n",
            vec![(r#"A0001 SELECT "INBOX""#, "A0001 NO no such mailbox\r\n".into())],
        );
        let mut session = ImapSession::establish(client, &config()).await.unwrap();
        let err = session.select_inbox().await.unwrap_err();
        assert!(matches!(err, MailboxError::Select { ref mailbox, .. } if mailbox == "INBOX"));
    }

    #[tokio::test]
    async fn fetch_streams_each_message() {
        let (client, server) = duplex(64 * 1024);
        let reply = format!(
            "{}* 4 EXISTS\r\n{}A0001 OK FETCH completed\r\n",
            fetch_response(1, "gpt-go-email", "Subject: a\r\n\r\nfirst\r\n"),
            fetch_response(3, "gpt-go-email", "Subject: b\r\n\r\nsecond\r\n"),
        );
        let _server = spawn_server(
            server,
            "* PREAUTH ready\r\n",
            vec![("A0001 FETCH 1,3 (ENVELOPE BODY[])", reply)],
        );

        let mut session = ImapSession::establish(client, &config()).await.unwrap();
        let (tx, mut rx) = mpsc::channel(crate::mailbox::FETCH_BUFFER);
        let delivered = session.stream_fetch(&[3, 1], tx).await.unwrap();
        assert_eq!(delivered, 2);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(first.sender().as_deref(), Some("alice@example.com"));
        assert_eq!(first.body.as_deref(), Some(&b"Subject: a\r\n\r\nfirst\r\n"[..]));
        assert_eq!(rx.recv().await.unwrap().seq, 3);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn fetch_drains_when_consumer_dropped() {
        let (client, server) = duplex(64 * 1024);
        let reply = format!(
            "{}{}A0001 OK FETCH completed\r\n",
            fetch_response(1, "t", "one"),
            fetch_response(2, "t", "two"),
        );
        let _server = spawn_server(
            server,
            "* PREAUTH ready\r\n",
            vec![
                ("A0001 FETCH 1:2 (ENVELOPE BODY[])", reply),
                ("A0002 LOGOUT", "A0002 OK bye\r\n".into()),
            ],
        );

        let mut session = ImapSession::establish(client, &config()).await.unwrap();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let delivered = session.stream_fetch(&[1, 2], tx).await.unwrap();
        assert_eq!(delivered, 0);
        Box::new(session).close().await.unwrap();
    }

    fn envelope_only(seq: u32) -> String {
        format!(
            "* {seq} FETCH (ENVELOPE (NIL \"t\" ((NIL NIL \"alice\" \"example.com\")) NIL NIL NIL NIL NIL NIL NIL))\r\n"
        )
    }

    fn body_only(seq: u32, body: &str) -> String {
        format!("* {seq} FETCH (BODY[] {{{}}}\r\n{body})\r\n", body.len())
    }

    async fn fetch_all(reply: String, ids: &[u32]) -> (Result<usize, MailboxError>, Vec<CandidateMessage>) {
        let (client, server) = duplex(64 * 1024);
        let command: &'static str = match ids {
            [1] => "A0001 FETCH 1 (ENVELOPE BODY[])",
            _ => "A0001 FETCH 1:2 (ENVELOPE BODY[])",
        };
        let _server = spawn_server(server, "* PREAUTH ready\r\n", vec![(command, reply)]);

        let mut session = ImapSession::establish(client, &config()).await.unwrap();
        let (tx, mut rx) = mpsc::channel(crate::mailbox::FETCH_BUFFER);
        let result = session.stream_fetch(ids, tx).await;
        let mut received = Vec::new();
        while let Some(message) = rx.recv().await {
            received.push(message);
        }
        (result, received)
    }

    #[tokio::test]
    async fn flag_updates_and_unrequested_messages_ignored() {
        let reply = format!(
            "* 9 FETCH (FLAGS (\\Seen))\r\n* 1 FETCH (FLAGS (\\Seen))\r\n{}* 1 FETCH (FLAGS (\\Seen))\r\n{}A0001 OK FETCH completed\r\n",
            fetch_response(1, "t", "one"),
            fetch_response(9, "t", "nine"),
        );

        let (result, received) = fetch_all(reply, &[1]).await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].seq, 1);
        assert_eq!(received[0].sender().as_deref(), Some("alice@example.com"));
        assert_eq!(received[0].body.as_deref(), Some(&b"one"[..]));
    }

    #[tokio::test]
    async fn split_fetch_responses_merged_into_one_message() {
        let reply = format!(
            "{}{}A0001 OK FETCH completed\r\n",
            envelope_only(1),
            body_only(1, "Subject: t\r\n\r\nhello"),
        );

        let (result, received) = fetch_all(reply, &[1]).await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].sender().as_deref(), Some("alice@example.com"));
        assert_eq!(
            received[0].body.as_deref(),
            Some(&b"Subject: t\r\n\r\nhello"[..])
        );
    }

    #[tokio::test]
    async fn partial_message_released_at_completion() {
        let reply = format!(
            "{}{}A0001 OK FETCH completed\r\n",
            envelope_only(2),
            fetch_response(1, "t", "one"),
        );

        let (result, received) = fetch_all(reply, &[1, 2]).await;

        assert_eq!(result.unwrap(), 2);
        let seqs: Vec<_> = received.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert!(received[1].envelope.is_some());
        assert!(received[1].body.is_none());
    }

    #[tokio::test]
    async fn malformed_fetch_reported_after_the_rest_delivered() {
        let reply = format!(
            "* 1 FETCH (ENVELOPE (NIL \"t\"))\r\n{}A0001 OK FETCH completed\r\n",
            fetch_response(2, "t", "two"),
        );

        let (result, received) = fetch_all(reply, &[1, 2]).await;

        assert!(matches!(result, Err(MailboxError::Protocol(_))));
        let seqs: Vec<_> = received.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![2]);
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let (client, _server) = duplex(4096);
        let mut cfg = config();
        cfg.timeout = Duration::from_millis(50);
        let err = ImapSession::establish(client, &cfg).await.err().unwrap();
        assert!(matches!(err, MailboxError::Timeout { operation: "greeting", .. }));
    }

    #[test]
    fn literal_marker_detected() {
        assert_eq!(literal_len(b"* 1 FETCH (BODY[] {42}\r\n"), Some(42));
        assert_eq!(literal_len(b"* 1 FETCH (BODY[] {7+}\r\n"), Some(7));
        assert_eq!(literal_len(b"* 1 FETCH (FLAGS (\\Seen))\r\n"), None);
        assert_eq!(literal_len(b"{12} in the middle\r\n"), None);
    }

    #[test]
    fn quote_escapes() {
        assert_eq!(quote("plain"), "\"plain\"");
        assert_eq!(quote(r#"a"b\c"#), r#""a\"b\\c""#);
    }
}
