//! Parsing of IMAP server responses: tagged status lines, SEARCH results and
//! FETCH responses carrying `ENVELOPE` and `BODY[]`.
//!
//! A "response unit" is one complete server response as read off the wire,
//! including any `{n}` literals and the lines that follow them.

use mail_parser::MessageParser;

use crate::error::MailboxError;
use crate::mailbox::{Address, CandidateMessage, Envelope};

/// A parsed IMAP data item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Nil,
    Atom(String),
    Str(Vec<u8>),
    List(Vec<Value>),
}

impl Value {
    /// Text of a string or atom; `None` for NIL and lists.
    fn text(&self) -> Option<String> {
        match self {
            Value::Str(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            Value::Atom(a) => Some(a.clone()),
            _ => None,
        }
    }
}

/// Completion result of a tagged command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub ok: bool,
    pub text: String,
}

/// If `unit` is the tagged completion for `tag`, return its status.
pub fn tagged_status(unit: &[u8], tag: &str) -> Option<Status> {
    let rest = unit.strip_prefix(tag.as_bytes())?.strip_prefix(b" ")?;
    let text = String::from_utf8_lossy(rest).trim_end().to_string();
    let ok = text
        .split_whitespace()
        .next()
        .is_some_and(|word| word.eq_ignore_ascii_case("OK"));
    Some(Status { ok, text })
}

/// Sequence numbers from `* SEARCH` untagged responses.
pub fn parse_search(units: &[Vec<u8>]) -> Vec<u32> {
    units
        .iter()
        .map(|unit| String::from_utf8_lossy(unit).into_owned())
        .filter(|line| {
            line.get(..8)
                .is_some_and(|head| head.eq_ignore_ascii_case("* SEARCH"))
        })
        .flat_map(|line| {
            line.split_whitespace()
                .skip(2)
                .filter_map(|s| s.parse::<u32>().ok())
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Parse an untagged `* <seq> FETCH (...)` response.
///
/// Returns `Ok(None)` for untagged responses that are not FETCH data
/// (`* 3 EXISTS`, `* OK ...`).
pub fn parse_fetch(unit: &[u8]) -> Result<Option<CandidateMessage>, MailboxError> {
    let mut parser = Parser::new(unit);
    if !parser.eat(b"* ") {
        return Ok(None);
    }
    let Value::Atom(seq) = parser.value()? else {
        return Ok(None);
    };
    let Ok(seq) = seq.parse::<u32>() else {
        return Ok(None);
    };
    parser.skip_spaces();
    let Value::Atom(kind) = parser.value()? else {
        return Ok(None);
    };
    if !kind.eq_ignore_ascii_case("FETCH") {
        return Ok(None);
    }
    parser.skip_spaces();
    let Value::List(items) = parser.value()? else {
        return Err(MailboxError::Protocol(format!(
            "FETCH {seq} is not followed by a data list"
        )));
    };

    let mut message = CandidateMessage {
        seq,
        envelope: None,
        body: None,
    };
    let mut items = items.into_iter();
    while let Some(key) = items.next() {
        let value = items.next().ok_or_else(|| {
            MailboxError::Protocol(format!("FETCH {seq} has a data item without a value"))
        })?;
        let Value::Atom(key) = key else {
            return Err(MailboxError::Protocol(format!(
                "FETCH {seq} has a non-atom item name"
            )));
        };
        match key.to_ascii_uppercase().as_str() {
            "ENVELOPE" => message.envelope = Some(parse_envelope(&value)?),
            "BODY[]" | "RFC822" => {
                message.body = match value {
                    Value::Str(bytes) => Some(bytes),
                    _ => None,
                }
            }
            _ => {}
        }
    }
    Ok(Some(message))
}

/// Sequence number of an untagged `* <seq> ...` response, read without
/// parsing the rest.
pub fn fetch_seq(unit: &[u8]) -> Option<u32> {
    let rest = unit.strip_prefix(b"* ")?;
    let end = rest.iter().position(|b| !b.is_ascii_digit())?;
    std::str::from_utf8(&rest[..end]).ok()?.parse().ok()
}

/// `(date subject from sender reply-to to cc bcc in-reply-to message-id)`
fn parse_envelope(value: &Value) -> Result<Envelope, MailboxError> {
    let Value::List(fields) = value else {
        return Err(MailboxError::Protocol("ENVELOPE is not a list".into()));
    };
    if fields.len() < 10 {
        return Err(MailboxError::Protocol(format!(
            "ENVELOPE has {} fields, expected 10",
            fields.len()
        )));
    }
    Ok(Envelope {
        date: fields[0].text(),
        subject: fields[1].text().map(|s| decode_encoded_words(&s)),
        from: parse_addresses(&fields[2]),
        message_id: fields[9].text(),
    })
}

fn parse_addresses(value: &Value) -> Vec<Address> {
    let Value::List(entries) = value else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| match entry {
            Value::List(parts) if parts.len() == 4 => Some(Address {
                name: parts[0].text().map(|s| decode_encoded_words(&s)),
                mailbox: parts[2].text(),
                host: parts[3].text(),
            }),
            _ => None,
        })
        .collect()
}

/// Decode RFC 2047 encoded words (`=?UTF-8?B?...?=`) by letting mail-parser
/// read the text as a Subject header.
pub fn decode_encoded_words(raw: &str) -> String {
    if !raw.contains("=?") {
        return raw.to_string();
    }
    let header = format!("Subject: {raw}\r\n\r\n");
    MessageParser::default()
        .parse(header.as_bytes())
        .and_then(|m| m.subject().map(str::to_string))
        .unwrap_or_else(|| raw.to_string())
}

/// Parser over one response unit.
struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn eat(&mut self, prefix: &[u8]) -> bool {
        if self.input[self.pos..].starts_with(prefix) {
            self.pos += prefix.len();
            true
        } else {
            false
        }
    }

    fn skip_spaces(&mut self) {
        while self.peek() == Some(b' ') {
            self.pos += 1;
        }
    }

    fn error(&self, what: &str) -> MailboxError {
        MailboxError::Protocol(format!("{what} at byte {}", self.pos))
    }

    fn value(&mut self) -> Result<Value, MailboxError> {
        self.skip_spaces();
        match self.peek() {
            None => Err(self.error("unexpected end of response")),
            Some(b'(') => self.list(),
            Some(b'"') => self.quoted(),
            Some(b'{') => self.literal(),
            Some(b')') | Some(b'\r') | Some(b'\n') => Err(self.error("expected a value")),
            Some(_) => {
                let atom = self.atom();
                if atom.eq_ignore_ascii_case("NIL") {
                    Ok(Value::Nil)
                } else {
                    Ok(Value::Atom(atom))
                }
            }
        }
    }

    fn list(&mut self) -> Result<Value, MailboxError> {
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            self.skip_spaces();
            match self.peek() {
                Some(b')') => {
                    self.pos += 1;
                    return Ok(Value::List(items));
                }
                None => return Err(self.error("unterminated list")),
                _ => items.push(self.value()?),
            }
        }
    }

    fn quoted(&mut self) -> Result<Value, MailboxError> {
        self.pos += 1;
        let mut out = Vec::new();
        loop {
            match self.peek() {
                None | Some(b'\r') | Some(b'\n') => return Err(self.error("unterminated string")),
                Some(b'"') => {
                    self.pos += 1;
                    return Ok(Value::Str(out));
                }
                Some(b'\\') => {
                    self.pos += 1;
                    let escaped = self.peek().ok_or_else(|| self.error("dangling escape"))?;
                    out.push(escaped);
                    self.pos += 1;
                }
                Some(b) => {
                    out.push(b);
                    self.pos += 1;
                }
            }
        }
    }

    /// `{n}\r\n` followed by exactly n bytes. `{n+}` is accepted too.
    fn literal(&mut self) -> Result<Value, MailboxError> {
        self.pos += 1;
        let start = self.pos;
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
        }
        let len: usize = std::str::from_utf8(&self.input[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| self.error("invalid literal length"))?;
        self.eat(b"+");
        if !self.eat(b"}") {
            return Err(self.error("unterminated literal length"));
        }
        if !self.eat(b"\r\n") && !self.eat(b"\n") {
            return Err(self.error("literal length not followed by newline"));
        }
        let end = self.pos + len;
        if end > self.input.len() {
            return Err(self.error("literal runs past end of response"));
        }
        let bytes = self.input[self.pos..end].to_vec();
        self.pos = end;
        Ok(Value::Str(bytes))
    }

    /// Atoms may carry a bracketed section with spaces, e.g.
    /// `BODY[HEADER.FIELDS (SUBJECT)]`, and a `<origin>` suffix.
    fn atom(&mut self) -> String {
        let start = self.pos;
        let mut depth = 0usize;
        while let Some(b) = self.peek() {
            match b {
                b'[' => depth += 1,
                b']' => depth = depth.saturating_sub(1),
                b' ' | b'(' | b')' | b'\r' | b'\n' if depth == 0 => break,
                _ => {}
            }
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }
}
