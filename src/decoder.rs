//! Message Decoder — extracts the plain-text body from a fetched message.
//!
//! Parts are walked in document order. Every `text/plain` part replaces the
//! running body, so the last one wins. A part whose Content-Type cannot be
//! parsed fails the whole message.

use mail_parser::{MessageParser, MessagePart, PartType};
use tracing::debug;

use crate::error::DecodeError;
use crate::mailbox::CandidateMessage;

/// Plain text recovered from a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBody {
    pub text: String,
    /// How many `text/plain` parts were seen. Only the last is kept.
    pub plain_parts: usize,
}

/// Decode `message.body`. A message without a body decodes to empty text.
pub fn decode(message: &CandidateMessage) -> Result<DecodedBody, DecodeError> {
    let Some(raw) = message.body.as_deref() else {
        return Ok(DecodedBody {
            text: String::new(),
            plain_parts: 0,
        });
    };
    decode_raw(message.seq, raw)
}

/// Decode a raw RFC 822 message.
pub fn decode_raw(seq: u32, raw: &[u8]) -> Result<DecodedBody, DecodeError> {
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or(DecodeError::Unparseable { seq })?;

    let mut body = DecodedBody {
        text: String::new(),
        plain_parts: 0,
    };

    for (index, part) in parsed.parts.iter().enumerate() {
        let media_type = match raw_content_type(raw, part) {
            Some(value) => parse_media_type(&value).ok_or(DecodeError::MediaType {
                seq,
                part: index,
                value,
            })?,
            None => "text/plain".to_string(),
        };

        if media_type != "text/plain" {
            continue;
        }
        if let Some(text) = part_text(part) {
            body.text = text;
            body.plain_parts += 1;
        }
    }

    if body.plain_parts > 1 {
        debug!(seq, parts = body.plain_parts, "Several text/plain parts, keeping the last");
    }
    Ok(body)
}

fn part_text(part: &MessagePart<'_>) -> Option<String> {
    match &part.body {
        PartType::Text(text) => Some(text.to_string()),
        PartType::Binary(bytes) | PartType::InlineBinary(bytes) => {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
        // Multipart containers and attached messages are not leaf text.
        _ => None,
    }
}

/// Unfolded Content-Type value from the part's raw header block.
fn raw_content_type(raw: &[u8], part: &MessagePart<'_>) -> Option<String> {
    let start = part.raw_header_offset() as usize;
    let end = (part.raw_body_offset() as usize).min(raw.len());
    if start >= end {
        return None;
    }
    let block = String::from_utf8_lossy(&raw[start..end]);

    let mut fields: Vec<String> = Vec::new();
    for line in block.split('\n') {
        let line = line.trim_end_matches('\r');
        if line.starts_with([' ', '\t']) {
            if let Some(last) = fields.last_mut() {
                last.push(' ');
                last.push_str(line.trim_start());
            }
            continue;
        }
        fields.push(line.to_string());
    }

    fields.into_iter().find_map(|field| {
        let (name, value) = field.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("content-type")
            .then(|| value.trim().to_string())
    })
}

/// Lower-cased `type/subtype` of a Content-Type value.
/// `None` when the media type or any of its parameters is malformed.
pub fn parse_media_type(value: &str) -> Option<String> {
    let (essence, params) = value.split_at(value.find(';').unwrap_or(value.len()));
    let (kind, subtype) = essence.trim().split_once('/')?;
    let (kind, subtype) = (kind.trim(), subtype.trim());
    if !is_token(kind) || !is_token(subtype) || !parameters_valid(params) {
        return None;
    }
    Some(format!("{}/{}", kind.to_ascii_lowercase(), subtype.to_ascii_lowercase()))
}

/// `*(";" attribute "=" value)` where value is a token or a quoted string.
/// A trailing `;` is tolerated.
fn parameters_valid(mut rest: &str) -> bool {
    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            return true;
        }
        let Some(param) = rest.strip_prefix(';') else {
            return false;
        };
        let param = param.trim_start();
        if param.is_empty() {
            return true;
        }
        let Some((name, value)) = param.split_once('=') else {
            return false;
        };
        if !is_token(name.trim()) {
            return false;
        }
        let value = value.trim_start();
        rest = match value.strip_prefix('"') {
            Some(quoted) => match skip_quoted(quoted) {
                Some(after) => after,
                None => return false,
            },
            None => {
                let end = value
                    .find(|c: char| c == ';' || c.is_ascii_whitespace())
                    .unwrap_or(value.len());
                if !is_token(&value[..end]) {
                    return false;
                }
                &value[end..]
            }
        };
    }
}

/// Text after the closing quote of a quoted string whose opening quote is
/// already consumed.
fn skip_quoted(s: &str) -> Option<&str> {
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '"' => return Some(&s[i + 1..]),
            _ => {}
        }
    }
    None
}

/// RFC 2045 token: printable ASCII without spaces or tspecials.
fn is_token(s: &str) -> bool {
    const TSPECIALS: &[u8] = b"()<>@,;:\\\"/[]?=";
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_graphic() && !TSPECIALS.contains(&b))
}
