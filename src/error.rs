//! Error types for the mail responder.

use std::time::Duration;

/// Errors wiring the responder together at startup.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Completion client error: {0}")]
    Completion(#[from] CompletionError),

    #[error("Reply transport error: {0}")]
    Send(#[from] SendError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Mailbox Service (IMAP) errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Failed to connect to {host}:{port}: {reason}")]
    Connection {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Authentication failed for {username}: {reason}")]
    Auth { username: String, reason: String },

    #[error("SELECT {mailbox} failed: {reason}")]
    Select { mailbox: String, reason: String },

    #[error("SEARCH failed: {0}")]
    Search(String),

    #[error("FETCH failed: {0}")]
    Fetch(String),

    #[error("Malformed server response: {0}")]
    Protocol(String),

    #[error("Mailbox {operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// MIME decoding errors. Any of these aborts the rest of the poll cycle.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Message {seq} has no parseable MIME structure")]
    Unparseable { seq: u32 },

    #[error("Message {seq} part {part} has an invalid Content-Type: {value}")]
    MediaType { seq: u32, part: usize, value: String },
}

/// Completion Service errors. Recovered by the orchestrator with a fallback reply.
#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("Completion request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Completion service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid completion response: {0}")]
    InvalidResponse(String),

    #[error("Completion response contained no choices")]
    EmptyChoices,
}

/// Mail Transfer (SMTP) errors. Recovered by the orchestrator; the reply is dropped.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Invalid {field} address {address}: {reason}")]
    Address {
        field: &'static str,
        address: String,
        reason: String,
    },

    #[error("Failed to build reply: {0}")]
    Build(String),

    #[error("SMTP transport error: {0}")]
    Transport(String),

    #[error("Reply task failed: {0}")]
    Task(String),
}

/// Errors that end a poll cycle early.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
}

/// Result type alias for the responder.
pub type Result<T> = std::result::Result<T, Error>;
