//! Configuration types, built from environment variables.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default subject tag filtered on and echoed in reply subjects.
pub const DEFAULT_SUBJECT_TAG: &str = "gpt-go-email";

/// Reply body sent when the completion service fails.
pub const DEFAULT_FALLBACK_REPLY: &str =
    "There was an error generating a response. Sorry for the delay.";

pub const DEFAULT_COMPLETION_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_COMPLETION_MODEL: &str = "gpt-3.5-turbo";

/// Mailbox Service (IMAP) connection settings.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub host: String,
    pub port: u16,
    pub mailbox: String,
    pub username: String,
    pub password: SecretString,
    /// Applied to every read, write and command on the session.
    pub timeout: Duration,
}

/// How the SMTP connection is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpSecurity {
    /// Implicit TLS (usually port 465).
    Tls,
    /// Plain connect upgraded with STARTTLS (usually port 587).
    StartTls,
}

impl SmtpSecurity {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tls" | "ssl" => Ok(Self::Tls),
            "starttls" => Ok(Self::StartTls),
            other => Err(ConfigError::InvalidValue {
                key: "SMTP_SECURITY".into(),
                message: format!("expected 'tls' or 'starttls', got '{other}'"),
            }),
        }
    }

    fn for_port(port: u16) -> Self {
        if port == 465 { Self::Tls } else { Self::StartTls }
    }
}

/// Mail Transfer (SMTP) settings.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub security: SmtpSecurity,
    pub username: String,
    pub password: SecretString,
    pub timeout: Duration,
}

/// Completion Service settings.
#[derive(Debug, Clone)]
pub struct CompletionConfig {
    pub endpoint: String,
    pub api_key: SecretString,
    pub model: String,
    pub timeout: Duration,
}

/// Everything the responder needs to run.
#[derive(Debug, Clone)]
pub struct ResponderConfig {
    pub mailbox: MailboxConfig,
    pub smtp: SmtpConfig,
    pub completion: CompletionConfig,
    pub subject_tag: String,
    pub fallback_reply: String,
    pub poll_interval: Duration,
}

impl ResponderConfig {
    /// Build config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| -> Result<String, ConfigError> {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
        };
        let optional = |key: &str, default: &str| -> String {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let timeout = Duration::from_secs(parse_number(&lookup, "NETWORK_TIMEOUT_SECS", 30)?);

        let mailbox = MailboxConfig {
            host: optional("IMAP_HOST", "imap.gmail.com"),
            port: parse_number(&lookup, "IMAP_PORT", 993)?,
            mailbox: optional("IMAP_MAILBOX", "INBOX"),
            username: required("EMAIL_USERNAME")?,
            password: SecretString::from(required("EMAIL_PASSWORD")?),
            timeout,
        };

        let smtp_port: u16 = parse_number(&lookup, "SMTP_PORT", 587)?;
        let security = match lookup("SMTP_SECURITY") {
            Some(v) if !v.trim().is_empty() => SmtpSecurity::parse(&v)?,
            _ => SmtpSecurity::for_port(smtp_port),
        };
        let smtp = SmtpConfig {
            host: required("SMTP_SERVER")?,
            port: smtp_port,
            security,
            username: required("SMTP_USERNAME")?,
            password: SecretString::from(required("SMTP_PASSWORD")?),
            timeout,
        };

        let completion = CompletionConfig {
            endpoint: optional("COMPLETION_ENDPOINT", DEFAULT_COMPLETION_ENDPOINT),
            api_key: SecretString::from(required("OPENAI_API_KEY")?),
            model: optional("COMPLETION_MODEL", DEFAULT_COMPLETION_MODEL),
            timeout,
        };

        let poll_secs: u64 = parse_number(&lookup, "POLL_INTERVAL_SECS", 10)?;
        if poll_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "POLL_INTERVAL_SECS".into(),
                message: "must be greater than zero".into(),
            });
        }

        // SEARCH sends the tag as a quoted string, which only carries US-ASCII
        // without a CHARSET literal.
        let subject_tag = optional("SUBJECT_TAG", DEFAULT_SUBJECT_TAG);
        if !subject_tag.bytes().all(|b| b.is_ascii() && !b.is_ascii_control()) {
            return Err(ConfigError::InvalidValue {
                key: "SUBJECT_TAG".into(),
                message: "must be printable US-ASCII".into(),
            });
        }

        Ok(Self {
            mailbox,
            smtp,
            completion,
            subject_tag,
            fallback_reply: optional("FALLBACK_REPLY", DEFAULT_FALLBACK_REPLY),
            poll_interval: Duration::from_secs(poll_secs),
        })
    }
}

/// `Re:<tag>`, without a space, matching what senders filter on.
pub fn reply_subject(tag: &str) -> String {
    format!("Re:{tag}")
}

fn parse_number<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
        }
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("EMAIL_USERNAME", "bot@example.com"),
            ("EMAIL_PASSWORD", "imap-secret"),
            ("SMTP_SERVER", "smtp.example.com"),
            ("SMTP_USERNAME", "bot@example.com"),
            ("SMTP_PASSWORD", "smtp-secret"),
            ("OPENAI_API_KEY", "sk-test"),
        ])
    }

    fn load(env: &HashMap<&'static str, &'static str>) -> Result<ResponderConfig, ConfigError> {
        ResponderConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()))
    }

    #[test]
    fn defaults_applied() {
        let cfg = load(&base_env()).unwrap();
        assert_eq!(cfg.mailbox.host, "imap.gmail.com");
        assert_eq!(cfg.mailbox.port, 993);
        assert_eq!(cfg.mailbox.mailbox, "INBOX");
        assert_eq!(cfg.smtp.port, 587);
        assert_eq!(cfg.smtp.security, SmtpSecurity::StartTls);
        assert_eq!(cfg.completion.model, DEFAULT_COMPLETION_MODEL);
        assert_eq!(cfg.completion.endpoint, DEFAULT_COMPLETION_ENDPOINT);
        assert_eq!(cfg.subject_tag, DEFAULT_SUBJECT_TAG);
        assert_eq!(cfg.fallback_reply, DEFAULT_FALLBACK_REPLY);
        assert_eq!(cfg.poll_interval, Duration::from_secs(10));
        assert_eq!(cfg.mailbox.timeout, Duration::from_secs(30));
        assert_eq!(cfg.mailbox.password.expose_secret(), "imap-secret");
    }

    #[test]
    fn missing_required_var() {
        let mut env = base_env();
        env.remove("OPENAI_API_KEY");
        let err = load(&env).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "OPENAI_API_KEY"));
    }

    #[test]
    fn blank_required_var_is_missing() {
        let mut env = base_env();
        env.insert("EMAIL_PASSWORD", "   ");
        assert!(matches!(load(&env), Err(ConfigError::MissingEnvVar(_))));
    }

    #[test]
    fn invalid_port_rejected() {
        let mut env = base_env();
        env.insert("IMAP_PORT", "not-a-port");
        let err = load(&env).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "IMAP_PORT"));
    }

    #[test]
    fn zero_poll_interval_rejected() {
        let mut env = base_env();
        env.insert("POLL_INTERVAL_SECS", "0");
        assert!(matches!(load(&env), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn smtp_security_follows_port() {
        let mut env = base_env();
        env.insert("SMTP_PORT", "465");
        assert_eq!(load(&env).unwrap().smtp.security, SmtpSecurity::Tls);
    }

    #[test]
    fn smtp_security_explicit_override() {
        let mut env = base_env();
        env.insert("SMTP_PORT", "465");
        env.insert("SMTP_SECURITY", "STARTTLS");
        assert_eq!(load(&env).unwrap().smtp.security, SmtpSecurity::StartTls);

        env.insert("SMTP_SECURITY", "carrier-pigeon");
        assert!(load(&env).is_err());
    }

    #[test]
    fn reply_subject_has_no_space() {
        assert_eq!(reply_subject("ask-bot"), "Re:ask-bot");
    }

    #[test]
    fn subject_tag_must_be_plain_ascii() {
        let mut env = base_env();
        env.insert("SUBJECT_TAG", "pregunta-é");
        let err = load(&env).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "SUBJECT_TAG"));

        env.insert("SUBJECT_TAG", "bad\r\ntag");
        assert!(matches!(load(&env), Err(ConfigError::InvalidValue { .. })));

        env.insert("SUBJECT_TAG", "ask \"bot\"");
        assert_eq!(load(&env).unwrap().subject_tag, "ask \"bot\"");
    }
}
