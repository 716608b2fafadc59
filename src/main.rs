use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use mail_responder::config::ResponderConfig;
use mail_responder::error;
use mail_responder::pipeline::Responder;
use mail_responder::scheduler::spawn_scheduler;

/// Console logging always; a daily rolling file as well when `RESPONDER_LOG_DIR` is set.
fn init_tracing() -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    let (file_layer, guard) = match std::env::var("RESPONDER_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("mail-responder")
                .build(&dir)
                .with_context(|| format!("failed to open log directory {dir}"))?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .init();
    Ok(guard)
}

/// Read the environment and build the production responder.
fn load() -> error::Result<(ResponderConfig, Responder)> {
    let config = ResponderConfig::from_env()?;
    let responder = Responder::from_config(&config)?;
    Ok((config, responder))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    let _ = rustls::crypto::ring::default_provider().install_default();

    let _log_guard = init_tracing()?;

    let (config, responder) = load().context("failed to start mail responder")?;

    eprintln!("📬 Mail Responder v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   IMAP: {}:{} ({})", config.mailbox.host, config.mailbox.port, config.mailbox.username);
    eprintln!("   SMTP: {}:{} ({:?})", config.smtp.host, config.smtp.port, config.smtp.security);
    eprintln!("   Model: {}", config.completion.model);
    eprintln!("   Subject tag: {}", config.subject_tag);
    eprintln!("   Poll interval: {}s\n", config.poll_interval.as_secs());

    let (mut handle, shutdown) = spawn_scheduler(Arc::new(responder), config.poll_interval);

    tokio::select! {
        result = &mut handle => {
            result.context("scheduler task failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupt received, stopping");
            shutdown.store(true, Ordering::Relaxed);
            handle.abort();
        }
    }

    Ok(())
}
