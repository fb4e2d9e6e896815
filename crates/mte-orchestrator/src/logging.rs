//! Dual-channel reporting: short progress lines for the operator, full
//! detail (including error chains) for the log file.

use anyhow::{anyhow, Context, Result};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub const GENERIC_FAILURE: &str = "An error occurred. See log file for more information.";

/// Receives operator-facing progress messages.
pub trait OutputSink: Send + Sync {
    fn out(&self, message: &str);
}

struct Discard;

impl OutputSink for Discard {
    fn out(&self, _message: &str) {}
}

/// Passed explicitly to every component that reports progress.
#[derive(Clone)]
pub struct LogContext {
    sink: Arc<dyn OutputSink>,
    debug: bool,
}

impl LogContext {
    pub fn new(sink: Arc<dyn OutputSink>, debug: bool) -> Self {
        Self { sink, debug }
    }

    pub fn silent() -> Self {
        Self::new(Arc::new(Discard), false)
    }

    pub fn info(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::info!("{}", message);
        self.sink.out(message);
    }

    /// Always logged; echoed to the operator only in debug mode.
    pub fn debug(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::debug!("{}", message);
        if self.debug {
            self.sink.out(message);
        }
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::warn!("{}", message);
        self.sink.out(message);
    }

    /// Reports a failure: a short message on the sink, the full chain in the
    /// log. Hands the error back so call sites can `return Err(log.error(..))`.
    pub fn error<E>(&self, err: E, message: Option<&str>) -> anyhow::Error
    where
        E: Into<anyhow::Error>,
    {
        let err = err.into();
        let message = message.unwrap_or(GENERIC_FAILURE);
        tracing::error!("{}\n{:#}", message, err);
        self.sink.out(message);
        err
    }
}

/// Installs the process-wide subscriber appending to `path`.
pub fn init_file_log(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        mte_core::ensure_dir(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("log_open_failed: {}", path.display()))?;
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init()
        .map_err(|e| anyhow!("log_init_failed: {}", e))
}
