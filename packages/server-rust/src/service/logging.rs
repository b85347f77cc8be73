//! Request-scoped logging over `tracing`, and process subscriber setup.
//!
//! `tracing` macros need field names at compile time, while request context
//! fields (endpoint id, request UUID, trace id, user-supplied fields) are
//! only known at runtime. [`ContextLogger`] carries those pairs and renders
//! them into a single `ctx` field on every event it emits.

use std::fmt;
use std::fs::OpenOptions;
use std::sync::Arc;

use switchyard_core::StaticConfig;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

// ---------------------------------------------------------------------------
// ContextLogger
// ---------------------------------------------------------------------------

/// Structured logger stamped with request-scoped fields.
#[derive(Debug, Clone, Default)]
pub struct ContextLogger {
    fields: Vec<(String, String)>,
}

impl ContextLogger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a logger with one more field. A repeated key replaces the
    /// earlier value.
    #[must_use]
    pub fn with_field(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut out = self.clone();
        out.push_field(key, value);
        out
    }

    pub fn push_field(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((key, value)),
        }
    }

    #[must_use]
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    pub fn log(&self, level: Level, message: &str) {
        let ctx = RenderedFields(&self.fields);
        match level {
            Level::ERROR => tracing::error!(ctx = %ctx, "{message}"),
            Level::WARN => tracing::warn!(ctx = %ctx, "{message}"),
            Level::INFO => tracing::info!(ctx = %ctx, "{message}"),
            Level::DEBUG => tracing::debug!(ctx = %ctx, "{message}"),
            _ => tracing::trace!(ctx = %ctx, "{message}"),
        }
    }

    pub fn debug(&self, message: &str) {
        self.log(Level::DEBUG, message);
    }

    pub fn info(&self, message: &str) {
        self.log(Level::INFO, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(Level::WARN, message);
    }

    pub fn error(&self, message: &str) {
        self.log(Level::ERROR, message);
    }
}

struct RenderedFields<'a>(&'a [(String, String)]);

impl fmt::Display for RenderedFields<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{k}={v}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Subscriber setup
// ---------------------------------------------------------------------------

/// Console line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Console,
    Json,
}

/// Logger settings read from `logger.*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggerConfig {
    pub output: LogOutput,
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// When set, every event is also appended to this file as JSON.
    pub file_name: Option<String>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            output: LogOutput::Console,
            level: "info".to_string(),
            file_name: None,
        }
    }
}

impl LoggerConfig {
    /// Reads `logger.output`, `logger.level` and `logger.fileName`.
    ///
    /// # Errors
    ///
    /// Returns an error for a mistyped key or an unknown output name.
    pub fn from_config(config: &StaticConfig) -> anyhow::Result<Self> {
        let output = match config.string_or("logger.output", "console")?.as_str() {
            "console" | "stdout" => LogOutput::Console,
            "json" => LogOutput::Json,
            other => anyhow::bail!("unknown logger.output: {other}"),
        };
        Ok(Self {
            output,
            level: config.string_or("logger.level", "info")?,
            file_name: config.optional_string("logger.fileName")?,
        })
    }
}

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` overrides `logger.level` when present.
///
/// # Errors
///
/// Fails if the log file cannot be opened or a global subscriber is
/// already installed.
pub fn init_logging(config: &LoggerConfig) -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.level.clone().into());

    let console = match config.output {
        LogOutput::Json => tracing_subscriber::fmt::layer().json().boxed(),
        LogOutput::Console => tracing_subscriber::fmt::layer().boxed(),
    };

    let file = match &config.file_name {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(Arc::new(file))
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file)
        .try_init()?;
    Ok(())
}
