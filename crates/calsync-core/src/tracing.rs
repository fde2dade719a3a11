//! Logging for the `calsync` binary and the library crates.
//!
//! Three presets cover how the binary runs: [`TracingConfig::cli`] for
//! one-shot commands, [`TracingConfig::cli_debug`] for `-v`, and
//! [`TracingConfig::daemon`] for `calsync run`, which logs JSON lines with
//! span open/close events so a sync job can be followed from start to finish.
//!
//! ```ignore
//! calsync_core::init_tracing(calsync_core::TracingConfig::daemon())?;
//! ```

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

/// Our crates get `TracingConfig::default_level`; everything else (reqwest,
/// hyper, rustls) gets `dependency_level`.
const OWN_CRATES: &[&str] = &[
    "calsync_core",
    "calsync_providers",
    "calsync_engine",
    "calsync_cli",
];

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("a global tracing subscriber is already installed: {0}")]
    SetGlobalSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error("invalid log filter: {0}")]
    EnvFilter(#[from] tracing_subscriber::filter::ParseError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TracingOutputFormat {
    #[default]
    Pretty,
    Compact,
    /// One JSON object per line.
    Json,
}

#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub default_level: Level,
    pub dependency_level: Level,
    pub output_format: TracingOutputFormat,
    /// Source file and line on every record.
    pub include_location: bool,
    pub include_target: bool,
    pub include_timestamp: bool,
    pub include_span_events: bool,
    /// Replaces the generated directive entirely. `RUST_LOG` is then ignored.
    pub env_filter: Option<String>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            default_level: Level::INFO,
            dependency_level: Level::WARN,
            output_format: TracingOutputFormat::Pretty,
            include_location: false,
            include_target: true,
            include_timestamp: true,
            include_span_events: false,
            env_filter: None,
        }
    }
}

impl TracingConfig {
    /// Warnings and errors only, on stderr, so stdout stays clean JSON.
    #[must_use]
    pub fn cli() -> Self {
        Self {
            default_level: Level::WARN,
            output_format: TracingOutputFormat::Compact,
            include_target: false,
            include_timestamp: false,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn cli_debug() -> Self {
        Self {
            default_level: Level::DEBUG,
            dependency_level: Level::INFO,
            include_location: true,
            ..Self::cli()
        }
        .with_target(true)
    }

    #[must_use]
    pub fn daemon() -> Self {
        Self {
            output_format: TracingOutputFormat::Json,
            include_location: true,
            include_span_events: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_level(mut self, level: Level) -> Self {
        self.default_level = level;
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: TracingOutputFormat) -> Self {
        self.output_format = format;
        self
    }

    #[must_use]
    pub fn with_target(mut self, include: bool) -> Self {
        self.include_target = include;
        self
    }

    #[must_use]
    pub fn with_env_filter(mut self, filter: impl Into<String>) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    /// e.g. `warn,calsync_core=info,calsync_providers=info,...`
    pub fn default_directive(&self) -> String {
        let own = self.default_level.as_str().to_ascii_lowercase();
        let mut directive = self.dependency_level.as_str().to_ascii_lowercase();
        for krate in OWN_CRATES {
            directive.push_str(&format!(",{krate}={own}"));
        }
        directive
    }

    /// Explicit filter first, then `RUST_LOG`, then [`Self::default_directive`].
    fn filter(&self) -> Result<EnvFilter, TracingError> {
        if let Some(directive) = &self.env_filter {
            return Ok(EnvFilter::try_new(directive)?);
        }
        match EnvFilter::try_from_default_env() {
            Ok(from_env) => Ok(from_env),
            Err(_) => Ok(EnvFilter::try_new(self.default_directive())?),
        }
    }

    fn layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let spans = if self.include_span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let base = fmt::layer()
            .with_writer(std::io::stderr)
            .with_file(self.include_location)
            .with_line_number(self.include_location)
            .with_target(self.include_target)
            .with_span_events(spans);

        match (self.output_format, self.include_timestamp) {
            (TracingOutputFormat::Json, _) => base.json().boxed(),
            (TracingOutputFormat::Pretty, true) => base.pretty().boxed(),
            (TracingOutputFormat::Pretty, false) => base.pretty().without_time().boxed(),
            (TracingOutputFormat::Compact, true) => base.compact().boxed(),
            (TracingOutputFormat::Compact, false) => base.compact().without_time().boxed(),
        }
    }
}

/// Installs the global subscriber. Call once, before the engine starts.
///
/// # Errors
///
/// The filter directive does not parse, or a subscriber is already set.
pub fn init_tracing(config: TracingConfig) -> Result<(), TracingError> {
    let filter = config.filter()?;
    let subscriber = tracing_subscriber::registry()
        .with(config.layer())
        .with(filter);
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
