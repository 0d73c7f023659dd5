//! Tracing subscriber setup for the Shutri binaries.

use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

/// Directives used by [`LogConfig::verbose`]: Shutri crates at debug, the
/// HTTP stack kept quiet.
const VERBOSE_FILTER: &str = "warn,shutri_common=debug,shutri_net=debug,shutri_sw=debug,precache=debug";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    /// One line per event.
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
    /// Adds file and line to each event and logs span closes with timings.
    pub verbose: bool,
    /// Filter directives, e.g. `"shutri_sw=debug,reqwest=warn"`. Takes
    /// precedence over `RUST_LOG` and `level`.
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new(Level::INFO)
    }
}

impl LogConfig {
    pub fn new(level: Level) -> Self {
        Self {
            level,
            format: LogFormat::Pretty,
            verbose: false,
            filter: None,
        }
    }

    /// Debug output for the Shutri crates only.
    pub fn verbose() -> Self {
        Self {
            level: Level::DEBUG,
            verbose: true,
            filter: Some(VERBOSE_FILTER.to_string()),
            ..Self::default()
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    fn env_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.level.to_string());
        match &self.filter {
            Some(directives) => EnvFilter::try_new(directives).unwrap_or_else(|_| fallback()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback()),
        }
    }
}

/// Install the global subscriber. Fails if one is already set.
pub fn init_logging(config: LogConfig) -> Result<(), TryInitError> {
    let spans = if config.verbose {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let registry = tracing_subscriber::registry().with(config.env_filter());

    match config.format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_file(config.verbose)
                    .with_line_number(config.verbose)
                    .with_span_events(spans),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_file(config.verbose)
                    .with_line_number(config.verbose)
                    .with_span_events(spans),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_span_events(spans))
            .try_init(),
    }
}
