//! Tracing/logging initialization.
//!
//! The filter always comes from `RUST_LOG` when set; [`LogConfig`] only picks
//! the fallback filter and the output format.

use tracing_subscriber::EnvFilter;

/// Output format of the fmt subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl LogFormat {
    /// Parse `json` / `pretty` (case-insensitive); anything else is `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" | "text" => Some(Self::Pretty),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Directive used when `RUST_LOG` is unset or invalid.
    pub default_filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            default_filter: "info".to_string(),
        }
    }
}

impl LogConfig {
    /// Read `BUDGET_LOG_FORMAT`; unset or unrecognised values keep the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let format = lookup("BUDGET_LOG_FORMAT")
            .and_then(|v| LogFormat::parse(&v))
            .unwrap_or_default();
        Self {
            format,
            ..Self::default()
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_default_filter(mut self, filter: impl Into<String>) -> Self {
        self.default_filter = filter.into();
        self
    }
}

/// Initialize tracing/logging with the default configuration.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with(LogConfig::default());
}

/// Initialize tracing/logging with an explicit configuration.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_with(config: LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false);

    let _ = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_from_lookup() {
        let cfg = LogConfig::from_lookup(|key| (key == "BUDGET_LOG_FORMAT").then(|| "Pretty".to_string()));
        assert_eq!(cfg.format, LogFormat::Pretty);
        assert_eq!(cfg.default_filter, "info");

        let cfg = LogConfig::from_lookup(|_| Some("xml".to_string()));
        assert_eq!(cfg.format, LogFormat::Json);
    }

    #[test]
    fn init_twice_is_a_noop() {
        init_with(LogConfig::default().with_default_filter("debug"));
        init();
    }
}
