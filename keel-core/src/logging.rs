use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::config::{ConfigError, ConfigProperties, KeelConfig};

/// Output format of the console log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// `log.*` configuration section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Filter directives used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            filter: "info".to_string(),
        }
    }
}

impl ConfigProperties for LogConfig {
    fn prefix() -> &'static str {
        "log"
    }

    fn from_config(config: &KeelConfig) -> Result<Self, ConfigError> {
        let format_key = Self::key("format");
        let format = match config
            .get_or::<String>(&format_key, "pretty".to_string())?
            .to_ascii_lowercase()
            .as_str()
        {
            "pretty" => LogFormat::Pretty,
            "json" => LogFormat::Json,
            other => {
                return Err(ConfigError::Invalid {
                    key: format_key,
                    message: format!("unknown log format '{other}', expected 'pretty' or 'json'"),
                })
            }
        };
        Ok(Self {
            format,
            filter: config.get_or(&Self::key("filter"), "info".to_string())?,
        })
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured filter. Fails instead of
/// panicking if a subscriber is already installed.
pub fn init_tracing(config: &LogConfig) -> Result<(), TryInitError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    match config.format {
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false);
            Registry::default()
                .with(env_filter)
                .with(fmt_layer)
                .try_init()
        }
        LogFormat::Pretty => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false);
            Registry::default()
                .with(env_filter)
                .with(fmt_layer)
                .try_init()
        }
    }
}
