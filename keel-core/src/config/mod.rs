mod loader;
pub mod value;

use std::collections::HashMap;
use std::path::Path;

pub use value::{ConfigValue, FromConfigValue};

/// Error type for configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config key not found: {0}")]
    NotFound(String),
    #[error("config type mismatch for '{key}': expected {expected}, found {found}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("invalid value for '{key}': {message}")]
    Invalid { key: String, message: String },
    #[error("failed to read {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse YAML from {origin}")]
    Parse {
        origin: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Server configuration loaded from YAML files, `.env` files and the process
/// environment.
///
/// Resolution order (lowest to highest priority):
/// 1. `application.yaml`
/// 2. `application-{profile}.yaml`
/// 3. `.env`, then `.env.{profile}` (never overwrite variables already set)
/// 4. Environment variables (`SERVER_PORT` overrides `server.port`)
///
/// The profile is taken from `KEEL_PROFILE`, else the argument, else `"dev"`.
#[derive(Debug, Clone)]
pub struct KeelConfig {
    values: HashMap<String, ConfigValue>,
    profile: String,
}

impl KeelConfig {
    /// Load configuration from the current working directory.
    pub fn load(profile: Option<&str>) -> Result<Self, ConfigError> {
        let active_profile = std::env::var("KEEL_PROFILE")
            .ok()
            .filter(|p| !p.is_empty())
            .or_else(|| profile.map(str::to_string))
            .unwrap_or_else(|| "dev".to_string());

        let mut values = HashMap::new();
        loader::load_yaml_file(Path::new("application.yaml"), &mut values)?;
        let profile_path = format!("application-{active_profile}.yaml");
        loader::load_yaml_file(Path::new(&profile_path), &mut values)?;

        let _ = dotenvy::dotenv();
        let _ = dotenvy::from_filename(format!(".env.{active_profile}"));

        loader::overlay_env(&mut values);

        tracing::debug!(profile = %active_profile, keys = values.len(), "configuration loaded");
        Ok(KeelConfig {
            values,
            profile: active_profile,
        })
    }

    /// Build a config from a YAML document, without touching files or the
    /// environment.
    pub fn from_yaml_str(yaml: &str, profile: &str) -> Result<Self, ConfigError> {
        let mut values = HashMap::new();
        loader::load_yaml_str(yaml, &mut values)?;
        Ok(KeelConfig {
            values,
            profile: profile.to_string(),
        })
    }

    pub fn empty() -> Self {
        KeelConfig {
            values: HashMap::new(),
            profile: "test".to_string(),
        }
    }

    pub fn set(&mut self, key: &str, value: impl Into<ConfigValue>) {
        self.values.insert(key.to_string(), value.into());
    }

    /// Typed value for a dot-separated key.
    pub fn get<V: FromConfigValue>(&self, key: &str) -> Result<V, ConfigError> {
        let value = self
            .values
            .get(key)
            .ok_or_else(|| ConfigError::NotFound(key.to_string()))?;
        V::from_config_value(value, key)
    }

    /// Typed value, or `default` when the key is absent.
    ///
    /// A present but malformed value is still an error.
    pub fn get_or<V: FromConfigValue>(&self, key: &str, default: V) -> Result<V, ConfigError> {
        match self.values.get(key) {
            Some(value) => V::from_config_value(value, key),
            None => Ok(default),
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    /// Read a typed section.
    pub fn section<C: ConfigProperties>(&self) -> Result<C, ConfigError> {
        C::from_config(self)
    }
}

/// A strongly-typed configuration section rooted at [`prefix`](Self::prefix).
///
/// ```ignore
/// impl ConfigProperties for LogConfig {
///     fn prefix() -> &'static str { "log" }
///     fn from_config(config: &KeelConfig) -> Result<Self, ConfigError> { ... }
/// }
/// ```
pub trait ConfigProperties: Sized {
    fn prefix() -> &'static str;

    fn from_config(config: &KeelConfig) -> Result<Self, ConfigError>;

    /// Absolute key for a property of this section.
    fn key(name: &str) -> String {
        format!("{}.{name}", Self::prefix())
    }
}
