use std::process::ExitCode;

use keel_core::{init_tracing, start, ConfigError, KeelConfig, LogConfig};
use keel_grpc::{GrpcTransport, ListenerConfig};

/// Logging and listener sections; a malformed value in either is fatal.
fn settings(config: &KeelConfig) -> Result<(LogConfig, ListenerConfig), ConfigError> {
    Ok((config.section()?, config.section()?))
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match KeelConfig::load(None) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    let (log, server) = match settings(&config) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = init_tracing(&log) {
        eprintln!("failed to initialise logging: {err}");
    }

    let listener = match server.bind().await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(error = %err, "failed to create listener");
            return ExitCode::FAILURE;
        }
    };

    let transport = GrpcTransport::new(listener).with_reflection(server.reflection);
    match start(&config, transport, |_| {}).await {
        Ok(status) => status.into(),
        Err(err) => {
            tracing::error!(error = %err, "failed to start server");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_log_format_is_fatal() {
        let config = KeelConfig::from_yaml_str("log:\n  format: xml\n", "test").unwrap();
        match settings(&config) {
            Err(ConfigError::Invalid { key, .. }) => assert_eq!(key, "log.format"),
            other => panic!("expected invalid log.format, got {other:?}"),
        }
    }

    #[test]
    fn test_bundled_configuration_is_valid() {
        let config = KeelConfig::from_yaml_str(include_str!("../application.yaml"), "test").unwrap();
        let (_, server) = settings(&config).unwrap();
        assert!(server.port > 0);
    }
}
