use thiserror::Error;

/// Infrastructure-level errors raised while bootstrapping a service that
/// embeds the billing engine.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(anyhow::Error),

    #[error("Telemetry error: {0}")]
    Telemetry(anyhow::Error),
}

impl From<config::ConfigError> for CoreError {
    fn from(err: config::ConfigError) -> Self {
        CoreError::Config(anyhow::Error::new(err))
    }
}
