use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("payload encoding failed: {0}")]
    Encode(String),
    #[error("metrics error: {0}")]
    Metrics(String),
}

impl From<serde_json::Error> for RegistryError {
    fn from(e: serde_json::Error) -> Self {
        RegistryError::Encode(e.to_string())
    }
}

impl From<prometheus::Error> for RegistryError {
    fn from(e: prometheus::Error) -> Self {
        RegistryError::Metrics(e.to_string())
    }
}

pub type Result<T, E = RegistryError> = std::result::Result<T, E>;
