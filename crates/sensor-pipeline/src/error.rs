use bus_publisher::PublishError;
use iio_source::SourceError;
use sensor_registry::RegistryError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no usable devices found")]
    NoDevices,
    #[error("sensor source error: {0}")]
    Source(#[from] SourceError),
    #[error("publisher error: {0}")]
    Publish(#[from] PublishError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("task failed: {0}")]
    Task(String),
}

pub type Result<T, E = PipelineError> = core::result::Result<T, E>;
