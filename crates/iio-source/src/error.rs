use crate::types::ReadFault;
use thiserror::Error;

pub type Result<T, E = SourceError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("device not found: {0}")]
    NotFound(String),
    #[error("device lost: {0}")]
    DeviceLost(String),
    #[error("channel {channel}: {fault}")]
    Fault { channel: String, fault: ReadFault },
    #[error("operation not supported on this source: {0}")]
    Unsupported(&'static str),
    #[error("invalid format: {0}")]
    InvalidFormat(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("timeout")]
    Timeout,
}

impl SourceError {
    pub fn is_device_lost(&self) -> bool {
        matches!(self, SourceError::DeviceLost(_))
    }

    pub fn fault(channel: &str, fault: ReadFault) -> Self {
        SourceError::Fault {
            channel: channel.to_string(),
            fault,
        }
    }
}
