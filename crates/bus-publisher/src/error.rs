use thiserror::Error;

pub type Result<T, E = PublishError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("broker unreachable after {attempts} attempts: {last}")]
    Unreachable { attempts: u32, last: String },
    #[error("not connected")]
    NotConnected,
    #[error("send queue full")]
    QueueFull,
    #[error("publisher is shut down")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("timeout")]
    Timeout,
}
