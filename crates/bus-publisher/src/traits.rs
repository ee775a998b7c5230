use crate::{PublishMessage, Qos, Result};
use async_trait::async_trait;

/// A connect/publish/disconnect capability over a message bus.
///
/// Implementations report a lost link through [`BusClient::is_connected`] or by failing
/// `publish`; the [`crate::Publisher`] owns reconnection.
#[async_trait]
pub trait BusClient: Send {
    /// Establish a session. Resolves once the broker accepted it.
    async fn connect(&mut self) -> Result<()>;

    /// Hand one message to the transport.
    async fn publish(&mut self, message: &PublishMessage, qos: Qos) -> Result<()>;

    /// Close the session. Safe to call when already disconnected.
    async fn disconnect(&mut self) -> Result<()>;

    fn is_connected(&self) -> bool;
}
