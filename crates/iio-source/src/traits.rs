use crate::{ChannelInfo, DeviceInfo, RawScan, Result, SourceError, TriggerSpec};
use async_trait::async_trait;
use std::time::Duration;

/// Read-only access to a hierarchy of sensor devices.
pub trait SensorSource: Send + Sync {
    /// Enumerate devices and their channels. Repeated calls over unchanged hardware
    /// return equal results; a single malformed device never fails the whole call.
    fn discover(&self) -> Result<Vec<DeviceInfo>>;

    /// Read one channel's current value (raw or processed, per `channel.source`).
    ///
    /// Per-channel failures are [`SourceError::Fault`]; a vanished device is
    /// [`SourceError::DeviceLost`].
    fn read_channel(&self, device: &DeviceInfo, channel: &ChannelInfo) -> Result<f64>;

    /// Enable the device's scan elements and triggered buffer.
    fn arm_trigger(&self, _device: &DeviceInfo, _spec: &TriggerSpec) -> Result<Box<dyn ScanBuffer>> {
        Err(SourceError::Unsupported("triggered buffers not supported"))
    }
}

/// An armed triggered buffer. Dropping it disarms the device.
#[async_trait]
pub trait ScanBuffer: Send {
    /// Wait up to `timeout` for the next record.
    async fn next_scan(&mut self, timeout: Duration) -> Result<RawScan>;

    /// Disable the buffer and release the trigger. Idempotent.
    fn disarm(&mut self) -> Result<()>;
}
