//! iio-source: discovery and raw sample access for Linux IIO sensors
//!
//! This crate provides the [`SensorSource`] capability used by the acquisition pipeline,
//! with feature-gated backends. The default build enables both the `sysfs` backend, which
//! reads `/sys/bus/iio/devices` and the `/dev/iio:deviceN` buffers, and an in-memory `mock`
//! backend so the pipeline can be exercised on any host.

mod types;
pub use types::{
    parse_channel_spec, Calibration, ChannelInfo, ChannelKind, DeviceInfo, RawScan, ReadFault,
    ScanElement, TriggerSpec, ValueSource,
};

mod error;
pub use error::{Result, SourceError};

pub mod scan;
pub use scan::{ScanFormat, ScanLayout};

mod traits;
pub use traits::{ScanBuffer, SensorSource};

#[cfg(feature = "mock")]
mod mock;

#[cfg(feature = "mock")]
pub use mock::MockSource;

#[cfg(feature = "sysfs")]
mod sysfs;

#[cfg(feature = "sysfs")]
pub use sysfs::SysfsSource;
