use core::fmt;
use std::time::Duration;
use time::OffsetDateTime;

use crate::scan::ScanFormat;

/// Measured quantity of a channel, keyed by the IIO channel type name.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum ChannelKind {
    Temperature,
    Humidity,
    Pressure,
    Illuminance,
    Intensity,
    Proximity,
    AngularVelocity,
    Acceleration,
    MagneticField,
    Voltage,
    Current,
    Concentration,
    Distance,
}

impl ChannelKind {
    /// Map an IIO type name (`temp`, `accel`, ...) to a kind. Unknown names yield `None`.
    pub fn from_iio(name: &str) -> Option<Self> {
        let kind = match name {
            "temp" => ChannelKind::Temperature,
            "humidityrelative" => ChannelKind::Humidity,
            "pressure" => ChannelKind::Pressure,
            "illuminance" => ChannelKind::Illuminance,
            "intensity" => ChannelKind::Intensity,
            "proximity" => ChannelKind::Proximity,
            "anglvel" => ChannelKind::AngularVelocity,
            "accel" => ChannelKind::Acceleration,
            "magn" => ChannelKind::MagneticField,
            "voltage" => ChannelKind::Voltage,
            "current" => ChannelKind::Current,
            "concentration" => ChannelKind::Concentration,
            "distance" => ChannelKind::Distance,
            _ => return None,
        };
        Some(kind)
    }

    pub fn iio_name(&self) -> &'static str {
        match self {
            ChannelKind::Temperature => "temp",
            ChannelKind::Humidity => "humidityrelative",
            ChannelKind::Pressure => "pressure",
            ChannelKind::Illuminance => "illuminance",
            ChannelKind::Intensity => "intensity",
            ChannelKind::Proximity => "proximity",
            ChannelKind::AngularVelocity => "anglvel",
            ChannelKind::Acceleration => "accel",
            ChannelKind::MagneticField => "magn",
            ChannelKind::Voltage => "voltage",
            ChannelKind::Current => "current",
            ChannelKind::Concentration => "concentration",
            ChannelKind::Distance => "distance",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.iio_name())
    }
}

/// Which sysfs attribute carries the value.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValueSource {
    /// `in_<spec>_raw`, converted with scale/offset
    Raw,
    /// `in_<spec>_input`, already processed by the driver
    Processed,
}

impl ValueSource {
    pub fn suffix(&self) -> &'static str {
        match self {
            ValueSource::Raw => "raw",
            ValueSource::Processed => "input",
        }
    }
}

/// Linear calibration coefficients. Absent terms are identities.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Calibration {
    pub scale: Option<f64>,
    pub offset: Option<f64>,
}

/// A channel's slot in a triggered-buffer record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ScanElement {
    pub index: u32,
    pub format: ScanFormat,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChannelInfo {
    /// Channel spec without the `in_` prefix, e.g. `accel_x`, `voltage0`, `temp`.
    pub id: String,
    pub kind: ChannelKind,
    pub index: Option<u32>,
    pub modifier: Option<String>,
    pub source: ValueSource,
    pub calibration: Calibration,
    pub scan: Option<ScanElement>,
}

impl ChannelInfo {
    pub fn new(id: impl Into<String>, kind: ChannelKind) -> Self {
        Self {
            id: id.into(),
            kind,
            index: None,
            modifier: None,
            source: ValueSource::Raw,
            calibration: Calibration::default(),
            scan: None,
        }
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.calibration.scale = Some(scale);
        self
    }

    pub fn with_offset(mut self, offset: f64) -> Self {
        self.calibration.offset = Some(offset);
        self
    }

    pub fn with_scan(mut self, index: u32, format: ScanFormat) -> Self {
        self.scan = Some(ScanElement { index, format });
        self
    }

    pub fn processed(mut self) -> Self {
        self.source = ValueSource::Processed;
        self
    }
}

/// Parse a channel spec (`accel_x`, `voltage0`, `intensity_red`) into kind, index and modifier.
pub fn parse_channel_spec(spec: &str) -> Option<(ChannelKind, Option<u32>, Option<String>)> {
    let (head, modifier) = match spec.split_once('_') {
        Some((h, m)) if !m.is_empty() => (h, Some(m.to_string())),
        Some(_) => return None,
        None => (spec, None),
    };
    let digits = head.len() - head.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    let (type_name, index) = head.split_at(head.len() - digits);
    let index = if index.is_empty() {
        None
    } else {
        Some(index.parse::<u32>().ok()?)
    };
    let kind = ChannelKind::from_iio(type_name)?;
    Some((kind, index, modifier))
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeviceInfo {
    /// Stable identifier used in topics: label, else name, else sysfs entry name.
    pub id: String,
    /// sysfs entry, e.g. `iio:device0`
    pub sysfs_name: String,
    pub name: Option<String>,
    pub label: Option<String>,
    pub channels: Vec<ChannelInfo>,
    pub timestamp: Option<ScanElement>,
    pub buffered: bool,
}

impl DeviceInfo {
    pub fn new(id: impl Into<String>, sysfs_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sysfs_name: sysfs_name.into(),
            name: None,
            label: None,
            channels: Vec::new(),
            timestamp: None,
            buffered: false,
        }
    }

    pub fn with_channel(mut self, channel: ChannelInfo) -> Self {
        if channel.scan.is_some() {
            self.buffered = true;
        }
        self.channels.push(channel);
        self
    }

    pub fn channel(&self, id: &str) -> Option<&ChannelInfo> {
        self.channels.iter().find(|c| c.id == id)
    }

    /// Human readable model label for logs.
    pub fn model(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.sysfs_name)
    }
}

/// Parameters for arming a triggered buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TriggerSpec {
    /// Name written to `trigger/current_trigger`; `None` keeps the driver default.
    pub trigger: Option<String>,
    pub buffer_length: u32,
    pub queue_depth: usize,
    pub poll_interval: Duration,
}

impl Default for TriggerSpec {
    fn default() -> Self {
        Self {
            trigger: None,
            buffer_length: 16,
            queue_depth: 64,
            poll_interval: Duration::from_millis(5),
        }
    }
}

/// One decoded buffer record: raw values keyed by position in `DeviceInfo::channels`.
#[derive(Clone, Debug, PartialEq)]
pub struct RawScan {
    pub values: Vec<(usize, i64)>,
    pub timestamp: OffsetDateTime,
}

/// Per-channel, per-cycle read failure. Never fatal for the device.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ReadFault {
    #[error("no data available")]
    NoData,
    #[error("value out of range")]
    Overrange,
    #[error("invalid value: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_axis_and_indexed_specs() {
        assert_eq!(
            parse_channel_spec("accel_x"),
            Some((ChannelKind::Acceleration, None, Some("x".into())))
        );
        assert_eq!(
            parse_channel_spec("voltage0"),
            Some((ChannelKind::Voltage, Some(0), None))
        );
        assert_eq!(
            parse_channel_spec("intensity_red"),
            Some((ChannelKind::Intensity, None, Some("red".into())))
        );
        assert_eq!(
            parse_channel_spec("humidityrelative"),
            Some((ChannelKind::Humidity, None, None))
        );
    }

    #[test]
    fn rejects_unknown_types() {
        assert_eq!(parse_channel_spec("rot_quaternion"), None);
        assert_eq!(parse_channel_spec("timestamp"), None);
        assert_eq!(parse_channel_spec("accel_"), None);
    }
}
