use crate::units::unit_for;
use iio_source::{ChannelInfo, ChannelKind, DeviceInfo};
use time::OffsetDateTime;

/// A calibrated reading. Produced once per channel read and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub device_id: String,
    pub channel_id: String,
    pub kind: ChannelKind,
    pub raw: f64,
    pub value: f64,
    pub unit: &'static str,
    pub timestamp: OffsetDateTime,
    pub seq: Option<u64>,
}

/// `raw * scale + offset`, with a missing scale taken as 1 and a missing offset as 0.
pub fn calibrate(raw: f64, scale: Option<f64>, offset: Option<f64>) -> f64 {
    raw * scale.unwrap_or(1.0) + offset.unwrap_or(0.0)
}

pub fn normalize(
    device: &DeviceInfo,
    channel: &ChannelInfo,
    raw: f64,
    timestamp: OffsetDateTime,
    seq: Option<u64>,
) -> Sample {
    let cal = channel.calibration;
    Sample {
        device_id: device.id.clone(),
        channel_id: channel.id.clone(),
        kind: channel.kind,
        raw,
        value: calibrate(raw, cal.scale, cal.offset),
        unit: unit_for(channel.kind),
        timestamp,
        seq,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> DeviceInfo {
        DeviceInfo::new("bme280", "iio:device0")
    }

    #[test]
    fn applies_scale_and_offset() {
        let ch = ChannelInfo::new("pressure", ChannelKind::Pressure).with_scale(0.01);
        let ts = OffsetDateTime::UNIX_EPOCH;
        let s = normalize(&device(), &ch, 250.0, ts, Some(7));
        assert!((s.value - 2.5).abs() < 1e-12);
        assert_eq!(s.unit, "kilopascal");
        assert_eq!(s.seq, Some(7));
        assert_eq!(s.device_id, "bme280");

        let ch = ch.with_offset(1.5);
        let s = normalize(&device(), &ch, 250.0, ts, None);
        assert!((s.value - 4.0).abs() < 1e-12);
    }

    #[test]
    fn missing_terms_are_identities() {
        assert_eq!(calibrate(10.0, None, Some(5.0)), 15.0);
        assert_eq!(calibrate(10.0, Some(2.0), None), 20.0);
        assert_eq!(calibrate(10.0, None, None), 10.0);
    }

    #[test]
    fn is_deterministic() {
        let ch = ChannelInfo::new("temp", ChannelKind::Temperature)
            .with_scale(0.01)
            .with_offset(-3.0);
        let ts = OffsetDateTime::UNIX_EPOCH;
        let a = normalize(&device(), &ch, 2512.0, ts, Some(1));
        let b = normalize(&device(), &ch, 2512.0, ts, Some(1));
        assert_eq!(a, b);
    }
}
