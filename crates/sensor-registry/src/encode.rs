use crate::config::{Granularity, PayloadFormat, PublishSettings};
use crate::normalize::Sample;
use crate::{RegistryError, Result};
use bus_publisher::PublishMessage;
use iio_source::DeviceInfo;
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Serialize)]
struct SamplePayload<'a> {
    device: &'a str,
    channel: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    raw: Option<f64>,
    value: f64,
    unit: &'static str,
    timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    seq: Option<u64>,
}

#[derive(Serialize)]
struct BatchPayload<'a> {
    device: &'a str,
    timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    seq: Option<u64>,
    samples: Vec<SamplePayload<'a>>,
}

/// Maps samples to topics and payloads. Pure: the same samples always produce the
/// same messages.
#[derive(Clone, Debug)]
pub struct Encoder {
    namespace: String,
    granularity: Granularity,
    format: PayloadFormat,
    include_raw: bool,
}

impl Encoder {
    pub fn new(settings: &PublishSettings) -> Self {
        Self {
            namespace: settings.namespace.clone(),
            granularity: settings.granularity,
            format: settings.format,
            include_raw: settings.include_raw,
        }
    }

    /// `<namespace>/<device>/<channel>`
    pub fn channel_topic(&self, device_id: &str, channel_id: &str) -> String {
        format!("{}/{}/{}", self.namespace, device_id, channel_id)
    }

    /// `<namespace>/<device>`
    pub fn device_topic(&self, device_id: &str) -> String {
        format!("{}/{}", self.namespace, device_id)
    }

    /// Topics a device publishes on under the configured granularity.
    pub fn topics(&self, device: &DeviceInfo) -> Vec<String> {
        match self.granularity {
            Granularity::PerChannel => device
                .channels
                .iter()
                .map(|c| self.channel_topic(&device.id, &c.id))
                .collect(),
            Granularity::PerCycle => vec![self.device_topic(&device.id)],
        }
    }

    /// Encode one read cycle of a device. Per-channel granularity yields one message per
    /// sample in input order; per-cycle yields a single batch, or nothing for an empty cycle.
    pub fn encode(&self, device_id: &str, samples: &[Sample]) -> Result<Vec<PublishMessage>> {
        match self.granularity {
            Granularity::PerChannel => samples
                .iter()
                .map(|s| -> Result<PublishMessage> {
                    let topic = self.channel_topic(device_id, &s.channel_id);
                    let payload = match self.format {
                        PayloadFormat::Json => serde_json::to_vec(&self.sample_payload(s)?)?,
                        PayloadFormat::Plain => s.value.to_string().into_bytes(),
                    };
                    Ok(PublishMessage::new(device_id, topic, payload))
                })
                .collect(),
            Granularity::PerCycle => {
                let Some(first) = samples.first() else {
                    return Ok(Vec::new());
                };
                let batch = BatchPayload {
                    device: device_id,
                    timestamp: rfc3339(first.timestamp)?,
                    seq: first.seq,
                    samples: samples
                        .iter()
                        .map(|s| self.sample_payload(s))
                        .collect::<Result<_>>()?,
                };
                let payload = serde_json::to_vec(&batch)?;
                Ok(vec![PublishMessage::new(
                    device_id,
                    self.device_topic(device_id),
                    payload,
                )])
            }
        }
    }

    fn sample_payload<'a>(&self, s: &'a Sample) -> Result<SamplePayload<'a>> {
        Ok(SamplePayload {
            device: &s.device_id,
            channel: &s.channel_id,
            kind: s.kind.iio_name(),
            raw: self.include_raw.then_some(s.raw),
            value: s.value,
            unit: s.unit,
            timestamp: rfc3339(s.timestamp)?,
            seq: s.seq,
        })
    }
}

fn rfc3339(ts: OffsetDateTime) -> Result<String> {
    ts.format(&Rfc3339)
        .map_err(|e| RegistryError::Encode(format!("timestamp: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use iio_source::ChannelKind;
    use serde_json::Value;

    fn sample(channel: &str, kind: ChannelKind, raw: f64, value: f64) -> Sample {
        Sample {
            device_id: "bme280".into(),
            channel_id: channel.into(),
            kind,
            raw,
            value,
            unit: crate::unit_for(kind),
            timestamp: OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
            seq: Some(3),
        }
    }

    fn settings(granularity: Granularity, format: PayloadFormat) -> PublishSettings {
        PublishSettings {
            namespace: "iio".into(),
            granularity,
            format,
            include_raw: true,
        }
    }

    #[test]
    fn per_channel_json() {
        let enc = Encoder::new(&settings(Granularity::PerChannel, PayloadFormat::Json));
        let samples = vec![
            sample("temp", ChannelKind::Temperature, 2512.0, 25120.0),
            sample("pressure", ChannelKind::Pressure, 250.0, 2.5),
        ];
        let msgs = enc.encode("bme280", &samples).unwrap();
        let topics: Vec<_> = msgs.iter().map(|m| m.topic.as_str()).collect();
        assert_eq!(topics, vec!["iio/bme280/temp", "iio/bme280/pressure"]);

        let v: Value = serde_json::from_slice(&msgs[1].payload).unwrap();
        assert_eq!(v["device"], "bme280");
        assert_eq!(v["channel"], "pressure");
        assert_eq!(v["type"], "pressure");
        assert_eq!(v["raw"], 250.0);
        assert_eq!(v["value"], 2.5);
        assert_eq!(v["unit"], "kilopascal");
        assert_eq!(v["timestamp"], "2023-11-14T22:13:20Z");
        assert_eq!(v["seq"], 3);
        assert!(msgs.iter().all(|m| m.device_id == "bme280"));
    }

    #[test]
    fn per_cycle_batch() {
        let enc = Encoder::new(&settings(Granularity::PerCycle, PayloadFormat::Json));
        let samples = vec![
            sample("temp", ChannelKind::Temperature, 1.0, 1.0),
            sample("humidityrelative", ChannelKind::Humidity, 2.0, 2.0),
        ];
        let msgs = enc.encode("bme280", &samples).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].topic, "iio/bme280");
        let v: Value = serde_json::from_slice(&msgs[0].payload).unwrap();
        assert_eq!(v["samples"].as_array().map(Vec::len), Some(2));
        assert_eq!(v["samples"][1]["channel"], "humidityrelative");
        assert!(enc.encode("bme280", &[]).unwrap().is_empty());
    }

    #[test]
    fn plain_and_raw_toggle() {
        let enc = Encoder::new(&settings(Granularity::PerChannel, PayloadFormat::Plain));
        let msgs = enc
            .encode("bme280", &[sample("pressure", ChannelKind::Pressure, 250.0, 2.5)])
            .unwrap();
        assert_eq!(msgs[0].payload, b"2.5");

        let mut s = settings(Granularity::PerChannel, PayloadFormat::Json);
        s.include_raw = false;
        let msgs = Encoder::new(&s)
            .encode("bme280", &[sample("pressure", ChannelKind::Pressure, 250.0, 2.5)])
            .unwrap();
        let v: Value = serde_json::from_slice(&msgs[0].payload).unwrap();
        assert!(v.get("raw").is_none());
    }

    #[test]
    fn topics_are_deterministic() {
        let enc = Encoder::new(&settings(Granularity::PerChannel, PayloadFormat::Json));
        assert_eq!(enc.channel_topic("imu", "accel_x"), "iio/imu/accel_x");
        assert_eq!(
            enc.channel_topic("imu", "accel_x"),
            enc.channel_topic("imu", "accel_x")
        );
        assert_eq!(enc.device_topic("imu"), "iio/imu");
    }

    #[test]
    fn listed_topics_follow_granularity() {
        let imu = DeviceInfo::new("imu", "iio:device1")
            .with_channel(iio_source::ChannelInfo::new("accel_x", ChannelKind::Acceleration))
            .with_channel(iio_source::ChannelInfo::new("accel_y", ChannelKind::Acceleration));
        let per_channel = Encoder::new(&settings(Granularity::PerChannel, PayloadFormat::Json));
        assert_eq!(per_channel.topics(&imu), vec!["iio/imu/accel_x", "iio/imu/accel_y"]);
        let per_cycle = Encoder::new(&settings(Granularity::PerCycle, PayloadFormat::Json));
        assert_eq!(per_cycle.topics(&imu), vec!["iio/imu"]);
    }
}
