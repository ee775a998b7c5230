use iio_source::{DeviceInfo, ReadFault, ScanBuffer, SensorSource, SourceError, TriggerSpec};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

/// Outcome of reading one channel in one cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelReading {
    /// Position in `DeviceInfo::channels`.
    pub channel: usize,
    pub value: Result<f64, ReadFault>,
    pub timestamp: OffsetDateTime,
}

enum Mode {
    Polled,
    Triggered {
        buffer: Box<dyn ScanBuffer>,
        timeout: Duration,
    },
}

/// Reads a device one cycle at a time, either by polling each channel attribute or by
/// waiting on an armed triggered buffer.
pub struct ChannelReader {
    source: Arc<dyn SensorSource>,
    device: Arc<DeviceInfo>,
    mode: Mode,
}

impl ChannelReader {
    pub fn polled(source: Arc<dyn SensorSource>, device: Arc<DeviceInfo>) -> Self {
        Self {
            source,
            device,
            mode: Mode::Polled,
        }
    }

    /// Arm the device's triggered buffer. The buffer is disarmed when the reader is dropped.
    pub fn triggered(
        source: Arc<dyn SensorSource>,
        device: Arc<DeviceInfo>,
        spec: &TriggerSpec,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        let buffer = source.arm_trigger(&device, spec)?;
        Ok(Self {
            source,
            device,
            mode: Mode::Triggered { buffer, timeout },
        })
    }

    /// Read every channel once. Only a lost device is an error; everything else is reported
    /// per channel.
    pub async fn read_cycle(&mut self) -> Result<Vec<ChannelReading>, SourceError> {
        match &mut self.mode {
            Mode::Polled => {
                let source = self.source.clone();
                let device = self.device.clone();
                tokio::task::spawn_blocking(move || poll_channels(source.as_ref(), &device))
                    .await
                    .map_err(|e| SourceError::Io(format!("read task failed: {e}")))?
            }
            Mode::Triggered { buffer, timeout } => match buffer.next_scan(*timeout).await {
                Ok(scan) => {
                    let mut out: Vec<ChannelReading> = (0..self.device.channels.len())
                        .map(|channel| ChannelReading {
                            channel,
                            value: Err(ReadFault::NoData),
                            timestamp: scan.timestamp,
                        })
                        .collect();
                    for (idx, raw) in scan.values {
                        if let Some(slot) = out.get_mut(idx) {
                            slot.value = Ok(raw as f64);
                        }
                    }
                    out.sort_by_key(|r| {
                        self.device.channels[r.channel]
                            .scan
                            .map(|s| s.index)
                            .unwrap_or(u32::MAX)
                    });
                    Ok(out)
                }
                Err(SourceError::Timeout) => {
                    let now = OffsetDateTime::now_utc();
                    Ok((0..self.device.channels.len())
                        .map(|channel| ChannelReading {
                            channel,
                            value: Err(ReadFault::NoData),
                            timestamp: now,
                        })
                        .collect())
                }
                Err(e) => Err(e),
            },
        }
    }

    /// Release the triggered buffer, if any.
    pub fn disarm(&mut self) -> Result<(), SourceError> {
        match &mut self.mode {
            Mode::Polled => Ok(()),
            Mode::Triggered { buffer, .. } => buffer.disarm(),
        }
    }
}

fn poll_channels(
    source: &dyn SensorSource,
    device: &DeviceInfo,
) -> Result<Vec<ChannelReading>, SourceError> {
    let mut out = Vec::with_capacity(device.channels.len());
    for (channel, info) in device.channels.iter().enumerate() {
        let value = match source.read_channel(device, info) {
            Ok(v) => Ok(v),
            Err(SourceError::Fault { fault, .. }) => Err(fault),
            Err(e @ (SourceError::DeviceLost(_) | SourceError::NotFound(_))) => return Err(e),
            Err(e) => Err(ReadFault::Invalid(e.to_string())),
        };
        out.push(ChannelReading {
            channel,
            value,
            timestamp: OffsetDateTime::now_utc(),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use iio_source::{ChannelInfo, ChannelKind, MockSource, ScanFormat};

    fn thermo() -> DeviceInfo {
        DeviceInfo::new("thermo", "iio:device0")
            .with_channel(ChannelInfo::new("temp", ChannelKind::Temperature))
            .with_channel(ChannelInfo::new("humidityrelative", ChannelKind::Humidity))
    }

    #[tokio::test]
    async fn polled_faults_stay_per_channel() {
        let mock = MockSource::new();
        mock.insert(thermo()).unwrap();
        mock.set_value("thermo", "temp", 2512.0).unwrap();
        mock.set_fault("thermo", "humidityrelative", ReadFault::Overrange)
            .unwrap();
        let mut reader = ChannelReader::polled(Arc::new(mock.clone()), Arc::new(thermo()));
        let cycle = reader.read_cycle().await.unwrap();
        assert_eq!(cycle.len(), 2);
        assert_eq!(cycle[0].value, Ok(2512.0));
        assert_eq!(cycle[1].value, Err(ReadFault::Overrange));

        mock.remove("thermo").unwrap();
        let err = reader.read_cycle().await.unwrap_err();
        assert!(err.is_device_lost());
    }

    #[tokio::test]
    async fn triggered_reads_scans_and_times_out() {
        let fmt = ScanFormat::parse("le:s16/16>>0").unwrap();
        let dev = DeviceInfo::new("imu", "iio:device1")
            .with_channel(ChannelInfo::new("accel_y", ChannelKind::Acceleration).with_scan(1, fmt))
            .with_channel(ChannelInfo::new("accel_x", ChannelKind::Acceleration).with_scan(0, fmt));
        let mock = MockSource::new();
        mock.insert(dev.clone()).unwrap();
        let mut reader = ChannelReader::triggered(
            Arc::new(mock.clone()),
            Arc::new(dev),
            &TriggerSpec::default(),
            Duration::from_millis(20),
        )
        .unwrap();
        assert!(mock.is_armed("imu"));

        mock.push_scan("imu", vec![(0, -5), (1, 7)]).unwrap();
        let cycle = reader.read_cycle().await.unwrap();
        // Ordered by scan index: accel_x first.
        assert_eq!(cycle[0].channel, 1);
        assert_eq!(cycle[0].value, Ok(7.0));
        assert_eq!(cycle[1].value, Ok(-5.0));

        let cycle = reader.read_cycle().await.unwrap();
        assert!(cycle.iter().all(|r| r.value == Err(ReadFault::NoData)));

        drop(reader);
        assert!(!mock.is_armed("imu"));
    }
}
