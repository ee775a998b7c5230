use crate::{
    ChannelInfo, DeviceInfo, RawScan, ReadFault, Result, ScanBuffer, SensorSource, SourceError,
    TriggerSpec,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc;

struct MockDevice {
    info: DeviceInfo,
    steady: HashMap<String, core::result::Result<f64, ReadFault>>,
    scripted: HashMap<String, VecDeque<core::result::Result<f64, ReadFault>>>,
}

#[derive(Default)]
struct MockState {
    devices: BTreeMap<String, MockDevice>,
    armed: HashMap<String, mpsc::Sender<RawScan>>,
    reads: u64,
    discovery_error: Option<String>,
}

/// An in-memory sensor source. Clones share state, so a test can keep a handle
/// while the pipeline owns another.
#[derive(Clone, Default)]
pub struct MockSource {
    state: Arc<Mutex<MockState>>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MockState>> {
        self.state
            .lock()
            .map_err(|_| SourceError::Io("mock state poisoned".into()))
    }

    /// Add or replace a device. Channels without a configured value read as `NoData`.
    pub fn insert(&self, info: DeviceInfo) -> Result<()> {
        let mut st = self.lock()?;
        match st.devices.get_mut(&info.id) {
            Some(dev) => dev.info = info,
            None => {
                st.devices.insert(
                    info.id.clone(),
                    MockDevice {
                        info,
                        steady: HashMap::new(),
                        scripted: HashMap::new(),
                    },
                );
            }
        }
        Ok(())
    }

    /// Remove a device, as if it was unplugged. Armed buffers are closed.
    pub fn remove(&self, device_id: &str) -> Result<()> {
        let mut st = self.lock()?;
        st.devices.remove(device_id);
        st.armed.remove(device_id);
        Ok(())
    }

    /// Make `discover` fail with an I/O error until cleared with `None`.
    pub fn fail_discovery(&self, reason: Option<&str>) -> Result<()> {
        self.lock()?.discovery_error = reason.map(str::to_string);
        Ok(())
    }

    pub fn set_value(&self, device_id: &str, channel_id: &str, value: f64) -> Result<()> {
        self.set(device_id, channel_id, Ok(value))
    }

    pub fn set_fault(&self, device_id: &str, channel_id: &str, fault: ReadFault) -> Result<()> {
        self.set(device_id, channel_id, Err(fault))
    }

    fn set(
        &self,
        device_id: &str,
        channel_id: &str,
        value: core::result::Result<f64, ReadFault>,
    ) -> Result<()> {
        let mut st = self.lock()?;
        let dev = st
            .devices
            .get_mut(device_id)
            .ok_or_else(|| SourceError::NotFound(device_id.to_string()))?;
        dev.steady.insert(channel_id.to_string(), value);
        Ok(())
    }

    /// Queue values returned by successive reads before falling back to the steady value.
    pub fn queue_values(&self, device_id: &str, channel_id: &str, values: &[f64]) -> Result<()> {
        let mut st = self.lock()?;
        let dev = st
            .devices
            .get_mut(device_id)
            .ok_or_else(|| SourceError::NotFound(device_id.to_string()))?;
        dev.scripted
            .entry(channel_id.to_string())
            .or_default()
            .extend(values.iter().copied().map(Ok));
        Ok(())
    }

    /// Deliver one record to the device's armed buffer.
    pub fn push_scan(&self, device_id: &str, values: Vec<(usize, i64)>) -> Result<()> {
        let st = self.lock()?;
        let tx = st
            .armed
            .get(device_id)
            .ok_or(SourceError::Unsupported("device is not armed"))?;
        tx.try_send(RawScan {
            values,
            timestamp: OffsetDateTime::now_utc(),
        })
        .map_err(|e| SourceError::Io(e.to_string()))
    }

    pub fn is_armed(&self, device_id: &str) -> bool {
        self.lock()
            .map(|st| st.armed.contains_key(device_id))
            .unwrap_or(false)
    }

    /// Total number of channel reads served.
    pub fn reads(&self) -> u64 {
        self.lock().map(|st| st.reads).unwrap_or(0)
    }
}

impl SensorSource for MockSource {
    fn discover(&self) -> Result<Vec<DeviceInfo>> {
        let st = self.lock()?;
        if let Some(reason) = &st.discovery_error {
            return Err(SourceError::Io(reason.clone()));
        }
        Ok(st.devices.values().map(|d| d.info.clone()).collect())
    }

    fn read_channel(&self, device: &DeviceInfo, channel: &ChannelInfo) -> Result<f64> {
        let mut st = self.lock()?;
        st.reads += 1;
        let dev = st
            .devices
            .get_mut(&device.id)
            .ok_or_else(|| SourceError::DeviceLost(device.id.clone()))?;
        let next = dev
            .scripted
            .get_mut(&channel.id)
            .and_then(|q| q.pop_front())
            .or_else(|| dev.steady.get(&channel.id).cloned())
            .unwrap_or(Err(ReadFault::NoData));
        next.map_err(|fault| SourceError::fault(&channel.id, fault))
    }

    fn arm_trigger(&self, device: &DeviceInfo, spec: &TriggerSpec) -> Result<Box<dyn ScanBuffer>> {
        let mut st = self.lock()?;
        if !st.devices.contains_key(&device.id) {
            return Err(SourceError::DeviceLost(device.id.clone()));
        }
        let (tx, rx) = mpsc::channel(spec.queue_depth.max(1));
        st.armed.insert(device.id.clone(), tx);
        Ok(Box::new(MockScanBuffer {
            source: self.clone(),
            device_id: device.id.clone(),
            rx,
            armed: true,
        }))
    }
}

struct MockScanBuffer {
    source: MockSource,
    device_id: String,
    rx: mpsc::Receiver<RawScan>,
    armed: bool,
}

#[async_trait]
impl ScanBuffer for MockScanBuffer {
    async fn next_scan(&mut self, timeout: Duration) -> Result<RawScan> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(scan)) => Ok(scan),
            // Sender dropped: the device was removed.
            Ok(None) => Err(SourceError::DeviceLost(self.device_id.clone())),
            Err(_) => Err(SourceError::Timeout),
        }
    }

    fn disarm(&mut self) -> Result<()> {
        if self.armed {
            self.armed = false;
            let mut st = self.source.lock()?;
            st.armed.remove(&self.device_id);
        }
        Ok(())
    }
}

impl Drop for MockScanBuffer {
    fn drop(&mut self) {
        let _ = self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChannelKind;

    fn thermo() -> DeviceInfo {
        DeviceInfo::new("thermo", "iio:device0")
            .with_channel(ChannelInfo::new("temp", ChannelKind::Temperature))
            .with_channel(ChannelInfo::new("humidityrelative", ChannelKind::Humidity))
    }

    #[test]
    fn reads_scripted_then_steady_values() {
        let src = MockSource::new();
        src.insert(thermo()).unwrap();
        src.set_value("thermo", "temp", 21.0).unwrap();
        src.queue_values("thermo", "temp", &[1.0, 2.0]).unwrap();

        let dev = thermo();
        let ch = dev.channel("temp").unwrap();
        assert_eq!(src.read_channel(&dev, ch).unwrap(), 1.0);
        assert_eq!(src.read_channel(&dev, ch).unwrap(), 2.0);
        assert_eq!(src.read_channel(&dev, ch).unwrap(), 21.0);

        let hum = dev.channel("humidityrelative").unwrap();
        match src.read_channel(&dev, hum) {
            Err(SourceError::Fault { fault, .. }) => assert_eq!(fault, ReadFault::NoData),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn removed_device_is_lost() {
        let src = MockSource::new();
        src.insert(thermo()).unwrap();
        src.remove("thermo").unwrap();
        let dev = thermo();
        let err = src.read_channel(&dev, &dev.channels[0]).unwrap_err();
        assert!(err.is_device_lost());
        assert!(src.discover().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dropping_buffer_disarms() {
        let src = MockSource::new();
        src.insert(thermo()).unwrap();
        let mut buf = src.arm_trigger(&thermo(), &TriggerSpec::default()).unwrap();
        assert!(src.is_armed("thermo"));

        src.push_scan("thermo", vec![(0, 42)]).unwrap();
        let scan = buf.next_scan(Duration::from_millis(100)).await.unwrap();
        assert_eq!(scan.values, vec![(0, 42)]);
        assert!(matches!(
            buf.next_scan(Duration::from_millis(10)).await,
            Err(SourceError::Timeout)
        ));

        drop(buf);
        assert!(!src.is_armed("thermo"));
    }
}
