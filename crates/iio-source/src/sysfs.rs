use crate::scan::{ScanFormat, ScanLayout};
use crate::{
    parse_channel_spec, Calibration, ChannelInfo, DeviceInfo, RawScan, ReadFault, Result,
    ScanBuffer, ScanElement, SensorSource, SourceError, TriggerSpec, ValueSource,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const DEVICE_PREFIX: &str = "iio:device";

/// Sensor source backed by the kernel's sysfs IIO tree and `/dev/iio:deviceN` buffers.
#[derive(Clone, Debug)]
pub struct SysfsSource {
    sysfs_root: PathBuf,
    dev_root: PathBuf,
}

impl Default for SysfsSource {
    fn default() -> Self {
        Self::new("/sys", "/dev")
    }
}

impl SysfsSource {
    pub fn new(sysfs_root: impl Into<PathBuf>, dev_root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
            dev_root: dev_root.into(),
        }
    }

    fn devices_dir(&self) -> PathBuf {
        self.sysfs_root.join("bus/iio/devices")
    }

    fn device_dir(&self, device: &DeviceInfo) -> PathBuf {
        self.devices_dir().join(&device.sysfs_name)
    }

    fn scan_device(&self, path: &Path, sysfs_name: &str) -> Result<Option<DeviceInfo>> {
        let entries = match fs::read_dir(path) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SourceError::Io(format!("{}: {e}", path.display()))),
        };
        let mut attrs = Vec::new();
        for entry in entries.flatten() {
            if let Some(name) = entry.file_name().to_str() {
                attrs.push(name.to_string());
            }
        }
        attrs.sort();

        // spec -> preferred value source
        let mut specs: BTreeMap<String, ValueSource> = BTreeMap::new();
        for attr in &attrs {
            let Some(stem) = attr.strip_prefix("in_") else {
                continue;
            };
            if let Some(spec) = stem.strip_suffix("_raw") {
                specs.insert(spec.to_string(), ValueSource::Raw);
            } else if let Some(spec) = stem.strip_suffix("_input") {
                specs.entry(spec.to_string()).or_insert(ValueSource::Processed);
            }
        }

        let mut channels = Vec::new();
        for (spec, source) in specs {
            let Some((kind, index, modifier)) = parse_channel_spec(&spec) else {
                debug!(device = sysfs_name, channel = %spec, "skipping unrecognized channel type");
                continue;
            };
            let calibration = if source == ValueSource::Raw {
                let shared = kind.iio_name();
                let scale = read_coefficient(path, &spec, shared, "scale");
                let offset = read_coefficient(path, &spec, shared, "offset");
                match (scale, offset) {
                    (Ok(scale), Ok(offset)) => Calibration { scale, offset },
                    (Err(e), _) | (_, Err(e)) => {
                        warn!(device = sysfs_name, channel = %spec, "excluding channel: {e}");
                        continue;
                    }
                }
            } else {
                Calibration::default()
            };
            channels.push(ChannelInfo {
                id: spec,
                kind,
                index,
                modifier,
                source,
                calibration,
                scan: None,
            });
        }

        let (scan, timestamp) = read_scan_elements(&path.join("scan_elements"));
        for ch in &mut channels {
            ch.scan = scan.get(&ch.id).copied();
        }
        let buffered = path.join("buffer").is_dir() && channels.iter().any(|c| c.scan.is_some());

        // The entry may have vanished while we were listing it.
        if !path.is_dir() {
            return Ok(None);
        }
        Ok(Some(DeviceInfo {
            id: String::new(),
            sysfs_name: sysfs_name.to_string(),
            name: read_attr(&path.join("name")).ok(),
            label: read_attr(&path.join("label")).ok(),
            channels,
            timestamp,
            buffered,
        }))
    }
}

fn read_attr(path: &Path) -> io::Result<String> {
    let s = fs::read_to_string(path)?;
    let s = s.trim();
    if s.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "empty attribute"));
    }
    Ok(s.to_string())
}

fn write_attr(path: &Path, value: &str) -> Result<()> {
    fs::write(path, value).map_err(|e| SourceError::Io(format!("{}: {e}", path.display())))
}

/// Channel-specific coefficient first, then the one shared by the channel type.
fn read_coefficient(dir: &Path, spec: &str, shared: &str, what: &str) -> Result<Option<f64>> {
    for name in [format!("in_{spec}_{what}"), format!("in_{shared}_{what}")] {
        let path = dir.join(&name);
        match fs::read_to_string(&path) {
            Ok(text) => {
                let v = text
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| SourceError::InvalidFormat(format!("{name}: {:?}", text.trim())))?;
                if !v.is_finite() {
                    return Err(SourceError::InvalidFormat(format!("{name}: not finite")));
                }
                return Ok(Some(v));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(SourceError::Io(format!("{name}: {e}"))),
        }
    }
    Ok(None)
}

fn read_scan_elements(dir: &Path) -> (HashMap<String, ScanElement>, Option<ScanElement>) {
    let mut out = HashMap::new();
    let mut timestamp = None;
    let Ok(entries) = fs::read_dir(dir) else {
        return (out, timestamp);
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(spec) = name
            .to_str()
            .and_then(|n| n.strip_prefix("in_"))
            .and_then(|n| n.strip_suffix("_en"))
        else {
            continue;
        };
        let index = read_attr(&dir.join(format!("in_{spec}_index")))
            .ok()
            .and_then(|s| s.parse::<u32>().ok());
        let format = read_attr(&dir.join(format!("in_{spec}_type")))
            .ok()
            .and_then(|s| ScanFormat::parse(&s).ok());
        match (index, format) {
            (Some(index), Some(format)) => {
                let element = ScanElement { index, format };
                if spec == "timestamp" {
                    timestamp = Some(element);
                } else {
                    out.insert(spec.to_string(), element);
                }
            }
            _ => debug!(scan_element = spec, "ignoring malformed scan element"),
        }
    }
    (out, timestamp)
}

fn sysfs_index(name: &str) -> Option<u32> {
    name.strip_prefix(DEVICE_PREFIX)?.parse().ok()
}

fn sanitize_id(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '/' | '+' | '#' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}

/// Give each device a stable topic identifier; duplicates get their sysfs index appended.
fn assign_ids(devices: &mut [DeviceInfo]) {
    let base: Vec<String> = devices
        .iter()
        .map(|d| {
            sanitize_id(
                d.label
                    .as_deref()
                    .or(d.name.as_deref())
                    .unwrap_or(&d.sysfs_name),
            )
        })
        .collect();
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for b in &base {
        *counts.entry(b.as_str()).or_default() += 1;
    }
    let ids: Vec<String> = devices
        .iter()
        .zip(&base)
        .map(|(d, b)| {
            if counts.get(b.as_str()).copied().unwrap_or(0) > 1 {
                let n = sysfs_index(&d.sysfs_name).unwrap_or_default();
                format!("{b}_{n}")
            } else {
                b.clone()
            }
        })
        .collect();
    for (d, id) in devices.iter_mut().zip(ids) {
        d.id = id;
    }
}

fn classify(device: &Path, channel: &str, err: io::Error) -> SourceError {
    if !device.is_dir() {
        return SourceError::DeviceLost(device.display().to_string());
    }
    match err.raw_os_error().and_then(|errno| fault_for(errno, &err)) {
        Some(Ok(fault)) => SourceError::fault(channel, fault),
        Some(Err(())) => SourceError::DeviceLost(device.display().to_string()),
        None => SourceError::Io(format!("{channel}: {err}")),
    }
}

/// Map the errno of a failed single read: a per-channel fault, `Err(())` for a device
/// that went away, `None` for anything else.
fn fault_for(errno: i32, err: &io::Error) -> Option<core::result::Result<ReadFault, ()>> {
    match errno {
        libc::ENODEV | libc::ENOENT => Some(Err(())),
        libc::EAGAIN | libc::EBUSY | libc::ENODATA | libc::ETIMEDOUT => Some(Ok(ReadFault::NoData)),
        libc::ERANGE | libc::EOVERFLOW => Some(Ok(ReadFault::Overrange)),
        libc::EINVAL => Some(Ok(ReadFault::Invalid(err.to_string()))),
        _ => None,
    }
}

impl SensorSource for SysfsSource {
    fn discover(&self) -> Result<Vec<DeviceInfo>> {
        let dir = self.devices_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            // Absent until the industrialio core is loaded.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %dir.display(), "no iio bus");
                return Ok(Vec::new());
            }
            Err(e) => return Err(SourceError::Io(format!("{}: {e}", dir.display()))),
        };
        let mut names: Vec<(u32, String)> = entries
            .flatten()
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .filter_map(|n| sysfs_index(&n).map(|i| (i, n)))
            .collect();
        names.sort();

        let mut devices = Vec::with_capacity(names.len());
        for (_, name) in names {
            match self.scan_device(&dir.join(&name), &name) {
                Ok(Some(dev)) => devices.push(dev),
                Ok(None) => debug!(device = %name, "device vanished during scan"),
                Err(e) => warn!(device = %name, "skipping device: {e}"),
            }
        }
        assign_ids(&mut devices);
        Ok(devices)
    }

    fn read_channel(&self, device: &DeviceInfo, channel: &ChannelInfo) -> Result<f64> {
        let dir = self.device_dir(device);
        let path = dir.join(format!("in_{}_{}", channel.id, channel.source.suffix()));
        let text = fs::read_to_string(&path).map_err(|e| classify(&dir, &channel.id, e))?;
        let text = text.trim();
        if text.is_empty() {
            return Err(SourceError::fault(&channel.id, ReadFault::NoData));
        }
        text.parse::<f64>()
            .map_err(|_| SourceError::fault(&channel.id, ReadFault::Invalid(text.to_string())))
    }

    fn arm_trigger(&self, device: &DeviceInfo, spec: &TriggerSpec) -> Result<Box<dyn ScanBuffer>> {
        if !device.buffered {
            return Err(SourceError::Unsupported("device has no triggered buffer"));
        }
        let dir = self.device_dir(device);
        if !dir.is_dir() {
            return Err(SourceError::DeviceLost(device.id.clone()));
        }
        let mut elements: Vec<(Option<usize>, ScanElement)> = device
            .channels
            .iter()
            .enumerate()
            .filter_map(|(pos, ch)| ch.scan.map(|s| (Some(pos), s)))
            .collect();
        if let Some(ts) = device.timestamp {
            elements.push((None, ts));
        }
        let layout = ScanLayout::new(elements)?;

        let scan_dir = dir.join("scan_elements");
        let buffer_dir = dir.join("buffer");
        let _ = write_attr(&buffer_dir.join("enable"), "0");
        // Elements left enabled by another user would shift the record layout.
        if let Ok(entries) = fs::read_dir(&scan_dir) {
            for entry in entries.flatten() {
                if entry.file_name().to_str().is_some_and(|n| n.ends_with("_en")) {
                    write_attr(&entry.path(), "0")?;
                }
            }
        }
        for ch in device.channels.iter().filter(|c| c.scan.is_some()) {
            write_attr(&scan_dir.join(format!("in_{}_en", ch.id)), "1")?;
        }
        if device.timestamp.is_some() {
            write_attr(&scan_dir.join("in_timestamp_en"), "1")?;
        }
        if let Some(trigger) = &spec.trigger {
            write_attr(&dir.join("trigger/current_trigger"), trigger)?;
        }
        write_attr(&buffer_dir.join("length"), &spec.buffer_length.to_string())?;
        write_attr(&buffer_dir.join("enable"), "1")?;

        let node = self.dev_root.join(&device.sysfs_name);
        let file = fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&node)
            .map_err(|e| {
                let _ = write_attr(&buffer_dir.join("enable"), "0");
                SourceError::Io(format!("{}: {e}", node.display()))
            })?;

        let (tx, rx) = mpsc::channel(spec.queue_depth.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let producer = {
            let stop = stop.clone();
            let poll = spec.poll_interval;
            let device_id = device.id.clone();
            thread::Builder::new()
                .name(format!("iio-buf-{}", device.sysfs_name))
                .spawn(move || drain_buffer(file, layout, tx, stop, poll, device_id))
                .map_err(|e| SourceError::Io(e.to_string()))?
        };

        Ok(Box::new(SysfsScanBuffer {
            device_id: device.id.clone(),
            device_dir: dir,
            trigger_set: spec.trigger.is_some(),
            rx,
            stop,
            producer: Some(producer),
            armed: true,
        }))
    }
}

/// Producer side: read whole records from the character device into the bounded queue.
fn drain_buffer(
    mut file: fs::File,
    layout: ScanLayout,
    tx: mpsc::Sender<Result<RawScan>>,
    stop: Arc<AtomicBool>,
    poll: Duration,
    device_id: String,
) {
    let len = layout.record_len();
    let mut record = vec![0u8; len];
    let mut filled = 0usize;
    while !stop.load(Ordering::Relaxed) {
        match file.read(&mut record[filled..]) {
            Ok(0) => thread::sleep(poll),
            Ok(n) => {
                filled += n;
                if filled < len {
                    continue;
                }
                filled = 0;
                let scan = layout.decode(&record);
                if tx.blocking_send(scan).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(poll),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let err = match e.raw_os_error() {
                    Some(libc::ENODEV) => SourceError::DeviceLost(device_id.clone()),
                    _ => SourceError::Io(e.to_string()),
                };
                let _ = tx.blocking_send(Err(err));
                break;
            }
        }
    }
    debug!(device = %device_id, "buffer producer stopped");
}

struct SysfsScanBuffer {
    device_id: String,
    device_dir: PathBuf,
    trigger_set: bool,
    rx: mpsc::Receiver<Result<RawScan>>,
    stop: Arc<AtomicBool>,
    producer: Option<thread::JoinHandle<()>>,
    armed: bool,
}

#[async_trait]
impl ScanBuffer for SysfsScanBuffer {
    async fn next_scan(&mut self, timeout: Duration) -> Result<RawScan> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(scan)) => scan,
            Ok(None) if !self.device_dir.is_dir() => Err(SourceError::DeviceLost(self.device_id.clone())),
            Ok(None) => Err(SourceError::Io("buffer producer exited".into())),
            Err(_) => Err(SourceError::Timeout),
        }
    }

    fn disarm(&mut self) -> Result<()> {
        if !self.armed {
            return Ok(());
        }
        self.armed = false;
        self.stop.store(true, Ordering::Relaxed);
        self.rx.close();
        if let Some(handle) = self.producer.take() {
            let _ = handle.join();
        }
        if !self.device_dir.is_dir() {
            return Ok(());
        }
        write_attr(&self.device_dir.join("buffer/enable"), "0")?;
        if self.trigger_set {
            write_attr(&self.device_dir.join("trigger/current_trigger"), "")?;
        }
        debug!(device = %self.device_id, "buffer disarmed");
        Ok(())
    }
}

impl Drop for SysfsScanBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.disarm() {
            warn!(device = %self.device_id, "failed to disarm buffer: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChannelKind;
    use std::fs;
    use tempfile::TempDir;

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn env_sensor(root: &Path, n: u32, name: &str) -> PathBuf {
        let dir = root.join(format!("bus/iio/devices/iio:device{n}"));
        write(&dir.join("name"), &format!("{name}\n"));
        write(&dir.join("in_temp_raw"), "2500\n");
        write(&dir.join("in_temp_scale"), "0.01\n");
        write(&dir.join("in_humidityrelative_input"), "45200\n");
        write(&dir.join("in_pressure_raw"), "1013\n");
        write(&dir.join("in_pressure_scale"), "0.1\n");
        write(&dir.join("in_pressure_offset"), "2\n");
        write(&dir.join("in_rot_quaternion_raw"), "1 2 3 4\n");
        dir
    }

    fn imu(root: &Path, n: u32) -> PathBuf {
        let dir = root.join(format!("bus/iio/devices/iio:device{n}"));
        write(&dir.join("name"), "lsm6dsx\n");
        for axis in ["x", "y", "z"] {
            write(&dir.join(format!("in_accel_{axis}_raw")), "100\n");
        }
        write(&dir.join("in_accel_scale"), "0.000598\n");
        let scan = dir.join("scan_elements");
        for (i, axis) in ["x", "y", "z"].iter().enumerate() {
            write(&scan.join(format!("in_accel_{axis}_en")), "0\n");
            write(&scan.join(format!("in_accel_{axis}_index")), &format!("{i}\n"));
            write(&scan.join(format!("in_accel_{axis}_type")), "le:s16/16>>0\n");
        }
        write(&scan.join("in_timestamp_en"), "0\n");
        write(&scan.join("in_timestamp_index"), "3\n");
        write(&scan.join("in_timestamp_type"), "le:s64/64>>0\n");
        write(&dir.join("buffer/enable"), "0\n");
        write(&dir.join("buffer/length"), "0\n");
        write(&dir.join("trigger/current_trigger"), "\n");
        dir
    }

    #[test]
    fn discovers_channels_and_calibration() {
        let tmp = TempDir::new().unwrap();
        env_sensor(tmp.path(), 0, "bme280");
        let src = SysfsSource::new(tmp.path(), tmp.path().join("dev"));

        let devices = src.discover().unwrap();
        assert_eq!(devices.len(), 1);
        let dev = &devices[0];
        assert_eq!(dev.id, "bme280");
        assert_eq!(dev.sysfs_name, "iio:device0");
        let ids: Vec<_> = dev.channels.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["humidityrelative", "pressure", "temp"]);

        let temp = dev.channel("temp").unwrap();
        assert_eq!(temp.kind, ChannelKind::Temperature);
        assert_eq!(temp.calibration.scale, Some(0.01));
        assert_eq!(temp.calibration.offset, None);

        let hum = dev.channel("humidityrelative").unwrap();
        assert_eq!(hum.source, ValueSource::Processed);
        assert_eq!(src.read_channel(dev, hum).unwrap(), 45200.0);
    }

    #[test]
    fn discovery_is_idempotent_and_disambiguates_names() {
        let tmp = TempDir::new().unwrap();
        env_sensor(tmp.path(), 0, "bme280");
        env_sensor(tmp.path(), 2, "bme280");
        imu(tmp.path(), 1);
        let src = SysfsSource::new(tmp.path(), tmp.path().join("dev"));

        let first = src.discover().unwrap();
        let second = src.discover().unwrap();
        assert_eq!(first, second);
        let ids: Vec<_> = first.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["bme280_0", "lsm6dsx", "bme280_2"]);
    }

    #[test]
    fn malformed_scale_excludes_only_that_channel() {
        let tmp = TempDir::new().unwrap();
        let dir = env_sensor(tmp.path(), 0, "bme280");
        write(&dir.join("in_pressure_scale"), "garbage\n");
        let src = SysfsSource::new(tmp.path(), tmp.path().join("dev"));

        let dev = &src.discover().unwrap()[0];
        assert!(dev.channel("pressure").is_none());
        assert!(dev.channel("temp").is_some());
    }

    #[test]
    fn scan_elements_attach_to_channels() {
        let tmp = TempDir::new().unwrap();
        imu(tmp.path(), 0);
        let src = SysfsSource::new(tmp.path(), tmp.path().join("dev"));

        let dev = &src.discover().unwrap()[0];
        assert!(dev.buffered);
        assert_eq!(dev.timestamp.map(|t| t.index), Some(3));
        let x = dev.channel("accel_x").unwrap();
        assert_eq!(x.scan.map(|s| s.index), Some(0));
        assert_eq!(x.calibration.scale, Some(0.000598));
        assert_eq!(x.modifier.as_deref(), Some("x"));
    }

    #[test]
    fn vanished_device_reports_lost() {
        let tmp = TempDir::new().unwrap();
        let dir = env_sensor(tmp.path(), 0, "bme280");
        let src = SysfsSource::new(tmp.path(), tmp.path().join("dev"));
        let dev = src.discover().unwrap().remove(0);

        fs::remove_dir_all(&dir).unwrap();
        let err = src.read_channel(&dev, dev.channel("temp").unwrap()).unwrap_err();
        assert!(err.is_device_lost());
        assert!(src.discover().unwrap().is_empty());
    }

    #[test]
    fn empty_value_is_no_data() {
        let tmp = TempDir::new().unwrap();
        let dir = env_sensor(tmp.path(), 0, "bme280");
        let src = SysfsSource::new(tmp.path(), tmp.path().join("dev"));
        let dev = src.discover().unwrap().remove(0);

        write(&dir.join("in_temp_raw"), "\n");
        match src.read_channel(&dev, dev.channel("temp").unwrap()) {
            Err(SourceError::Fault { fault, .. }) => assert_eq!(fault, ReadFault::NoData),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn missing_iio_bus_discovers_nothing() {
        let tmp = TempDir::new().unwrap();
        let src = SysfsSource::new(tmp.path(), tmp.path().join("dev"));
        assert!(src.discover().unwrap().is_empty());
    }

    #[test]
    fn errno_maps_to_channel_faults() {
        let fault = |errno| fault_for(errno, &io::Error::from_raw_os_error(errno));
        for errno in [libc::EAGAIN, libc::EBUSY, libc::ENODATA, libc::ETIMEDOUT] {
            assert_eq!(fault(errno), Some(Ok(ReadFault::NoData)), "errno {errno}");
        }
        for errno in [libc::ERANGE, libc::EOVERFLOW] {
            assert_eq!(fault(errno), Some(Ok(ReadFault::Overrange)), "errno {errno}");
        }
        assert!(matches!(fault(libc::EINVAL), Some(Ok(ReadFault::Invalid(_)))));
        assert_eq!(fault(libc::ENODEV), Some(Err(())));
        assert_eq!(fault(libc::ENOENT), Some(Err(())));
        assert_eq!(fault(libc::EACCES), None);
    }

    #[test]
    fn read_errors_on_a_present_device_stay_per_channel() {
        let tmp = TempDir::new().unwrap();
        let dir = env_sensor(tmp.path(), 0, "bme280");
        let overrange = classify(&dir, "temp", io::Error::from_raw_os_error(libc::ERANGE));
        assert!(matches!(
            overrange,
            SourceError::Fault { fault: ReadFault::Overrange, .. }
        ));
        let gone = classify(&dir, "temp", io::Error::from_raw_os_error(libc::ENODEV));
        assert!(gone.is_device_lost());
        let other = classify(&dir, "temp", io::Error::from_raw_os_error(libc::EACCES));
        assert!(matches!(other, SourceError::Io(_)));

        fs::remove_dir_all(&dir).unwrap();
        let vanished = classify(&dir, "temp", io::Error::from_raw_os_error(libc::ERANGE));
        assert!(vanished.is_device_lost());
    }

    #[tokio::test]
    async fn arming_and_disarming_writes_buffer_attributes() {
        let tmp = TempDir::new().unwrap();
        let dir = imu(tmp.path(), 0);
        // A regular file stands in for the character device; it reads as EOF.
        write(&tmp.path().join("dev/iio:device0"), "");
        let src = SysfsSource::new(tmp.path(), tmp.path().join("dev"));
        let dev = src.discover().unwrap().remove(0);

        let spec = TriggerSpec {
            trigger: Some("trigger0".into()),
            ..TriggerSpec::default()
        };
        let mut buf = src.arm_trigger(&dev, &spec).unwrap();
        let read = |p: &str| fs::read_to_string(dir.join(p)).unwrap();
        assert_eq!(read("buffer/enable"), "1");
        assert_eq!(read("trigger/current_trigger"), "trigger0");
        assert_eq!(read("scan_elements/in_accel_y_en"), "1");
        assert_eq!(read("scan_elements/in_timestamp_en"), "1");

        assert!(matches!(
            buf.next_scan(Duration::from_millis(20)).await,
            Err(SourceError::Timeout)
        ));

        drop(buf);
        assert_eq!(read("buffer/enable"), "0");
        assert_eq!(read("trigger/current_trigger"), "");
    }
}
