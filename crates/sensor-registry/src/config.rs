use bus_publisher::{BackoffConfig, OverflowPolicy, PublisherConfig, Qos};
use iio_source::{ChannelInfo, DeviceInfo, TriggerSpec};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::{RegistryError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub log_file: Option<PathBuf>,
    pub sysfs_root: PathBuf,
    pub dev_root: PathBuf,
    /// Default polling interval for devices without a rule of their own.
    pub interval_ms: u64,
    /// Whole-second form of the default interval; takes precedence over `interval_ms`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<u64>,
    pub rescan_interval_ms: u64,
    pub shutdown_grace_ms: u64,
    /// Exit when no device can be bridged at startup.
    pub require_devices: bool,
    /// Devices to bridge. Empty bridges every discovered device.
    pub devices: Vec<DeviceRule>,
    pub channels: ChannelFilter,
    pub publish: PublishSettings,
    pub broker: BrokerSettings,
    pub queue: QueueSettings,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            log_file: None,
            sysfs_root: PathBuf::from("/sys"),
            dev_root: PathBuf::from("/dev"),
            interval_ms: 5000,
            interval_seconds: None,
            rescan_interval_ms: 30_000,
            shutdown_grace_ms: 2000,
            require_devices: true,
            devices: Vec::new(),
            channels: ChannelFilter::default(),
            publish: PublishSettings::default(),
            broker: BrokerSettings::default(),
            queue: QueueSettings::default(),
        }
    }
}

/// Either a bare device reference (`"iio:device0"`) or a table with per-device policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceRule {
    Id(String),
    Detailed(DeviceRuleSpec),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRuleSpec {
    /// Matches the device id, kernel name, label or sysfs entry; `*` matches any device.
    #[serde(rename = "match")]
    pub pattern: String,
    #[serde(default)]
    pub interval_ms: Option<u64>,
    #[serde(default)]
    pub trigger: Option<TriggerSettings>,
}

impl DeviceRule {
    pub fn pattern(&self) -> &str {
        match self {
            DeviceRule::Id(p) => p,
            DeviceRule::Detailed(spec) => &spec.pattern,
        }
    }

    pub fn matches(&self, dev: &DeviceInfo) -> bool {
        let p = self.pattern();
        p == "*"
            || p == dev.id
            || p == dev.sysfs_name
            || dev.name.as_deref() == Some(p)
            || dev.label.as_deref() == Some(p)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerSettings {
    /// Trigger to select, e.g. `bmi160-dev0`; unset keeps the driver's current trigger.
    pub name: Option<String>,
    pub timeout_ms: u64,
    pub buffer_length: u32,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            name: None,
            timeout_ms: 1000,
            buffer_length: 16,
        }
    }
}

/// How a device is sampled.
#[derive(Debug, Clone, PartialEq)]
pub enum Acquisition {
    Polled { interval: Duration },
    Triggered { spec: TriggerSpec, timeout: Duration },
}

/// Channel allow/deny lists by channel id (`accel_x`) or type (`accel`).
/// A bare list is shorthand for `allow`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ChannelFilterRepr")]
pub struct ChannelFilter {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ChannelFilterRepr {
    List(Vec<String>),
    Table {
        #[serde(default = "allow_all")]
        allow: Vec<String>,
        #[serde(default)]
        deny: Vec<String>,
    },
}

fn allow_all() -> Vec<String> {
    vec!["all".to_string()]
}

impl From<ChannelFilterRepr> for ChannelFilter {
    fn from(repr: ChannelFilterRepr) -> Self {
        match repr {
            ChannelFilterRepr::List(allow) => ChannelFilter {
                allow,
                deny: Vec::new(),
            },
            ChannelFilterRepr::Table { allow, deny } => ChannelFilter { allow, deny },
        }
    }
}

impl Default for ChannelFilter {
    fn default() -> Self {
        Self {
            allow: allow_all(),
            deny: Vec::new(),
        }
    }
}

impl ChannelFilter {
    pub fn allows(&self, ch: &ChannelInfo) -> bool {
        let hit = |list: &[String]| {
            list.iter()
                .any(|e| e == &ch.id || e == ch.kind.iio_name())
        };
        let allowed = self.allow.iter().any(|e| e == "all") || hit(&self.allow);
        allowed && !hit(&self.deny)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    /// One message per channel: `<namespace>/<device>/<channel>`.
    PerChannel,
    /// One batch per device and read cycle: `<namespace>/<device>`.
    PerCycle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    Json,
    /// The calibrated value as decimal text.
    Plain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishSettings {
    pub namespace: String,
    pub granularity: Granularity,
    pub format: PayloadFormat,
    pub include_raw: bool,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            namespace: "iio".to_string(),
            granularity: Granularity::PerChannel,
            format: PayloadFormat::Json,
            include_raw: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    pub connect_timeout_ms: u64,
    pub qos: u8,
    pub retain: bool,
    pub connect_retries: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: None,
            username: None,
            password: None,
            keep_alive_secs: 30,
            connect_timeout_ms: 5000,
            qos: 0,
            retain: false,
            connect_retries: 5,
            backoff_initial_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

impl BrokerSettings {
    /// Configured client id, or `iio2mqtt-<uuid>`.
    pub fn client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("iio2mqtt-{}", uuid::Uuid::new_v4().simple()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowSetting {
    DropOldest,
    RejectNew,
    Wait,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub capacity: usize,
    pub overflow: OverflowSetting,
    pub wait_timeout_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: 1024,
            overflow: OverflowSetting::DropOldest,
            wait_timeout_ms: 1000,
        }
    }
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(RegistryError::Invalid(msg));
        if self.interval_ms == 0 || self.interval_seconds == Some(0) {
            return invalid("interval_ms must be positive".into());
        }
        if self.rescan_interval_ms == 0 {
            return invalid("rescan_interval_ms must be positive".into());
        }
        let ns = &self.publish.namespace;
        if ns.is_empty() || ns.contains(['+', '#']) || ns.starts_with('/') || ns.ends_with('/') {
            return invalid(format!("invalid topic namespace: {ns:?}"));
        }
        if self.broker.host.trim().is_empty() {
            return invalid("broker.host must be set".into());
        }
        if self.broker.port == 0 {
            return invalid("broker.port must be non-zero".into());
        }
        if Qos::from_level(self.broker.qos).is_none() {
            return invalid(format!("unsupported qos {}", self.broker.qos));
        }
        if self.broker.backoff_initial_ms == 0
            || self.broker.backoff_initial_ms > self.broker.backoff_max_ms
        {
            return invalid("broker backoff must satisfy 0 < initial <= max".into());
        }
        if self.queue.capacity == 0 {
            return invalid("queue.capacity must be positive".into());
        }
        if self.publish.format == PayloadFormat::Plain
            && self.publish.granularity == Granularity::PerCycle
        {
            return invalid("plain payloads require per_channel granularity".into());
        }
        for rule in &self.devices {
            if rule.pattern().is_empty() {
                return invalid("device rule with empty match".into());
            }
            if let DeviceRule::Detailed(spec) = rule {
                if spec.interval_ms == Some(0) {
                    return invalid(format!("{}: interval_ms must be positive", spec.pattern));
                }
                if spec.trigger.as_ref().is_some_and(|t| t.timeout_ms == 0) {
                    return invalid(format!("{}: trigger timeout must be positive", spec.pattern));
                }
            }
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        match self.interval_seconds {
            Some(secs) => Duration::from_secs(secs),
            None => Duration::from_millis(self.interval_ms),
        }
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_millis(self.rescan_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Acquisition policy for a device, or `None` when no rule selects it.
    pub fn acquisition_for(&self, dev: &DeviceInfo) -> Option<Acquisition> {
        if self.devices.is_empty() {
            return Some(Acquisition::Polled {
                interval: self.interval(),
            });
        }
        let rule = self.devices.iter().find(|r| r.matches(dev))?;
        let DeviceRule::Detailed(spec) = rule else {
            return Some(Acquisition::Polled {
                interval: self.interval(),
            });
        };
        if let Some(trigger) = &spec.trigger {
            return Some(Acquisition::Triggered {
                spec: TriggerSpec {
                    trigger: trigger.name.clone(),
                    buffer_length: trigger.buffer_length,
                    ..TriggerSpec::default()
                },
                timeout: Duration::from_millis(trigger.timeout_ms),
            });
        }
        Some(Acquisition::Polled {
            interval: spec
                .interval_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| self.interval()),
        })
    }

    /// Drop channels excluded by the allow/deny lists.
    pub fn filter_channels(&self, mut dev: DeviceInfo) -> DeviceInfo {
        dev.channels.retain(|c| self.channels.allows(c));
        dev
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        let overflow = match self.queue.overflow {
            OverflowSetting::DropOldest => OverflowPolicy::DropOldest,
            OverflowSetting::RejectNew => OverflowPolicy::RejectNew,
            OverflowSetting::Wait => OverflowPolicy::Wait {
                timeout: Duration::from_millis(self.queue.wait_timeout_ms),
            },
        };
        PublisherConfig {
            queue_capacity: self.queue.capacity,
            overflow,
            qos: Qos::from_level(self.broker.qos).unwrap_or_default(),
            connect_retries: self.broker.connect_retries,
            backoff: BackoffConfig {
                initial: Duration::from_millis(self.broker.backoff_initial_ms),
                max: Duration::from_millis(self.broker.backoff_max_ms),
            },
        }
    }
}
