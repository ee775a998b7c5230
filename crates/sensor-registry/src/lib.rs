//! sensor-registry: configuration, calibration, units and topic/payload mapping for
//! bridged IIO sensors

mod error;
pub use error::{RegistryError, Result};

mod config;
pub use config::{
    Acquisition, BridgeConfig, BrokerSettings, ChannelFilter, DeviceRule, DeviceRuleSpec,
    Granularity, OverflowSetting, PayloadFormat, PublishSettings, QueueSettings, TriggerSettings,
};

mod loader;
pub use loader::{load_config_file, parse_config, write_default_config, ConfigFormat};

mod units;
pub use units::{unit_for, UnitRule, UNIT_TABLE, UNKNOWN_UNIT};

mod normalize;
pub use normalize::{calibrate, normalize, Sample};

mod encode;
pub use encode::Encoder;

mod metrics;
pub use metrics::{BridgeMetrics, MetricsHub};
