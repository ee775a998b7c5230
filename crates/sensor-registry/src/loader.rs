use crate::config::BridgeConfig;
use anyhow::Context;
use std::fs;
use std::io::Write;
use std::path::Path;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConfigFormat {
    Toml,
    Yaml,
}

impl ConfigFormat {
    /// `.yml`/`.yaml` select YAML, anything else is read as TOML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yml") | Some("yaml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Toml,
        }
    }
}

pub fn parse_config(raw: &str, format: ConfigFormat) -> anyhow::Result<BridgeConfig> {
    let cfg: BridgeConfig = match format {
        ConfigFormat::Toml => toml::from_str(raw).context("parsing toml")?,
        ConfigFormat::Yaml => serde_yaml::from_str(raw).context("parsing yaml")?,
    };
    cfg.validate()?;
    Ok(cfg)
}

pub fn load_config_file(path: impl AsRef<Path>) -> anyhow::Result<BridgeConfig> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading config: {}", path.display()))?;
    parse_config(&raw, ConfigFormat::from_path(path))
        .with_context(|| format!("loading config: {}", path.display()))
}

/// Write the default configuration to `path` in the format its extension selects.
/// An existing file is never overwritten.
pub fn write_default_config(path: impl AsRef<Path>) -> anyhow::Result<()> {
    let path = path.as_ref();
    let cfg = BridgeConfig::default();
    let text = match ConfigFormat::from_path(path) {
        ConfigFormat::Toml => toml::to_string_pretty(&cfg).context("serializing toml")?,
        ConfigFormat::Yaml => serde_yaml::to_string(&cfg).context("serializing yaml")?,
    };
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("creating config: {}", path.display()))?;
    file.write_all(text.as_bytes())
        .with_context(|| format!("writing config: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceRule, Granularity, OverflowSetting, PayloadFormat};
    use std::time::Duration;

    #[test]
    fn loads_toml_with_defaults() {
        let mut f = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            f,
            r#"
interval_ms = 1000
devices = ["bme280", {{ match = "bmi160", trigger = {{ name = "bmi160-dev1" }} }}]
channels = ["temp", "accel"]

[publish]
namespace = "lab/sensors"
granularity = "per_cycle"

[broker]
host = "broker.local"
"#
        )
        .unwrap();
        let cfg = load_config_file(f.path()).unwrap();
        assert_eq!(cfg.interval_ms, 1000);
        assert_eq!(cfg.publish.namespace, "lab/sensors");
        assert_eq!(cfg.publish.granularity, Granularity::PerCycle);
        assert_eq!(cfg.publish.format, PayloadFormat::Json);
        assert_eq!(cfg.broker.host, "broker.local");
        assert_eq!(cfg.broker.port, 1883);
        assert_eq!(cfg.queue.capacity, 1024);
        assert_eq!(cfg.devices.len(), 2);
        assert_eq!(cfg.devices[0], DeviceRule::Id("bme280".into()));
        assert_eq!(cfg.devices[1].pattern(), "bmi160");
        assert_eq!(cfg.channels.allow, vec!["temp", "accel"]);
        assert!(cfg.channels.deny.is_empty());
    }

    #[test]
    fn loads_yaml_by_extension() {
        let mut f = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            f,
            "channels:\n  deny: [temp]\nqueue:\n  capacity: 8\n  overflow: reject_new\nbroker:\n  host: 10.0.0.2\n  qos: 1\n"
        )
        .unwrap();
        let cfg = load_config_file(f.path()).unwrap();
        assert_eq!(cfg.queue.capacity, 8);
        assert_eq!(cfg.queue.overflow, OverflowSetting::RejectNew);
        assert_eq!(cfg.broker.qos, 1);
        assert_eq!(cfg.channels.allow, vec!["all"]);
        assert_eq!(cfg.channels.deny, vec!["temp"]);
    }

    #[test]
    fn invalid_values_fail_to_load() {
        let err = parse_config("interval_ms = 0", ConfigFormat::Toml).unwrap_err();
        assert!(format!("{err:#}").contains("interval_ms"));
        assert!(parse_config("[broker]\nport = \"x\"", ConfigFormat::Toml).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_config_file("/nonexistent/iio2mqtt.toml").is_err());
    }

    #[test]
    fn legacy_daemon_config_keeps_its_interval() {
        let raw = r#"
interval_seconds = 10
log_file = "/var/log/iio2mqtt.log"
output_file = "/var/log/iio2mqtt.log"
devices = ["iio:device0"]
channels = ["all"]
"#;
        let cfg = parse_config(raw, ConfigFormat::Toml).unwrap();
        assert_eq!(cfg.interval(), Duration::from_secs(10));
        assert_eq!(cfg.devices, vec![DeviceRule::Id("iio:device0".into())]);
        assert_eq!(cfg.channels.allow, vec!["all"]);
        assert!(parse_config("interval_seconds = 0", ConfigFormat::Toml).is_err());
    }

    #[test]
    fn default_config_is_written_once_and_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["iio2mqtt.toml", "iio2mqtt.yaml"] {
            let path = dir.path().join(name);
            write_default_config(&path).unwrap();
            assert_eq!(load_config_file(&path).unwrap(), BridgeConfig::default());
            assert!(write_default_config(&path).is_err());
        }
    }
}
