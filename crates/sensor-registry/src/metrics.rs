use crate::Result;
use bus_publisher::StatsSnapshot;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

#[derive(Clone)]
pub struct BridgeMetrics {
    pub samples_read: IntCounter,
    pub read_faults: IntCounter,
    pub messages_queued: IntCounter,
    pub messages_rejected: IntCounter,
    pub device_losses: IntCounter,
    pub devices_active: IntGauge,
    pub publisher_published: IntGauge,
    pub publisher_dropped: IntGauge,
    pub publisher_reconnects: IntGauge,
}

#[derive(Clone)]
pub struct MetricsHub {
    pub registry: Registry,
    pub bridge: BridgeMetrics,
}

impl MetricsHub {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let bridge = BridgeMetrics {
            samples_read: IntCounter::new("iio2mqtt_samples_read", "Channel values read and normalized")?,
            read_faults: IntCounter::new("iio2mqtt_read_faults", "Channel reads that failed")?,
            messages_queued: IntCounter::new("iio2mqtt_messages_queued", "Messages handed to the publisher")?,
            messages_rejected: IntCounter::new(
                "iio2mqtt_messages_rejected",
                "Messages the publisher refused",
            )?,
            device_losses: IntCounter::new("iio2mqtt_device_losses", "Devices that disappeared while bridged")?,
            devices_active: IntGauge::new("iio2mqtt_devices_active", "Devices currently bridged")?,
            publisher_published: IntGauge::new(
                "iio2mqtt_publisher_published",
                "Messages accepted by the broker",
            )?,
            publisher_dropped: IntGauge::new(
                "iio2mqtt_publisher_dropped",
                "Messages evicted from a full queue",
            )?,
            publisher_reconnects: IntGauge::new("iio2mqtt_publisher_reconnects", "Broker reconnections")?,
        };
        registry.register(Box::new(bridge.samples_read.clone()))?;
        registry.register(Box::new(bridge.read_faults.clone()))?;
        registry.register(Box::new(bridge.messages_queued.clone()))?;
        registry.register(Box::new(bridge.messages_rejected.clone()))?;
        registry.register(Box::new(bridge.device_losses.clone()))?;
        registry.register(Box::new(bridge.devices_active.clone()))?;
        registry.register(Box::new(bridge.publisher_published.clone()))?;
        registry.register(Box::new(bridge.publisher_dropped.clone()))?;
        registry.register(Box::new(bridge.publisher_reconnects.clone()))?;
        Ok(Self { registry, bridge })
    }

    /// Mirror the publisher's own counters into gauges.
    pub fn observe_publisher(&self, stats: StatsSnapshot) {
        let clamp = |v: u64| i64::try_from(v).unwrap_or(i64::MAX);
        self.bridge.publisher_published.set(clamp(stats.published));
        self.bridge.publisher_dropped.set(clamp(stats.dropped));
        self.bridge.publisher_reconnects.set(clamp(stats.reconnects));
    }

    pub fn encode_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            return format!("error encoding metrics: {e}");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposes_counters() {
        let hub = MetricsHub::new().unwrap();
        hub.bridge.samples_read.inc_by(3);
        hub.bridge.devices_active.set(2);
        hub.observe_publisher(StatsSnapshot {
            published: 5,
            ..StatsSnapshot::default()
        });
        let text = hub.encode_text();
        assert!(text.contains("iio2mqtt_samples_read 3"));
        assert!(text.contains("iio2mqtt_devices_active 2"));
        assert!(text.contains("iio2mqtt_publisher_published 5"));
    }
}
