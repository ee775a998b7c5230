use crate::reader::{ChannelReader, ChannelReading};
use bus_publisher::{PublishError, Publisher};
use iio_source::{DeviceInfo, ReadFault, SensorSource, SourceError};
use sensor_registry::{normalize, Acquisition, BridgeMetrics, Encoder};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Why a device loop ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoopExit {
    /// Stopped on request.
    Stopped,
    /// The device disappeared; the coordinator drops it until a rescan finds it again.
    DeviceLost(String),
    /// The publisher no longer accepts messages.
    PublisherClosed,
    /// The loop could not start; a later rescan retries it.
    Failed(String),
}

/// The acquisition loop of one device: read, normalize, encode, publish.
pub struct DeviceLoop {
    source: Arc<dyn SensorSource>,
    device: Arc<DeviceInfo>,
    acquisition: Acquisition,
    encoder: Encoder,
    publisher: Publisher,
    metrics: BridgeMetrics,
    seq: u64,
    faults: HashMap<usize, ReadFault>,
}

impl DeviceLoop {
    pub fn new(
        source: Arc<dyn SensorSource>,
        device: Arc<DeviceInfo>,
        acquisition: Acquisition,
        encoder: Encoder,
        publisher: Publisher,
        metrics: BridgeMetrics,
    ) -> Self {
        Self {
            source,
            device,
            acquisition,
            encoder,
            publisher,
            metrics,
            seq: 0,
            faults: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> LoopExit {
        let id = self.device.id.clone();
        let (mut reader, mut ticker) = match &self.acquisition {
            Acquisition::Polled { interval } => {
                let mut ticker = tokio::time::interval(*interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                info!(device = %id, interval_ms = interval.as_millis() as u64, "polling device");
                (
                    ChannelReader::polled(self.source.clone(), self.device.clone()),
                    Some(ticker),
                )
            }
            Acquisition::Triggered { spec, timeout } => {
                match ChannelReader::triggered(
                    self.source.clone(),
                    self.device.clone(),
                    spec,
                    *timeout,
                ) {
                    Ok(reader) => {
                        info!(device = %id, trigger = ?spec.trigger, "triggered buffer armed");
                        (reader, None)
                    }
                    Err(e) if e.is_device_lost() => return LoopExit::DeviceLost(e.to_string()),
                    Err(e) => {
                        warn!(device = %id, "cannot arm triggered buffer: {e}");
                        return LoopExit::Failed(e.to_string());
                    }
                }
            }
        };

        let exit = loop {
            if *stop.borrow() {
                break LoopExit::Stopped;
            }
            let cycle = tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() {
                        break LoopExit::Stopped;
                    }
                    continue;
                }
                res = async {
                    if let Some(t) = ticker.as_mut() {
                        t.tick().await;
                    }
                    reader.read_cycle().await
                } => res,
            };
            match cycle {
                Ok(readings) => {
                    if let Some(exit) = self.publish_cycle(readings).await {
                        break exit;
                    }
                }
                Err(e) if e.is_device_lost() || matches!(e, SourceError::NotFound(_)) => {
                    warn!(device = %id, "device lost: {e}");
                    break LoopExit::DeviceLost(e.to_string());
                }
                Err(e) => warn!(device = %id, "read cycle failed: {e}"),
            }
        };

        if let Err(e) = reader.disarm() {
            debug!(device = %id, "disarm failed: {e}");
        }
        info!(device = %id, ?exit, "device loop ended");
        exit
    }

    async fn publish_cycle(&mut self, readings: Vec<ChannelReading>) -> Option<LoopExit> {
        let seq = self.seq;
        self.seq += 1;
        let mut samples = Vec::with_capacity(readings.len());
        for reading in readings {
            let Some(channel) = self.device.channels.get(reading.channel) else {
                continue;
            };
            match reading.value {
                Ok(raw) => {
                    if self.faults.remove(&reading.channel).is_some() {
                        info!(device = %self.device.id, channel = %channel.id, "channel recovered");
                    }
                    samples.push(normalize(
                        &self.device,
                        channel,
                        raw,
                        reading.timestamp,
                        Some(seq),
                    ));
                }
                Err(fault) => {
                    self.metrics.read_faults.inc();
                    if self.faults.get(&reading.channel) != Some(&fault) {
                        warn!(device = %self.device.id, channel = %channel.id, "read fault: {fault}");
                        self.faults.insert(reading.channel, fault);
                    }
                }
            }
        }
        self.metrics.samples_read.inc_by(samples.len() as u64);

        let messages = match self.encoder.encode(&self.device.id, &samples) {
            Ok(m) => m,
            Err(e) => {
                warn!(device = %self.device.id, "encoding failed: {e}");
                return None;
            }
        };
        for message in messages {
            match self.publisher.publish(message).await {
                Ok(()) => self.metrics.messages_queued.inc(),
                Err(PublishError::Closed) => return Some(LoopExit::PublisherClosed),
                Err(e) => {
                    self.metrics.messages_rejected.inc();
                    debug!(device = %self.device.id, "message rejected: {e}");
                }
            }
        }
        None
    }
}
