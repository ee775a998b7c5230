use crate::device::{DeviceLoop, LoopExit};
use crate::{PipelineError, Result};
use bus_publisher::{Publisher, ShutdownReport};
use iio_source::{DeviceInfo, SensorSource};
use sensor_registry::{Acquisition, BridgeConfig, Encoder, MetricsHub};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Discover devices and apply the configured device rules and channel filters.
pub async fn discover_selected(
    source: &Arc<dyn SensorSource>,
    config: &BridgeConfig,
) -> Result<Vec<(DeviceInfo, Acquisition)>> {
    let src = source.clone();
    let devices = tokio::task::spawn_blocking(move || src.discover())
        .await
        .map_err(|e| PipelineError::Task(e.to_string()))??;
    let mut selected = Vec::with_capacity(devices.len());
    for dev in devices {
        let Some(mut acquisition) = config.acquisition_for(&dev) else {
            debug!(device = %dev.id, "not selected by any device rule");
            continue;
        };
        let dev = config.filter_channels(dev);
        if dev.channels.is_empty() {
            debug!(device = %dev.id, "no channels left after filtering");
            continue;
        }
        if matches!(acquisition, Acquisition::Triggered { .. })
            && !dev.channels.iter().any(|c| c.scan.is_some())
        {
            warn!(device = %dev.id, "no scan elements for triggered mode, polling instead");
            acquisition = Acquisition::Polled {
                interval: config.interval(),
            };
        }
        selected.push((dev, acquisition));
    }
    Ok(selected)
}

struct Running {
    device: Arc<DeviceInfo>,
    acquisition: Acquisition,
    generation: u64,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

type ExitReport = (String, u64, LoopExit);

/// Owns the device loops: starts them, keeps them in line with periodic rescans and shuts
/// everything down, publisher last.
pub struct Coordinator {
    source: Arc<dyn SensorSource>,
    config: BridgeConfig,
    publisher: Publisher,
    metrics: MetricsHub,
    encoder: Encoder,
    running: BTreeMap<String, Running>,
    generation: u64,
    exits: (mpsc::UnboundedSender<ExitReport>, mpsc::UnboundedReceiver<ExitReport>),
}

impl Coordinator {
    pub fn new(
        source: Arc<dyn SensorSource>,
        config: BridgeConfig,
        publisher: Publisher,
        metrics: MetricsHub,
    ) -> Self {
        let encoder = Encoder::new(&config.publish);
        Self {
            source,
            config,
            publisher,
            metrics,
            encoder,
            running: BTreeMap::new(),
            generation: 0,
            exits: mpsc::unbounded_channel(),
        }
    }

    /// Run until `shutdown` flips to `true` (or its sender goes away).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<ShutdownReport> {
        let selected = match discover_selected(&self.source, &self.config).await {
            Ok(selected) => selected,
            Err(e) if !self.config.require_devices => {
                warn!("initial discovery failed: {e}");
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        if selected.is_empty() {
            if self.config.require_devices {
                return Err(PipelineError::NoDevices);
            }
            warn!("no devices found, waiting for rescan");
        }
        for (dev, acquisition) in selected {
            info!(device = %dev.id, model = %dev.model(), channels = dev.channels.len(), "bridging device");
            self.spawn(dev, acquisition);
        }
        self.update_active();

        let period = self.config.rescan_interval();
        let mut rescan = tokio::time::interval_at(Instant::now() + period, period);
        rescan.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some((id, generation, exit)) = self.exits.1.recv() => {
                    self.handle_exit(id, generation, exit).await;
                }
                _ = rescan.tick() => self.rescan().await,
            }
        }

        info!(devices = self.running.len(), "shutting down");
        self.stop_all().await;
        let report = self.publisher.shutdown(self.config.shutdown_grace()).await?;
        info!(flushed = report.flushed, discarded = report.discarded, "publisher stopped");
        Ok(report)
    }

    fn spawn(&mut self, device: DeviceInfo, acquisition: Acquisition) {
        self.generation += 1;
        let generation = self.generation;
        let device = Arc::new(device);
        let (stop, stop_rx) = watch::channel(false);
        let worker = DeviceLoop::new(
            self.source.clone(),
            device.clone(),
            acquisition.clone(),
            self.encoder.clone(),
            self.publisher.clone(),
            self.metrics.bridge.clone(),
        );
        let exits = self.exits.0.clone();
        let id = device.id.clone();
        let handle = tokio::spawn(async move {
            let exit = worker.run(stop_rx).await;
            let _ = exits.send((id, generation, exit));
        });
        self.running.insert(
            device.id.clone(),
            Running {
                device,
                acquisition,
                generation,
                stop,
                handle,
            },
        );
    }

    async fn handle_exit(&mut self, id: String, generation: u64, exit: LoopExit) {
        // Exits of loops already replaced by a restart are stale.
        if self.running.get(&id).map(|r| r.generation) != Some(generation) {
            return;
        }
        self.running.remove(&id);
        match exit {
            LoopExit::DeviceLost(reason) => {
                warn!(device = %id, "device lost ({reason}), dropping until it reappears");
                self.metrics.bridge.device_losses.inc();
                self.discard(&id).await;
            }
            LoopExit::Failed(reason) => warn!(device = %id, "device loop failed: {reason}"),
            LoopExit::PublisherClosed => warn!(device = %id, "publisher closed"),
            LoopExit::Stopped => {}
        }
        self.update_active();
    }

    async fn rescan(&mut self) {
        let selected = match discover_selected(&self.source, &self.config).await {
            Ok(s) => s,
            Err(e) => {
                warn!("rescan failed: {e}");
                return;
            }
        };
        let found: BTreeMap<String, (DeviceInfo, Acquisition)> = selected
            .into_iter()
            .map(|(dev, acq)| (dev.id.clone(), (dev, acq)))
            .collect();

        let gone: Vec<String> = self
            .running
            .keys()
            .filter(|id| !found.contains_key(*id))
            .cloned()
            .collect();
        for id in gone {
            if let Some(running) = self.running.remove(&id) {
                info!(device = %id, "device removed");
                self.stop_one(running).await;
                self.discard(&id).await;
            }
        }

        for (id, (dev, acquisition)) in found {
            match self.running.get(&id) {
                Some(r) if *r.device == dev && r.acquisition == acquisition => {}
                Some(_) => {
                    info!(device = %id, "device changed, restarting");
                    if let Some(running) = self.running.remove(&id) {
                        self.stop_one(running).await;
                    }
                    self.spawn(dev, acquisition);
                }
                None => {
                    info!(device = %id, model = %dev.model(), "device added");
                    self.spawn(dev, acquisition);
                }
            }
        }
        self.update_active();
    }

    async fn stop_one(&self, running: Running) {
        let _ = running.stop.send(true);
        let abort = running.handle.abort_handle();
        let grace = self.config.shutdown_grace();
        if tokio::time::timeout(grace, running.handle).await.is_err() {
            warn!(device = %running.device.id, "device loop did not stop in time, aborting");
            abort.abort();
        }
    }

    async fn stop_all(&mut self) {
        let running = std::mem::take(&mut self.running);
        for r in running.values() {
            let _ = r.stop.send(true);
        }
        let deadline = Instant::now() + self.config.shutdown_grace();
        for (id, r) in running {
            let abort = r.handle.abort_handle();
            if tokio::time::timeout_at(deadline, r.handle).await.is_err() {
                warn!(device = %id, "device loop did not stop in time, aborting");
                abort.abort();
            }
        }
        self.update_active();
    }

    async fn discard(&self, id: &str) {
        let n = self.publisher.discard_device(id).await;
        if n > 0 {
            debug!(device = %id, discarded = n, "dropped queued messages");
        }
    }

    fn update_active(&self) {
        self.metrics
            .bridge
            .devices_active
            .set(self.running.len() as i64);
    }
}
