use anyhow::{Context, Result};
use bus_publisher::{BusClient, MockBroker, MqttSettings, Publisher, RumqttClient};
use clap::{ArgAction, Parser};
use iio_source::{SensorSource, SysfsSource};
use sensor_pipeline::{discover_selected, Coordinator};
use sensor_registry::{
    load_config_file, unit_for, write_default_config, Acquisition, BridgeConfig, Encoder,
    MetricsHub,
};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "iio2mqtt", version)]
#[command(about = "Publish Linux IIO sensor readings to an MQTT broker")]
struct Args {
    /// Configuration file (TOML, or YAML by extension)
    #[arg(short, long, default_value = "/etc/iio2mqtt.toml")]
    config: PathBuf,

    /// Append logs to this file as well as stderr (overrides the config)
    #[arg(short, long)]
    log_file: Option<PathBuf>,

    /// Log messages instead of connecting to a broker
    #[arg(long, action = ArgAction::SetTrue)]
    mock_broker: bool,

    /// Load the configuration, list the devices that would be bridged and exit
    #[arg(long, action = ArgAction::SetTrue)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if !args.config.exists() {
        setup_tracing(args.log_file.as_deref())?;
        write_default_config(&args.config)?;
        warn!(config = %args.config.display(), "no configuration found, wrote defaults");
        anyhow::bail!("review {} and start again", args.config.display());
    }

    let mut config = load_config_file(&args.config)?;
    if let Some(path) = args.log_file {
        config.log_file = Some(path);
    }
    setup_tracing(config.log_file.as_deref())?;

    info!(config = %args.config.display(), "iio2mqtt starting");
    let source: Arc<dyn SensorSource> = Arc::new(SysfsSource::new(
        config.sysfs_root.clone(),
        config.dev_root.clone(),
    ));

    if args.check {
        return check(&source, &config).await;
    }

    let metrics = MetricsHub::new().context("initializing metrics")?;
    let client: Box<dyn BusClient> = if args.mock_broker {
        warn!("using mock broker, messages are only logged");
        Box::new(MockBroker::new().logging().client())
    } else {
        Box::new(RumqttClient::new(mqtt_settings(&config)))
    };
    let publisher = Publisher::start(client, config.publisher_config())
        .await
        .with_context(|| {
            format!(
                "connecting to broker {}:{}",
                config.broker.host, config.broker.port
            )
        })?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let coordinator = Coordinator::new(
        source,
        config.clone(),
        publisher.clone(),
        metrics.clone(),
    );
    let mut task = tokio::spawn(coordinator.run(stop_rx));

    let outcome = tokio::select! {
        res = &mut task => res,
        _ = shutdown_signal() => {
            info!("shutdown requested");
            let _ = stop_tx.send(true);
            task.await
        }
    };

    let result = match outcome.context("coordinator task panicked")? {
        Ok(report) => {
            info!(
                flushed = report.flushed,
                discarded = report.discarded,
                "iio2mqtt stopped"
            );
            Ok(())
        }
        Err(e) => {
            error!("pipeline failed: {e}");
            if let Err(e) = publisher.shutdown(config.shutdown_grace()).await {
                warn!("publisher shutdown: {e}");
            }
            Err(e).context("running pipeline")
        }
    };

    metrics.observe_publisher(publisher.stats());
    info!("final metrics:\n{}", metrics.encode_text());
    result
}

fn setup_tracing(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file: {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init();
    Ok(())
}

fn mqtt_settings(config: &BridgeConfig) -> MqttSettings {
    let broker = &config.broker;
    MqttSettings {
        host: broker.host.clone(),
        port: broker.port,
        client_id: broker.client_id(),
        username: broker.username.clone(),
        password: broker.password.clone(),
        keep_alive: Duration::from_secs(broker.keep_alive_secs),
        connect_timeout: Duration::from_millis(broker.connect_timeout_ms),
        retain: broker.retain,
    }
}

async fn check(source: &Arc<dyn SensorSource>, config: &BridgeConfig) -> Result<()> {
    let selected = discover_selected(source, config)
        .await
        .context("discovering devices")?;
    if selected.is_empty() {
        println!("no devices selected");
        if config.require_devices {
            anyhow::bail!("no usable devices found");
        }
        return Ok(());
    }
    let encoder = Encoder::new(&config.publish);
    for (dev, acquisition) in selected {
        let mode = match acquisition {
            Acquisition::Polled { interval } => format!("polled every {}ms", interval.as_millis()),
            Acquisition::Triggered { spec, .. } => format!(
                "triggered ({})",
                spec.trigger.as_deref().unwrap_or("current trigger")
            ),
        };
        println!("{} [{}] {}: {}", dev.id, dev.sysfs_name, dev.model(), mode);
        for topic in encoder.topics(&dev) {
            println!("  {topic}");
        }
        let units: Vec<String> = dev
            .channels
            .iter()
            .map(|c| format!("{}={}", c.id, unit_for(c.kind)))
            .collect();
        println!("  units: {}", units.join(", "));
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("cannot install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
