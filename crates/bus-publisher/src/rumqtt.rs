use crate::{BusClient, PublishError, PublishMessage, Qos, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Broker endpoint and session options.
#[derive(Clone, Debug)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub retain: bool,
}

/// MQTT transport backed by `rumqttc`. A background task drives the event loop and
/// flips the link flag when the session drops.
pub struct RumqttClient {
    settings: MqttSettings,
    client: Option<AsyncClient>,
    link: Arc<AtomicBool>,
    driver: Option<JoinHandle<()>>,
}

impl RumqttClient {
    pub fn new(settings: MqttSettings) -> Self {
        Self {
            settings,
            client: None,
            link: Arc::new(AtomicBool::new(false)),
            driver: None,
        }
    }

    fn options(&self) -> MqttOptions {
        let s = &self.settings;
        let mut opts = MqttOptions::new(s.client_id.clone(), s.host.clone(), s.port);
        opts.set_keep_alive(s.keep_alive);
        opts.set_clean_session(true);
        if let Some(user) = &s.username {
            opts.set_credentials(user.clone(), s.password.clone().unwrap_or_default());
        }
        opts
    }

    fn teardown(&mut self) {
        self.link.store(false, Ordering::SeqCst);
        self.client = None;
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

fn to_qos(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
    }
}

#[async_trait]
impl BusClient for RumqttClient {
    async fn connect(&mut self) -> Result<()> {
        self.teardown();
        let (client, mut eventloop) = AsyncClient::new(self.options(), 64);
        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        return if ack.code == ConnectReturnCode::Success {
                            Ok(())
                        } else {
                            Err(PublishError::Transport(format!("connack: {:?}", ack.code)))
                        };
                    }
                    Ok(_) => continue,
                    Err(e) => return Err(PublishError::Transport(e.to_string())),
                }
            }
        };
        tokio::time::timeout(self.settings.connect_timeout, handshake)
            .await
            .map_err(|_| PublishError::Timeout)??;

        info!(
            host = %self.settings.host,
            port = self.settings.port,
            client_id = %self.settings.client_id,
            "connected to broker"
        );
        self.link.store(true, Ordering::SeqCst);
        let link = self.link.clone();
        self.driver = Some(tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(event) => debug!(?event, "mqtt event"),
                    Err(e) => {
                        warn!("mqtt connection lost: {e}");
                        link.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            }
        }));
        self.client = Some(client);
        Ok(())
    }

    async fn publish(&mut self, message: &PublishMessage, qos: Qos) -> Result<()> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }
        let client = self.client.as_ref().ok_or(PublishError::NotConnected)?;
        client
            .publish(
                message.topic.clone(),
                to_qos(qos),
                self.settings.retain,
                message.payload.clone(),
            )
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.disconnect().await {
                debug!("disconnect request failed: {e}");
            }
        }
        if let Some(driver) = self.driver.take() {
            // Give the event loop a moment to flush the DISCONNECT packet.
            let abort = driver.abort_handle();
            if tokio::time::timeout(Duration::from_millis(500), driver).await.is_err() {
                abort.abort();
            }
        }
        self.link.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client.is_some() && self.link.load(Ordering::SeqCst)
    }
}

impl Drop for RumqttClient {
    fn drop(&mut self) {
        self.teardown();
    }
}
