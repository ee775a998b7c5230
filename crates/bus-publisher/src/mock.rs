use crate::{BusClient, PublishError, PublishMessage, Qos, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

/// A message accepted by the mock broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivered {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
}

impl Delivered {
    pub fn payload_str(&self) -> &str {
        std::str::from_utf8(&self.payload).unwrap_or("<binary>")
    }
}

struct MockInner {
    reachable: bool,
    connected: bool,
    refuse_connects: u32,
    connects: u32,
    delivered: Vec<Delivered>,
    log: bool,
}

/// An in-process broker. Each client handed out shares its state, and tests can cut the
/// link or make the broker unreachable at any point.
#[derive(Clone)]
pub struct MockBroker {
    inner: Arc<Mutex<MockInner>>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockInner {
                reachable: true,
                connected: false,
                refuse_connects: 0,
                connects: 0,
                delivered: Vec::new(),
                log: false,
            })),
        }
    }

    /// Log every accepted message at info level instead of only recording it.
    pub fn logging(self) -> Self {
        self.lock().log = true;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockInner> {
        // Poisoning only happens if a test panicked while holding the lock.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn client(&self) -> MockClient {
        MockClient {
            broker: self.clone(),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Sever the current session; the next publish fails.
    pub fn drop_link(&self) {
        self.lock().connected = false;
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_connects(&self, n: u32) {
        self.lock().refuse_connects = n;
    }

    pub fn connect_count(&self) -> u32 {
        self.lock().connects
    }

    pub fn delivered(&self) -> Vec<Delivered> {
        self.lock().delivered.clone()
    }

    pub fn topics(&self) -> Vec<String> {
        self.lock().delivered.iter().map(|d| d.topic.clone()).collect()
    }
}

pub struct MockClient {
    broker: MockBroker,
}

#[async_trait]
impl BusClient for MockClient {
    async fn connect(&mut self) -> Result<()> {
        let mut inner = self.broker.lock();
        inner.connects += 1;
        if !inner.reachable {
            return Err(PublishError::Transport("connection refused".into()));
        }
        if inner.refuse_connects > 0 {
            inner.refuse_connects -= 1;
            return Err(PublishError::Transport("connection refused".into()));
        }
        inner.connected = true;
        Ok(())
    }

    async fn publish(&mut self, message: &PublishMessage, qos: Qos) -> Result<()> {
        let mut inner = self.broker.lock();
        if !inner.connected {
            return Err(PublishError::NotConnected);
        }
        if inner.log {
            info!(
                topic = %message.topic,
                payload = %String::from_utf8_lossy(&message.payload),
                "mock publish"
            );
        }
        inner.delivered.push(Delivered {
            topic: message.topic.clone(),
            payload: message.payload.clone(),
            qos,
        });
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.broker.lock().connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.broker.lock().connected
    }
}
