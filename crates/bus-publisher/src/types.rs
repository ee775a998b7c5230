use core::fmt;
use rand::Rng;
use std::time::Duration;

/// A serialized sample (or per-device batch) bound for one topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishMessage {
    pub device_id: String,
    pub topic: String,
    pub payload: Vec<u8>,
}

impl PublishMessage {
    pub fn new(device_id: impl Into<String>, topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            device_id: device_id.into(),
            topic: topic.into(),
            payload,
        }
    }
}

/// Delivery guarantee requested from the transport.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Qos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
}

impl Qos {
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Qos::AtMostOnce),
            1 => Some(Qos::AtLeastOnce),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// What `publish` does when the send queue is at capacity.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OverflowPolicy {
    /// Evict the oldest queued message to make room.
    DropOldest,
    /// Fail the new message with `QueueFull`.
    RejectNew,
    /// Suspend the caller until space frees up, failing with `QueueFull` after `timeout`.
    Wait { timeout: Duration },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PublisherConfig {
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    pub qos: Qos,
    /// Extra attempts after the first failed initial connect.
    pub connect_retries: u32,
    pub backoff: BackoffConfig,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            overflow: OverflowPolicy::DropOldest,
            qos: Qos::AtMostOnce,
            connect_retries: 5,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Capped exponential backoff with +-10% jitter.
#[derive(Clone, Debug)]
pub(crate) struct Backoff {
    cfg: BackoffConfig,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(cfg: BackoffConfig) -> Self {
        Self {
            cfg,
            current: cfg.initial,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.cfg.max);
        let factor: f64 = rand::thread_rng().gen_range(0.9..=1.1);
        base.mul_f64(factor).min(self.cfg.max)
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.cfg.initial;
    }
}

/// Outcome of a bounded-grace shutdown.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ShutdownReport {
    pub flushed: u64,
    pub discarded: u64,
}
