//! Ordered, bounded publishing over a reconnecting bus client.
//!
//! All producers share one FIFO send queue; a single worker task owns the [`BusClient`]
//! and is the only writer to the connection. Messages are removed from the queue only
//! after the transport accepted them, so a failed send is retried first after reconnect
//! and per-producer order survives link loss.

use crate::types::Backoff;
use crate::{
    BusClient, ConnectionState, OverflowPolicy, PublishError, PublishMessage, PublisherConfig,
    Result, ShutdownReport,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Counters kept by the publisher. Cheap to read from any task.
#[derive(Debug, Default)]
pub struct PublisherStats {
    pub enqueued: AtomicU64,
    pub published: AtomicU64,
    pub dropped: AtomicU64,
    pub rejected: AtomicU64,
    pub discarded: AtomicU64,
    pub reconnects: AtomicU64,
}

impl PublisherStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StatsSnapshot {
    pub enqueued: u64,
    pub published: u64,
    pub dropped: u64,
    pub rejected: u64,
    pub discarded: u64,
    pub reconnects: u64,
}

struct Shared {
    queue: Mutex<VecDeque<PublishMessage>>,
    capacity: usize,
    item_ready: Notify,
    space_ready: Notify,
    closed: AtomicBool,
    stats: PublisherStats,
}

/// Handle to the publishing worker. Clones share the same queue and connection.
#[derive(Clone)]
pub struct Publisher {
    shared: Arc<Shared>,
    overflow: OverflowPolicy,
    state: watch::Receiver<ConnectionState>,
    shutdown: Arc<watch::Sender<Option<Instant>>>,
    worker: Arc<Mutex<Option<JoinHandle<ShutdownReport>>>>,
}

impl Publisher {
    /// Connect (retrying per `connect_retries`) and spawn the worker.
    ///
    /// Failing every attempt yields [`PublishError::Unreachable`], which callers treat as fatal.
    pub async fn start(mut client: Box<dyn BusClient>, config: PublisherConfig) -> Result<Self> {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let mut backoff = Backoff::new(config.backoff);
        let attempts = config.connect_retries.saturating_add(1);
        let mut last = String::new();
        let mut connected = false;
        for attempt in 1..=attempts {
            state_tx.send_replace(ConnectionState::Connecting);
            match client.connect().await {
                Ok(()) => {
                    connected = true;
                    break;
                }
                Err(e) => {
                    warn!(attempt, attempts, "broker connect failed: {e}");
                    last = e.to_string();
                    state_tx.send_replace(ConnectionState::Disconnected);
                    if attempt < attempts {
                        state_tx.send_replace(ConnectionState::Reconnecting);
                        tokio::time::sleep(backoff.next_delay()).await;
                    }
                }
            }
        }
        if !connected {
            return Err(PublishError::Unreachable { attempts, last });
        }
        state_tx.send_replace(ConnectionState::Connected);
        backoff.reset();

        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(config.queue_capacity)),
            capacity: config.queue_capacity.max(1),
            item_ready: Notify::new(),
            space_ready: Notify::new(),
            closed: AtomicBool::new(false),
            stats: PublisherStats::default(),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(None);
        let worker = Worker {
            shared: shared.clone(),
            client,
            config: config.clone(),
            backoff,
            state: state_tx,
        };
        let handle = tokio::spawn(worker.run(shutdown_rx));

        Ok(Self {
            shared,
            overflow: config.overflow,
            state: state_rx,
            shutdown: Arc::new(shutdown_tx),
            worker: Arc::new(Mutex::new(Some(handle))),
        })
    }

    /// Enqueue a message. Order of successful calls is the order of delivery.
    pub async fn publish(&self, message: PublishMessage) -> Result<()> {
        let deadline = match self.overflow {
            OverflowPolicy::Wait { timeout } => Some(Instant::now() + timeout),
            _ => None,
        };
        let shared = &self.shared;
        loop {
            if shared.closed.load(Ordering::SeqCst) {
                return Err(PublishError::Closed);
            }
            {
                let mut queue = shared.queue.lock().await;
                if queue.len() < shared.capacity {
                    queue.push_back(message);
                    drop(queue);
                    shared.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                    shared.item_ready.notify_one();
                    return Ok(());
                }
                match self.overflow {
                    OverflowPolicy::DropOldest => {
                        if let Some(old) = queue.pop_front() {
                            debug!(topic = %old.topic, "send queue full, dropping oldest message");
                        }
                        queue.push_back(message);
                        drop(queue);
                        shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
                        shared.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                        shared.item_ready.notify_one();
                        return Ok(());
                    }
                    OverflowPolicy::RejectNew => {
                        shared.stats.rejected.fetch_add(1, Ordering::Relaxed);
                        return Err(PublishError::QueueFull);
                    }
                    OverflowPolicy::Wait { .. } => {}
                }
            }
            let Some(deadline) = deadline else {
                return Err(PublishError::QueueFull);
            };
            if tokio::time::timeout_at(deadline, shared.space_ready.notified())
                .await
                .is_err()
            {
                shared.stats.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(PublishError::QueueFull);
            }
        }
    }

    /// Remove every queued message of a device. Returns how many were removed.
    pub async fn discard_device(&self, device_id: &str) -> usize {
        let mut queue = self.shared.queue.lock().await;
        let before = queue.len();
        queue.retain(|m| m.device_id != device_id);
        let removed = before - queue.len();
        drop(queue);
        if removed > 0 {
            self.shared
                .stats
                .discarded
                .fetch_add(removed as u64, Ordering::Relaxed);
            self.shared.space_ready.notify_one();
        }
        removed
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub async fn queued(&self) -> usize {
        self.shared.queue.lock().await.len()
    }

    /// Stop accepting messages, flush for at most `grace`, discard the rest and disconnect.
    pub async fn shutdown(&self, grace: Duration) -> Result<ShutdownReport> {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shutdown.send_replace(Some(Instant::now() + grace));
        self.shared.space_ready.notify_waiters();

        let handle = self.worker.lock().await.take();
        let Some(handle) = handle else {
            return Err(PublishError::Closed);
        };
        let abort = handle.abort_handle();
        match tokio::time::timeout(grace + Duration::from_secs(1), handle).await {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(e)) => Err(PublishError::Transport(format!("publisher worker failed: {e}"))),
            Err(_) => {
                abort.abort();
                Err(PublishError::Timeout)
            }
        }
    }
}

struct Worker {
    shared: Arc<Shared>,
    client: Box<dyn BusClient>,
    config: PublisherConfig,
    backoff: Backoff,
    state: watch::Sender<ConnectionState>,
}

impl Worker {
    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(from = %prev, to = %next, "connection state");
        }
    }

    fn connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected && self.client.is_connected()
    }

    async fn run(mut self, mut shutdown: watch::Receiver<Option<Instant>>) -> ShutdownReport {
        loop {
            let requested = *shutdown.borrow_and_update();
            if let Some(deadline) = requested {
                return self.finish(deadline).await;
            }

            if !self.connected() {
                if *self.state.borrow() == ConnectionState::Connected {
                    warn!("broker link lost");
                    self.set_state(ConnectionState::Disconnected);
                }
                let stop = tokio::select! {
                    _ = self.reconnect() => false,
                    changed = shutdown.changed() => changed.is_err(),
                };
                if stop {
                    return self.finish(Instant::now()).await;
                }
                continue;
            }

            let next = tokio::select! {
                msg = next_message(&self.shared) => Some(msg),
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return self.finish(Instant::now()).await;
                    }
                    None
                }
            };
            if let Some(msg) = next {
                self.send(msg).await;
            }
        }
    }

    async fn reconnect(&mut self) {
        self.set_state(ConnectionState::Reconnecting);
        let delay = self.backoff.next_delay();
        debug!(?delay, "waiting before reconnect");
        tokio::time::sleep(delay).await;
        self.set_state(ConnectionState::Connecting);
        match self.client.connect().await {
            Ok(()) => {
                self.backoff.reset();
                self.shared.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                self.set_state(ConnectionState::Connected);
                info!("reconnected to broker");
            }
            Err(e) => {
                debug!("reconnect failed: {e}");
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }

    async fn send(&mut self, msg: PublishMessage) {
        match self.client.publish(&msg, self.config.qos).await {
            Ok(()) => {
                self.shared.stats.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(topic = %msg.topic, "publish failed, requeueing: {e}");
                self.shared.queue.lock().await.push_front(msg);
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }

    /// Drain until the queue is empty or the deadline passes, then disconnect.
    async fn finish(mut self, deadline: Instant) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        loop {
            if Instant::now() >= deadline {
                break;
            }
            if !self.connected() {
                self.set_state(ConnectionState::Connecting);
                match tokio::time::timeout_at(deadline, self.client.connect()).await {
                    Ok(Ok(())) => self.set_state(ConnectionState::Connected),
                    _ => {
                        self.set_state(ConnectionState::Disconnected);
                        break;
                    }
                }
            }
            let Some(msg) = self.shared.queue.lock().await.pop_front() else {
                break;
            };
            match tokio::time::timeout_at(deadline, self.client.publish(&msg, self.config.qos)).await
            {
                Ok(Ok(())) => {
                    report.flushed += 1;
                    self.shared.stats.published.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    debug!("publish during shutdown failed: {e}");
                    self.shared.queue.lock().await.push_front(msg);
                    self.set_state(ConnectionState::Disconnected);
                }
                Err(_) => {
                    self.shared.queue.lock().await.push_front(msg);
                    break;
                }
            }
        }

        let remaining = {
            let mut queue = self.shared.queue.lock().await;
            let n = queue.len() as u64;
            queue.clear();
            n
        };
        report.discarded = remaining;
        self.shared
            .stats
            .discarded
            .fetch_add(remaining, Ordering::Relaxed);
        if remaining > 0 {
            warn!(discarded = remaining, "discarding unsent messages at shutdown");
        }

        match tokio::time::timeout(Duration::from_secs(1), self.client.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("disconnect failed: {e}"),
            Err(_) => debug!("disconnect timed out"),
        }
        self.set_state(ConnectionState::Disconnected);
        info!(
            flushed = report.flushed,
            discarded = report.discarded,
            "publisher stopped"
        );
        report
    }
}

async fn next_message(shared: &Shared) -> PublishMessage {
    loop {
        if let Some(msg) = shared.queue.lock().await.pop_front() {
            shared.space_ready.notify_one();
            return msg;
        }
        shared.item_ready.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BackoffConfig, MockBroker, Qos};

    fn fast_config() -> PublisherConfig {
        PublisherConfig {
            queue_capacity: 16,
            overflow: OverflowPolicy::DropOldest,
            qos: Qos::AtMostOnce,
            connect_retries: 2,
            backoff: BackoffConfig {
                initial: Duration::from_millis(5),
                max: Duration::from_millis(20),
            },
        }
    }

    fn msg(device: &str, n: u32) -> PublishMessage {
        PublishMessage::new(device, format!("iio/{device}/temp"), n.to_string().into_bytes())
    }

    fn payloads(broker: &MockBroker) -> Vec<String> {
        broker
            .delivered()
            .iter()
            .map(|d| d.payload_str().to_string())
            .collect()
    }

    async fn wait_until(mut pred: impl FnMut() -> bool) {
        for _ in 0..400 {
            if pred() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    /// Cut the link and wait until the worker has noticed it.
    async fn go_offline(publisher: &Publisher, broker: &MockBroker) {
        broker.set_reachable(false);
        broker.drop_link();
        publisher.publish(msg("early", 0)).await.unwrap();
        let mut states = publisher.state_changes();
        states
            .wait_for(|s| *s != ConnectionState::Connected)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delivers_in_submission_order() {
        let broker = MockBroker::new();
        let publisher = Publisher::start(Box::new(broker.client()), fast_config())
            .await
            .unwrap();
        assert_eq!(publisher.state(), ConnectionState::Connected);
        for n in 0..5 {
            publisher.publish(msg("a", n)).await.unwrap();
        }
        wait_until(|| broker.delivered().len() == 5).await;
        assert_eq!(payloads(&broker), vec!["0", "1", "2", "3", "4"]);
    }

    #[tokio::test]
    async fn unreachable_broker_is_fatal_after_retries() {
        let broker = MockBroker::new();
        broker.set_reachable(false);
        let err = Publisher::start(Box::new(broker.client()), fast_config())
            .await
            .err()
            .unwrap();
        match err {
            PublishError::Unreachable { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(broker.connect_count(), 3);
    }

    #[tokio::test]
    async fn transient_refusals_are_retried_at_startup() {
        let broker = MockBroker::new();
        broker.refuse_connects(2);
        let publisher = Publisher::start(Box::new(broker.client()), fast_config()).await;
        assert!(publisher.is_ok());
        assert_eq!(broker.connect_count(), 3);
    }

    #[tokio::test]
    async fn queued_messages_flush_in_order_after_reconnect() {
        let broker = MockBroker::new();
        let publisher = Publisher::start(Box::new(broker.client()), fast_config())
            .await
            .unwrap();
        publisher.publish(msg("a", 1)).await.unwrap();
        wait_until(|| broker.delivered().len() == 1).await;

        go_offline(&publisher, &broker).await;
        for n in 2..6 {
            publisher.publish(msg("a", n)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(broker.delivered().len(), 1);

        broker.set_reachable(true);
        wait_until(|| broker.delivered().len() == 6).await;
        assert_eq!(payloads(&broker), vec!["1", "0", "2", "3", "4", "5"]);
        assert_eq!(publisher.state(), ConnectionState::Connected);
        assert!(publisher.stats().reconnects >= 1);
    }

    #[tokio::test]
    async fn drop_oldest_keeps_newest_messages() {
        let broker = MockBroker::new();
        let config = PublisherConfig {
            queue_capacity: 2,
            ..fast_config()
        };
        let publisher = Publisher::start(Box::new(broker.client()), config).await.unwrap();
        go_offline(&publisher, &broker).await;

        for n in 1..=3 {
            publisher.publish(msg("a", n)).await.unwrap();
        }
        assert_eq!(publisher.queued().await, 2);
        assert_eq!(publisher.stats().dropped, 2);

        broker.set_reachable(true);
        wait_until(|| broker.delivered().len() == 2).await;
        assert_eq!(payloads(&broker), vec!["2", "3"]);
    }

    #[tokio::test]
    async fn reject_new_fails_when_full() {
        let broker = MockBroker::new();
        let config = PublisherConfig {
            queue_capacity: 2,
            overflow: OverflowPolicy::RejectNew,
            ..fast_config()
        };
        let publisher = Publisher::start(Box::new(broker.client()), config).await.unwrap();
        go_offline(&publisher, &broker).await;

        publisher.publish(msg("a", 1)).await.unwrap();
        assert!(matches!(
            publisher.publish(msg("a", 2)).await,
            Err(PublishError::QueueFull)
        ));
        assert_eq!(publisher.stats().rejected, 1);

        broker.set_reachable(true);
        wait_until(|| broker.delivered().len() == 2).await;
        assert_eq!(payloads(&broker), vec!["0", "1"]);
    }

    #[tokio::test]
    async fn wait_policy_times_out_when_full() {
        let broker = MockBroker::new();
        let config = PublisherConfig {
            queue_capacity: 1,
            overflow: OverflowPolicy::Wait {
                timeout: Duration::from_millis(20),
            },
            ..fast_config()
        };
        let publisher = Publisher::start(Box::new(broker.client()), config).await.unwrap();
        go_offline(&publisher, &broker).await;

        let started = Instant::now();
        assert!(matches!(
            publisher.publish(msg("a", 1)).await,
            Err(PublishError::QueueFull)
        ));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn discard_device_removes_only_that_device() {
        let broker = MockBroker::new();
        let publisher = Publisher::start(Box::new(broker.client()), fast_config())
            .await
            .unwrap();
        go_offline(&publisher, &broker).await;
        publisher.publish(msg("a", 1)).await.unwrap();
        publisher.publish(msg("b", 2)).await.unwrap();
        publisher.publish(msg("a", 3)).await.unwrap();

        assert_eq!(publisher.discard_device("a").await, 2);
        broker.set_reachable(true);
        wait_until(|| broker.delivered().len() == 2).await;
        assert_eq!(broker.topics(), vec!["iio/early/temp", "iio/b/temp"]);
    }

    #[tokio::test]
    async fn shutdown_flushes_queue() {
        let broker = MockBroker::new();
        let publisher = Publisher::start(Box::new(broker.client()), fast_config())
            .await
            .unwrap();
        for n in 0..3 {
            publisher.publish(msg("a", n)).await.unwrap();
        }
        let report = publisher.shutdown(Duration::from_millis(500)).await.unwrap();
        assert_eq!(publisher.stats().published, 3);
        assert_eq!(report.discarded, 0);
        assert_eq!(broker.delivered().len(), 3);
        assert_eq!(publisher.state(), ConnectionState::Disconnected);
        assert!(matches!(
            publisher.publish(msg("a", 9)).await,
            Err(PublishError::Closed)
        ));
    }

    #[tokio::test]
    async fn shutdown_discards_when_offline() {
        let broker = MockBroker::new();
        let publisher = Publisher::start(Box::new(broker.client()), fast_config())
            .await
            .unwrap();
        go_offline(&publisher, &broker).await;
        publisher.publish(msg("a", 1)).await.unwrap();

        let report = publisher.shutdown(Duration::from_millis(50)).await.unwrap();
        assert_eq!(report.flushed, 0);
        assert_eq!(report.discarded, 2);
        assert!(broker.delivered().is_empty());
    }
}
