//! Per-key adaptive batch queues
//!
//! Events for a key are buffered and flushed together after the key's batch
//! window. Each key owns one [`BatchEntry`] holding its buffered events, its
//! current window, and at most one pending flush task.
//!
//! The window adapts to load. Crossing the high watermark widens it by 1.5x
//! (fewer, larger batches). Arming a timer while the queue is below the low
//! watermark narrows it by 0.9x. Both are clamped to the configured bounds.

use chrono::Utc;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::trace;

use statecast_core::config::RelayConfig;
use statecast_core::models::Event;

use crate::frames::BatchFrame;
use crate::metrics;

/// Receives flushed batches
pub trait BatchSink: Send + Sync {
    fn deliver(&self, frame: BatchFrame);
}

#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub base_window: Duration,
    pub min_window: Duration,
    pub max_window: Duration,
    pub high_watermark: usize,
    pub low_watermark: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

impl From<&RelayConfig> for BatchConfig {
    fn from(config: &RelayConfig) -> Self {
        Self {
            base_window: Duration::from_millis(config.base_batch_window_ms),
            min_window: Duration::from_millis(config.min_batch_window_ms),
            max_window: Duration::from_millis(config.max_batch_window_ms),
            high_watermark: config.high_watermark,
            low_watermark: config.low_watermark,
        }
    }
}

struct BatchEntry {
    events: Vec<Event>,
    window: Duration,
    timer: Option<JoinHandle<()>>,
}

impl BatchEntry {
    const fn new(window: Duration) -> Self {
        Self {
            events: Vec::new(),
            window,
            timer: None,
        }
    }
}

pub struct BatchQueue {
    entries: Mutex<HashMap<String, BatchEntry>>,
    config: BatchConfig,
    sink: Arc<dyn BatchSink>,
}

impl BatchQueue {
    #[must_use]
    pub fn new(config: BatchConfig, sink: Arc<dyn BatchSink>) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            config,
            sink,
        })
    }

    /// Buffer an event, arming the key's flush timer if none is pending
    pub fn enqueue(self: &Arc<Self>, event: Event) {
        let key = event.key.clone();
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| BatchEntry::new(self.config.base_window));

        entry.events.push(event);
        metrics::EVENTS_ENQUEUED.inc();

        let queued = entry.events.len();
        if queued > self.config.high_watermark {
            entry.window = entry.window.mul_f64(1.5).min(self.config.max_window);
        }

        if entry.timer.is_some() {
            return;
        }

        if queued < self.config.low_watermark {
            entry.window = entry.window.mul_f64(0.9).max(self.config.min_window);
        }

        let window = entry.window;
        let queue = Arc::clone(self);
        let flush_key = key.clone();
        entry.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            queue.flush(&flush_key);
        }));

        trace!(key = %key, window_ms = window.as_millis() as u64, "Batch timer armed");
    }

    /// Drain the key's buffer and hand it to the sink.
    ///
    /// Events are stably sorted by descending priority, so equal priorities
    /// keep arrival order.
    pub fn flush(&self, key: &str) {
        let mut events = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(key) else {
                return;
            };
            // No-op when running inside the timer task itself
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            std::mem::take(&mut entry.events)
        };

        if events.is_empty() {
            return;
        }

        events.sort_by_key(|event| Reverse(event.effective_priority()));
        metrics::BATCHES_FLUSHED.inc();
        trace!(key, events = events.len(), "Flushing batch");

        self.sink.deliver(BatchFrame {
            key: key.to_string(),
            events,
            ts: Utc::now(),
        });
    }

    /// Forget keys that have nothing buffered and no timer pending
    pub fn compact(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.events.is_empty() || entry.timer.is_some());
        before - entries.len()
    }

    #[must_use]
    pub fn window(&self, key: &str) -> Option<Duration> {
        self.entries.lock().get(key).map(|entry| entry.window)
    }

    #[must_use]
    pub fn pending(&self, key: &str) -> usize {
        self.entries.lock().get(key).map_or(0, |entry| entry.events.len())
    }

    #[must_use]
    pub fn has_timer(&self, key: &str) -> bool {
        self.entries
            .lock()
            .get(key)
            .is_some_and(|entry| entry.timer.is_some())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every pending flush and discard buffered events
    pub fn shutdown(&self) {
        let mut entries = self.entries.lock();
        for entry in entries.values_mut() {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
        }
        entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<BatchFrame>>,
    }

    impl RecordingSink {
        fn frames(&self) -> Vec<BatchFrame> {
            self.frames.lock().clone()
        }
    }

    impl BatchSink for RecordingSink {
        fn deliver(&self, frame: BatchFrame) {
            self.frames.lock().push(frame);
        }
    }

    fn queue() -> (Arc<BatchQueue>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let queue = BatchQueue::new(BatchConfig::default(), sink.clone());
        (queue, sink)
    }

    fn event(key: &str, n: u32, priority: Option<i32>) -> Event {
        let event = Event::new(key, "state", json!({ "n": n }));
        match priority {
            Some(p) => event.with_priority(p),
            None => event,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_orders_by_priority_and_keeps_arrival_order() {
        let (queue, sink) = queue();

        queue.enqueue(event("k", 0, None));
        queue.enqueue(event("k", 1, Some(5)));
        queue.enqueue(event("k", 2, Some(0)));
        queue.enqueue(event("k", 3, Some(5)));

        tokio::time::sleep(Duration::from_millis(100)).await;

        let frames = sink.frames();
        assert_eq!(frames.len(), 1);
        let order: Vec<_> = frames[0]
            .events
            .iter()
            .map(|e| e.payload["n"].as_u64().unwrap())
            .collect();
        assert_eq!(order, vec![1, 3, 0, 2]);
        assert_eq!(frames[0].key, "k");
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_timer_per_key() {
        let (queue, sink) = queue();

        for n in 0..5 {
            queue.enqueue(event("k", n, None));
            assert!(queue.has_timer("k"));
        }
        assert_eq!(queue.pending("k"), 5);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.frames().len(), 1);
        assert_eq!(sink.frames()[0].events.len(), 5);
        assert!(!queue.has_timer("k"));
        assert_eq!(queue.pending("k"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_widens_window_within_bounds() {
        let (queue, _sink) = queue();
        let config = BatchConfig::default();

        for n in 0..201 {
            queue.enqueue(event("hot", n, None));
        }

        let window = queue.window("hot").unwrap();
        assert!(window > config.base_window);
        assert!(window <= config.max_window);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_load_caps_at_max_window() {
        let (queue, _sink) = queue();
        let config = BatchConfig::default();

        for n in 0..2_000 {
            queue.enqueue(event("hot", n, None));
        }
        assert_eq!(queue.window("hot").unwrap(), config.max_window);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_key_narrows_to_min_window() {
        let (queue, sink) = queue();
        let config = BatchConfig::default();

        for n in 0..40 {
            queue.enqueue(event("quiet", n, None));
            tokio::time::sleep(Duration::from_millis(60)).await;
        }

        assert_eq!(queue.window("quiet").unwrap(), config.min_window);
        assert_eq!(sink.frames().len(), 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_flush_independently() {
        let (queue, sink) = queue();
        queue.enqueue(event("a", 0, None));
        queue.enqueue(event("b", 0, None));
        queue.enqueue(event("a", 1, None));

        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut frames = sink.frames();
        frames.sort_by(|x, y| x.key.cmp(&y.key));
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].events.len(), 2);
        assert_eq!(frames[1].events.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_flush_cancels_timer() {
        let (queue, sink) = queue();
        queue.enqueue(event("k", 0, None));
        queue.flush("k");
        assert!(!queue.has_timer("k"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.frames().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_compact_and_shutdown() {
        let (queue, sink) = queue();
        queue.enqueue(event("idle", 0, None));
        queue.flush("idle");
        queue.enqueue(event("busy", 0, None));

        assert_eq!(queue.compact(), 1);
        assert_eq!(queue.len(), 1);

        queue.shutdown();
        assert!(queue.is_empty());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.frames().len(), 1);
    }
}
