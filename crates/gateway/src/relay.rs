//! Streaming relay: per-session hand-off channels between one background
//! producer and one long-poll consumer.
//!
//! Lifecycle of a channel:
//! 1. `RelayRegistry::open` creates it when a request is submitted.
//! 2. The producer pushes `stream` events (deltas of its cumulative text)
//!    and exactly one terminal `complete` or `error` event.
//! 3. `RelayRegistry::drain` attaches the consumer; after the terminal event
//!    is yielded the channel is removed.
//!
//! Channels with no attached consumer for too long are removed by
//! `evict_idle`, which also cancels their producer.

use std::{
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use {
    chatrelay_config::RelayConfig,
    dashmap::{DashMap, mapref::entry::Entry},
    serde::{Deserialize, Serialize},
    tokio::{sync::mpsc, time::Instant},
    tokio_stream::Stream,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info},
};

use crate::error::RelayError;

// ── Events ───────────────────────────────────────────────────────────────────

/// One frame on a session's stream. `timestamp` is UNIX seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayEvent {
    /// Text appended since the previous `Stream` event.
    Stream { content: String, timestamp: f64 },
    /// Final answer; terminal.
    Complete { content: String, timestamp: f64 },
    /// Failure; terminal.
    Error { content: String, timestamp: f64 },
    /// Synthesised by `drain` when no event arrived within the idle window.
    Heartbeat { timestamp: f64 },
}

/// Seconds since the UNIX epoch, as carried in event timestamps.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

impl RelayEvent {
    pub fn stream(content: impl Into<String>) -> Self {
        Self::Stream {
            content: content.into(),
            timestamp: unix_now(),
        }
    }

    pub fn complete(content: impl Into<String>) -> Self {
        Self::Complete {
            content: content.into(),
            timestamp: unix_now(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::Error {
            content: content.into(),
            timestamp: unix_now(),
        }
    }

    pub fn heartbeat() -> Self {
        Self::Heartbeat {
            timestamp: unix_now(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Stream { .. } => "stream",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
            Self::Heartbeat { .. } => "heartbeat",
        }
    }

    pub fn content(&self) -> Option<&str> {
        match self {
            Self::Stream { content, .. }
            | Self::Complete { content, .. }
            | Self::Error { content, .. } => Some(content),
            Self::Heartbeat { .. } => None,
        }
    }

    pub fn timestamp(&self) -> f64 {
        match self {
            Self::Stream { timestamp, .. }
            | Self::Complete { timestamp, .. }
            | Self::Error { timestamp, .. }
            | Self::Heartbeat { timestamp } => *timestamp,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }
}

// ── Delta tracking ───────────────────────────────────────────────────────────

/// Remembers the last emitted cumulative text and computes what is new.
#[derive(Debug, Default)]
pub struct DeltaTracker {
    last_emitted: String,
}

impl DeltaTracker {
    /// Returns the suffix `cumulative` adds to the last emitted text, or
    /// `None` when nothing was added. Cumulative text may only grow.
    pub fn advance(&mut self, cumulative: &str) -> Result<Option<String>, RelayError> {
        let Some(delta) = cumulative.strip_prefix(self.last_emitted.as_str()) else {
            return Err(RelayError::Producer(format!(
                "cumulative text no longer extends the {} bytes already sent",
                self.last_emitted.len()
            )));
        };
        if delta.is_empty() {
            return Ok(None);
        }
        let delta = delta.to_string();
        self.last_emitted.clear();
        self.last_emitted.push_str(cumulative);
        Ok(Some(delta))
    }

    pub fn emitted(&self) -> &str {
        &self.last_emitted
    }
}

// ── Producer handle ──────────────────────────────────────────────────────────

/// The producer's end of a session channel.
///
/// Terminal methods consume the sender, so at most one terminal event can be
/// pushed per channel.
pub struct ChannelSender {
    session_id: String,
    tx: mpsc::Sender<RelayEvent>,
    cancel: CancellationToken,
    tracker: DeltaTracker,
    completion_fallback: String,
}

impl ChannelSender {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Token triggered by `RelayRegistry::cancel` or eviction.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Push the new cumulative text; emits one `stream` event carrying the
    /// delta if anything was added. Returns whether an event was pushed.
    pub async fn push_cumulative(&mut self, cumulative: &str) -> Result<bool, RelayError> {
        let Some(delta) = self.tracker.advance(cumulative)? else {
            return Ok(false);
        };
        debug!(session_id = %self.session_id, bytes = delta.len(), "stream fragment");
        let event = RelayEvent::stream(delta);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RelayError::Cancelled),
            sent = self.tx.send(event) => sent
                .map(|_| true)
                .map_err(|_| RelayError::ConsumerGone(self.session_id.clone())),
        }
    }

    /// Finish with the final answer. An empty answer is replaced with the
    /// configured fallback text.
    pub async fn complete(self, answer: &str) -> Result<(), RelayError> {
        let content = if answer.is_empty() {
            self.completion_fallback.clone()
        } else {
            answer.to_string()
        };
        self.send_terminal(RelayEvent::complete(content)).await
    }

    /// Finish with an error.
    pub async fn fail(self, message: impl Into<String>) -> Result<(), RelayError> {
        self.send_terminal(RelayEvent::error(message)).await
    }

    // Not raced against cancellation: a cancelled producer still reports
    // its terminal error. An evicted channel has dropped its receiver, so
    // this cannot block past eviction.
    async fn send_terminal(self, event: RelayEvent) -> Result<(), RelayError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| RelayError::ConsumerGone(self.session_id))
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// Tuning for a `RelayRegistry`.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub heartbeat_interval: Duration,
    pub channel_capacity: usize,
    pub completion_fallback: String,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

impl From<&RelayConfig> for RelayOptions {
    fn from(config: &RelayConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            channel_capacity: config.channel_capacity.max(1),
            completion_fallback: config.completion_fallback.clone(),
        }
    }
}

struct ChannelEntry {
    generation: u64,
    /// `None` while a consumer is attached.
    receiver: Option<mpsc::Receiver<RelayEvent>>,
    cancel: CancellationToken,
    /// When the channel last had no consumer attached; `None` while attached.
    detached_since: Option<Instant>,
}

/// Process-wide map from session id to its open channel.
pub struct RelayRegistry {
    channels: DashMap<String, ChannelEntry>,
    options: RelayOptions,
    next_generation: AtomicU64,
}

/// Boxed stream returned by `RelayRegistry::drain`.
pub type RelayStream = Pin<Box<dyn Stream<Item = RelayEvent> + Send>>;

impl RelayRegistry {
    pub fn new(options: RelayOptions) -> Arc<Self> {
        Arc::new(Self {
            channels: DashMap::new(),
            options,
            next_generation: AtomicU64::new(0),
        })
    }

    pub fn options(&self) -> &RelayOptions {
        &self.options
    }

    /// Open the hand-off channel for a session.
    ///
    /// Fails with `SessionBusy` while an earlier channel for the same id is
    /// still open (its terminal event has not been drained yet).
    pub fn open(&self, session_id: &str) -> Result<ChannelSender, RelayError> {
        match self.channels.entry(session_id.to_string()) {
            Entry::Occupied(_) => Err(RelayError::SessionBusy(session_id.to_string())),
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::channel(self.options.channel_capacity);
                let cancel = CancellationToken::new();
                slot.insert(ChannelEntry {
                    generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
                    receiver: Some(rx),
                    cancel: cancel.clone(),
                    detached_since: Some(Instant::now()),
                });
                debug!(session_id, "opened relay channel");
                Ok(ChannelSender {
                    session_id: session_id.to_string(),
                    tx,
                    cancel,
                    tracker: DeltaTracker::default(),
                    completion_fallback: self.options.completion_fallback.clone(),
                })
            },
        }
    }

    /// Drain a session's events.
    ///
    /// Each advance waits up to the heartbeat interval for the next event
    /// and yields a heartbeat if none arrived. The stream ends after a
    /// terminal event, at which point the channel is removed. Unknown
    /// sessions (and sessions already attached to another consumer) yield a
    /// single `error` event.
    ///
    /// Dropping the stream before the terminal event detaches the consumer
    /// and keeps the channel, so a later `drain` resumes where this one
    /// stopped.
    pub fn drain(self: &Arc<Self>, session_id: &str) -> RelayStream {
        let attached = self.attach(session_id);
        let heartbeat = self.options.heartbeat_interval;

        Box::pin(async_stream::stream! {
            let mut guard = match attached {
                Ok(guard) => guard,
                Err(e) => {
                    debug!(error = %e, "drain rejected");
                    yield RelayEvent::error(e.to_string());
                    return;
                }
            };

            loop {
                match tokio::time::timeout(heartbeat, guard.recv()).await {
                    Ok(Some(event)) => {
                        if event.is_terminal() {
                            guard.finish(event.kind());
                            yield event;
                            return;
                        }
                        yield event;
                    }
                    Ok(None) => {
                        guard.finish("error");
                        yield RelayEvent::error("producer ended without a result");
                        return;
                    }
                    Err(_) => {
                        debug!(session_id = %guard.session_id, "heartbeat");
                        yield RelayEvent::heartbeat();
                    }
                }
            }
        })
    }

    fn attach(self: &Arc<Self>, session_id: &str) -> Result<DrainGuard, RelayError> {
        let mut entry = self
            .channels
            .get_mut(session_id)
            .ok_or_else(|| RelayError::UnknownSession(session_id.to_string()))?;
        let receiver = entry
            .receiver
            .take()
            .ok_or_else(|| RelayError::AlreadyDraining(session_id.to_string()))?;
        entry.detached_since = None;
        Ok(DrainGuard {
            registry: Arc::clone(self),
            session_id: session_id.to_string(),
            generation: entry.generation,
            receiver: Some(receiver),
        })
    }

    /// Cancel the in-flight producer for a session. Returns false if the
    /// session has no open channel.
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.channels.get(session_id) {
            Some(entry) => {
                entry.cancel.cancel();
                info!(session_id, "relay channel cancelled");
                true
            },
            None => false,
        }
    }

    /// Cancel every producer, e.g. at shutdown.
    pub fn cancel_all(&self) {
        for entry in self.channels.iter() {
            entry.cancel.cancel();
        }
    }

    /// Remove channels that have had no consumer attached for at least
    /// `ttl`, cancelling their producers. Returns how many were removed.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut evicted = 0;
        self.channels.retain(|session_id, entry| {
            let idle = entry
                .detached_since
                .is_some_and(|since| now.duration_since(since) >= ttl);
            if idle {
                entry.cancel.cancel();
                info!(session_id = %session_id, "evicted idle relay channel");
                evicted += 1;
            }
            !idle
        });
        evicted
    }

    pub fn is_open(&self, session_id: &str) -> bool {
        self.channels.contains_key(session_id)
    }

    /// Number of open channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// A consumer's hold on a channel's receiver.
struct DrainGuard {
    registry: Arc<RelayRegistry>,
    session_id: String,
    generation: u64,
    receiver: Option<mpsc::Receiver<RelayEvent>>,
}

impl DrainGuard {
    async fn recv(&mut self) -> Option<RelayEvent> {
        match self.receiver.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Drop the receiver and remove the channel (if it is still ours).
    fn finish(&mut self, kind: &str) {
        self.receiver = None;
        let generation = self.generation;
        self.registry
            .channels
            .remove_if(&self.session_id, |_, entry| entry.generation == generation);
        info!(session_id = %self.session_id, kind, "relay stream ended");
    }
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        let Some(receiver) = self.receiver.take() else {
            return;
        };
        if let Some(mut entry) = self.registry.channels.get_mut(&self.session_id)
            && entry.generation == self.generation
        {
            entry.receiver = Some(receiver);
            entry.detached_since = Some(Instant::now());
            debug!(session_id = %self.session_id, "consumer detached");
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, futures::StreamExt};

    fn registry(heartbeat: Duration) -> Arc<RelayRegistry> {
        RelayRegistry::new(RelayOptions {
            heartbeat_interval: heartbeat,
            channel_capacity: 16,
            completion_fallback: "Task processing completed.".into(),
        })
    }

    fn summary(events: &[RelayEvent]) -> Vec<(&'static str, Option<&str>)> {
        events.iter().map(|e| (e.kind(), e.content())).collect()
    }

    #[test]
    fn tracker_reconstructs_cumulative_text() {
        let snapshots = ["", "Hi", "Hi", "Hi there", "Hi there!", "Hi there! 你好"];
        let mut tracker = DeltaTracker::default();
        let mut rebuilt = String::new();
        let mut emitted = 0;
        for snapshot in snapshots {
            if let Some(delta) = tracker.advance(snapshot).unwrap() {
                rebuilt.push_str(&delta);
                emitted += 1;
            }
        }
        assert_eq!(rebuilt, "Hi there! 你好");
        assert_eq!(tracker.emitted(), "Hi there! 你好");
        assert_eq!(emitted, 4);
    }

    #[test]
    fn tracker_rejects_rewritten_text() {
        let mut tracker = DeltaTracker::default();
        tracker.advance("Hello").unwrap();
        assert!(matches!(
            tracker.advance("Help"),
            Err(RelayError::Producer(_))
        ));
    }

    #[test]
    fn event_wire_shape() {
        let value = serde_json::to_value(RelayEvent::stream("Hi")).unwrap();
        assert_eq!(value["type"], "stream");
        assert_eq!(value["content"], "Hi");
        assert!(value["timestamp"].as_f64().is_some());

        let value = serde_json::to_value(RelayEvent::heartbeat()).unwrap();
        assert_eq!(value["type"], "heartbeat");
        assert!(value.get("content").is_none());
    }

    #[tokio::test]
    async fn drains_deltas_then_complete_and_removes_channel() {
        let relay = registry(Duration::from_secs(5));
        let mut sender = relay.open("s1").unwrap();
        assert!(sender.push_cumulative("Hi").await.unwrap());
        assert!(sender.push_cumulative("Hi there").await.unwrap());
        assert!(!sender.push_cumulative("Hi there").await.unwrap());
        assert!(sender.push_cumulative("Hi there!").await.unwrap());
        sender.complete("Hi there!").await.unwrap();

        let events: Vec<RelayEvent> = relay.drain("s1").collect().await;
        assert_eq!(summary(&events), vec![
            ("stream", Some("Hi")),
            ("stream", Some(" there")),
            ("stream", Some("!")),
            ("complete", Some("Hi there!")),
        ]);
        assert!(!relay.is_open("s1"));

        let again: Vec<RelayEvent> = relay.drain("s1").collect().await;
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].kind(), "error");
    }

    #[tokio::test]
    async fn unknown_session_yields_single_error() {
        let relay = registry(Duration::from_millis(10));
        let events: Vec<RelayEvent> = relay.drain("nobody").collect().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "error");
        assert!(events[0].content().unwrap().contains("nobody"));
    }

    #[tokio::test]
    async fn error_after_partial_output() {
        let relay = registry(Duration::from_secs(5));
        let mut sender = relay.open("s1").unwrap();
        sender.push_cumulative("Partial").await.unwrap();
        sender.fail("boom").await.unwrap();

        let events: Vec<RelayEvent> = relay.drain("s1").collect().await;
        assert_eq!(summary(&events), vec![
            ("stream", Some("Partial")),
            ("error", Some("boom")),
        ]);
        assert!(relay.is_empty());
    }

    #[tokio::test]
    async fn empty_answer_uses_fallback() {
        let relay = registry(Duration::from_secs(5));
        relay.open("s1").unwrap().complete("").await.unwrap();

        let events: Vec<RelayEvent> = relay.drain("s1").collect().await;
        assert_eq!(summary(&events), vec![(
            "complete",
            Some("Task processing completed.")
        )]);
    }

    #[tokio::test]
    async fn heartbeat_then_late_event() {
        let relay = registry(Duration::from_millis(30));
        let mut sender = relay.open("s1").unwrap();
        let producer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            sender.push_cumulative("late").await.unwrap();
            sender.complete("late").await.unwrap();
        });

        let events: Vec<RelayEvent> = relay.drain("s1").collect().await;
        producer.await.unwrap();

        assert_eq!(events[0].kind(), "heartbeat");
        let real: Vec<_> = summary(&events)
            .into_iter()
            .filter(|(kind, _)| *kind != "heartbeat")
            .collect();
        assert_eq!(real, vec![
            ("stream", Some("late")),
            ("complete", Some("late"))
        ]);
    }

    #[tokio::test]
    async fn second_open_is_rejected_until_drained() {
        let relay = registry(Duration::from_secs(5));
        let sender = relay.open("s1").unwrap();
        assert!(matches!(relay.open("s1"), Err(RelayError::SessionBusy(_))));

        sender.complete("done").await.unwrap();
        let _: Vec<RelayEvent> = relay.drain("s1").collect().await;
        assert!(relay.open("s1").is_ok());
    }

    #[tokio::test]
    async fn dropped_sender_ends_with_error() {
        let relay = registry(Duration::from_secs(5));
        let mut sender = relay.open("s1").unwrap();
        sender.push_cumulative("half").await.unwrap();
        drop(sender);

        let events: Vec<RelayEvent> = relay.drain("s1").collect().await;
        assert_eq!(summary(&events)[0], ("stream", Some("half")));
        assert_eq!(events[1].kind(), "error");
        assert!(!relay.is_open("s1"));
    }

    #[tokio::test]
    async fn reattach_resumes_after_consumer_drops() {
        let relay = registry(Duration::from_secs(5));
        let mut sender = relay.open("s1").unwrap();
        sender.push_cumulative("one").await.unwrap();
        sender.push_cumulative("one two").await.unwrap();

        {
            let mut stream = relay.drain("s1");
            let first = stream.next().await.unwrap();
            assert_eq!(first.content(), Some("one"));
        }
        assert!(relay.is_open("s1"));

        sender.complete("one two").await.unwrap();
        let rest: Vec<RelayEvent> = relay.drain("s1").collect().await;
        assert_eq!(summary(&rest), vec![
            ("stream", Some(" two")),
            ("complete", Some("one two")),
        ]);
    }

    #[tokio::test]
    async fn concurrent_drain_is_rejected() {
        let relay = registry(Duration::from_secs(5));
        let mut sender = relay.open("s1").unwrap();
        sender.push_cumulative("x").await.unwrap();

        let mut first = relay.drain("s1");
        assert_eq!(first.next().await.unwrap().kind(), "stream");

        let second: Vec<RelayEvent> = relay.drain("s1").collect().await;
        assert_eq!(second.len(), 1);
        assert!(second[0].content().unwrap().contains("already being drained"));

        sender.complete("x").await.unwrap();
        assert_eq!(first.next().await.unwrap().kind(), "complete");
        assert!(first.next().await.is_none());
    }

    #[tokio::test]
    async fn cancel_stops_stream_pushes() {
        let relay = registry(Duration::from_secs(5));
        let mut sender = relay.open("s1").unwrap();
        assert!(relay.cancel("s1"));
        assert!(!relay.cancel("other"));
        assert!(sender.is_cancelled());
        assert!(matches!(
            sender.push_cumulative("more").await,
            Err(RelayError::Cancelled)
        ));

        sender.fail("request cancelled").await.unwrap();
        let events: Vec<RelayEvent> = relay.drain("s1").collect().await;
        assert_eq!(summary(&events), vec![("error", Some("request cancelled"))]);
    }

    #[tokio::test]
    async fn evicts_only_detached_idle_channels() {
        let relay = registry(Duration::from_secs(5));
        let idle = relay.open("idle").unwrap();
        let mut busy = relay.open("busy").unwrap();
        busy.push_cumulative("x").await.unwrap();

        let mut consumer = relay.drain("busy");
        assert_eq!(consumer.next().await.unwrap().kind(), "stream");

        assert_eq!(relay.evict_idle(Duration::ZERO), 1);
        assert!(!relay.is_open("idle"));
        assert!(relay.is_open("busy"));
        assert!(idle.is_cancelled());
        assert!(matches!(
            idle.fail("late").await,
            Err(RelayError::ConsumerGone(_))
        ));

        assert_eq!(relay.evict_idle(Duration::from_secs(60)), 0);
    }
}
