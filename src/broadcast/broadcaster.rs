use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::{counter, gauge};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use super::backlog::Backlog;
use super::event::{BroadcastEvent, ClientMessage, EventKind, ServerMessage, WelcomeData};
use super::registry::{ClientSink, ConnectionId, ConnectionRegistry, SendError};
use crate::domain::entities::ContentItem;
use crate::util::lock::mutex_lock;
use crate::util::time::now_millis;

const SOURCE: &str = "broadcast::broadcaster";
const WELCOME_MESSAGE: &str = "Connected to feed updates";

pub(crate) const METRIC_EVENTS: &str = "emberfeed_broadcast_events_total";
pub(crate) const METRIC_DELIVERIES: &str = "emberfeed_broadcast_deliveries_total";
pub(crate) const METRIC_DROPPED: &str = "emberfeed_broadcast_dropped_connections_total";
pub(crate) const METRIC_CONNECTIONS: &str = "emberfeed_ws_connections";
pub(crate) const METRIC_BACKLOG_LEN: &str = "emberfeed_broadcast_backlog_len";
pub(crate) const METRIC_MALFORMED: &str = "emberfeed_ws_malformed_frames_total";

const DEFAULT_BACKLOG_CAPACITY: usize = 100;
const DEFAULT_BACKLOG_TTL_SECS: u64 = 5 * 60;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
const DEFAULT_HEARTBEAT_GRACE_SECS: u64 = 10;
const DEFAULT_OUTBOUND_QUEUE: usize = 64;

#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    pub backlog_capacity: NonZeroUsize,
    pub backlog_ttl: Duration,
    pub heartbeat_interval: Duration,
    /// Extra silence tolerated past one heartbeat interval before a
    /// connection is considered dead.
    pub heartbeat_grace: Duration,
    pub outbound_queue: NonZeroUsize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            backlog_capacity: NonZeroUsize::new(DEFAULT_BACKLOG_CAPACITY)
                .unwrap_or(NonZeroUsize::MIN),
            backlog_ttl: Duration::from_secs(DEFAULT_BACKLOG_TTL_SECS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            heartbeat_grace: Duration::from_secs(DEFAULT_HEARTBEAT_GRACE_SECS),
            outbound_queue: NonZeroUsize::new(DEFAULT_OUTBOUND_QUEUE)
                .unwrap_or(NonZeroUsize::MIN),
        }
    }
}

impl From<&crate::config::BroadcastSettings> for BroadcastConfig {
    fn from(settings: &crate::config::BroadcastSettings) -> Self {
        Self {
            backlog_capacity: settings.backlog_capacity,
            backlog_ttl: settings.backlog_ttl,
            heartbeat_interval: settings.heartbeat_interval,
            heartbeat_grace: settings.heartbeat_grace,
            outbound_queue: settings.outbound_queue,
        }
    }
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("failed to encode `{kind}` frame: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("connection {id} rejected the initial frames: {source}")]
    Handshake {
        id: ConnectionId,
        #[source]
        source: SendError,
    },
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub seq: u64,
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub probed: usize,
    pub reaped: usize,
}

/// Fans content events out to connected clients and replays recent history
/// to clients that connect later.
///
/// The backlog mutex is held across backlog append and fan-out, and across
/// replay and registration on connect. Every client therefore sees events in
/// sequence order, and an event is either part of a client's replay or
/// delivered to it live, never both and never neither.
pub struct Broadcaster {
    config: BroadcastConfig,
    registry: ConnectionRegistry,
    backlog: Mutex<Backlog>,
    seq: AtomicU64,
}

impl Broadcaster {
    pub fn new(config: BroadcastConfig) -> Self {
        let backlog = Backlog::new(config.backlog_capacity, config.backlog_ttl);
        Self {
            config,
            registry: ConnectionRegistry::new(),
            backlog: Mutex::new(backlog),
            seq: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &BroadcastConfig {
        &self.config
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn backlog_len(&self) -> usize {
        mutex_lock(&self.backlog, SOURCE, "backlog_len").len()
    }

    /// Record an event and push it to every connected client.
    #[instrument(skip(self, kind, item), fields(kind = kind.as_str(), item_id = %item.id))]
    pub fn broadcast(
        &self,
        kind: EventKind,
        item: ContentItem,
    ) -> Result<DeliveryReport, BroadcastError> {
        let mut backlog = mutex_lock(&self.backlog, SOURCE, "broadcast");

        let event = BroadcastEvent {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            kind,
            item,
            timestamp: now_millis(),
            recorded_at: Instant::now(),
        };
        let message = event.to_message();
        let frame = encode(&message)?;
        let seq = event.seq;

        let evicted = backlog.push(event, Instant::now());
        gauge!(METRIC_BACKLOG_LEN).set(backlog.len() as f64);

        let (delivered, failed) = self.registry.send_all(&frame);
        drop(backlog);

        let dropped = failed.len();
        for (id, err) in failed {
            self.drop_connection(id, err);
        }

        counter!(METRIC_EVENTS, "kind" => kind.as_str()).increment(1);
        counter!(METRIC_DELIVERIES).increment(delivered as u64);
        debug!(seq, delivered, dropped, evicted, "Broadcast delivered");

        Ok(DeliveryReport {
            seq,
            delivered,
            dropped,
        })
    }

    /// Register a client, greet it and replay recent `created` events.
    pub fn on_connect(&self, sink: Arc<dyn ClientSink>) -> Result<ConnectionId, BroadcastError> {
        let backlog = mutex_lock(&self.backlog, SOURCE, "on_connect");
        let id = ConnectionId::new();

        let timestamp = now_millis();
        let welcome = ServerMessage::Welcome {
            data: WelcomeData {
                message: WELCOME_MESSAGE.to_string(),
                connection_id: id.to_string(),
            },
            timestamp,
        };
        let recent = backlog.replay(Instant::now());
        let replayed = recent.len();

        let mut frames = vec![encode(&welcome)?];
        if !recent.is_empty() {
            frames.push(encode(&ServerMessage::RecentMessages {
                data: recent,
                timestamp,
            })?);
        }

        // Handshake frames are queued before the connection becomes visible to
        // broadcasts and heartbeats, so `welcome` is always the first frame.
        for frame in frames {
            if let Err(source) = sink.try_send(frame) {
                drop(backlog);
                counter!(METRIC_DROPPED, "reason" => source.as_str()).increment(1);
                warn!(
                    connection_id = %id,
                    reason = source.as_str(),
                    "Client rejected the handshake"
                );
                return Err(BroadcastError::Handshake { id, source });
            }
        }

        self.registry.register(id, sink);
        gauge!(METRIC_CONNECTIONS).set(self.registry.len() as f64);
        drop(backlog);

        info!(connection_id = %id, replayed, "Client connected");
        Ok(id)
    }

    pub fn on_disconnect(&self, id: ConnectionId) {
        if self.registry.remove(id) {
            gauge!(METRIC_CONNECTIONS).set(self.registry.len() as f64);
            info!(connection_id = %id, "Client disconnected");
        }
    }

    pub fn mark_alive(&self, id: ConnectionId) -> bool {
        self.registry.touch(id)
    }

    /// Handle a text frame received from a client.
    ///
    /// Any frame counts as liveness. Malformed frames are logged and discarded;
    /// the connection stays open.
    pub fn handle_client_text(&self, id: ConnectionId, text: &str) {
        if !self.registry.touch(id) {
            return;
        }

        match ClientMessage::parse(text) {
            Ok(ClientMessage::Ping { .. }) => {
                let pong = ServerMessage::Pong {
                    timestamp: now_millis(),
                };
                match encode(&pong) {
                    Ok(frame) => {
                        if let Err(err) = self.registry.send(id, frame) {
                            self.drop_connection(id, err);
                        }
                    }
                    Err(err) => warn!(connection_id = %id, error = %err, "Failed to encode pong"),
                }
            }
            Ok(ClientMessage::Pong { .. }) => {
                debug!(connection_id = %id, "Heartbeat answered");
            }
            Err(err) => {
                counter!(METRIC_MALFORMED).increment(1);
                warn!(connection_id = %id, error = %err, "Discarding malformed client frame");
            }
        }
    }

    /// Reap silent connections and probe the rest with a heartbeat.
    pub fn heartbeat_sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        let max_silence = self.config.heartbeat_interval + self.config.heartbeat_grace;
        for id in self.registry.silent_for(max_silence) {
            self.drop_connection(id, SendError::Closed);
            report.reaped += 1;
        }

        let heartbeat = ServerMessage::Heartbeat {
            timestamp: now_millis(),
        };
        let frame = match encode(&heartbeat) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "Failed to encode heartbeat");
                return report;
            }
        };

        let (probed, failed) = self.registry.send_all(&frame);
        report.probed = probed;
        for (id, err) in failed {
            self.drop_connection(id, err);
            report.reaped += 1;
        }

        if report.reaped > 0 {
            info!(
                probed = report.probed,
                reaped = report.reaped,
                "Heartbeat reaped connections"
            );
        }
        report
    }

    /// Run [`Broadcaster::heartbeat_sweep`] every heartbeat interval until the
    /// returned task is aborted.
    pub fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let broadcaster = Arc::clone(self);
        let period = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                broadcaster.heartbeat_sweep();
            }
        })
    }

    fn drop_connection(&self, id: ConnectionId, reason: SendError) {
        if self.registry.remove(id) {
            counter!(METRIC_DROPPED, "reason" => reason.as_str()).increment(1);
            gauge!(METRIC_CONNECTIONS).set(self.registry.len() as f64);
            warn!(connection_id = %id, reason = reason.as_str(), "Dropped client connection");
        }
    }
}

fn encode(message: &ServerMessage) -> Result<Arc<str>, BroadcastError> {
    message
        .encode()
        .map(Arc::from)
        .map_err(|source| BroadcastError::Encode {
            kind: message.kind(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use time::OffsetDateTime;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::*;
    use crate::broadcast::registry::QueueSink;

    /// Sink whose every send fails.
    struct BrokenSink {
        attempts: AtomicUsize,
    }

    impl ClientSink for BrokenSink {
        fn try_send(&self, _frame: Arc<str>) -> Result<(), SendError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(SendError::Closed)
        }
    }

    /// Sink that accepts the handshake and fails afterwards.
    struct FlakySink {
        remaining: AtomicUsize,
        inner: QueueSink,
    }

    impl ClientSink for FlakySink {
        fn try_send(&self, frame: Arc<str>) -> Result<(), SendError> {
            let left = self.remaining.load(Ordering::SeqCst);
            if left == 0 {
                return Err(SendError::Full);
            }
            self.remaining.store(left - 1, Ordering::SeqCst);
            self.inner.try_send(frame)
        }
    }

    fn item(title: &str) -> ContentItem {
        ContentItem {
            id: Uuid::new_v4(),
            title: title.to_string(),
            content: String::new(),
            tags: Vec::new(),
            media_url: None,
            author_id: 1,
            like_count: 0,
            comment_count: 0,
            published: true,
            created_at: OffsetDateTime::UNIX_EPOCH,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn config(capacity: usize) -> BroadcastConfig {
        BroadcastConfig {
            backlog_capacity: NonZeroUsize::new(capacity).expect("non-zero"),
            ..BroadcastConfig::default()
        }
    }

    fn connect(broadcaster: &Broadcaster) -> (ConnectionId, mpsc::Receiver<Arc<str>>) {
        let (sink, rx) = QueueSink::channel(256);
        let id = broadcaster.on_connect(Arc::new(sink)).expect("connect");
        (id, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<str>>) -> Vec<ServerMessage> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(serde_json::from_str(&frame).expect("server frame"));
        }
        frames
    }

    fn titles(items: &[ContentItem]) -> Vec<&str> {
        items.iter().map(|item| item.title.as_str()).collect()
    }

    #[tokio::test]
    async fn late_client_replays_at_most_capacity_created_events_in_order() {
        let broadcaster = Broadcaster::new(config(5));
        for n in 0..10 {
            broadcaster
                .broadcast(EventKind::Created, item(&format!("p{n}")))
                .expect("broadcast");
        }

        let (_id, mut rx) = connect(&broadcaster);
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], ServerMessage::Welcome { .. }));
        let ServerMessage::RecentMessages { data, .. } = &frames[1] else {
            panic!("expected recent_messages, got {:?}", frames[1]);
        };
        assert_eq!(titles(data), vec!["p5", "p6", "p7", "p8", "p9"]);
    }

    #[tokio::test]
    async fn welcome_only_when_backlog_has_no_created_events() {
        let broadcaster = Broadcaster::new(BroadcastConfig::default());
        broadcaster
            .broadcast(EventKind::Updated, item("u"))
            .expect("broadcast");

        let (id, mut rx) = connect(&broadcaster);
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        let ServerMessage::Welcome { data, .. } = &frames[0] else {
            panic!("expected welcome");
        };
        assert_eq!(data.connection_id, id.to_string());
    }

    #[tokio::test]
    async fn failing_connection_is_dropped_without_affecting_others() {
        let broadcaster = Broadcaster::new(BroadcastConfig::default());
        let (_a, mut rx_a) = connect(&broadcaster);
        let (_b, mut rx_b) = connect(&broadcaster);
        let (inner, _rx_flaky) = QueueSink::channel(8);
        let flaky = broadcaster
            .on_connect(Arc::new(FlakySink {
                remaining: AtomicUsize::new(1),
                inner,
            }))
            .expect("handshake fits");
        drain(&mut rx_a);
        drain(&mut rx_b);
        assert_eq!(broadcaster.connection_count(), 3);

        let report = broadcaster
            .broadcast(EventKind::Created, item("x"))
            .expect("broadcast");
        assert_eq!(report.delivered, 2);
        assert_eq!(report.dropped, 1);
        assert_eq!(broadcaster.connection_count(), 2);
        assert!(!broadcaster.mark_alive(flaky));

        broadcaster
            .broadcast(EventKind::Updated, item("y"))
            .expect("broadcast");
        for rx in [&mut rx_a, &mut rx_b] {
            let kinds: Vec<_> = drain(rx).iter().map(ServerMessage::kind).collect();
            assert_eq!(kinds, vec!["created", "updated"]);
        }
    }

    #[tokio::test]
    async fn broken_sink_is_rejected_at_handshake() {
        let broadcaster = Broadcaster::new(BroadcastConfig::default());
        let sink = Arc::new(BrokenSink {
            attempts: AtomicUsize::new(0),
        });
        let result = broadcaster.on_connect(sink.clone());

        assert!(matches!(result, Err(BroadcastError::Handshake { .. })));
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(broadcaster.connection_count(), 0);
    }

    #[tokio::test]
    async fn sequence_numbers_increase_with_broadcast_order() {
        let broadcaster = Broadcaster::new(BroadcastConfig::default());
        let first = broadcaster
            .broadcast(EventKind::Created, item("a"))
            .expect("broadcast");
        let second = broadcaster
            .broadcast(EventKind::Deleted, item("a"))
            .expect("broadcast");
        assert!(second.seq > first.seq);
        assert_eq!(broadcaster.backlog_len(), 2);
    }

    #[tokio::test]
    async fn ping_gets_pong_and_malformed_frames_keep_the_connection() {
        let broadcaster = Broadcaster::new(BroadcastConfig::default());
        let (id, mut rx) = connect(&broadcaster);
        drain(&mut rx);

        broadcaster.handle_client_text(id, "{not json");
        broadcaster.handle_client_text(id, r#"{"type":"ping"}"#);

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], ServerMessage::Pong { .. }));
        assert_eq!(broadcaster.connection_count(), 1);
    }

    #[tokio::test]
    async fn handshake_precedes_any_heartbeat() {
        let broadcaster = Arc::new(Broadcaster::new(BroadcastConfig::default()));
        broadcaster
            .broadcast(EventKind::Created, item("old"))
            .expect("broadcast");

        let sweeper = {
            let broadcaster = Arc::clone(&broadcaster);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    broadcaster.heartbeat_sweep();
                }
            })
        };

        let mut receivers = Vec::new();
        for _ in 0..50 {
            receivers.push(connect(&broadcaster).1);
        }
        sweeper.join().expect("sweeper thread");

        for mut rx in receivers {
            let kinds: Vec<_> = drain(&mut rx).iter().map(ServerMessage::kind).collect();
            assert_eq!(&kinds[..2], &["welcome", "recent_messages"], "{kinds:?}");
            assert!(kinds[2..].iter().all(|kind| *kind == "heartbeat"), "{kinds:?}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn every_created_event_reaches_a_client_exactly_once_in_order() {
        const EVENTS: usize = 300;
        let broadcaster = Arc::new(Broadcaster::new(config(EVENTS)));

        let producer = tokio::spawn({
            let broadcaster = Arc::clone(&broadcaster);
            async move {
                for n in 0..EVENTS {
                    broadcaster
                        .broadcast(EventKind::Created, item(&n.to_string()))
                        .expect("broadcast");
                    tokio::task::yield_now().await;
                }
            }
        });

        let subscriber = tokio::spawn({
            let broadcaster = Arc::clone(&broadcaster);
            async move {
                let mut receivers = Vec::new();
                for _ in 0..60 {
                    let (sink, rx) = QueueSink::channel(EVENTS + 8);
                    broadcaster.on_connect(Arc::new(sink)).expect("connect");
                    receivers.push(rx);
                    tokio::task::yield_now().await;
                }
                receivers
            }
        });

        producer.await.expect("producer");
        let receivers = subscriber.await.expect("subscriber");

        for mut rx in receivers {
            let mut seen = Vec::new();
            for frame in drain(&mut rx) {
                match frame {
                    ServerMessage::RecentMessages { data, .. } => {
                        seen.extend(data.iter().map(|item| item.title.clone()));
                    }
                    ServerMessage::Created { data, .. } => seen.push(data.title),
                    _ => {}
                }
            }
            // The backlog never evicts here, so replay starts from the first event.
            let expected: Vec<String> = (0..EVENTS).map(|n| n.to_string()).collect();
            assert_eq!(seen, expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_reaps_silent_connections_and_probes_live_ones() {
        let broadcaster = Broadcaster::new(BroadcastConfig::default());
        let (silent, _silent_rx) = connect(&broadcaster);
        let (chatty, mut chatty_rx) = connect(&broadcaster);
        drain(&mut chatty_rx);

        tokio::time::advance(Duration::from_secs(30)).await;
        let first = broadcaster.heartbeat_sweep();
        assert_eq!(first, SweepReport { probed: 2, reaped: 0 });

        broadcaster.handle_client_text(chatty, r#"{"type":"pong"}"#);
        tokio::time::advance(Duration::from_secs(30)).await;
        broadcaster.handle_client_text(chatty, r#"{"type":"pong"}"#);
        tokio::time::advance(Duration::from_secs(15)).await;

        let second = broadcaster.heartbeat_sweep();
        assert_eq!(second, SweepReport { probed: 1, reaped: 1 });
        assert!(!broadcaster.mark_alive(silent));
        assert!(broadcaster.mark_alive(chatty));

        let kinds: Vec<_> = drain(&mut chatty_rx)
            .iter()
            .map(ServerMessage::kind)
            .collect();
        assert_eq!(kinds, vec!["heartbeat", "heartbeat"]);
    }
}
