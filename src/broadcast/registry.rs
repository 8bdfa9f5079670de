//! Connected clients and their outbound queues.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("outbound queue is full")]
    Full,
    #[error("connection is closed")]
    Closed,
}

impl SendError {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Closed => "closed",
        }
    }
}

/// Non-blocking handle for delivering encoded frames to one client.
pub trait ClientSink: Send + Sync {
    fn try_send(&self, frame: Arc<str>) -> Result<(), SendError>;
}

/// Sink backed by a bounded queue drained by the connection's writer task.
#[derive(Debug, Clone)]
pub struct QueueSink {
    tx: mpsc::Sender<Arc<str>>,
}

impl QueueSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl ClientSink for QueueSink {
    fn try_send(&self, frame: Arc<str>) -> Result<(), SendError> {
        self.tx.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }
}

struct Connection {
    sink: Arc<dyn ClientSink>,
    last_seen: Instant,
}

/// The set of open connections. Owned by the broadcaster.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: ConnectionId, sink: Arc<dyn ClientSink>) {
        self.connections.insert(
            id,
            Connection {
                sink,
                last_seen: Instant::now(),
            },
        );
    }

    pub fn remove(&self, id: ConnectionId) -> bool {
        self.connections.remove(&id).is_some()
    }

    /// Record inbound activity. Returns false for unknown connections.
    pub fn touch(&self, id: ConnectionId) -> bool {
        match self.connections.get_mut(&id) {
            Some(mut connection) => {
                connection.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn send(&self, id: ConnectionId, frame: Arc<str>) -> Result<(), SendError> {
        let sink = self
            .connections
            .get(&id)
            .map(|connection| Arc::clone(&connection.sink))
            .ok_or(SendError::Closed)?;
        sink.try_send(frame)
    }

    /// Offer `frame` to every connection, returning the ones that failed.
    ///
    /// Shard locks are released before sinks are called, so failed
    /// connections can be removed by the caller right away.
    pub fn send_all(&self, frame: &Arc<str>) -> (usize, Vec<(ConnectionId, SendError)>) {
        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, sink) in self.sinks() {
            match sink.try_send(Arc::clone(frame)) {
                Ok(()) => delivered += 1,
                Err(err) => failed.push((id, err)),
            }
        }
        (delivered, failed)
    }

    /// Connections that have been silent for longer than `max_silence`.
    pub fn silent_for(&self, max_silence: Duration) -> Vec<ConnectionId> {
        let now = Instant::now();
        self.connections
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.last_seen) > max_silence)
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn sinks(&self) -> Vec<(ConnectionId, Arc<dyn ClientSink>)> {
        self.connections
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(&entry.sink)))
            .collect()
    }
}
