//! Real-time fan-out of content changes to connected clients.
//!
//! Delivery is at-most-once and best effort: a client whose outbound queue is
//! full or closed is dropped rather than waited on. Recently created items are
//! replayed to clients that connect late.

mod backlog;
mod broadcaster;
mod event;
mod registry;

pub use backlog::Backlog;
pub use broadcaster::{BroadcastConfig, BroadcastError, Broadcaster, DeliveryReport, SweepReport};
pub use event::{BroadcastEvent, ClientMessage, EventKind, ServerMessage, WelcomeData};
pub use registry::{ClientSink, ConnectionId, ConnectionRegistry, QueueSink, SendError};

pub(crate) use broadcaster::{
    METRIC_BACKLOG_LEN, METRIC_CONNECTIONS, METRIC_DELIVERIES, METRIC_DROPPED, METRIC_EVENTS,
    METRIC_MALFORMED,
};
