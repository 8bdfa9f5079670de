//! Client-side reconciliation of broadcast events against rendered content.
//!
//! A client renders a page of the feed and then receives broadcasts, including
//! a replay of recently created items. The reconciler decides which of those
//! are genuinely new to this client and aggregates them into a single
//! "new items available" notification.
//!
//! Two attach modes exist. [`AttachMode::AfterLoad`] subscribes before the page
//! has loaded and relies on a snapshot of the first rendered ids to suppress
//! replayed items that the page already contained. [`AttachMode::Buffered`]
//! holds every event that arrives before the first render and resolves it
//! against the loaded page, closing the race where a replayed item arrives
//! before the page that contains it.

use std::collections::HashSet;

use uuid::Uuid;

use crate::broadcast::{EventKind, ServerMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttachMode {
    #[default]
    AfterLoad,
    Buffered,
}

/// What the reconciler did with one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The item is on screen; nothing to announce.
    AlreadyRendered,
    /// The item was part of the first rendered page.
    InitialSnapshot,
    /// The item is new to this client; `total` unseen items are pending.
    Unseen { total: usize },
    /// Held until the first page is rendered.
    Deferred,
    /// A pending unseen item was deleted; `total` remain.
    Retracted { total: usize },
    /// The event does not affect the notification.
    Ignored,
}

#[derive(Debug, Default)]
pub struct Reconciler {
    mode: AttachMode,
    rendered: HashSet<Uuid>,
    initial_ids: Option<HashSet<Uuid>>,
    unseen_order: Vec<Uuid>,
    unseen: HashSet<Uuid>,
    loaded: bool,
    pending: Vec<(EventKind, Uuid)>,
}

impl Reconciler {
    pub fn new(mode: AttachMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn mode(&self) -> AttachMode {
        self.mode
    }

    /// Record the ids currently rendered.
    ///
    /// The first non-empty render becomes the initial snapshot. In buffered
    /// mode the first render also resolves every held event, returning their
    /// decisions in arrival order.
    pub fn render<I>(&mut self, ids: I) -> Vec<Decision>
    where
        I: IntoIterator<Item = Uuid>,
    {
        self.rendered = ids.into_iter().collect();
        if self.initial_ids.is_none() && !self.rendered.is_empty() {
            self.initial_ids = Some(self.rendered.clone());
        }

        // Anything now on screen is no longer "new".
        let rendered = &self.rendered;
        self.unseen.retain(|id| !rendered.contains(id));
        self.unseen_order.retain(|id| !rendered.contains(id));

        if self.loaded {
            return Vec::new();
        }
        self.loaded = true;
        std::mem::take(&mut self.pending)
            .into_iter()
            .map(|(kind, id)| self.decide(kind, id))
            .collect()
    }

    /// Reconcile one broadcast event.
    pub fn observe(&mut self, kind: EventKind, id: Uuid) -> Decision {
        if self.mode == AttachMode::Buffered && !self.loaded {
            self.pending.push((kind, id));
            return Decision::Deferred;
        }
        self.decide(kind, id)
    }

    /// Reconcile a server frame. Replays count as `created` events.
    pub fn apply(&mut self, message: &ServerMessage) -> Vec<Decision> {
        match message {
            ServerMessage::Created { data, .. } => vec![self.observe(EventKind::Created, data.id)],
            ServerMessage::Updated { data, .. } => vec![self.observe(EventKind::Updated, data.id)],
            ServerMessage::Deleted { data, .. } => vec![self.observe(EventKind::Deleted, data.id)],
            ServerMessage::RecentMessages { data, .. } => data
                .iter()
                .map(|item| self.observe(EventKind::Created, item.id))
                .collect(),
            ServerMessage::Welcome { .. }
            | ServerMessage::Heartbeat { .. }
            | ServerMessage::Pong { .. } => Vec::new(),
        }
    }

    pub fn unseen_count(&self) -> usize {
        self.unseen.len()
    }

    /// Unseen ids in the order they arrived.
    pub fn unseen_ids(&self) -> &[Uuid] {
        &self.unseen_order
    }

    pub fn initial_ids(&self) -> Option<&HashSet<Uuid>> {
        self.initial_ids.as_ref()
    }

    /// Text of the aggregated notification, if anything is pending.
    pub fn notification(&self) -> Option<String> {
        match self.unseen_count() {
            0 => None,
            1 => Some("1 new item available".to_string()),
            n => Some(format!("{n} new items available")),
        }
    }

    /// The user accepted the notification and the feed was re-fetched.
    pub fn accept_refresh<I>(&mut self, fresh_ids: I)
    where
        I: IntoIterator<Item = Uuid>,
    {
        self.unseen.clear();
        self.unseen_order.clear();
        self.render(fresh_ids);
    }

    fn decide(&mut self, kind: EventKind, id: Uuid) -> Decision {
        match kind {
            EventKind::Created => {
                if self.rendered.contains(&id) {
                    Decision::AlreadyRendered
                } else if self
                    .initial_ids
                    .as_ref()
                    .is_some_and(|initial| initial.contains(&id))
                {
                    Decision::InitialSnapshot
                } else {
                    if self.unseen.insert(id) {
                        self.unseen_order.push(id);
                    }
                    Decision::Unseen {
                        total: self.unseen.len(),
                    }
                }
            }
            EventKind::Updated if self.rendered.contains(&id) => Decision::AlreadyRendered,
            EventKind::Updated => Decision::Ignored,
            EventKind::Deleted => {
                if self.unseen.remove(&id) {
                    self.unseen_order.retain(|pending| *pending != id);
                    Decision::Retracted {
                        total: self.unseen.len(),
                    }
                } else {
                    Decision::Ignored
                }
            }
        }
    }
}
