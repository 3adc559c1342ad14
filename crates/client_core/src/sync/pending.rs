use std::{
    collections::{HashMap, HashSet, VecDeque},
    slice,
};

use chrono::{DateTime, Duration, Utc};
use shared::{
    domain::{Message, MessageId, MessagePatch, NotificationId},
    protocol::NewMessage,
};
use uuid::Uuid;

/// Submission order of local intents. Monotonic per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityRef {
    Message(MessageId),
    Notification(NotificationId),
}

#[derive(Debug, Clone)]
pub enum Action {
    Update { id: MessageId, patch: MessagePatch },
    BulkUpdate { ids: Vec<MessageId>, patch: MessagePatch },
    Delete { id: MessageId },
    Send { local_id: Uuid, draft: NewMessage },
    MarkNotificationRead { id: NotificationId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Update,
    BulkUpdate,
    Delete,
    Send,
    MarkNotificationRead,
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Update { .. } => ActionKind::Update,
            Action::BulkUpdate { .. } => ActionKind::BulkUpdate,
            Action::Delete { .. } => ActionKind::Delete,
            Action::Send { .. } => ActionKind::Send,
            Action::MarkNotificationRead { .. } => ActionKind::MarkNotificationRead,
        }
    }

    /// Messages whose visible value this intent changes.
    pub fn messages(&self) -> &[MessageId] {
        match self {
            Action::Update { id, .. } | Action::Delete { id } => slice::from_ref(id),
            Action::BulkUpdate { ids, .. } => ids.as_slice(),
            Action::Send { .. } | Action::MarkNotificationRead { .. } => &[],
        }
    }

    pub fn touches(&self, entity: EntityRef) -> bool {
        match (self, entity) {
            (_, EntityRef::Message(id)) => self.messages().contains(&id),
            (Action::MarkNotificationRead { id }, EntityRef::Notification(other)) => *id == other,
            _ => false,
        }
    }

    /// The intent's effect on one message value.
    pub fn apply(&self, message: Option<Message>) -> Option<Message> {
        match self {
            Action::Update { patch, .. } | Action::BulkUpdate { patch, .. } => {
                message.map(|message| message.patched(patch))
            }
            Action::Delete { .. } => None,
            Action::Send { .. } | Action::MarkNotificationRead { .. } => message,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingOp {
    pub id: OpId,
    pub stamp: DateTime<Utc>,
    pub action: Action,
    /// Server id of a sent message whose push echo already arrived.
    pub echoed: Option<MessageId>,
    superseded: HashSet<EntityRef>,
}

impl PendingOp {
    pub fn new(id: OpId, stamp: DateTime<Utc>, action: Action) -> Self {
        Self {
            id,
            stamp,
            action,
            echoed: None,
            superseded: HashSet::new(),
        }
    }

    pub fn supersede(&mut self, entity: EntityRef) {
        self.superseded.insert(entity);
    }

    pub fn is_superseded(&self, entity: EntityRef) -> bool {
        self.superseded.contains(&entity)
    }

    /// Still shapes the visible value of `entity`.
    pub fn is_active_for(&self, entity: EntityRef) -> bool {
        self.action.touches(entity) && !self.is_superseded(entity)
    }
}

/// Estimate of the server clock. Intents are stamped with it so they can be
/// ordered against server-stamped push events.
#[derive(Debug, Clone, Copy)]
pub struct LogicalClock {
    skew: Duration,
}

impl Default for LogicalClock {
    fn default() -> Self {
        Self {
            skew: Duration::zero(),
        }
    }
}

impl LogicalClock {
    pub fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.skew
    }

    pub fn observe(&mut self, server_time: DateTime<Utc>) {
        self.skew = server_time - Utc::now();
    }

    pub fn skew(&self) -> Duration {
        self.skew
    }
}

/// Issues requests for intents one at a time per message, in submission
/// order. Intents that touch no message never wait.
#[derive(Debug, Default)]
pub struct RequestQueue {
    waiting: VecDeque<(OpId, Vec<MessageId>)>,
    in_flight: HashMap<OpId, Vec<MessageId>>,
    busy: HashSet<MessageId>,
}

impl RequestQueue {
    pub fn enqueue(&mut self, op: OpId, messages: &[MessageId]) {
        self.waiting.push_back((op, messages.to_vec()));
    }

    pub fn finish(&mut self, op: OpId) {
        if let Some(messages) = self.in_flight.remove(&op) {
            for id in messages {
                self.busy.remove(&id);
            }
        }
    }

    /// Ops that may start now, in submission order. A waiting op also blocks
    /// later ops that share one of its messages.
    pub fn take_ready(&mut self) -> Vec<OpId> {
        let mut ready = Vec::new();
        let mut blocked: HashSet<MessageId> = HashSet::new();
        let mut still_waiting = VecDeque::with_capacity(self.waiting.len());
        while let Some((op, messages)) = self.waiting.pop_front() {
            let free = messages
                .iter()
                .all(|id| !self.busy.contains(id) && !blocked.contains(id));
            if free {
                self.busy.extend(messages.iter().copied());
                self.in_flight.insert(op, messages);
                ready.push(op);
            } else {
                blocked.extend(messages.iter().copied());
                still_waiting.push_back((op, messages));
            }
        }
        self.waiting = still_waiting;
        ready
    }
}
