use std::collections::{hash_map::Entry, BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};
use shared::{
    domain::{
        Folder, Message, MessageId, MessagePatch, Notification, NotificationId, Stats,
        StatsDelta, UserId,
    },
    protocol::{InboundEvent, NewMessage},
};
use tracing::debug;
use uuid::Uuid;

use super::pending::{Action, EntityRef, OpId, PendingOp};
use crate::realtime::ConnectionState;

#[derive(Debug, Clone)]
struct MessageEntry {
    confirmed: Message,
    visible: Option<Message>,
}

#[derive(Debug, Clone)]
struct NotificationEntry {
    confirmed: Notification,
    visible: Notification,
}

/// A sent message the server has not confirmed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub local_id: Uuid,
    pub op: OpId,
    pub draft: NewMessage,
    pub queued_at: DateTime<Utc>,
}

/// Server answer to a settled intent.
#[derive(Debug, Clone)]
pub enum Confirmation {
    Message(Message),
    Bulk { updated: u64 },
    Deleted,
    Notification(Notification),
}

/// What one state transition touched, for turning into client events.
#[derive(Debug, Default)]
pub struct Change {
    pub messages: BTreeSet<MessageId>,
    pub notifications: BTreeSet<NotificationId>,
    pub outgoing: bool,
    pub stats_changed: bool,
    /// Stats could not be adjusted incrementally and need a server refresh.
    pub stats_stale: bool,
    /// Messages whose server value is unknown and must be fetched again.
    pub recheck: BTreeSet<MessageId>,
}

impl Change {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
            && self.notifications.is_empty()
            && !self.outgoing
            && !self.stats_changed
            && !self.stats_stale
            && self.recheck.is_empty()
    }
}

#[derive(Debug)]
pub struct Rejection {
    pub change: Change,
    /// The failed intent's goal holds anyway, e.g. a push already deleted
    /// the message a failed delete was aimed at.
    pub satisfied: bool,
}

#[derive(Debug, Clone)]
pub struct InboxSnapshot {
    pub user_id: UserId,
    pub connection: ConnectionState,
    pub stats: Stats,
    pub unread_notifications: u64,
    /// Visible messages, newest first.
    pub messages: Vec<Message>,
    pub outgoing: Vec<OutgoingMessage>,
    pub notifications: Vec<Notification>,
    pub pending_ops: usize,
}

impl InboxSnapshot {
    pub fn folder(&self, folder: Folder) -> Vec<&Message> {
        self.messages
            .iter()
            .filter(|message| message.in_folder(folder, self.user_id))
            .collect()
    }

    pub fn message(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| message.id == id)
    }
}

fn placeholder_delta() -> StatsDelta {
    StatsDelta {
        sent: 1,
        ..StatsDelta::default()
    }
}

/// How long a deleted id keeps late pushes and stale pages from bringing the
/// message back, once no pending intent refers to it.
const TOMBSTONE_SECS: i64 = 600;

fn unread(notification: &Notification) -> i64 {
    i64::from(!notification.is_read)
}

/// Client-side inbox model. Every value it shows is the last confirmed
/// server value with the still-pending local intents replayed on top.
#[derive(Debug)]
pub struct InboxState {
    user_id: UserId,
    messages: HashMap<MessageId, MessageEntry>,
    tombstones: HashMap<MessageId, DateTime<Utc>>,
    notifications: HashMap<NotificationId, NotificationEntry>,
    outgoing: BTreeMap<OpId, OutgoingMessage>,
    pending: BTreeMap<OpId, PendingOp>,
    stats: Stats,
    unread_notifications: u64,
    next_op: u64,
}

impl InboxState {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            messages: HashMap::new(),
            tombstones: HashMap::new(),
            notifications: HashMap::new(),
            outgoing: BTreeMap::new(),
            pending: BTreeMap::new(),
            stats: Stats::default(),
            unread_notifications: 0,
            next_op: 1,
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn unread_notifications(&self) -> u64 {
        self.unread_notifications
    }

    pub fn message(&self, id: MessageId) -> Option<&Message> {
        self.messages.get(&id)?.visible.as_ref()
    }

    pub fn confirmed(&self, id: MessageId) -> Option<&Message> {
        self.messages.get(&id).map(|entry| &entry.confirmed)
    }

    pub fn visible_messages(&self) -> impl Iterator<Item = &Message> {
        self.messages
            .values()
            .filter_map(|entry| entry.visible.as_ref())
    }

    pub fn notification(&self, id: NotificationId) -> Option<&Notification> {
        self.notifications.get(&id).map(|entry| &entry.visible)
    }

    pub fn outgoing(&self) -> Vec<OutgoingMessage> {
        self.outgoing.values().cloned().collect()
    }

    pub fn pending(&self, op: OpId) -> Option<&PendingOp> {
        self.pending.get(&op)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn snapshot(&self, connection: ConnectionState) -> InboxSnapshot {
        let mut messages: Vec<Message> = self.visible_messages().cloned().collect();
        messages.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let mut notifications: Vec<Notification> = self
            .notifications
            .values()
            .map(|entry| entry.visible.clone())
            .collect();
        notifications.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        InboxSnapshot {
            user_id: self.user_id,
            connection,
            stats: self.stats,
            unread_notifications: self.unread_notifications,
            messages,
            outgoing: self.outgoing(),
            notifications,
            pending_ops: self.pending.len(),
        }
    }

    fn commit(&mut self, delta: StatsDelta, change: &mut Change) {
        if delta.is_zero() {
            return;
        }
        self.stats.apply(delta);
        change.stats_changed = true;
    }

    /// Recomputes the visible value of `id` and returns the stats delta of
    /// the transition. The caller commits it.
    fn rebuild_message(&mut self, id: MessageId, change: &mut Change) -> StatsDelta {
        let Some(entry) = self.messages.get_mut(&id) else {
            return StatsDelta::default();
        };
        let entity = EntityRef::Message(id);
        let mut visible = Some(entry.confirmed.clone());
        for op in self.pending.values() {
            if op.is_active_for(entity) {
                visible = op.action.apply(visible);
            }
        }
        if visible == entry.visible {
            return StatsDelta::default();
        }
        let delta = StatsDelta::between(entry.visible.as_ref(), visible.as_ref(), self.user_id);
        entry.visible = visible;
        change.messages.insert(id);
        delta
    }

    fn rebuild_notification(&mut self, id: NotificationId, change: &mut Change) {
        let Some(entry) = self.notifications.get_mut(&id) else {
            return;
        };
        let entity = EntityRef::Notification(id);
        let mut visible = entry.confirmed.clone();
        if self.pending.values().any(|op| op.is_active_for(entity)) {
            visible.is_read = true;
        }
        if visible == entry.visible {
            return;
        }
        let shift = unread(&visible) - unread(&entry.visible);
        self.unread_notifications = self.unread_notifications.saturating_add_signed(shift);
        entry.visible = visible;
        change.notifications.insert(id);
    }

    fn supersede(&mut self, entity: EntityRef, stamp: Option<DateTime<Utc>>) {
        for op in self.pending.values_mut() {
            let older = stamp.map_or(true, |stamp| op.stamp <= stamp);
            if op.action.touches(entity) && older {
                op.supersede(entity);
            }
        }
    }

    /// Records a deletion and forgets deletions old enough that nothing
    /// stale can still arrive for them.
    fn bury(&mut self, id: MessageId, stamp: DateTime<Utc>) {
        self.tombstones.insert(id, stamp);
        let horizon = stamp - Duration::seconds(TOMBSTONE_SECS);
        let pending = &self.pending;
        self.tombstones.retain(|id, buried| {
            *buried >= horizon
                || pending
                    .values()
                    .any(|op| op.action.touches(EntityRef::Message(*id)))
        });
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    fn remove_notifications_of(&mut self, message: MessageId, change: &mut Change) {
        let doomed: Vec<NotificationId> = self
            .notifications
            .iter()
            .filter(|(_, entry)| entry.confirmed.message_id == Some(message))
            .map(|(id, _)| *id)
            .collect();
        for id in doomed {
            if let Some(entry) = self.notifications.remove(&id) {
                self.unread_notifications = self
                    .unread_notifications
                    .saturating_sub(u64::from(!entry.visible.is_read));
                change.notifications.insert(id);
            }
        }
    }

    /// Records a local intent and applies its optimistic effect.
    pub fn begin(&mut self, action: Action, stamp: DateTime<Utc>) -> (OpId, Change) {
        let op = OpId(self.next_op);
        self.next_op += 1;
        let mut change = Change::default();
        let mut delta = StatsDelta::default();

        if let Action::Send { local_id, draft } = &action {
            self.outgoing.insert(
                op,
                OutgoingMessage {
                    local_id: *local_id,
                    op,
                    draft: draft.clone(),
                    queued_at: stamp,
                },
            );
            delta += placeholder_delta();
            change.outgoing = true;
        }
        let touched = action.messages().to_vec();
        let notification = match &action {
            Action::MarkNotificationRead { id } => Some(*id),
            _ => None,
        };
        self.pending.insert(op, PendingOp::new(op, stamp, action));

        for id in touched {
            delta += self.rebuild_message(id, &mut change);
        }
        if let Some(id) = notification {
            self.rebuild_notification(id, &mut change);
        }
        self.commit(delta, &mut change);
        (op, change)
    }

    /// Applies the server's answer to a settled intent.
    pub fn confirm(&mut self, op: OpId, confirmation: Confirmation) -> Change {
        let mut change = Change::default();
        let Some(pending) = self.pending.remove(&op) else {
            return change;
        };
        let mut delta = StatsDelta::default();

        match (&pending.action, confirmation) {
            (Action::Update { id, .. }, Confirmation::Message(server)) if server.id == *id => {
                delta += self.confirm_message(&pending, server, &mut change);
            }
            (Action::Update { id, patch }, _) => {
                delta += self.confirm_patch(&pending, *id, patch, &mut change);
            }
            (Action::BulkUpdate { ids, .. }, Confirmation::Bulk { updated })
                if updated != ids.len() as u64 =>
            {
                // which ids the server skipped is unknown here
                debug!(
                    requested = ids.len(),
                    updated, "sync: bulk update partially applied, rechecking"
                );
                for id in ids {
                    delta += self.rebuild_message(*id, &mut change);
                    if !self.tombstones.contains_key(id) {
                        change.recheck.insert(*id);
                    }
                }
                change.stats_stale = true;
            }
            (Action::BulkUpdate { ids, patch }, _) => {
                for id in ids {
                    delta += self.confirm_patch(&pending, *id, patch, &mut change);
                }
            }
            (Action::Delete { id }, _) => {
                self.bury(*id, pending.stamp);
                if let Some(entry) = self.messages.remove(id) {
                    delta -= StatsDelta::contribution(entry.visible.as_ref(), self.user_id);
                    change.messages.insert(*id);
                }
                self.remove_notifications_of(*id, &mut change);
            }
            (Action::Send { .. }, confirmation) => {
                if self.outgoing.remove(&op).is_some() {
                    delta -= placeholder_delta();
                    change.outgoing = true;
                }
                if let Confirmation::Message(server) = confirmation {
                    delta += self.insert_sent(server, &mut change);
                }
            }
            (Action::MarkNotificationRead { id }, confirmation) => {
                let entity = EntityRef::Notification(*id);
                if !pending.is_superseded(entity) {
                    if let Some(entry) = self.notifications.get_mut(id) {
                        match confirmation {
                            Confirmation::Notification(server) if server.id == *id => {
                                entry.confirmed = server
                            }
                            _ => entry.confirmed.is_read = true,
                        }
                    }
                }
                self.rebuild_notification(*id, &mut change);
            }
        }

        self.commit(delta, &mut change);
        change
    }

    fn confirm_message(
        &mut self,
        pending: &PendingOp,
        server: Message,
        change: &mut Change,
    ) -> StatsDelta {
        let id = server.id;
        if self.tombstones.contains_key(&id) {
            return StatsDelta::default();
        }
        let superseded = pending.is_superseded(EntityRef::Message(id));
        match self.messages.get_mut(&id) {
            Some(entry) => {
                if !superseded {
                    entry.confirmed = server;
                }
            }
            None => {
                change.stats_stale = true;
                return StatsDelta::default();
            }
        }
        self.rebuild_message(id, change)
    }

    fn confirm_patch(
        &mut self,
        pending: &PendingOp,
        id: MessageId,
        patch: &MessagePatch,
        change: &mut Change,
    ) -> StatsDelta {
        if self.tombstones.contains_key(&id) {
            return StatsDelta::default();
        }
        let superseded = pending.is_superseded(EntityRef::Message(id));
        match self.messages.get_mut(&id) {
            Some(entry) => {
                if !superseded {
                    entry.confirmed.apply_patch(patch);
                }
            }
            None => {
                change.stats_stale = true;
                return StatsDelta::default();
            }
        }
        self.rebuild_message(id, change)
    }

    fn insert_sent(&mut self, server: Message, change: &mut Change) -> StatsDelta {
        let id = server.id;
        if self.tombstones.contains_key(&id) {
            return StatsDelta::default();
        }
        match self.messages.entry(id) {
            // the push echo got here first
            Entry::Occupied(_) => StatsDelta::default(),
            Entry::Vacant(slot) => {
                slot.insert(MessageEntry {
                    confirmed: server,
                    visible: None,
                });
                self.rebuild_message(id, change)
            }
        }
    }

    /// Rolls a failed intent back: the touched values are rebuilt from their
    /// last confirmed value without it.
    pub fn reject(&mut self, op: OpId) -> Rejection {
        let mut change = Change::default();
        let Some(pending) = self.pending.remove(&op) else {
            return Rejection {
                change,
                satisfied: false,
            };
        };
        let mut delta = StatsDelta::default();

        let satisfied = match &pending.action {
            Action::Delete { id } => self.tombstones.contains_key(id),
            Action::Send { .. } => pending.echoed.is_some(),
            Action::MarkNotificationRead { id } => self
                .notifications
                .get(id)
                .map_or(false, |entry| entry.confirmed.is_read),
            Action::Update { .. } | Action::BulkUpdate { .. } => false,
        };

        if self.outgoing.remove(&op).is_some() {
            delta -= placeholder_delta();
            change.outgoing = true;
        }
        for id in pending.action.messages() {
            delta += self.rebuild_message(*id, &mut change);
        }
        if let Action::MarkNotificationRead { id } = &pending.action {
            self.rebuild_notification(*id, &mut change);
        }

        self.commit(delta, &mut change);
        Rejection { change, satisfied }
    }

    /// Merges one push event stamped with the server's logical time.
    pub fn apply_push(&mut self, event: &InboundEvent, stamp: DateTime<Utc>) -> Change {
        let mut change = Change::default();
        let delta = match event {
            InboundEvent::NewMessage(message) => {
                self.push_message(message.clone(), stamp, true, &mut change)
            }
            InboundEvent::MessageUpdated(message) => {
                self.push_message(message.clone(), stamp, false, &mut change)
            }
            InboundEvent::MessageDeleted(deleted) => {
                self.push_delete(deleted.message_id, stamp, &mut change)
            }
            InboundEvent::NewNotification(notification) => {
                self.push_notification(notification.clone(), stamp, &mut change);
                StatsDelta::default()
            }
            InboundEvent::NotificationRead(read) => {
                self.push_notification_read(read.notification_id, stamp, &mut change);
                StatsDelta::default()
            }
            InboundEvent::ConnectionEstablished(_) | InboundEvent::Error(_) => {
                StatsDelta::default()
            }
        };
        self.commit(delta, &mut change);
        change
    }

    fn push_message(
        &mut self,
        message: Message,
        stamp: DateTime<Utc>,
        is_new: bool,
        change: &mut Change,
    ) -> StatsDelta {
        let id = message.id;
        if self.tombstones.contains_key(&id) {
            debug!(message_id = id.0, "sync: ignoring push for deleted message");
            return StatsDelta::default();
        }
        self.supersede(EntityRef::Message(id), Some(stamp));

        let mut delta = StatsDelta::default();
        if is_new && message.sender.id == self.user_id && !self.messages.contains_key(&id) {
            delta += self.match_echo(&message, change);
        }

        match self.messages.entry(id) {
            Entry::Occupied(mut slot) => {
                slot.get_mut().confirmed = message;
                delta += self.rebuild_message(id, change);
            }
            Entry::Vacant(slot) if is_new => {
                slot.insert(MessageEntry {
                    confirmed: message,
                    visible: None,
                });
                delta += self.rebuild_message(id, change);
            }
            Entry::Vacant(slot) => {
                // the server baseline already counts it; only pending
                // intents are ours to add, the update itself is unknown
                slot.insert(MessageEntry {
                    visible: Some(message.clone()),
                    confirmed: message,
                });
                change.messages.insert(id);
                delta += self.rebuild_message(id, change);
                change.stats_stale = true;
            }
        }
        delta
    }

    /// Pairs a pushed message sent by this user with the oldest matching
    /// unconfirmed send and retires its placeholder.
    fn match_echo(&mut self, message: &Message, change: &mut Change) -> StatsDelta {
        let candidate = self.outgoing.iter().find_map(|(op, outgoing)| {
            let draft = &outgoing.draft;
            let matches = draft.recipient_id == message.recipient.id
                && draft.subject == message.subject
                && draft.body == message.body;
            matches.then_some(*op)
        });
        let Some(op) = candidate else {
            return StatsDelta::default();
        };
        self.outgoing.remove(&op);
        if let Some(pending) = self.pending.get_mut(&op) {
            pending.echoed = Some(message.id);
        }
        change.outgoing = true;
        StatsDelta::default() - placeholder_delta()
    }

    fn push_delete(
        &mut self,
        id: MessageId,
        stamp: DateTime<Utc>,
        change: &mut Change,
    ) -> StatsDelta {
        self.bury(id, stamp);
        self.supersede(EntityRef::Message(id), None);
        let mut delta = StatsDelta::default();
        match self.messages.remove(&id) {
            Some(entry) => {
                delta -= StatsDelta::contribution(entry.visible.as_ref(), self.user_id);
                change.messages.insert(id);
            }
            None => change.stats_stale = true,
        }
        self.remove_notifications_of(id, change);
        delta
    }

    fn push_notification(
        &mut self,
        notification: Notification,
        stamp: DateTime<Utc>,
        change: &mut Change,
    ) {
        if notification
            .message_id
            .is_some_and(|id| self.tombstones.contains_key(&id))
        {
            return;
        }
        let id = notification.id;
        self.supersede(EntityRef::Notification(id), Some(stamp));
        match self.notifications.entry(id) {
            Entry::Occupied(mut slot) => slot.get_mut().confirmed = notification,
            Entry::Vacant(slot) => {
                self.unread_notifications += u64::from(!notification.is_read);
                slot.insert(NotificationEntry {
                    visible: notification.clone(),
                    confirmed: notification,
                });
                change.notifications.insert(id);
            }
        }
        self.rebuild_notification(id, change);
    }

    fn push_notification_read(
        &mut self,
        id: NotificationId,
        stamp: DateTime<Utc>,
        change: &mut Change,
    ) {
        self.supersede(EntityRef::Notification(id), Some(stamp));
        if let Some(entry) = self.notifications.get_mut(&id) {
            entry.confirmed.is_read = true;
        }
        self.rebuild_notification(id, change);
    }

    /// Takes in a fetched page. Entries the client already holds only move
    /// forward in `updated_at`; new entries are assumed to be part of the
    /// server's stats already.
    pub fn absorb_messages(&mut self, items: &[Message]) -> Change {
        let mut change = Change::default();
        let mut delta = StatsDelta::default();
        for message in items {
            let id = message.id;
            if self.tombstones.contains_key(&id) {
                continue;
            }
            match self.messages.entry(id) {
                Entry::Occupied(mut slot) => {
                    if message.updated_at < slot.get().confirmed.updated_at {
                        continue;
                    }
                    slot.get_mut().confirmed = message.clone();
                }
                Entry::Vacant(slot) => {
                    slot.insert(MessageEntry {
                        confirmed: message.clone(),
                        visible: Some(message.clone()),
                    });
                    change.messages.insert(id);
                }
            }
            delta += self.rebuild_message(id, &mut change);
        }
        self.commit(delta, &mut change);
        change
    }

    /// The server answered "not found" for a message the client shows.
    pub fn absorb_missing(&mut self, id: MessageId, stamp: DateTime<Utc>) -> Change {
        let mut change = Change::default();
        let delta = self.push_delete(id, stamp, &mut change);
        self.commit(delta, &mut change);
        change
    }

    pub fn absorb_notifications(&mut self, items: &[Notification]) -> Change {
        let mut change = Change::default();
        for notification in items {
            if notification
                .message_id
                .is_some_and(|id| self.tombstones.contains_key(&id))
            {
                continue;
            }
            let id = notification.id;
            match self.notifications.entry(id) {
                Entry::Occupied(mut slot) => slot.get_mut().confirmed = notification.clone(),
                Entry::Vacant(slot) => {
                    self.unread_notifications += u64::from(!notification.is_read);
                    slot.insert(NotificationEntry {
                        confirmed: notification.clone(),
                        visible: notification.clone(),
                    });
                    change.notifications.insert(id);
                }
            }
            self.rebuild_notification(id, &mut change);
        }
        change
    }

    /// Adopts server stats, with the effect of still-pending intents laid on
    /// top since the server has not seen them yet.
    pub fn replace_stats(&mut self, server: Stats) -> Change {
        let mut change = Change::default();
        let mut overlay = StatsDelta::default();
        for entry in self.messages.values() {
            overlay += StatsDelta::between(
                Some(&entry.confirmed),
                entry.visible.as_ref(),
                self.user_id,
            );
        }
        for _ in self.outgoing.values() {
            overlay += placeholder_delta();
        }
        let mut stats = server;
        stats.apply(overlay);
        if stats != self.stats {
            self.stats = stats;
            change.stats_changed = true;
        }
        change
    }
}

#[cfg(test)]
#[path = "tests/state_tests.rs"]
mod tests;
