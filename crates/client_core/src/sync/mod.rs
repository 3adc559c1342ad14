//! The per-session synchronizer. One actor task owns [`InboxState`] and is
//! the only writer; handles talk to it through a command queue, requests run
//! as tasks that report back to it, and push notices arrive in order from the
//! realtime channel.

pub mod pending;
pub mod state;

use std::{collections::HashMap, sync::Arc};

use futures::{Stream, StreamExt};
use shared::{
    domain::{Folder, Message, MessageId, MessagePatch, Notification, NotificationId, Stats, UserId},
    protocol::{
        BulkUpdateRequest, InboundEvent, ListQuery, NewMessage, NotificationQuery, Page,
    },
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch, Mutex},
    task::{JoinError, JoinHandle, JoinSet},
};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    api::{MESSAGES, NOTIFICATIONS},
    cache::{CachePolicy, SharedCacheMirror},
    config::SyncConfig,
    error::{ActionError, ErrorClass, RequestError, SyncError},
    realtime::{ChannelConnector, ChannelNotice, ConnectionState, RealtimeChannel, WsConnector},
    request::RequestLayer,
};

pub use pending::{Action, ActionKind, EntityRef, LogicalClock, OpId, PendingOp, RequestQueue};
pub use state::{Change, Confirmation, InboxSnapshot, InboxState, OutgoingMessage, Rejection};

const COMMAND_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    MessagesChanged {
        upserted: Vec<Message>,
        removed: Vec<MessageId>,
    },
    OutboxChanged(Vec<OutgoingMessage>),
    NotificationsChanged {
        upserted: Vec<Notification>,
        removed: Vec<NotificationId>,
        unread: u64,
    },
    StatsChanged(Stats),
    ConnectionStateChanged(ConnectionState),
    /// Reconnect attempts are exhausted; `connect()` starts over.
    ConnectionLost,
    ActionFailed {
        op: OpId,
        kind: ActionKind,
        error: ActionError,
    },
    /// The server refused the token. Set a fresh one and resubmit.
    AuthExpired,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: UserId,
    pub token: String,
}

type Reply<T> = oneshot::Sender<Result<T, ActionError>>;

enum Command {
    Load {
        query: ListQuery,
        reply: Reply<Page<Message>>,
    },
    LoadNotifications {
        query: NotificationQuery,
        reply: Reply<Page<Notification>>,
    },
    RefreshStats {
        reply: Reply<Stats>,
    },
    Submit {
        action: Action,
        reply: Reply<()>,
    },
    Snapshot {
        reply: oneshot::Sender<InboxSnapshot>,
    },
    Connect,
    SetToken {
        token: String,
    },
}

enum Completion {
    Op {
        op: OpId,
        result: Result<Confirmation, RequestError>,
    },
    Folder {
        result: Result<Page<Message>, RequestError>,
        reply: Reply<Page<Message>>,
    },
    Notifications {
        result: Result<Page<Notification>, RequestError>,
        reply: Reply<Page<Notification>>,
    },
    Stats {
        result: Result<Stats, RequestError>,
        epoch_at_start: u64,
    },
    Recheck {
        id: MessageId,
        result: Result<Message, RequestError>,
    },
}

async fn perform(requests: Arc<RequestLayer>, action: Action) -> Result<Confirmation, RequestError> {
    match action {
        Action::Update { id, patch } => requests
            .update_message(id, &patch)
            .await
            .map(Confirmation::Message),
        Action::BulkUpdate { ids, patch } => requests
            .bulk_update(&BulkUpdateRequest {
                ids,
                updates: patch,
            })
            .await
            .map(|response| Confirmation::Bulk {
                updated: response.updated_count,
            }),
        Action::Delete { id } => match requests.delete_message(id).await {
            Ok(()) => Ok(Confirmation::Deleted),
            // someone else deleted it first
            Err(RequestError::Rejected { status: 404, .. }) => Ok(Confirmation::Deleted),
            Err(err) => Err(err),
        },
        Action::Send { draft, .. } => requests
            .send_message(&draft)
            .await
            .map(Confirmation::Message),
        Action::MarkNotificationRead { id } => requests
            .mark_notification_read(id)
            .await
            .map(Confirmation::Notification),
    }
}

struct Synchronizer {
    state: InboxState,
    clock: LogicalClock,
    config: SyncConfig,
    requests: Arc<RequestLayer>,
    channel: RealtimeChannel,
    events: broadcast::Sender<ClientEvent>,
    tasks: JoinSet<Completion>,
    queue: RequestQueue,
    replies: HashMap<OpId, Reply<()>>,
    stats_waiters: Vec<Reply<Stats>>,
    stats_in_flight: bool,
    stats_rerun: bool,
    /// Bumped by every change a server stats answer may not include yet.
    stats_epoch: u64,
    connected_once: bool,
    cancel: CancellationToken,
}

impl Synchronizer {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut notices: mpsc::UnboundedReceiver<ChannelNotice>,
    ) {
        info!(user_id = self.state.user_id().0, "sync: session started");
        self.channel.connect();
        self.refresh_stats(None);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(notice) = notices.recv() => self.on_notice(notice).await,
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => {
                        debug!("sync: every handle dropped");
                        break;
                    }
                },
                Some(done) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    self.on_completion(done).await;
                }
            }
        }

        self.teardown().await;
    }

    async fn teardown(mut self) {
        self.cancel.cancel();
        self.channel.disconnect().await;
        self.tasks.shutdown().await;
        for (_, reply) in self.replies.drain() {
            let _ = reply.send(Err(ActionError::Closed));
        }
        for reply in self.stats_waiters.drain(..) {
            let _ = reply.send(Err(ActionError::Closed));
        }
        info!(
            user_id = self.state.user_id().0,
            dropped_ops = self.state.pending_len(),
            "sync: session closed"
        );
    }

    fn emit(&self, event: ClientEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn connection(&self) -> ConnectionState {
        self.channel.state()
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Load { query, reply } => {
                let requests = Arc::clone(&self.requests);
                self.tasks.spawn(async move {
                    let result = requests.list_messages(&query).await;
                    Completion::Folder { result, reply }
                });
            }
            Command::LoadNotifications { query, reply } => {
                let requests = Arc::clone(&self.requests);
                self.tasks.spawn(async move {
                    let result = requests.list_notifications(&query).await;
                    Completion::Notifications { result, reply }
                });
            }
            Command::RefreshStats { reply } => self.refresh_stats(Some(reply)),
            Command::Submit { action, reply } => self.submit(action, reply),
            Command::Snapshot { reply } => {
                let _ = reply.send(self.state.snapshot(self.connection()));
            }
            Command::Connect => self.channel.connect(),
            Command::SetToken { token } => {
                match self.config.push_url(self.state.user_id(), &token) {
                    Ok(url) => self.channel.set_url(url),
                    Err(err) => error!(error = %err, "sync: cannot rebuild push url"),
                }
            }
        }
    }

    fn submit(&mut self, action: Action, reply: Reply<()>) {
        if let Action::BulkUpdate { ids, .. } = &action {
            if ids.is_empty() {
                let _ = reply.send(Ok(()));
                return;
            }
        }
        let kind = action.kind();
        let messages = action.messages().to_vec();
        let (op, change) = self.state.begin(action, self.clock.now());
        debug!(op = op.0, kind = ?kind, "sync: intent applied optimistically");
        self.replies.insert(op, reply);
        self.queue.enqueue(op, &messages);
        self.publish(change);
        self.start_ready();
    }

    fn start_ready(&mut self) {
        for op in self.queue.take_ready() {
            let Some(pending) = self.state.pending(op) else {
                self.queue.finish(op);
                continue;
            };
            let action = pending.action.clone();
            let requests = Arc::clone(&self.requests);
            self.tasks.spawn(async move {
                let result = perform(requests, action).await;
                Completion::Op { op, result }
            });
        }
    }

    /// A caller asking for stats gets a server answer; internal refreshes
    /// may be served from the cache.
    fn refresh_stats(&mut self, waiter: Option<Reply<Stats>>) {
        let policy = match waiter {
            Some(waiter) => {
                self.stats_waiters.push(waiter);
                CachePolicy::Bypass
            }
            None => CachePolicy::Ttl(self.config.cache.stats()),
        };
        if self.stats_in_flight {
            self.stats_rerun = true;
            return;
        }
        self.stats_in_flight = true;
        self.stats_rerun = false;
        let requests = Arc::clone(&self.requests);
        let epoch_at_start = self.stats_epoch;
        self.tasks.spawn(async move {
            let result = requests.stats(policy).await;
            Completion::Stats {
                result,
                epoch_at_start,
            }
        });
    }

    fn note_stats_epoch(&mut self, change: &Change) {
        if change.stats_changed || change.stats_stale {
            self.stats_epoch += 1;
        }
    }

    async fn on_completion(&mut self, done: Result<Completion, JoinError>) {
        let completion = match done {
            Ok(completion) => completion,
            Err(err) if err.is_cancelled() => return,
            Err(err) => {
                error!(error = %err, "sync: request task failed");
                return;
            }
        };
        match completion {
            Completion::Op { op, result } => self.settle(op, result),
            Completion::Folder { result, reply } => {
                let result = result.map(|page| {
                    let change = self.state.absorb_messages(&page.items);
                    self.note_stats_epoch(&change);
                    self.publish(change);
                    let items = page
                        .items
                        .iter()
                        .filter_map(|message| self.state.message(message.id).cloned())
                        .collect();
                    Page {
                        items,
                        pagination: page.pagination,
                    }
                });
                self.answer(reply, result, "load folder");
            }
            Completion::Notifications { result, reply } => {
                let result = result.map(|page| {
                    let change = self.state.absorb_notifications(&page.items);
                    self.publish(change);
                    let items = page
                        .items
                        .iter()
                        .filter_map(|notification| {
                            self.state.notification(notification.id).cloned()
                        })
                        .collect();
                    Page {
                        items,
                        pagination: page.pagination,
                    }
                });
                self.answer(reply, result, "load notifications");
            }
            Completion::Stats {
                result,
                epoch_at_start,
            } => {
                self.stats_in_flight = false;
                match result {
                    Ok(_) if self.stats_rerun || epoch_at_start != self.stats_epoch => {
                        // the answer may predate what happened meanwhile
                        debug!("sync: stats answer outdated, fetching again");
                        self.requests.invalidate_family(MESSAGES).await;
                        self.refresh_stats(None);
                    }
                    Ok(server) => {
                        let change = self.state.replace_stats(server);
                        self.publish(change);
                        let stats = self.state.stats();
                        for waiter in self.stats_waiters.drain(..) {
                            let _ = waiter.send(Ok(stats));
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "sync: stats refresh failed");
                        self.note_auth(&err);
                        let error = ActionError::from_class(err.class());
                        for waiter in self.stats_waiters.drain(..) {
                            let _ = waiter.send(Err(error.clone()));
                        }
                    }
                }
            }
            Completion::Recheck { id, result } => {
                let change = match result {
                    Ok(message) => self.state.absorb_messages(&[message]),
                    Err(RequestError::Rejected { status: 404, .. }) => {
                        self.state.absorb_missing(id, self.clock.now())
                    }
                    Err(err) => {
                        warn!(message_id = id.0, error = %err, "sync: recheck failed");
                        self.note_auth(&err);
                        return;
                    }
                };
                self.note_stats_epoch(&change);
                self.publish(change);
            }
        }
    }

    fn answer<T>(&self, reply: Reply<T>, result: Result<T, RequestError>, what: &str) {
        let result = result.map_err(|err| {
            warn!(error = %err, "sync: {what} failed");
            self.note_auth(&err);
            ActionError::from_class(err.class())
        });
        let _ = reply.send(result);
    }

    fn note_auth(&self, err: &RequestError) {
        if err.class() == ErrorClass::AuthExpired {
            self.emit(ClientEvent::AuthExpired);
        }
    }

    fn settle(&mut self, op: OpId, result: Result<Confirmation, RequestError>) {
        self.queue.finish(op);
        self.stats_epoch += 1;
        let kind = self.state.pending(op).map(|pending| pending.action.kind());
        let reply = self.replies.remove(&op);

        let outcome = match result {
            Ok(confirmation) => {
                let change = self.state.confirm(op, confirmation);
                debug!(op = op.0, "sync: intent confirmed");
                self.publish(change);
                Ok(())
            }
            Err(RequestError::Cancelled) => Err(ActionError::Closed),
            Err(err) => {
                let Rejection { change, satisfied } = self.state.reject(op);
                self.publish(change);
                if satisfied {
                    info!(op = op.0, error = %err, "sync: intent failed but its outcome already holds");
                    Ok(())
                } else {
                    warn!(op = op.0, kind = ?kind, error = %err, "sync: intent rolled back");
                    let error = ActionError::from_class(err.class());
                    if let Some(kind) = kind {
                        self.emit(ClientEvent::ActionFailed {
                            op,
                            kind,
                            error: error.clone(),
                        });
                    }
                    self.note_auth(&err);
                    Err(error)
                }
            }
        };

        if let Some(reply) = reply {
            let _ = reply.send(outcome);
        }
        self.start_ready();
    }

    async fn on_notice(&mut self, notice: ChannelNotice) {
        match notice {
            ChannelNotice::StateChanged(connection) => {
                self.emit(ClientEvent::ConnectionStateChanged(connection));
                if connection == ConnectionState::Connected {
                    if self.connected_once {
                        self.resync().await;
                    }
                    self.connected_once = true;
                }
            }
            ChannelNotice::Push { event, timestamp } => self.on_push(event, timestamp).await,
            ChannelNotice::ServerTime(server_time) => self.clock.observe(server_time),
            ChannelNotice::ConnectionLost { attempts } => {
                warn!(attempts, "sync: push channel lost");
                self.emit(ClientEvent::ConnectionLost);
            }
        }
    }

    /// Push events may have been missed while the channel was down.
    async fn resync(&mut self) {
        info!("sync: channel back, refreshing");
        self.requests.invalidate_family(MESSAGES).await;
        self.requests.invalidate_family(NOTIFICATIONS).await;
        self.refresh_stats(None);
    }

    async fn on_push(&mut self, event: InboundEvent, timestamp: Option<chrono::DateTime<chrono::Utc>>) {
        let families: &[&str] = match &event {
            InboundEvent::ConnectionEstablished(established) => {
                if let Some(timestamp) = timestamp {
                    self.clock.observe(timestamp);
                }
                debug!(user_id = ?established.user_id, "sync: push session established");
                return;
            }
            InboundEvent::Error(payload) => {
                warn!(code = ?payload.code, detail = %payload.message, "sync: server reported an error");
                return;
            }
            InboundEvent::NewMessage(_) | InboundEvent::MessageUpdated(_) => &[MESSAGES],
            InboundEvent::MessageDeleted(_) => &[MESSAGES, NOTIFICATIONS],
            InboundEvent::NewNotification(_) | InboundEvent::NotificationRead(_) => {
                &[NOTIFICATIONS]
            }
        };

        let stamp = timestamp
            .or(match &event {
                InboundEvent::NewMessage(message) | InboundEvent::MessageUpdated(message) => {
                    Some(message.updated_at)
                }
                _ => None,
            })
            .unwrap_or_else(|| self.clock.now());
        let change = self.state.apply_push(&event, stamp);
        for family in families {
            self.requests.invalidate_family(family).await;
        }
        self.note_stats_epoch(&change);
        self.publish(change);
    }

    /// Turns one transition into events; stats go out at most once.
    fn publish(&mut self, change: Change) {
        if change.is_empty() {
            return;
        }
        if !change.messages.is_empty() {
            let mut upserted = Vec::new();
            let mut removed = Vec::new();
            for id in &change.messages {
                match self.state.message(*id) {
                    Some(message) => upserted.push(message.clone()),
                    None => removed.push(*id),
                }
            }
            self.emit(ClientEvent::MessagesChanged { upserted, removed });
        }
        if change.outgoing {
            self.emit(ClientEvent::OutboxChanged(self.state.outgoing()));
        }
        if !change.notifications.is_empty() {
            let mut upserted = Vec::new();
            let mut removed = Vec::new();
            for id in &change.notifications {
                match self.state.notification(*id) {
                    Some(notification) => upserted.push(notification.clone()),
                    None => removed.push(*id),
                }
            }
            self.emit(ClientEvent::NotificationsChanged {
                upserted,
                removed,
                unread: self.state.unread_notifications(),
            });
        }
        if change.stats_changed {
            self.emit(ClientEvent::StatsChanged(self.state.stats()));
        }
        for id in change.recheck {
            let requests = Arc::clone(&self.requests);
            self.tasks.spawn(async move {
                let result = requests.get_message(id).await;
                Completion::Recheck { id, result }
            });
        }
        if change.stats_stale {
            debug!("sync: stats cannot be adjusted locally, refreshing");
            self.refresh_stats(None);
        }
    }
}

pub struct InboxSync;

impl InboxSync {
    /// Opens a session against the configured server with the websocket
    /// transport and no warm-start mirror.
    pub async fn start(config: SyncConfig, session: Session) -> Result<InboxHandle, SyncError> {
        Self::start_with_dependencies(config, session, Arc::new(WsConnector), None).await
    }

    pub async fn start_with_dependencies(
        config: SyncConfig,
        session: Session,
        connector: Arc<dyn ChannelConnector>,
        mirror: Option<SharedCacheMirror>,
    ) -> Result<InboxHandle, SyncError> {
        config.validate()?;
        let cancel = CancellationToken::new();

        let mut requests = RequestLayer::new(&config, Some(session.token.clone()), cancel.child_token())?;
        if let Some(mirror) = mirror {
            requests = requests.with_mirror(mirror);
        }
        let requests = Arc::new(requests);
        requests.warm_start().await;

        let push_url = config.push_url(session.user_id, &session.token)?;
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let channel = RealtimeChannel::new(
            config.realtime,
            push_url,
            session.user_id,
            connector,
            notice_tx,
            cancel.clone(),
        );
        let connection = channel.watch_state();

        let (events, _) = broadcast::channel(config.event_buffer);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let synchronizer = Synchronizer {
            state: InboxState::new(session.user_id),
            clock: LogicalClock::default(),
            config,
            requests: Arc::clone(&requests),
            channel,
            events: events.clone(),
            tasks: JoinSet::new(),
            queue: RequestQueue::default(),
            replies: HashMap::new(),
            stats_waiters: Vec::new(),
            stats_in_flight: false,
            stats_rerun: false,
            stats_epoch: 0,
            connected_once: false,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(synchronizer.run(command_rx, notice_rx));

        Ok(InboxHandle {
            user_id: session.user_id,
            commands: command_tx,
            events,
            requests,
            connection,
            cancel,
            task: Arc::new(Mutex::new(Some(task))),
        })
    }
}

/// Cheap to clone; every clone drives the same session.
#[derive(Clone)]
pub struct InboxHandle {
    user_id: UserId,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ClientEvent>,
    requests: Arc<RequestLayer>,
    connection: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl InboxHandle {
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, ActionError> {
        if self.cancel.is_cancelled() {
            return Err(ActionError::Closed);
        }
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| ActionError::Closed)?;
        answer.await.map_err(|_| ActionError::Closed)?
    }

    async fn submit(&self, action: Action) -> Result<(), ActionError> {
        self.call(|reply| Command::Submit { action, reply }).await
    }

    pub async fn load_folder(&self, folder: Folder, page: u32) -> Result<Page<Message>, ActionError> {
        let mut query = ListQuery::first_page(folder);
        query.page = page.max(1);
        self.load(query).await
    }

    pub async fn load(&self, query: ListQuery) -> Result<Page<Message>, ActionError> {
        self.call(|reply| Command::Load { query, reply }).await
    }

    pub async fn load_notifications(
        &self,
        query: NotificationQuery,
    ) -> Result<Page<Notification>, ActionError> {
        self.call(|reply| Command::LoadNotifications { query, reply })
            .await
    }

    pub async fn refresh_stats(&self) -> Result<Stats, ActionError> {
        self.call(|reply| Command::RefreshStats { reply }).await
    }

    /// Resolves once the server has settled the send. The outbox shows the
    /// draft right away.
    pub async fn send_message(&self, draft: NewMessage) -> Result<(), ActionError> {
        self.submit(Action::Send {
            local_id: Uuid::new_v4(),
            draft,
        })
        .await
    }

    pub async fn mark_read(&self, id: MessageId, is_read: bool) -> Result<(), ActionError> {
        self.update(id, MessagePatch::read(is_read)).await
    }

    pub async fn set_starred(&self, id: MessageId, is_starred: bool) -> Result<(), ActionError> {
        self.update(id, MessagePatch::starred(is_starred)).await
    }

    pub async fn set_archived(&self, id: MessageId, is_archived: bool) -> Result<(), ActionError> {
        self.update(id, MessagePatch::archived(is_archived)).await
    }

    pub async fn update(&self, id: MessageId, patch: MessagePatch) -> Result<(), ActionError> {
        self.submit(Action::Update { id, patch }).await
    }

    pub async fn delete_message(&self, id: MessageId) -> Result<(), ActionError> {
        self.submit(Action::Delete { id }).await
    }

    pub async fn bulk_update(
        &self,
        ids: Vec<MessageId>,
        patch: MessagePatch,
    ) -> Result<(), ActionError> {
        self.submit(Action::BulkUpdate { ids, patch }).await
    }

    pub async fn mark_notification_read(&self, id: NotificationId) -> Result<(), ActionError> {
        self.submit(Action::MarkNotificationRead { id }).await
    }

    pub async fn snapshot(&self) -> Result<InboxSnapshot, ActionError> {
        if self.cancel.is_cancelled() {
            return Err(ActionError::Closed);
        }
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(Command::Snapshot { reply })
            .await
            .map_err(|_| ActionError::Closed)?;
        answer.await.map_err(|_| ActionError::Closed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Like [`subscribe`](Self::subscribe), skipping over events lost to a
    /// slow consumer.
    pub fn event_stream(&self) -> impl Stream<Item = ClientEvent> + Send + 'static {
        BroadcastStream::new(self.events.subscribe()).filter_map(|event| async move {
            match event {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "sync: event consumer lagging, events dropped");
                    None
                }
            }
        })
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    /// Starts the push channel again, e.g. after `ConnectionLost`.
    pub async fn connect(&self) -> Result<(), ActionError> {
        if self.cancel.is_cancelled() {
            return Err(ActionError::Closed);
        }
        self.commands
            .send(Command::Connect)
            .await
            .map_err(|_| ActionError::Closed)
    }

    /// Applies to the next request and the next channel connection attempt.
    pub async fn set_token(&self, token: impl Into<String>) -> Result<(), ActionError> {
        let token = token.into();
        self.requests.set_token(token.clone()).await;
        if self.cancel.is_cancelled() {
            return Err(ActionError::Closed);
        }
        self.commands
            .send(Command::SetToken { token })
            .await
            .map_err(|_| ActionError::Closed)
    }

    /// Stops everything the session started. Outstanding calls resolve with
    /// [`ActionError::Closed`] and no event is emitted afterwards.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                error!(error = %err, "sync: synchronizer task failed");
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/synchronizer_tests.rs"]
mod tests;
