use super::*;
use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        atomic::{AtomicI64, AtomicU32, AtomicUsize, Ordering},
        Mutex as StdMutex,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::Utc;
use futures::{channel::mpsc as wire, SinkExt};
use serde_json::json;
use shared::{
    domain::Participant,
    protocol::{BulkUpdateResponse, Pagination},
};
use tokio::{net::TcpListener, sync::broadcast::error::TryRecvError, sync::Notify, time::timeout};
use url::Url;

use crate::{
    config::{CacheTtls, RealtimeConfig, ReconnectPolicy, RequestConfig, RetryPolicy},
    error::TransportError,
    realtime::{ChannelIo, Frame},
};

const ME: UserId = UserId(1);
const ANA: UserId = UserId(2);
const TOKEN: &str = "s3cret";
const PATIENCE: Duration = Duration::from_secs(5);

fn person(id: UserId) -> Participant {
    Participant {
        id,
        display_name: format!("user {}", id.0),
        email: None,
        avatar_url: None,
    }
}

fn incoming(id: i64, is_read: bool) -> Message {
    let created = Utc::now() - chrono::Duration::minutes(60 - id);
    Message {
        id: MessageId(id),
        sender: person(ANA),
        recipient: person(ME),
        subject: format!("subject {id}"),
        body: "hello".into(),
        is_read,
        is_starred: false,
        is_archived: false,
        created_at: created,
        updated_at: created,
    }
}

/// In-memory inbox server. Routes named in `failing` answer 422; routes
/// named in `held` wait for `gate` after signalling `reached`.
#[derive(Default)]
struct MockInbox {
    messages: StdMutex<BTreeMap<i64, Message>>,
    failing: StdMutex<HashSet<String>>,
    held: StdMutex<HashSet<String>>,
    gate: Notify,
    reached: Notify,
    stats_hits: AtomicUsize,
    bulk_hits: AtomicUsize,
    next_id: AtomicI64,
}

impl MockInbox {
    fn with_messages(messages: Vec<Message>) -> Arc<Self> {
        let inbox = Self {
            next_id: AtomicI64::new(100),
            ..Self::default()
        };
        {
            let mut stored = inbox.messages.lock().expect("messages");
            for message in messages {
                stored.insert(message.id.0, message);
            }
        }
        Arc::new(inbox)
    }

    fn fail(&self, route: &str) {
        self.failing.lock().expect("failing").insert(route.into());
    }

    fn hold(&self, route: &str) {
        self.held.lock().expect("held").insert(route.into());
    }

    /// Lets the waiting request through and stops holding the route.
    fn release(&self, route: &str) {
        self.held.lock().expect("held").remove(route);
        self.gate.notify_one();
    }

    fn recount(&self) -> Stats {
        Stats::recount(self.messages.lock().expect("messages").values(), ME)
    }

    async fn pass(&self, route: &str) -> bool {
        let held = self.held.lock().expect("held").contains(route);
        if held {
            self.reached.notify_one();
            self.gate.notified().await;
        }
        !self.failing.lock().expect("failing").contains(route)
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map_or(false, |value| value == format!("Bearer {TOKEN}"))
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"code": "token_expired", "message": "token expired"})),
    )
        .into_response()
}

fn rejected() -> Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(json!({"code": "rejected", "message": "not allowed"})),
    )
        .into_response()
}

async fn list(State(inbox): State<Arc<MockInbox>>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let items: Vec<Message> = inbox
        .messages
        .lock()
        .expect("messages")
        .values()
        .filter(|message| message.in_folder(Folder::Inbox, ME))
        .cloned()
        .collect();
    let total = items.len() as u64;
    Json(Page {
        items,
        pagination: Pagination {
            page: 1,
            per_page: 20,
            total,
            pages: 1,
            has_next: false,
            has_prev: false,
        },
    })
    .into_response()
}

async fn stats(State(inbox): State<Arc<MockInbox>>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    inbox.stats_hits.fetch_add(1, Ordering::SeqCst);
    // answered as counted, even if the inbox changes while held
    let counted = inbox.recount();
    if !inbox.pass("stats").await {
        return rejected();
    }
    Json(counted).into_response()
}

async fn get_one(Path(id): Path<i64>, State(inbox): State<Arc<MockInbox>>) -> Response {
    match inbox.messages.lock().expect("messages").get(&id) {
        Some(message) => Json(message.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn patch_message(
    Path(id): Path<i64>,
    State(inbox): State<Arc<MockInbox>>,
    Json(patch): Json<MessagePatch>,
) -> Response {
    if !inbox.pass(&format!("patch:{id}")).await {
        return rejected();
    }
    let mut messages = inbox.messages.lock().expect("messages");
    match messages.get_mut(&id) {
        Some(message) => {
            message.apply_patch(&patch);
            message.updated_at = Utc::now();
            Json(message.clone()).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn delete_message(Path(id): Path<i64>, State(inbox): State<Arc<MockInbox>>) -> Response {
    if !inbox.pass(&format!("delete:{id}")).await {
        return rejected();
    }
    match inbox.messages.lock().expect("messages").remove(&id) {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn bulk(
    State(inbox): State<Arc<MockInbox>>,
    Json(request): Json<BulkUpdateRequest>,
) -> Json<BulkUpdateResponse> {
    inbox.bulk_hits.fetch_add(1, Ordering::SeqCst);
    let mut messages = inbox.messages.lock().expect("messages");
    let mut updated_count = 0;
    for id in &request.ids {
        if let Some(message) = messages.get_mut(&id.0) {
            message.apply_patch(&request.updates);
            message.updated_at = Utc::now();
            updated_count += 1;
        }
    }
    Json(BulkUpdateResponse { updated_count })
}

async fn create(State(inbox): State<Arc<MockInbox>>, Json(draft): Json<NewMessage>) -> Response {
    if !inbox.pass("post").await {
        return rejected();
    }
    let id = inbox.next_id.fetch_add(1, Ordering::SeqCst);
    let now = Utc::now();
    let message = Message {
        id: MessageId(id),
        sender: person(ME),
        recipient: person(draft.recipient_id),
        subject: draft.subject,
        body: draft.body,
        is_read: true,
        is_starred: false,
        is_archived: false,
        created_at: now,
        updated_at: now,
    };
    inbox
        .messages
        .lock()
        .expect("messages")
        .insert(id, message.clone());
    (StatusCode::CREATED, Json(message)).into_response()
}

async fn spawn_api(inbox: Arc<MockInbox>) -> Result<String> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = Router::new()
        .route("/api/messages", get(list).post(create))
        .route("/api/messages/stats", get(stats))
        .route("/api/messages/bulk", post(bulk))
        .route(
            "/api/messages/:id",
            get(get_one).patch(patch_message).delete(delete_message),
        )
        .with_state(inbox);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("http://{addr}/api"))
}

/// Server half of one accepted push connection.
struct PushServer {
    to_client: wire::UnboundedSender<Result<Frame, TransportError>>,
    _from_client: wire::UnboundedReceiver<Frame>,
}

impl PushServer {
    fn push(&self, kind: &str, data: serde_json::Value) {
        let frame = json!({
            "type": kind,
            "data": data,
            "timestamp": Utc::now().to_rfc3339(),
        });
        self.to_client
            .unbounded_send(Ok(Frame::Text(frame.to_string())))
            .expect("client stream open");
    }
}

struct ScriptedConnector {
    refusals: AtomicU32,
    attempts: AtomicU32,
    servers: mpsc::UnboundedSender<PushServer>,
}

impl ScriptedConnector {
    fn new(refusals: u32) -> (Arc<Self>, mpsc::UnboundedReceiver<PushServer>) {
        let (servers, server_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            refusals: AtomicU32::new(refusals),
            attempts: AtomicU32::new(0),
            servers,
        });
        (connector, server_rx)
    }
}

#[async_trait]
impl ChannelConnector for ScriptedConnector {
    async fn connect(&self, _url: &Url) -> Result<ChannelIo, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Connect("connection refused".into()));
        }
        let (to_client, client_rx) = wire::unbounded();
        let (client_tx, from_client) = wire::unbounded();
        let _ = self.servers.send(PushServer {
            to_client,
            _from_client: from_client,
        });
        Ok(ChannelIo {
            sink: Box::pin(client_tx.sink_map_err(|err| TransportError::Send(err.to_string()))),
            stream: Box::pin(client_rx),
        })
    }
}

fn test_config(api_base_url: &str) -> SyncConfig {
    SyncConfig {
        api_base_url: api_base_url.to_string(),
        ws_base_url: None,
        request: RequestConfig {
            timeout_ms: 2_000,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 10,
                max_delay_ms: 50,
            },
        },
        cache: CacheTtls::default(),
        realtime: RealtimeConfig {
            heartbeat_interval_ms: 60_000,
            max_missed_acks: 3,
            connect_timeout_ms: 1_000,
            reconnect: ReconnectPolicy {
                max_attempts: 3,
                base_delay_ms: 10,
                max_delay_ms: 50,
            },
        },
        event_buffer: 256,
    }
}

async fn start_session(
    api_base_url: &str,
    connector: Arc<ScriptedConnector>,
    token: &str,
) -> (InboxHandle, broadcast::Receiver<ClientEvent>) {
    let handle = InboxSync::start_with_dependencies(
        test_config(api_base_url),
        Session {
            user_id: ME,
            token: token.into(),
        },
        connector,
        None,
    )
    .await
    .expect("session starts");
    let events = handle.subscribe();
    (handle, events)
}

async fn wait_for<T>(
    events: &mut broadcast::Receiver<ClientEvent>,
    mut pick: impl FnMut(&ClientEvent) -> Option<T>,
) -> T {
    timeout(PATIENCE, async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(&event) {
                        return found;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("event in time")
}

fn drain(events: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut seen = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => seen.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return seen,
        }
    }
}

async fn wait_snapshot(handle: &InboxHandle, mut done: impl FnMut(&InboxSnapshot) -> bool) -> InboxSnapshot {
    timeout(PATIENCE, async {
        loop {
            let snapshot = handle.snapshot().await.expect("snapshot");
            if done(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("state settles in time")
}

async fn wait_state(handle: &InboxHandle, wanted: ConnectionState) {
    let mut watch = handle.watch_connection();
    timeout(PATIENCE, async {
        while *watch.borrow_and_update() != wanted {
            watch.changed().await.expect("channel alive");
        }
    })
    .await
    .expect("connection state in time");
}

#[tokio::test]
async fn push_and_failed_intent_keep_unread_count_consistent() {
    let inbox = MockInbox::with_messages(vec![
        incoming(1, false),
        incoming(2, false),
        incoming(3, false),
    ]);
    inbox.fail("patch:2");
    let api = spawn_api(Arc::clone(&inbox)).await.expect("api");
    let (connector, mut servers) = ScriptedConnector::new(0);
    let (handle, mut events) = start_session(&api, connector, TOKEN).await;

    let page = handle.load_folder(Folder::Inbox, 1).await.expect("inbox");
    assert_eq!(page.items.len(), 3);
    assert_eq!(handle.refresh_stats().await.expect("stats").unread_count, 3);

    let server = timeout(PATIENCE, servers.recv())
        .await
        .expect("connected in time")
        .expect("push server");
    let mut read_elsewhere = incoming(1, true);
    read_elsewhere.updated_at = Utc::now();
    server.push(
        "message_updated",
        serde_json::to_value(&read_elsewhere).expect("json"),
    );
    wait_for(&mut events, |event| match event {
        ClientEvent::MessagesChanged { upserted, .. } => upserted
            .iter()
            .any(|message| message.id == MessageId(1) && message.is_read)
            .then_some(()),
        _ => None,
    })
    .await;
    let snapshot = handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.stats.unread_count, 2);

    let err = handle
        .mark_read(MessageId(2), true)
        .await
        .expect_err("server rejects the change");
    assert_eq!(err, ActionError::Failed);
    assert_eq!(err.to_string(), "action failed, please retry");
    let (kind, error) = wait_for(&mut events, |event| match event {
        ClientEvent::ActionFailed { kind, error, .. } => Some((*kind, error.clone())),
        _ => None,
    })
    .await;
    assert_eq!(kind, ActionKind::Update);
    assert_eq!(error, ActionError::Failed);

    let snapshot = handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.stats.unread_count, 2);
    assert!(snapshot.message(MessageId(1)).expect("a").is_read);
    assert!(!snapshot.message(MessageId(2)).expect("b").is_read);
    assert_eq!(snapshot.pending_ops, 0);
    handle.shutdown().await;
}

#[tokio::test]
async fn bulk_update_emits_a_single_stats_change() {
    let inbox = MockInbox::with_messages(vec![
        incoming(1, false),
        incoming(2, false),
        incoming(3, false),
    ]);
    let api = spawn_api(Arc::clone(&inbox)).await.expect("api");
    let (connector, _servers) = ScriptedConnector::new(0);
    let (handle, mut events) = start_session(&api, connector, TOKEN).await;
    handle.load_folder(Folder::Inbox, 1).await.expect("inbox");
    handle.refresh_stats().await.expect("stats");
    wait_state(&handle, ConnectionState::Connected).await;
    drain(&mut events);

    handle
        .bulk_update(
            vec![MessageId(1), MessageId(2), MessageId(3)],
            MessagePatch::read(true),
        )
        .await
        .expect("bulk update");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let seen = drain(&mut events);
    let stats: Vec<Stats> = seen
        .iter()
        .filter_map(|event| match event {
            ClientEvent::StatsChanged(stats) => Some(*stats),
            _ => None,
        })
        .collect();
    assert_eq!(stats.len(), 1, "events: {seen:?}");
    assert_eq!(stats[0].unread_count, 0);
    assert_eq!(inbox.bulk_hits.load(Ordering::SeqCst), 1);

    // empty selection never reaches the server
    handle
        .bulk_update(Vec::new(), MessagePatch::archived(true))
        .await
        .expect("empty bulk");
    assert_eq!(inbox.bulk_hits.load(Ordering::SeqCst), 1);
    handle.shutdown().await;
}

#[tokio::test]
async fn pushed_deletion_wins_over_failed_local_delete() {
    let inbox = MockInbox::with_messages(vec![incoming(1, false), incoming(2, false)]);
    inbox.fail("delete:1");
    inbox.hold("delete:1");
    let api = spawn_api(Arc::clone(&inbox)).await.expect("api");
    let (connector, mut servers) = ScriptedConnector::new(0);
    let (handle, mut events) = start_session(&api, connector, TOKEN).await;
    handle.load_folder(Folder::Inbox, 1).await.expect("inbox");
    handle.refresh_stats().await.expect("stats");
    let server = timeout(PATIENCE, servers.recv())
        .await
        .expect("connected in time")
        .expect("push server");

    let deleting = tokio::spawn({
        let handle = handle.clone();
        async move { handle.delete_message(MessageId(1)).await }
    });
    timeout(PATIENCE, inbox.reached.notified())
        .await
        .expect("delete reached the server");

    server.push("message_deleted", json!({"message_id": 1}));
    let mut removals = 0;
    wait_for(&mut events, |event| match event {
        ClientEvent::MessagesChanged { removed, .. } if removed.contains(&MessageId(1)) => {
            removals += 1;
            (removals == 2).then_some(())
        }
        _ => None,
    })
    .await;
    inbox.gate.notify_one();

    let result = timeout(PATIENCE, deleting)
        .await
        .expect("delete settles")
        .expect("task joins");
    assert_eq!(result, Ok(()));
    let failures = drain(&mut events)
        .into_iter()
        .filter(|event| matches!(event, ClientEvent::ActionFailed { .. }))
        .count();
    assert_eq!(failures, 0);

    let snapshot = handle.snapshot().await.expect("snapshot");
    assert!(snapshot.message(MessageId(1)).is_none());
    assert_eq!(snapshot.stats.inbox_count, 1);
    assert_eq!(snapshot.stats.unread_count, 1);
    handle.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_pending_calls_and_silences_events() {
    let inbox = MockInbox::with_messages(vec![incoming(1, false), incoming(2, false)]);
    inbox.hold("patch:1");
    let api = spawn_api(Arc::clone(&inbox)).await.expect("api");
    let (connector, _servers) = ScriptedConnector::new(0);
    let (handle, mut events) = start_session(&api, connector, TOKEN).await;
    handle.load_folder(Folder::Inbox, 1).await.expect("inbox");
    wait_state(&handle, ConnectionState::Connected).await;

    let marking = tokio::spawn({
        let handle = handle.clone();
        async move { handle.mark_read(MessageId(1), true).await }
    });
    timeout(PATIENCE, inbox.reached.notified())
        .await
        .expect("patch reached the server");

    timeout(PATIENCE, handle.shutdown())
        .await
        .expect("shutdown completes");
    let result = timeout(PATIENCE, marking)
        .await
        .expect("call resolves")
        .expect("task joins");
    assert_eq!(result, Err(ActionError::Closed));
    assert_eq!(handle.connection_state(), ConnectionState::Disconnected);

    drain(&mut events);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(drain(&mut events).is_empty(), "no events after shutdown");

    assert_eq!(
        handle.mark_read(MessageId(2), true).await,
        Err(ActionError::Closed)
    );
    assert!(handle.snapshot().await.is_err());
}

#[tokio::test]
async fn reconnect_refreshes_stats_missed_while_offline() {
    let inbox = MockInbox::with_messages(vec![incoming(1, false), incoming(2, false)]);
    let api = spawn_api(Arc::clone(&inbox)).await.expect("api");
    let (connector, mut servers) = ScriptedConnector::new(0);
    let (handle, mut events) = start_session(&api, connector, TOKEN).await;
    assert_eq!(handle.refresh_stats().await.expect("stats").inbox_count, 2);
    let first = timeout(PATIENCE, servers.recv())
        .await
        .expect("connected in time")
        .expect("push server");
    wait_state(&handle, ConnectionState::Connected).await;
    let hits_before = inbox.stats_hits.load(Ordering::SeqCst);

    // arrives while the channel is down, so no push is ever seen
    inbox
        .messages
        .lock()
        .expect("messages")
        .insert(3, incoming(3, false));
    drop(first);

    wait_for(&mut events, |event| {
        matches!(
            event,
            ClientEvent::ConnectionStateChanged(ConnectionState::Reconnecting)
        )
        .then_some(())
    })
    .await;
    let refreshed = wait_for(&mut events, |event| match event {
        ClientEvent::StatsChanged(stats) if stats.inbox_count == 3 => Some(*stats),
        _ => None,
    })
    .await;
    assert_eq!(refreshed.unread_count, 3);
    assert!(inbox.stats_hits.load(Ordering::SeqCst) > hits_before);
    assert_eq!(handle.connection_state(), ConnectionState::Connected);
    handle.shutdown().await;
}

#[tokio::test]
async fn exhausted_reconnects_report_connection_lost_until_manual_connect() {
    let inbox = MockInbox::with_messages(Vec::new());
    let api = spawn_api(Arc::clone(&inbox)).await.expect("api");
    let (connector, _servers) = ScriptedConnector::new(3);
    let (handle, mut events) = start_session(&api, Arc::clone(&connector), TOKEN).await;

    wait_for(&mut events, |event| {
        matches!(event, ClientEvent::ConnectionLost).then_some(())
    })
    .await;
    assert_eq!(handle.connection_state(), ConnectionState::Failed);
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);

    handle.connect().await.expect("connect");
    wait_state(&handle, ConnectionState::Connected).await;
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 4);
    handle.shutdown().await;
}

#[tokio::test]
async fn sent_message_shows_in_outbox_until_confirmed() {
    let inbox = MockInbox::with_messages(Vec::new());
    inbox.hold("post");
    let api = spawn_api(Arc::clone(&inbox)).await.expect("api");
    let (connector, _servers) = ScriptedConnector::new(0);
    let (handle, mut events) = start_session(&api, connector, TOKEN).await;
    assert_eq!(handle.refresh_stats().await.expect("stats").sent_count, 0);

    let sending = tokio::spawn({
        let handle = handle.clone();
        async move {
            handle
                .send_message(NewMessage {
                    recipient_id: ANA,
                    subject: "lunch?".into(),
                    body: "noon works".into(),
                })
                .await
        }
    });
    let outbox = wait_for(&mut events, |event| match event {
        ClientEvent::OutboxChanged(outbox) if !outbox.is_empty() => Some(outbox.clone()),
        _ => None,
    })
    .await;
    assert_eq!(outbox[0].draft.subject, "lunch?");
    let snapshot = handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.stats.sent_count, 1);

    timeout(PATIENCE, inbox.reached.notified())
        .await
        .expect("send reached the server");
    inbox.gate.notify_one();
    let result = timeout(PATIENCE, sending)
        .await
        .expect("send settles")
        .expect("task joins");
    assert_eq!(result, Ok(()));

    let snapshot = handle.snapshot().await.expect("snapshot");
    assert!(snapshot.outgoing.is_empty());
    assert_eq!(snapshot.stats.sent_count, 1);
    assert_eq!(snapshot.folder(Folder::Sent).len(), 1);
    handle.shutdown().await;
}

#[tokio::test]
async fn expired_token_is_reported_and_recoverable() {
    let inbox = MockInbox::with_messages(vec![incoming(1, false)]);
    let api = spawn_api(Arc::clone(&inbox)).await.expect("api");
    let (connector, _servers) = ScriptedConnector::new(0);
    let (handle, mut events) = start_session(&api, connector, "expired").await;

    let err = handle
        .load_folder(Folder::Inbox, 1)
        .await
        .expect_err("token refused");
    assert_eq!(err, ActionError::AuthExpired);
    wait_for(&mut events, |event| {
        matches!(event, ClientEvent::AuthExpired).then_some(())
    })
    .await;

    handle.set_token(TOKEN).await.expect("token updated");
    let page = handle.load_folder(Folder::Inbox, 1).await.expect("inbox");
    assert_eq!(page.items.len(), 1);
    handle.shutdown().await;
}

#[tokio::test]
async fn push_during_stats_refresh_is_not_overwritten_by_the_older_answer() {
    let inbox = MockInbox::with_messages(vec![
        incoming(1, false),
        incoming(2, false),
        incoming(3, false),
    ]);
    let api = spawn_api(Arc::clone(&inbox)).await.expect("api");
    let (connector, mut servers) = ScriptedConnector::new(0);
    let (handle, mut events) = start_session(&api, connector, TOKEN).await;
    handle.load_folder(Folder::Inbox, 1).await.expect("inbox");
    assert_eq!(handle.refresh_stats().await.expect("stats").unread_count, 3);
    let server = timeout(PATIENCE, servers.recv())
        .await
        .expect("connected in time")
        .expect("push server");

    inbox.hold("stats");
    let refreshing = tokio::spawn({
        let handle = handle.clone();
        async move { handle.refresh_stats().await }
    });
    timeout(PATIENCE, inbox.reached.notified())
        .await
        .expect("stats counted with three unread");

    let mut read_elsewhere = incoming(1, true);
    read_elsewhere.updated_at = Utc::now();
    inbox
        .messages
        .lock()
        .expect("messages")
        .insert(1, read_elsewhere.clone());
    server.push(
        "message_updated",
        serde_json::to_value(&read_elsewhere).expect("json"),
    );
    wait_for(&mut events, |event| match event {
        ClientEvent::MessagesChanged { upserted, .. } => upserted
            .iter()
            .any(|message| message.id == MessageId(1) && message.is_read)
            .then_some(()),
        _ => None,
    })
    .await;
    assert_eq!(handle.snapshot().await.expect("snapshot").stats.unread_count, 2);

    let hits_before = inbox.stats_hits.load(Ordering::SeqCst);
    inbox.release("stats");
    let answered = timeout(PATIENCE, refreshing)
        .await
        .expect("refresh settles")
        .expect("task joins")
        .expect("stats");
    assert_eq!(answered.unread_count, 2);
    assert!(inbox.stats_hits.load(Ordering::SeqCst) > hits_before, "outdated answer refetched");

    let snapshot = handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.stats, inbox.recount());
    assert_eq!(
        snapshot.stats,
        Stats::recount(snapshot.messages.iter(), ME),
        "counters match the visible view"
    );
    handle.shutdown().await;
}

#[tokio::test]
async fn partially_applied_bulk_update_is_rechecked_against_the_server() {
    let inbox = MockInbox::with_messages(vec![incoming(1, false), incoming(2, false)]);
    let api = spawn_api(Arc::clone(&inbox)).await.expect("api");
    let (connector, _servers) = ScriptedConnector::new(0);
    let (handle, mut events) = start_session(&api, connector, TOKEN).await;
    handle.load_folder(Folder::Inbox, 1).await.expect("inbox");
    assert_eq!(handle.refresh_stats().await.expect("stats").unread_count, 2);

    // gone on the server without a push reaching us
    inbox.messages.lock().expect("messages").remove(&2);
    handle
        .bulk_update(vec![MessageId(1), MessageId(2)], MessagePatch::read(true))
        .await
        .expect("bulk update");
    assert_eq!(inbox.bulk_hits.load(Ordering::SeqCst), 1);

    wait_for(&mut events, |event| match event {
        ClientEvent::MessagesChanged { removed, .. } => {
            removed.contains(&MessageId(2)).then_some(())
        }
        _ => None,
    })
    .await;
    let snapshot = wait_snapshot(&handle, |snapshot| {
        snapshot.stats == inbox.recount()
            && snapshot
                .message(MessageId(1))
                .is_some_and(|message| message.is_read)
    })
    .await;
    assert!(snapshot.message(MessageId(1)).expect("kept").is_read);
    assert!(snapshot.message(MessageId(2)).is_none());
    assert_eq!(snapshot.stats.inbox_count, 1);
    assert_eq!(snapshot.stats.unread_count, 0);
    handle.shutdown().await;
}
