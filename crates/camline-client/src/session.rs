//! The session engine: socket ownership, decode loop, login/keepalive/
//! reconnect state machine, and orchestration of registry, bus, and
//! correlator.
//!
//! One spawned task drives socket reads, frame decode, and dispatch, so
//! message handlers never race each other or the decode loop. Timers
//! (keepalive, reconnect delay) are further tasks on the same runtime.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, Notify, RwLock, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use camline_protocol::{
    ChannelOption, FrameBuffer, LOGIN_VERSION, ListType, Message, MessageKind, Payload,
    WOPT_REDIS_JSON, encode_frame, expand_rows,
};

use crate::config::ClientConfig;
use crate::correlator::QueryCorrelator;
use crate::directory::{ExtDataResolver, HttpExtDataResolver, HttpServerDirectory, ServerDirectory};
use crate::error::{ClientError, ClientResult};
use crate::events::{EventBus, SubscriptionId};
use crate::registry::{EntityRecord, EntityRegistry};
use crate::routing::{MergeStrategy, is_transient, strategy_for};

/// Id bands the platform offsets room/group ids into.
const ID_BANDS: [i64; 5] = [
    1_000_000_000,
    400_000_000,
    300_000_000,
    200_000_000,
    100_000_000,
];

/// Converts an id that might be a room id back to a user id.
pub fn to_user_id(id: i64) -> i64 {
    for band in ID_BANDS {
        if id >= band {
            return id - band;
        }
    }
    id
}

/// Converts an id that might be a user id to a room id.
pub fn to_room_id(id: i64) -> i64 {
    if id < 100_000_000 { id + 100_000_000 } else { id }
}

/// Connection-level session state. Reset to empty on every disconnect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    /// Session id assigned by the server at login; 0 before login.
    pub session_id: i32,
    /// User id assigned at login.
    pub uid: i32,
    /// Username confirmed by the server (guests get a generated one).
    pub username: String,
    /// Whether the login handshake completed on this connection.
    pub logged_in: bool,
}

/// Stream-access context captured from a token message. URL derivation is
/// the caller's business; the engine only keeps the pieces current.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamContext {
    pub cxid: i64,
    pub token: String,
    pub vidctx: String,
}

/// Reference to a user by name or numeric id.
#[derive(Debug, Clone)]
pub enum UserRef {
    Name(String),
    Id(i64),
}

impl From<&str> for UserRef {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for UserRef {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<i64> for UserRef {
    fn from(id: i64) -> Self {
        Self::Id(id)
    }
}

struct ConnHandle {
    writer: OwnedWriteHalf,
    keepalive: Option<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

struct Inner {
    config: ClientConfig,
    directory: Arc<dyn ServerDirectory>,
    resolver: Arc<dyn ExtDataResolver>,
    registry: RwLock<EntityRegistry>,
    bus: EventBus,
    correlator: QueryCorrelator,
    session: RwLock<SessionState>,
    stream_context: RwLock<Option<StreamContext>>,
    conn: Mutex<Option<ConnHandle>>,
    login_slot: std::sync::Mutex<Option<oneshot::Sender<ClientResult<()>>>>,
    reconnect_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    manual_disconnect: AtomicBool,
    want_login: AtomicBool,
    closed: Notify,
}

/// A persistent chat client.
///
/// Cheap to clone; all clones share one session. See the crate docs for the
/// lifecycle: `connect` establishes the socket and optionally logs in,
/// unexpected closures reconnect in the background, `disconnect` stops
/// everything.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Creates a client with HTTP-backed directory and ext-data
    /// collaborators built from the config endpoints.
    pub fn new(config: ClientConfig) -> Self {
        let directory = Arc::new(HttpServerDirectory::new(
            &config.server_config_url,
            &config.server_domain,
        ));
        let resolver = Arc::new(HttpExtDataResolver::new(&config.extdata_url));
        Self::with_collaborators(config, directory, resolver)
    }

    /// Creates a client with explicit collaborator implementations.
    pub fn with_collaborators(
        config: ClientConfig,
        directory: Arc<dyn ServerDirectory>,
        resolver: Arc<dyn ExtDataResolver>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                directory,
                resolver,
                registry: RwLock::new(EntityRegistry::new()),
                bus: EventBus::new(),
                correlator: QueryCorrelator::new(),
                session: RwLock::new(SessionState::default()),
                stream_context: RwLock::new(None),
                conn: Mutex::new(None),
                login_slot: std::sync::Mutex::new(None),
                reconnect_task: std::sync::Mutex::new(None),
                manual_disconnect: AtomicBool::new(false),
                want_login: AtomicBool::new(false),
                closed: Notify::new(),
            }),
        }
    }

    /// Connects to a chat server and optionally performs the login
    /// handshake.
    ///
    /// Fails on directory/socket errors and on a rejected login; a rejected
    /// login is fatal for the attempt and is not retried. On success the
    /// background read loop (and, when logged in, the keepalive timer) is
    /// running and `Connected` has been emitted.
    pub async fn connect(&self, login: bool) -> ClientResult<()> {
        let inner = &self.inner;
        if inner.conn.lock().await.is_some() {
            return Err(ClientError::connection("already connected"));
        }
        inner.manual_disconnect.store(false, Ordering::SeqCst);
        inner.want_login.store(login, Ordering::SeqCst);

        let servers = inner.directory.chat_servers().await?;
        let host = {
            use rand::seq::IndexedRandom;
            servers
                .choose(&mut rand::rng())
                .cloned()
                .ok_or_else(|| ClientError::directory("no chat servers available"))?
        };

        info!(server = %host, port = inner.config.chat_port, "connecting to chat server");
        let stream = tokio::time::timeout(
            inner.config.connect_timeout,
            TcpStream::connect((host.as_str(), inner.config.chat_port)),
        )
        .await
        .map_err(|_| ClientError::connection(format!("connect to {host} timed out")))?
        .map_err(|e| ClientError::connection(format!("failed to connect to {host}: {e}")))?;

        let (read_half, write_half) = stream.into_split();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let login_rx = if login {
            let (tx, rx) = oneshot::channel();
            *inner.login_slot.lock().expect("login slot lock poisoned") = Some(tx);
            Some(rx)
        } else {
            None
        };

        *inner.conn.lock().await = Some(ConnHandle {
            writer: write_half,
            keepalive: None,
            shutdown: shutdown_tx,
        });

        let reader = inner.clone();
        tokio::spawn(read_loop(reader, read_half, shutdown_rx));

        inner
            .bus
            .emit(MessageKind::Connected, &Message::synthetic(MessageKind::Connected));

        if let Some(login_rx) = login_rx {
            tx_cmd(
                inner,
                MessageKind::Login,
                0,
                LOGIN_VERSION,
                0,
                Payload::Text(inner.config.login_payload()),
            )
            .await?;

            match login_rx.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    // Fatal for this attempt; close without reconnecting.
                    inner.manual_disconnect.store(true, Ordering::SeqCst);
                    close_connection(inner).await;
                    return Err(e);
                }
                Err(_) => return Err(ClientError::Disconnected),
            }
        }

        let keepalive = spawn_keepalive(inner.clone());
        match inner.conn.lock().await.as_mut() {
            Some(conn) => conn.keepalive = Some(keepalive),
            // Lost the connection before connect() returned.
            None => keepalive.abort(),
        }

        Ok(())
    }

    /// Disconnects and suppresses automatic reconnection. Safe to call when
    /// not connected (it also cancels a pending reconnect).
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.manual_disconnect.store(true, Ordering::SeqCst);
        if let Some(task) = inner
            .reconnect_task
            .lock()
            .expect("reconnect slot lock poisoned")
            .take()
        {
            task.abort();
        }
        let conn = inner.conn.lock().await;
        match conn.as_ref() {
            Some(conn) => {
                let _ = conn.shutdown.send(true);
            }
            None => {
                // Nothing to close; don't poison the next connect.
                inner.manual_disconnect.store(false, Ordering::SeqCst);
                inner.closed.notify_waiters();
            }
        }
    }

    /// Connects and parks until a caller-initiated disconnect. Unexpected
    /// closures keep reconnecting in the background.
    pub async fn run(&self, login: bool) -> ClientResult<()> {
        let closed = self.inner.closed.notified();
        tokio::pin!(closed);
        closed.as_mut().enable();
        self.connect(login).await?;
        closed.await;
        Ok(())
    }

    /// Transmits a raw command frame.
    pub async fn send_command(
        &self,
        kind: MessageKind,
        to: i32,
        arg1: i32,
        arg2: i32,
        payload: impl Into<Payload>,
    ) -> ClientResult<()> {
        tx_cmd(&self.inner, kind, to, arg1, arg2, payload.into()).await
    }

    /// Sends chat to the given entity's room.
    pub async fn send_room_message(&self, id: i64, text: impl Into<String>) -> ClientResult<()> {
        self.send_command(
            MessageKind::Cmesg,
            to_room_id(id) as i32,
            0,
            0,
            Payload::Text(text.into()),
        )
        .await
    }

    /// Sends a private message to the given user.
    pub async fn send_private_message(&self, id: i64, text: impl Into<String>) -> ClientResult<()> {
        self.send_command(
            MessageKind::Pmesg,
            to_user_id(id) as i32,
            0,
            0,
            Payload::Text(text.into()),
        )
        .await
    }

    /// Joins the given entity's room.
    pub async fn join_room(&self, id: i64) -> ClientResult<()> {
        self.send_command(
            MessageKind::JoinChan,
            0,
            to_room_id(id) as i32,
            ChannelOption::Join as i32,
            Payload::None,
        )
        .await
    }

    /// Leaves the given entity's room.
    pub async fn leave_room(&self, id: i64) -> ClientResult<()> {
        self.send_command(
            MessageKind::JoinChan,
            0,
            to_room_id(id) as i32,
            ChannelOption::Part as i32,
            Payload::None,
        )
        .await
    }

    /// Queries the server for a user's status and details.
    ///
    /// Resolves to `None` when the user does not exist. Fails with
    /// [`ClientError::Disconnected`] if the connection is torn down while
    /// the query is outstanding.
    pub async fn query_user(&self, user: impl Into<UserRef>) -> ClientResult<Option<Value>> {
        let inner = &self.inner;
        let id = inner.correlator.allocate();
        let pending = inner.correlator.register(id);

        let sent = match user.into() {
            UserRef::Name(name) => {
                self.send_command(MessageKind::UsernameLookup, 0, id as i32, 0, Payload::Text(name))
                    .await
            }
            UserRef::Id(uid) => {
                self.send_command(MessageKind::UsernameLookup, 0, id as i32, uid as i32, Payload::None)
                    .await
            }
        };
        if let Err(e) = sent {
            inner.correlator.discard(id);
            return Err(e);
        }

        pending.wait().await
    }

    /// Subscribes a handler to a message kind.
    pub fn on(
        &self,
        kind: MessageKind,
        handler: impl Fn(&Message) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.inner.bus.on(kind, handler)
    }

    /// Unsubscribes a handler.
    pub fn off(&self, kind: MessageKind, id: SubscriptionId) -> bool {
        self.inner.bus.off(kind, id)
    }

    /// Current connection-level session state.
    pub async fn session_state(&self) -> SessionState {
        self.inner.session.read().await.clone()
    }

    /// Stream-access context from the most recent token message, if any.
    pub async fn stream_context(&self) -> Option<StreamContext> {
        self.inner.stream_context.read().await.clone()
    }

    /// Returns true while a socket is open.
    pub async fn is_connected(&self) -> bool {
        self.inner.conn.lock().await.is_some()
    }

    /// Snapshot of a single entity record.
    pub async fn entity(&self, id: i64) -> Option<EntityRecord> {
        self.inner.registry.read().await.get(id).cloned()
    }

    /// Runs a closure against the registry without cloning it.
    pub async fn read_registry<R>(&self, f: impl FnOnce(&EntityRegistry) -> R) -> R {
        f(&*self.inner.registry.read().await)
    }
}

async fn close_connection(inner: &Arc<Inner>) {
    if let Some(conn) = inner.conn.lock().await.as_ref() {
        let _ = conn.shutdown.send(true);
    }
}

async fn tx_cmd(
    inner: &Arc<Inner>,
    kind: MessageKind,
    to: i32,
    arg1: i32,
    arg2: i32,
    payload: Payload,
) -> ClientResult<()> {
    let session_id = inner.session.read().await.session_id;
    let frame = encode_frame(session_id, kind, to, arg1, arg2, &payload)?;

    let mut conn = inner.conn.lock().await;
    let Some(conn) = conn.as_mut() else {
        return Err(ClientError::NotConnected);
    };
    conn.writer.write_all(&frame).await?;
    debug!(kind = kind.as_i32(), to, arg1, arg2, "command sent");
    Ok(())
}

fn spawn_keepalive(inner: Arc<Inner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = inner.config.keepalive_interval;
        let start = tokio::time::Instant::now() + period;
        let mut interval = tokio::time::interval_at(start, period);
        loop {
            interval.tick().await;
            if let Err(e) = tx_cmd(&inner, MessageKind::Null, 0, 0, 0, Payload::None).await {
                debug!(error = %e, "keepalive stopped");
                break;
            }
        }
    })
}

async fn read_loop(
    inner: Arc<Inner>,
    mut read_half: OwnedReadHalf,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut frames = FrameBuffer::new();
    let mut chunk = vec![0u8; 8192];

    'read: loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break 'read;
                }
            }
            result = read_half.read(&mut chunk) => match result {
                Ok(0) => {
                    debug!("server closed the connection");
                    break 'read;
                }
                Ok(n) => {
                    frames.extend(&chunk[..n]);
                    loop {
                        match frames.next_message() {
                            Ok(Some(message)) => dispatch(&inner, message).await,
                            Ok(None) => break,
                            Err(e) => {
                                // The stream cannot be resynchronized;
                                // drop the connection and let the
                                // reconnect path take over.
                                error!(error = %e, "unrecoverable framing error");
                                break 'read;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "socket read failed");
                    break 'read;
                }
            },
        }
    }

    handle_disconnected(&inner).await;
}

/// Routes one message: state merge first, then notification. Boxed so the
/// ext-data path can re-inject a synthesized message through the same
/// entry point.
fn dispatch<'a>(
    inner: &'a Arc<Inner>,
    message: Message,
) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
    Box::pin(async move {
        process(inner, &message).await;
        inner.bus.emit(message.kind, &message);
    })
}

async fn process(inner: &Arc<Inner>, message: &Message) {
    match strategy_for(message.kind) {
        MergeStrategy::Login => process_login(inner, message).await,
        MergeStrategy::EntityUpdate => process_entity_update(inner, message).await,
        MergeStrategy::TagUpdate => {
            // Oversized tag payloads arrive truncated and stay raw text;
            // those are skipped here by construction.
            let Some(entries) = message.payload.as_object() else {
                return;
            };
            let mut registry = inner.registry.write().await;
            for (key, delta) in entries {
                if let Ok(id) = key.parse::<i64>() {
                    registry.merge_tags(id, delta);
                }
            }
        }
        MergeStrategy::Bookmarks => {
            let Some(bookmarks) = message
                .payload
                .as_object()
                .and_then(|obj| obj.get("bookmarks"))
                .and_then(Value::as_array)
            else {
                return;
            };
            let mut registry = inner.registry.write().await;
            for bookmark in bookmarks {
                let (Some(fields), Some(uid)) = (
                    bookmark.as_object(),
                    bookmark.get("uid").and_then(Value::as_i64),
                ) else {
                    continue;
                };
                registry.merge(uid, fields);
            }
        }
        MergeStrategy::BulkList => process_bulk_list(inner, message).await,
        MergeStrategy::ExtData => process_extdata(inner, message).await,
        MergeStrategy::StreamContext => process_stream_context(inner, message).await,
        MergeStrategy::None => {}
    }

    // Correlated lookups resolve after the merge above so the registry is
    // already current when the waiting caller wakes. This must run for
    // every lookup response, mergeable payload or not: a non-mapping
    // payload is the "no such user" answer and resolves to `None`.
    if message.kind == MessageKind::UsernameLookup {
        let value = message
            .payload
            .as_object()
            .map(|obj| Value::Object(obj.clone()));
        inner.correlator.resolve(i64::from(message.arg1), value);
    }
}

async fn process_entity_update(inner: &Arc<Inner>, message: &Message) {
    if is_transient(message) {
        return;
    }
    let Some(fields) = message.payload.as_object() else {
        return;
    };
    let uid = fields
        .get("uid")
        .and_then(Value::as_i64)
        .filter(|uid| *uid > 0)
        .or_else(|| Some(to_user_id(i64::from(message.to))).filter(|uid| *uid > 0));
    let Some(uid) = uid else {
        return;
    };
    inner.registry.write().await.merge(uid, fields);
}

async fn process_login(inner: &Arc<Inner>, message: &Message) {
    if message.arg1 != 0 {
        warn!(status = message.arg1, "login failed");
        resolve_login(inner, Err(ClientError::Login { status: message.arg1 }));
        return;
    }

    let username = message.payload.as_text().unwrap_or_default().to_string();
    {
        let mut session = inner.session.write().await;
        session.session_id = message.to;
        session.uid = message.arg2;
        if !username.is_empty() {
            session.username = username.clone();
        }
        session.logged_in = true;
    }
    info!(
        username = %username,
        session_id = message.to,
        uid = message.arg2,
        "login handshake completed"
    );
    resolve_login(inner, Ok(()));
    inner.bus.emit(
        MessageKind::LoginComplete,
        &Message::synthetic(MessageKind::LoginComplete),
    );
}

fn resolve_login(inner: &Inner, result: ClientResult<()>) {
    if let Some(tx) = inner
        .login_slot
        .lock()
        .expect("login slot lock poisoned")
        .take()
    {
        let _ = tx.send(result);
    }
}

async fn process_bulk_list(inner: &Arc<Inner>, message: &Message) {
    if message.arg2 <= 0 {
        return;
    }
    let Some(rdata) = message.payload.as_object().and_then(|obj| obj.get("rdata")) else {
        return;
    };
    let expanded = expand_rows(rdata);

    match ListType::from_i32(message.arg2) {
        Some(
            list @ (ListType::Roommates | ListType::Cams | ListType::Friends | ListType::Ignores),
        ) => {
            let Some(rows) = expanded.as_array() else {
                return;
            };
            let mut registry = inner.registry.write().await;
            for row in rows {
                let Some(fields) = row.as_object() else {
                    continue;
                };
                let Some(uid) = fields.get("uid").and_then(Value::as_i64) else {
                    continue;
                };
                registry.merge(uid, fields);
            }
            let first_roster = list == ListType::Cams && registry.mark_models_loaded();
            let count = registry.len();
            drop(registry);

            if first_roster {
                info!(entities = count, "full roster merged");
                inner.bus.emit(
                    MessageKind::ModelsLoaded,
                    &Message::synthetic(MessageKind::ModelsLoaded),
                );
            }
        }
        Some(ListType::Tags) => {
            // The tag table arrives as a mapping and passes through the
            // list expansion unchanged.
            let Some(entries) = expanded.as_object() else {
                return;
            };
            let mut registry = inner.registry.write().await;
            for (key, delta) in entries {
                if let Ok(id) = key.parse::<i64>() {
                    registry.merge_tags(id, delta);
                }
            }
            let first_tags = registry.mark_tags_loaded();
            drop(registry);

            if first_tags {
                inner.bus.emit(
                    MessageKind::TagsLoaded,
                    &Message::synthetic(MessageKind::TagsLoaded),
                );
            }
        }
        None => {}
    }
}

async fn process_extdata(inner: &Arc<Inner>, message: &Message) {
    let session_id = inner.session.read().await.session_id;
    if message.to != session_id || message.arg2 != WOPT_REDIS_JSON {
        return;
    }
    let Some(extdata) = message.payload.as_json() else {
        return;
    };
    if extdata.get("respkey").is_none() {
        return;
    }

    let extdata = extdata.clone();
    let inner = inner.clone();
    tokio::spawn(async move {
        match inner.resolver.resolve(&extdata).await {
            Ok(contents) => {
                if let Some(synthesized) = synthesize_extdata_message(&extdata, contents) {
                    dispatch(&inner, synthesized).await;
                }
            }
            Err(e) => warn!(error = %e, "ext-data resolution failed"),
        }
    });
}

fn synthesize_extdata_message(extdata: &Value, contents: Value) -> Option<Message> {
    let msg = extdata.get("msg")?;
    let field = |name: &str| msg.get(name).and_then(Value::as_i64).unwrap_or(0) as i32;
    Some(Message {
        kind: MessageKind::from_i32(field("type")),
        from: field("from"),
        to: field("to"),
        arg1: field("arg1"),
        arg2: field("arg2"),
        payload: Payload::Json(contents),
    })
}

async fn process_stream_context(inner: &Arc<Inner>, message: &Message) {
    let Some(fields) = message.payload.as_object() else {
        return;
    };
    let (Some(cxid), Some(token), Some(ctxenc)) = (
        fields.get("cxid").and_then(Value::as_i64),
        fields.get("tkx").and_then(Value::as_str),
        fields.get("ctxenc").and_then(Value::as_str),
    ) else {
        return;
    };
    let vidctx = ctxenc.split('/').nth(1).unwrap_or(ctxenc).to_string();
    *inner.stream_context.write().await = Some(StreamContext {
        cxid,
        token: token.to_string(),
        vidctx,
    });
}

async fn handle_disconnected(inner: &Arc<Inner>) {
    match inner.conn.lock().await.take() {
        Some(conn) => {
            if let Some(keepalive) = conn.keepalive {
                keepalive.abort();
            }
        }
        // Already torn down.
        None => return,
    }

    inner.correlator.fail_all();
    inner.registry.write().await.reset();
    *inner.session.write().await = SessionState::default();
    *inner.stream_context.write().await = None;
    resolve_login(inner, Err(ClientError::Disconnected));

    let manual = inner.manual_disconnect.swap(false, Ordering::SeqCst);
    inner.bus.emit(
        MessageKind::Disconnected,
        &Message::synthetic(MessageKind::Disconnected),
    );

    if manual {
        info!("disconnected");
        inner.closed.notify_waiters();
        return;
    }

    let delay = inner.config.reconnect_delay;
    warn!(delay_secs = delay.as_secs(), "connection lost, scheduling reconnect");
    let mut task = inner
        .reconnect_task
        .lock()
        .expect("reconnect slot lock poisoned");
    let already_scheduled = task.as_ref().is_some_and(|t| !t.is_finished());
    if !already_scheduled {
        *task = Some(tokio::spawn(reconnect_loop(inner.clone())));
    }
}

/// Boxed for the same reason as [`dispatch`]: reconnecting re-enters
/// `connect`, which spawns the read loop, which lands back here.
fn reconnect_loop(inner: Arc<Inner>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        let client = Client {
            inner: inner.clone(),
        };
        // Repeat the previous attempt's login choice.
        let login = inner.want_login.load(Ordering::SeqCst);
        loop {
            tokio::time::sleep(inner.config.reconnect_delay).await;
            info!(login, "attempting reconnect");
            match client.connect(login).await {
                Ok(()) => break,
                Err(e @ ClientError::Login { .. }) => {
                    error!(error = %e, "reconnect aborted: login rejected");
                    break;
                }
                Err(e) => warn!(error = %e, "reconnect attempt failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::BoxFuture;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::net::TcpListener;

    struct StaticDirectory(Vec<String>);

    impl ServerDirectory for StaticDirectory {
        fn chat_servers(&self) -> BoxFuture<'_, ClientResult<Vec<String>>> {
            let servers = self.0.clone();
            Box::pin(async move { Ok(servers) })
        }
    }

    struct NullResolver;

    impl ExtDataResolver for NullResolver {
        fn resolve(&self, _extdata: &Value) -> BoxFuture<'_, ClientResult<Value>> {
            Box::pin(async { Err(ClientError::ExtData("unused in tests".into())) })
        }
    }

    /// Server side of one accepted client connection, with a persistent
    /// frame decoder.
    struct ServerConn {
        stream: TcpStream,
        frames: FrameBuffer,
    }

    impl ServerConn {
        fn new(stream: TcpStream) -> Self {
            Self {
                stream,
                frames: FrameBuffer::new(),
            }
        }

        async fn read_frame(&mut self) -> Message {
            loop {
                if let Some(message) = self.frames.next_message().unwrap() {
                    return message;
                }
                let mut chunk = [0u8; 1024];
                let n = self.stream.read(&mut chunk).await.unwrap();
                assert!(n > 0, "client closed while a frame was expected");
                self.frames.extend(&chunk[..n]);
            }
        }

        async fn send(
            &mut self,
            kind: MessageKind,
            to: i32,
            arg1: i32,
            arg2: i32,
            payload: &Payload,
        ) {
            let frame = encode_frame(0, kind, to, arg1, arg2, payload).unwrap();
            self.stream.write_all(&frame).await.unwrap();
        }

        async fn complete_login(&mut self) -> Message {
            let login = self.read_frame().await;
            assert_eq!(login.kind, MessageKind::Login);
            self.send(
                MessageKind::Login,
                4242,
                0,
                555,
                &Payload::Text("alice".into()),
            )
            .await;
            login
        }
    }

    fn test_client(port: u16) -> Client {
        let config = ClientConfig::new("alice", "s3cret")
            .with_chat_port(port)
            .with_reconnect_delay(Duration::from_millis(50))
            .with_connect_timeout(Duration::from_secs(5));
        Client::with_collaborators(
            config,
            Arc::new(StaticDirectory(vec!["127.0.0.1".into()])),
            Arc::new(NullResolver),
        )
    }

    async fn bind() -> (TcpListener, u16) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    /// Polls until `check` passes or the deadline expires.
    async fn wait_for(what: &str, mut check: impl AsyncFnMut() -> bool) {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[test]
    fn id_band_conversions() {
        assert_eq!(to_user_id(100_000_042), 42);
        assert_eq!(to_user_id(1_000_000_005), 5);
        assert_eq!(to_user_id(42), 42);
        assert_eq!(to_room_id(42), 100_000_042);
        assert_eq!(to_room_id(100_000_042), 100_000_042);
    }

    #[tokio::test]
    async fn login_handshake_end_to_end() {
        let (listener, port) = bind().await;
        let client = test_client(port);

        let login_complete = Arc::new(AtomicUsize::new(0));
        let counter = login_complete.clone();
        client.on(MessageKind::LoginComplete, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = ServerConn::new(stream);
            let login = conn.read_frame().await;
            assert_eq!(login.kind, MessageKind::Login);
            assert_eq!(login.arg1, LOGIN_VERSION);
            assert_eq!(login.from, 0);
            assert_eq!(login.payload.as_text(), Some("alice:s3cret"));
            conn.send(
                MessageKind::Login,
                4242,
                0,
                555,
                &Payload::Text("alice".into()),
            )
            .await;
            conn
        });

        client.connect(true).await.unwrap();

        let session = client.session_state().await;
        assert_eq!(session.session_id, 4242);
        assert_eq!(session.uid, 555);
        assert_eq!(session.username, "alice");
        assert!(session.logged_in);
        assert_eq!(login_complete.load(Ordering::SeqCst), 1);

        let _conn = server.await.unwrap();
        client.disconnect().await;
    }

    #[tokio::test]
    async fn rejected_login_fails_connect_without_reconnect() {
        let (listener, port) = bind().await;
        let client = test_client(port);

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = ServerConn::new(stream);
            conn.read_frame().await;
            conn.send(MessageKind::Login, 0, 2, 0, &Payload::None).await;
            listener
        });

        let err = client.connect(true).await.unwrap_err();
        assert!(matches!(err, ClientError::Login { status: 2 }));

        // The failed attempt must not schedule a reconnect.
        let listener = server.await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let second = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
        assert!(second.is_err(), "unexpected reconnect after login failure");
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn unexpected_close_reconnects_once_with_same_login_flag() {
        let (listener, port) = bind().await;
        let client = test_client(port);

        let connected = Arc::new(AtomicUsize::new(0));
        let counter = connected.clone();
        client.on(MessageKind::Connected, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut first = ServerConn::new(stream);
            first.complete_login().await;
            drop(first); // unexpected closure

            let (stream, _) = listener.accept().await.unwrap();
            let mut second = ServerConn::new(stream);
            // The reconnect repeats the login choice with the same creds.
            let login = second.complete_login().await;
            assert_eq!(login.payload.as_text(), Some("alice:s3cret"));

            // Exactly one reconnect: no further connection attempts while
            // the second one is healthy.
            let third = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
            assert!(third.is_err(), "more than one reconnect scheduled");
            second
        });

        client.connect(true).await.unwrap();

        let counter = connected.clone();
        let state = client.clone();
        wait_for("reconnect", async || {
            counter.load(Ordering::SeqCst) >= 2 && state.session_state().await.logged_in
        })
        .await;

        let _conn = server.await.unwrap();
        client.disconnect().await;
    }

    #[tokio::test]
    async fn manual_disconnect_suppresses_reconnect() {
        let (listener, port) = bind().await;
        let client = test_client(port);

        let disconnected = Arc::new(AtomicUsize::new(0));
        let counter = disconnected.clone();
        client.on(MessageKind::Disconnected, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            (listener, stream)
        });

        client.connect(false).await.unwrap();
        let (listener, _stream) = server.await.unwrap();

        client.disconnect().await;
        let counter = disconnected.clone();
        wait_for("disconnect event", async || {
            counter.load(Ordering::SeqCst) == 1
        })
        .await;

        // Registry and session are cleared, and no reconnect is attempted.
        assert!(!client.is_connected().await);
        assert_eq!(client.session_state().await, SessionState::default());
        tokio::time::sleep(Duration::from_millis(150)).await;
        let again = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
        assert!(again.is_err(), "reconnect attempted after manual disconnect");
        assert_eq!(disconnected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn query_user_resolves_and_absent_user_is_none() {
        let (listener, port) = bind().await;
        let client = test_client(port);

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = ServerConn::new(stream);
            conn.complete_login().await;

            let lookup = conn.read_frame().await;
            assert_eq!(lookup.kind, MessageKind::UsernameLookup);
            assert_eq!(lookup.payload.as_text(), Some("daisy"));
            conn.send(
                MessageKind::UsernameLookup,
                0,
                lookup.arg1,
                0,
                &Payload::Json(serde_json::json!({"uid": 99, "nm": "daisy", "lv": 4, "sid": 7, "vs": 0})),
            )
            .await;

            let missing = conn.read_frame().await;
            assert_eq!(missing.arg2, 424242);
            conn.send(
                MessageKind::UsernameLookup,
                0,
                missing.arg1,
                0,
                // Not a mapping: the queried user does not exist.
                &Payload::Text("0".into()),
            )
            .await;
            conn
        });

        client.connect(true).await.unwrap();

        let found = client.query_user("daisy").await.unwrap().unwrap();
        assert_eq!(found["uid"], serde_json::json!(99));
        // The lookup payload was also merged into the registry.
        let record = client.entity(99).await.unwrap();
        assert_eq!(record.name(), Some("daisy"));
        assert!(record.is_model);

        // The non-mapping reply must still resolve the query, not leave the
        // caller waiting.
        let absent = tokio::time::timeout(Duration::from_secs(5), client.query_user(424242_i64))
            .await
            .expect("absent-user lookup did not resolve")
            .unwrap();
        assert!(absent.is_none());

        let _conn = server.await.unwrap();
        client.disconnect().await;
    }

    #[tokio::test]
    async fn pending_query_fails_on_disconnect() {
        let (listener, port) = bind().await;
        let client = test_client(port);

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = ServerConn::new(stream);
            conn.complete_login().await;
            // Swallow the lookup, then drop the connection.
            conn.read_frame().await;
            drop(conn);
            listener
        });

        client.connect(true).await.unwrap();
        let result = client.query_user("ghost").await;
        assert!(matches!(result, Err(ClientError::Disconnected)));

        // Keep the listener alive until the query has failed.
        let _listener = server.await.unwrap();
        client.disconnect().await;
    }

    #[tokio::test]
    async fn bulk_roster_fires_models_loaded_once() {
        let (listener, port) = bind().await;
        let client = test_client(port);

        let loaded = Arc::new(AtomicUsize::new(0));
        let counter = loaded.clone();
        client.on(MessageKind::ModelsLoaded, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let roster = Payload::Json(serde_json::json!({
            "rdata": [
                ["uid", "nm", "lv", {"m": ["camscore"]}],
                [11, "ana", 4, [912.5]],
                [12, "bea", 4, [87.0]],
            ]
        }));

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = ServerConn::new(stream);
            conn.complete_login().await;
            conn.send(MessageKind::ManageList, 0, 0, ListType::Cams as i32, &roster)
                .await;
            conn.send(MessageKind::ManageList, 0, 0, ListType::Cams as i32, &roster)
                .await;
            conn
        });

        client.connect(true).await.unwrap();

        let registry_len = client.clone();
        wait_for("roster merge", async || {
            registry_len.read_registry(|r| r.len()).await >= 2
        })
        .await;
        // Give the second bulk list time to be processed too.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(loaded.load(Ordering::SeqCst), 1);

        let record = client.entity(11).await.unwrap();
        assert_eq!(record.name(), Some("ana"));
        assert!(record.is_model);
        assert_eq!(record.attributes["m"]["camscore"], serde_json::json!(912.5));

        let _conn = server.await.unwrap();
        client.disconnect().await;
    }

    #[tokio::test]
    async fn keepalive_sends_null_commands() {
        let (listener, port) = bind().await;
        let config = ClientConfig::new("alice", "s3cret")
            .with_chat_port(port)
            .with_keepalive_interval(Duration::from_millis(40))
            .with_reconnect_delay(Duration::from_secs(30));
        let client = Client::with_collaborators(
            config,
            Arc::new(StaticDirectory(vec!["127.0.0.1".into()])),
            Arc::new(NullResolver),
        );

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = ServerConn::new(stream);
            conn.complete_login().await;
            let ping = tokio::time::timeout(Duration::from_secs(2), conn.read_frame())
                .await
                .expect("no keepalive before timeout");
            assert_eq!(ping.kind, MessageKind::Null);
            conn
        });

        client.connect(true).await.unwrap();
        let _conn = server.await.unwrap();
        client.disconnect().await;
    }

    #[tokio::test]
    async fn framing_error_forces_reconnect() {
        let (listener, port) = bind().await;
        let client = test_client(port);

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = ServerConn::new(stream);
            conn.complete_login().await;
            // Garbage that cannot be a valid frame header.
            conn.stream.write_all(&[0xde; 64]).await.unwrap();

            // The client must drop the stream and reconnect.
            let (stream, _) = listener.accept().await.unwrap();
            let mut second = ServerConn::new(stream);
            second.complete_login().await;
            second
        });

        client.connect(true).await.unwrap();

        let state = client.clone();
        wait_for("reconnect after framing error", async || {
            state.session_state().await.logged_in && state.is_connected().await
        })
        .await;

        let _conn = server.await.unwrap();
        client.disconnect().await;
    }
}
