//! Per-connection state machine and I/O drivers.
//!
//! Each accepted socket gets two tasks: a receive driver that owns the read
//! half (handshake, authentication, decrypt, dispatch) and a send driver
//! that owns the write half (queue drain, encrypt, delivery tracking,
//! rekey). They share the session crypto context behind a mutex and a
//! [`ConnectionHandle`] that the registry owns.
//!
//! State machine:
//!
//! ```text
//!   Connecting ──handshake ok──► AwaitAuth ──creds ok──► Authenticated
//!       │                           │                        │
//!       │                      creds fail/lockout      logout/io err
//!       └───io err/timeout──► Disconnecting ◄────────────────┘
//!                                   │
//!                                   ▼
//!                                Closed
//! ```
//!
//! Every wait here has a deadline: the transport handshake, the auth frame,
//! each delivery acknowledgement, the rekey answer, and the final drain.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::config::{SendConfig, ServerConfig, AUTH_TIMEOUT, CONNECT_TIMEOUT, DRAIN_TIMEOUT};
use crate::core::codec::FrameCodec;
use crate::error::{ChatError, Result};
use crate::protocol::envelope::{is_handshake_frame, Envelope};
use crate::protocol::handshake::{respond_to_hello, HandshakeFrame};
use crate::protocol::message::{unix_millis, ChatMessage, MessageKind};
use crate::protocol::session::{RekeyAuthority, RekeyDone, SessionCrypto};
use crate::service::auth::AuthService;
use crate::service::registry::Registry;
use crate::service::send_queue::{AckTable, QueuedMessage, SendQueue};
use crate::utils::metrics::global_metrics;
use crate::utils::rate_limit::{ConnectionLimiter, LoginGate};

/// Deadline for the peer's rekey answer.
const REKEY_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimum spacing between typing-indicator fan-outs.
const TYPING_DEBOUNCE: Duration = Duration::from_secs(3);

/// Lifecycle states of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Transport accepted, handshake in progress
    Connecting,
    /// Session keys established, waiting for credentials
    AwaitAuth,
    /// Full message plane live
    Authenticated,
    /// Draining the send queue before the transport goes down
    Disconnecting,
    /// Terminal; registry entry removed
    Closed,
}

/// Traffic counters for one connection.
#[derive(Debug, Default)]
pub struct ConnStats {
    /// Messages received
    pub messages_in: AtomicU64,
    /// Messages sent
    pub messages_out: AtomicU64,
    /// Bytes received
    pub bytes_in: AtomicU64,
    /// Bytes sent
    pub bytes_out: AtomicU64,
}

impl ConnStats {
    fn record_in(&self, bytes: u64) {
        self.messages_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes, Ordering::Relaxed);
    }

    fn record_out(&self, bytes: u64) {
        self.messages_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Shared, registry-owned view of one connection.
///
/// The socket itself lives inside the driver tasks; everything another
/// component may touch (state, queue, counters, disconnect signal) lives
/// here.
pub struct ConnectionHandle {
    id: u64,
    state: RwLock<ConnState>,
    username: RwLock<Option<String>>,
    /// Outbound queue drained by the send driver
    pub queue: SendQueue,
    /// Delivery acknowledgements in flight
    pub acks: AckTable,
    /// Traffic counters
    pub stats: ConnStats,
    last_activity_ms: AtomicU64,
    last_rekey_ms: AtomicU64,
    rekey_due: AtomicBool,
    rekey_notify: Notify,
    connected_at: Instant,
    disconnect_tx: watch::Sender<bool>,
}

impl ConnectionHandle {
    /// Create a handle for a freshly accepted connection.
    pub fn new(id: u64, send: &SendConfig) -> Arc<Self> {
        let (disconnect_tx, _) = watch::channel(false);
        let now = unix_millis();
        Arc::new(Self {
            id,
            state: RwLock::new(ConnState::Connecting),
            username: RwLock::new(None),
            queue: SendQueue::new(send.queue_capacity),
            acks: AckTable::default(),
            stats: ConnStats::default(),
            last_activity_ms: AtomicU64::new(now),
            last_rekey_ms: AtomicU64::new(now),
            rekey_due: AtomicBool::new(false),
            rekey_notify: Notify::new(),
            connected_at: Instant::now(),
            disconnect_tx,
        })
    }

    /// Process-unique connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        *self.state.read().expect("state lock poisoned")
    }

    /// Transition the lifecycle state. Closed is terminal.
    pub fn set_state(&self, next: ConnState) {
        let mut state = self.state.write().expect("state lock poisoned");
        if *state != ConnState::Closed {
            *state = next;
        }
    }

    /// Authenticated username, if past AwaitAuth.
    pub fn username(&self) -> Option<String> {
        self.username.read().expect("username lock poisoned").clone()
    }

    /// Bind the authenticated username.
    pub fn set_username(&self, name: &str) {
        *self.username.write().expect("username lock poisoned") = Some(name.to_string());
    }

    /// Record inbound activity now.
    pub fn touch(&self) {
        self.last_activity_ms.store(unix_millis(), Ordering::Relaxed);
    }

    /// Time since the last inbound frame.
    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(unix_millis().saturating_sub(last))
    }

    /// Time since the current key epoch was installed.
    pub fn rekey_age(&self) -> Duration {
        let last = self.last_rekey_ms.load(Ordering::Relaxed);
        Duration::from_millis(unix_millis().saturating_sub(last))
    }

    /// Record a completed rekey.
    pub fn mark_rekeyed(&self) {
        self.last_rekey_ms.store(unix_millis(), Ordering::Relaxed);
    }

    /// Ask the send driver to run a rekey exchange.
    pub fn request_rekey(&self) {
        self.rekey_due.store(true, Ordering::Relaxed);
        self.rekey_notify.notify_one();
    }

    fn take_rekey_due(&self) -> bool {
        self.rekey_due.swap(false, Ordering::Relaxed)
    }

    /// When the socket was accepted.
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Move the connection toward Closed. Idempotent; wakes both drivers.
    pub fn begin_disconnect(&self) {
        self.set_state(ConnState::Disconnecting);
        let _ = self.disconnect_tx.send(true);
        self.queue.poke();
    }

    /// Subscribe to the disconnect signal.
    pub fn disconnect_watch(&self) -> watch::Receiver<bool> {
        self.disconnect_tx.subscribe()
    }
}

/// Shared dependencies handed to every connection.
#[derive(Clone)]
pub struct ConnectionContext {
    /// Connection directory and router
    pub registry: Arc<Registry>,
    /// Credential verification and token issue
    pub auth: Arc<AuthService>,
    /// Server configuration
    pub config: Arc<ServerConfig>,
    /// Server-wide shutdown signal
    pub shutdown: watch::Receiver<bool>,
}

type SharedCrypto = Arc<StdMutex<SessionCrypto>>;
type Reader<S> = FramedRead<ReadHalf<S>, FrameCodec>;
type Writer<S> = FramedWrite<WriteHalf<S>, FrameCodec>;

/// Drive one connection from handshake to Closed.
///
/// Consumes the stream; returns once the connection has fully torn down and
/// left the registry.
pub async fn run_connection<S>(stream: S, handle: Arc<ConnectionHandle>, ctx: ConnectionContext)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    global_metrics().connection_established();

    let result = drive(stream, handle.clone(), ctx.clone()).await;
    match &result {
        Ok(()) => info!(conn = handle.id(), "connection closed"),
        Err(ChatError::ConnectionClosed) => {
            debug!(conn = handle.id(), "peer closed the connection");
        }
        Err(e) => warn!(conn = handle.id(), code = e.code(), error = %e, "connection terminated"),
    }

    handle.set_state(ConnState::Closed);
    let pending = handle.queue.close();
    if !pending.is_empty() {
        debug!(
            conn = handle.id(),
            count = pending.len(),
            "pending queue entries cancelled by shutdown"
        );
        for _ in &pending {
            global_metrics().message_dropped();
        }
    }
    ctx.registry.unregister(handle.id());
    global_metrics().connection_closed();
}

async fn drive<S>(stream: S, handle: Arc<ConnectionHandle>, ctx: ConnectionContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FramedRead::new(read_half, FrameCodec);
    let mut writer = FramedWrite::new(write_half, FrameCodec);

    // Connecting: session key exchange under the connect deadline.
    let crypto = match timeout(CONNECT_TIMEOUT, perform_handshake(&mut reader, &mut writer)).await
    {
        Ok(result) => Arc::new(StdMutex::new(result?)),
        Err(_) => {
            return Err(ChatError::KeyExchangeFailed("handshake timed out".into()));
        }
    };
    handle.set_state(ConnState::AwaitAuth);
    handle.mark_rekeyed();

    // AwaitAuth: credentials under the auth deadline.
    let mut limiter = ConnectionLimiter::new(&ctx.config.limits);
    match timeout(
        AUTH_TIMEOUT,
        authenticate_peer(&mut reader, &mut writer, &crypto, &handle, &ctx, &mut limiter),
    )
    .await
    {
        Ok(result) => result?,
        Err(_) => return Err(ChatError::AuthFailed("no auth frame in time".into())),
    }

    // Authenticated: split into the two drivers. The channel signals rekey
    // completion from the receive loop to the paused send driver.
    let (rekey_tx, rekey_rx) = mpsc::channel::<()>(1);
    let mut send_task = tokio::spawn(send_driver(
        writer,
        crypto.clone(),
        handle.clone(),
        ctx.clone(),
        rekey_rx,
    ));

    let result = receive_loop(&mut reader, &crypto, &handle, &ctx, &mut limiter, &rekey_tx).await;

    handle.begin_disconnect();
    if timeout(DRAIN_TIMEOUT + Duration::from_secs(1), &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }

    result
}

async fn perform_handshake<S>(reader: &mut Reader<S>, writer: &mut Writer<S>) -> Result<SessionCrypto>
where
    S: AsyncRead + AsyncWrite,
{
    let frame = reader
        .next()
        .await
        .ok_or(ChatError::ConnectionClosed)??;

    let hello = HandshakeFrame::from_frame_bytes(&frame)?;
    let exchange = respond_to_hello(&hello)?;
    writer.send(exchange.reply.to_frame_bytes()?).await?;

    debug!(suite = exchange.suite.wire_name(), "session keys established");

    let authority = match exchange.client_rsa_key {
        Some(key) => RekeyAuthority::RsaServer(key),
        None => RekeyAuthority::X25519,
    };
    Ok(SessionCrypto::new(exchange.keys, authority))
}

async fn authenticate_peer<S>(
    reader: &mut Reader<S>,
    writer: &mut Writer<S>,
    crypto: &SharedCrypto,
    handle: &Arc<ConnectionHandle>,
    ctx: &ConnectionContext,
    limiter: &mut ConnectionLimiter,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    loop {
        let frame = reader
            .next()
            .await
            .ok_or(ChatError::ConnectionClosed)??;
        handle.touch();
        handle.stats.record_in(frame.len() as u64);
        global_metrics().bytes_in(frame.len() as u64);

        if is_handshake_frame(&frame) {
            return Err(ChatError::Protocol(
                "handshake frame after key exchange".into(),
            ));
        }

        let envelope = Envelope::from_bytes(&frame)?;
        let plaintext = decrypt_observed(crypto, &envelope)?;

        let msg = match ChatMessage::decode(&plaintext) {
            Ok(msg) => msg,
            Err(e) => {
                send_sealed(writer, crypto, &ChatMessage::error_frame(e.code(), e.to_string()))
                    .await?;
                continue;
            }
        };

        if msg.kind != MessageKind::Auth {
            return Err(ChatError::Protocol(format!(
                "{} message before authentication",
                msg.kind.as_str()
            )));
        }

        if limiter.allow_login() == LoginGate::LockedOut {
            global_metrics().auth_rejected();
            send_sealed(writer, crypto, &ChatMessage::auth_failed("too many attempts")).await?;
            return Err(ChatError::RateLimited("login attempts"));
        }

        match ctx.auth.authenticate(&msg) {
            Ok(principal) => {
                if let Some(displaced) = ctx.registry.bind_username(handle.id(), &principal.username)
                {
                    let notice = ChatMessage::error_frame(
                        "SESSION_REPLACED",
                        "account signed in from another connection",
                    );
                    if let Ok(entry) = QueuedMessage::from_message(&notice, None) {
                        let _ = displaced.queue.push(entry);
                    }
                    displaced.begin_disconnect();
                }

                handle.set_username(&principal.username);
                handle.set_state(ConnState::Authenticated);
                global_metrics().auth_succeeded();
                info!(conn = handle.id(), user = %principal.username, "authenticated");

                send_sealed(writer, crypto, &ChatMessage::auth_ok(&principal.token)).await?;
                return Ok(());
            }
            Err(e) => {
                global_metrics().auth_rejected();
                debug!(conn = handle.id(), error = %e, "auth attempt rejected");
                send_sealed(writer, crypto, &ChatMessage::auth_failed(&e.to_string())).await?;
            }
        }
    }
}

async fn receive_loop<S>(
    reader: &mut Reader<S>,
    crypto: &SharedCrypto,
    handle: &Arc<ConnectionHandle>,
    ctx: &ConnectionContext,
    limiter: &mut ConnectionLimiter,
    rekey_tx: &mpsc::Sender<()>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    let mut shutdown = ctx.shutdown.clone();
    let mut disconnect = handle.disconnect_watch();
    let mut last_typing: Option<Instant> = None;

    if *shutdown.borrow() {
        return Err(ChatError::CancelledShutdown);
    }
    // A kick can land between authentication and this subscription; watch
    // subscribers only observe changes after they attach.
    if *disconnect.borrow() {
        return Ok(());
    }

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Err(ChatError::CancelledShutdown);
                }
            }
            _ = disconnect.changed() => {
                if *disconnect.borrow() {
                    return Ok(());
                }
            }
            frame = reader.next() => {
                let frame = match frame {
                    None => return Err(ChatError::ConnectionClosed),
                    Some(frame) => frame?,
                };
                handle.touch();
                handle.stats.record_in(frame.len() as u64);
                global_metrics().bytes_in(frame.len() as u64);

                if is_handshake_frame(&frame) {
                    return Err(ChatError::Protocol("handshake frame inside session".into()));
                }

                let envelope = Envelope::from_bytes(&frame)?;
                let plaintext = decrypt_observed(crypto, &envelope)?;

                let msg = match ChatMessage::decode(&plaintext) {
                    Ok(msg) => msg,
                    Err(e) => {
                        enqueue_reply(handle, ChatMessage::error_frame(e.code(), e.to_string()));
                        continue;
                    }
                };

                if rate_limited_kind(msg.kind) && !limiter.allow_message(frame.len()) {
                    global_metrics().message_rate_limited();
                    enqueue_reply(
                        handle,
                        ChatMessage::error_frame("RATE_LIMITED", "message rate exceeded"),
                    );
                    continue;
                }

                if let Err(e) = dispatch(msg, crypto, handle, ctx, rekey_tx, &mut last_typing) {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    enqueue_reply(handle, ChatMessage::error_frame(e.code(), e.to_string()));
                }
            }
        }
    }
}

/// Kinds exempt from the message-rate dimension: acknowledgements and the
/// control plane must flow even when a client is saturating its budget.
fn rate_limited_kind(kind: MessageKind) -> bool {
    !matches!(
        kind,
        MessageKind::System | MessageKind::Delivery | MessageKind::Auth
    )
}

fn dispatch(
    msg: ChatMessage,
    crypto: &SharedCrypto,
    handle: &Arc<ConnectionHandle>,
    ctx: &ConnectionContext,
    rekey_tx: &mpsc::Sender<()>,
    last_typing: &mut Option<Instant>,
) -> Result<()> {
    match msg.kind {
        MessageKind::Text
        | MessageKind::Image
        | MessageKind::File
        | MessageKind::Audio
        | MessageKind::Video => route_user_message(msg, handle, ctx),

        MessageKind::Typing => {
            let now = Instant::now();
            if last_typing.is_some_and(|prev| now.duration_since(prev) < TYPING_DEBOUNCE) {
                return Ok(());
            }
            *last_typing = Some(now);

            let mut fanout = msg;
            fanout.sender = handle.username();
            ctx.registry.broadcast(&fanout, handle.id());
            Ok(())
        }

        MessageKind::ReadReceipt => {
            // Forward to the original sender when still connected; silence
            // otherwise.
            let Some(target) = msg.recipient.clone().filter(|r| !r.is_empty()) else {
                return Err(ChatError::DecodeError("read receipt without recipient".into()));
            };
            let mut receipt = msg;
            receipt.sender = handle.username();
            let _ = ctx.registry.send_to_user(&target, &receipt, Some(handle.id()));
            Ok(())
        }

        MessageKind::Delivery => {
            if let Some(id) = &msg.id {
                if !handle.acks.acknowledge(id) {
                    debug!(conn = handle.id(), id = %id, "ack for unknown message id");
                }
            }
            Ok(())
        }

        MessageKind::UserList => {
            let users = ctx.registry.directory();
            let reply = ChatMessage::new(MessageKind::UserList).with_field(
                "users",
                Value::Array(users.into_iter().map(Value::String).collect()),
            );
            enqueue_reply(handle, reply);
            Ok(())
        }

        MessageKind::UserStatus => {
            let Some(who) = msg.field_str("username").map(str::to_string) else {
                return Err(ChatError::DecodeError("user_status without username".into()));
            };
            let online = ctx
                .registry
                .lookup(&who)
                .is_some_and(|h| h.state() == ConnState::Authenticated);
            let reply = ChatMessage::new(MessageKind::UserStatus)
                .with_field("username", Value::String(who))
                .with_field("online", Value::Bool(online));
            enqueue_reply(handle, reply);
            Ok(())
        }

        MessageKind::Auth => Err(ChatError::Protocol(
            "auth frame outside authentication".into(),
        )),

        MessageKind::Error => {
            warn!(
                conn = handle.id(),
                code = msg.field_str("code").unwrap_or("unknown"),
                detail = msg.field_str("detail").unwrap_or(""),
                "peer reported error"
            );
            Ok(())
        }

        MessageKind::System => handle_system(msg, crypto, handle, rekey_tx),
    }
}

fn route_user_message(
    msg: ChatMessage,
    handle: &Arc<ConnectionHandle>,
    ctx: &ConnectionContext,
) -> Result<()> {
    let id = msg
        .id
        .clone()
        .ok_or_else(|| ChatError::DecodeError("user message without id".into()))?;

    let mut routed = msg;
    routed.sender = handle.username();

    if routed.is_broadcast() {
        let outcome = ctx.registry.broadcast(&routed, handle.id());
        debug!(
            conn = handle.id(),
            delivered = outcome.delivered,
            failed = outcome.failed,
            "broadcast routed"
        );
        enqueue_reply(handle, ChatMessage::delivery(&id, "delivered"));
        return Ok(());
    }

    let target = routed.recipient.clone().unwrap_or_default();
    match ctx.registry.send_to_user(&target, &routed, Some(handle.id())) {
        Ok(()) => {
            enqueue_reply(handle, ChatMessage::delivery(&id, "delivered"));
            Ok(())
        }
        Err(ChatError::PeerNotFound(_)) => {
            enqueue_reply(
                handle,
                ChatMessage::error_frame("PEER_NOT_FOUND", format!("{target} is not connected"))
                    .with_field("id", Value::String(id)),
            );
            Ok(())
        }
        Err(ChatError::QueueFull) => {
            global_metrics().message_dropped();
            enqueue_reply(
                handle,
                ChatMessage::error_frame("MESSAGE_FAILED", "recipient queue full")
                    .with_field("id", Value::String(id)),
            );
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn handle_system(
    msg: ChatMessage,
    crypto: &SharedCrypto,
    handle: &Arc<ConnectionHandle>,
    rekey_tx: &mpsc::Sender<()>,
) -> Result<()> {
    match msg.field_str("action") {
        Some("ping") => {
            enqueue_reply(handle, ChatMessage::system("pong"));
            Ok(())
        }
        Some("pong") => Ok(()),
        Some("rekey_done") => {
            let material = msg
                .field_str("material")
                .map(hex::decode)
                .transpose()
                .map_err(|_| ChatError::KeyExchangeFailed("rekey answer with bad hex".into()))?
                .unwrap_or_default();

            // The swap happens here, in inbound frame order: the answer is
            // the last frame sealed under the old keys, so the very next
            // frame must already decrypt under the new ones.
            let mut guard = crypto
                .lock()
                .map_err(|_| ChatError::Protocol("crypto lock poisoned".into()))?;
            if !guard.rekey_in_progress() {
                debug!(conn = handle.id(), "rekey answer with no exchange in flight");
                return Ok(());
            }
            guard.complete_rekey(&RekeyDone { material })?;
            drop(guard);

            handle.mark_rekeyed();
            global_metrics().rekey_completed();
            info!(conn = handle.id(), "session rekeyed");
            let _ = rekey_tx.try_send(());
            Ok(())
        }
        Some("rekey_request") => {
            handle.request_rekey();
            Ok(())
        }
        Some("rekey_init") => Err(ChatError::Protocol(
            "rekey offers originate from the server".into(),
        )),
        other => {
            debug!(conn = handle.id(), action = other.unwrap_or(""), "unknown system action");
            Ok(())
        }
    }
}

/// Queue a server-originated reply to this peer. Failures are logged; the
/// connection-level error path handles a dead queue separately.
fn enqueue_reply(handle: &Arc<ConnectionHandle>, msg: ChatMessage) {
    match QueuedMessage::from_message(&msg, None) {
        Ok(entry) => {
            if let Err(e) = handle.queue.push(entry) {
                debug!(conn = handle.id(), error = %e, "reply enqueue failed");
            }
        }
        Err(e) => debug!(conn = handle.id(), error = %e, "reply serialization failed"),
    }
}

fn decrypt_observed(crypto: &SharedCrypto, envelope: &Envelope) -> Result<Vec<u8>> {
    let mut guard = crypto
        .lock()
        .map_err(|_| ChatError::Protocol("crypto lock poisoned".into()))?;
    match guard.decrypt(envelope) {
        Ok(plaintext) => Ok(plaintext),
        Err(e) => {
            match &e {
                ChatError::ReplayDetected { .. } => global_metrics().replay_detected(),
                ChatError::IntegrityFailed => global_metrics().integrity_failure(),
                _ => {}
            }
            Err(e)
        }
    }
}

fn seal_payload(crypto: &SharedCrypto, payload: &[u8]) -> Result<Bytes> {
    let mut guard = crypto
        .lock()
        .map_err(|_| ChatError::Protocol("crypto lock poisoned".into()))?;
    Ok(guard.encrypt(payload)?.to_bytes())
}

fn seal_message(crypto: &SharedCrypto, msg: &ChatMessage) -> Result<Bytes> {
    seal_payload(crypto, &msg.encode()?)
}

async fn send_sealed<S>(
    writer: &mut Writer<S>,
    crypto: &SharedCrypto,
    msg: &ChatMessage,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    let bytes = seal_message(crypto, msg)?;
    global_metrics().bytes_out(bytes.len() as u64);
    writer.send(bytes).await
}

async fn send_driver<S>(
    mut writer: Writer<S>,
    crypto: SharedCrypto,
    handle: Arc<ConnectionHandle>,
    ctx: ConnectionContext,
    mut rekey_rx: mpsc::Receiver<()>,
) where
    S: AsyncRead + AsyncWrite,
{
    let ack_timeout = ctx.config.send.ack_timeout();
    let max_retries = ctx.config.send.max_retries;
    let mut disconnect = handle.disconnect_watch();

    loop {
        if *disconnect.borrow() {
            break;
        }

        if handle.take_rekey_due() {
            if let Err(e) = run_rekey(&mut writer, &crypto, &handle, &mut rekey_rx).await {
                warn!(conn = handle.id(), error = %e, "rekey failed");
                handle.begin_disconnect();
                break;
            }
            continue;
        }

        tokio::select! {
            changed = disconnect.changed() => {
                if changed.is_err() || *disconnect.borrow() {
                    break;
                }
            }
            _ = handle.rekey_notify.notified() => {
                // Flag handled at the top of the loop.
            }
            entry = handle.queue.pop() => {
                let Some(entry) = entry else { break };
                if let Err(e) = deliver(
                    &mut writer,
                    &crypto,
                    &handle,
                    &ctx,
                    entry,
                    ack_timeout,
                    max_retries,
                    &mut disconnect,
                )
                .await
                {
                    warn!(conn = handle.id(), error = %e, "send path failed");
                    handle.begin_disconnect();
                    break;
                }
            }
        }
    }

    drain(&mut writer, &crypto, &handle).await;
    let _ = SinkExt::flush(&mut writer).await;
    let _ = writer.get_mut().shutdown().await;
}

#[allow(clippy::too_many_arguments)]
async fn deliver<S>(
    writer: &mut Writer<S>,
    crypto: &SharedCrypto,
    handle: &Arc<ConnectionHandle>,
    ctx: &ConnectionContext,
    mut entry: QueuedMessage,
    ack_timeout: Duration,
    max_retries: u32,
    disconnect: &mut watch::Receiver<bool>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    // Register the ack waiter before the frame leaves, so an immediate
    // acknowledgement cannot race the registration.
    let waiting = entry
        .message_id
        .clone()
        .map(|id| (handle.acks.register(&id), id));

    let bytes = seal_payload(crypto, &entry.payload)?;
    let len = bytes.len() as u64;
    if let Err(e) = writer.send(bytes).await {
        if let Some((_, id)) = &waiting {
            handle.acks.forget(id);
        }
        return Err(e);
    }
    handle.stats.record_out(len);
    global_metrics().bytes_out(len);

    let Some((ack, id)) = waiting else {
        return Ok(());
    };
    tokio::select! {
        _ = ack => Ok(()),
        _ = tokio::time::sleep(ack_timeout) => {
            handle.acks.forget(&id);
            entry.retries += 1;
            global_metrics().send_retried();

            if entry.retries > max_retries {
                global_metrics().message_dropped();
                notify_failure(ctx, handle, &entry, &id);
            } else if handle.queue.push(entry).is_err() {
                global_metrics().message_dropped();
            }
            Ok(())
        }
        _ = disconnect.changed() => {
            handle.acks.forget(&id);
            Ok(())
        }
    }
}

/// Tell the originating sender that delivery gave up.
fn notify_failure(
    ctx: &ConnectionContext,
    handle: &Arc<ConnectionHandle>,
    entry: &QueuedMessage,
    id: &str,
) {
    warn!(
        conn = handle.id(),
        id = %id,
        retries = entry.retries,
        "delivery abandoned after retries"
    );
    let Some(origin) = entry.origin else { return };
    if origin == handle.id() {
        return;
    }
    let notice = ChatMessage::error_frame("MESSAGE_FAILED", "delivery failed after retries")
        .with_field("id", Value::String(id.to_string()));
    let _ = ctx.registry.send_to_id(origin, &notice, None);
}

async fn run_rekey<S>(
    writer: &mut Writer<S>,
    crypto: &SharedCrypto,
    handle: &Arc<ConnectionHandle>,
    rekey_rx: &mut mpsc::Receiver<()>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    // Drop any stale completion signal from an earlier exchange.
    while rekey_rx.try_recv().is_ok() {}

    let init = {
        let mut guard = crypto
            .lock()
            .map_err(|_| ChatError::Protocol("crypto lock poisoned".into()))?;
        guard.begin_rekey()?
    };

    let offer = ChatMessage::system("rekey_init")
        .with_field("material", Value::String(hex::encode(&init.material)))
        .with_field("nonce", Value::String(hex::encode(&init.nonce)));
    send_sealed(writer, crypto, &offer).await?;

    debug!(conn = handle.id(), "rekey offered, outbound paused");

    // Outbound traffic pauses until the receive loop swaps the keys, so
    // nothing is sealed under the old epoch after the peer switches over.
    match timeout(REKEY_TIMEOUT, rekey_rx.recv()).await {
        Ok(Some(())) => Ok(()),
        Ok(None) => Err(ChatError::ConnectionClosed),
        Err(_) => Err(ChatError::KeyExchangeFailed("no rekey answer in time".into())),
    }
}

async fn drain<S>(writer: &mut Writer<S>, crypto: &SharedCrypto, handle: &Arc<ConnectionHandle>)
where
    S: AsyncRead + AsyncWrite,
{
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while let Some(entry) = handle.queue.try_pop() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let Ok(bytes) = seal_payload(crypto, &entry.payload) else {
            break;
        };
        match timeout(deadline - now, writer.send(bytes)).await {
            Ok(Ok(())) => {}
            _ => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> Arc<ConnectionHandle> {
        ConnectionHandle::new(42, &SendConfig::default())
    }

    #[test]
    fn state_transitions_stop_at_closed() {
        let h = handle();
        assert_eq!(h.state(), ConnState::Connecting);
        h.set_state(ConnState::AwaitAuth);
        h.set_state(ConnState::Authenticated);
        assert_eq!(h.state(), ConnState::Authenticated);

        h.set_state(ConnState::Closed);
        h.set_state(ConnState::Authenticated);
        assert_eq!(h.state(), ConnState::Closed);
    }

    #[test]
    fn begin_disconnect_signals_watch() {
        let h = handle();
        let watch = h.disconnect_watch();
        assert!(!*watch.borrow());

        h.begin_disconnect();
        assert_eq!(h.state(), ConnState::Disconnecting);
        assert!(*h.disconnect_watch().borrow());

        // Idempotent.
        h.begin_disconnect();
        assert_eq!(h.state(), ConnState::Disconnecting);
    }

    #[test]
    fn rekey_request_sets_flag_once() {
        let h = handle();
        assert!(!h.take_rekey_due());
        h.request_rekey();
        assert!(h.take_rekey_due());
        assert!(!h.take_rekey_due());
    }

    #[test]
    fn touch_resets_idle_clock() {
        let h = handle();
        std::thread::sleep(Duration::from_millis(20));
        assert!(h.idle_for() >= Duration::from_millis(10));
        h.touch();
        assert!(h.idle_for() < Duration::from_millis(10));
    }

    #[test]
    fn rate_limit_exemptions() {
        assert!(!rate_limited_kind(MessageKind::System));
        assert!(!rate_limited_kind(MessageKind::Delivery));
        assert!(rate_limited_kind(MessageKind::Text));
        assert!(rate_limited_kind(MessageKind::Typing));
        assert!(rate_limited_kind(MessageKind::UserList));
    }
}
