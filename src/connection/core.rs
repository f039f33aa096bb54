//! The connection state machine and its public API.
//!
//! A `Connection` handle is a thin, cloneable reference to a `Shared` block
//! of atomics plus a channel to an event-loop task spawned by `make`/`start`.
//! Every mutable piece of connection state — the socket, the correlator, the
//! pub/sub dispatcher — lives exclusively inside that task, the same
//! ownership shape `brocaar-redis-rs::aio::PipelineSink` uses to stay `Send`
//! without locks: callers never touch the socket directly, they post `Job`s
//! and await a `oneshot` reply.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::config::Config;
use crate::connection::correlator::{Correlator, PendingEntry};
use crate::connection::frame::{RespCodec, RespValue};
use crate::connection::pubsub::{classify, Classified, Message, PatternMessage, PubSubDispatcher, SubHook};
use crate::connection::transport::Transport;
use crate::error::{ConnectionError, ProtocolError};
use crate::metrics::METRICS;

use tokio_util::codec::Decoder;

const STATE_OPEN: u8 = 0;
const STATE_PUBSUB: u8 = 1;
const STATE_SHUTTING_DOWN: u8 = 2;
const STATE_CLOSED: u8 = 3;

/// `SUBSCRIBE`/`UNSUBSCRIBE`/`PSUBSCRIBE`/`PUNSUBSCRIBE` and `PING`/`QUIT` are
/// the only commands a subscribed connection still accepts. Enforced here, in
/// the public command surface, rather than inside the dispatcher.
fn allowed_while_subscribed(name: &[u8]) -> bool {
    name.eq_ignore_ascii_case(b"subscribe")
        || name.eq_ignore_ascii_case(b"unsubscribe")
        || name.eq_ignore_ascii_case(b"psubscribe")
        || name.eq_ignore_ascii_case(b"punsubscribe")
        || name.eq_ignore_ascii_case(b"ping")
        || name.eq_ignore_ascii_case(b"quit")
}

/// The 128-bit identity assigned to a connection at construction, used only
/// for log correlation.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Messages hopped from a `Connection` handle (possibly on another thread)
/// onto the event-loop task that owns the socket.
enum Job {
    Send {
        encoded: Vec<Bytes>,
        promises: Vec<oneshot::Sender<Result<RespValue, ConnectionError>>>,
        flush: bool,
    },
    FlushNow,
    GracefulClose,
    Subscribe {
        targets: Vec<Bytes>,
        receiver: mpsc::UnboundedSender<Message>,
        on_subscribe: Option<SubHook>,
        on_unsubscribe: Option<SubHook>,
        done: oneshot::Sender<Result<(), ConnectionError>>,
    },
    PSubscribe {
        targets: Vec<Bytes>,
        receiver: mpsc::UnboundedSender<PatternMessage>,
        on_subscribe: Option<SubHook>,
        on_unsubscribe: Option<SubHook>,
        done: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Unsubscribe {
        targets: Vec<Bytes>,
        on_unsubscribe: Option<SubHook>,
        done: oneshot::Sender<Result<(), ConnectionError>>,
    },
    PUnsubscribe {
        targets: Vec<Bytes>,
        on_unsubscribe: Option<SubHook>,
        done: oneshot::Sender<Result<(), ConnectionError>>,
    },
}

struct Shared {
    id: ConnectionId,
    autoflush: AtomicBool,
    allow_subscriptions: AtomicBool,
    state: AtomicU8,
    job_tx: mpsc::UnboundedSender<Job>,
    closed_rx: watch::Receiver<bool>,
    log_target: &'static str,
    /// Fired at most once, only when the transport closes without a prior
    /// `close()` call. Plain `std::sync::Mutex` since it's touched
    /// only at registration and at teardown, never on the hot path.
    unexpected_closure: std::sync::Mutex<Option<Box<dyn FnOnce(&Connection) + Send>>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let state = self.state.load(Ordering::Acquire);
        if state != STATE_CLOSED {
            log::error!(
                target: self.log_target,
                "connection {} dropped without close() completing",
                self.id
            );
            debug_assert!(false, "connection dropped without close() completing");
        }
    }
}

/// A single long-lived Redis client connection: one socket, a FIFO command
/// correlator, and (while subscribed) a pub/sub dispatcher, all driven by one
/// background task. Cheap to clone — every clone shares the same socket.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

/// A thin wrapper returned by `Connection::logging` that routes every call
/// through the same underlying connection but logs under a different target.
/// The wrapped connection is unaffected by calls made here.
#[derive(Clone)]
pub struct LoggingConnection {
    inner: Connection,
    log_target: &'static str,
}

impl Connection {
    /// Establishes the transport described by `config`, runs the AUTH/SELECT
    /// startup sequence, and spawns the event-loop task. On any startup
    /// failure the transport is torn down and the error returned; no
    /// `Connection` escapes in a half-initialized state.
    pub async fn make(config: Config) -> Result<Connection, ConnectionError> {
        if config.tls.is_some() && config.hostname.is_none() {
            return Err(ConnectionError::StartupFailed(
                "TLS configured without a hostname".into(),
            ));
        }

        let transport = Transport::connect(&config).await?;
        let connection = Self::spawn(transport, config.log_target);
        connection.start(&config).await?;
        Ok(connection)
    }

    /// Spawns the event-loop task over any duplex byte stream. Generic so
    /// tests can drive the state machine over an in-memory
    /// `tokio::io::duplex` pair instead of a real socket (a mock
    /// transport); production callers always instantiate this with
    /// [`Transport`].
    fn spawn<T>(transport: T, log_target: &'static str) -> Connection
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            id: ConnectionId(Uuid::new_v4()),
            autoflush: AtomicBool::new(true),
            allow_subscriptions: AtomicBool::new(true),
            state: AtomicU8::new(STATE_OPEN),
            job_tx,
            closed_rx,
            log_target,
            unexpected_closure: std::sync::Mutex::new(None),
        });

        METRICS.connection_opened();
        log::info!(target: log_target, "connection {} established", shared.id);

        let loop_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            run_event_loop(transport, job_rx, loop_shared, closed_tx).await;
        });

        Connection { shared }
    }

    /// Runs AUTH (if a password is configured) and SELECT (if an initial
    /// database is configured), in that order, as the startup
    /// sequence. Any rejected reply tears the connection down.
    async fn start(&self, config: &Config) -> Result<(), ConnectionError> {
        if let Some(password) = &config.password {
            let cmd = match &config.username {
                Some(username) => RespValue::command(
                    "AUTH",
                    vec![
                        Bytes::copy_from_slice(username.as_bytes()),
                        Bytes::copy_from_slice(password.as_bytes()),
                    ],
                ),
                None => RespValue::command("AUTH", vec![Bytes::copy_from_slice(password.as_bytes())]),
            };
            self.expect_ok(cmd, "AUTH").await?;
        }

        if let Some(db) = config.initial_database {
            let cmd = RespValue::command("SELECT", vec![Bytes::from(db.to_string())]);
            self.expect_ok(cmd, "SELECT").await?;
        }

        Ok(())
    }

    async fn expect_ok(&self, cmd: RespValue, label: &str) -> Result<(), ConnectionError> {
        let mut replies = self.send(vec![cmd]).await.map_err(|e| match e {
            ConnectionError::ConnectionClosed => {
                ConnectionError::StartupFailed(format!("{} failed: connection closed", label))
            }
            other => other,
        })?;
        match replies.pop() {
            Some(RespValue::SimpleString(_)) => Ok(()),
            Some(RespValue::Error(msg)) => Err(ConnectionError::StartupFailed(format!(
                "{} rejected: {}",
                label,
                String::from_utf8_lossy(&msg)
            ))),
            _ => Err(ConnectionError::StartupFailed(format!(
                "{} received an unexpected reply",
                label
            ))),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// Registers a callback fired at most once, only if the transport closes
    /// without `close()` having been called first — a dropped socket, a
    /// reset connection, a server-initiated disconnect. Overwrites any
    /// previously registered handler.
    pub fn set_unexpected_closure_handler(
        &self,
        handler: impl FnOnce(&Connection) + Send + 'static,
    ) {
        *self.shared.unexpected_closure.lock().unwrap() = Some(Box::new(handler));
    }

    /// `true` while the connection is usable for ordinary commands or
    /// pub/sub calls — `Open` or `PubSub`, not `ShuttingDown`/`Closed`.
    pub fn is_connected(&self) -> bool {
        matches!(
            self.shared.state.load(Ordering::Acquire),
            STATE_OPEN | STATE_PUBSUB
        )
    }

    pub fn is_subscribed(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) == STATE_PUBSUB
    }

    pub fn autoflush(&self) -> bool {
        self.shared.autoflush.load(Ordering::Acquire)
    }

    /// Flipping `false -> true` flushes once immediately, so commands queued
    /// while autoflush was off aren't left sitting in the write buffer.
    pub fn set_autoflush(&self, value: bool) {
        let previous = self.shared.autoflush.swap(value, Ordering::AcqRel);
        if !previous && value {
            let _ = self.shared.job_tx.send(Job::FlushNow);
        }
    }

    pub fn allow_subscriptions(&self) -> bool {
        self.shared.allow_subscriptions.load(Ordering::Acquire)
    }

    /// Flipping `true -> false` while subscribed unsubscribes from every
    /// channel and pattern currently held.
    pub fn set_allow_subscriptions(&self, value: bool) {
        let previous = self.shared.allow_subscriptions.swap(value, Ordering::AcqRel);
        if previous && !value && self.is_subscribed() {
            let (done, _ignored) = oneshot::channel();
            let _ = self.shared.job_tx.send(Job::Unsubscribe {
                targets: Vec::new(),
                on_unsubscribe: None,
                done,
            });
            let (done, _ignored) = oneshot::channel();
            let _ = self.shared.job_tx.send(Job::PUnsubscribe {
                targets: Vec::new(),
                on_unsubscribe: None,
                done,
            });
        }
    }

    /// Sends one or more commands as a batch and returns their replies in
    /// order. A RESP `Error` reply is returned as `RespValue::Error`, not as
    /// an `Err` — only a failure to get a reply at all is an `Err`. Rejected
    /// outright, without writing anything, if `commands` is empty, if the
    /// connection isn't connected, or if a command other than
    /// SUBSCRIBE/UNSUBSCRIBE/PSUBSCRIBE/PUNSUBSCRIBE/PING/QUIT is attempted
    /// while subscribed.
    pub async fn send(&self, commands: Vec<RespValue>) -> Result<Vec<RespValue>, ConnectionError> {
        if commands.is_empty() {
            return Err(ConnectionError::AssertionFailure(
                "cannot send zero commands".into(),
            ));
        }
        if !self.is_connected() {
            return Err(ConnectionError::ConnectionClosed);
        }
        if self.is_subscribed() {
            for cmd in &commands {
                let name = cmd
                    .as_array()
                    .and_then(|items| items.first())
                    .and_then(|v| v.as_bytes())
                    .unwrap_or(b"");
                if !allowed_while_subscribed(name) {
                    return Err(ConnectionError::InPubSubMode);
                }
            }
        }

        let mut encoded = Vec::with_capacity(commands.len());
        for cmd in &commands {
            let mut buf = BytesMut::new();
            cmd.encode_command(&mut buf);
            encoded.push(buf.freeze());
        }

        let mut receivers = Vec::with_capacity(commands.len());
        let mut promises = Vec::with_capacity(commands.len());
        for _ in &commands {
            let (tx, rx) = oneshot::channel();
            promises.push(tx);
            receivers.push(rx);
        }

        self.shared
            .job_tx
            .send(Job::Send {
                encoded,
                promises,
                flush: self.autoflush(),
            })
            .map_err(|_| ConnectionError::ConnectionClosed)?;

        let mut replies = Vec::with_capacity(receivers.len());
        for rx in receivers {
            let value = rx.await.map_err(|_| ConnectionError::ConnectionClosed)??;
            replies.push(value);
        }
        Ok(replies)
    }

    /// Idempotent: writes `QUIT`, awaits its reply, then closes the
    /// transport. Calling `close` on an already-closed connection resolves
    /// immediately with no I/O.
    pub async fn close(&self) {
        let previous = self
            .shared
            .state
            .compare_exchange(
                STATE_OPEN,
                STATE_SHUTTING_DOWN,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .or_else(|_| {
                self.shared.state.compare_exchange(
                    STATE_PUBSUB,
                    STATE_SHUTTING_DOWN,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
            });
        if previous.is_ok() {
            let _ = self.shared.job_tx.send(Job::GracefulClose);
        }
        self.wait_for_close().await;
    }

    async fn wait_for_close(&self) {
        let mut rx = self.shared.closed_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    pub async fn subscribe(
        &self,
        channels: Vec<Bytes>,
        receiver: mpsc::UnboundedSender<Message>,
        on_subscribe: Option<SubHook>,
        on_unsubscribe: Option<SubHook>,
    ) -> Result<(), ConnectionError> {
        self.subscribe_like(
            channels,
            |targets, done| Job::Subscribe {
                targets,
                receiver,
                on_subscribe,
                on_unsubscribe,
                done,
            },
        )
        .await
    }

    pub async fn psubscribe(
        &self,
        patterns: Vec<Bytes>,
        receiver: mpsc::UnboundedSender<PatternMessage>,
        on_subscribe: Option<SubHook>,
        on_unsubscribe: Option<SubHook>,
    ) -> Result<(), ConnectionError> {
        self.subscribe_like(
            patterns,
            |targets, done| Job::PSubscribe {
                targets,
                receiver,
                on_subscribe,
                on_unsubscribe,
                done,
            },
        )
        .await
    }

    async fn subscribe_like(
        &self,
        targets: Vec<Bytes>,
        build: impl FnOnce(Vec<Bytes>, oneshot::Sender<Result<(), ConnectionError>>) -> Job,
    ) -> Result<(), ConnectionError> {
        if !self.allow_subscriptions() {
            return Err(ConnectionError::PubSubNotAllowed);
        }
        if !self.is_connected() {
            return Err(ConnectionError::ConnectionClosed);
        }
        if targets.is_empty() {
            return Err(ConnectionError::AssertionFailure(
                "cannot subscribe to zero targets".into(),
            ));
        }
        let (done, rx) = oneshot::channel();
        self.shared
            .job_tx
            .send(build(targets, done))
            .map_err(|_| ConnectionError::ConnectionClosed)?;
        rx.await.map_err(|_| ConnectionError::ConnectionClosed)?
    }

    /// No-op success when the connection isn't currently subscribed.
    pub async fn unsubscribe(
        &self,
        channels: Vec<Bytes>,
        on_unsubscribe: Option<SubHook>,
    ) -> Result<(), ConnectionError> {
        if !self.is_subscribed() {
            return Ok(());
        }
        let (done, rx) = oneshot::channel();
        self.shared
            .job_tx
            .send(Job::Unsubscribe {
                targets: channels,
                on_unsubscribe,
                done,
            })
            .map_err(|_| ConnectionError::ConnectionClosed)?;
        rx.await.map_err(|_| ConnectionError::ConnectionClosed)?
    }

    pub async fn punsubscribe(
        &self,
        patterns: Vec<Bytes>,
        on_unsubscribe: Option<SubHook>,
    ) -> Result<(), ConnectionError> {
        if !self.is_subscribed() {
            return Ok(());
        }
        let (done, rx) = oneshot::channel();
        self.shared
            .job_tx
            .send(Job::PUnsubscribe {
                targets: patterns,
                on_unsubscribe,
                done,
            })
            .map_err(|_| ConnectionError::ConnectionClosed)?;
        rx.await.map_err(|_| ConnectionError::ConnectionClosed)?
    }

    /// Wraps this connection so every call made through the wrapper logs
    /// under `target` instead of the connection's configured log target. The
    /// underlying connection (and any other handle to it) is unaffected.
    pub fn logging(&self, target: &'static str) -> LoggingConnection {
        LoggingConnection {
            inner: self.clone(),
            log_target: target,
        }
    }
}

impl LoggingConnection {
    pub async fn send(&self, commands: Vec<RespValue>) -> Result<Vec<RespValue>, ConnectionError> {
        log::debug!(target: self.log_target, "sending {} command(s)", commands.len());
        self.inner.send(commands).await
    }

    pub fn connection(&self) -> &Connection {
        &self.inner
    }
}

enum LoopError {
    Protocol(ProtocolError),
    Io(std::io::Error),
}

impl From<ProtocolError> for LoopError {
    fn from(e: ProtocolError) -> Self {
        LoopError::Protocol(e)
    }
}

impl From<std::io::Error> for LoopError {
    fn from(e: std::io::Error) -> Self {
        LoopError::Io(e)
    }
}

impl From<LoopError> for ConnectionError {
    fn from(e: LoopError) -> Self {
        match e {
            LoopError::Protocol(p) => ConnectionError::ProtocolError(p),
            LoopError::Io(io) => ConnectionError::TransportError(io),
        }
    }
}

/// Reads and decodes the next frame, growing `read_buf` and pulling more
/// bytes off the wire as needed. Returns `Ok(None)` on a clean EOF.
async fn read_frame<T: AsyncRead + Unpin>(
    transport: &mut T,
    read_buf: &mut BytesMut,
    codec: &mut RespCodec,
) -> Result<Option<RespValue>, LoopError> {
    loop {
        if let Some(value) = codec.decode(read_buf)? {
            return Ok(Some(value));
        }
        let mut scratch = [0u8; 8192];
        let n = transport.read(&mut scratch).await?;
        if n == 0 {
            return Ok(None);
        }
        read_buf.extend_from_slice(&scratch[..n]);
    }
}

/// The single task that owns the socket, the command correlator, and (while
/// subscribed) the pub/sub dispatcher for one connection's lifetime.
async fn run_event_loop<T>(
    mut transport: T,
    mut job_rx: mpsc::UnboundedReceiver<Job>,
    shared: Arc<Shared>,
    closed_tx: watch::Sender<bool>,
) where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut codec = RespCodec;
    let mut read_buf = BytesMut::with_capacity(8192);
    let mut correlator = Correlator::default();
    let mut dispatcher: Option<PubSubDispatcher> = None;

    let outcome: Result<(), LoopError> = 'outer: loop {
        tokio::select! {
            biased;

            job = job_rx.recv() => {
                let Some(job) = job else {
                    break 'outer Ok(());
                };
                if let Err(e) = handle_job(
                    job,
                    &mut transport,
                    &shared,
                    &mut correlator,
                    &mut dispatcher,
                ).await {
                    break 'outer Err(e);
                }
            }

            frame = read_frame(&mut transport, &mut read_buf, &mut codec) => {
                match frame {
                    Ok(Some(value)) => {
                        let quit_acked = handle_incoming(value, &mut correlator, &mut dispatcher, &shared);
                        if quit_acked {
                            break 'outer Ok(());
                        }
                    }
                    Ok(None) => break 'outer Ok(()),
                    Err(e) => break 'outer Err(e),
                }
            }
        }
    };

    let was_graceful = shared.state.load(Ordering::Acquire) == STATE_SHUTTING_DOWN;
    let _ = transport.shutdown().await;

    correlator.fail_all();
    if let Some(disp) = dispatcher.as_mut() {
        disp.fail_all_pending(|| ConnectionError::ConnectionClosed);
    }

    shared.state.store(STATE_CLOSED, Ordering::Release);
    METRICS.connection_closed();
    let _ = closed_tx.send(true);

    match outcome {
        Ok(()) => {
            if was_graceful {
                log::info!(target: shared.log_target, "connection {} closed", shared.id);
            } else {
                log::warn!(
                    target: shared.log_target,
                    "connection {} closed unexpectedly (peer EOF)",
                    shared.id
                );
            }
        }
        Err(e) => {
            let err: ConnectionError = e.into();
            log::error!(
                target: shared.log_target,
                "connection {} closed after a fatal error: {}",
                shared.id,
                err
            );
        }
    }

    if !was_graceful {
        let handler = shared.unexpected_closure.lock().unwrap().take();
        if let Some(handler) = handler {
            let connection = Connection {
                shared: Arc::clone(&shared),
            };
            handler(&connection);
        }
    }
}

async fn handle_job<T: AsyncWrite + Unpin>(
    job: Job,
    transport: &mut T,
    shared: &Arc<Shared>,
    correlator: &mut Correlator,
    dispatcher: &mut Option<PubSubDispatcher>,
) -> Result<(), LoopError> {
    match job {
        Job::Send {
            encoded,
            promises,
            flush,
        } => {
            for (bytes, promise) in encoded.into_iter().zip(promises.into_iter()) {
                transport.write_all(&bytes).await?;
                correlator.push(PendingEntry::Caller(promise));
            }
            if flush {
                transport.flush().await?;
            }
        }
        Job::FlushNow => {
            transport.flush().await?;
        }
        Job::GracefulClose => {
            let cmd = RespValue::command("QUIT", Vec::<Bytes>::new());
            let mut buf = BytesMut::new();
            cmd.encode_command(&mut buf);
            transport.write_all(&buf).await?;
            transport.flush().await?;
            correlator.push(PendingEntry::Quit);
        }
        Job::Subscribe {
            targets,
            receiver,
            on_subscribe,
            on_unsubscribe,
            done,
        } => {
            let disp = dispatcher.get_or_insert_with(PubSubDispatcher::new);
            shared.state.store(STATE_PUBSUB, Ordering::Release);
            disp.set_on_unsubscribe(on_unsubscribe);
            disp.begin_subscribe(&targets, receiver, on_subscribe, done);
            write_command(transport, "SUBSCRIBE", &targets).await?;
        }
        Job::PSubscribe {
            targets,
            receiver,
            on_subscribe,
            on_unsubscribe,
            done,
        } => {
            let disp = dispatcher.get_or_insert_with(PubSubDispatcher::new);
            shared.state.store(STATE_PUBSUB, Ordering::Release);
            disp.set_on_unsubscribe(on_unsubscribe);
            disp.begin_psubscribe(&targets, receiver, on_subscribe, done);
            write_command(transport, "PSUBSCRIBE", &targets).await?;
        }
        Job::Unsubscribe {
            targets,
            on_unsubscribe,
            done,
        } => {
            if let Some(disp) = dispatcher.as_mut() {
                disp.begin_unsubscribe(&targets, on_unsubscribe, done);
                write_command(transport, "UNSUBSCRIBE", &targets).await?;
            } else {
                let _ = done.send(Ok(()));
            }
        }
        Job::PUnsubscribe {
            targets,
            on_unsubscribe,
            done,
        } => {
            if let Some(disp) = dispatcher.as_mut() {
                disp.begin_punsubscribe(&targets, on_unsubscribe, done);
                write_command(transport, "PUNSUBSCRIBE", &targets).await?;
            } else {
                let _ = done.send(Ok(()));
            }
        }
    }
    Ok(())
}

async fn write_command<T: AsyncWrite + Unpin>(
    transport: &mut T,
    name: &str,
    targets: &[Bytes],
) -> Result<(), LoopError> {
    let cmd = RespValue::command(name, targets.to_vec());
    let mut buf = BytesMut::new();
    cmd.encode_command(&mut buf);
    transport.write_all(&buf).await?;
    transport.flush().await?;
    Ok(())
}

/// Returns `true` once the synthetic `QUIT` marker has been acknowledged —
/// the event loop's signal that it can tear the transport down immediately
/// rather than waiting for the peer to close its end.
fn handle_incoming(
    value: RespValue,
    correlator: &mut Correlator,
    dispatcher: &mut Option<PubSubDispatcher>,
    shared: &Arc<Shared>,
) -> bool {
    if let Some(disp) = dispatcher.as_mut() {
        if let Some(classified) = classify(&value) {
            match classified {
                Classified::Ack { kind, target, count } => {
                    let now_empty = disp.on_ack(kind, target, count);
                    if now_empty {
                        *dispatcher = None;
                        shared.state.store(STATE_OPEN, Ordering::Release);
                        log::info!(target: shared.log_target, "connection {} left pub/sub mode", shared.id);
                    }
                }
                Classified::Message(m) => disp.route_message(m),
                Classified::PMessage(m) => disp.route_pmessage(m),
            }
            return false;
        }
    }

    correlator.resolve_oldest(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use tokio::io::DuplexStream;

    fn ping() -> RespValue {
        RespValue::command("PING", Vec::<Bytes>::new())
    }

    async fn read_one_frame(io: &mut DuplexStream, buf: &mut BytesMut) -> RespValue {
        let mut codec = RespCodec;
        loop {
            if let Some(v) = codec.decode(buf).unwrap() {
                return v;
            }
            let mut scratch = [0u8; 1024];
            let n = io.read(&mut scratch).await.unwrap();
            assert!(n > 0, "peer closed before a full frame arrived");
            buf.extend_from_slice(&scratch[..n]);
        }
    }

    fn ack_frame(kind: &str, target: &[u8], count: i64) -> Bytes {
        let mut out = BytesMut::new();
        out.put_slice(b"*3\r\n");
        out.put_slice(format!("${}\r\n", kind.len()).as_bytes());
        out.put_slice(kind.as_bytes());
        out.put_slice(b"\r\n");
        out.put_slice(format!("${}\r\n", target.len()).as_bytes());
        out.put_slice(target);
        out.put_slice(b"\r\n");
        out.put_slice(format!(":{}\r\n", count).as_bytes());
        out.freeze()
    }

    /// Drives a script of (expected command name, reply bytes) pairs against
    /// one half of a duplex pipe, standing in for a real redis-server.
    /// Returns once the script is exhausted or the client half closes.
    async fn run_scripted_server(mut io: DuplexStream, script: Vec<(&'static str, Bytes)>) {
        let mut buf = BytesMut::with_capacity(1024);
        for (expected_name, reply) in script {
            let frame = read_one_frame(&mut io, &mut buf).await;
            let name = frame
                .as_array()
                .and_then(|items| items.first())
                .and_then(|v| v.as_bytes())
                .unwrap_or(b"");
            assert!(
                name.eq_ignore_ascii_case(expected_name.as_bytes()),
                "expected {} got {:?}",
                expected_name,
                String::from_utf8_lossy(name)
            );
            if io.write_all(&reply).await.is_err() {
                return;
            }
            let _ = io.flush().await;
        }
    }

    #[tokio::test]
    async fn send_awaits_the_matching_reply() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let connection = Connection::spawn(client_io, "test");
        tokio::spawn(run_scripted_server(
            server_io,
            vec![
                ("PING", Bytes::from_static(b"+PONG\r\n")),
                ("QUIT", Bytes::from_static(b"+OK\r\n")),
            ],
        ));

        let replies = connection.send(vec![ping()]).await.unwrap();
        assert_eq!(
            replies,
            vec![RespValue::SimpleString(Bytes::from_static(b"PONG"))]
        );

        connection.close().await;
        assert!(!connection.is_connected());
    }

    #[tokio::test]
    async fn subscribe_and_unsubscribe_drive_the_state_machine() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let connection = Connection::spawn(client_io, "test");
        tokio::spawn(run_scripted_server(
            server_io,
            vec![
                ("SUBSCRIBE", ack_frame("subscribe", b"news", 1)),
                ("UNSUBSCRIBE", ack_frame("unsubscribe", b"news", 0)),
                ("QUIT", Bytes::from_static(b"+OK\r\n")),
            ],
        ));

        assert!(!connection.is_subscribed());
        let (tx, _rx) = mpsc::unbounded_channel();
        connection
            .subscribe(vec![Bytes::from_static(b"news")], tx, None, None)
            .await
            .unwrap();
        assert!(connection.is_subscribed());

        connection
            .unsubscribe(vec![Bytes::from_static(b"news")], None)
            .await
            .unwrap();
        assert!(!connection.is_subscribed());

        connection.close().await;
    }

    #[tokio::test]
    async fn graceful_close_resolves_once_quit_is_acknowledged() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let connection = Connection::spawn(client_io, "test");
        tokio::spawn(run_scripted_server(
            server_io,
            vec![("QUIT", Bytes::from_static(b"+OK\r\n"))],
        ));

        connection.close().await;
        assert!(!connection.is_connected());
        // Idempotent: a second close on an already-closed connection must
        // resolve immediately without sending anything else down the wire.
        connection.close().await;
    }

    #[tokio::test]
    async fn unexpected_closure_handler_fires_when_peer_drops_without_close() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let connection = Connection::spawn(client_io, "test");

        let (fired_tx, fired_rx) = oneshot::channel();
        connection.set_unexpected_closure_handler(move |conn| {
            assert!(!conn.is_connected());
            let _ = fired_tx.send(());
        });

        drop(server_io);

        fired_rx.await.unwrap();
        assert!(!connection.is_connected());
    }

    #[tokio::test]
    async fn setex_round_trip_records_success_and_round_trip_time() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let connection = Connection::spawn(client_io, "test");
        tokio::spawn(run_scripted_server(
            server_io,
            vec![
                ("SETEX", Bytes::from_static(b"+OK\r\n")),
                ("QUIT", Bytes::from_static(b"+OK\r\n")),
            ],
        ));

        let success_before = METRICS.command_success_count();
        let replies = connection
            .send(vec![crate::command::setex("key", "value", 5)])
            .await
            .unwrap();
        assert_eq!(
            replies,
            vec![RespValue::SimpleString(Bytes::from_static(b"OK"))]
        );
        assert!(METRICS.command_success_count() > success_before);

        connection.close().await;
    }

    #[tokio::test]
    async fn empty_batch_is_rejected_synchronously() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let connection = Connection::spawn(client_io, "test");
        tokio::spawn(run_scripted_server(
            server_io,
            vec![("QUIT", Bytes::from_static(b"+OK\r\n"))],
        ));

        let result = connection.send(Vec::new()).await;
        assert!(matches!(
            result,
            Err(ConnectionError::AssertionFailure(_))
        ));

        connection.close().await;
    }

    #[tokio::test]
    async fn forbidden_command_while_subscribed_fails_locally_without_writing_anything() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let connection = Connection::spawn(client_io, "test");
        tokio::spawn(run_scripted_server(
            server_io,
            vec![
                ("SUBSCRIBE", ack_frame("subscribe", b"news", 1)),
                // If the rejected GET were ever written, the server would
                // see "GET" here instead and this assertion would fail.
                ("UNSUBSCRIBE", ack_frame("unsubscribe", b"news", 0)),
                ("QUIT", Bytes::from_static(b"+OK\r\n")),
            ],
        ));

        let (tx, _rx) = mpsc::unbounded_channel();
        connection
            .subscribe(vec![Bytes::from_static(b"news")], tx, None, None)
            .await
            .unwrap();
        assert!(connection.is_subscribed());

        let result = connection.send(vec![crate::command::get("k")]).await;
        assert!(matches!(result, Err(ConnectionError::InPubSubMode)));

        connection
            .unsubscribe(vec![Bytes::from_static(b"news")], None)
            .await
            .unwrap();
        connection.close().await;
    }

    #[tokio::test]
    async fn subscribe_then_pushed_message_is_routed_to_the_receiver() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let connection = Connection::spawn(client_io, "test");

        tokio::spawn(async move {
            let mut io = server_io;
            let mut buf = BytesMut::with_capacity(1024);

            let subscribe_frame = read_one_frame(&mut io, &mut buf).await;
            let name = subscribe_frame
                .as_array()
                .and_then(|items| items.first())
                .and_then(|v| v.as_bytes())
                .unwrap_or(b"");
            assert!(name.eq_ignore_ascii_case(b"SUBSCRIBE"));
            io.write_all(&ack_frame("subscribe", b"news", 1)).await.unwrap();
            let _ = io.flush().await;

            let mut push = BytesMut::new();
            push.put_slice(b"*3\r\n$7\r\nmessage\r\n$4\r\nnews\r\n$5\r\nhello\r\n");
            io.write_all(&push).await.unwrap();
            let _ = io.flush().await;

            let unsubscribe_frame = read_one_frame(&mut io, &mut buf).await;
            let name = unsubscribe_frame
                .as_array()
                .and_then(|items| items.first())
                .and_then(|v| v.as_bytes())
                .unwrap_or(b"");
            assert!(name.eq_ignore_ascii_case(b"UNSUBSCRIBE"));
            io.write_all(&ack_frame("unsubscribe", b"news", 0)).await.unwrap();
            let _ = io.flush().await;

            let quit_frame = read_one_frame(&mut io, &mut buf).await;
            let name = quit_frame
                .as_array()
                .and_then(|items| items.first())
                .and_then(|v| v.as_bytes())
                .unwrap_or(b"");
            assert!(name.eq_ignore_ascii_case(b"QUIT"));
            io.write_all(b"+OK\r\n").await.unwrap();
            let _ = io.flush().await;
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let messages_before = METRICS.subscription_messages_received_count();

        connection
            .subscribe(vec![Bytes::from_static(b"news")], tx, None, None)
            .await
            .unwrap();

        let message = rx.recv().await.expect("message receiver dropped early");
        assert_eq!(message.channel, Bytes::from_static(b"news"));
        assert_eq!(message.payload, Bytes::from_static(b"hello"));
        assert!(METRICS.subscription_messages_received_count() > messages_before);

        connection
            .unsubscribe(vec![Bytes::from_static(b"news")], None)
            .await
            .unwrap();
        connection.close().await;
    }

    /// An `AsyncRead + AsyncWrite` wrapper that counts `poll_flush` calls,
    /// so a test can observe exactly how many explicit flushes the event
    /// loop issued rather than inferring it from wire timing.
    struct FlushCounting<T> {
        inner: T,
        flushes: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    }

    impl<T: AsyncRead + Unpin> AsyncRead for FlushCounting<T> {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            let this = self.get_mut();
            std::pin::Pin::new(&mut this.inner).poll_read(cx, buf)
        }
    }

    impl<T: AsyncWrite + Unpin> AsyncWrite for FlushCounting<T> {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            let this = self.get_mut();
            std::pin::Pin::new(&mut this.inner).poll_write(cx, buf)
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            let this = self.get_mut();
            this.flushes.fetch_add(1, Ordering::SeqCst);
            std::pin::Pin::new(&mut this.inner).poll_flush(cx)
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            let this = self.get_mut();
            std::pin::Pin::new(&mut this.inner).poll_shutdown(cx)
        }
    }

    #[tokio::test]
    async fn pipelined_writes_flush_exactly_once_between_buffered_sends_and_the_autoflush_flip() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let flushes = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let transport = FlushCounting {
            inner: client_io,
            flushes: std::sync::Arc::clone(&flushes),
        };
        let connection = Connection::spawn(transport, "test");
        tokio::spawn(run_scripted_server(
            server_io,
            vec![
                ("SETEX", Bytes::from_static(b"+OK\r\n")),
                ("SETEX", Bytes::from_static(b"+OK\r\n")),
                ("PING", Bytes::from_static(b"+PONG\r\n")),
                ("QUIT", Bytes::from_static(b"+OK\r\n")),
            ],
        ));

        connection.set_autoflush(false);
        assert_eq!(flushes.load(Ordering::SeqCst), 0);

        connection
            .send(vec![crate::command::setex("k1", "v1", 500)])
            .await
            .unwrap();
        connection
            .send(vec![crate::command::setex("k2", "v2", 500)])
            .await
            .unwrap();
        assert_eq!(
            flushes.load(Ordering::SeqCst),
            0,
            "no flush should occur while autoflush is off"
        );

        connection.set_autoflush(true);

        // Jobs are processed strictly in FIFO order by the single event-loop
        // task, so by the time this PING's reply arrives, the flush job the
        // autoflush flip enqueued ahead of it has already run.
        connection.send(vec![ping()]).await.unwrap();
        assert_eq!(
            flushes.load(Ordering::SeqCst),
            2,
            "one flush from the autoflush flip, one from the flushed PING write"
        );

        connection.close().await;
    }
}
