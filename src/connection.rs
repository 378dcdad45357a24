//! A single connection to one store node.
//!
//! All socket I/O and all connection state (the pending-reply FIFO and the
//! pub/sub registry) live inside one spawned task; callers talk to it
//! through an inbox channel, so submission order is write order and no
//! locking happens on the hot path. Each submitted command carries a oneshot
//! that resolves with the correlated reply, or with a synthetic disconnect
//! error when the socket dies first.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::command::Command;
use crate::config::{ConnectionConfig, ProtocolVersion, ServerAddr};
use crate::error::DriverError;
use crate::resp::{self, RespValue};

/// Connection lifecycle. A socket instance ends in `Disconnected` and stays
/// there; reconnecting means building a new [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
}

/// An out-of-band message delivered to a subscriber.
///
/// `items` is the raw push frame: `["message", channel, payload]` or
/// `["pmessage", pattern, channel, payload]`.
#[derive(Debug, Clone)]
pub struct PushMessage {
    pub items: Vec<RespValue>,
}

impl PushMessage {
    pub fn kind(&self) -> Option<&str> {
        self.items.first().and_then(|head| head.as_str())
    }

    pub fn channel(&self) -> Option<&str> {
        let index = if self.kind() == Some("pmessage") { 2 } else { 1 };
        self.items.get(index).and_then(|item| item.as_str())
    }

    pub fn payload(&self) -> Option<&RespValue> {
        self.items.last()
    }
}

/// Receives push messages for one subscription call.
pub type PushReceiver = mpsc::UnboundedReceiver<PushMessage>;

/// A reply that has been written to the wire but not yet received.
pub struct PendingResponse {
    rx: oneshot::Receiver<Result<RespValue, DriverError>>,
}

impl PendingResponse {
    pub async fn wait(self) -> Result<RespValue, DriverError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(DriverError::ConnectionClosed),
        }
    }
}

enum ConnRequest {
    Dispatch {
        command: Command,
        push_sender: Option<mpsc::UnboundedSender<PushMessage>>,
        reply: oneshot::Sender<Result<RespValue, DriverError>>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Handle to a connection task. Cheap to clone; the task shuts down when
/// every handle is dropped or after an explicit [`Connection::close`].
#[derive(Clone)]
pub struct Connection {
    inbox: mpsc::UnboundedSender<ConnRequest>,
    state: watch::Receiver<ConnState>,
    addr: ServerAddr,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Spawns the connection task and returns immediately. The connection
    /// starts in `Connecting`; commands submitted before the dial finishes
    /// queue in the inbox and flush in submission order once connected.
    pub fn open(config: ConnectionConfig) -> Connection {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnState::Connecting);
        let addr = config.addr.clone();

        tokio::spawn(run_connection(config, inbox_rx, state_tx));

        Connection {
            inbox: inbox_tx,
            state: state_rx,
            addr,
        }
    }

    /// Opens a connection and waits for the dial and setup sequence to
    /// finish, surfacing connect errors eagerly.
    pub async fn connect(config: ConnectionConfig) -> Result<Connection, DriverError> {
        let conn = Connection::open(config);
        let mut state = conn.state.clone();
        loop {
            match *state.borrow() {
                ConnState::Connected => return Ok(conn),
                ConnState::Disconnected => return Err(DriverError::ConnectionClosed),
                ConnState::Connecting => {}
            }
            if state.changed().await.is_err() {
                return Err(DriverError::ConnectionClosed);
            }
        }
    }

    pub fn addr(&self) -> &ServerAddr {
        &self.addr
    }

    /// True when both handles talk to the same connection task.
    pub fn same_task(&self, other: &Connection) -> bool {
        self.inbox.same_channel(&other.inbox)
    }

    pub fn state(&self) -> ConnState {
        *self.state.borrow()
    }

    /// Resolves once the connection has transitioned to `Disconnected`.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        while *state.borrow() != ConnState::Disconnected {
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    /// Enqueues a command and returns a future for its reply. The command
    /// is written (or queued for write, while connecting) immediately, so
    /// several dispatches pipeline on the wire in submission order.
    pub fn dispatch(&self, command: Command) -> Result<PendingResponse, DriverError> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(ConnRequest::Dispatch {
                command,
                push_sender: None,
                reply: tx,
            })
            .map_err(|_| DriverError::ConnectionClosed)?;
        Ok(PendingResponse { rx })
    }

    /// Sends one command and waits for its reply. Error replies are
    /// returned as values; transport failures as errors.
    pub async fn send(&self, command: Command) -> Result<RespValue, DriverError> {
        self.dispatch(command)?.wait().await
    }

    /// Subscribes to exact channels. All named channels deliver into the
    /// returned receiver; the result resolves with the final confirmation.
    pub async fn subscribe(&self, channels: Vec<String>) -> Result<PushReceiver, DriverError> {
        let command = Command::new("SUBSCRIBE").args(channels);
        self.subscribe_with(command).await
    }

    /// Subscribes to glob patterns (`PSUBSCRIBE`).
    pub async fn psubscribe(&self, patterns: Vec<String>) -> Result<PushReceiver, DriverError> {
        let command = Command::new("PSUBSCRIBE").args(patterns);
        self.subscribe_with(command).await
    }

    async fn subscribe_with(&self, command: Command) -> Result<PushReceiver, DriverError> {
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(ConnRequest::Dispatch {
                command,
                push_sender: Some(push_tx),
                reply: tx,
            })
            .map_err(|_| DriverError::ConnectionClosed)?;
        match rx.await {
            Ok(Ok(RespValue::Error(line))) => Err(DriverError::Server(
                crate::error::ServerError::from_line(&line),
            )),
            Ok(Ok(_)) => Ok(push_rx),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(DriverError::ConnectionClosed),
        }
    }

    /// Unsubscribes from the given channels, or from every channel when
    /// the list is empty.
    pub async fn unsubscribe(&self, channels: Vec<String>) -> Result<(), DriverError> {
        self.send(Command::new("UNSUBSCRIBE").args(channels))
            .await
            .map(|_| ())
    }

    /// Unsubscribes from the given patterns, or from every pattern when
    /// the list is empty.
    pub async fn punsubscribe(&self, patterns: Vec<String>) -> Result<(), DriverError> {
        self.send(Command::new("PUNSUBSCRIBE").args(patterns))
            .await
            .map(|_| ())
    }

    /// Gracefully closes the connection. In-flight requests that already
    /// reached the wire are failed with the disconnect error.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inbox.send(ConnRequest::Close { done: tx }).is_ok() {
            let _ = rx.await;
        }
    }
}

struct PendingReply {
    remaining: usize,
    tx: oneshot::Sender<Result<RespValue, DriverError>>,
}

#[derive(Default)]
struct PubSubRegistry {
    channels: HashMap<String, mpsc::UnboundedSender<PushMessage>>,
    patterns: HashMap<String, mpsc::UnboundedSender<PushMessage>>,
}

impl PubSubRegistry {
    fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.patterns.is_empty()
    }
}

enum Transport {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Transport {
    async fn connect(addr: &ServerAddr, connect_timeout: Duration) -> Result<Self, DriverError> {
        match addr {
            ServerAddr::Tcp(host, port) => {
                let stream = timeout(connect_timeout, TcpStream::connect((host.as_str(), *port)))
                    .await
                    .map_err(|_| DriverError::Timeout)??;
                stream.set_nodelay(true)?;
                Ok(Transport::Tcp(stream))
            }
            #[cfg(unix)]
            ServerAddr::Unix(path) => {
                let stream = timeout(connect_timeout, UnixStream::connect(path))
                    .await
                    .map_err(|_| DriverError::Timeout)??;
                Ok(Transport::Unix(stream))
            }
            #[cfg(not(unix))]
            ServerAddr::Unix(_) => Err(DriverError::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            ))),
        }
    }

    async fn read_buf(&mut self, buf: &mut BytesMut) -> std::io::Result<usize> {
        match self {
            Transport::Tcp(stream) => stream.read_buf(buf).await,
            #[cfg(unix)]
            Transport::Unix(stream) => stream.read_buf(buf).await,
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Transport::Tcp(stream) => {
                stream.write_all(data).await?;
                stream.flush().await
            }
            #[cfg(unix)]
            Transport::Unix(stream) => {
                stream.write_all(data).await?;
                stream.flush().await
            }
        }
    }
}

async fn run_connection(
    config: ConnectionConfig,
    mut inbox: mpsc::UnboundedReceiver<ConnRequest>,
    state_tx: watch::Sender<ConnState>,
) {
    let mut task = match ConnectionTask::establish(&config).await {
        Ok(task) => task,
        Err(err) => {
            warn!(addr = %config.addr, error = %err, "connection setup failed");
            let _ = state_tx.send(ConnState::Disconnected);
            drain_inbox(&mut inbox);
            return;
        }
    };

    let _ = state_tx.send(ConnState::Connected);
    debug!(addr = %config.addr, "connected");

    if let Err(err) = task.serve(&mut inbox).await {
        debug!(addr = %config.addr, error = %err, "connection terminated");
    }

    task.fail_pending();
    let _ = state_tx.send(ConnState::Disconnected);
    drain_inbox(&mut inbox);
}

/// Fails every request still queued in the inbox after disconnect.
fn drain_inbox(inbox: &mut mpsc::UnboundedReceiver<ConnRequest>) {
    inbox.close();
    while let Ok(request) = inbox.try_recv() {
        match request {
            ConnRequest::Dispatch { reply, .. } => {
                let _ = reply.send(Err(DriverError::ConnectionClosed));
            }
            ConnRequest::Close { done } => {
                let _ = done.send(());
            }
        }
    }
}

struct ConnectionTask {
    transport: Transport,
    pending: VecDeque<PendingReply>,
    registry: PubSubRegistry,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl ConnectionTask {
    async fn establish(config: &ConnectionConfig) -> Result<Self, DriverError> {
        let transport = Transport::connect(&config.addr, config.connect_timeout).await?;
        let mut task = ConnectionTask {
            transport,
            pending: VecDeque::new(),
            registry: PubSubRegistry::default(),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(512),
        };
        // A server that accepts but never answers the handshake must not
        // wedge the connection in Connecting forever.
        timeout(config.connect_timeout, task.setup(config))
            .await
            .map_err(|_| DriverError::Timeout)??;
        Ok(task)
    }

    /// Connect-time handshake: negotiate RESP3, authenticate, select the
    /// configured database. Runs before the inbox is served, so queued
    /// commands never interleave with setup.
    async fn setup(&mut self, config: &ConnectionConfig) -> Result<(), DriverError> {
        if config.protocol == ProtocolVersion::Resp3 {
            let mut hello = Command::new("HELLO").arg("3".to_string());
            if let Some(password) = &config.password {
                let username = config.username.clone().unwrap_or_else(|| "default".to_string());
                hello = hello
                    .arg("AUTH".to_string())
                    .arg(username)
                    .arg(password.clone());
            }
            match self.roundtrip(hello).await? {
                RespValue::Error(line) => {
                    // Pre-RESP3 server: stay on RESP2 and authenticate the
                    // old way below.
                    warn!(error = %line, "HELLO rejected, staying on RESP2");
                    self.auth(config).await?;
                }
                _ => return self.select_db(config).await,
            }
        } else {
            self.auth(config).await?;
        }
        self.select_db(config).await
    }

    async fn auth(&mut self, config: &ConnectionConfig) -> Result<(), DriverError> {
        let Some(password) = &config.password else {
            return Ok(());
        };
        let mut auth = Command::new("AUTH");
        if let Some(username) = &config.username {
            auth = auth.arg(username.clone());
        }
        auth = auth.arg(password.clone());
        match self.roundtrip(auth).await? {
            RespValue::Error(line) => Err(DriverError::Server(
                crate::error::ServerError::from_line(&line),
            )),
            _ => Ok(()),
        }
    }

    async fn select_db(&mut self, config: &ConnectionConfig) -> Result<(), DriverError> {
        if config.database == 0 {
            return Ok(());
        }
        let select = Command::new("SELECT").arg(config.database.to_string());
        match self.roundtrip(select).await? {
            RespValue::Error(line) => Err(DriverError::Server(
                crate::error::ServerError::from_line(&line),
            )),
            _ => Ok(()),
        }
    }

    /// Writes one command and reads its reply directly; only valid before
    /// the pending queue is in use.
    async fn roundtrip(&mut self, command: Command) -> Result<RespValue, DriverError> {
        self.write_buf.clear();
        command.encode(&mut self.write_buf);
        let frame = self.write_buf.split().freeze();
        self.transport.write_all(&frame).await?;
        self.read_frame().await
    }

    async fn read_frame(&mut self) -> Result<RespValue, DriverError> {
        loop {
            if let Some((value, consumed)) = resp::decode(&self.read_buf)? {
                self.read_buf.advance(consumed);
                return Ok(value);
            }
            let n = self.transport.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(DriverError::ConnectionClosed);
            }
        }
    }

    async fn serve(
        &mut self,
        inbox: &mut mpsc::UnboundedReceiver<ConnRequest>,
    ) -> Result<(), DriverError> {
        loop {
            tokio::select! {
                request = inbox.recv() => match request {
                    Some(ConnRequest::Dispatch { command, push_sender, reply }) => {
                        self.handle_dispatch(command, push_sender, reply).await?;
                    }
                    Some(ConnRequest::Close { done }) => {
                        let _ = done.send(());
                        return Err(DriverError::ConnectionClosed);
                    }
                    // Every handle dropped: nothing can submit anymore.
                    None => return Err(DriverError::ConnectionClosed),
                },
                read = self.transport.read_buf(&mut self.read_buf) => {
                    let n = read?;
                    if n == 0 {
                        return Err(DriverError::ConnectionClosed);
                    }
                    self.drain_frames()?;
                }
            }
        }
    }

    async fn handle_dispatch(
        &mut self,
        command: Command,
        push_sender: Option<mpsc::UnboundedSender<PushMessage>>,
        reply: oneshot::Sender<Result<RespValue, DriverError>>,
    ) -> Result<(), DriverError> {
        // Registry bookkeeping happens here, inside the task, so the
        // expected-reply count for a bare unsubscribe reflects the registry
        // at the moment this command is serialized onto the wire.
        let expected = if command.is_subscribe() {
            if let Some(sender) = push_sender {
                self.register_subscriptions(&command, sender);
            }
            command.expected_replies(0)
        } else if command.is_unsubscribe() {
            let registered = self.unregister_subscriptions(&command);
            command.expected_replies(registered)
        } else {
            command.expected_replies(0)
        };

        self.write_buf.clear();
        command.encode(&mut self.write_buf);
        let frame = self.write_buf.split().freeze();
        self.transport.write_all(&frame).await?;

        self.pending.push_back(PendingReply {
            remaining: expected.max(1),
            tx: reply,
        });
        Ok(())
    }

    fn register_subscriptions(
        &mut self,
        command: &Command,
        sender: mpsc::UnboundedSender<PushMessage>,
    ) {
        let is_pattern = command.base_name() == "PSUBSCRIBE";
        for arg in command.arg_slices().iter().skip(1) {
            let key = String::from_utf8_lossy(arg).into_owned();
            if is_pattern {
                self.registry.patterns.insert(key, sender.clone());
            } else {
                self.registry.channels.insert(key, sender.clone());
            }
        }
    }

    /// Removes the named (or all) registrations and returns how many were
    /// registered before the call, which drives the expected-reply count.
    fn unregister_subscriptions(&mut self, command: &Command) -> usize {
        let is_pattern = command.base_name() == "PUNSUBSCRIBE";
        let registry = if is_pattern {
            &mut self.registry.patterns
        } else {
            &mut self.registry.channels
        };

        let named: Vec<String> = command
            .arg_slices()
            .iter()
            .skip(1)
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect();

        if named.is_empty() {
            let registered = registry.len();
            registry.clear();
            registered
        } else {
            for key in &named {
                registry.remove(key);
            }
            named.len()
        }
    }

    fn drain_frames(&mut self) -> Result<(), DriverError> {
        while let Some((value, consumed)) = resp::decode(&self.read_buf)? {
            self.read_buf.advance(consumed);
            self.dispatch_frame(value)?;
        }
        Ok(())
    }

    /// Routes one inbound frame. Push-shaped frames go to the pub/sub
    /// registry before any FIFO pop, since pushes arrive at any time
    /// interleaved with correlated replies, and consume no pending slot.
    fn dispatch_frame(&mut self, value: RespValue) -> Result<(), DriverError> {
        match push_route(&value, &self.registry) {
            PushRoute::Subscriber => {
                self.dispatch_push(value);
                return Ok(());
            }
            PushRoute::Discard => {
                debug!("dropping unhandled push frame");
                return Ok(());
            }
            PushRoute::Correlated => {}
        }

        let Some(front) = self.pending.front_mut() else {
            // A reply nobody asked for means the stream is desynchronized.
            return Err(DriverError::StrayReply);
        };
        front.remaining -= 1;
        if front.remaining == 0 {
            let reply = self.pending.pop_front().expect("front exists");
            let _ = reply.tx.send(Ok(value));
        }
        Ok(())
    }

    fn dispatch_push(&mut self, value: RespValue) {
        let items = match value {
            RespValue::Push(items) | RespValue::Array(items) => items,
            _ => return,
        };
        let message = PushMessage { items };

        let (registry, key) = match message.kind() {
            Some("pmessage") => (
                &mut self.registry.patterns,
                message.items.get(1).and_then(|item| item.as_str()),
            ),
            _ => (&mut self.registry.channels, message.channel()),
        };

        let Some(key) = key.map(str::to_string) else {
            debug!("push frame without a channel field");
            return;
        };

        if let Some(sender) = registry.get(&key) {
            if sender.send(message).is_err() {
                // Receiver dropped: forget the registration.
                registry.remove(&key);
            }
        } else {
            debug!(channel = %key, "push for unregistered channel");
        }
    }

    /// Fails every in-flight request, in submission order, with the
    /// synthetic disconnect error.
    fn fail_pending(&mut self) {
        for reply in self.pending.drain(..) {
            let _ = reply.tx.send(Err(DriverError::ConnectionClosed));
        }
        self.registry.channels.clear();
        self.registry.patterns.clear();
    }
}

enum PushRoute {
    /// Deliver to the pub/sub registry.
    Subscriber,
    /// Correlate against the pending FIFO.
    Correlated,
    /// Out-of-band frame nobody registered for.
    Discard,
}

fn push_route(value: &RespValue, registry: &PubSubRegistry) -> PushRoute {
    match value {
        RespValue::Push(items) => match items.first().and_then(|head| head.as_bytes()) {
            // RESP3 delivers subscribe confirmations as push frames, but
            // they still correlate with the command that caused them.
            Some(b"subscribe") | Some(b"unsubscribe") | Some(b"psubscribe")
            | Some(b"punsubscribe") => PushRoute::Correlated,
            Some(b"message") | Some(b"pmessage") => PushRoute::Subscriber,
            _ => PushRoute::Discard,
        },
        RespValue::Array(_) if !registry.is_empty() && value.is_push_message() => {
            PushRoute::Subscriber
        }
        _ => PushRoute::Correlated,
    }
}
