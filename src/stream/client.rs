//! Realtime stream client with bounded automatic reconnects.
//!
//! [`StreamClient`] is a cheap cloneable handle. All state transitions run on
//! one background worker task: commands from the handle, connection attempt
//! results, retry timer expiries and inbound frames are applied strictly one
//! at a time. Attempts and timers carry a generation id so that a completion
//! arriving after cancellation is recognized as stale and discarded.
//!
//! Dropping the last handle (or calling [`StreamClient::shutdown`]) tears the
//! worker down: the pending timer is cancelled, the connection is closed and
//! no further transitions occur. A [`WeakStreamClient`] does not count as a
//! handle for this purpose.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{debug, info, warn};

use crate::retry::{with_timeout, RetryDecision, RetryPolicy, RetryState};
use crate::stream::history::{MessageHistory, DEFAULT_HISTORY_CAPACITY};
use crate::stream::proto::{decode_frame, encode_payload, StreamMessage};
use crate::stream::transport::{Connector, TransportChannels, WebSocketConnector};

/// Default tunables for [`StreamClientOptions`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamClientDefaults;

impl StreamClientDefaults {
    pub const RECONNECT_INTERVAL: Duration = Duration::from_millis(5_000);
    pub const MAX_RETRIES: u32 = 5;
    pub const HISTORY_CAPACITY: usize = DEFAULT_HISTORY_CAPACITY;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Construction-time configuration for a [`StreamClient`].
#[derive(Clone, Debug)]
pub struct StreamClientOptions {
    /// Fixed delay between automatic reconnect attempts.
    pub reconnect_interval: Duration,
    /// Maximum automatic reconnect attempts after a connection loss.
    pub max_retries: u32,
    /// Number of recent messages kept in history.
    pub history_capacity: usize,
    /// Upper bound for a single connection attempt.
    pub connect_timeout: Duration,
    /// Issue the first `connect()` as soon as the client is built.
    pub auto_connect: bool,
}

impl Default for StreamClientOptions {
    fn default() -> Self {
        Self {
            reconnect_interval: StreamClientDefaults::RECONNECT_INTERVAL,
            max_retries: StreamClientDefaults::MAX_RETRIES,
            history_capacity: StreamClientDefaults::HISTORY_CAPACITY,
            connect_timeout: StreamClientDefaults::CONNECT_TIMEOUT,
            auto_connect: true,
        }
    }
}

impl StreamClientOptions {
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.reconnect_interval, self.max_retries)
    }
}

/// Position of the client in its connection state machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// Never connected.
    Idle,
    /// An attempt is in flight.
    Connecting,
    /// A connection is live.
    Open,
    /// Connection lost; retry number `attempt` is scheduled.
    ///
    /// `attempt` is fixed when the retry is scheduled. A later
    /// [`StreamClient::reset_attempts`] resets the counter for the next loss
    /// but leaves this state as it is.
    ClosedRetrying { attempt: u32 },
    /// Connection lost with no retries left. Only `reconnect()` leaves this.
    ClosedExhausted,
    /// Closed by `disconnect()`.
    ClosedManual,
}

impl ConnectionState {
    pub fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn status(self) -> StreamConnectionStatus {
        if self.is_open() {
            StreamConnectionStatus::Connected
        } else {
            StreamConnectionStatus::Disconnected
        }
    }
}

/// Coarse connection status exposed to consumers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamConnectionStatus {
    Connected,
    Disconnected,
}

/// Errors produced by stream transport and protocol handling.
#[derive(Debug, Error)]
pub enum StreamClientError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Endpoint could not be turned into a connection request.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Connection attempt did not complete in time.
    #[error("connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// No connection is currently open.
    #[error("stream is not connected")]
    NotConnected,

    /// The client worker has shut down.
    #[error("stream client is closed")]
    ClientClosed,

    /// Stream protocol or transport contract error.
    #[error("protocol error: {0}")]
    Protocol(String),
}

type MessageHandler<M> = Arc<dyn Fn(&M) + Send + Sync>;
type LifecycleHandler = Arc<dyn Fn() + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&StreamClientError) + Send + Sync>;
type StateHandler = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Callback slots invoked from the client worker.
///
/// Each slot holds at most one handler. Handlers run synchronously with the
/// event that triggered them and must not block. Commands are queued, so a
/// handler may call back into the client through a [`WeakStreamClient`]. A
/// strong [`StreamClient`] captured by a handler keeps the worker alive after
/// every other handle is gone.
pub struct StreamHandlers<M> {
    on_message: Option<MessageHandler<M>>,
    on_connect: Option<LifecycleHandler>,
    on_disconnect: Option<LifecycleHandler>,
    on_error: Option<ErrorHandler>,
    on_state_change: Option<StateHandler>,
}

impl<M> StreamHandlers<M> {
    pub fn new() -> Self {
        Self {
            on_message: None,
            on_connect: None,
            on_disconnect: None,
            on_error: None,
            on_state_change: None,
        }
    }

    /// Called for every decoded message, in receipt order.
    pub fn on_message(mut self, handler: impl Fn(&M) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(handler));
        self
    }

    /// Called when a connection opens.
    pub fn on_connect(mut self, handler: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(handler));
        self
    }

    /// Called when a connection closes or an attempt fails.
    pub fn on_disconnect(mut self, handler: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(handler));
        self
    }

    /// Called for connection failures and dropped frames.
    pub fn on_error(
        mut self,
        handler: impl Fn(&StreamClientError) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(handler));
        self
    }

    /// Called after every state transition.
    pub fn on_state_change(
        mut self,
        handler: impl Fn(ConnectionState) + Send + Sync + 'static,
    ) -> Self {
        self.on_state_change = Some(Arc::new(handler));
        self
    }
}

impl<M> Default for StreamHandlers<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Clone for StreamHandlers<M> {
    fn clone(&self) -> Self {
        Self {
            on_message: self.on_message.clone(),
            on_connect: self.on_connect.clone(),
            on_disconnect: self.on_disconnect.clone(),
            on_error: self.on_error.clone(),
            on_state_change: self.on_state_change.clone(),
        }
    }
}

impl<M> fmt::Debug for StreamHandlers<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandlers")
            .field("on_message", &self.on_message.is_some())
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_state_change", &self.on_state_change.is_some())
            .finish()
    }
}

/// Builder for a [`StreamClient`].
pub struct StreamClientBuilder<M = StreamMessage> {
    endpoint: String,
    options: StreamClientOptions,
    handlers: StreamHandlers<M>,
    connector: Arc<dyn Connector>,
}

impl<M> StreamClientBuilder<M>
where
    M: DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        Self {
            endpoint,
            options: StreamClientOptions::default(),
            handlers: StreamHandlers::new(),
            connector: Arc::new(WebSocketConnector),
        }
    }

    pub fn options(mut self, options: StreamClientOptions) -> Self {
        self.options = options;
        self
    }

    pub fn handlers(mut self, handlers: StreamHandlers<M>) -> Self {
        self.handlers = handlers;
        self
    }

    /// Replaces the websocket transport.
    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    /// Spawns the client worker.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> StreamClient<M> {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let shared = Arc::new(Shared {
            view: RwLock::new(ClientView {
                state: ConnectionState::Idle,
                attempt_count: 0,
                last_message: None,
                history: MessageHistory::new(self.options.history_capacity),
                outbound: None,
            }),
            handlers: RwLock::new(self.handlers),
            state_tx,
        });

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let endpoint: Arc<str> = Arc::from(self.endpoint);

        let worker = StreamWorker {
            endpoint: Arc::clone(&endpoint),
            connector: self.connector,
            connect_timeout: self.options.connect_timeout,
            shared: Arc::clone(&shared),
            retry: RetryState::new(self.options.retry_policy()),
            state: ConnectionState::Idle,
            next_id: 0,
            attempt: None,
            retry_timer: None,
            inbound: None,
            events_tx,
        };

        if self.options.auto_connect {
            let _ = commands_tx.send(Command::Connect);
        }
        tokio::spawn(worker.run(commands_rx, events_rx));

        StreamClient {
            endpoint,
            options: self.options,
            commands: commands_tx,
            shared,
        }
    }
}

/// Handle to a realtime stream connection with automatic reconnects.
pub struct StreamClient<M = StreamMessage> {
    endpoint: Arc<str>,
    options: StreamClientOptions,
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared<M>>,
}

impl<M> Clone for StreamClient<M> {
    fn clone(&self) -> Self {
        Self {
            endpoint: Arc::clone(&self.endpoint),
            options: self.options.clone(),
            commands: self.commands.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M> fmt::Debug for StreamClient<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamClient")
            .field("endpoint", &self.endpoint)
            .field("options", &self.options)
            .field("state", &read_lock(&self.shared.view).state)
            .finish()
    }
}

/// Handle that does not keep the client worker alive.
///
/// Meant for handlers that need to call back into their own client.
pub struct WeakStreamClient<M = StreamMessage> {
    endpoint: Arc<str>,
    options: StreamClientOptions,
    commands: mpsc::WeakUnboundedSender<Command>,
    shared: Weak<Shared<M>>,
}

impl<M> WeakStreamClient<M> {
    /// Returns a full handle, or `None` once every [`StreamClient`] is gone.
    pub fn upgrade(&self) -> Option<StreamClient<M>> {
        let commands = self.commands.upgrade()?;
        let shared = self.shared.upgrade()?;
        Some(StreamClient {
            endpoint: Arc::clone(&self.endpoint),
            options: self.options.clone(),
            commands,
            shared,
        })
    }
}

impl<M> Clone for WeakStreamClient<M> {
    fn clone(&self) -> Self {
        Self {
            endpoint: Arc::clone(&self.endpoint),
            options: self.options.clone(),
            commands: self.commands.clone(),
            shared: Weak::clone(&self.shared),
        }
    }
}

impl<M> fmt::Debug for WeakStreamClient<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakStreamClient")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl StreamClient<StreamMessage> {
    /// Creates a client for `endpoint` with default options and connects.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(endpoint: impl Into<String>) -> Self {
        StreamClientBuilder::new(endpoint).build()
    }
}

impl<M> StreamClient<M>
where
    M: DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn builder(endpoint: impl Into<String>) -> StreamClientBuilder<M> {
        StreamClientBuilder::new(endpoint)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn options(&self) -> &StreamClientOptions {
        &self.options
    }

    /// Creates a [`WeakStreamClient`] for use inside handlers.
    pub fn downgrade(&self) -> WeakStreamClient<M> {
        WeakStreamClient {
            endpoint: Arc::clone(&self.endpoint),
            options: self.options.clone(),
            commands: self.commands.downgrade(),
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Starts a connection attempt unless one is open or in flight.
    pub fn connect(&self) {
        self.command(Command::Connect);
    }

    /// Same as [`connect`](Self::connect). Does not reset the attempt count.
    pub fn reconnect(&self) {
        self.command(Command::Connect);
    }

    /// Cancels any pending retry and closes the connection.
    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    /// Sets the attempt count back to zero.
    ///
    /// A retry that is already scheduled still fires; see
    /// [`ConnectionState::ClosedRetrying`].
    pub fn reset_attempts(&self) {
        self.command(Command::ResetAttempts);
    }

    pub fn clear_history(&self) {
        self.command(Command::ClearHistory);
    }

    /// Tears the client down for every handle. No transitions follow.
    pub fn shutdown(&self) {
        self.command(Command::Shutdown);
    }

    /// Encodes `payload` and writes it to the open connection.
    ///
    /// Fails with [`StreamClientError::NotConnected`] when no connection is
    /// open. Failed sends are not queued.
    pub fn send<T>(&self, payload: &T) -> Result<(), StreamClientError>
    where
        T: Serialize + ?Sized,
    {
        let outbound = {
            let view = read_lock(&self.shared.view);
            match (&view.state, &view.outbound) {
                (ConnectionState::Open, Some(outbound)) => outbound.clone(),
                _ => return Err(StreamClientError::NotConnected),
            }
        };
        let text = encode_payload(payload)?;
        outbound
            .send(text)
            .map_err(|_| StreamClientError::NotConnected)
    }

    pub fn state(&self) -> ConnectionState {
        read_lock(&self.shared.view).state
    }

    pub fn status(&self) -> StreamConnectionStatus {
        self.state().status()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_open()
    }

    pub fn attempt_count(&self) -> u32 {
        read_lock(&self.shared.view).attempt_count
    }

    pub fn last_message(&self) -> Option<M> {
        read_lock(&self.shared.view).last_message.clone()
    }

    /// Recent messages, oldest first.
    pub fn history(&self) -> Vec<M> {
        read_lock(&self.shared.view).history.snapshot()
    }

    /// Receiver that observes the latest [`ConnectionState`].
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn set_on_message(&self, handler: impl Fn(&M) + Send + Sync + 'static) {
        write_lock(&self.shared.handlers).on_message = Some(Arc::new(handler));
    }

    pub fn set_on_connect(&self, handler: impl Fn() + Send + Sync + 'static) {
        write_lock(&self.shared.handlers).on_connect = Some(Arc::new(handler));
    }

    pub fn set_on_disconnect(&self, handler: impl Fn() + Send + Sync + 'static) {
        write_lock(&self.shared.handlers).on_disconnect = Some(Arc::new(handler));
    }

    pub fn set_on_error(&self, handler: impl Fn(&StreamClientError) + Send + Sync + 'static) {
        write_lock(&self.shared.handlers).on_error = Some(Arc::new(handler));
    }

    pub fn set_on_state_change(&self, handler: impl Fn(ConnectionState) + Send + Sync + 'static) {
        write_lock(&self.shared.handlers).on_state_change = Some(Arc::new(handler));
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!(
                event = "stream_command_dropped",
                endpoint = %self.endpoint,
                error = %StreamClientError::ClientClosed
            );
        }
    }
}

struct Shared<M> {
    view: RwLock<ClientView<M>>,
    handlers: RwLock<StreamHandlers<M>>,
    state_tx: watch::Sender<ConnectionState>,
}

/// State readable from client handles, written only by the worker.
struct ClientView<M> {
    state: ConnectionState,
    attempt_count: u32,
    last_message: Option<M>,
    history: MessageHistory<M>,
    outbound: Option<mpsc::UnboundedSender<String>>,
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
enum Command {
    Connect,
    Disconnect,
    ResetAttempts,
    ClearHistory,
    Shutdown,
}

enum WorkerEvent {
    AttemptFinished {
        id: u64,
        result: Result<TransportChannels, StreamClientError>,
    },
    RetryDue {
        id: u64,
    },
}

struct Pending {
    id: u64,
    task: JoinHandle<()>,
}

struct StreamWorker<M> {
    endpoint: Arc<str>,
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    shared: Arc<Shared<M>>,
    retry: RetryState,
    state: ConnectionState,
    next_id: u64,
    attempt: Option<Pending>,
    retry_timer: Option<Pending>,
    inbound: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl<M> StreamWorker<M>
where
    M: DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        loop {
            tokio::select! {
                biased;
                maybe_command = commands.recv() => {
                    match maybe_command {
                        Some(Command::Shutdown) | None => {
                            self.teardown();
                            return;
                        }
                        Some(command) => self.handle_command(command),
                    }
                }
                Some(event) = events.recv() => self.handle_event(event),
                maybe_frame = next_frame(&mut self.inbound) => {
                    match maybe_frame {
                        Some(frame) => self.handle_frame(&frame),
                        None => {
                            info!(event = "stream_disconnected", endpoint = %self.endpoint);
                            self.handle_connection_lost();
                        }
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect(),
            Command::Disconnect => self.disconnect(),
            Command::ResetAttempts => {
                self.retry.reset();
                write_lock(&self.shared.view).attempt_count = 0;
            }
            Command::ClearHistory => write_lock(&self.shared.view).history.clear(),
            Command::Shutdown => {}
        }
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::AttemptFinished { id, result } => {
                if self.attempt.as_ref().map(|pending| pending.id) != Some(id) {
                    if result.is_ok() {
                        info!(event = "stream_stale_connection_closed", attempt_id = id);
                    }
                    return;
                }
                self.attempt = None;
                match result {
                    Ok(channels) => self.adopt_connection(channels),
                    Err(err) => {
                        self.report_error(err);
                        self.handle_connection_lost();
                    }
                }
            }
            WorkerEvent::RetryDue { id } => {
                if self.retry_timer.as_ref().map(|pending| pending.id) != Some(id) {
                    debug!(event = "stream_stale_retry_ignored", timer_id = id);
                    return;
                }
                self.retry_timer = None;
                if matches!(self.state, ConnectionState::ClosedRetrying { .. }) {
                    self.begin_attempt();
                }
            }
        }
    }

    fn connect(&mut self) {
        if matches!(self.state, ConnectionState::Open | ConnectionState::Connecting) {
            debug!(event = "stream_connect_ignored", state = ?self.state);
            return;
        }
        self.cancel_retry_timer();
        self.begin_attempt();
    }

    fn begin_attempt(&mut self) {
        let id = self.next_id();
        info!(
            event = "stream_connecting",
            endpoint = %self.endpoint,
            attempt = self.retry.attempt_count()
        );
        self.set_state(ConnectionState::Connecting);

        let connector = Arc::clone(&self.connector);
        let endpoint = Arc::clone(&self.endpoint);
        let connect_timeout = self.connect_timeout;
        let events_tx = self.events_tx.clone();
        let task = tokio::spawn(async move {
            let attempt = AssertUnwindSafe(async move { connector.connect(&endpoint).await })
                .catch_unwind();
            let result = match with_timeout(connect_timeout, attempt).await {
                Ok(Ok(result)) => result,
                Ok(Err(panic)) => Err(StreamClientError::Protocol(format!(
                    "connection attempt panicked: {}",
                    panic_message(&*panic)
                ))),
                Err(_) => Err(StreamClientError::ConnectTimeout(connect_timeout)),
            };
            let _ = events_tx.send(WorkerEvent::AttemptFinished { id, result });
        });
        self.attempt = Some(Pending { id, task });
    }

    fn adopt_connection(&mut self, channels: TransportChannels) {
        self.retry.reset();
        self.inbound = Some(channels.inbound);
        write_lock(&self.shared.view).outbound = Some(channels.outbound);
        info!(event = "stream_connected", endpoint = %self.endpoint);
        self.set_state(ConnectionState::Open);

        let handler = read_lock(&self.shared.handlers).on_connect.clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    fn handle_connection_lost(&mut self) {
        self.drop_connection();

        match self.retry.register_loss() {
            RetryDecision::Retry { attempt, delay } => {
                info!(
                    event = "stream_retry_scheduled",
                    endpoint = %self.endpoint,
                    attempt,
                    delay_ms = delay.as_millis() as u64
                );
                self.set_state(ConnectionState::ClosedRetrying { attempt });
                self.schedule_retry(delay);
            }
            RetryDecision::Exhausted { attempts } => {
                warn!(
                    event = "stream_retries_exhausted",
                    endpoint = %self.endpoint,
                    attempts
                );
                self.set_state(ConnectionState::ClosedExhausted);
            }
        }

        self.notify_disconnect();
    }

    fn schedule_retry(&mut self, delay: Duration) {
        let id = self.next_id();
        let events_tx = self.events_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events_tx.send(WorkerEvent::RetryDue { id });
        });
        self.retry_timer = Some(Pending { id, task });
    }

    fn disconnect(&mut self) {
        self.cancel_retry_timer();
        self.cancel_attempt();
        let was_open = self.drop_connection();
        info!(event = "stream_disconnect_requested", endpoint = %self.endpoint);
        self.set_state(ConnectionState::ClosedManual);
        if was_open {
            self.notify_disconnect();
        }
    }

    fn teardown(&mut self) {
        self.cancel_retry_timer();
        self.cancel_attempt();
        self.drop_connection();

        if !matches!(
            self.state,
            ConnectionState::Idle | ConnectionState::ClosedExhausted | ConnectionState::ClosedManual
        ) {
            self.state = ConnectionState::ClosedManual;
            write_lock(&self.shared.view).state = self.state;
            self.shared.state_tx.send_replace(self.state);
        }
        info!(event = "stream_client_shutdown", endpoint = %self.endpoint);
    }

    fn handle_frame(&mut self, frame: &[u8]) {
        match decode_frame::<M>(frame) {
            Ok(message) => {
                {
                    let mut view = write_lock(&self.shared.view);
                    view.history.push(message.clone());
                    view.last_message = Some(message.clone());
                }
                let handler = read_lock(&self.shared.handlers).on_message.clone();
                if let Some(handler) = handler {
                    handler(&message);
                }
            }
            Err(err) => {
                warn!(
                    event = "stream_frame_decode_failed",
                    frame_len = frame.len(),
                    error = %err
                );
                self.report_error(StreamClientError::Json(err));
            }
        }
    }

    /// Closes the live connection, returning whether there was one.
    fn drop_connection(&mut self) -> bool {
        let had_inbound = self.inbound.take().is_some();
        let had_outbound = write_lock(&self.shared.view).outbound.take().is_some();
        had_inbound || had_outbound
    }

    fn cancel_retry_timer(&mut self) {
        if let Some(pending) = self.retry_timer.take() {
            pending.task.abort();
            debug!(event = "stream_retry_cancelled", timer_id = pending.id);
        }
    }

    fn cancel_attempt(&mut self) {
        if let Some(pending) = self.attempt.take() {
            pending.task.abort();
            debug!(event = "stream_attempt_cancelled", attempt_id = pending.id);
        }
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        self.state = next;
        {
            let mut view = write_lock(&self.shared.view);
            view.state = next;
            view.attempt_count = self.retry.attempt_count();
        }
        self.shared.state_tx.send_replace(next);

        let handler = read_lock(&self.shared.handlers).on_state_change.clone();
        if let Some(handler) = handler {
            handler(next);
        }
    }

    fn notify_disconnect(&self) {
        let handler = read_lock(&self.shared.handlers).on_disconnect.clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    fn report_error(&self, err: StreamClientError) {
        warn!(event = "stream_error", endpoint = %self.endpoint, error = %err);
        let handler = read_lock(&self.shared.handlers).on_error.clone();
        if let Some(handler) = handler {
            handler(&err);
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

impl<M> Drop for StreamWorker<M> {
    fn drop(&mut self) {
        if let Some(pending) = self.retry_timer.take() {
            pending.task.abort();
        }
        if let Some(pending) = self.attempt.take() {
            pending.task.abort();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

async fn next_frame(inbound: &mut Option<mpsc::UnboundedReceiver<Vec<u8>>>) -> Option<Vec<u8>> {
    match inbound {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}
