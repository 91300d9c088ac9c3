//! Connection state machine.
//!
//! A connection owns one transport and runs up to three tasks: a reader
//! that frames incoming bytes and routes messages, a monitor that enforces
//! validation, idle and close timeouts, and a writer that is started on
//! demand and drains the send queue in FIFO order.
//!
//! Lifecycle: `Validating -> Active -> Closing -> Closed`. Outgoing
//! connections wait in `Validating` for the peer's ValidateConnection;
//! incoming connections send it before the connection object exists.

use crate::batch::{AutoFlush, BatchRequestQueue, BatchSwap};
use crate::dispatch::{reply_body, Current, DispatchError, DispatchResult, ServantLocator};
use crate::error::LocalError;
use crate::info::ConnectionInfo;
use crate::invocation::{
    Completion, InvocationFailure, InvocationResult, InvocationState, OutstandingInvocation,
    InvocationTable, Response,
};
use crate::runtime::Runtime;
use crate::transport::Transport;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rpcwire_protocol::frame::finish_message;
use rpcwire_protocol::{Frame, Framer, Message, MessageType, ProtocolError, Reply, Request};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, watch, Notify};
use tokio::time::Instant;

const READ_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Validating,
    Active,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Validating => write!(f, "validating"),
            ConnectionState::Active => write!(f, "active"),
            ConnectionState::Closing => write!(f, "closing"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Close the transport now; outstanding invocations fail.
    Forcefully,
    /// Wait for outstanding invocations and in-progress dispatches, then
    /// send CloseConnection. The close timeout bounds the whole close.
    Gracefully,
    /// Like `Gracefully`, but the outstanding work is waited for without
    /// limit; the close timeout starts once CloseConnection is sent.
    GracefullyWithWait,
}

/// How a message left the send path.
#[derive(Debug)]
pub enum SendStatus {
    /// Written to the transport before the call returned.
    Sent,
    /// Queued behind earlier writes. The receiver fires once written and
    /// errors if the connection closes first.
    Queued(oneshot::Receiver<()>),
}

impl SendStatus {
    pub fn sent_synchronously(&self) -> bool {
        matches!(self, SendStatus::Sent)
    }

    /// Waits until the message is written. Returns false if it never was.
    pub async fn wait_sent(self) -> bool {
        match self {
            SendStatus::Sent => true,
            SendStatus::Queued(rx) => rx.await.is_ok(),
        }
    }
}

type BoxedTransport = Box<dyn Transport>;
type CloseCallback = Box<dyn FnOnce(&ConnectionInfo, &LocalError) + Send>;

struct Outgoing {
    bytes: Bytes,
    message_type: MessageType,
    /// Twoway request id, marked sent when the writer takes the message.
    request_id: Option<i32>,
    sent: Option<oneshot::Sender<()>>,
}

impl Outgoing {
    fn control(frame: Frame) -> Result<Self, LocalError> {
        Ok(Self {
            message_type: frame.message_type(),
            bytes: frame.encode(false)?.freeze(),
            request_id: None,
            sent: None,
        })
    }
}

struct Closing {
    reason: LocalError,
    /// Arm the close timeout only when CloseConnection goes out.
    timeout_after_send: bool,
    close_sent: bool,
    deadline: Option<Instant>,
}

struct Shared {
    state: ConnectionState,
    invocations: InvocationTable,
    send_queue: VecDeque<Outgoing>,
    writing: bool,
    dispatch_count: usize,
    closing: Option<Closing>,
    close_reason: Option<LocalError>,
    close_callback: Option<CloseCallback>,
    created: Instant,
    last_activity: Instant,
}

struct Inner {
    info: Arc<ConnectionInfo>,
    runtime: Arc<Runtime>,
    compress: bool,
    heartbeat: bool,
    connect_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
    close_timeout: Option<Duration>,
    invocation_timeout: Option<Duration>,
    shared: Mutex<Shared>,
    batch: BatchRequestQueue,
    locator: RwLock<Option<Arc<dyn ServantLocator>>>,
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedTransport>>>,
    state_tx: watch::Sender<ConnectionState>,
    /// Pokes the monitor when a deadline moves.
    wake: Notify,
}

/// Handle to a connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("info", &self.inner.info)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Starts a client-side connection. It stays `Validating` until the
    /// peer's ValidateConnection arrives; requests issued meanwhile are
    /// queued.
    pub fn outgoing<T: Transport>(transport: T, runtime: Arc<Runtime>) -> Result<Self, LocalError> {
        let info = ConnectionInfo::new(false, transport.info());
        Self::start(
            Box::new(transport),
            info,
            runtime,
            ConnectionState::Validating,
            None,
        )
    }

    /// Starts a server-side connection: sends ValidateConnection, then
    /// becomes `Active`. Incoming requests go to `locator`.
    pub async fn incoming<T: Transport>(
        mut transport: T,
        runtime: Arc<Runtime>,
        adapter_name: &str,
        locator: Option<Arc<dyn ServantLocator>>,
    ) -> Result<Self, LocalError> {
        let info = ConnectionInfo::new(true, transport.info()).with_adapter_name(adapter_name);
        let validate = Frame::validate_connection().encode(false)?;
        match runtime.config().connection.connect_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, write_all_flush(&mut transport, &validate))
                .await
                .map_err(|_| LocalError::ConnectTimeout)??,
            None => write_all_flush(&mut transport, &validate).await?,
        }
        tracing::debug!("[{}] Sent validation", info);

        let connection = Self::start(
            Box::new(transport),
            info,
            runtime,
            ConnectionState::Active,
            locator,
        )?;
        let inner = &connection.inner;
        inner.runtime.observer().state_changed(
            &inner.info,
            ConnectionState::Validating,
            ConnectionState::Active,
        );
        Ok(connection)
    }

    fn start(
        transport: BoxedTransport,
        info: ConnectionInfo,
        runtime: Arc<Runtime>,
        state: ConnectionState,
        locator: Option<Arc<dyn ServantLocator>>,
    ) -> Result<Self, LocalError> {
        let config = runtime.config().clone();
        let (read_half, write_half) = tokio::io::split(transport);

        let mut batch = BatchRequestQueue::for_transport(config.batch.max_size, &info.transport);
        if config.batch.auto_flush_size > 0 {
            batch = batch.with_interceptor(Arc::new(AutoFlush {
                threshold: config.batch.auto_flush_size,
            }));
        }

        let now = Instant::now();
        let (state_tx, _) = watch::channel(state);
        let inner = Arc::new(Inner {
            info: Arc::new(info),
            runtime,
            compress: config.protocol.compress,
            heartbeat: config.connection.heartbeat,
            connect_timeout: config.connection.connect_timeout(),
            idle_timeout: config.connection.idle_timeout(),
            close_timeout: config.connection.close_timeout(),
            invocation_timeout: config.connection.invocation_timeout(),
            shared: Mutex::new(Shared {
                state,
                invocations: InvocationTable::new(),
                send_queue: VecDeque::new(),
                writing: false,
                dispatch_count: 0,
                closing: None,
                close_reason: None,
                close_callback: None,
                created: now,
                last_activity: now,
            }),
            batch,
            locator: RwLock::new(locator),
            writer: tokio::sync::Mutex::new(Some(write_half)),
            state_tx,
            wake: Notify::new(),
        });

        let connection = Connection { inner };
        connection.inner.runtime.register(&connection)?;

        tokio::spawn(run_reader(
            connection.inner.clone(),
            read_half,
            Framer::new(config.protocol.max_message_size),
        ));
        tokio::spawn(run_monitor(connection.inner.clone()));

        tracing::info!("[{}] Connection established ({})", connection.inner.info, state);
        Ok(connection)
    }

    pub fn info(&self) -> &Arc<ConnectionInfo> {
        &self.inner.info
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.shared.lock().state
    }

    /// Number of twoway invocations waiting for a reply.
    pub fn outstanding(&self) -> usize {
        self.inner.shared.lock().invocations.len()
    }

    /// Enables dispatch of incoming requests, e.g. callbacks on an
    /// outgoing connection.
    pub fn set_servant_locator(&self, locator: Arc<dyn ServantLocator>) {
        *self.inner.locator.write() = Some(locator);
    }

    /// Registers the callback run once the connection is closed. Runs it
    /// right away if the connection is already closed.
    pub fn set_close_callback<F>(&self, callback: F)
    where
        F: FnOnce(&ConnectionInfo, &LocalError) + Send + 'static,
    {
        let mut shared = self.inner.shared.lock();
        if shared.state == ConnectionState::Closed {
            let reason = closed_error(&shared);
            drop(shared);
            callback(&self.inner.info, &reason);
        } else {
            shared.close_callback = Some(Box::new(callback));
        }
    }

    /// Waits for validation. Fails with the close reason if the connection
    /// closed first.
    pub async fn wait_active(&self) -> Result<(), LocalError> {
        let mut rx = self.inner.state_tx.subscribe();
        let state = match rx
            .wait_for(|s| *s != ConnectionState::Validating)
            .await
        {
            Ok(state) => *state,
            Err(_) => ConnectionState::Closed,
        };
        match state {
            ConnectionState::Active => Ok(()),
            _ => Err(self.inner.close_error()),
        }
    }

    /// Waits until the connection is closed and returns the reason.
    pub async fn wait_closed(&self) -> LocalError {
        let mut rx = self.inner.state_tx.subscribe();
        // The sender lives as long as `self`, so this only returns once closed.
        let _ = rx.wait_for(|s| *s == ConnectionState::Closed).await;
        self.inner.close_error()
    }

    /// Sends a twoway request and returns a handle for its reply.
    ///
    /// If the writer was idle, the request is written before this returns
    /// and the handle reports `sent_synchronously`.
    pub async fn send_async_request(
        &self,
        request: &Request,
    ) -> Result<InvocationHandle, InvocationFailure> {
        let (sent_tx, sent_rx) = oneshot::channel();
        let (request_id, reply_rx, started) = {
            let mut shared = self.inner.shared.lock();
            check_open(&shared, false).map_err(InvocationFailure::unsent)?;

            let request_id = shared.invocations.next_request_id();
            let bytes = request
                .encode(request_id, self.inner.compress)
                .map_err(|e| InvocationFailure::unsent(e.into()))?
                .freeze();
            let (invocation, reply_rx) =
                OutstandingInvocation::new(request_id, request.operation.clone(), request.mode);
            shared.invocations.register(invocation);
            shared.send_queue.push_back(Outgoing {
                bytes,
                message_type: MessageType::Request,
                request_id: Some(request_id),
                sent: Some(sent_tx),
            });
            let started = self.inner.kick_writer(&mut shared);
            (request_id, reply_rx, started)
        };

        let mut handle = InvocationHandle {
            connection: self.clone(),
            request_id,
            sent_synchronously: false,
            sent: Some(sent_rx),
            is_sent: false,
            reply: reply_rx,
            finished: false,
        };
        if started {
            handle.sent_synchronously = handle.sent().await;
        }
        Ok(handle)
    }

    /// Sends a twoway request and waits for the reply, bounded by the
    /// configured invocation timeout.
    pub async fn send_request(&self, request: &Request) -> InvocationResult {
        let mut handle = self.send_async_request(request).await?;
        handle.response().await
    }

    /// Sends a oneway request (request id 0, no reply).
    pub async fn send_oneway(&self, request: &Request) -> Result<SendStatus, LocalError> {
        let bytes = request.encode(0, self.inner.compress)?.freeze();
        self.send(bytes, MessageType::Request).await
    }

    /// Fails an outstanding invocation locally. An unsent request is
    /// removed from the send queue; a late reply to a sent one is
    /// discarded. Returns false if the invocation was not outstanding.
    pub fn cancel_invocation(&self, request_id: i32, reason: LocalError) -> bool {
        let mut shared = self.inner.shared.lock();
        let canceled = match shared.invocations.cancel(request_id, reason) {
            Some(InvocationState::Pending) => {
                shared
                    .send_queue
                    .retain(|m| m.request_id != Some(request_id));
                true
            }
            Some(_) => true,
            None => false,
        };
        if canceled {
            tracing::debug!("[{}] Canceled request {}", self.inner.info, request_id);
            self.inner.maybe_send_close(&mut shared);
        }
        canceled
    }

    /// Adds a oneway request to the batch queue. Sends the pending batch
    /// first if the batch interceptor asks for it.
    pub async fn enqueue_batch(&self, request: &Request) -> Result<(), LocalError> {
        check_open(&self.inner.shared.lock(), false)?;
        let entry = request.encode_batch_entry();
        if let Some(swap) = self.inner.batch.enqueue(&entry, self.inner.compress)? {
            self.send_batch(swap).await?;
        }
        Ok(())
    }

    /// Sends the pending batch. Returns `None` if it was empty.
    pub async fn flush_batch(&self) -> Result<Option<SendStatus>, LocalError> {
        match self.inner.batch.swap() {
            Some(swap) => self.send_batch(swap).await.map(Some),
            None => Ok(None),
        }
    }

    /// Number of requests waiting in the batch queue.
    pub fn batch_len(&self) -> usize {
        self.inner.batch.len()
    }

    async fn send_batch(&self, swap: BatchSwap) -> Result<SendStatus, LocalError> {
        tracing::debug!(
            "[{}] Flushing batch of {} requests",
            self.inner.info,
            swap.count
        );
        let bytes = finish_message(swap.bytes, swap.compress)?.freeze();
        self.send(bytes, MessageType::RequestBatch).await
    }

    /// Sends a ValidateConnection as a heartbeat.
    pub async fn heartbeat(&self) -> Result<SendStatus, LocalError> {
        let out = Outgoing::control(Frame::validate_connection())?;
        self.send(out.bytes, out.message_type).await
    }

    async fn send(&self, bytes: Bytes, message_type: MessageType) -> Result<SendStatus, LocalError> {
        let (tx, rx) = oneshot::channel();
        let started = {
            let mut shared = self.inner.shared.lock();
            self.inner.push(
                &mut shared,
                Outgoing {
                    bytes,
                    message_type,
                    request_id: None,
                    sent: Some(tx),
                },
                false,
            )?
        };
        if !started {
            return Ok(SendStatus::Queued(rx));
        }
        match rx.await {
            Ok(()) => Ok(SendStatus::Sent),
            Err(_) => Err(self.inner.close_error()),
        }
    }

    /// Closes the connection and waits until it is closed.
    pub async fn close(&self, mode: CloseMode) {
        match mode {
            CloseMode::Forcefully => self
                .inner
                .close_now(LocalError::ConnectionManuallyClosed { graceful: false }),
            CloseMode::Gracefully | CloseMode::GracefullyWithWait => self.inner.start_closing(
                LocalError::ConnectionManuallyClosed { graceful: true },
                mode == CloseMode::GracefullyWithWait,
            ),
        }
        self.wait_closed().await;
    }

    /// Closes the connection at once, failing everything with `reason`.
    pub fn abort(&self, reason: LocalError) {
        self.inner.close_now(reason);
    }
}

/// An outstanding twoway invocation. Dropping the handle before the reply
/// arrives cancels the invocation.
#[derive(Debug)]
pub struct InvocationHandle {
    connection: Connection,
    request_id: i32,
    sent_synchronously: bool,
    sent: Option<oneshot::Receiver<()>>,
    is_sent: bool,
    reply: oneshot::Receiver<InvocationResult>,
    finished: bool,
}

impl InvocationHandle {
    pub fn request_id(&self) -> i32 {
        self.request_id
    }

    pub fn sent_synchronously(&self) -> bool {
        self.sent_synchronously
    }

    /// Waits until the request is written. Returns false if it never will be.
    pub async fn sent(&mut self) -> bool {
        if let Some(rx) = self.sent.take() {
            self.is_sent = rx.await.is_ok();
        }
        self.is_sent
    }

    /// Waits for the reply, bounded by the invocation timeout.
    pub async fn response(&mut self) -> InvocationResult {
        if self.finished {
            return Err(InvocationFailure::unsent(LocalError::InvocationCanceled));
        }
        let received = match self.connection.inner.invocation_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, &mut self.reply).await {
                Ok(received) => received,
                Err(_) => {
                    self.connection
                        .cancel_invocation(self.request_id, LocalError::InvocationTimeout);
                    self.finished = true;
                    return self.reply.try_recv().unwrap_or_else(|_| {
                        Err(InvocationFailure::unsent(LocalError::InvocationTimeout))
                    });
                }
            },
            None => (&mut self.reply).await,
        };
        self.finished = true;
        received.unwrap_or_else(|_| {
            Err(InvocationFailure::unsent(self.connection.inner.close_error()))
        })
    }

    /// Cancels the invocation locally.
    pub fn cancel(mut self) {
        self.finished = true;
        self.connection
            .cancel_invocation(self.request_id, LocalError::InvocationCanceled);
    }
}

impl Drop for InvocationHandle {
    fn drop(&mut self) {
        if !self.finished {
            self.connection
                .cancel_invocation(self.request_id, LocalError::InvocationCanceled);
        }
    }
}

fn closed_error(shared: &Shared) -> LocalError {
    if let Some(reason) = &shared.close_reason {
        return reason.clone();
    }
    if let Some(closing) = &shared.closing {
        return closing.reason.clone();
    }
    LocalError::ConnectionManuallyClosed { graceful: false }
}

fn check_open(shared: &Shared, allow_closing: bool) -> Result<(), LocalError> {
    match shared.state {
        ConnectionState::Closed => Err(closed_error(shared)),
        ConnectionState::Closing if !allow_closing => Err(closed_error(shared)),
        _ => Ok(()),
    }
}

async fn write_all_flush<W: AsyncWrite + Unpin + ?Sized>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

impl Inner {
    fn close_error(&self) -> LocalError {
        closed_error(&self.shared.lock())
    }

    fn touch(&self) {
        self.shared.lock().last_activity = Instant::now();
    }

    fn set_state(&self, shared: &mut Shared, to: ConnectionState) {
        let from = shared.state;
        if from == to {
            return;
        }
        shared.state = to;
        self.state_tx.send_replace(to);
        tracing::debug!("[{}] {} -> {}", self.info, from, to);
        self.runtime.observer().state_changed(&self.info, from, to);
    }

    /// Queues a message and starts the writer if it is idle. Returns
    /// whether this call started the writer.
    fn push(
        self: &Arc<Self>,
        shared: &mut Shared,
        out: Outgoing,
        allow_closing: bool,
    ) -> Result<bool, LocalError> {
        check_open(shared, allow_closing)?;
        shared.send_queue.push_back(out);
        Ok(self.kick_writer(shared))
    }

    fn kick_writer(self: &Arc<Self>, shared: &mut Shared) -> bool {
        let writable = matches!(
            shared.state,
            ConnectionState::Active | ConnectionState::Closing
        );
        if shared.writing || !writable || shared.send_queue.is_empty() {
            return false;
        }
        shared.writing = true;
        tokio::spawn(run_writer(self.clone()));
        true
    }

    /// Sends CloseConnection once no invocation or dispatch is left.
    fn maybe_send_close(self: &Arc<Self>, shared: &mut Shared) {
        let Some(closing) = shared.closing.as_mut() else {
            return;
        };
        if closing.close_sent || shared.dispatch_count > 0 || !shared.invocations.is_empty() {
            return;
        }
        closing.close_sent = true;
        if closing.timeout_after_send && closing.deadline.is_none() {
            if let Some(timeout) = self.close_timeout {
                closing.deadline = Some(Instant::now() + timeout);
                self.wake.notify_one();
            }
        }
        match Outgoing::control(Frame::close_connection()) {
            Ok(out) => {
                shared.send_queue.push_back(out);
                self.kick_writer(shared);
                tracing::debug!("[{}] Sending close connection", self.info);
            }
            Err(e) => tracing::warn!("[{}] Cannot encode close connection: {}", self.info, e),
        }
    }

    fn start_closing(self: &Arc<Self>, reason: LocalError, timeout_after_send: bool) {
        let mut shared = self.shared.lock();
        match shared.state {
            ConnectionState::Closing | ConnectionState::Closed => return,
            ConnectionState::Validating => {
                drop(shared);
                self.close_now(reason);
                return;
            }
            ConnectionState::Active => {}
        }
        tracing::info!("[{}] Closing connection: {}", self.info, reason);
        let deadline = if timeout_after_send {
            None
        } else {
            self.close_timeout.map(|t| Instant::now() + t)
        };
        shared.closing = Some(Closing {
            reason,
            timeout_after_send,
            close_sent: false,
            deadline,
        });
        self.set_state(&mut shared, ConnectionState::Closing);
        self.maybe_send_close(&mut shared);
    }

    /// Moves to `Closed`: fails outstanding invocations, drops queued
    /// messages, releases the transport and runs the close callback.
    fn close_now(self: &Arc<Self>, reason: LocalError) {
        let callback = {
            let mut shared = self.shared.lock();
            if shared.state == ConnectionState::Closed {
                return;
            }
            let failed = shared.invocations.fail_all(&reason);
            shared.send_queue.clear();
            shared.closing = None;
            shared.close_reason = Some(reason.clone());
            self.set_state(&mut shared, ConnectionState::Closed);
            if failed > 0 {
                tracing::debug!("[{}] Failed {} outstanding invocations", self.info, failed);
            }
            shared.close_callback.take()
        };
        tracing::info!("[{}] Connection closed: {}", self.info, reason);

        self.runtime.unregister(&self.info.connection_id);
        let inner = self.clone();
        tokio::spawn(async move {
            if let Some(mut writer) = inner.writer.lock().await.take() {
                if let Err(e) = writer.shutdown().await {
                    tracing::debug!("[{}] Transport shutdown: {}", inner.info, e);
                }
            }
        });
        if let Some(callback) = callback {
            callback(&self.info, &reason);
        }
    }

    fn on_eof(self: &Arc<Self>) {
        let reason = {
            let shared = self.shared.lock();
            match &shared.closing {
                Some(closing) if closing.close_sent => closing.reason.clone(),
                _ => LocalError::Transport {
                    kind: io::ErrorKind::UnexpectedEof,
                    message: "connection lost".to_string(),
                },
            }
        };
        self.close_now(reason);
    }

    /// Routes one incoming message. An error is fatal to the connection.
    fn handle_frame(self: &Arc<Self>, frame: Frame) -> Result<(), LocalError> {
        let compress_reply = frame.header.compression.accepts_compressed_reply();
        let message = Message::from_frame(&frame)?;
        let mut shared = self.shared.lock();

        match (shared.state, message) {
            (ConnectionState::Closed, _) => Ok(()),
            (_, Message::CloseConnection) => {
                // A local close already under way keeps its reason.
                let reason = match &shared.closing {
                    Some(closing) => closing.reason.clone(),
                    None => LocalError::ConnectionClosedByPeer,
                };
                drop(shared);
                tracing::debug!("[{}] Received close connection", self.info);
                self.close_now(reason);
                Ok(())
            }
            (ConnectionState::Validating, Message::ValidateConnection) => {
                self.set_state(&mut shared, ConnectionState::Active);
                self.kick_writer(&mut shared);
                Ok(())
            }
            (ConnectionState::Validating, other) => {
                Err(ProtocolError::UnexpectedMessage(other.message_type()).into())
            }
            (_, Message::ValidateConnection) => {
                tracing::trace!("[{}] Received heartbeat", self.info);
                Ok(())
            }
            (_, Message::Reply { request_id, body }) => {
                let result = body
                    .map_err(LocalError::Marshal)
                    .and_then(Response::from_reply)
                    .map_err(InvocationFailure::sent);
                match shared.invocations.complete(request_id, result) {
                    Completion::Delivered => {
                        self.maybe_send_close(&mut shared);
                        Ok(())
                    }
                    Completion::Discarded => {
                        tracing::debug!(
                            "[{}] Discarding late reply for request {}",
                            self.info,
                            request_id
                        );
                        Ok(())
                    }
                    Completion::Unknown => Err(ProtocolError::UnknownRequestId(request_id).into()),
                }
            }
            (ConnectionState::Closing, message) => {
                tracing::debug!(
                    "[{}] Ignoring {} while closing",
                    self.info,
                    message.message_type()
                );
                Ok(())
            }
            (_, Message::Request { request_id, request }) => {
                shared.dispatch_count += 1;
                drop(shared);
                self.spawn_dispatch(vec![(request_id, request)], compress_reply);
                Ok(())
            }
            (_, Message::RequestBatch(requests)) => {
                if requests.is_empty() {
                    return Ok(());
                }
                shared.dispatch_count += 1;
                drop(shared);
                let requests = requests.into_iter().map(|r| (0, r)).collect();
                self.spawn_dispatch(requests, compress_reply);
                Ok(())
            }
        }
    }

    /// Dispatches requests in order on a new task.
    fn spawn_dispatch(self: &Arc<Self>, requests: Vec<(i32, Request)>, compress_reply: bool) {
        let inner = self.clone();
        tokio::spawn(async move {
            for (request_id, request) in requests {
                inner.dispatch(request_id, request, compress_reply).await;
            }
            let mut shared = inner.shared.lock();
            shared.dispatch_count -= 1;
            inner.maybe_send_close(&mut shared);
        });
    }

    async fn dispatch(self: &Arc<Self>, request_id: i32, request: Request, compress_reply: bool) {
        let current = Current::new(self.info.clone(), request_id, &request);
        let locator = self.locator.read().clone();
        let result: DispatchResult = match locator {
            None => Err(DispatchError::ObjectNotExist),
            Some(locator) => match locator.locate(&request.identity, &request.facet) {
                Ok(servant) => {
                    let task_current = current.clone();
                    let params = request.params;
                    let task =
                        tokio::spawn(async move { servant.dispatch(&task_current, params).await });
                    match task.await {
                        Ok(result) => result,
                        Err(e) => Err(DispatchError::Unknown(format!("dispatch failed: {e}"))),
                    }
                }
                Err(e) => Err(e),
            },
        };

        if let Err(e) = &result {
            tracing::debug!(
                "[{}] Dispatch of '{}' on '{}' failed: {}",
                self.info,
                current.operation,
                current.identity,
                e
            );
        }
        if current.is_oneway() {
            return;
        }

        let reply = Reply::new(request_id, reply_body(&current, result));
        let bytes = match reply.encode(compress_reply) {
            Ok(bytes) => bytes.freeze(),
            Err(e) => {
                tracing::warn!("[{}] Cannot encode reply {}: {}", self.info, request_id, e);
                return;
            }
        };
        let out = Outgoing {
            bytes,
            message_type: MessageType::Reply,
            request_id: None,
            sent: None,
        };
        let mut shared = self.shared.lock();
        if let Err(e) = self.push(&mut shared, out, true) {
            tracing::debug!("[{}] Dropping reply {}: {}", self.info, request_id, e);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let shared = self.shared.lock();
        match shared.state {
            ConnectionState::Validating => self.connect_timeout.map(|t| shared.created + t),
            ConnectionState::Active => self.idle_timeout.map(|t| shared.last_activity + t),
            ConnectionState::Closing => shared.closing.as_ref().and_then(|c| c.deadline),
            ConnectionState::Closed => None,
        }
    }

    /// Acts on expired timeouts.
    fn check_timeouts(self: &Arc<Self>) {
        let now = Instant::now();
        let mut shared = self.shared.lock();
        match shared.state {
            ConnectionState::Validating => {
                if self.connect_timeout.map_or(false, |t| shared.created + t <= now) {
                    drop(shared);
                    tracing::warn!("[{}] Validation timed out", self.info);
                    self.close_now(LocalError::ConnectTimeout);
                }
            }
            ConnectionState::Active => {
                let Some(idle) = self.idle_timeout else {
                    return;
                };
                if shared.last_activity + idle > now {
                    return;
                }
                if self.heartbeat {
                    shared.last_activity = now;
                    match Outgoing::control(Frame::validate_connection()) {
                        Ok(out) => {
                            shared.send_queue.push_back(out);
                            self.kick_writer(&mut shared);
                            tracing::trace!("[{}] Sending heartbeat", self.info);
                        }
                        Err(e) => tracing::warn!("[{}] Cannot encode heartbeat: {}", self.info, e),
                    }
                } else {
                    drop(shared);
                    tracing::info!("[{}] Closing idle connection", self.info);
                    self.close_now(LocalError::ConnectionIdle);
                }
            }
            ConnectionState::Closing => {
                let expired = shared
                    .closing
                    .as_ref()
                    .and_then(|c| c.deadline)
                    .map_or(false, |d| d <= now);
                if expired {
                    drop(shared);
                    tracing::warn!("[{}] Graceful close timed out", self.info);
                    self.close_now(LocalError::CloseTimeout);
                }
            }
            ConnectionState::Closed => {}
        }
    }
}

async fn run_reader(inner: Arc<Inner>, mut reader: ReadHalf<BoxedTransport>, mut framer: Framer) {
    let mut state_rx = inner.state_tx.subscribe();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        loop {
            match framer.try_read_message() {
                Ok(Some(frame)) => {
                    inner
                        .runtime
                        .observer()
                        .message_received(&inner.info, frame.header.size);
                    tracing::trace!("[{}] Received {}", inner.info, frame.message_type());
                    if let Err(e) = inner.handle_frame(frame) {
                        tracing::warn!("[{}] {}", inner.info, e);
                        inner.close_now(e);
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("[{}] {}", inner.info, e);
                    inner.close_now(LocalError::Protocol(e));
                    return;
                }
            }
        }

        tokio::select! {
            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    tracing::debug!("[{}] Transport closed by peer", inner.info);
                    inner.on_eof();
                    return;
                }
                Ok(n) => {
                    framer.extend(&buf[..n]);
                    inner.touch();
                }
                Err(e) => {
                    tracing::debug!("[{}] Read error: {}", inner.info, e);
                    inner.close_now(e.into());
                    return;
                }
            },
            _ = state_rx.wait_for(|s| *s == ConnectionState::Closed) => return,
        }
    }
}

async fn run_writer(inner: Arc<Inner>) {
    let mut state_rx = inner.state_tx.subscribe();
    let mut writer = inner.writer.lock().await;
    loop {
        let out = {
            let mut shared = inner.shared.lock();
            let next = match shared.state {
                ConnectionState::Closed => None,
                _ => shared.send_queue.pop_front(),
            };
            match next {
                Some(out) => {
                    if let Some(id) = out.request_id {
                        shared.invocations.mark_sent(id);
                    }
                    out
                }
                None => {
                    shared.writing = false;
                    return;
                }
            }
        };
        let Some(transport) = writer.as_mut() else {
            return;
        };

        let result = tokio::select! {
            result = write_all_flush(transport, &out.bytes) => result,
            _ = state_rx.wait_for(|s| *s == ConnectionState::Closed) => return,
        };
        match result {
            Ok(()) => {
                inner.touch();
                inner
                    .runtime
                    .observer()
                    .message_sent(&inner.info, out.bytes.len());
                tracing::trace!(
                    "[{}] Sent {} ({} bytes)",
                    inner.info,
                    out.message_type,
                    out.bytes.len()
                );
                if let Some(tx) = out.sent {
                    let _ = tx.send(());
                }
            }
            Err(e) => {
                tracing::debug!("[{}] Write error: {}", inner.info, e);
                drop(writer);
                inner.close_now(e.into());
                return;
            }
        }
    }
}

async fn run_monitor(inner: Arc<Inner>) {
    let mut state_rx = inner.state_tx.subscribe();
    loop {
        if *state_rx.borrow_and_update() == ConnectionState::Closed {
            return;
        }
        let deadline = inner.next_deadline();
        tokio::select! {
            _ = sleep_until(deadline) => {}
            changed = state_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = inner.wake.notified() => {}
        }
        inner.check_timeouts();
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
