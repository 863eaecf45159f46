//! Per-connection state machine.
//!
//! Each connection is owned by one task. It holds the WebSocket, the
//! identity table and the call table; everything else talks to it through
//! a [`Broker`] handle that queues commands. Method handlers run
//! concurrently inside the task, so a slow handler does not hold up other
//! calls or answers.

use crate::call_table::{CallTable, Reply, ReplySender};
use crate::codec::{DecodeError, Jellier, Unjellier};
use crate::config::{BrokerConfig, BrokerOptions, MAX_DEPTH};
use crate::error::{BrokerError, CallError, RemoteError, RemoteFailure};
use crate::flavor::{Invocation, ObjectKey};
use crate::identity_table::{Exported, IdentityTable};
use crate::registry::TypeRegistry;
use crate::transport::Root;
use crate::value::{Args, Value};
use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use perspective_core::{
    Clid, ConnectionState, FailureKind, Frame, Identity, Jelly, PROTOCOL_VERSION, Request,
    RequestId, WireFailure,
};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{self, Message};

static NEXT_BROKER_ID: AtomicU64 = AtomicU64::new(1);

/// How long teardown waits for the close frame to go out.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Where an outbound call is addressed.
pub(crate) enum Target {
    /// An export of the peer.
    Reference(Clid),
    /// The peer's mirror of one of our cacheables.
    Cache(ObjectKey),
}

pub(crate) enum Command {
    Call {
        request_id: RequestId,
        target: Target,
        method: String,
        args: Args,
        perspective: Option<Identity>,
        /// `None` for one-way sends.
        reply: Option<ReplySender>,
    },
    Abandon {
        request_id: RequestId,
    },
    ReleaseImport {
        clid: Clid,
        generation: u64,
    },
    ReleaseMirror {
        luid: Clid,
        generation: u64,
    },
    OnDisconnect(Box<dyn FnOnce() + Send>),
    Stats(oneshot::Sender<BrokerStats>),
    Close,
}

/// Table sizes of one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Objects the peer holds references to, not counting the root.
    pub exports: usize,
    /// Peer objects we hold proxies for.
    pub imports: usize,
    /// Cache mirrors of peer objects.
    pub mirrors: usize,
    /// Our calls still waiting for an answer.
    pub pending_calls: usize,
    /// Peer calls whose handlers are still running.
    pub running_handlers: usize,
}

struct Shared {
    id: u64,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    next_request_id: AtomicU64,
    call_timeout: Option<Duration>,
}

/// Handle to one connection.
///
/// Clones share the connection. Every [`RemoteReference`](crate::RemoteReference)
/// and [`CacheObserver`](crate::CacheObserver) holds one.
#[derive(Clone)]
pub struct Broker {
    shared: Arc<Shared>,
}

impl Broker {
    fn new(
        commands: mpsc::UnboundedSender<Command>,
        state: watch::Receiver<ConnectionState>,
        call_timeout: Option<Duration>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: NEXT_BROKER_ID.fetch_add(1, Ordering::Relaxed),
                commands,
                state,
                next_request_id: AtomicU64::new(1),
                call_timeout,
            }),
        }
    }

    /// A broker with no connection task behind it.
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let (_, state) = watch::channel(ConnectionState::Live);
        (Self::new(commands, state, None), rx)
    }

    /// Process-unique id, used in logs.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_open()
    }

    /// Wait until the connection is closed.
    pub async fn closed(&self) {
        let mut state = self.shared.state.clone();
        // An error means the task is gone, which is closed too.
        let _ = state.wait_for(|state| !state.is_open()).await;
    }

    /// Close the connection. Outstanding calls fail with
    /// [`CallError::ConnectionLost`].
    pub fn close(&self) {
        self.post(Command::Close);
    }

    /// Run `callback` once when the connection closes; immediately if it
    /// already has.
    pub fn notify_on_disconnect(&self, callback: impl FnOnce() + Send + 'static) {
        if let Err(mpsc::error::SendError(Command::OnDisconnect(callback))) = self
            .shared
            .commands
            .send(Command::OnDisconnect(Box::new(callback)))
        {
            callback();
        }
    }

    pub async fn stats(&self) -> Result<BrokerStats, BrokerError> {
        let (tx, rx) = oneshot::channel();
        self.shared
            .commands
            .send(Command::Stats(tx))
            .map_err(|_| BrokerError::Closed)?;
        rx.await.map_err(|_| BrokerError::Closed)
    }

    /// Queue a command; a closed connection drops it.
    pub(crate) fn post(&self, command: Command) {
        let _ = self.shared.commands.send(command);
    }

    pub(crate) fn call(
        &self,
        target: Target,
        method: &str,
        args: Args,
        perspective: Option<Identity>,
    ) -> Reply {
        if !self.is_connected() {
            return Reply::failed(CallError::DeadReference);
        }
        let request_id = self.shared.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let command = Command::Call {
            request_id,
            target,
            method: method.to_string(),
            args,
            perspective,
            reply: Some(tx),
        };
        if self.shared.commands.send(command).is_err() {
            return Reply::failed(CallError::DeadReference);
        }
        Reply::waiting(self.clone(), request_id, rx, self.shared.call_timeout)
    }

    pub(crate) fn send_oneway(
        &self,
        target: Target,
        method: &str,
        args: Args,
        perspective: Option<Identity>,
    ) -> Result<(), CallError> {
        if !self.is_connected() {
            return Err(CallError::DeadReference);
        }
        let request_id = self.shared.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.shared
            .commands
            .send(Command::Call {
                request_id,
                target,
                method: method.to_string(),
                args,
                perspective,
                reply: None,
            })
            .map_err(|_| CallError::DeadReference)
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

/// A handler finished.
struct Completed {
    request_id: RequestId,
    answer_required: bool,
    /// Perspective the answer is encoded under.
    perspective: Option<Identity>,
    method: String,
    result: Result<Value, RemoteError>,
}

enum Event {
    Incoming(Option<Result<Message, tungstenite::Error>>),
    Command(Command),
    Completed(Completed),
}

pub(crate) struct Connection<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
    stream: SplitStream<WebSocketStream<S>>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    broker: Broker,
    registry: Arc<TypeRegistry>,
    config: BrokerConfig,
    table: IdentityTable,
    calls: CallTable,
    running: FuturesUnordered<BoxFuture<'static, Completed>>,
    on_disconnect: Vec<Box<dyn FnOnce() + Send>>,
    /// Present until the peer's version frame arrives.
    ready: Option<oneshot::Sender<Result<(), BrokerError>>>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Spawn the task for `ws`. The receiver resolves once the version
    /// handshake completes or fails.
    pub(crate) fn start(
        ws: WebSocketStream<S>,
        options: BrokerOptions,
        root: Option<&dyn Root>,
    ) -> (Broker, oneshot::Receiver<Result<(), BrokerError>>) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(ConnectionState::Handshaking);
        let broker = Broker::new(commands_tx, state_rx, options.config.call_timeout());
        let mut table = IdentityTable::new();
        if let Some(root) = root {
            table.set_root(root.root_object(&broker));
        }
        let (ready_tx, ready_rx) = oneshot::channel();
        let (sink, stream) = ws.split();
        let mut config = options.config;
        if config.max_depth > MAX_DEPTH {
            tracing::warn!("max_depth {} lowered to {}", config.max_depth, MAX_DEPTH);
            config.max_depth = MAX_DEPTH;
        }

        let connection = Connection {
            sink,
            stream,
            commands,
            state,
            broker: broker.clone(),
            registry: options.registry,
            config,
            table,
            calls: CallTable::default(),
            running: FuturesUnordered::new(),
            on_disconnect: Vec::new(),
            ready: Some(ready_tx),
        };
        tokio::spawn(connection.run());
        (broker, ready_rx)
    }

    async fn run(mut self) {
        let outcome = self.serve().await;
        match &outcome {
            Ok(()) => tracing::debug!("broker {} connection closed", self.broker.id()),
            Err(e) => tracing::warn!("broker {} connection failed: {}", self.broker.id(), e),
        }
        self.teardown(outcome.err()).await;
    }

    async fn serve(&mut self) -> Result<(), BrokerError> {
        self.send(&Frame::Version {
            version: PROTOCOL_VERSION,
        })
        .await?;

        loop {
            let event = tokio::select! {
                incoming = self.stream.next() => Event::Incoming(incoming),
                Some(command) = self.commands.recv() => Event::Command(command),
                Some(done) = self.running.next(), if !self.running.is_empty() => Event::Completed(done),
            };

            match event {
                Event::Incoming(None) => return Ok(()),
                Event::Incoming(Some(message)) => {
                    if !self.receive(message?).await? {
                        return Ok(());
                    }
                }
                Event::Command(Command::Close) => return Ok(()),
                Event::Command(command) => self.command(command).await?,
                Event::Completed(done) => self.complete(done).await?,
            }
        }
    }

    /// Returns false when the peer closed the connection.
    async fn receive(&mut self, message: Message) -> Result<bool, BrokerError> {
        match message {
            Message::Text(text) => {
                if text.len() > self.config.max_frame_bytes {
                    return Err(BrokerError::Protocol(format!(
                        "frame of {} bytes exceeds the limit of {}",
                        text.len(),
                        self.config.max_frame_bytes
                    )));
                }
                match serde_json::from_str::<Frame>(text.as_str()) {
                    Ok(frame) => self.frame(frame).await?,
                    Err(err) => self.malformed(text.as_str(), err).await?,
                }
                Ok(true)
            }
            Message::Binary(_) => Err(BrokerError::Protocol(
                "binary frames are not part of the protocol".into(),
            )),
            Message::Close(_) => Ok(false),
            _ => Ok(true),
        }
    }

    async fn frame(&mut self, frame: Frame) -> Result<(), BrokerError> {
        tracing::trace!("broker {} received {}", self.broker.id(), frame.command());
        if self.ready.is_some() {
            return self.handshake(frame);
        }
        match frame {
            Frame::Version { version } => {
                tracing::warn!("ignoring repeated version frame ({})", version);
                Ok(())
            }
            Frame::Message(request) => self.dispatch(request).await,
            Frame::CacheMessage(request) => self.observe(request).await,
            Frame::Answer { request_id, result } => self.answer(request_id, result).await,
            Frame::Error {
                request_id,
                failure,
            } => {
                self.error(request_id, failure);
                Ok(())
            }
            Frame::Decref { clid, count } | Frame::Decache { luid: clid, count } => {
                self.release(clid, count).await
            }
            Frame::Uncache { luid } => {
                if !self.table.forget_mirror(luid) {
                    tracing::debug!("uncache for unknown mirror {}", luid);
                }
                Ok(())
            }
            Frame::DidNotUnderstand { command } => {
                tracing::warn!("peer did not understand {:?}", command);
                Ok(())
            }
        }
    }

    fn handshake(&mut self, frame: Frame) -> Result<(), BrokerError> {
        match frame {
            Frame::Version { version } if version == PROTOCOL_VERSION => {
                self.state.send_replace(ConnectionState::Live);
                if let Some(ready) = self.ready.take() {
                    let _ = ready.send(Ok(()));
                }
                tracing::debug!("broker {} is live", self.broker.id());
                Ok(())
            }
            Frame::Version { version } => Err(BrokerError::VersionMismatch {
                local: PROTOCOL_VERSION,
                peer: version,
            }),
            other => Err(BrokerError::Protocol(format!(
                "expected version frame, got {}",
                other.command()
            ))),
        }
    }

    /// A frame that did not parse. Unknown commands are answered with
    /// `did_not_understand`; a request whose body did not decode fails alone.
    async fn malformed(&mut self, text: &str, err: serde_json::Error) -> Result<(), BrokerError> {
        let raw: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| BrokerError::Protocol(format!("frame is not JSON: {e}")))?;
        let command = raw
            .get("type")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        if self.ready.is_some() {
            return Err(BrokerError::Protocol(format!(
                "expected version frame, got {command:?}"
            )));
        }
        if !Frame::COMMANDS.contains(&command.as_str()) {
            tracing::warn!("peer sent unknown command {:?}", command);
            return self.send(&Frame::DidNotUnderstand { command }).await;
        }

        let request_id = raw.get("request_id").and_then(serde_json::Value::as_u64);
        let answer_required = raw
            .get("answer_required")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        match (command.as_str(), request_id) {
            ("message" | "cache_message", Some(request_id)) => {
                tracing::warn!("malformed {} request {}: {}", command, request_id, err);
                self.fail(
                    request_id,
                    answer_required,
                    RemoteError::protocol(format!("malformed {command}: {err}")),
                )
                .await
            }
            _ => Err(BrokerError::Protocol(format!("malformed {command}: {err}"))),
        }
    }

    fn jellier(&mut self, perspective: Option<Identity>) -> Jellier<'_> {
        Jellier::new(
            &mut self.table,
            &self.broker,
            perspective,
            self.config.max_depth,
        )
    }

    fn unjellier(&mut self) -> Unjellier<'_> {
        Unjellier::new(
            &mut self.table,
            &self.broker,
            &self.registry,
            self.config.max_depth,
        )
    }

    /// An inbound call to one of our exports.
    async fn dispatch(&mut self, request: Request) -> Result<(), BrokerError> {
        let Request {
            request_id,
            target,
            method,
            answer_required,
            args,
            kwargs,
        } = request;

        let Some(export) = self.table.export(target) else {
            return self
                .fail(request_id, answer_required, RemoteError::invalid_object(target))
                .await;
        };
        let object = export.object.clone();
        let perspective = export.perspective.clone();

        let decoded = self.unjellier().decode_args(args, kwargs);
        self.return_rejected().await?;
        let args = match decoded {
            Ok(args) => args,
            Err(err) => {
                return self
                    .fail(request_id, answer_required, rejected(&method, err))
                    .await;
            }
        };
        let invocation = Invocation {
            method: method.clone(),
            args,
            perspective: perspective.clone(),
            broker: self.broker.clone(),
        };
        // Handlers may do their work before returning the future.
        let started = std::panic::catch_unwind(AssertUnwindSafe(|| match object {
            Exported::Reference(object) => Some(object.remote_message(invocation)),
            Exported::View(object) => Some(object.view_message(invocation)),
            Exported::Cache { .. } => None,
        }));
        let future = match started {
            Ok(Some(future)) => future,
            Ok(None) => {
                return self
                    .fail(request_id, answer_required, RemoteError::invalid_object(target))
                    .await;
            }
            Err(_) => {
                let error = RemoteError::message(format!("handler for {method:?} panicked"));
                return self.fail(request_id, answer_required, error).await;
            }
        };

        tracing::debug!("broker {} dispatching {} to {}", self.broker.id(), method, target);
        self.running.push(Box::pin(async move {
            let result = AssertUnwindSafe(future)
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(RemoteError::message(format!("handler for {method:?} panicked")))
                });
            Completed {
                request_id,
                answer_required,
                perspective,
                method,
                result,
            }
        }));
        Ok(())
    }

    /// An update pushed to one of our cache mirrors.
    async fn observe(&mut self, request: Request) -> Result<(), BrokerError> {
        let Request {
            request_id,
            target,
            method,
            answer_required,
            args,
            kwargs,
        } = request;

        let Some(cell) = self.table.mirror(target) else {
            return self
                .fail(request_id, answer_required, RemoteError::invalid_object(target))
                .await;
        };
        let decoded = self.unjellier().decode_args(args, kwargs);
        self.return_rejected().await?;
        let args = match decoded {
            Ok(args) => args,
            Err(err) => {
                return self
                    .fail(request_id, answer_required, rejected(&method, err))
                    .await;
            }
        };
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            cell.write().observe(&method, args)
        }))
        .unwrap_or_else(|_| Err(RemoteError::message(format!("observer {method:?} panicked"))));

        self.complete(Completed {
            request_id,
            answer_required,
            perspective: None,
            method,
            result,
        })
        .await
    }

    async fn complete(&mut self, done: Completed) -> Result<(), BrokerError> {
        let Completed {
            request_id,
            answer_required,
            perspective,
            method,
            result,
        } = done;

        match result {
            Ok(_) if !answer_required => Ok(()),
            Ok(value) => match self.jellier(perspective).encode(&value) {
                Ok(result) => self.send(&Frame::Answer { request_id, result }).await,
                Err(err) => {
                    tracing::warn!("result of {} cannot be sent: {}", method, err);
                    let error = RemoteError::protocol(format!("result of {method} cannot be sent: {err}"));
                    self.fail(request_id, true, error).await
                }
            },
            Err(error) => {
                tracing::debug!("{} failed: {}", method, error);
                self.fail(request_id, answer_required, error).await
            }
        }
    }

    async fn fail(
        &mut self,
        request_id: RequestId,
        answer_required: bool,
        error: RemoteError,
    ) -> Result<(), BrokerError> {
        if !answer_required {
            tracing::debug!("one-way request {} failed: {}", request_id, error);
            return Ok(());
        }
        self.send(&Frame::Error {
            request_id,
            failure: error.into_wire(),
        })
        .await
    }

    async fn answer(&mut self, request_id: RequestId, result: Jelly) -> Result<(), BrokerError> {
        // Decoded even when discarded, so the references it carries are released.
        let decoded = self.unjellier().decode(result);
        self.return_rejected().await?;
        let Some(call) = self.calls.take(request_id) else {
            tracing::debug!("discarding answer to {}: no longer pending", request_id);
            return Ok(());
        };
        tracing::trace!("answer to {} ({})", request_id, call.method());
        call.resolve(decoded.map_err(|err| match err {
            DecodeError::Security { tag } => {
                tracing::warn!(
                    target: "perspective::security",
                    "rejected unregistered type {:?} in answer to {}",
                    tag,
                    request_id
                );
                CallError::Security { tag }
            }
            DecodeError::Protocol(message) => CallError::Protocol(message),
        }));
        Ok(())
    }

    /// Give back receipts of cacheables we refused to mirror, so the owner
    /// can drop them and their observers.
    async fn return_rejected(&mut self) -> Result<(), BrokerError> {
        for (luid, count) in self.table.take_rejected() {
            tracing::debug!("broker {} returning refused cache {}", self.broker.id(), luid);
            self.send(&Frame::Decache { luid, count }).await?;
        }
        Ok(())
    }

    fn error(&mut self, request_id: RequestId, failure: WireFailure) {
        let Some(call) = self.calls.take(request_id) else {
            tracing::debug!("discarding error for {}: no longer pending", request_id);
            return;
        };
        let error = match failure.kind {
            FailureKind::Security => CallError::Security {
                tag: failure.tag.unwrap_or_default(),
            },
            FailureKind::Protocol => CallError::Protocol(failure.message),
            _ => {
                let known = failure
                    .tag
                    .as_deref()
                    .is_some_and(|tag| self.registry.is_error_registered(tag));
                CallError::Remote(RemoteFailure::new(failure, known))
            }
        };
        tracing::debug!("{} failed remotely: {}", call.method(), error);
        call.resolve(Err(error));
    }

    /// The peer dropped `count` receipts of our export `clid`.
    async fn release(&mut self, clid: Clid, count: u32) -> Result<(), BrokerError> {
        match self.table.release_export(clid, count) {
            Ok(Some(export)) => {
                tracing::debug!("broker {} released export {}", self.broker.id(), clid);
                if export.object.is_cache() {
                    export.object.stop_observing();
                    return self.send(&Frame::Uncache { luid: clid }).await;
                }
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) => {
                tracing::warn!("{}", err);
                Ok(())
            }
        }
    }

    async fn command(&mut self, command: Command) -> Result<(), BrokerError> {
        match command {
            Command::Call {
                request_id,
                target,
                method,
                args,
                perspective,
                reply,
            } => {
                self.call(request_id, target, method, args, perspective, reply)
                    .await
            }
            Command::Abandon { request_id } => {
                if self.calls.abandon(request_id) {
                    tracing::debug!("abandoned call {}", request_id);
                }
                Ok(())
            }
            Command::ReleaseImport { clid, generation } => {
                match self.table.release_import(clid, generation) {
                    Some(count) => self.send(&Frame::Decref { clid, count }).await,
                    None => Ok(()),
                }
            }
            Command::ReleaseMirror { luid, generation } => {
                match self.table.release_mirror(luid, generation) {
                    Some(count) => self.send(&Frame::Decache { luid, count }).await,
                    None => Ok(()),
                }
            }
            Command::OnDisconnect(callback) => {
                self.on_disconnect.push(callback);
                Ok(())
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
                Ok(())
            }
            Command::Close => Ok(()),
        }
    }

    async fn call(
        &mut self,
        request_id: RequestId,
        target: Target,
        method: String,
        args: Args,
        perspective: Option<Identity>,
        reply: Option<ReplySender>,
    ) -> Result<(), BrokerError> {
        let (target, cache) = match target {
            Target::Reference(clid) => (clid, false),
            Target::Cache(key) => match self.table.exported_clid(&key) {
                Some(luid) => (luid, true),
                None => {
                    let error = CallError::Protocol(format!(
                        "cacheable is not mirrored by the peer; cannot send {method}"
                    ));
                    match reply {
                        Some(reply) => {
                            let _ = reply.send(Err(error));
                        }
                        None => tracing::debug!("{}", error),
                    }
                    return Ok(());
                }
            },
        };

        let (args, kwargs) = match self.jellier(perspective).encode_args(args) {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::debug!("call to {} not sent: {}", method, err);
                if let Some(reply) = reply {
                    let _ = reply.send(Err(CallError::Unserializable(err.to_string())));
                }
                return Ok(());
            }
        };

        let answer_required = reply.is_some();
        if let Some(reply) = reply {
            self.calls.insert(request_id, method.clone(), reply);
        }
        let request = Request {
            request_id,
            target,
            method,
            answer_required,
            args,
            kwargs,
        };
        let frame = if cache {
            Frame::CacheMessage(request)
        } else {
            Frame::Message(request)
        };
        self.send(&frame).await
    }

    async fn send(&mut self, frame: &Frame) -> Result<(), BrokerError> {
        let text = serde_json::to_string(frame)?;
        self.sink.send(Message::Text(text.into())).await?;
        Ok(())
    }

    fn stats(&self) -> BrokerStats {
        BrokerStats {
            exports: self.table.export_count(),
            imports: self.table.import_count(),
            mirrors: self.table.mirror_count(),
            pending_calls: self.calls.len(),
            running_handlers: self.running.len(),
        }
    }

    async fn teardown(&mut self, error: Option<BrokerError>) {
        self.state.send_replace(ConnectionState::Closed);
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Err(error.unwrap_or(BrokerError::Closed)));
        }

        let failed = self.calls.fail_all(&CallError::ConnectionLost);
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Call {
                    reply: Some(reply), ..
                } => {
                    let _ = reply.send(Err(CallError::ConnectionLost));
                }
                Command::OnDisconnect(callback) => self.on_disconnect.push(callback),
                Command::Stats(reply) => {
                    let _ = reply.send(self.stats());
                }
                _ => {}
            }
        }
        self.running.clear();

        for export in self.table.drain_exports() {
            export.object.stop_observing();
        }
        for callback in std::mem::take(&mut self.on_disconnect) {
            if std::panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
                tracing::warn!("disconnect callback panicked");
            }
        }

        let _ = tokio::time::timeout(CLOSE_GRACE, self.sink.close()).await;
        tracing::info!(
            "broker {} torn down; {} outstanding calls failed",
            self.broker.id(),
            failed
        );
    }
}

/// Map a decode failure on an inbound request to the error sent back.
fn rejected(method: &str, err: DecodeError) -> RemoteError {
    match err {
        DecodeError::Security { tag } => {
            tracing::warn!(
                target: "perspective::security",
                "rejected unregistered type {:?} in arguments to {}",
                tag,
                method
            );
            RemoteError::security(&tag)
        }
        DecodeError::Protocol(message) => RemoteError::protocol(message),
    }
}
