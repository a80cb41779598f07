//! The connection manager.
//!
//! Owns every live TCP connection to another module, keyed by the remote
//! module id. A connection only counts as established after the handshake:
//!
//! 1. both sides send `hello` with their module id and frame limit;
//! 2. the side with the lower module id (the master) keeps the connection
//!    unless it already has one to that module, and answers
//!    `connection_established`;
//! 3. the other side validates that message and keeps the connection too.
//!
//! So when two modules dial each other at once, both agree to keep the
//! connection the master saw first.

use crate::beacon::BeaconListener;
use crate::correlator::{ResponseCorrelator, ResponseFuture};
use crate::dispatch::{Dispatcher, MessageHandler};
use crate::establish::{self, Channel, WorkerPool};
use crate::frame::{self, DEFAULT_MAX_FRAME_LENGTH};
use crate::listeners::ListenerSet;
use crate::shutdown::Shutdown;
use crate::{EstablishError, FrameError, ResponseError, SendError};
use futures_util::future::join_all;
use modnet_core::{
    ApplicationId, Beacon, Body, CodecError, Envelope, MessageRegistry, ModuleId, ProtocolMessage,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Notified when a connection to a module is established or closed.
///
/// Called from connection tasks; implementations must not block.
pub trait ConnectionListener: Send + Sync {
    fn connection_established(&self, module: ModuleId);
    fn connection_closed(&self, module: ModuleId);
}

/// Tuning knobs for a [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Largest frame accepted or sent; capped by the 2-byte length prefix.
    pub max_frame_length: usize,
    pub connect_timeout: Option<Duration>,
    /// Fail requests nobody answered after this long. `None` waits forever.
    pub request_timeout: Option<Duration>,
    pub backlog: u32,
    /// Runtime for message handlers; the current one if `None`.
    pub handler_runtime: Option<Handle>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            connect_timeout: Some(Duration::from_secs(10)),
            request_timeout: None,
            backlog: 1024,
            handler_runtime: None,
        }
    }
}

/// A message encoded once, ready to be sent to any number of modules.
#[derive(Debug, Clone)]
pub struct Prepared {
    kind: String,
    pub(crate) text: Arc<str>,
}

impl Prepared {
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Encoded length in bytes.
    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

enum Outbound {
    Frame(Arc<str>),
    Close,
}

struct Connection {
    id: u64,
    peer: Option<SocketAddr>,
    outbound: mpsc::UnboundedSender<Outbound>,
    frame_limit: usize,
}

struct Inner {
    module_id: ModuleId,
    registry: Arc<MessageRegistry>,
    options: ConnectionOptions,
    pool: WorkerPool,
    connections: RwLock<HashMap<ModuleId, Connection>>,
    dialing: Mutex<HashSet<ModuleId>>,
    dispatcher: Dispatcher,
    correlator: ResponseCorrelator,
    listeners: ListenerSet<dyn ConnectionListener>,
    local_addrs: Mutex<Vec<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    dials: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Shutdown,
    next_connection: AtomicU64,
}

impl Inner {
    fn frame_limit(&self) -> usize {
        frame::effective_limit(self.options.max_frame_length)
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }
}

/// Owns the connections of one module.
///
/// Cheap to clone; all clones share the same state. Call
/// [`shutdown`](Self::shutdown) to stop it, dropping it is not enough.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("module_id", &self.inner.module_id)
            .field("connections", &self.inner.connections.read().len())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(
        module_id: ModuleId,
        registry: Arc<MessageRegistry>,
        options: ConnectionOptions,
        pool: WorkerPool,
    ) -> Self {
        let dispatcher = Dispatcher::new(options.handler_runtime.clone());
        Self {
            inner: Arc::new(Inner {
                module_id,
                registry,
                options,
                pool,
                connections: RwLock::new(HashMap::new()),
                dialing: Mutex::new(HashSet::new()),
                dispatcher,
                correlator: ResponseCorrelator::new(),
                listeners: ListenerSet::new(),
                local_addrs: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
                dials: Mutex::new(Vec::new()),
                shutdown: Shutdown::new(),
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    pub fn module_id(&self) -> ModuleId {
        self.inner.module_id
    }

    pub fn registry(&self) -> &Arc<MessageRegistry> {
        &self.inner.registry
    }

    pub fn correlator(&self) -> &ResponseCorrelator {
        &self.inner.correlator
    }

    /// Bind `addr` and accept connections on it until shutdown.
    ///
    /// Returns the bound address, which differs from `addr` for port 0.
    pub async fn start_listening(&self, addr: SocketAddr) -> Result<SocketAddr, EstablishError> {
        if self.inner.shutdown.is_triggered() {
            return Err(EstablishError::PoolClosed);
        }
        let listener = establish::listen(&self.inner.pool, addr, self.inner.options.backlog).await?;
        let local = listener
            .get_ref()
            .local_addr()
            .map_err(EstablishError::Socket)?;
        tracing::info!(module = %self.inner.module_id, "listening on {}", local);
        self.inner.local_addrs.lock().push(local);
        let handle = tokio::spawn(accept_loop(self.inner.clone(), listener));
        self.inner.track(handle);
        Ok(local)
    }

    /// Addresses this manager is accepting connections on.
    pub fn listening_addresses(&self) -> Vec<SocketAddr> {
        self.inner.local_addrs.lock().clone()
    }

    /// Open a connection to `addr`. Resolves once the TCP connection is up;
    /// the handshake completes in the background.
    pub async fn connect(&self, addr: SocketAddr) -> Result<(), EstablishError> {
        if self.inner.shutdown.is_triggered() {
            return Err(EstablishError::PoolClosed);
        }
        let channel =
            establish::connect(&self.inner.pool, addr, self.inner.options.connect_timeout).await?;
        spawn_connection(&self.inner, channel);
        Ok(())
    }

    /// Like [`connect`](Self::connect), as a task that can be aborted.
    pub fn connect_to(&self, addr: SocketAddr) -> JoinHandle<Result<(), EstablishError>> {
        let this = self.clone();
        tokio::spawn(async move { this.connect(addr).await })
    }

    /// Dial `module` at each address in turn until one connects, unless it
    /// is connected or being dialed already.
    pub fn dial(&self, module: ModuleId, addrs: Vec<SocketAddr>) {
        if module == self.inner.module_id
            || self.is_connected(module)
            || self.inner.shutdown.is_triggered()
        {
            return;
        }
        if !self.inner.dialing.lock().insert(module) {
            return;
        }
        let this = self.clone();
        let handle = tokio::spawn(async move {
            for addr in addrs {
                match this.connect(addr).await {
                    Ok(()) => {
                        tracing::debug!(%module, %addr, "dialed module");
                        break;
                    }
                    Err(e) => tracing::debug!(%module, %addr, "dial failed: {}", e),
                }
            }
            this.inner.dialing.lock().remove(&module);
        });
        let mut dials = self.inner.dials.lock();
        dials.retain(|d| !d.is_finished());
        dials.push(handle);
    }

    /// Encode `message` once for use with [`send_prepared`](Self::send_prepared).
    pub fn prepare(&self, message: &Envelope) -> Result<Prepared, CodecError> {
        let text = self.inner.registry.encode(message)?;
        Ok(Prepared {
            kind: message.kind().to_string(),
            text: text.into(),
        })
    }

    /// Queue `message` for `module`. Fails at once if not connected.
    pub fn send(&self, module: ModuleId, message: &Envelope) -> Result<(), SendError> {
        let prepared = self.prepare(message)?;
        self.send_prepared(module, &prepared)
    }

    pub fn send_prepared(&self, module: ModuleId, message: &Prepared) -> Result<(), SendError> {
        let connections = self.inner.connections.read();
        let connection = connections
            .get(&module)
            .ok_or(SendError::NotConnected(module))?;
        frame::check_length(&message.text, connection.frame_limit)?;
        connection
            .outbound
            .send(Outbound::Frame(message.text.clone()))
            .map_err(|_| SendError::Closed(module))
    }

    /// Send `request` and return a future for its response.
    pub fn request(&self, module: ModuleId, request: Envelope) -> Result<ResponseFuture, SendError> {
        let id = request.id;
        let prepared = self.prepare(&request)?;
        let response = self.inner.correlator.track(id, Some(module));
        if let Err(e) = self.send_prepared(module, &prepared) {
            self.inner
                .correlator
                .fail(id, ResponseError::SendFailed(e.to_string()));
            return Err(e);
        }
        if let Some(limit) = self.inner.options.request_timeout {
            let inner: Weak<Inner> = Arc::downgrade(&self.inner);
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                if let Some(inner) = inner.upgrade() {
                    if inner.correlator.fail(id, ResponseError::TimedOut) {
                        tracing::debug!(request = %id, %module, "request timed out");
                    }
                }
            });
        }
        Ok(response)
    }

    /// Send `request` and wait for the response.
    pub async fn ask(&self, module: ModuleId, request: Envelope) -> Result<Envelope, ResponseError> {
        self.request(module, request)
            .map_err(|e| ResponseError::SendFailed(e.to_string()))?
            .await
    }

    /// Install the default handler for `kind`, replacing any previous one.
    pub fn add_handler(&self, kind: &str, handler: Arc<dyn MessageHandler>) {
        self.inner
            .dispatcher
            .set_handler(kind, ApplicationId::DEFAULT, Some(handler));
    }

    /// Install the handler for `kind` within one application.
    pub fn add_application_handler(
        &self,
        application: ApplicationId,
        kind: &str,
        handler: Arc<dyn MessageHandler>,
    ) {
        self.inner
            .dispatcher
            .set_handler(kind, application, Some(handler));
    }

    /// Remove the handler for `kind`; the default one if `application` is `None`.
    pub fn remove_handler(&self, kind: &str, application: Option<ApplicationId>) {
        self.inner.dispatcher.set_handler(
            kind,
            application.unwrap_or(ApplicationId::DEFAULT),
            None,
        );
    }

    /// Snapshot of the modules with an established connection.
    pub fn connected_modules(&self) -> HashSet<ModuleId> {
        self.inner.connections.read().keys().copied().collect()
    }

    pub fn is_connected(&self, module: ModuleId) -> bool {
        self.inner.connections.read().contains_key(&module)
    }

    /// Remote address of the connection to `module`.
    pub fn peer_address(&self, module: ModuleId) -> Option<SocketAddr> {
        self.inner
            .connections
            .read()
            .get(&module)
            .and_then(|c| c.peer)
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) -> bool {
        self.inner.listeners.add(listener)
    }

    pub fn remove_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) -> bool {
        self.inner.listeners.remove(listener)
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_triggered()
    }

    /// Stop accepting, close every connection and wait until all of them
    /// have closed. Handlers and listeners are dropped afterwards.
    pub async fn shutdown(&self) {
        self.inner.shutdown.trigger();
        self.inner.pool.close();

        let dials: Vec<_> = self.inner.dials.lock().drain(..).collect();
        for dial in &dials {
            dial.abort();
        }
        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        let count = tasks.len();
        for result in join_all(tasks.into_iter().chain(dials)).await {
            if let Err(e) = result {
                if e.is_panic() {
                    tracing::error!("connection task panicked during shutdown");
                }
            }
        }

        self.inner.dispatcher.clear();
        self.inner.listeners.clear();
        tracing::info!(module = %self.inner.module_id, tasks = count, "connection manager stopped");
    }
}

impl BeaconListener for ConnectionManager {
    fn beacon_found(&self, beacon: &Beacon) {
        if beacon.module_id == self.inner.module_id {
            return;
        }
        self.dial(beacon.module_id, beacon.addresses.clone());
    }
}

fn spawn_connection(inner: &Arc<Inner>, channel: Channel<TcpStream>) {
    if inner.shutdown.is_triggered() {
        return;
    }
    let handle = tokio::spawn(run_connection(inner.clone(), channel));
    inner.track(handle);
}

async fn accept_loop(inner: Arc<Inner>, listener: Channel<tokio::net::TcpListener>) {
    let (listener, attachment) = listener.into_parts();
    let mut shutdown = inner.shutdown.signal();
    loop {
        let accepted = tokio::select! {
            _ = shutdown.wait() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => {
                tracing::debug!(%addr, "accepted connection");
                let handle = tokio::spawn(accept_connection(inner.clone(), stream, addr));
                inner.track(handle);
            }
            Err(e) => {
                tracing::warn!("accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    let local = listener.local_addr().ok();
    drop(listener);
    attachment.close().await;
    tracing::debug!(?local, "listener closed");
}

async fn accept_connection(inner: Arc<Inner>, stream: TcpStream, addr: SocketAddr) {
    match establish::accept(&inner.pool, stream).await {
        Ok(channel) if inner.shutdown.is_triggered() => channel.close().await,
        Ok(channel) => run_connection(inner, channel).await,
        Err(e) => tracing::warn!(%addr, "dropping accepted connection: {}", e),
    }
}

enum Flow {
    Continue,
    Close,
}

/// Per-connection state driven by the read loop.
struct ConnectionTask {
    inner: Arc<Inner>,
    id: u64,
    peer: Option<SocketAddr>,
    outbound: mpsc::UnboundedSender<Outbound>,
    write_limit: Arc<AtomicUsize>,
    remote: Option<ModuleId>,
    active: Option<ModuleId>,
    inbox: Option<mpsc::UnboundedSender<Envelope>>,
    dispatch_task: Option<JoinHandle<()>>,
}

impl ConnectionTask {
    fn queue(&self, message: &Envelope) -> Result<(), SendError> {
        let text = self.inner.registry.encode(message)?;
        self.outbound
            .send(Outbound::Frame(text.into()))
            .map_err(|_| SendError::Closed(self.remote.unwrap_or(self.inner.module_id)))
    }

    fn on_envelope(&mut self, envelope: Envelope) -> Flow {
        if let Body::Protocol(msg) = &envelope.body {
            match msg {
                ProtocolMessage::Hello {
                    module_id,
                    max_frame_length,
                } => return self.on_hello(*module_id, *max_frame_length as usize),
                ProtocolMessage::ConnectionEstablished { module_id } => {
                    return self.on_established(*module_id);
                }
                _ => {}
            }
        }

        let Some(remote) = self.active else {
            tracing::warn!(peer = ?self.peer, kind = envelope.kind(), "dropping message received before handshake");
            return Flow::Continue;
        };
        if envelope.is_response() {
            self.inner.correlator.handle_response(envelope);
        } else if let Some(inbox) = &self.inbox {
            if inbox.send(envelope).is_err() {
                tracing::warn!(%remote, "handler queue closed");
            }
        }
        Flow::Continue
    }

    fn on_hello(&mut self, remote: ModuleId, remote_limit: usize) -> Flow {
        if self.remote.is_some() {
            tracing::warn!(peer = ?self.peer, "second hello on connection");
            return Flow::Close;
        }
        if remote == self.inner.module_id {
            tracing::debug!(peer = ?self.peer, "connected to ourselves");
            return Flow::Close;
        }
        self.remote = Some(remote);
        let limit = self.inner.frame_limit().min(remote_limit);
        self.write_limit.store(limit, Ordering::SeqCst);

        if !self.inner.module_id.is_master_for(&remote) {
            return Flow::Continue;
        }
        if !self.activate(remote) {
            tracing::debug!(%remote, peer = ?self.peer, "already connected, closing duplicate");
            return Flow::Close;
        }
        let confirm = Envelope::new(ProtocolMessage::ConnectionEstablished {
            module_id: self.inner.module_id,
        });
        if let Err(e) = self.queue(&confirm) {
            tracing::warn!(%remote, "failed to confirm connection: {}", e);
            return Flow::Close;
        }
        self.inner
            .listeners
            .notify(|l| l.connection_established(remote));
        Flow::Continue
    }

    fn on_established(&mut self, module_id: ModuleId) -> Flow {
        let Some(remote) = self.remote else {
            tracing::warn!(peer = ?self.peer, "connection_established before hello");
            return Flow::Close;
        };
        if self.active.is_some() {
            tracing::warn!(%remote, "connection already established");
            return Flow::Continue;
        }
        if module_id != remote || !remote.is_master_for(&self.inner.module_id) {
            tracing::warn!(%remote, claimed = %module_id, "invalid connection_established");
            return Flow::Close;
        }
        if !self.activate(remote) {
            tracing::debug!(%remote, "already connected, closing duplicate");
            return Flow::Close;
        }
        self.inner
            .listeners
            .notify(|l| l.connection_established(remote));
        Flow::Continue
    }

    /// Register this connection as the one for `remote`, unless one exists.
    fn activate(&mut self, remote: ModuleId) -> bool {
        {
            let mut connections = self.inner.connections.write();
            if connections.contains_key(&remote) || self.inner.shutdown.is_triggered() {
                return false;
            }
            connections.insert(
                remote,
                Connection {
                    id: self.id,
                    peer: self.peer,
                    outbound: self.outbound.clone(),
                    frame_limit: self.write_limit.load(Ordering::SeqCst),
                },
            );
        }
        self.active = Some(remote);

        let (tx, rx) = mpsc::unbounded_channel();
        self.inbox = Some(tx);
        self.dispatch_task = Some(tokio::spawn(dispatch_loop(
            self.inner.clone(),
            remote,
            rx,
            self.outbound.clone(),
        )));
        tracing::info!(%remote, peer = ?self.peer, "connection established");
        true
    }

    async fn finish(mut self) {
        if let Some(remote) = self.active {
            let removed = {
                let mut connections = self.inner.connections.write();
                if connections.get(&remote).map(|c| c.id) == Some(self.id) {
                    connections.remove(&remote);
                    true
                } else {
                    false
                }
            };
            if removed {
                let failed = self
                    .inner
                    .correlator
                    .fail_module(remote, ResponseError::ConnectionLost(remote));
                tracing::info!(%remote, failed_requests = failed, "connection closed");
                self.inner.listeners.notify(|l| l.connection_closed(remote));
            }
        }
        self.inbox = None;
        let _ = self.outbound.send(Outbound::Close);
        if let Some(task) = self.dispatch_task.take() {
            let _ = task.await;
        }
    }
}

async fn run_connection(inner: Arc<Inner>, channel: Channel<TcpStream>) {
    let (stream, attachment) = channel.into_parts();
    let peer = stream.peer_addr().ok();
    let (mut reader, writer) = stream.into_split();
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let write_limit = Arc::new(AtomicUsize::new(inner.frame_limit()));
    let writer_task = tokio::spawn(write_loop(writer, outbound_rx, write_limit.clone()));

    let mut task = ConnectionTask {
        id: inner.next_connection.fetch_add(1, Ordering::Relaxed),
        inner: inner.clone(),
        peer,
        outbound,
        write_limit,
        remote: None,
        active: None,
        inbox: None,
        dispatch_task: None,
    };

    let hello = Envelope::new(ProtocolMessage::Hello {
        module_id: inner.module_id,
        max_frame_length: inner.frame_limit() as u32,
    });
    let mut open = match task.queue(&hello) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(?peer, "failed to send hello: {}", e);
            false
        }
    };

    let mut shutdown = inner.shutdown.signal();
    while open {
        let frame = tokio::select! {
            _ = shutdown.wait() => break,
            _ = task.outbound.closed() => {
                tracing::debug!(?peer, "writer stopped");
                break;
            }
            frame = frame::read_frame(&mut reader, inner.options.max_frame_length) => frame,
        };
        let text = match frame {
            Ok(Some(text)) => text,
            Ok(None) => {
                tracing::debug!(?peer, "connection closed by peer");
                break;
            }
            Err(FrameError::Io(e)) => {
                tracing::debug!(?peer, "read failed: {}", e);
                break;
            }
            Err(e) => {
                tracing::warn!(?peer, "protocol error: {}", e);
                break;
            }
        };
        let envelope = match inner.registry.decode(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(?peer, "dropping undecodable message: {}", e);
                continue;
            }
        };
        open = matches!(task.on_envelope(envelope), Flow::Continue);
    }

    task.finish().await;
    drop(reader);
    if let Err(e) = writer_task.await {
        if e.is_panic() {
            tracing::error!(?peer, "writer panicked");
        }
    }
    attachment.close().await;
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    limit: Arc<AtomicUsize>,
) {
    while let Some(out) = rx.recv().await {
        let text = match out {
            Outbound::Frame(text) => text,
            Outbound::Close => break,
        };
        match frame::write_frame(&mut writer, &text, limit.load(Ordering::SeqCst)).await {
            Ok(()) => {}
            Err(e @ FrameError::Oversized { .. }) => {
                tracing::warn!("dropping outgoing message: {}", e);
            }
            Err(e) => {
                tracing::debug!("write failed: {}", e);
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn dispatch_loop(
    inner: Arc<Inner>,
    remote: ModuleId,
    mut inbox: mpsc::UnboundedReceiver<Envelope>,
    outbound: mpsc::UnboundedSender<Outbound>,
) {
    while let Some(message) = inbox.recv().await {
        let Some(reply) = inner.dispatcher.dispatch(remote, message).await else {
            continue;
        };
        match inner.registry.encode(&reply) {
            Ok(text) => {
                if outbound.send(Outbound::Frame(text.into())).is_err() {
                    break;
                }
            }
            Err(e) => tracing::warn!(%remote, "failed to encode reply: {}", e),
        }
    }
}
