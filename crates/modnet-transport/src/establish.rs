//! Channel establishment.
//!
//! Every socket goes through the same chain before it is handed out:
//!
//! 1. **register** it with a [`WorkerPool`], which assigns it one [`Worker`];
//! 2. **connect** or **bind** it, as a job on that worker;
//! 3. for multicast only, **join** the group, again on that worker.
//!
//! A worker runs one job at a time, so all actions on one channel are
//! serialized. A failure at any step closes the socket and surfaces that
//! step's error; nothing half-built is returned. Dropping an in-flight chain
//! drops the running job and with it the socket.

use crate::EstablishError;
use futures_util::future::BoxFuture;
use modnet_core::MulticastGroup;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::Poll;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// A serial executor for channel actions.
#[derive(Clone)]
pub struct Worker {
    index: usize,
    jobs: mpsc::UnboundedSender<Job>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker").field("index", &self.index).finish()
    }
}

impl Worker {
    fn spawn(index: usize) -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job().await;
            }
            tracing::trace!(worker = index, "worker stopped");
        });
        Self { index, jobs }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Run `f` on this worker after every job queued before it.
    ///
    /// If the caller stops waiting, the job is dropped at its next await point.
    pub async fn run<F, Fut, T>(&self, f: F) -> Result<T, EstablishError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (mut tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || -> BoxFuture<'static, ()> {
            Box::pin(async move {
                tokio::select! {
                    out = f() => {
                        let _ = tx.send(out);
                    }
                    _ = tx.closed() => {}
                }
            })
        });
        self.jobs
            .send(job)
            .map_err(|_| EstablishError::WorkerGone)?;
        rx.await.map_err(|_| EstablishError::WorkerGone)
    }
}

#[derive(Debug, Default)]
struct PoolStats {
    open: AtomicUsize,
    closed: AtomicBool,
}

/// A fixed set of workers that channels are registered with.
///
/// Must be created inside a Tokio runtime.
#[derive(Clone)]
pub struct WorkerPool {
    workers: Arc<Vec<Worker>>,
    next: Arc<AtomicUsize>,
    stats: Arc<PoolStats>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .field("open_channels", &self.open_channels())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let workers = (0..size.max(1)).map(Worker::spawn).collect();
        Self {
            workers: Arc::new(workers),
            next: Arc::new(AtomicUsize::new(0)),
            stats: Arc::new(PoolStats::default()),
        }
    }

    /// Channels currently registered and not yet closed.
    pub fn open_channels(&self) -> usize {
        self.stats.open.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.stats.closed.load(Ordering::SeqCst)
    }

    /// Refuse further registrations. Existing channels are unaffected.
    pub fn close(&self) {
        self.stats.closed.store(true, Ordering::SeqCst);
    }

    fn next_worker(&self) -> Worker {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[i].clone()
    }

    /// Step 1 of the chain: attach `socket` to a worker.
    ///
    /// On failure the socket is closed: through its worker if registration
    /// had already taken effect, otherwise by dropping it on the spot.
    pub async fn register<S: Send + 'static>(&self, socket: S) -> Result<Channel<S>, EstablishError> {
        if self.is_closed() {
            drop(socket);
            return Err(EstablishError::PoolClosed);
        }

        let worker = self.next_worker();
        let stats = self.stats.clone();
        let outcome = worker
            .run(move || async move {
                let guard = RegistrationGuard::new(stats.clone());
                let result = if stats.closed.load(Ordering::SeqCst) {
                    Err(EstablishError::PoolClosed)
                } else {
                    Ok(())
                };
                (guard, result)
            })
            .await;

        match outcome {
            Ok((guard, Ok(()))) => {
                tracing::trace!(worker = worker.index, "channel registered");
                Ok(Channel {
                    socket,
                    attachment: Attachment { worker, guard },
                })
            }
            Ok((guard, Err(cause))) => {
                tracing::debug!("registration failed after attach: {}", cause);
                Attachment { worker, guard }.close_with(socket).await;
                Err(cause)
            }
            Err(cause) => {
                tracing::debug!("registration failed: {}", cause);
                drop(socket);
                Err(cause)
            }
        }
    }
}

/// Counts a channel as open for as long as it lives.
#[derive(Debug)]
struct RegistrationGuard {
    stats: Arc<PoolStats>,
}

impl RegistrationGuard {
    fn new(stats: Arc<PoolStats>) -> Self {
        stats.open.fetch_add(1, Ordering::SeqCst);
        Self { stats }
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.stats.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Ties a channel to its worker. Dropping it deregisters the channel.
#[derive(Debug)]
pub struct Attachment {
    worker: Worker,
    guard: RegistrationGuard,
}

impl Attachment {
    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    /// Run an action on this channel's worker.
    pub async fn run<F, Fut, T>(&self, f: F) -> Result<T, EstablishError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.worker.run(f).await
    }

    /// Deregister through the worker, after its pending actions.
    pub async fn close(self) {
        self.close_with(()).await
    }

    async fn close_with<S: Send + 'static>(self, socket: S) {
        let Attachment { worker, guard } = self;
        // On failure the job, and the socket and guard it owns, are dropped here.
        let _ = worker
            .run(move || async move {
                drop(socket);
                drop(guard);
            })
            .await;
    }
}

/// A registered socket.
#[derive(Debug)]
pub struct Channel<S> {
    socket: S,
    attachment: Attachment,
}

impl<S: Send + 'static> Channel<S> {
    pub fn get_ref(&self) -> &S {
        &self.socket
    }

    pub fn worker(&self) -> &Worker {
        &self.attachment.worker
    }

    pub fn into_parts(self) -> (S, Attachment) {
        (self.socket, self.attachment)
    }

    /// Close the socket and deregister it.
    pub async fn close(self) {
        let (socket, attachment) = self.into_parts();
        attachment.close_with(socket).await
    }

    /// Run a socket-consuming action on the worker; close on failure.
    async fn step<F, Fut, U>(self, f: F) -> Result<Channel<U>, EstablishError>
    where
        F: FnOnce(S) -> Fut + Send + 'static,
        Fut: Future<Output = Result<U, EstablishError>> + Send + 'static,
        U: Send + 'static,
    {
        let (socket, attachment) = self.into_parts();
        match attachment.run(move || f(socket)).await {
            Ok(Ok(socket)) => Ok(Channel { socket, attachment }),
            Ok(Err(cause)) | Err(cause) => {
                attachment.close().await;
                Err(cause)
            }
        }
    }
}

enum Connecting {
    Done(io::Result<TcpStream>),
    Pending(BoxFuture<'static, io::Result<TcpStream>>),
}

impl Channel<TcpSocket> {
    /// Step 2 for clients.
    ///
    /// The connect is issued on the worker, but the handshake is awaited
    /// outside it so a slow peer does not hold up other channels.
    pub async fn connect(
        self,
        addr: SocketAddr,
        timeout: Option<Duration>,
    ) -> Result<Channel<TcpStream>, EstablishError> {
        let (socket, attachment) = self.into_parts();
        let issued = attachment
            .run(move || async move {
                let mut connecting: BoxFuture<'static, io::Result<TcpStream>> =
                    Box::pin(socket.connect(addr));
                match futures_util::poll!(&mut connecting) {
                    Poll::Ready(result) => Connecting::Done(result),
                    Poll::Pending => Connecting::Pending(connecting),
                }
            })
            .await;

        let result = match issued {
            Ok(Connecting::Done(result)) => Ok(result),
            Ok(Connecting::Pending(connecting)) => match timeout {
                Some(limit) => tokio::time::timeout(limit, connecting)
                    .await
                    .map_err(|_| EstablishError::Timeout(addr)),
                None => Ok(connecting.await),
            },
            Err(cause) => Err(cause),
        };
        let stream = result.and_then(|r| r.map_err(|source| EstablishError::Connect { addr, source }));
        match stream.and_then(|s| s.set_nodelay(true).map(|()| s).map_err(EstablishError::Socket)) {
            Ok(socket) => Ok(Channel { socket, attachment }),
            Err(cause) => {
                attachment.close().await;
                Err(cause)
            }
        }
    }

    /// Step 2 for servers.
    pub async fn listen(
        self,
        addr: SocketAddr,
        backlog: u32,
    ) -> Result<Channel<TcpListener>, EstablishError> {
        self.step(move |socket| async move {
            let bind = |socket: TcpSocket| -> io::Result<TcpListener> {
                socket.set_reuseaddr(true)?;
                socket.bind(addr)?;
                socket.listen(backlog)
            };
            bind(socket).map_err(|source| EstablishError::Bind { addr, source })
        })
        .await
    }
}

impl Channel<Socket> {
    /// Step 2 for multicast receivers: bind the group's port on all addresses.
    pub async fn bind_multicast(
        self,
        group: MulticastGroup,
    ) -> Result<Channel<UdpSocket>, EstablishError> {
        self.step(move |socket| async move {
            let local = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.group.port());
            let bind = |socket: Socket| -> io::Result<UdpSocket> {
                socket.set_reuse_address(true)?;
                socket.bind(&SockAddr::from(local))?;
                if !group.interface.is_unspecified() {
                    socket.set_multicast_if_v4(&group.interface)?;
                }
                socket.set_multicast_loop_v4(true)?;
                socket.set_nonblocking(true)?;
                UdpSocket::from_std(socket.into())
            };
            bind(socket).map_err(|source| EstablishError::Bind {
                addr: local.into(),
                source,
            })
        })
        .await
    }
}

impl Channel<UdpSocket> {
    /// Step 3 for multicast receivers.
    pub async fn join(self, group: MulticastGroup) -> Result<Self, EstablishError> {
        self.step(move |socket| async move {
            socket
                .join_multicast_v4(*group.group.ip(), group.interface)
                .map(|()| socket)
                .map_err(|source| EstablishError::Join { group, source })
        })
        .await
    }
}

/// Open a client connection to `addr`.
pub async fn connect(
    pool: &WorkerPool,
    addr: SocketAddr,
    timeout: Option<Duration>,
) -> Result<Channel<TcpStream>, EstablishError> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(EstablishError::Socket)?;
    pool.register(socket).await?.connect(addr, timeout).await
}

/// Bind a listening socket on `addr`.
pub async fn listen(
    pool: &WorkerPool,
    addr: SocketAddr,
    backlog: u32,
) -> Result<Channel<TcpListener>, EstablishError> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(EstablishError::Socket)?;
    pool.register(socket).await?.listen(addr, backlog).await
}

/// Register a stream produced by a listener.
pub async fn accept(pool: &WorkerPool, stream: TcpStream) -> Result<Channel<TcpStream>, EstablishError> {
    stream.set_nodelay(true).map_err(EstablishError::Socket)?;
    pool.register(stream).await
}

/// Bind a UDP socket and join `group` on it.
pub async fn bind_multicast(
    pool: &WorkerPool,
    group: MulticastGroup,
) -> Result<Channel<UdpSocket>, EstablishError> {
    if !group.group.ip().is_multicast() {
        return Err(EstablishError::Join {
            group,
            source: io::Error::new(io::ErrorKind::InvalidInput, "not a multicast address"),
        });
    }
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(EstablishError::Socket)?;
    pool.register(socket)
        .await?
        .bind_multicast(group)
        .await?
        .join(group)
        .await
}
