//! # WebServer — the orchestrator
//!
//! Wires the pieces together:
//!
//! 1. The reactor watches the listening fd. Readiness there submits an
//!    accept job to the worker pool.
//! 2. The accept job takes the new socket, wraps it in a [`SocketStream`]
//!    (TLS if configured), creates the connection coroutine, installs the
//!    would-block yield hooks, registers everything and arms read interest
//!    on the new fd.
//! 3. Readiness on a connection fd submits a resume job. The job resumes
//!    the coroutine and translates the yielded action: re-arm read, arm
//!    write, or queue removal on the reactor thread.
//!
//! Work never runs on the reactor thread beyond handler dispatch; workers
//! do all accepting, parsing, file and socket I/O. Per connection, at most
//! one readiness interest is armed and at most one worker is inside the
//! coroutine at any time.

use crate::http::serve_connection;
use crate::registry::{Connection, ConnectionRegistry, Phase, TaskYieldAction, TaskYieldState};
use crate::stream::SocketStream;
use crate::tls::TlsContext;
use nisse_runtime::{Coroutine, Direction, JobQueue, Reactor, ReactorError, Yielder};

use std::fs;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot bind port {port}: {source}")]
    Bind { port: u16, source: io::Error },
    #[error("invalid content root {path}: {source}")]
    ContentRoot { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Reactor(#[from] ReactorError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Server construction parameters.
pub struct ServerConfig {
    pub port: u16,
    pub content_root: PathBuf,
    /// Worker threads draining the job queue.
    pub worker_count: usize,
    /// Serve TLS instead of plain TCP when set.
    pub tls: Option<TlsContext>,
    /// Usable stack bytes per connection coroutine.
    pub stack_size: usize,
}

impl ServerConfig {
    pub fn new(port: u16, content_root: impl Into<PathBuf>) -> Self {
        Self {
            port,
            content_root: content_root.into(),
            worker_count: 4,
            tls: None,
            stack_size: nisse_runtime::DEFAULT_STACK_SIZE,
        }
    }
}

struct ServerShared {
    listener: TcpListener,
    listen_fd: RawFd,
    content_root: PathBuf,
    tls: Option<TlsContext>,
    stack_size: usize,
    registry: ConnectionRegistry,
    job_queue: JobQueue,
    reactor: Reactor,
}

/// The server. `run()` turns the calling thread into the reactor thread and
/// blocks until [`stop`](Self::stop) (or a [`ServerHandle`]) is used.
pub struct WebServer {
    shared: Arc<ServerShared>,
    local_addr: SocketAddr,
}

/// Cloneable stop handle, safe to use from a signal thread.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<ServerShared>,
}

impl ServerHandle {
    pub fn stop(&self) {
        self.shared.reactor.stop();
    }
}

impl WebServer {
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let content_root =
            fs::canonicalize(&config.content_root).map_err(|source| ServerError::ContentRoot {
                path: config.content_root.clone(),
                source,
            })?;

        let listener = bind_listener(config.port)?;
        listener.set_nonblocking(true)?;
        let listen_fd = listener.as_raw_fd();
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(ServerShared {
            listener,
            listen_fd,
            content_root,
            tls: config.tls,
            stack_size: config.stack_size,
            registry: ConnectionRegistry::new(),
            job_queue: JobQueue::new(config.worker_count),
            reactor: Reactor::new()?,
        });

        Ok(Self { shared, local_addr })
    }

    /// Address the listener actually bound, port 0 resolved.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: self.shared.clone(),
        }
    }

    /// Arm the accept path and run the reactor on this thread. On return
    /// the job queue is drained and every remaining connection dropped.
    pub fn run(&self) -> Result<(), ServerError> {
        let shared = self.shared.clone();
        self.shared
            .reactor
            .add(self.shared.listen_fd, Direction::Read, move |fd| {
                shared.clone_submit(move |shared| accept_connection(&shared, fd));
            })?;

        tracing::info!(target: "nisse::server", addr = %self.local_addr, "listening");
        let result = self.shared.reactor.run();

        // Cooperative teardown: no new dispatches, then no workers, then no
        // connections (their interests died with the reactor loop).
        self.shared.job_queue.shutdown();
        let open = self.shared.registry.len();
        if open > 0 {
            tracing::info!(target: "nisse::server", open, "dropping open connections");
        }
        self.shared.registry.clear();

        result.map_err(Into::into)
    }

    pub fn stop(&self) {
        self.shared.reactor.stop();
    }
}

/// Small helper so handlers can submit jobs that borrow the shared state
/// without every closure redoing the Arc dance.
trait CloneSubmit {
    fn clone_submit<F>(self: &Arc<Self>, job: F)
    where
        F: FnOnce(Arc<ServerShared>) + Send + 'static;
}

impl CloneSubmit for ServerShared {
    fn clone_submit<F>(self: &Arc<Self>, job: F)
    where
        F: FnOnce(Arc<ServerShared>) + Send + 'static,
    {
        let shared = self.clone();
        self.job_queue.submit(move || job(shared));
    }
}

/// Worker-side accept path: drain one pending connection, install it, and
/// re-arm the listener.
fn accept_connection(shared: &Arc<ServerShared>, listen_fd: RawFd) {
    match shared.listener.accept() {
        Ok((sock, peer)) => {
            if let Err(e) = install_connection(shared, sock, peer) {
                tracing::warn!(target: "nisse::server", error = %e, "connection setup failed");
            }
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            // Spurious wakeup; just listen again.
        }
        Err(e) => {
            tracing::warn!(target: "nisse::server", error = %e, "accept failed");
        }
    }

    if let Err(e) = shared.reactor.rearm(listen_fd, Direction::Read) {
        tracing::error!(target: "nisse::server", error = %e, "cannot re-arm listener");
    }
}

/// Raw pointer to a connection's stream, handed into its coroutine.
///
/// Safety rests on the ownership order: the registry entry owns the stream
/// and outlives the coroutine stored next to it, and only one worker runs
/// the coroutine at a time, so the body's `&mut` through this pointer never
/// aliases another live reference.
struct StreamPtr(*mut SocketStream);
unsafe impl Send for StreamPtr {}

fn install_connection(
    shared: &Arc<ServerShared>,
    sock: TcpStream,
    peer: SocketAddr,
) -> Result<(), ServerError> {
    let _ = sock.set_nodelay(true);
    let stream = match &shared.tls {
        Some(context) => SocketStream::tls(sock, context)?,
        None => SocketStream::plain(sock)?,
    };
    let fd = stream.fd();
    let connection = Connection::new(fd, stream);

    {
        let mut state = connection.state.lock();
        let stream_ptr = StreamPtr(&mut state.stream as *mut SocketStream);
        let content_root = shared.content_root.clone();
        state.coroutine = Some(Coroutine::new(shared.stack_size, move |yielder| {
            connection_task(yielder, stream_ptr, fd, &content_root)
        })?);
    }

    shared.registry.insert(connection);

    let resume_shared = shared.clone();
    shared.reactor.add(fd, Direction::Read, move |fd| {
        resume_shared.clone_submit(move |shared| resume_connection(&shared, fd));
    })?;

    tracing::info!(target: "nisse::server", fd, peer = %peer, "accepted connection");
    Ok(())
}

/// The coroutine body. Installs the would-block hooks so the stream can
/// suspend the coroutine with a restore request, then serves requests until
/// the connection winds down. Returning from here is the `Remove` signal.
fn connection_task(
    yielder: &Yielder<TaskYieldAction>,
    stream: StreamPtr,
    fd: RawFd,
    content_root: &Path,
) {
    let stream = unsafe { &mut *stream.0 };

    let read_yield = {
        let yielder = yielder.clone();
        move || {
            yielder.suspend(TaskYieldAction {
                state: TaskYieldState::RestoreRead,
                fd,
            });
            true
        }
    };
    let write_yield = {
        let yielder = yielder.clone();
        move || {
            yielder.suspend(TaskYieldAction {
                state: TaskYieldState::RestoreWrite,
                fd,
            });
            true
        }
    };
    stream.set_read_yield(read_yield);
    stream.set_write_yield(write_yield);

    serve_connection(stream, content_root);
}

/// Worker-side resume path: run the coroutine until its next suspension and
/// act on what it asked for.
fn resume_connection(shared: &Arc<ServerShared>, fd: RawFd) {
    let Some(connection) = shared.registry.get(fd) else {
        // Removed while the job sat in the queue.
        return;
    };

    let mut state = connection.state.lock();
    state.phase = Phase::Running;
    let action = state.coroutine.as_mut().and_then(|coroutine| coroutine.resume());

    match action {
        Some(TaskYieldAction {
            state: TaskYieldState::RestoreRead,
            fd: yield_fd,
        }) => {
            debug_assert_eq!(yield_fd, fd);
            state.phase = Phase::Suspended(Direction::Read);
            drop(state);
            restore_or_remove(shared, fd, Direction::Read);
        }
        Some(TaskYieldAction {
            state: TaskYieldState::RestoreWrite,
            fd: yield_fd,
        }) => {
            debug_assert_eq!(yield_fd, fd);
            state.phase = Phase::Suspended(Direction::Write);
            drop(state);
            restore_or_remove(shared, fd, Direction::Write);
        }
        // An explicit Remove and a finished body mean the same thing.
        Some(TaskYieldAction {
            state: TaskYieldState::Remove,
            ..
        })
        | None => {
            state.phase = Phase::Closing;
            drop(state);
            queue_removal(shared, fd);
        }
    }
}

fn restore_or_remove(shared: &Arc<ServerShared>, fd: RawFd, direction: Direction) {
    if let Err(e) = shared.reactor.rearm(fd, direction) {
        tracing::warn!(target: "nisse::server", fd, error = %e, "re-arm failed; dropping connection");
        queue_removal(shared, fd);
    }
}

/// Destruction happens on the reactor thread, never on the worker that just
/// ran the coroutine: by the time the deferred closure runs, the resume job
/// has released its handle and the coroutine cannot be freeing its own
/// stack.
fn queue_removal(shared: &Arc<ServerShared>, fd: RawFd) {
    let shared_for_closure = shared.clone();
    shared.reactor.defer(move || {
        shared_for_closure.reactor.remove(fd);
        if shared_for_closure.registry.remove(fd).is_some() {
            tracing::debug!(target: "nisse::server", fd, "connection removed");
        }
    });
}

/// Create the listening socket the way the platform expects: SO_REUSEADDR
/// so restarts do not trip over TIME_WAIT, then bind and listen.
fn bind_listener(port: u16) -> Result<TcpListener, ServerError> {
    let bind_err = |source| ServerError::Bind { port, source };

    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return Err(bind_err(io::Error::last_os_error()));
        }

        let one: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );

        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();
        addr.sin_port = port.to_be();

        if libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) != 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(bind_err(err));
        }

        if libc::listen(fd, 1024) != 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(bind_err(err));
        }

        Ok(TcpListener::from_raw_fd(fd))
    }
}
