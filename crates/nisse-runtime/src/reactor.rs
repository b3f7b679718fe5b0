//! # Reactor — one-shot readiness dispatch
//!
//! A dedicated thread blocks in `mio::Poll` and dispatches readiness events
//! to per-fd handlers. The observable contract is one-shot:
//!
//! 1. `add()` stores a handler for an fd and arms interest in one direction.
//! 2. When that direction becomes ready, the arm is consumed (the fd is
//!    removed from the poller) *before* the handler runs, exactly once.
//! 3. Whoever wants another notification calls `rearm()`.
//!
//! At most one direction (read XOR write) is armed per fd at any time.
//! Handlers run on the reactor thread and must do O(1) work: submit a job
//! somewhere else and return. Calling back into the reactor from a handler
//! deadlocks.
//!
//! `defer()` queues a closure that the reactor thread runs between dispatch
//! cycles. The server uses this to destroy connection state only after the
//! worker that requested the destruction has let go of it.

use crossbeam_queue::SegQueue;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Readiness direction for an armed interest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    fn interest(self) -> Interest {
        match self {
            Direction::Read => Interest::READABLE,
            Direction::Write => Interest::WRITABLE,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("fd {0} is not registered")]
    NotRegistered(RawFd),
    #[error("fd {0} is already armed for {1:?}")]
    AlreadyArmed(RawFd, Direction),
    #[error("poll backend failed: {0}")]
    Fault(#[from] io::Error),
}

/// Callback invoked on the reactor thread when an armed fd becomes ready.
pub type Handler = Box<dyn FnMut(RawFd) + Send>;

type Deferred = Box<dyn FnOnce() + Send>;

struct EventEntry {
    handler: Handler,
    /// Currently armed direction; `None` also means the fd is absent from
    /// the poller (the arm is consumed by deregistering).
    armed: Option<Direction>,
}

const WAKER_TOKEN: Token = Token(usize::MAX);

/// One-shot readiness reactor over `mio::Poll`.
pub struct Reactor {
    /// Held exclusively by `run()`.
    poll: Mutex<Poll>,
    /// Standalone handle for arming fds from any thread.
    registry: mio::Registry,
    waker: Waker,
    entries: Mutex<HashMap<RawFd, EventEntry>>,
    deferred: SegQueue<Deferred>,
    stopping: AtomicBool,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        Ok(Self {
            poll: Mutex::new(poll),
            registry,
            waker,
            entries: Mutex::new(HashMap::new()),
            deferred: SegQueue::new(),
            stopping: AtomicBool::new(false),
        })
    }

    /// Store `handler` for `fd` and arm one-shot interest in `direction`.
    ///
    /// Re-adding an fd replaces its handler; arming a direction that is
    /// already armed is an error.
    pub fn add<F>(&self, fd: RawFd, direction: Direction, handler: F) -> Result<(), ReactorError>
    where
        F: FnMut(RawFd) + Send + 'static,
    {
        let mut entries = self.entries.lock();
        match entries.entry(fd) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().armed == Some(direction) {
                    return Err(ReactorError::AlreadyArmed(fd, direction));
                }
                occupied.get_mut().handler = Box::new(handler);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(EventEntry {
                    handler: Box::new(handler),
                    armed: None,
                });
            }
        }
        self.arm_locked(&mut entries, fd, direction)
    }

    /// Re-arm a registered fd in `direction`, using its stored handler.
    /// Arming the already-armed direction is idempotent success.
    pub fn rearm(&self, fd: RawFd, direction: Direction) -> Result<(), ReactorError> {
        let mut entries = self.entries.lock();
        if !entries.contains_key(&fd) {
            return Err(ReactorError::NotRegistered(fd));
        }
        self.arm_locked(&mut entries, fd, direction)
    }

    /// Disarm and forget an fd. Quiet if the fd was never registered.
    pub fn remove(&self, fd: RawFd) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.remove(&fd) {
            if entry.armed.is_some() {
                // The fd may already be closed, in which case the poller
                // has forgotten it on its own.
                let _ = self.registry.deregister(&mut SourceFd(&fd));
            }
        }
    }

    /// Queue a closure for the reactor thread to run between dispatch
    /// cycles.
    pub fn defer<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.deferred.push(Box::new(f));
        let _ = self.waker.wake();
    }

    /// Make `run()` return after the current dispatch cycle.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }

    /// Poll loop. Blocks until `stop()`; keeps running with zero armed
    /// interests. Returns `ReactorError::Fault` on a non-recoverable poll
    /// failure.
    ///
    /// # Panics
    ///
    /// Panics if called while another `run()` is in progress.
    pub fn run(&self) -> Result<(), ReactorError> {
        let mut poll = self
            .poll
            .try_lock()
            .expect("reactor is already running on another thread");
        let mut events = Events::with_capacity(256);

        loop {
            while let Some(deferred) = self.deferred.pop() {
                deferred();
            }
            if self.stopping.load(Ordering::Acquire) {
                return Ok(());
            }

            match poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ReactorError::Fault(e)),
            }

            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                self.dispatch(event.token().0 as RawFd);
            }
        }
    }

    /// Consume the arm for `fd` and invoke its handler once.
    fn dispatch(&self, fd: RawFd) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&fd) else {
            // Removed between the poll wakeup and now.
            return;
        };
        if entry.armed.is_none() {
            // Stale event from a previous arm of this fd.
            return;
        }
        let _ = self.registry.deregister(&mut SourceFd(&fd));
        entry.armed = None;
        (entry.handler)(fd);
    }

    fn arm_locked(
        &self,
        entries: &mut HashMap<RawFd, EventEntry>,
        fd: RawFd,
        direction: Direction,
    ) -> Result<(), ReactorError> {
        let entry = entries
            .get_mut(&fd)
            .ok_or(ReactorError::NotRegistered(fd))?;
        if entry.armed == Some(direction) {
            return Ok(());
        }
        let mut source = SourceFd(&fd);
        let token = Token(fd as usize);
        if entry.armed.is_some() {
            // Switching direction: the fd is still in the poller.
            self.registry
                .reregister(&mut source, token, direction.interest())?;
        } else {
            self.registry
                .register(&mut source, token, direction.interest())?;
        }
        entry.armed = Some(direction);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn spawn_reactor() -> (Arc<Reactor>, thread::JoinHandle<Result<(), ReactorError>>) {
        let reactor = Arc::new(Reactor::new().unwrap());
        let runner = reactor.clone();
        let handle = thread::Builder::new()
            .name("reactor-test".into())
            .spawn(move || runner.run())
            .unwrap();
        (reactor, handle)
    }

    fn nonblocking_pair() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    #[test]
    fn fires_once_per_arm() {
        let (reactor, handle) = spawn_reactor();
        let (watched, mut peer) = nonblocking_pair();
        let fd = watched.as_raw_fd();

        let (tx, rx) = mpsc::channel();
        reactor
            .add(fd, Direction::Read, move |fd| tx.send(fd).unwrap())
            .unwrap();

        peer.write_all(b"x").unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), fd);

        // Still readable, but the arm was consumed: no second event.
        peer.write_all(b"y").unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        // Re-arming delivers again.
        reactor.rearm(fd, Direction::Read).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), fd);

        reactor.stop();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn rearm_unknown_fd_is_an_error() {
        let reactor = Reactor::new().unwrap();
        assert!(matches!(
            reactor.rearm(12345, Direction::Read),
            Err(ReactorError::NotRegistered(12345))
        ));
    }

    #[test]
    fn double_arm_same_direction_is_an_error() {
        let reactor = Reactor::new().unwrap();
        let (watched, _peer) = nonblocking_pair();
        let fd = watched.as_raw_fd();

        reactor.add(fd, Direction::Read, |_| {}).unwrap();
        assert!(matches!(
            reactor.add(fd, Direction::Read, |_| {}),
            Err(ReactorError::AlreadyArmed(_, Direction::Read))
        ));
        // The armed direction itself is idempotent through rearm.
        reactor.rearm(fd, Direction::Read).unwrap();
        reactor.remove(fd);
    }

    #[test]
    fn deferred_closures_run_on_the_reactor_thread() {
        let (reactor, handle) = spawn_reactor();
        let (tx, rx) = mpsc::channel();
        reactor.defer(move || tx.send(thread::current().name().map(String::from)).unwrap());

        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("reactor-test"));

        reactor.stop();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn stop_returns_from_run_without_registrations() {
        let (reactor, handle) = spawn_reactor();
        thread::sleep(Duration::from_millis(50));
        reactor.stop();
        handle.join().unwrap().unwrap();
    }
}
