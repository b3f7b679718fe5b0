//! # nisse-runtime
//!
//! Scheduling substrate for the nisse web server.
//!
//! This crate knows nothing about HTTP or sockets-as-streams. It provides
//! the three mechanisms the server is built from:
//!
//! - `reactor` - readiness notifications per file descriptor, one-shot,
//!   dispatched on a dedicated thread
//! - `job_queue` - a bounded pool of worker threads draining a FIFO
//! - `coroutine` - stackful coroutines with symmetric transfer of a single
//!   value per suspension (architecture-specific context switching)

pub mod coroutine;
pub mod job_queue;
pub mod reactor;

pub use coroutine::{Coroutine, Yielder, DEFAULT_STACK_SIZE};
pub use job_queue::JobQueue;
pub use reactor::{Direction, Reactor, ReactorError};
