//! # nisse-server
//!
//! The server half of nisse: a static-file HTTP/1.1 server whose
//! per-connection request code is written in plain blocking style but runs
//! inside stackful coroutines, multiplexed over a reactor and executed by a
//! bounded worker pool (all three from `nisse-runtime`).
//!
//! ## Modules
//!
//! - `stream` - byte stream over plain TCP or TLS with would-block yield
//!   hooks
//! - `tls` - certificate loading and session setup
//! - `registry` - fd-keyed ownership of per-connection state
//! - `http` - request parsing, path resolution, response writing
//! - `server` - the orchestrator wiring accept, resume and removal together

pub mod http;
pub mod registry;
pub mod server;
pub mod stream;
pub mod tls;

pub use registry::{Connection, ConnectionRegistry, Phase, TaskYieldAction, TaskYieldState};
pub use server::{ServerConfig, ServerError, ServerHandle, WebServer};
pub use stream::{SocketStream, Stream};
pub use tls::{TlsContext, TlsError};
