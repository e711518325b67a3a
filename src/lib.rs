//! sockd - singleton local daemons for developer tooling.
//!
//! A [`DaemonServer`] is a long-lived background process listening on a local
//! IPC endpoint (Unix domain socket; named pipe on Windows); a
//! [`DaemonClient`] locates it, spawns it when absent, health-checks it with
//! a ping handshake, and replaces it when it is wedged or its program was
//! rebuilt. Many short-lived clients sharing a working directory amortize
//! one daemon's expensive startup.
//!
//! Coordination happens through `.{service}/daemon/` next to the working
//! directory: the socket, a `pid` file naming the elected daemon, an `mtime`
//! file recording the daemon program's build time, a transient
//! `starting.lock` serialising startup, and a `log` file collecting daemon
//! stderr.
//!
//! ## Server
//!
//! ```ignore
//! let server = DaemonServer::new("mysvc", |req| async move { handle(req) })?;
//! match server.listen().await? {
//!     Listen::AlreadyRunning => return Ok(()), // a live peer has it
//!     Listen::Running(daemon) => daemon.serve().await?,
//! }
//! ```
//!
//! ## Client
//!
//! ```ignore
//! let client = DaemonClient::new("mysvc", daemon_binary_path)?;
//! let response = client.request(serde_json::json!({ "op": "build" })).await?;
//! ```
//!
//! Requests and responses are open JSON objects correlated by a generated
//! string `id`; the framework only ever interprets its own ping/pong
//! messages. Note that a request may be delivered to more than one daemon
//! incarnation across restarts - handlers should tolerate duplicate
//! processing; the client guarantees the caller sees exactly one response.

pub mod cancel;
pub mod client;
pub mod endpoint;
pub mod error;
pub mod lock;
pub mod paths;
pub mod ping;
pub mod protocol;
pub mod ready;
pub mod server;
mod spawn;

pub use cancel::CancelToken;
pub use client::{DaemonClient, DaemonClientBuilder};
pub use error::{Result, SockdError};
pub use lock::StartingLock;
pub use paths::ServicePaths;
pub use server::{DaemonServer, Listen, RunningDaemon, ShutdownHandle};
