//! Daemon server: singleton election, connection serving, idle lifecycle.
//!
//! `listen()` runs the election for the service directory. Exactly one
//! launcher ends up bound and committed; every other concurrent launcher
//! either defers to a live peer (after confirming it answers a handshake
//! ping) or usurps a dead one. The winner serves framed messages until the
//! idle timeout fires or it is told to shut down.

use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Instant};

use crate::endpoint::{self, IpcConnection, IpcListener};
use crate::error::{Result, SockdError};
use crate::lock::{self, StartingLock};
use crate::paths::{self, ServicePaths};
use crate::ping;
use crate::protocol;
use crate::ready;
use crate::spawn;

/// Whole-server inactivity limit: no recognised requests for this long and
/// the daemon closes.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Per-connection receive-idle limit; quiet connections are destroyed.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(1);

/// A freshly bound daemon that sees no traffic at all for this long lost its
/// herd race to a sibling nobody is talking to it about; it closes.
const STARTUP_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Peer-probe budget after losing the startup lock.
const LOCK_CONTENTION_BUDGET: Duration = Duration::from_millis(1000);

/// Peer-probe budget after the endpoint turned out to be occupied.
const BIND_CONTENTION_BUDGET: Duration = Duration::from_millis(500);

/// Floor for a single handshake-probe attempt.
const MIN_PROBE_TIMEOUT: Duration = Duration::from_millis(50);

/// Pause between failed probe attempts so a refused connect does not spin.
const PROBE_RETRY_PAUSE: Duration = Duration::from_millis(10);

type BoxedHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Value> + Send>> + Send + Sync>;

type RequestFilter = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Outcome of the singleton election.
pub enum Listen {
    /// This process won; drive [`RunningDaemon::serve`] to completion.
    Running(RunningDaemon),
    /// A live peer answered the handshake; the `ALREADY RUNNING` marker has
    /// been written and the caller should simply exit 0.
    AlreadyRunning,
}

enum Election {
    Deferred,
    Usurped,
}

enum Probe {
    Pong,
    Garbage,
}

/// A daemon server for one service directory.
pub struct DaemonServer {
    paths: ServicePaths,
    script: Option<PathBuf>,
    handler: BoxedHandler,
    is_request: RequestFilter,
    idle_timeout: Duration,
    connection_timeout: Duration,
}

impl DaemonServer {
    /// Build a server for `name` rooted at the current working directory.
    ///
    /// `handler` is invoked once per recognised request; its result is sent
    /// back with the request's `id` forced onto it. If the environment
    /// variable `SOCK_DAEMON_SCRIPT_<name>` is set (the spawning client sets
    /// it), its path is stat'ed at commit time so clients can detect a
    /// rebuilt daemon program.
    pub fn new<F, Fut>(name: &str, handler: F) -> Result<Self>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Value> + Send + 'static,
    {
        Ok(Self::with_paths(ServicePaths::new(name)?, handler))
    }

    /// Build a server rooted at an explicit base directory.
    pub fn in_dir<F, Fut>(name: &str, base: impl AsRef<Path>, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Value> + Send + 'static,
    {
        Self::with_paths(ServicePaths::in_dir(name, base), handler)
    }

    fn with_paths<F, Fut>(paths: ServicePaths, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Value> + Send + 'static,
    {
        let script = std::env::var_os(paths.script_env_var()).map(PathBuf::from);
        let is_request: RequestFilter = Arc::new(protocol::is_request);
        Self {
            paths,
            script,
            handler: Arc::new(move |req| Box::pin(handler(req))),
            is_request,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
        }
    }

    /// Override the whole-server idle timeout (default one hour).
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Override the per-connection receive timeout (default one second;
    /// zero disables it).
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Replace the default request classifier.
    pub fn request_filter(mut self, filter: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        self.is_request = Arc::new(filter);
        self
    }

    pub fn paths(&self) -> &ServicePaths {
        &self.paths
    }

    /// Run the singleton election and, on winning, bind the endpoint.
    ///
    /// # Errors
    ///
    /// Only unrecoverable faults surface: a bind error other than
    /// address-in-use, or filesystem failures around the lock. Contention in
    /// all its forms resolves to either [`Listen::AlreadyRunning`] or a
    /// successful usurpation.
    pub async fn listen(self) -> Result<Listen> {
        std::fs::create_dir_all(self.paths.dir())?;
        let mut lock = StartingLock::new(&self.paths);

        if let Err(e) = lock.acquire() {
            match e {
                SockdError::LockContended(_) | SockdError::LockLost(_) => {
                    tracing::debug!("startup lock contended, probing for a live peer");
                    match self
                        .await_peer_or_usurp(&mut lock, LOCK_CONTENTION_BUDGET)
                        .await?
                    {
                        Election::Deferred => return Ok(Listen::AlreadyRunning),
                        Election::Usurped => {}
                    }
                }
                other => return Err(other),
            }
        }

        loop {
            match IpcListener::bind(&self.paths) {
                Ok(listener) => {
                    return Ok(Listen::Running(self.into_running(listener, lock)?));
                }
                Err(e) if matches!(e.kind(), ErrorKind::AddrInUse | ErrorKind::AlreadyExists) => {
                    tracing::debug!("endpoint occupied, probing for a live peer");
                    match self
                        .await_peer_or_usurp(&mut lock, BIND_CONTENTION_BUDGET)
                        .await?
                    {
                        Election::Deferred => return Ok(Listen::AlreadyRunning),
                        Election::Usurped => continue,
                    }
                }
                Err(e) => {
                    lock.release();
                    return Err(SockdError::Bind(e));
                }
            }
        }
    }

    /// Probe the presumed peer within `budget`; defer if it answers, replace
    /// it if it does not.
    async fn await_peer_or_usurp(
        &self,
        lock: &mut StartingLock,
        budget: Duration,
    ) -> Result<Election> {
        let mut budget = budget;
        loop {
            if self.await_peer(budget).await {
                ready::announce(ready::ALREADY_RUNNING)?;
                lock.release();
                return Ok(Election::Deferred);
            }

            match lock.acquire() {
                Ok(()) => {
                    if let Some(pid) = self.paths.read_pid() {
                        tracing::info!("usurping unresponsive daemon (pid {pid})");
                        spawn::send_term(pid);
                    }
                    let _ = std::fs::remove_file(self.paths.socket_path());
                    let _ = std::fs::remove_file(self.paths.pid_path());
                    return Ok(Election::Usurped);
                }
                Err(SockdError::LockContended(_)) | Err(SockdError::LockLost(_)) => {
                    // Another starter beat us to the lock; give them a full
                    // window to prove themselves.
                    budget = LOCK_CONTENTION_BUDGET;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// True if a live peer produced a matching pong within `budget`.
    ///
    /// Any decodable bytes that are not the expected pong condemn the peer
    /// immediately; connect failures, timeouts and hangups are retried until
    /// the budget runs out.
    async fn await_peer(&self, budget: Duration) -> bool {
        let deadline = Instant::now() + budget;
        let probe_id = format!(
            "{}-daemon-{}",
            self.paths.service_name(),
            std::process::id()
        );
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let attempt = remaining.max(MIN_PROBE_TIMEOUT);
            match timeout(attempt, self.probe(&probe_id)).await {
                Ok(Ok(Probe::Pong)) => return true,
                Ok(Ok(Probe::Garbage)) => return false,
                Ok(Err(_)) | Err(_) => {
                    if Instant::now() >= deadline {
                        return false;
                    }
                    sleep(PROBE_RETRY_PAUSE).await;
                }
            }
        }
    }

    async fn probe(&self, probe_id: &str) -> std::io::Result<Probe> {
        let mut stream = endpoint::connect(&self.paths).await?;
        let probe = ping::ping(probe_id);
        protocol::write_message(&mut stream, &probe).await?;
        match protocol::read_message(&mut stream).await {
            Ok(msg) if ping::pong_matches(&msg, &probe) => Ok(Probe::Pong),
            Ok(_) => Ok(Probe::Garbage),
            // A framed-but-unparseable reply is garbage too; only transport
            // failures count as "nobody answered".
            Err(e) if e.kind() == ErrorKind::InvalidData => Ok(Probe::Garbage),
            Err(e) => Err(e),
        }
    }

    fn into_running(self, listener: IpcListener, mut lock: StartingLock) -> Result<RunningDaemon> {
        if let Some(script) = &self.script {
            match paths::file_mtime_ms(script) {
                Some(ms) => {
                    if let Err(e) = std::fs::write(self.paths.mtime_path(), format!("{ms}\n")) {
                        tracing::warn!("could not record script mtime: {e}");
                    }
                }
                None => tracing::warn!("could not stat daemon script {}", script.display()),
            }
        }

        lock.commit()?;
        // The exit hook covers the socket too: a daemon that dies without
        // reaching close() must not leave the endpoint looking owned.
        lock::register_exit_unlink(&self.paths.socket_path());
        ready::announce(ready::READY)?;
        tracing::info!(
            "daemon for {} listening, pid {}",
            self.paths.service_name(),
            std::process::id()
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        // The startup window is deliberately short: a herd loser that nobody
        // connects to should get out of the way quickly.
        let initial_idle = STARTUP_IDLE_TIMEOUT.min(self.idle_timeout);
        let shared = Arc::new(ServerShared {
            paths: self.paths,
            handler: self.handler,
            is_request: self.is_request,
            idle_timeout: self.idle_timeout,
            connection_timeout: self.connection_timeout,
            idle_deadline: Mutex::new(Instant::now() + initial_idle),
            shutdown_tx,
        });
        Ok(RunningDaemon {
            shared,
            listener,
            shutdown_rx,
        })
    }
}

struct ServerShared {
    paths: ServicePaths,
    handler: BoxedHandler,
    is_request: RequestFilter,
    idle_timeout: Duration,
    connection_timeout: Duration,
    idle_deadline: Mutex<Instant>,
    shutdown_tx: watch::Sender<bool>,
}

impl ServerShared {
    /// Push the idle deadline out by `timeout`, defaulting to the configured
    /// idle timeout.
    fn idle_tick(&self, timeout: Option<Duration>) {
        let window = timeout.unwrap_or(self.idle_timeout);
        *self.idle_deadline.lock().unwrap() = Instant::now() + window;
    }

    fn idle_deadline(&self) -> Instant {
        *self.idle_deadline.lock().unwrap()
    }
}

/// Handle for asking a running daemon to shut down, e.g. from a signal task.
#[derive(Clone)]
pub struct ShutdownHandle {
    shared: Arc<ServerShared>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.shared.shutdown_tx.send(true);
    }
}

/// The elected daemon: bound, committed, and announced.
pub struct RunningDaemon {
    shared: Arc<ServerShared>,
    listener: IpcListener,
    shutdown_rx: watch::Receiver<bool>,
}

impl RunningDaemon {
    pub fn paths(&self) -> &ServicePaths {
        &self.shared.paths
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Push the idle deadline out, as if a request had just been served.
    pub fn idle_tick(&self, timeout: Option<Duration>) {
        self.shared.idle_tick(timeout);
    }

    /// Accept and serve connections until the idle timeout fires or a
    /// [`ShutdownHandle`] asks us to stop, then clean up the coordination
    /// files.
    pub async fn serve(mut self) -> Result<()> {
        loop {
            let deadline = self.shared.idle_deadline();
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    tracing::info!("shutdown requested");
                    break;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    if Instant::now() >= self.shared.idle_deadline() {
                        tracing::info!("idle timeout reached, shutting down");
                        break;
                    }
                    // The deadline moved while we slept; re-arm.
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => {
                        let shared = Arc::clone(&self.shared);
                        tokio::spawn(handle_connection(conn, shared));
                    }
                    Err(e) => tracing::error!("accept error: {e}"),
                }
            }
        }
        self.close();
        Ok(())
    }

    fn close(self) {
        let pid_path = self.shared.paths.pid_path();
        let _ = std::fs::remove_file(&pid_path);
        lock::unregister_exit_unlink(&pid_path);
        lock::unregister_exit_unlink(&self.shared.paths.socket_path());
        // Dropping the listener unlinks the socket.
    }
}

/// Serve one connection: pings are answered in place, recognised requests go
/// through the handler, everything else is ignored. Errors and receive
/// timeouts destroy the connection without ceremony.
async fn handle_connection(mut conn: IpcConnection, shared: Arc<ServerShared>) {
    loop {
        let msg = match read_with_receive_timeout(&mut conn, shared.connection_timeout).await {
            Some(msg) => msg,
            None => return,
        };

        if ping::is_ping(&msg) {
            // Keep-alives only; they do not count as work for the idle
            // clock. Header and body go out in one write.
            let reply = ping::pong(&msg, std::process::id());
            let Ok(frame) = protocol::encode_frame(&reply) else {
                return;
            };
            if conn.write_frame_bytes(&frame).await.is_err() {
                return;
            }
            continue;
        }

        if !(shared.is_request)(&msg) {
            continue;
        }

        shared.idle_tick(None);
        let request_id = msg.get("id").cloned();
        let mut reply = (shared.handler)(msg).await;
        match (&mut reply, request_id) {
            (Value::Object(fields), Some(id)) => {
                fields.insert("id".to_string(), id);
            }
            (_, Some(id)) => {
                reply = serde_json::json!({ "id": id, "result": reply });
            }
            _ => {}
        }
        if conn.write_message(&reply).await.is_err() {
            return;
        }
    }
}

async fn read_with_receive_timeout(
    conn: &mut IpcConnection,
    receive_timeout: Duration,
) -> Option<Value> {
    if receive_timeout.is_zero() {
        return conn.read_message().await.ok();
    }
    match timeout(receive_timeout, conn.read_message()).await {
        Ok(Ok(msg)) => Some(msg),
        _ => None,
    }
}
