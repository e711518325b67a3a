//! Daemon client: locate, connect, spawn, replay.
//!
//! A client never assumes the daemon exists. Every request lands in an
//! outstanding map first; if no connection is up, one is started, and if the
//! endpoint turns out to be missing (or its owner fails the handshake ping)
//! the daemon program is spawned and the connection retried. On every fresh
//! connection the entire outstanding map is replayed, so a request survives
//! daemon restarts; responses are correlated by unique `id` and duplicates
//! for an already-resolved `id` are dropped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;

use crate::cancel::CancelToken;
use crate::endpoint::{self, ClientStream};
use crate::error::{Result, SockdError};
use crate::paths::{self, ServicePaths};
use crate::ping;
use crate::protocol;
use crate::spawn;

/// How long a fresh connection gets to produce the handshake pong before
/// the peer is written off as wedged.
const HANDSHAKE_PING_TIMEOUT: Duration = Duration::from_millis(100);

/// Pause between the polite hangup and the terminate signal in [`DaemonClient::kill`].
const KILL_SIGNAL_PAUSE: Duration = Duration::from_millis(50);

/// Distinguishes client instances within one process for request ids.
static CLIENT_COUNTER: AtomicU64 = AtomicU64::new(0);

type ResponseFilter = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

struct Pending {
    /// Encoded frame, kept for replay on reconnect.
    frame: Vec<u8>,
    tx: oneshot::Sender<Result<Value>>,
}

/// Connection state and the outstanding map, guarded together so request
/// submission, replay and resolution see one consistent world.
struct LinkState {
    connected: bool,
    /// A connect lifecycle task exists (connecting, connected, or retrying).
    connecting: bool,
    /// Handshake completed at least once this client lifetime.
    pinged: bool,
    /// Identity of the current connection; stale handlers compare before
    /// touching shared state.
    generation: u64,
    writer: Option<mpsc::UnboundedSender<Vec<u8>>>,
    closer: Option<Arc<Notify>>,
    outstanding: HashMap<String, Pending>,
}

struct ClientInner {
    paths: ServicePaths,
    program: PathBuf,
    exec_args: Vec<String>,
    debug: bool,
    is_response: ResponseFilter,
    client_id: String,
    request_counter: AtomicU64,
    handshake_counter: AtomicU64,
    state: Mutex<LinkState>,
    /// Serialises the rebuilt-daemon check so only one is in flight.
    mtime_gate: tokio::sync::Mutex<()>,
}

/// Configures a [`DaemonClient`] before first use.
pub struct DaemonClientBuilder {
    paths: ServicePaths,
    program: PathBuf,
    exec_args: Vec<String>,
    debug: bool,
    is_response: ResponseFilter,
}

impl DaemonClientBuilder {
    /// Extra arguments passed to the daemon program when spawning it.
    pub fn exec_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exec_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Spawn the daemon with verbose logging selected (`RUST_LOG=debug`).
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Replace the default response classifier.
    pub fn response_filter(
        mut self,
        filter: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.is_response = Arc::new(filter);
        self
    }

    pub fn build(self) -> DaemonClient {
        let program = std::path::absolute(&self.program).unwrap_or(self.program);
        DaemonClient {
            inner: Arc::new(ClientInner {
                paths: self.paths,
                program,
                exec_args: self.exec_args,
                debug: self.debug,
                is_response: self.is_response,
                client_id: format!(
                    "{}-{}",
                    std::process::id(),
                    CLIENT_COUNTER.fetch_add(1, Ordering::SeqCst)
                ),
                request_counter: AtomicU64::new(0),
                handshake_counter: AtomicU64::new(0),
                state: Mutex::new(LinkState {
                    connected: false,
                    connecting: false,
                    pinged: false,
                    generation: 0,
                    writer: None,
                    closer: None,
                    outstanding: HashMap::new(),
                }),
                mtime_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }
}

/// Client for one service's daemon, spawning it on demand.
///
/// Cloning is cheap and clones share the connection, the outstanding map
/// and the request-id space.
#[derive(Clone)]
pub struct DaemonClient {
    inner: Arc<ClientInner>,
}

impl DaemonClient {
    /// Client for `name` rooted at the current working directory.
    /// `program` is the daemon executable to spawn when none is running.
    pub fn new(name: &str, program: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self::builder(name, program)?.build())
    }

    pub fn builder(name: &str, program: impl Into<PathBuf>) -> Result<DaemonClientBuilder> {
        Ok(Self::builder_in_dir_paths(ServicePaths::new(name)?, program))
    }

    /// Builder rooted at an explicit base directory.
    pub fn builder_in_dir(
        name: &str,
        base: impl AsRef<Path>,
        program: impl Into<PathBuf>,
    ) -> DaemonClientBuilder {
        Self::builder_in_dir_paths(ServicePaths::in_dir(name, base), program)
    }

    fn builder_in_dir_paths(paths: ServicePaths, program: impl Into<PathBuf>) -> DaemonClientBuilder {
        let is_response: ResponseFilter = Arc::new(protocol::is_response);
        DaemonClientBuilder {
            paths,
            program: program.into(),
            exec_args: Vec::new(),
            debug: false,
            is_response,
        }
    }

    pub fn paths(&self) -> &ServicePaths {
        &self.inner.paths
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().unwrap().connected
    }

    /// Send `payload` (a JSON object) and wait for the response with the
    /// matching generated `id`.
    ///
    /// There is no client-side deadline: a request outlives disconnects,
    /// daemon restarts and respawns until its response arrives or it is
    /// cancelled via [`DaemonClient::clear`].
    pub async fn request(&self, payload: Value) -> Result<Value> {
        let (_id, rx) = self.submit(payload, None).await?;
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(SockdError::Cancelled("request dropped".to_string())),
        }
    }

    /// Like [`DaemonClient::request`], but the wait aborts when `cancel`
    /// fires. Cancellation abandons the wait, not the work: the daemon may
    /// still process the request, and its late response is dropped.
    pub async fn request_with_cancel(
        &self,
        payload: Value,
        cancel: &CancelToken,
    ) -> Result<Value> {
        let (id, rx) = self.submit(payload, Some(cancel)).await?;
        tokio::select! {
            outcome = rx => match outcome {
                Ok(outcome) => outcome,
                Err(_) => Err(SockdError::Cancelled("request dropped".to_string())),
            },
            reason = cancel.cancelled() => {
                self.remove_pending(&id);
                Err(SockdError::Cancelled(reason))
            }
        }
    }

    /// Health-check the daemon, spawning it if needed. Resolves to the pong
    /// with the measured round-trip time attached as `duration`.
    pub async fn ping(&self) -> Result<Value> {
        self.request(json!({ "PING": "PING", "sent": ping::now_ms() }))
            .await
    }

    /// Register the request, run the rebuilt-daemon check, then transmit or
    /// kick off a connection.
    async fn submit(
        &self,
        payload: Value,
        cancel: Option<&CancelToken>,
    ) -> Result<(String, oneshot::Receiver<Result<Value>>)> {
        let Value::Object(mut fields) = payload else {
            return Err(SockdError::Protocol(
                "request payload must be a JSON object".to_string(),
            ));
        };
        let id = format!(
            "{}-{}",
            self.inner.client_id,
            self.inner.request_counter.fetch_add(1, Ordering::SeqCst)
        );
        fields.insert("id".to_string(), Value::from(id.clone()));
        let msg = Value::Object(fields);
        let frame = protocol::encode_frame(&msg)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock().unwrap();
            state.outstanding.insert(
                id.clone(),
                Pending {
                    frame: frame.clone(),
                    tx,
                },
            );
        }

        self.check_script_mtime().await;

        if let Some(token) = cancel {
            if let Some(reason) = token.reason() {
                self.remove_pending(&id);
                return Err(SockdError::Cancelled(reason));
            }
        }

        self.flush_or_connect(frame);
        Ok((id, rx))
    }

    /// Write on the live connection, or make sure a connect lifecycle is
    /// under way; a not-yet-connected request rides the replay.
    fn flush_or_connect(&self, frame: Vec<u8>) {
        let mut state = self.inner.state.lock().unwrap();
        if state.connected {
            if let Some(writer) = &state.writer {
                if writer.send(frame).is_ok() {
                    return;
                }
            }
            state.connected = false;
            state.writer = None;
        }
        if !state.connecting {
            state.connecting = true;
            let inner = Arc::clone(&self.inner);
            tokio::spawn(connect_loop(inner));
        }
    }

    fn remove_pending(&self, id: &str) {
        self.inner.state.lock().unwrap().outstanding.remove(id);
    }

    /// Detect a rebuilt daemon program: when the recorded mtime and the
    /// on-disk mtime disagree, the record is removed and the running daemon
    /// killed so the next connect spawns a fresh one. Returns whether a
    /// restart was triggered.
    pub async fn check_script_mtime(&self) -> bool {
        let _flight = self.inner.mtime_gate.lock().await;
        let Some(recorded) = self.inner.paths.read_mtime() else {
            return false;
        };
        let Some(current) = paths::file_mtime_ms(&self.inner.program) else {
            return false;
        };
        if current == recorded {
            return false;
        }
        tracing::info!(
            "daemon program {} changed on disk; restarting the daemon",
            self.inner.program.display()
        );
        let _ = std::fs::remove_file(self.inner.paths.mtime_path());
        self.kill().await;
        true
    }

    /// Kill the recorded daemon: hangup first, then terminate. No recorded
    /// PID means nothing to do.
    pub async fn kill(&self) {
        let Some(pid) = self.inner.paths.read_pid() else {
            return;
        };
        self.disconnect();
        #[cfg(unix)]
        {
            spawn::send_hangup(pid);
            tokio::time::sleep(KILL_SIGNAL_PAUSE).await;
            spawn::send_term(pid);
        }
        #[cfg(windows)]
        spawn::send_term(pid);
    }

    /// Drop the current connection. Outstanding requests stay queued and
    /// ride the next connection's replay.
    pub fn disconnect(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.connected = false;
        state.writer = None;
        if let Some(closer) = state.closer.take() {
            closer.notify_waiters();
        }
    }

    /// Reject every outstanding request with a cancellation error.
    pub fn clear(&self) {
        let pending: Vec<Pending> = {
            let mut state = self.inner.state.lock().unwrap();
            state.outstanding.drain().map(|(_, p)| p).collect()
        };
        for entry in pending {
            let _ = entry
                .tx
                .send(Err(SockdError::Cancelled(
                    "outstanding requests cleared".to_string(),
                )));
        }
    }
}

enum ConnExit {
    /// Connection ended with requests still outstanding; try again.
    Reconnect,
    /// The peer is not a daemon (or nothing answered the handshake); spawn
    /// one, then try again.
    SpawnPeer,
    /// Connection ended and nothing is waiting; go quiet.
    Idle,
}

/// One connect lifecycle: connect, run, and respawn/retry until either the
/// outstanding map drains or the daemon is unreachable for a hard reason.
async fn connect_loop(inner: Arc<ClientInner>) {
    loop {
        if let Err(e) = std::fs::create_dir_all(inner.paths.dir()) {
            tracing::warn!("could not create daemon directory: {e}");
            finish_connecting(&inner);
            return;
        }
        match endpoint::connect(&inner.paths).await {
            Ok(stream) => match run_connection(&inner, stream).await {
                ConnExit::Reconnect => continue,
                ConnExit::SpawnPeer => {
                    if respawn(&inner).await {
                        continue;
                    }
                    return;
                }
                ConnExit::Idle => return,
            },
            Err(e) if endpoint::is_endpoint_missing(&e) => {
                tracing::debug!(
                    "daemon endpoint missing, spawning {}",
                    inner.program.display()
                );
                if respawn(&inner).await {
                    continue;
                }
                return;
            }
            Err(e) => {
                tracing::debug!("daemon connect failed: {e}");
                finish_connecting(&inner);
                return;
            }
        }
    }
}

/// Spawn the daemon program and wait for its readiness byte. Returns whether
/// the connect loop should try again.
async fn respawn(inner: &Arc<ClientInner>) -> bool {
    match spawn::spawn_daemon(&inner.paths, &inner.program, &inner.exec_args, inner.debug).await {
        Ok(()) => true,
        Err(e) => {
            // Nothing will ever be listening; stranding the callers forever
            // helps nobody.
            tracing::warn!("failed to spawn daemon {}: {e}", inner.program.display());
            let message = format!("failed to spawn daemon: {e}");
            fail_outstanding(inner, &message);
            finish_connecting(inner);
            false
        }
    }
}

fn finish_connecting(inner: &ClientInner) {
    inner.state.lock().unwrap().connecting = false;
}

fn fail_outstanding(inner: &ClientInner, message: &str) {
    let pending: Vec<Pending> = {
        let mut state = inner.state.lock().unwrap();
        state.outstanding.drain().map(|(_, p)| p).collect()
    };
    for entry in pending {
        let _ = entry
            .tx
            .send(Err(SockdError::Connection(message.to_string())));
    }
}

enum ReadOutcome {
    Message(Value),
    HandshakeTimeout,
    Disconnected,
    Closed,
}

/// Drive one established connection: handshake ping, full replay, then
/// resolve incoming responses until the connection dies.
async fn run_connection(inner: &Arc<ClientInner>, stream: ClientStream) -> ConnExit {
    let (mut read_half, write_half) = tokio::io::split(stream);
    let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    tokio::spawn(write_loop(write_half, frame_rx));
    let closer = Arc::new(Notify::new());

    // Install as the current connection, queue the handshake ping and then
    // the full replay, atomically with respect to concurrent submissions.
    let (generation, mut handshake) = {
        let mut state = inner.state.lock().unwrap();
        state.generation += 1;
        state.connected = true;
        state.writer = Some(frame_tx.clone());
        state.closer = Some(Arc::clone(&closer));
        let handshake = if state.pinged {
            None
        } else {
            let handshake_id = format!(
                "{}-{}",
                inner.client_id,
                inner.handshake_counter.fetch_add(1, Ordering::SeqCst)
            );
            let probe = ping::ping(&handshake_id);
            if let Ok(frame) = protocol::encode_frame(&probe) {
                let _ = frame_tx.send(frame);
            }
            Some(probe)
        };
        for pending in state.outstanding.values() {
            let _ = frame_tx.send(pending.frame.clone());
        }
        (state.generation, handshake)
    };

    let mut handshake_deadline =
        handshake.as_ref().map(|_| Instant::now() + HANDSHAKE_PING_TIMEOUT);

    loop {
        let outcome = match handshake_deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = closer.notified() => ReadOutcome::Closed,
                    read = tokio::time::timeout_at(deadline, protocol::read_message(&mut read_half)) => {
                        match read {
                            Ok(Ok(msg)) => ReadOutcome::Message(msg),
                            Ok(Err(_)) => ReadOutcome::Disconnected,
                            Err(_) => ReadOutcome::HandshakeTimeout,
                        }
                    }
                }
            }
            None => {
                tokio::select! {
                    _ = closer.notified() => ReadOutcome::Closed,
                    read = protocol::read_message(&mut read_half) => {
                        match read {
                            Ok(msg) => ReadOutcome::Message(msg),
                            Err(_) => ReadOutcome::Disconnected,
                        }
                    }
                }
            }
        };

        match outcome {
            ReadOutcome::Message(msg) => {
                if let Some(probe) = &handshake {
                    if ping::pong_matches(&msg, probe) {
                        inner.state.lock().unwrap().pinged = true;
                        handshake = None;
                        handshake_deadline = None;
                        continue;
                    }
                }
                if ping::is_pong(&msg) || (inner.is_response)(&msg) {
                    resolve_message(inner, msg);
                }
                // Anything else is noise; ignore it.
            }
            ReadOutcome::HandshakeTimeout => {
                // Whatever owns the endpoint is not a daemon. Same recovery
                // as a missing endpoint: replace it.
                tracing::debug!("handshake ping unanswered; replacing the peer");
                disconnect_generation(inner, generation);
                return ConnExit::SpawnPeer;
            }
            ReadOutcome::Disconnected | ReadOutcome::Closed => {
                disconnect_generation(inner, generation);
                let mut state = inner.state.lock().unwrap();
                if state.outstanding.is_empty() {
                    state.connecting = false;
                    return ConnExit::Idle;
                }
                return ConnExit::Reconnect;
            }
        }
    }
}

async fn write_loop(
    mut write_half: tokio::io::WriteHalf<ClientStream>,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(frame) = frames.recv().await {
        if write_half.write_all(&frame).await.is_err() {
            return;
        }
        if write_half.flush().await.is_err() {
            return;
        }
    }
}

/// Resolve the outstanding request matching this message's `id`, if any.
/// Pongs get the round-trip time attached. Duplicates and responses for
/// cancelled requests find no entry and are dropped.
fn resolve_message(inner: &ClientInner, mut msg: Value) {
    let Some(id) = protocol::message_id(&msg).map(str::to_string) else {
        return;
    };
    let pending = {
        let mut state = inner.state.lock().unwrap();
        state.outstanding.remove(&id)
    };
    let Some(pending) = pending else {
        return;
    };
    if ping::is_pong(&msg) {
        ping::attach_duration(&mut msg);
    }
    let _ = pending.tx.send(Ok(msg));
}

/// Tear down connection state, but only if it still belongs to this
/// connection; a retry may already have installed a newer one.
fn disconnect_generation(inner: &ClientInner, generation: u64) {
    let mut state = inner.state.lock().unwrap();
    if state.generation == generation {
        state.connected = false;
        state.writer = None;
        state.closer = None;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::server::{DaemonServer, Listen};
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::time::{sleep, timeout};

    /// In-process echo daemon; the handler naps when asked to.
    async fn start_server(base: &Path) -> crate::server::ShutdownHandle {
        let server = DaemonServer::in_dir("clienttest", base, |mut req: Value| async move {
            if let Some(ms) = req.get("sleep_ms").and_then(Value::as_u64) {
                sleep(Duration::from_millis(ms)).await;
            }
            if let Some(fields) = req.as_object_mut() {
                fields.insert("echoed".to_string(), Value::Bool(true));
            }
            req
        })
        .connection_timeout(Duration::from_secs(10));
        let Listen::Running(daemon) = server.listen().await.unwrap() else {
            panic!("expected to win the election");
        };
        let handle = daemon.shutdown_handle();
        tokio::spawn(daemon.serve());
        handle
    }

    fn client(base: &Path) -> DaemonClient {
        // The daemon is already running in-process; the program path is
        // never spawned in these tests.
        DaemonClient::builder_in_dir("clienttest", base, "/bin/false").build()
    }

    #[tokio::test]
    async fn test_request_roundtrip_and_id_match() {
        let tmp = TempDir::new().unwrap();
        let _server = start_server(tmp.path()).await;
        let client = client(tmp.path());

        let reply = timeout(
            Duration::from_secs(2),
            client.request(json!({ "op": "build" })),
        )
        .await
        .unwrap()
        .unwrap();

        let id = reply["id"].as_str().unwrap();
        assert!(id.starts_with(&format!("{}-", std::process::id())));
        assert_eq!(reply["echoed"], true);

        // The connection survives for the next request.
        let again = client.request(json!({ "op": "again" })).await.unwrap();
        assert_ne!(again["id"], reply["id"]);
    }

    #[tokio::test]
    async fn test_concurrent_requests_resolve_independently() {
        let tmp = TempDir::new().unwrap();
        let _server = start_server(tmp.path()).await;
        let client = client(tmp.path());

        // One connection, interleaved submissions: every response must land
        // on its own caller.
        let (slow, fast_a, fast_b) = tokio::join!(
            client.request(json!({ "op": "slow", "sleep_ms": 300 })),
            client.request(json!({ "op": "a" })),
            client.request(json!({ "op": "b" })),
        );
        assert_eq!(slow.unwrap()["op"], "slow");
        assert_eq!(fast_a.unwrap()["op"], "a");
        assert_eq!(fast_b.unwrap()["op"], "b");
    }

    #[tokio::test]
    async fn test_ping_measures_rtt() {
        let tmp = TempDir::new().unwrap();
        let _server = start_server(tmp.path()).await;
        let client = client(tmp.path());

        let pong = timeout(Duration::from_secs(2), client.ping())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pong["PING"], "PONG");
        assert_eq!(pong["pid"], std::process::id());
        assert!(pong["duration"].as_u64().is_some());
    }

    #[tokio::test]
    async fn test_cancel_rejects_with_reason() {
        let tmp = TempDir::new().unwrap();
        let _server = start_server(tmp.path()).await;
        let client = client(tmp.path());

        let token = CancelToken::new();
        let firing = token.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            firing.cancel("took too long");
        });

        let err = client
            .request_with_cancel(json!({ "op": "slow", "sleep_ms": 800 }), &token)
            .await
            .unwrap_err();
        match err {
            SockdError::Cancelled(reason) => assert_eq!(reason, "took too long"),
            other => panic!("expected cancellation, got {other}"),
        }

        // The connection was not torn down; the client still works.
        let reply = client.request(json!({ "op": "after" })).await.unwrap();
        assert_eq!(reply["op"], "after");
    }

    #[tokio::test]
    async fn test_cancel_before_send_never_transmits() {
        let tmp = TempDir::new().unwrap();
        let _server = start_server(tmp.path()).await;
        let client = client(tmp.path());

        let token = CancelToken::new();
        token.cancel("changed my mind");
        let err = client
            .request_with_cancel(json!({ "op": "never" }), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, SockdError::Cancelled(_)));
        assert!(client.inner.state.lock().unwrap().outstanding.is_empty());
    }

    #[tokio::test]
    async fn test_clear_rejects_everything_outstanding() {
        let tmp = TempDir::new().unwrap();
        let _server = start_server(tmp.path()).await;
        let client = client(tmp.path());

        let worker = client.clone();
        let pending = tokio::spawn(async move {
            worker
                .request(json!({ "op": "slow", "sleep_ms": 5000 }))
                .await
        });

        // Let the request register and hit the wire first.
        sleep(Duration::from_millis(200)).await;
        client.clear();

        let err = timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, SockdError::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_late_response_for_cancelled_request_is_dropped() {
        let tmp = TempDir::new().unwrap();
        let _server = start_server(tmp.path()).await;
        let client = client(tmp.path());

        let token = CancelToken::new();
        token.cancel("early");
        let _ = client
            .request_with_cancel(json!({ "op": "slow", "sleep_ms": 100 }), &token)
            .await;

        // Give the daemon time to answer the abandoned request, then prove
        // the client is still coherent.
        sleep(Duration::from_millis(300)).await;
        let reply = client.request(json!({ "op": "still-fine" })).await.unwrap();
        assert_eq!(reply["op"], "still-fine");
    }

    #[tokio::test]
    async fn test_request_payload_must_be_object() {
        let tmp = TempDir::new().unwrap();
        let client = client(tmp.path());
        let err = client.request(json!("just a string")).await.unwrap_err();
        assert!(matches!(err, SockdError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_request_ids_are_unique_and_structured() {
        let tmp = TempDir::new().unwrap();
        let _server = start_server(tmp.path()).await;
        let a = client(tmp.path());
        let b = client(tmp.path());

        let ra = a.request(json!({ "op": "x" })).await.unwrap();
        let rb = b.request(json!({ "op": "x" })).await.unwrap();
        let ida = ra["id"].as_str().unwrap();
        let idb = rb["id"].as_str().unwrap();
        assert_ne!(ida, idb);
        // pid-clientCounter-requestCounter
        assert_eq!(ida.split('-').count(), 3);
        assert_eq!(
            ida.split('-').next().unwrap(),
            std::process::id().to_string()
        );
    }
}
