//! Echo daemon - the smallest useful sockd daemon.
//!
//! Serves one service directory (name from the first argument, default
//! `echo`) and answers every request with the request itself, tagged with
//! `echoed: true` and this process's `pid`. A request carrying `sleep_ms`
//! naps that long first, which makes the binary handy for exercising
//! cancellation and mid-flight restarts.
//!
//! Typically spawned by a `DaemonClient`, which redirects stderr into the
//! service `log` file; logging goes to stderr for that reason, with
//! `RUST_LOG` selecting verbosity.
//!
//! ## Usage
//!
//! ```text
//! echod [service-name] [--idle-ms N]
//! ```

use std::time::Duration;

use serde_json::Value;
use tokio::time::sleep;

use sockd::{DaemonServer, Listen};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let (name, idle_ms) = parse_args();
    tracing::info!(
        "echod starting for service {name}, pid {}",
        std::process::id()
    );

    let mut server = DaemonServer::new(&name, handle)?;
    if let Some(ms) = idle_ms {
        server = server.idle_timeout(Duration::from_millis(ms));
    }

    match server.listen().await? {
        Listen::AlreadyRunning => {
            tracing::info!("a live daemon already serves {name}; deferring");
            Ok(())
        }
        Listen::Running(daemon) => {
            let shutdown = daemon.shutdown_handle();
            tokio::spawn(watch_signals(shutdown));
            daemon.serve().await?;
            tracing::info!("echod for {name} shut down");
            Ok(())
        }
    }
}

async fn handle(mut request: Value) -> Value {
    if let Some(ms) = request.get("sleep_ms").and_then(Value::as_u64) {
        sleep(Duration::from_millis(ms)).await;
    }
    if let Some(fields) = request.as_object_mut() {
        fields.insert("echoed".to_string(), Value::Bool(true));
        fields.insert("pid".to_string(), Value::from(std::process::id()));
    }
    request
}

#[cfg(unix)]
async fn watch_signals(shutdown: sockd::ShutdownHandle) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("could not install SIGHUP handler: {e}");
            return;
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("could not install SIGTERM handler: {e}");
            return;
        }
    };
    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("could not install SIGINT handler: {e}");
            return;
        }
    };

    tokio::select! {
        _ = hangup.recv() => tracing::info!("received SIGHUP, shutting down"),
        _ = terminate.recv() => tracing::info!("received SIGTERM, shutting down"),
        _ = interrupt.recv() => tracing::info!("received SIGINT, shutting down"),
    }
    shutdown.shutdown();
}

#[cfg(windows)]
async fn watch_signals(shutdown: sockd::ShutdownHandle) {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("received Ctrl+C, shutting down");
    }
    shutdown.shutdown();
}

fn parse_args() -> (String, Option<u64>) {
    let mut name = None;
    let mut idle_ms = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--idle-ms" {
            idle_ms = args.next().and_then(|v| v.parse().ok());
        } else if name.is_none() {
            name = Some(arg);
        }
    }
    (name.unwrap_or_else(|| "echo".to_string()), idle_ms)
}

fn init_logging() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(true)
        .init();
}
