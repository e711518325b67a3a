//! Process control: detached daemon spawning and best-effort signalling.

use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::error::Result;
use crate::paths::ServicePaths;

/// Spawn the daemon program detached, then wait for its readiness signal.
///
/// Stdio is wired per the coordination contract: stdout is piped back so the
/// first byte (the `READY` / `ALREADY RUNNING` marker) tells us the child
/// has finished its election either way; stderr appends to the service `log`
/// file; stdin is closed. The child runs in its own process group (its own
/// detached console on Windows) with its working directory pinned to the
/// service base so it derives the same daemon directory we did.
pub(crate) async fn spawn_daemon(
    paths: &ServicePaths,
    program: &Path,
    exec_args: &[String],
    debug: bool,
) -> Result<()> {
    std::fs::create_dir_all(paths.dir())?;
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.log_path())?;

    let mut cmd = Command::new(program);
    cmd.args(exec_args)
        .current_dir(paths.base())
        .env(paths.script_env_var(), program)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::from(log));
    if debug {
        cmd.env("RUST_LOG", "debug");
    }

    // On Unix, detach into a new session so the daemon is not tied to the
    // client's terminal or lifetime.
    #[cfg(unix)]
    // SAFETY: setsid() is async-signal-safe and valid in pre_exec; it makes
    // the child a session and process-group leader.
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    #[cfg(windows)]
    {
        const DETACHED_PROCESS: u32 = 0x00000008;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(DETACHED_PROCESS | CREATE_NO_WINDOW);
    }

    let mut child = cmd.spawn()?;

    // One byte of stdout means the child is either serving or deferring;
    // either way the endpoint is worth another connection attempt. EOF
    // (child died before writing) unblocks us too and the retry loop deals
    // with the consequences.
    if let Some(mut stdout) = child.stdout.take() {
        let mut first = [0u8; 1];
        let _ = stdout.read(&mut first).await;
    }

    // The child outlives us; dropping the handle leaves it running.
    drop(child);
    Ok(())
}

/// Best-effort SIGTERM.
#[cfg(unix)]
pub(crate) fn send_term(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
}

/// Best-effort SIGHUP, the polite first nudge before SIGTERM.
#[cfg(unix)]
pub(crate) fn send_hangup(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGHUP);
}

#[cfg(windows)]
pub(crate) fn send_term(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .output();
}

#[cfg(windows)]
pub(crate) fn send_hangup(pid: u32) {
    send_term(pid);
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_send_term_to_dead_pid_is_absorbed() {
        // PID 0 would signal our own process group; use a PID that is
        // vanishingly unlikely to exist instead.
        send_term(u32::MAX / 2);
    }

    #[tokio::test]
    async fn test_spawn_creates_log_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let paths = ServicePaths::in_dir("spawntest", tmp.path());

        // `true` exits immediately without writing stdout; the first-byte
        // wait must unblock on EOF rather than hang.
        spawn_daemon(&paths, Path::new("/bin/true"), &[], false)
            .await
            .unwrap();

        assert!(paths.log_path().exists());
    }

    #[tokio::test]
    async fn test_spawn_missing_program_errors() {
        let tmp = tempfile::TempDir::new().unwrap();
        let paths = ServicePaths::in_dir("spawntest", tmp.path());

        let err = spawn_daemon(&paths, Path::new("/no/such/program"), &[], false)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::SockdError::Io(_)));
    }
}
