//! Path derivation for a service's daemon directory.
//!
//! Every coordination artifact for a service lives under
//! `.{service}/daemon/` relative to the launching working directory, so
//! clients and daemons that share a directory share a daemon:
//!
//! - `socket` - the IPC endpoint (Unix domain socket; named pipe on Windows)
//! - `pid` - decimal PID of the live daemon
//! - `mtime` - decimal script mtime (ms) observed by the live daemon
//! - `starting.lock` - exclusive-create startup lock
//! - `log` - appended stderr of spawned daemons

use std::path::{Path, PathBuf};

use crate::error::Result;

/// Resolved locations of one service's coordination files.
#[derive(Debug, Clone)]
pub struct ServicePaths {
    name: String,
    base: PathBuf,
    dir: PathBuf,
}

impl ServicePaths {
    /// Derive paths for `name` relative to the current working directory.
    pub fn new(name: &str) -> Result<Self> {
        Ok(Self::in_dir(name, std::env::current_dir()?))
    }

    /// Derive paths for `name` relative to an explicit base directory.
    ///
    /// A client and the daemon it spawns must use the same base for the
    /// election to converge; the spawner pins the child's working directory
    /// to this base for that reason.
    pub fn in_dir(name: &str, base: impl AsRef<Path>) -> Self {
        let base = base.as_ref().to_path_buf();
        let dir = base.join(format!(".{name}")).join("daemon");
        Self {
            name: name.to_string(),
            base,
            dir,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// The daemon directory itself: `<base>/.{service}/daemon`.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn socket_path(&self) -> PathBuf {
        self.dir.join("socket")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.dir.join("pid")
    }

    pub fn mtime_path(&self) -> PathBuf {
        self.dir.join("mtime")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.join("starting.lock")
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join("log")
    }

    /// Named-pipe identifier derived from the socket path.
    ///
    /// Both sides derive this from the same absolute path, so a client and a
    /// daemon launched from the same directory meet on the same pipe.
    #[cfg(windows)]
    pub fn pipe_name(&self) -> String {
        let socket = self.socket_path();
        let abs = if socket.is_absolute() {
            socket
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&socket))
                .unwrap_or(socket)
        };
        format!(r"\\?\pipe\{}", abs.display())
    }

    /// Name of the environment variable carrying the daemon program path.
    ///
    /// The spawning client sets it; a daemon that finds it set records the
    /// program's mtime at startup so clients can detect rebuilds.
    pub fn script_env_var(&self) -> String {
        format!("SOCK_DAEMON_SCRIPT_{}", self.name)
    }

    /// Read the published daemon PID, if any.
    pub fn read_pid(&self) -> Option<u32> {
        let raw = std::fs::read_to_string(self.pid_path()).ok()?;
        raw.trim().parse().ok()
    }

    /// Read the recorded script mtime in milliseconds, if any.
    pub fn read_mtime(&self) -> Option<u64> {
        let raw = std::fs::read_to_string(self.mtime_path()).ok()?;
        raw.trim().parse().ok()
    }
}

/// Modification time of a file in milliseconds since the Unix epoch, or
/// `None` when the file cannot be stat'ed.
pub(crate) fn file_mtime_ms(path: &Path) -> Option<u64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let since_epoch = modified.duration_since(std::time::UNIX_EPOCH).ok()?;
    Some(since_epoch.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_derive_from_base() {
        let paths = ServicePaths::in_dir("widget", "/work/project");
        assert_eq!(paths.dir(), Path::new("/work/project/.widget/daemon"));
        assert_eq!(
            paths.socket_path(),
            Path::new("/work/project/.widget/daemon/socket")
        );
        assert_eq!(
            paths.pid_path(),
            Path::new("/work/project/.widget/daemon/pid")
        );
        assert_eq!(
            paths.mtime_path(),
            Path::new("/work/project/.widget/daemon/mtime")
        );
        assert_eq!(
            paths.lock_path(),
            Path::new("/work/project/.widget/daemon/starting.lock")
        );
        assert_eq!(
            paths.log_path(),
            Path::new("/work/project/.widget/daemon/log")
        );
    }

    #[test]
    fn test_new_uses_current_dir() {
        let paths = ServicePaths::new("widget").unwrap();
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(paths.base(), cwd);
        assert!(paths.dir().starts_with(cwd));
    }

    #[test]
    fn test_script_env_var() {
        let paths = ServicePaths::in_dir("widget", "/tmp");
        assert_eq!(paths.script_env_var(), "SOCK_DAEMON_SCRIPT_widget");
    }

    #[test]
    fn test_read_pid_missing_and_present() {
        let tmp = tempfile::TempDir::new().unwrap();
        let paths = ServicePaths::in_dir("widget", tmp.path());
        assert_eq!(paths.read_pid(), None);

        std::fs::create_dir_all(paths.dir()).unwrap();
        std::fs::write(paths.pid_path(), "1234\n").unwrap();
        assert_eq!(paths.read_pid(), Some(1234));

        std::fs::write(paths.pid_path(), "not a pid\n").unwrap();
        assert_eq!(paths.read_pid(), None);
    }

    #[test]
    fn test_read_mtime_trailing_newline_optional() {
        let tmp = tempfile::TempDir::new().unwrap();
        let paths = ServicePaths::in_dir("widget", tmp.path());

        std::fs::create_dir_all(paths.dir()).unwrap();
        std::fs::write(paths.mtime_path(), "1700000000000").unwrap();
        assert_eq!(paths.read_mtime(), Some(1_700_000_000_000));

        std::fs::write(paths.mtime_path(), "1700000000001\n").unwrap();
        assert_eq!(paths.read_mtime(), Some(1_700_000_000_001));
    }

    #[cfg(windows)]
    #[test]
    fn test_pipe_name_prefix() {
        let paths = ServicePaths::in_dir("widget", r"C:\work\project");
        let name = paths.pipe_name();
        assert!(name.starts_with(r"\\?\pipe\"));
        assert!(name.ends_with("socket"));
    }
}
