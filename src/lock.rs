//! Startup lock serialising daemon election.
//!
//! `starting.lock` is an exclusive-create file guarding the critical section
//! between binding the endpoint and publishing leadership. A correctly
//! behaving process holds it for well under [`STALE_LOCK_AGE`]; anything
//! older is treated as abandoned by a crashed or wedged starter and forcibly
//! taken.
//!
//! Held locks are tracked in a process-global registry so an exit hook can
//! unlink them even when the owner never reaches `release()` or `commit()`.

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once, OnceLock};
use std::time::{Duration, SystemTime};

use crate::error::{Result, SockdError};
use crate::paths::ServicePaths;
use crate::spawn;

/// A `starting.lock` older than this is considered abandoned.
pub const STALE_LOCK_AGE: Duration = Duration::from_millis(2000);

fn exit_unlink_registry() -> &'static Mutex<BTreeSet<PathBuf>> {
    static REGISTRY: OnceLock<Mutex<BTreeSet<PathBuf>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(BTreeSet::new()))
}

/// Mark `path` for unlinking when the process exits.
pub(crate) fn register_exit_unlink(path: &Path) {
    install_exit_hook();
    if let Ok(mut held) = exit_unlink_registry().lock() {
        held.insert(path.to_path_buf());
    }
}

pub(crate) fn unregister_exit_unlink(path: &Path) {
    if let Ok(mut held) = exit_unlink_registry().lock() {
        held.remove(path);
    }
}

#[cfg(unix)]
fn install_exit_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| unsafe {
        libc::atexit(unlink_registered_paths);
    });
}

// Windows has no atexit-equivalent worth relying on here; Drop and the
// signal-driven close path cover normal shutdown.
#[cfg(not(unix))]
fn install_exit_hook() {}

#[cfg(unix)]
extern "C" fn unlink_registered_paths() {
    if let Ok(held) = exit_unlink_registry().lock() {
        for path in held.iter() {
            let _ = fs::remove_file(path);
        }
    }
}

/// Exclusive advisory lock on one service's daemon startup.
#[derive(Debug)]
pub struct StartingLock {
    path: PathBuf,
    pid_path: PathBuf,
    acquired: bool,
}

impl StartingLock {
    pub fn new(paths: &ServicePaths) -> Self {
        Self {
            path: paths.lock_path(),
            pid_path: paths.pid_path(),
            acquired: false,
        }
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the lock, evicting an abandoned holder if necessary.
    ///
    /// Idempotent on an instance that already holds the lock. After a
    /// successful return the lock file exists and contains this process's
    /// PID followed by a newline.
    ///
    /// # Errors
    ///
    /// [`SockdError::LockContended`] when a fresh lock belongs to someone
    /// else; [`SockdError::LockLost`] when the post-write verification shows
    /// a different PID won the race.
    pub fn acquire(&mut self) -> Result<()> {
        if self.acquired {
            return Ok(());
        }

        match self.create_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                self.evict_stale_holder()?;
                self.create_exclusive().map_err(|e| {
                    if e.kind() == io::ErrorKind::AlreadyExists {
                        SockdError::LockContended(format!(
                            "{} was re-taken during stale eviction",
                            self.path.display()
                        ))
                    } else {
                        e.into()
                    }
                })?;
            }
            Err(e) => return Err(e.into()),
        }

        // Exclusive create is not atomic with the write, so confirm nobody
        // replaced the file between the two.
        let own_pid = std::process::id().to_string();
        let contents = fs::read_to_string(&self.path)?;
        if contents.trim() != own_pid {
            return Err(SockdError::LockLost(format!(
                "{} contains {:?}, expected pid {}",
                self.path.display(),
                contents.trim(),
                own_pid
            )));
        }

        self.acquired = true;
        register_exit_unlink(&self.path);
        Ok(())
    }

    fn create_exclusive(&self) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(())
    }

    /// Handle an existing lock file: error if it is fresh, otherwise unlink
    /// it and best-effort terminate whoever wrote it.
    fn evict_stale_holder(&self) -> Result<()> {
        let meta = match fs::metadata(&self.path) {
            Ok(meta) => meta,
            // Vanished while we looked; the retried create decides.
            Err(_) => return Ok(()),
        };
        let age = meta
            .modified()
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok());
        match age {
            Some(age) if age >= STALE_LOCK_AGE => {
                if let Ok(contents) = fs::read_to_string(&self.path) {
                    if let Ok(pid) = contents.trim().parse::<u32>() {
                        spawn::send_term(pid);
                    }
                }
                let _ = fs::remove_file(&self.path);
                Ok(())
            }
            _ => Err(SockdError::LockContended(format!(
                "{} is held by an active starter",
                self.path.display()
            ))),
        }
    }

    /// Remove the lock file and forget it. Errors are absorbed; releasing a
    /// lock this instance never acquired is a no-op.
    pub fn release(&mut self) {
        if !self.acquired {
            return;
        }
        let _ = fs::remove_file(&self.path);
        unregister_exit_unlink(&self.path);
        self.acquired = false;
    }

    /// Publish leadership: atomically rename `starting.lock` to `pid`.
    ///
    /// The PID file it leaves behind stays registered for exit-time
    /// unlinking until the daemon's own close path removes it.
    pub fn commit(&mut self) -> Result<()> {
        fs::rename(&self.path, &self.pid_path)?;
        unregister_exit_unlink(&self.path);
        register_exit_unlink(&self.pid_path);
        self.acquired = false;
        Ok(())
    }
}

impl Drop for StartingLock {
    fn drop(&mut self) {
        if self.acquired {
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::FileTimes;
    use tempfile::TempDir;

    fn lock_in_temp() -> (TempDir, ServicePaths, StartingLock) {
        let tmp = TempDir::new().unwrap();
        let paths = ServicePaths::in_dir("locktest", tmp.path());
        fs::create_dir_all(paths.dir()).unwrap();
        let lock = StartingLock::new(&paths);
        (tmp, paths, lock)
    }

    fn backdate(path: &Path, by: Duration) {
        let file = OpenOptions::new().write(true).open(path).unwrap();
        let past = SystemTime::now() - by;
        file.set_times(FileTimes::new().set_modified(past)).unwrap();
    }

    #[test]
    fn test_acquire_writes_own_pid() {
        let (_tmp, paths, mut lock) = lock_in_temp();
        lock.acquire().unwrap();
        assert!(lock.is_acquired());

        let contents = fs::read_to_string(paths.lock_path()).unwrap();
        assert_eq!(contents, format!("{}\n", std::process::id()));
    }

    #[test]
    fn test_acquire_is_idempotent() {
        let (_tmp, _paths, mut lock) = lock_in_temp();
        lock.acquire().unwrap();
        lock.acquire().unwrap();
        assert!(lock.is_acquired());
    }

    #[test]
    fn test_fresh_lock_is_contended() {
        let (_tmp, paths, mut lock) = lock_in_temp();
        fs::write(paths.lock_path(), "99999\n").unwrap();

        let err = lock.acquire().unwrap_err();
        assert!(err.is_lock_contention(), "unexpected error: {err}");
        assert!(!lock.is_acquired());
        // The contending holder's file is untouched.
        assert_eq!(fs::read_to_string(paths.lock_path()).unwrap(), "99999\n");
    }

    #[test]
    fn test_stale_lock_is_taken_over() {
        let (_tmp, paths, mut lock) = lock_in_temp();
        // A lock left behind by a long-dead PID, dated well past staleness.
        fs::write(paths.lock_path(), "99999\n").unwrap();
        backdate(&paths.lock_path(), Duration::from_secs(3600));

        lock.acquire().unwrap();
        let contents = fs::read_to_string(paths.lock_path()).unwrap();
        assert_eq!(contents, format!("{}\n", std::process::id()));
    }

    #[test]
    fn test_commit_renames_lock_to_pid() {
        let (_tmp, paths, mut lock) = lock_in_temp();
        lock.acquire().unwrap();
        lock.commit().unwrap();

        assert!(!paths.lock_path().exists());
        assert_eq!(paths.read_pid(), Some(std::process::id()));
        assert!(!lock.is_acquired());
    }

    #[test]
    fn test_stale_takeover_then_commit() {
        let (_tmp, paths, mut lock) = lock_in_temp();
        fs::write(paths.lock_path(), "99999\n").unwrap();
        backdate(&paths.lock_path(), Duration::from_secs(86400 * 365));

        lock.acquire().unwrap();
        lock.commit().unwrap();
        assert_eq!(paths.read_pid(), Some(std::process::id()));
    }

    #[test]
    fn test_release_removes_file() {
        let (_tmp, paths, mut lock) = lock_in_temp();
        lock.acquire().unwrap();
        lock.release();

        assert!(!paths.lock_path().exists());
        assert!(!lock.is_acquired());
    }

    #[test]
    fn test_release_without_acquire_leaves_foreign_lock() {
        let (_tmp, paths, mut lock) = lock_in_temp();
        fs::write(paths.lock_path(), "12345\n").unwrap();
        lock.release();
        assert!(paths.lock_path().exists());
    }

    #[test]
    fn test_drop_releases_held_lock() {
        let (_tmp, paths, mut lock) = lock_in_temp();
        lock.acquire().unwrap();
        drop(lock);
        assert!(!paths.lock_path().exists());
    }

    #[test]
    fn test_reacquire_after_release() {
        let (_tmp, paths, mut lock) = lock_in_temp();
        lock.acquire().unwrap();
        lock.release();
        lock.acquire().unwrap();
        assert!(paths.lock_path().exists());
    }
}
