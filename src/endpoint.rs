//! IPC endpoint plumbing.
//!
//! Unix uses Unix domain sockets, Windows uses named pipes. Both sides
//! derive the endpoint from [`ServicePaths`], and both expose the same
//! surface: [`IpcListener::bind`] / [`IpcListener::accept`] for the daemon,
//! [`connect`] for clients.
//!
//! Binding never removes an existing endpoint: the singleton election
//! depends on `bind` failing with `AddrInUse` when another daemon (live or
//! dead) owns the path. Stale endpoints are cleared by usurpation, not here.

use std::io;

use serde_json::Value;

use crate::paths::ServicePaths;
use crate::protocol;

/// True when a connect failure means "no daemon owns the endpoint": the
/// socket file is missing, or it exists but nothing is listening behind it.
pub fn is_endpoint_missing(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
    )
}

// ============================================================================
// Unix Implementation
// ============================================================================

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use std::path::{Path, PathBuf};
    use tokio::net::{UnixListener, UnixStream};

    /// Stream type a client gets back from [`connect`].
    pub type ClientStream = UnixStream;

    /// Connect to the service's Unix socket.
    pub async fn connect(paths: &ServicePaths) -> io::Result<ClientStream> {
        UnixStream::connect(paths.socket_path()).await
    }

    /// Unix socket listener for one service's daemon endpoint.
    #[derive(Debug)]
    pub struct IpcListener {
        listener: UnixListener,
        socket_path: PathBuf,
    }

    impl IpcListener {
        /// Bind the service socket.
        ///
        /// Fails with `AddrInUse` if the socket path already exists; the
        /// caller's election decides whether the owner is alive. On success
        /// the socket is restricted to the owning user (mode 0600).
        pub fn bind(paths: &ServicePaths) -> io::Result<Self> {
            let socket_path = paths.socket_path();
            let listener = UnixListener::bind(&socket_path)?;

            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;
            }

            Ok(Self {
                listener,
                socket_path,
            })
        }

        /// Accept the next client connection.
        pub async fn accept(&mut self) -> io::Result<IpcConnection> {
            let (stream, _addr) = self.listener.accept().await?;
            Ok(IpcConnection { stream })
        }

        pub fn socket_path(&self) -> &Path {
            &self.socket_path
        }
    }

    impl Drop for IpcListener {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }

    /// One accepted client connection.
    pub struct IpcConnection {
        stream: UnixStream,
    }

    impl IpcConnection {
        pub async fn read_message(&mut self) -> io::Result<Value> {
            protocol::read_message(&mut self.stream).await
        }

        pub async fn write_message(&mut self, msg: &Value) -> io::Result<()> {
            protocol::write_message(&mut self.stream, msg).await
        }

        /// Write a pre-encoded frame as one contiguous write.
        pub async fn write_frame_bytes(&mut self, frame: &[u8]) -> io::Result<()> {
            use tokio::io::AsyncWriteExt;
            self.stream.write_all(frame).await?;
            self.stream.flush().await
        }
    }
}

#[cfg(unix)]
pub use unix_impl::*;

// ============================================================================
// Windows Implementation
// ============================================================================

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use std::time::Duration;
    use tokio::net::windows::named_pipe::{
        ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions,
    };
    use windows_sys::Win32::Foundation::ERROR_PIPE_BUSY;

    /// Stream type a client gets back from [`connect`].
    pub type ClientStream = NamedPipeClient;

    /// Connect to the service's named pipe, retrying while all pipe
    /// instances are momentarily busy.
    pub async fn connect(paths: &ServicePaths) -> io::Result<ClientStream> {
        let pipe_name = paths.pipe_name();
        loop {
            match ClientOptions::new().open(&pipe_name) {
                Ok(pipe) => return Ok(pipe),
                Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY as i32) => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Named pipe listener for one service's daemon endpoint.
    #[derive(Debug)]
    pub struct IpcListener {
        pipe_name: String,
        /// The pipe instance currently waiting for a connection.
        server: NamedPipeServer,
    }

    impl IpcListener {
        /// Create the first pipe instance.
        ///
        /// Fails with `AddrInUse` if another process already owns the pipe,
        /// mirroring the Unix socket-file collision.
        pub fn bind(paths: &ServicePaths) -> io::Result<Self> {
            let pipe_name = paths.pipe_name();
            let server = ServerOptions::new()
                .first_pipe_instance(true)
                .create(&pipe_name)
                .map_err(|e| io::Error::new(io::ErrorKind::AddrInUse, e))?;

            Ok(Self { pipe_name, server })
        }

        /// Accept the next client connection, standing up a fresh pipe
        /// instance for the one after it.
        pub async fn accept(&mut self) -> io::Result<IpcConnection> {
            self.server.connect().await?;

            let connected = std::mem::replace(
                &mut self.server,
                ServerOptions::new()
                    .create(&self.pipe_name)
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?,
            );

            Ok(IpcConnection { pipe: connected })
        }

        pub fn pipe_name(&self) -> &str {
            &self.pipe_name
        }
    }

    /// One accepted client connection.
    pub struct IpcConnection {
        pipe: NamedPipeServer,
    }

    impl IpcConnection {
        pub async fn read_message(&mut self) -> io::Result<Value> {
            protocol::read_message(&mut self.pipe).await
        }

        pub async fn write_message(&mut self, msg: &Value) -> io::Result<()> {
            protocol::write_message(&mut self.pipe, msg).await
        }

        /// Write a pre-encoded frame as one contiguous write.
        pub async fn write_frame_bytes(&mut self, frame: &[u8]) -> io::Result<()> {
            use tokio::io::AsyncWriteExt;
            self.pipe.write_all(frame).await?;
            self.pipe.flush().await
        }
    }
}

#[cfg(windows)]
pub use windows_impl::*;
