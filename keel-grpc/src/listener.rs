use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use keel_core::config::{ConfigError, ConfigProperties, KeelConfig};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;

/// File name of the Unix socket created next to the executable when no
/// explicit path is configured.
pub const DEFAULT_SOCKET_NAME: &str = "app.sock";

/// An already-bound, already-listening acceptor.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    /// The socket file is removed when the listener is dropped.
    #[cfg(unix)]
    Unix(UnixListener, SocketFile),
}

impl Listener {
    /// Bound TCP address; `None` for a Unix socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            Listener::Unix(..) => None,
        }
    }

    /// Path of the socket file; `None` for TCP.
    pub fn socket_path(&self) -> Option<&Path> {
        match self {
            Listener::Tcp(_) => None,
            #[cfg(unix)]
            Listener::Unix(_, file) => file.path(),
        }
    }
}

/// Owns the filesystem entry of a bound Unix socket and unlinks it on drop.
#[derive(Debug)]
pub struct SocketFile {
    path: Option<PathBuf>,
}

impl SocketFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Drop for SocketFile {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed socket file"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to remove socket file")
            }
        }
    }
}

impl From<TcpListener> for Listener {
    fn from(listener: TcpListener) -> Self {
        Listener::Tcp(listener)
    }
}

#[cfg(unix)]
impl From<UnixListener> for Listener {
    fn from(listener: UnixListener) -> Self {
        let path = listener
            .local_addr()
            .ok()
            .and_then(|addr| addr.as_pathname().map(Path::to_path_buf));
        Listener::Unix(listener, SocketFile { path })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListenerKind {
    /// TCP on `host:port`.
    #[default]
    Port,
    /// Unix domain socket.
    Sock,
}

/// `server.*` configuration section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    pub kind: ListenerKind,
    /// Bind address; empty means all interfaces.
    pub host: String,
    /// `0` picks an ephemeral port.
    pub port: u16,
    /// Socket path; defaults to [`DEFAULT_SOCKET_NAME`] beside the executable.
    pub socket: Option<PathBuf>,
    /// Serve the reflection surface.
    pub reflection: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            kind: ListenerKind::Port,
            host: String::new(),
            port: 0,
            socket: None,
            reflection: true,
        }
    }
}

impl ConfigProperties for ListenerConfig {
    fn prefix() -> &'static str {
        "server"
    }

    fn from_config(config: &KeelConfig) -> Result<Self, ConfigError> {
        let transport_key = Self::key("transport");
        let kind = match config
            .get_or::<String>(&transport_key, "port".to_string())?
            .as_str()
        {
            "port" => ListenerKind::Port,
            "sock" => ListenerKind::Sock,
            other => {
                return Err(ConfigError::Invalid {
                    key: transport_key,
                    message: format!("unknown transport '{other}', expected 'port' or 'sock'"),
                })
            }
        };
        let socket: Option<String> = config.get_or(&Self::key("socket"), None)?;
        Ok(Self {
            kind,
            host: config.get_or(&Self::key("host"), String::new())?,
            port: config.get_or(&Self::key("port"), 0)?,
            socket: socket.map(PathBuf::from),
            reflection: config.get_or(&Self::key("reflection"), true)?,
        })
    }
}

impl ListenerConfig {
    /// Create and bind the configured listener.
    pub async fn bind(&self) -> io::Result<Listener> {
        match self.kind {
            ListenerKind::Port => self.bind_tcp().await,
            ListenerKind::Sock => self.bind_unix(),
        }
    }

    async fn bind_tcp(&self) -> io::Result<Listener> {
        let host = if self.host.is_empty() {
            "0.0.0.0"
        } else {
            self.host.as_str()
        };
        tracing::debug!(host, port = self.port, "binding tcp listener");
        let listener = TcpListener::bind((host, self.port)).await?;
        tracing::info!(addr = %listener.local_addr()?, "bound application address");
        Ok(Listener::Tcp(listener))
    }

    /// Path of the Unix socket this config binds.
    pub fn socket_path(&self) -> io::Result<PathBuf> {
        if let Some(path) = &self.socket {
            return Ok(path.clone());
        }
        let exe = std::env::current_exe()?;
        let dir = exe
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "executable has no parent directory"))?;
        Ok(dir.join(DEFAULT_SOCKET_NAME))
    }

    #[cfg(unix)]
    fn bind_unix(&self) -> io::Result<Listener> {
        let path = self.socket_path()?;
        tracing::info!(path = %path.display(), "socket path");
        let listener = UnixListener::bind(&path)?;
        Ok(Listener::Unix(listener, SocketFile::new(path)))
    }

    #[cfg(not(unix))]
    fn bind_unix(&self) -> io::Result<Listener> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "unix socket transport is not available on this platform",
        ))
    }
}
