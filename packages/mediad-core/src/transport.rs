//! Socket endpoints for the control plane.
//!
//! The daemon of each CPU listens under the name `md:<cpu>`. On the local
//! CPU that name is an `AF_UNIX` socket inside the runtime socket directory;
//! cross-CPU legs ride TCP with identical framing (the platform's rpmsg
//! stream sockets have no portable equivalent), with peer hosts taken from
//! a static table. An optional extra inet listener can be enabled for tools.
//!
//! Reverse connections (notify channels, buffer-mode data sockets) use the
//! same scheme: a unix socket named `md_<token>` when both ends share a CPU,
//! an ephemeral TCP port advertised as `tcp:<port>` otherwise.

use std::collections::HashMap;
use std::io::{self, Read as _, Write as _};
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use uuid::Uuid;

use crate::defs::{control_socket_name, CLIENT_SOCKET_PREFIX};
use crate::error::{MediaError, MediaResult};

/// Network configuration shared by the daemon and the client proxies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Name of the CPU this process runs on.
    pub local_cpu: String,

    /// Directory holding every `AF_UNIX` control-plane socket.
    pub socket_dir: PathBuf,

    /// TCP port carrying cross-CPU traffic. Negative disables the listener
    /// (single-CPU deployments).
    pub rpc_port: i32,

    /// Optional extra `AF_INET` listener for diagnostic tools. Negative
    /// disables it.
    pub inet_port: i32,

    /// Peer CPU name to reachable host address.
    pub peers: HashMap<String, String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            local_cpu: "ap".to_string(),
            socket_dir: std::env::temp_dir().join("mediad"),
            rpc_port: 49410,
            inet_port: -1,
            peers: HashMap::new(),
        }
    }
}

impl TransportConfig {
    /// Whether `cpu` names this process's own CPU.
    pub fn is_local(&self, cpu: &str) -> bool {
        cpu == self.local_cpu
    }

    /// Filesystem path of a daemon control socket.
    pub fn control_socket_path(&self, cpu: &str) -> PathBuf {
        self.socket_dir.join(control_socket_name(cpu))
    }

    /// Filesystem path of a client-side reverse or data socket.
    pub fn client_socket_path(&self, key: &str) -> PathBuf {
        self.socket_dir.join(key)
    }

    /// Host carrying the given remote CPU.
    pub fn peer_host(&self, cpu: &str) -> MediaResult<&str> {
        self.peers
            .get(cpu)
            .map(String::as_str)
            .ok_or_else(|| MediaError::NotFound(format!("no peer host for cpu '{cpu}'")))
    }

    /// Generates a process-unique reverse-socket key for a server on `cpu`.
    ///
    /// Local servers dial back over unix, so the key doubles as the socket
    /// file name. Remote servers dial TCP; the real key is minted by
    /// [`bind_reverse`] once the ephemeral port is known.
    pub fn fresh_socket_key(&self) -> String {
        format!("{}{}", CLIENT_SOCKET_PREFIX, Uuid::new_v4().simple())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Async streams
// ─────────────────────────────────────────────────────────────────────────────

/// A control-plane byte stream, unix or cross-CPU.
#[derive(Debug)]
pub enum RpcStream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl AsyncRead for RpcStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RpcStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_flush(cx),
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// A listening control-plane socket.
#[derive(Debug)]
pub enum RpcListener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl RpcListener {
    pub async fn accept(&self) -> io::Result<RpcStream> {
        match self {
            Self::Unix(l) => l.accept().await.map(|(s, _)| RpcStream::Unix(s)),
            Self::Tcp(l) => l.accept().await.map(|(s, _)| RpcStream::Tcp(s)),
        }
    }
}

/// Binds the daemon's local control socket, replacing a stale one.
pub fn bind_local(cfg: &TransportConfig) -> MediaResult<RpcListener> {
    std::fs::create_dir_all(&cfg.socket_dir)?;
    let path = cfg.control_socket_path(&cfg.local_cpu);
    if path.exists() {
        std::fs::remove_file(&path)?;
    }
    Ok(RpcListener::Unix(UnixListener::bind(&path)?))
}

/// Binds a TCP listener on `port` with `SO_REUSEADDR`.
pub fn bind_tcp(port: u16) -> MediaResult<RpcListener> {
    let addr: std::net::SocketAddr = ([0, 0, 0, 0], port).into();
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(16)?;
    socket.set_nonblocking(true)?;
    let std_listener: std::net::TcpListener = socket.into();
    Ok(RpcListener::Tcp(TcpListener::from_std(std_listener)?))
}

/// Dials the control socket of the daemon on `cpu`.
pub async fn dial_control(cfg: &TransportConfig, cpu: &str) -> MediaResult<RpcStream> {
    if cfg.is_local(cpu) {
        let path = cfg.control_socket_path(cpu);
        Ok(RpcStream::Unix(UnixStream::connect(path).await?))
    } else {
        let host = cfg.peer_host(cpu)?;
        if cfg.rpc_port < 0 {
            return Err(MediaError::InvalidArgument("cross-cpu port disabled".into()));
        }
        let stream = TcpStream::connect((host, cfg.rpc_port as u16)).await?;
        Ok(RpcStream::Tcp(stream))
    }
}

/// Dials back to a client's reverse socket identified by `{key, cpu}`.
///
/// Used by the daemon for `CREATE_NOTIFY` and by buffer-mode prepare.
pub async fn dial_back(cfg: &TransportConfig, cpu: &str, key: &str) -> MediaResult<RpcStream> {
    if cfg.is_local(cpu) {
        let path = cfg.client_socket_path(key);
        Ok(RpcStream::Unix(UnixStream::connect(path).await?))
    } else {
        let port: u16 = key
            .strip_prefix("tcp:")
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| MediaError::InvalidArgument(format!("bad reverse key '{key}'")))?;
        let host = cfg.peer_host(cpu)?;
        Ok(RpcStream::Tcp(TcpStream::connect((host, port)).await?))
    }
}

/// Binds a reverse listener for a server living on `server_cpu`.
///
/// Returns the listener plus the key to advertise in `CREATE_NOTIFY`.
pub fn bind_reverse(
    cfg: &TransportConfig,
    server_cpu: &str,
) -> MediaResult<(RpcListener, String)> {
    if cfg.is_local(server_cpu) {
        std::fs::create_dir_all(&cfg.socket_dir)?;
        let key = cfg.fresh_socket_key();
        let path = cfg.client_socket_path(&key);
        let listener = UnixListener::bind(&path)?;
        Ok((RpcListener::Unix(listener), key))
    } else {
        let socket = std::net::TcpListener::bind(("0.0.0.0", 0))?;
        socket.set_nonblocking(true)?;
        let port = socket.local_addr()?.port();
        let listener = TcpListener::from_std(socket)?;
        Ok((RpcListener::Tcp(listener), format!("tcp:{port}")))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Blocking streams (sync client)
// ─────────────────────────────────────────────────────────────────────────────

/// Blocking counterpart of [`RpcStream`] for the synchronous client.
#[derive(Debug)]
pub enum SyncStream {
    Unix(std::os::unix::net::UnixStream),
    Tcp(std::net::TcpStream),
}

impl SyncStream {
    pub fn try_clone(&self) -> io::Result<Self> {
        match self {
            Self::Unix(s) => s.try_clone().map(Self::Unix),
            Self::Tcp(s) => s.try_clone().map(Self::Tcp),
        }
    }

    /// Half-closes the write direction so the daemon observes hangup.
    pub fn shutdown_write(&self) -> io::Result<()> {
        match self {
            Self::Unix(s) => s.shutdown(std::net::Shutdown::Write),
            Self::Tcp(s) => s.shutdown(std::net::Shutdown::Write),
        }
    }

    pub fn shutdown_both(&self) -> io::Result<()> {
        match self {
            Self::Unix(s) => s.shutdown(std::net::Shutdown::Both),
            Self::Tcp(s) => s.shutdown(std::net::Shutdown::Both),
        }
    }
}

impl io::Read for SyncStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Unix(s) => s.read(buf),
            Self::Tcp(s) => s.read(buf),
        }
    }
}

impl io::Write for SyncStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Unix(s) => s.write(buf),
            Self::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Unix(s) => s.flush(),
            Self::Tcp(s) => s.flush(),
        }
    }
}

/// Blocking dial of the daemon on `cpu`.
pub fn dial_control_blocking(cfg: &TransportConfig, cpu: &str) -> MediaResult<SyncStream> {
    if cfg.is_local(cpu) {
        let path = cfg.control_socket_path(cpu);
        Ok(SyncStream::Unix(std::os::unix::net::UnixStream::connect(path)?))
    } else {
        let host = cfg.peer_host(cpu)?;
        if cfg.rpc_port < 0 {
            return Err(MediaError::InvalidArgument("cross-cpu port disabled".into()));
        }
        let stream = std::net::TcpStream::connect((host, cfg.rpc_port as u16))?;
        Ok(SyncStream::Tcp(stream))
    }
}

/// Blocking reverse listener for the synchronous client.
#[derive(Debug)]
pub enum SyncListener {
    Unix(std::os::unix::net::UnixListener),
    Tcp(std::net::TcpListener),
}

impl SyncListener {
    pub fn accept(&self) -> io::Result<SyncStream> {
        match self {
            Self::Unix(l) => l.accept().map(|(s, _)| SyncStream::Unix(s)),
            Self::Tcp(l) => l.accept().map(|(s, _)| SyncStream::Tcp(s)),
        }
    }
}

/// Blocking counterpart of [`bind_reverse`].
pub fn bind_reverse_blocking(
    cfg: &TransportConfig,
    server_cpu: &str,
) -> MediaResult<(SyncListener, String)> {
    if cfg.is_local(server_cpu) {
        std::fs::create_dir_all(&cfg.socket_dir)?;
        let key = cfg.fresh_socket_key();
        let path = cfg.client_socket_path(&key);
        Ok((SyncListener::Unix(std::os::unix::net::UnixListener::bind(&path)?), key))
    } else {
        let listener = std::net::TcpListener::bind(("0.0.0.0", 0))?;
        let port = listener.local_addr()?.port();
        Ok((SyncListener::Tcp(listener), format!("tcp:{port}")))
    }
}
