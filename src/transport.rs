//! Socket transports for channels.
//!
//! Provides TCP and Unix domain socket connectors and a listener that wraps each accepted
//! connection in a [`Channel`].

use std::{future::Future, io, net::SocketAddr, path::Path, sync::Arc};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{
        TcpListener as TokioTcpListener, TcpStream, UnixListener as TokioUnixListener, UnixStream,
    },
};
use tracing::{trace, warn};

use crate::{config::Config, error::*, Channel, Registry};

/// Connects to a TCP address and wraps the connection in a channel.
pub async fn connect_tcp(
    addr: &str,
    registry: impl Into<Arc<Registry>>,
    config: Config,
) -> Result<Channel> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| ChannelError::Connect { source })?;
    trace!("TCP connection established to: {}", addr);
    Ok(Channel::with_config(stream, registry, config))
}

/// Connects to a Unix domain socket and wraps the connection in a channel.
pub async fn connect_unix<P: AsRef<Path>>(
    path: P,
    registry: impl Into<Arc<Registry>>,
    config: Config,
) -> Result<Channel> {
    let path_str = path.as_ref().to_string_lossy().to_string();
    let stream = UnixStream::connect(path)
        .await
        .map_err(|source| ChannelError::Connect { source })?;
    trace!("Unix connection established to: {:?}", path_str);
    Ok(Channel::with_config(stream, registry, config))
}

/// TCP listener for accepting connections.
struct TcpListener {
    /// The underlying tokio TCP listener.
    inner: TokioTcpListener,
}

impl TcpListener {
    /// Binds a TCP listener to the given address.
    async fn bind(addr: &str) -> Result<Self> {
        trace!("Binding TCP listener to address: {}", addr);
        let listener = TokioTcpListener::bind(addr).await?;
        Ok(Self { inner: listener })
    }
}

/// Unix domain socket listener for accepting connections.
struct UnixListener {
    /// The underlying tokio Unix listener.
    inner: TokioUnixListener,
}

impl UnixListener {
    /// Binds a Unix listener to the given path.
    fn bind<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy();
        trace!("Binding Unix listener to path: {}", path_str);
        let listener = TokioUnixListener::bind(path)?;
        Ok(Self { inner: listener })
    }
}

/// Trait for listeners that produce byte streams.
#[async_trait]
trait Accept {
    /// The stream type produced by accepting a connection.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;
    /// Accepts an incoming connection.
    async fn accept_stream(&self) -> io::Result<Self::Stream>;
}

#[async_trait]
impl Accept for TcpListener {
    type Stream = TcpStream;
    async fn accept_stream(&self) -> io::Result<TcpStream> {
        let (stream, addr) = self.inner.accept().await?;
        trace!("Accepted TCP connection from: {}", addr);
        Ok(stream)
    }
}

#[async_trait]
impl Accept for UnixListener {
    type Stream = UnixStream;
    async fn accept_stream(&self) -> io::Result<UnixStream> {
        let (stream, _) = self.inner.accept().await?;
        trace!("Accepted Unix connection");
        Ok(stream)
    }
}

/// Either a TCP or Unix domain socket listener.
enum Binding {
    /// TCP listener.
    Tcp(TcpListener),
    /// Unix domain socket listener.
    Unix(UnixListener),
}

/// Accepts connections on a TCP or Unix domain socket, producing one [`Channel`] per connection.
/// Every channel shares the listener's registry and configuration.
pub struct Listener {
    registry: Arc<Registry>,
    config: Config,
    binding: Option<Binding>,
}

impl Listener {
    /// Creates an unbound listener for channels carrying the types in `registry`.
    pub fn new(registry: impl Into<Arc<Registry>>) -> Self {
        Self {
            registry: registry.into(),
            config: Config::default(),
            binding: None,
        }
    }

    /// Sets the configuration used for accepted channels.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Listens on a TCP address.
    pub async fn tcp(mut self, addr: &str) -> Result<Self> {
        self.binding = Some(Binding::Tcp(TcpListener::bind(addr).await?));
        Ok(self)
    }

    /// Listens on a Unix domain socket.
    pub async fn unix<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        self.binding = Some(Binding::Unix(UnixListener::bind(path)?));
        Ok(self)
    }

    /// Returns the bound address. Only valid for TCP listeners that have already been bound.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        match &self.binding {
            Some(Binding::Tcp(tcp_listener)) => Ok(tcp_listener.inner.local_addr()?),
            Some(Binding::Unix(_)) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets don't have a SocketAddr",
            )
            .into()),
            None => Err(not_bound()),
        }
    }

    /// Waits for the next connection and wraps it in a channel.
    pub async fn accept(&self) -> Result<Channel> {
        match self.binding.as_ref().ok_or_else(not_bound)? {
            Binding::Tcp(tcp_listener) => self.accept_from(tcp_listener).await,
            Binding::Unix(unix_listener) => self.accept_from(unix_listener).await,
        }
    }

    /// Accepts connections forever, spawning `handler` on a new task for each channel.
    pub async fn run<F, Fut>(self, handler: F) -> Result<()>
    where
        F: Fn(Channel) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        loop {
            match self.accept().await {
                Ok(channel) => {
                    tokio::spawn(handler(channel));
                }
                Err(ChannelError::Io(e)) if is_transient(&e) => {
                    warn!("Accept error: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn accept_from<L: Accept>(&self, listener: &L) -> Result<Channel> {
        let stream = listener.accept_stream().await?;
        Ok(Channel::with_config(
            stream,
            self.registry.clone(),
            self.config.clone(),
        ))
    }
}

fn not_bound() -> ChannelError {
    io::Error::new(io::ErrorKind::NotConnected, "No listener configured").into()
}

/// Accept errors that concern one connection rather than the listening socket.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}
