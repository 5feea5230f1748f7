use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tether_core::Address;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info};

use crate::codec::{BincodeCodec, Codec};
use crate::error::{Error, Result};
use crate::framed::{DEFAULT_MAX_FRAME_LEN, FRAME_LEN_LIMIT};
use crate::transport::socket::{Acceptor, Dialer, SocketConnection, SocketListener, SocketOptions};
use crate::transport::{Connection, Listener, Transport, DEFAULT_QUEUE_DEPTH};

/// Unix domain socket request/reply transport with length-prefix framing
///
/// Addresses are `unix:///absolute/path`. The socket file is removed when
/// the listener is closed or dropped.
#[derive(Debug, Clone)]
pub struct UnixTransport<C = BincodeCodec> {
    options: SocketOptions<C>,
}

impl UnixTransport {
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a builder for configuring the transport
    pub fn builder() -> UnixTransportBuilder {
        UnixTransportBuilder::new()
    }
}

impl Default for UnixTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn socket_path(address: &Address) -> Result<&Path> {
    match address {
        Address::Unix(path) => Ok(path.as_path()),
        other => Err(Error::unsupported_address("unix", other)),
    }
}

/// Clear a leftover socket file, refusing if a live server still answers on it
async fn remove_stale_socket(path: &Path, address: &Address) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    if UnixStream::connect(path).await.is_ok() {
        return Err(Error::AddressInUse(address.clone()));
    }
    debug!(address = %address, "Removing stale socket file");
    std::fs::remove_file(path)?;
    Ok(())
}

#[async_trait::async_trait]
impl<C, Req, Rep> Transport<Req, Rep> for UnixTransport<C>
where
    C: Codec + Clone + 'static,
    Req: Serialize + DeserializeOwned + Send + 'static,
    Rep: Serialize + DeserializeOwned + Send + 'static,
{
    fn name(&self) -> &'static str {
        "unix"
    }

    async fn bind(&self, address: &Address) -> Result<Box<dyn Listener<Req, Rep>>> {
        let path = socket_path(address)?;
        remove_stale_socket(path, address).await?;

        let listener = UnixListener::bind(path).map_err(|e| Error::bind(e, address))?;

        info!(address = %address, "Unix listener bound");

        Ok(Box::new(SocketListener::spawn(
            UnixAcceptor { listener },
            address.clone(),
            &self.options,
            Some(path.to_path_buf()),
        )))
    }

    async fn connect(&self, address: &Address) -> Result<Box<dyn Connection<Req, Rep>>> {
        let path = socket_path(address)?.to_path_buf();
        Ok(Box::new(SocketConnection::new(
            UnixDialer { path },
            address.clone(),
            self.options.clone(),
        )))
    }
}

struct UnixAcceptor {
    listener: UnixListener,
}

#[async_trait::async_trait]
impl Acceptor for UnixAcceptor {
    type Stream = UnixStream;

    async fn accept(&self) -> std::io::Result<(UnixStream, String)> {
        let (stream, peer) = self.listener.accept().await?;
        let peer = peer
            .as_pathname()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "unnamed".to_string());
        Ok((stream, peer))
    }
}

struct UnixDialer {
    path: PathBuf,
}

#[async_trait::async_trait]
impl Dialer for UnixDialer {
    type Stream = UnixStream;

    async fn dial(&self) -> std::io::Result<UnixStream> {
        UnixStream::connect(&self.path).await
    }
}

/// Builder for configuring Unix socket transport
pub struct UnixTransportBuilder<C = BincodeCodec> {
    codec: C,
    connect_timeout: Option<Duration>,
    max_frame_len: usize,
    queue_depth: usize,
}

impl UnixTransportBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self {
            codec: BincodeCodec,
            connect_timeout: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

impl Default for UnixTransportBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Codec + Clone> UnixTransportBuilder<C> {
    /// Use a different codec for frame bodies
    pub fn codec<C2: Codec + Clone>(self, codec: C2) -> UnixTransportBuilder<C2> {
        UnixTransportBuilder {
            codec,
            connect_timeout: self.connect_timeout,
            max_frame_len: self.max_frame_len,
            queue_depth: self.queue_depth,
        }
    }

    /// Set the connection timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the largest accepted frame, in bytes, up to [`FRAME_LEN_LIMIT`]
    pub fn max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len.min(FRAME_LEN_LIMIT);
        self
    }

    /// Set how many requests may wait for a busy server
    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    pub fn build(self) -> UnixTransport<C> {
        UnixTransport {
            options: SocketOptions {
                codec: self.codec,
                max_frame_len: self.max_frame_len,
                connect_timeout: self.connect_timeout,
                queue_depth: self.queue_depth,
            },
        }
    }
}
