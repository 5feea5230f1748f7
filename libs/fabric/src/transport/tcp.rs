use std::net::SocketAddr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tether_core::Address;
use tokio::net::{TcpListener, TcpStream};
use tracing::info;

use crate::codec::{BincodeCodec, Codec};
use crate::error::{Error, Result};
use crate::framed::{DEFAULT_MAX_FRAME_LEN, FRAME_LEN_LIMIT};
use crate::transport::socket::{Acceptor, Dialer, SocketConnection, SocketListener, SocketOptions};
use crate::transport::{Connection, Listener, Transport, DEFAULT_QUEUE_DEPTH};

/// TCP request/reply transport with length-prefix framing
///
/// Addresses are `tcp://ip:port`. Binding port 0 picks a free port; the
/// listener's [`Listener::local_address`] reports it.
#[derive(Debug, Clone)]
pub struct TcpTransport<C = BincodeCodec> {
    options: SocketOptions<C>,
}

impl TcpTransport {
    /// TCP transport with bincode and no connect timeout
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a builder for configuring the transport
    pub fn builder() -> TcpTransportBuilder {
        TcpTransportBuilder::new()
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn socket_addr(address: &Address) -> Result<SocketAddr> {
    match address {
        Address::Tcp(addr) => Ok(*addr),
        other => Err(Error::unsupported_address("tcp", other)),
    }
}

#[async_trait::async_trait]
impl<C, Req, Rep> Transport<Req, Rep> for TcpTransport<C>
where
    C: Codec + Clone + 'static,
    Req: Serialize + DeserializeOwned + Send + 'static,
    Rep: Serialize + DeserializeOwned + Send + 'static,
{
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn bind(&self, address: &Address) -> Result<Box<dyn Listener<Req, Rep>>> {
        let addr = socket_addr(address)?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::bind(e, address))?;
        let local = Address::Tcp(listener.local_addr()?);

        info!(address = %local, "TCP listener bound");

        Ok(Box::new(SocketListener::spawn(
            TcpAcceptor { listener },
            local,
            &self.options,
            None,
        )))
    }

    async fn connect(&self, address: &Address) -> Result<Box<dyn Connection<Req, Rep>>> {
        let addr = socket_addr(address)?;
        Ok(Box::new(SocketConnection::new(
            TcpDialer { addr },
            address.clone(),
            self.options.clone(),
        )))
    }
}

struct TcpAcceptor {
    listener: TcpListener,
}

#[async_trait::async_trait]
impl Acceptor for TcpAcceptor {
    type Stream = TcpStream;

    async fn accept(&self) -> std::io::Result<(TcpStream, String)> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, peer.to_string()))
    }
}

struct TcpDialer {
    addr: SocketAddr,
}

#[async_trait::async_trait]
impl Dialer for TcpDialer {
    type Stream = TcpStream;

    async fn dial(&self) -> std::io::Result<TcpStream> {
        let stream = TcpStream::connect(self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Builder for configuring TCP transport
pub struct TcpTransportBuilder<C = BincodeCodec> {
    codec: C,
    connect_timeout: Option<Duration>,
    max_frame_len: usize,
    queue_depth: usize,
}

impl TcpTransportBuilder {
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

impl Default for TcpTransportBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Codec + Clone> TcpTransportBuilder<C> {
    /// Use a different codec for frame bodies
    pub fn codec<C2: Codec + Clone>(self, codec: C2) -> TcpTransportBuilder<C2> {
        TcpTransportBuilder {
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

    pub fn build(self) -> TcpTransport<C> {
        TcpTransport {
            options: SocketOptions {
                codec: self.codec,
                max_frame_len: self.max_frame_len,
                connect_timeout: self.connect_timeout,
                queue_depth: self.queue_depth,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_limit_fits_length_prefix() {
        let transport = TcpTransport::builder().max_frame_len(usize::MAX).build();
        assert_eq!(transport.options.max_frame_len, FRAME_LEN_LIMIT);

        let transport = TcpTransport::builder().max_frame_len(1024).build();
        assert_eq!(transport.options.max_frame_len, 1024);
    }
}
