//! Tether RPC - Blocking request/reply calls over pluggable transports
//!
//! A [`Server`] binds an address and answers `(command, payload)` requests
//! with a handler. A [`Client`] sends one request at a time and waits for
//! the matching reply, up to a deadline. [`Rpc`] picks the transport and
//! wires both ends to it.
//!
//! # Example
//!
//! ```no_run
//! use tether_rpc::Rpc;
//!
//! # async fn example() -> Result<(), tether_rpc::RpcError> {
//! let rpc: Rpc<u32, (String, u32)> = Rpc::memory();
//!
//! let _server = rpc
//!     .serve("node1", |command, payload| Ok((command, payload)))
//!     .await?;
//!
//! let mut client = rpc.client("node1").await?;
//! let reply = client.call("command", 7).await?;
//! assert_eq!(reply, ("command".to_string(), 7));
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tether_core::{Reply, Request};
use tether_fabric::transport::{MemoryTransport, TcpTransport, Transport, UnixTransport};

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod server;

pub use client::Client;
pub use config::{ClientConfig, DEFAULT_CALL_TIMEOUT};
pub use error::{HandlerError, Result, RpcError};
pub use handler::Handler;
pub use server::Server;
pub use tether_core::{Address, IntoAddress};

/// Transport selection plus client defaults
///
/// `P` is the request payload type and `R` the handler result type. Clones
/// share the same transport.
pub struct Rpc<P, R> {
    transport: Arc<dyn Transport<Request<P>, Reply<R>>>,
    config: ClientConfig,
}

impl<P, R> Clone for Rpc<P, R> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            config: self.config.clone(),
        }
    }
}

impl<P, R> Rpc<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    pub fn with_transport(transport: impl Transport<Request<P>, Reply<R>> + 'static) -> Self {
        Self {
            transport: Arc::new(transport),
            config: ClientConfig::default(),
        }
    }

    /// In-process transport over the process-wide registry
    pub fn memory() -> Self {
        Self::with_transport(MemoryTransport::global())
    }

    /// Deadline for calls made by clients created from here on
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// Bind `address` and answer every request with `handler`
    pub async fn serve<F>(&self, address: impl IntoAddress, handler: F) -> Result<Server>
    where
        F: Fn(String, P) -> std::result::Result<R, HandlerError> + Send + Sync + 'static,
    {
        Server::bind(&*self.transport, address, handler).await
    }

    /// Like [`Rpc::serve`], for handler types other than closures
    pub async fn serve_with<H: Handler<P, R>>(&self, address: impl IntoAddress, handler: H) -> Result<Server> {
        Server::bind(&*self.transport, address, handler).await
    }

    /// Create a client for `address`
    pub async fn client(&self, address: impl IntoAddress) -> Result<Client<P, R>> {
        Client::connect(&*self.transport, address, self.config.clone()).await
    }
}

impl<P, R> Rpc<P, R>
where
    P: Serialize + DeserializeOwned + Send + 'static,
    R: Serialize + DeserializeOwned + Send + 'static,
{
    /// TCP transport with default settings
    pub fn tcp() -> Self {
        Self::with_transport(TcpTransport::new())
    }

    /// Unix socket transport with default settings
    pub fn unix() -> Self {
        Self::with_transport(UnixTransport::new())
    }

    /// The default transport for the kind of `address`
    pub fn for_address(address: &Address) -> Self {
        match address {
            Address::Memory(_) => Self::memory(),
            Address::Tcp(_) => Self::tcp(),
            Address::Unix(_) => Self::unix(),
        }
    }
}
