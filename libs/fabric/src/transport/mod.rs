use std::time::Duration;

use tether_core::Address;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

pub mod memory;
mod socket;
pub mod tcp;
pub mod unix;

pub use self::memory::{MemoryTransport, Registry};
pub use self::tcp::{TcpTransport, TcpTransportBuilder};
pub use self::unix::{UnixTransport, UnixTransportBuilder};

/// Queue depth between a listener and its connections when not configured
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Request/reply transport
///
/// `Req` travels from client to server, `Rep` back. Implementations are
/// picked at construction time and used through trait objects.
#[async_trait::async_trait]
pub trait Transport<Req, Rep>: Send + Sync
where
    Req: Send + 'static,
    Rep: Send + 'static,
{
    /// Short transport name for logs
    fn name(&self) -> &'static str;

    /// Bind a listener to `address`
    ///
    /// Fails with [`Error::AddressInUse`] if another listener holds it.
    async fn bind(&self, address: &Address) -> Result<Box<dyn Listener<Req, Rep>>>;

    /// Open a client handle for `address`
    ///
    /// Does not require a listener to be bound yet; an unreachable peer only
    /// shows up as a receive timeout.
    async fn connect(&self, address: &Address) -> Result<Box<dyn Connection<Req, Rep>>>;
}

/// Server side of a transport
#[async_trait::async_trait]
pub trait Listener<Req, Rep>: Send
where
    Req: Send + 'static,
    Rep: Send + 'static,
{
    /// Wait for the next request
    async fn receive(&mut self) -> Result<Incoming<Req, Rep>>;

    /// The address actually bound (resolves TCP port 0)
    fn local_address(&self) -> &Address;

    /// Stop accepting requests and release the address
    async fn close(&mut self) -> Result<()>;
}

/// Client side of a transport
#[async_trait::async_trait]
pub trait Connection<Req, Rep>: Send
where
    Req: Send + 'static,
    Rep: Send + 'static,
{
    fn remote_address(&self) -> &Address;

    /// Send one request
    async fn send(&mut self, message: Req) -> Result<()>;

    /// Wait up to `timeout` for the reply to the last request
    ///
    /// Returns [`Error::Timeout`] when nothing arrives in time.
    async fn receive(&mut self, timeout: Duration) -> Result<Rep>;

    async fn close(&mut self) -> Result<()>;
}

/// A received request together with the way back to its sender
pub struct Incoming<Req, Rep> {
    message: Req,
    responder: Responder<Rep>,
}

impl<Req, Rep> Incoming<Req, Rep> {
    pub fn new(message: Req, responder: Responder<Rep>) -> Self {
        Self { message, responder }
    }

    pub fn message(&self) -> &Req {
        &self.message
    }

    pub fn into_parts(self) -> (Req, Responder<Rep>) {
        (self.message, self.responder)
    }

    /// Answer the request, consuming it
    pub fn reply(self, reply: Rep) -> Result<()> {
        self.responder.reply(reply)
    }
}

/// One-shot return path to the peer that sent a request
pub struct Responder<Rep> {
    tx: oneshot::Sender<Rep>,
}

impl<Rep> Responder<Rep> {
    pub fn channel() -> (Self, oneshot::Receiver<Rep>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Send the reply; fails with [`Error::ConnectionClosed`] if the peer
    /// stopped waiting
    pub fn reply(self, reply: Rep) -> Result<()> {
        self.tx.send(reply).map_err(|_| Error::ConnectionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn responder_delivers_once() {
        let (responder, rx) = Responder::channel();
        let incoming = Incoming::new("ping", responder);
        assert_eq!(*incoming.message(), "ping");

        incoming.reply("pong").unwrap();
        assert_eq!(rx.await.unwrap(), "pong");
    }

    #[test]
    fn reply_to_departed_peer_is_connection_closed() {
        let (responder, rx) = Responder::<u32>::channel();
        drop(rx);
        assert!(responder.is_closed());
        assert!(matches!(responder.reply(1), Err(Error::ConnectionClosed)));
    }
}
