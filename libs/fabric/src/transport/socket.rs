//! Request/reply plumbing shared by the stream-socket transports
//!
//! A bound listener runs an accept task. Every accepted stream gets its own
//! task that reads one request, queues it for the server together with a
//! [`Responder`], waits for the reply and writes it back before reading the
//! next request. The client side keeps a single lazily-opened stream and
//! drops it whenever an exchange is interrupted, so a late reply can never
//! be read by a later call. A kept stream whose peer hung up in the
//! meantime is replaced before the next request is written.

use std::io;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tether_core::Address;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, trace, warn};

use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::framed::{encode_frame, Framed};
use crate::transport::{Connection, Incoming, Listener, Responder};

/// Accepts incoming streams for a bound address
#[async_trait::async_trait]
pub(crate) trait Acceptor: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn accept(&self) -> io::Result<(Self::Stream, String)>;
}

/// Opens outgoing streams to one address
#[async_trait::async_trait]
pub(crate) trait Dialer: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static;

    async fn dial(&self) -> io::Result<Self::Stream>;
}

/// Settings shared by both ends of a socket transport
#[derive(Debug, Clone)]
pub(crate) struct SocketOptions<C> {
    pub codec: C,
    pub max_frame_len: usize,
    pub connect_timeout: Option<Duration>,
    pub queue_depth: usize,
}

pub(crate) struct SocketListener<Req, Rep> {
    address: Address,
    queue: mpsc::Receiver<Incoming<Req, Rep>>,
    stop: Option<oneshot::Sender<()>>,
    accept_task: JoinHandle<()>,
    socket_file: Option<PathBuf>,
    closed: bool,
}

impl<Req, Rep> SocketListener<Req, Rep>
where
    Req: DeserializeOwned + Send + 'static,
    Rep: Serialize + Send + 'static,
{
    /// Start accepting on `acceptor`, which is already bound to `address`
    pub fn spawn<A, C>(
        acceptor: A,
        address: Address,
        options: &SocketOptions<C>,
        socket_file: Option<PathBuf>,
    ) -> Self
    where
        A: Acceptor,
        C: Codec + Clone + 'static,
    {
        let (tx, rx) = mpsc::channel(options.queue_depth);
        let (stop, stopped) = oneshot::channel();
        let accept_task = tokio::spawn(accept_loop(
            acceptor,
            options.codec.clone(),
            options.max_frame_len,
            tx,
            stopped,
        ));

        Self {
            address,
            queue: rx,
            stop: Some(stop),
            accept_task,
            socket_file,
            closed: false,
        }
    }
}

impl<Req, Rep> SocketListener<Req, Rep> {
    fn remove_socket_file(&mut self) {
        if let Some(path) = self.socket_file.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[async_trait::async_trait]
impl<Req, Rep> Listener<Req, Rep> for SocketListener<Req, Rep>
where
    Req: Send + 'static,
    Rep: Send + 'static,
{
    async fn receive(&mut self) -> Result<Incoming<Req, Rep>> {
        self.queue.recv().await.ok_or(Error::ConnectionClosed)
    }

    fn local_address(&self) -> &Address {
        &self.address
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.queue.close();
        self.remove_socket_file();
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        // The bound socket and every accepted stream live in the accept
        // task; once it has finished they are all gone.
        if let Err(e) = (&mut self.accept_task).await {
            debug!(address = %self.address, error = %e, "Accept task ended abnormally");
        }
        self.closed = true;
        debug!(address = %self.address, "Socket listener closed");
        Ok(())
    }
}

impl<Req, Rep> Drop for SocketListener<Req, Rep> {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.queue.close();
        self.remove_socket_file();
    }
}

async fn accept_loop<A, C, Req, Rep>(
    acceptor: A,
    codec: C,
    max_frame_len: usize,
    queue: mpsc::Sender<Incoming<Req, Rep>>,
    mut stopped: oneshot::Receiver<()>,
) where
    A: Acceptor,
    C: Codec + Clone + 'static,
    Req: DeserializeOwned + Send + 'static,
    Rep: Serialize + Send + 'static,
{
    // Dropping the set when this task is aborted aborts every connection task.
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut stopped => break,
            accepted = acceptor.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Accepted connection");
                    let framed = Framed::new(stream, codec.clone()).with_max_frame_len(max_frame_len);
                    connections.spawn(serve_connection(framed, queue.clone(), peer));
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }

        if queue.is_closed() {
            break;
        }
    }

    drop(acceptor);
    connections.shutdown().await;
}

async fn serve_connection<S, C, Req, Rep>(
    mut framed: Framed<S, C>,
    queue: mpsc::Sender<Incoming<Req, Rep>>,
    peer: String,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    C: Codec,
    Req: DeserializeOwned + Send + 'static,
    Rep: Serialize + Send + 'static,
{
    loop {
        let request: Req = match framed.receive().await {
            Ok(request) => request,
            Err(Error::ConnectionClosed) => {
                debug!(peer = %peer, "Peer disconnected");
                return;
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "Dropping connection after bad request");
                return;
            }
        };
        trace!(peer = %peer, "Request received");

        let (responder, reply) = Responder::channel();
        if queue.send(Incoming::new(request, responder)).await.is_err() {
            return;
        }

        let Ok(reply) = reply.await else {
            debug!(peer = %peer, "Request dropped without a reply");
            return;
        };

        let frame = match framed.encode(&reply) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Could not encode reply");
                return;
            }
        };

        if let Err(e) = framed.send_frame(frame).await {
            debug!(peer = %peer, error = %e, "Could not deliver reply");
            return;
        }
    }
}

pub(crate) struct SocketConnection<D: Dialer, C, Req, Rep> {
    dialer: D,
    address: Address,
    options: SocketOptions<C>,
    framed: Option<Framed<D::Stream, C>>,
    _messages: PhantomData<fn(Req) -> Rep>,
}

impl<D, C, Req, Rep> SocketConnection<D, C, Req, Rep>
where
    D: Dialer,
    C: Codec + Clone,
{
    pub fn new(dialer: D, address: Address, options: SocketOptions<C>) -> Self {
        Self {
            dialer,
            address,
            options,
            framed: None,
            _messages: PhantomData,
        }
    }

    async fn open(&self) -> Result<Framed<D::Stream, C>> {
        let stream = match self.options.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.dialer.dial())
                .await
                .map_err(|_| Error::Timeout)??,
            None => self.dialer.dial().await?,
        };
        debug!(address = %self.address, "Connected");
        Ok(Framed::new(stream, self.options.codec.clone())
            .with_max_frame_len(self.options.max_frame_len))
    }
}

#[async_trait::async_trait]
impl<D, C, Req, Rep> Connection<Req, Rep> for SocketConnection<D, C, Req, Rep>
where
    D: Dialer,
    C: Codec + Clone + 'static,
    Req: Serialize + Send + 'static,
    Rep: DeserializeOwned + Send + 'static,
{
    fn remote_address(&self) -> &Address {
        &self.address
    }

    async fn send(&mut self, message: Req) -> Result<()> {
        let frame = encode_frame(&self.options.codec, &message, self.options.max_frame_len)?;

        // Nothing of this request went out yet, so a stream the server hung
        // up on is replaced rather than written into.
        if let Some(framed) = self.framed.as_mut() {
            if framed.peer_closed().await {
                debug!(address = %self.address, "Server closed the connection, reconnecting");
                self.framed = None;
            }
        }

        // The stream is taken for the duration of the write: if this future
        // is dropped halfway, the half-written stream goes with it.
        let mut framed = match self.framed.take() {
            Some(framed) => framed,
            None => match self.open().await {
                Ok(framed) => framed,
                Err(e) => {
                    debug!(address = %self.address, error = %e, "Server unreachable");
                    return Ok(());
                }
            },
        };

        match framed.send_frame(frame).await {
            Ok(()) => self.framed = Some(framed),
            Err(e) => debug!(address = %self.address, error = %e, "Send failed, dropping stream"),
        }
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Rep> {
        let Some(mut framed) = self.framed.take() else {
            tokio::time::sleep(timeout).await;
            return Err(Error::Timeout);
        };

        match tokio::time::timeout(timeout, framed.receive::<Rep>()).await {
            Ok(Ok(reply)) => {
                self.framed = Some(framed);
                Ok(reply)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut framed) = self.framed.take() {
            framed.close().await?;
        }
        Ok(())
    }
}
