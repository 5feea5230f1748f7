use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tether_core::{Address, IntoAddress, Outcome, Reply, Request};
use tether_fabric::{Error, Listener, Transport};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn, Instrument};

use crate::error::{Result, RpcError};
use crate::handler::Handler;

/// A bound address with a request loop behind it
///
/// The loop handles one request at a time: the next request is not taken
/// until the current reply has been sent. Dropping the server aborts the
/// loop; [`Server::shutdown`] stops it after the request in progress and
/// waits until the address is released.
pub struct Server {
    address: Address,
    served: Arc<AtomicU64>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Server {
    /// Bind `address` on `transport` and start serving with `handler`
    pub async fn bind<T, P, R, H>(transport: &T, address: impl IntoAddress, handler: H) -> Result<Server>
    where
        T: Transport<Request<P>, Reply<R>> + ?Sized,
        P: Send + 'static,
        R: Send + 'static,
        H: Handler<P, R>,
    {
        let requested = address.into_address()?;
        let listener = transport
            .bind(&requested)
            .await
            .map_err(|e| match e {
                Error::InvalidAddress(msg) => RpcError::InvalidAddress(msg),
                source => RpcError::Bind {
                    address: requested.clone(),
                    source,
                },
            })?;

        let address = listener.local_address().clone();
        let served = Arc::new(AtomicU64::new(0));
        let (stop, stopped) = oneshot::channel();

        let task = tokio::spawn(serve(listener, Arc::new(handler), stopped, served.clone()));

        info!(address = %address, transport = transport.name(), "Server started");

        Ok(Server {
            address,
            served,
            stop: Some(stop),
            task: Some(task),
        })
    }

    /// The bound address; for TCP port 0 this carries the picked port
    pub fn local_address(&self) -> &Address {
        &self.address
    }

    /// Requests answered so far, including failed ones
    ///
    /// Requests whose caller stopped waiting before they were taken up are
    /// skipped and not counted.
    pub fn requests_served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop serving and release the address
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(address = %self.address, error = %e, "Server loop ended abnormally");
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn serve<P, R, H>(
    mut listener: Box<dyn Listener<Request<P>, Reply<R>>>,
    handler: Arc<H>,
    mut stopped: oneshot::Receiver<()>,
    served: Arc<AtomicU64>,
) where
    P: Send + 'static,
    R: Send + 'static,
    H: Handler<P, R>,
{
    let address = listener.local_address().clone();

    loop {
        let incoming = tokio::select! {
            _ = &mut stopped => break,
            received = listener.receive() => match received {
                Ok(incoming) => incoming,
                Err(Error::ConnectionClosed) => break,
                Err(e) => {
                    warn!(address = %address, error = %e, "Receive failed");
                    continue;
                }
            },
        };

        let (request, responder) = incoming.into_parts();
        let Request {
            id,
            command,
            payload,
        } = request;
        let span = tracing::debug_span!("request", address = %address, id = %id, command = %command);

        if responder.is_closed() {
            debug!(parent: &span, "Caller stopped waiting, skipping request");
            continue;
        }

        async {
            trace!("Handling request");
            let outcome = run_handler(&handler, command, payload).await;
            if let Outcome::Failed(reason) = &outcome {
                warn!(reason = %reason, "Handler failed");
            }
            served.fetch_add(1, Ordering::Relaxed);
            if responder.reply(Reply { id, outcome }).is_err() {
                debug!("Caller stopped waiting, reply dropped");
            }
        }
        .instrument(span)
        .await;
    }

    if let Err(e) = listener.close().await {
        warn!(address = %address, error = %e, "Failed to close listener");
    }
    info!(address = %address, "Server stopped");
}

async fn run_handler<P, R, H>(handler: &Arc<H>, command: String, payload: P) -> Outcome<R>
where
    P: Send + 'static,
    R: Send + 'static,
    H: Handler<P, R>,
{
    let handler = Arc::clone(handler);
    match tokio::task::spawn_blocking(move || handler.handle(command, payload)).await {
        Ok(Ok(value)) => Outcome::Ok(value),
        Ok(Err(e)) => Outcome::Failed(e.to_string()),
        Err(e) if e.is_panic() => Outcome::Failed(format!(
            "handler panicked: {}",
            panic_message(e.into_panic().as_ref())
        )),
        Err(e) => Outcome::Failed(e.to_string()),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        *msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic"
    }
}
