use std::time::Duration;

use tether_core::{Address, CallId, IntoAddress, Reply, Request};
use tether_fabric::{Connection, Error, Transport};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::ClientConfig;
use crate::error::{Result, RpcError};

/// Caller side of the RPC layer
///
/// Each call blocks the calling task until the matching reply arrives or
/// the configured deadline passes. `call` takes `&mut self`, so a client
/// has at most one call in flight; use separate clients for concurrent
/// calls.
pub struct Client<P, R> {
    connection: Box<dyn Connection<Request<P>, Reply<R>>>,
    address: Address,
    config: ClientConfig,
    next_id: CallId,
}

/// The one outstanding call of a client
#[derive(Debug, Clone, Copy)]
struct PendingCall {
    id: CallId,
    deadline: Instant,
}

impl PendingCall {
    fn start(id: CallId, timeout: Duration) -> Self {
        Self {
            id,
            deadline: Instant::now() + timeout,
        }
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

impl<P, R> Client<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    /// Open a client for `address`; nothing is sent until the first call
    ///
    /// Malformed addresses, or addresses the transport cannot serve, fail
    /// here. A missing server does not: calls to it time out.
    pub async fn connect<T>(transport: &T, address: impl IntoAddress, config: ClientConfig) -> Result<Self>
    where
        T: Transport<Request<P>, Reply<R>> + ?Sized,
    {
        let address = address.into_address()?;
        let connection = transport.connect(&address).await?;

        debug!(address = %address, transport = transport.name(), "Client created");

        Ok(Self {
            connection,
            address,
            config,
            next_id: CallId::FIRST,
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Send `(command, payload)` and wait for the handler's result
    ///
    /// Returns exactly what the handler returned. Fails with
    /// [`RpcError::Timeout`] when no reply arrives in time, and with
    /// [`RpcError::Remote`] when the handler failed. Never retries.
    pub async fn call(&mut self, command: impl Into<String>, payload: P) -> Result<R> {
        let id = self.next_id;
        self.next_id = id.next();

        let request = Request::new(id, command, payload);
        trace!(address = %self.address, id = %id, command = %request.command, "Calling");

        let pending = PendingCall::start(id, self.config.timeout);

        match tokio::time::timeout_at(pending.deadline, self.connection.send(request)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(self.timed_out()),
        }

        loop {
            let remaining = pending.remaining();
            if remaining.is_zero() {
                return Err(self.timed_out());
            }

            match self.connection.receive(remaining).await {
                Ok(reply) if reply.id == pending.id => {
                    return reply.outcome.into_result().map_err(RpcError::Remote);
                }
                Ok(reply) => {
                    debug!(
                        address = %self.address,
                        expected = %pending.id,
                        received = %reply.id,
                        "Discarding stale reply"
                    );
                }
                Err(Error::Timeout | Error::ConnectionClosed) => return Err(self.timed_out()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Release the connection
    pub async fn close(mut self) -> Result<()> {
        self.connection.close().await?;
        Ok(())
    }

    fn timed_out(&self) -> RpcError {
        debug!(address = %self.address, "Call timed out");
        RpcError::Timeout {
            address: self.address.clone(),
            after: self.config.timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tether_core::Outcome;
    use tether_fabric::transport::Listener;

    /// Connection that replays scripted replies regardless of what is sent
    struct Scripted {
        address: Address,
        replies: Arc<Mutex<Vec<Reply<u32>>>>,
        sent: Arc<Mutex<Vec<CallId>>>,
    }

    #[async_trait::async_trait]
    impl Connection<Request<u32>, Reply<u32>> for Scripted {
        fn remote_address(&self) -> &Address {
            &self.address
        }

        async fn send(&mut self, message: Request<u32>) -> tether_fabric::Result<()> {
            self.sent.lock().unwrap().push(message.id);
            Ok(())
        }

        async fn receive(&mut self, timeout: Duration) -> tether_fabric::Result<Reply<u32>> {
            let next = {
                let mut replies = self.replies.lock().unwrap();
                if replies.is_empty() {
                    None
                } else {
                    Some(replies.remove(0))
                }
            };
            match next {
                Some(reply) => Ok(reply),
                None => {
                    tokio::time::sleep(timeout).await;
                    Err(Error::Timeout)
                }
            }
        }

        async fn close(&mut self) -> tether_fabric::Result<()> {
            Ok(())
        }
    }

    struct ScriptedTransport {
        replies: Arc<Mutex<Vec<Reply<u32>>>>,
        sent: Arc<Mutex<Vec<CallId>>>,
    }

    #[async_trait::async_trait]
    impl Transport<Request<u32>, Reply<u32>> for ScriptedTransport {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn bind(
            &self,
            _address: &Address,
        ) -> tether_fabric::Result<Box<dyn Listener<Request<u32>, Reply<u32>>>> {
            Err(Error::custom("scripted transport cannot bind"))
        }

        async fn connect(
            &self,
            address: &Address,
        ) -> tether_fabric::Result<Box<dyn Connection<Request<u32>, Reply<u32>>>> {
            Ok(Box::new(Scripted {
                address: address.clone(),
                replies: self.replies.clone(),
                sent: self.sent.clone(),
            }))
        }
    }

    fn scripted(replies: Vec<Reply<u32>>) -> ScriptedTransport {
        ScriptedTransport {
            replies: Arc::new(Mutex::new(replies)),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn config(millis: u64) -> ClientConfig {
        ClientConfig::new().timeout(Duration::from_millis(millis))
    }

    #[tokio::test]
    async fn stale_replies_are_skipped() {
        let transport = scripted(vec![
            Reply {
                id: CallId(99),
                outcome: Outcome::Ok(0),
            },
            Reply {
                id: CallId::FIRST,
                outcome: Outcome::Ok(10),
            },
        ]);
        let mut client = Client::connect(&transport, "scripted", config(500)).await.unwrap();

        assert_eq!(client.call("command", 1).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn ids_increase_per_call() {
        let transport = scripted(vec![
            Reply {
                id: CallId(1),
                outcome: Outcome::Ok(1),
            },
            Reply {
                id: CallId(2),
                outcome: Outcome::Ok(2),
            },
        ]);
        let mut client = Client::connect(&transport, "scripted", config(500)).await.unwrap();

        client.call("a", 0).await.unwrap();
        client.call("b", 0).await.unwrap();
        assert_eq!(*transport.sent.lock().unwrap(), vec![CallId(1), CallId(2)]);
    }

    #[tokio::test]
    async fn only_stale_replies_means_timeout() {
        let transport = scripted(vec![Reply {
            id: CallId(42),
            outcome: Outcome::Ok(0),
        }]);
        let mut client = Client::connect(&transport, "scripted", config(100)).await.unwrap();

        let err = client.call("command", 1).await.unwrap_err();
        assert!(err.is_timeout(), "unexpected error: {}", err);
    }

    #[tokio::test]
    async fn failed_outcome_is_remote_error() {
        let transport = scripted(vec![Reply {
            id: CallId::FIRST,
            outcome: Outcome::Failed("boom".to_string()),
        }]);
        let mut client = Client::connect(&transport, "scripted", config(500)).await.unwrap();

        match client.call("command", 1).await {
            Err(RpcError::Remote(msg)) => assert_eq!(msg, "boom"),
            other => panic!("Expected Remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn malformed_address_fails_at_construction() {
        let transport = scripted(vec![]);
        match Client::connect(&transport, "tcp://not-an-address", config(100)).await {
            Err(RpcError::InvalidAddress(_)) => {}
            Err(e) => panic!("Expected InvalidAddress, got {:?}", e),
            Ok(_) => panic!("Expected InvalidAddress, got a client"),
        }
    }
}
