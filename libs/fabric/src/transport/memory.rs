use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tether_core::Address;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::transport::{
    Connection, Incoming, Listener, Responder, Transport, DEFAULT_QUEUE_DEPTH,
};

static GLOBAL: OnceLock<Registry> = OnceLock::new();

/// Name to rendezvous-queue map for in-process servers
///
/// Entries appear on bind and disappear when the listener is closed or
/// dropped. Cloning shares the same map.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    slots: Mutex<HashMap<String, Slot>>,
    next_token: AtomicU64,
}

struct Slot {
    token: u64,
    queue: Box<dyn Rendezvous>,
}

trait Rendezvous: Send + Sync {
    fn is_closed(&self) -> bool;
    fn as_any(&self) -> &dyn Any;
}

impl<T: Send + 'static> Rendezvous for mpsc::Sender<T> {
    fn is_closed(&self) -> bool {
        mpsc::Sender::is_closed(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Registry {
    /// The process-wide registry, created on first use
    pub fn global() -> Registry {
        GLOBAL.get_or_init(Registry::default).clone()
    }

    /// Number of names currently bound
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        // A poisoned map is still consistent: every mutation is a single insert or remove.
        self.inner
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register<T: Send + 'static>(
        &self,
        name: &str,
        address: &Address,
        queue: mpsc::Sender<T>,
    ) -> Result<u64> {
        let mut slots = self.lock();
        if let Some(existing) = slots.get(name) {
            if !existing.queue.is_closed() {
                return Err(Error::AddressInUse(address.clone()));
            }
            debug!(address = %address, "Replacing stale in-process binding");
        }

        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        slots.insert(
            name.to_string(),
            Slot {
                token,
                queue: Box::new(queue),
            },
        );
        Ok(token)
    }

    fn unregister(&self, name: &str, token: u64) {
        let mut slots = self.lock();
        if slots.get(name).is_some_and(|slot| slot.token == token) {
            slots.remove(name);
        }
    }

    fn lookup<T: Send + 'static>(&self, name: &str) -> Result<Option<mpsc::Sender<T>>> {
        let slots = self.lock();
        let Some(slot) = slots.get(name) else {
            return Ok(None);
        };
        match slot.queue.as_any().downcast_ref::<mpsc::Sender<T>>() {
            Some(queue) => Ok(Some(queue.clone())),
            None => Err(Error::custom(format!(
                "in-process address '{}' is bound with different message types",
                name
            ))),
        }
    }
}

/// In-process transport
///
/// Messages are moved through tokio channels; nothing is encoded.
#[derive(Clone)]
pub struct MemoryTransport {
    registry: Registry,
    queue_depth: usize,
}

impl MemoryTransport {
    /// Transport over the process-wide registry
    pub fn global() -> Self {
        Self::with_registry(Registry::global())
    }

    /// Transport over a private registry, invisible to other transports
    pub fn isolated() -> Self {
        Self::with_registry(Registry::default())
    }

    pub fn with_registry(registry: Registry) -> Self {
        Self {
            registry,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }

    /// Number of requests that may wait for a busy server
    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::global()
    }
}

fn memory_name<'a>(address: &'a Address) -> Result<&'a str> {
    match address {
        Address::Memory(name) => Ok(name.as_str()),
        other => Err(Error::unsupported_address("memory", other)),
    }
}

#[async_trait::async_trait]
impl<Req, Rep> Transport<Req, Rep> for MemoryTransport
where
    Req: Send + 'static,
    Rep: Send + 'static,
{
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn bind(&self, address: &Address) -> Result<Box<dyn Listener<Req, Rep>>> {
        let name = memory_name(address)?;
        let (tx, rx) = mpsc::channel::<Incoming<Req, Rep>>(self.queue_depth);
        let token = self.registry.register(name, address, tx)?;

        info!(address = %address, "In-process listener bound");

        Ok(Box::new(MemoryListener {
            registry: self.registry.clone(),
            address: address.clone(),
            name: name.to_string(),
            token,
            queue: rx,
            closed: false,
        }))
    }

    async fn connect(&self, address: &Address) -> Result<Box<dyn Connection<Req, Rep>>> {
        let name = memory_name(address)?;
        Ok(Box::new(MemoryConnection {
            registry: self.registry.clone(),
            address: address.clone(),
            name: name.to_string(),
            pending: Pending::Idle,
        }))
    }
}

struct MemoryListener<Req, Rep> {
    registry: Registry,
    address: Address,
    name: String,
    token: u64,
    queue: mpsc::Receiver<Incoming<Req, Rep>>,
    closed: bool,
}

impl<Req, Rep> MemoryListener<Req, Rep> {
    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.queue.close();
            self.registry.unregister(&self.name, self.token);
        }
    }
}

#[async_trait::async_trait]
impl<Req, Rep> Listener<Req, Rep> for MemoryListener<Req, Rep>
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
        self.release();
        debug!(address = %self.address, "In-process listener closed");
        Ok(())
    }
}

impl<Req, Rep> Drop for MemoryListener<Req, Rep> {
    fn drop(&mut self) {
        self.release();
    }
}

enum Pending<Rep> {
    Idle,
    Unroutable,
    Waiting(oneshot::Receiver<Rep>),
}

struct MemoryConnection<Rep> {
    registry: Registry,
    address: Address,
    name: String,
    pending: Pending<Rep>,
}

#[async_trait::async_trait]
impl<Req, Rep> Connection<Req, Rep> for MemoryConnection<Rep>
where
    Req: Send + 'static,
    Rep: Send + 'static,
{
    fn remote_address(&self) -> &Address {
        &self.address
    }

    async fn send(&mut self, message: Req) -> Result<()> {
        // Resolved on every send so a server bound later is picked up.
        let Some(queue) = self.registry.lookup::<Incoming<Req, Rep>>(&self.name)? else {
            debug!(address = %self.address, "No in-process server bound");
            self.pending = Pending::Unroutable;
            return Ok(());
        };

        let (responder, reply) = Responder::channel();
        match queue.send(Incoming::new(message, responder)).await {
            Ok(()) => self.pending = Pending::Waiting(reply),
            Err(_) => {
                debug!(address = %self.address, "In-process server went away");
                self.pending = Pending::Unroutable;
            }
        }
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Rep> {
        match std::mem::replace(&mut self.pending, Pending::Idle) {
            Pending::Waiting(reply) => match tokio::time::timeout(timeout, reply).await {
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err(_)) => Err(Error::ConnectionClosed),
                Err(_) => Err(Error::Timeout),
            },
            Pending::Unroutable => {
                tokio::time::sleep(timeout).await;
                Err(Error::Timeout)
            }
            Pending::Idle => Err(Error::custom("receive called with no request outstanding")),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.pending = Pending::Idle;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Pair = (Box<dyn Listener<String, String>>, Box<dyn Connection<String, String>>);

    async fn pair(transport: &MemoryTransport, name: &str) -> Pair {
        let address = Address::memory(name).unwrap();
        let listener = Transport::<String, String>::bind(transport, &address)
            .await
            .unwrap();
        let connection = Transport::<String, String>::connect(transport, &address)
            .await
            .unwrap();
        (listener, connection)
    }

    #[tokio::test]
    async fn request_reaches_listener_and_reply_returns() {
        let transport = MemoryTransport::isolated();
        let (mut listener, mut connection) = pair(&transport, "echo").await;

        tokio::spawn(async move {
            let incoming = listener.receive().await.unwrap();
            let echoed = incoming.message().clone();
            incoming.reply(echoed).unwrap();
        });

        connection.send("hello".to_string()).await.unwrap();
        let reply = connection.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply, "hello");
    }

    #[tokio::test]
    async fn second_bind_is_rejected() {
        let transport = MemoryTransport::isolated();
        let address = Address::memory("taken").unwrap();
        let _first = Transport::<u8, u8>::bind(&transport, &address).await.unwrap();

        match Transport::<u8, u8>::bind(&transport, &address).await {
            Err(Error::AddressInUse(addr)) => assert_eq!(addr, address),
            Err(e) => panic!("Expected AddressInUse, got {:?}", e),
            Ok(_) => panic!("Expected AddressInUse, got a listener"),
        }
    }

    #[tokio::test]
    async fn close_and_drop_unregister() {
        let transport = MemoryTransport::isolated();
        let address = Address::memory("short-lived").unwrap();

        let mut listener = Transport::<u8, u8>::bind(&transport, &address).await.unwrap();
        assert!(transport.registry().contains("short-lived"));
        listener.close().await.unwrap();
        assert!(transport.registry().is_empty());

        let listener = Transport::<u8, u8>::bind(&transport, &address).await.unwrap();
        assert_eq!(transport.registry().len(), 1);
        drop(listener);
        assert!(transport.registry().is_empty());
    }

    #[tokio::test]
    async fn unbound_name_times_out() {
        let transport = MemoryTransport::isolated();
        let address = Address::memory("nobody").unwrap();
        let mut connection = Transport::<u8, u8>::connect(&transport, &address)
            .await
            .unwrap();

        connection.send(1).await.unwrap();
        let started = tokio::time::Instant::now();
        let result = connection.receive(Duration::from_millis(100)).await;
        assert!(matches!(result, Err(Error::Timeout)));
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn lookup_is_not_cached() {
        let transport = MemoryTransport::isolated();
        let address = Address::memory("late").unwrap();
        let mut connection = Transport::<u8, u8>::connect(&transport, &address)
            .await
            .unwrap();

        connection.send(1).await.unwrap();
        assert!(connection.receive(Duration::from_millis(20)).await.is_err());

        let mut listener = Transport::<u8, u8>::bind(&transport, &address).await.unwrap();
        tokio::spawn(async move {
            let incoming = listener.receive().await.unwrap();
            let value = *incoming.message();
            incoming.reply(value + 1).unwrap();
        });

        connection.send(41).await.unwrap();
        assert_eq!(connection.receive(Duration::from_secs(1)).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn mismatched_message_types_are_reported() {
        let transport = MemoryTransport::isolated();
        let address = Address::memory("typed").unwrap();
        let _listener = Transport::<u8, u8>::bind(&transport, &address).await.unwrap();

        let mut connection = Transport::<String, u8>::connect(&transport, &address)
            .await
            .unwrap();
        assert!(matches!(
            connection.send("wrong".to_string()).await,
            Err(Error::Custom(_))
        ));
    }

    #[tokio::test]
    async fn wrong_address_kind_is_invalid() {
        let transport = MemoryTransport::isolated();
        let address = Address::parse("tcp://127.0.0.1:1").unwrap();
        assert!(matches!(
            Transport::<u8, u8>::connect(&transport, &address).await,
            Err(Error::InvalidAddress(_))
        ));
    }
}
