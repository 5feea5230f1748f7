//! Tether Fabric - Request/reply transports and codecs
//!
//! Provides the transport abstraction used by the RPC layer, with an
//! in-process implementation and stream-socket implementations (TCP, Unix)
//! that carry codec-encoded, length-prefixed frames.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use tether_core::Address;
//! use tether_fabric::transport::{Connection, Listener, TcpTransport, Transport};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = TcpTransport::new();
//! let address = Address::parse("tcp://127.0.0.1:0")?;
//!
//! let mut listener = Transport::<String, String>::bind(&transport, &address).await?;
//! let bound = listener.local_address().clone();
//! tokio::spawn(async move {
//!     while let Ok(incoming) = listener.receive().await {
//!         let echo = incoming.message().clone();
//!         let _ = incoming.reply(echo);
//!     }
//! });
//!
//! let mut connection = Transport::<String, String>::connect(&transport, &bound).await?;
//! connection.send("hello".to_string()).await?;
//! assert_eq!(connection.receive(Duration::from_secs(1)).await?, "hello");
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod error;
pub mod framed;
pub mod transport;

// Re-exports for convenience
pub use error::{Error, Result};
pub use framed::Framed;
pub use transport::{Connection, Incoming, Listener, Responder, Transport};
