//! Tether Core - Shared types for the tether RPC layer
//!
//! Holds the endpoint [`Address`] and the request/reply envelopes that
//! every transport carries.

pub mod address;
pub mod error;
pub mod message;

pub use address::{Address, IntoAddress};
pub use error::{Error, Result};
pub use message::{CallId, Outcome, Reply, Request};
