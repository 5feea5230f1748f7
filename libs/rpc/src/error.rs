use std::time::Duration;

use tether_core::Address;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RpcError {
    /// No reply before the deadline: no server, a slow server, or a server
    /// that went away mid-call
    #[error("Call to {address} timed out after {after:?}")]
    Timeout { address: Address, after: Duration },

    #[error("Could not bind {address}: {source}")]
    Bind {
        address: Address,
        #[source]
        source: tether_fabric::Error,
    },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// The handler ran and failed; carries its message
    #[error("Handler failed: {0}")]
    Remote(String),

    #[error("Transport error: {0}")]
    Transport(tether_fabric::Error),
}

impl RpcError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }
}

impl From<tether_fabric::Error> for RpcError {
    fn from(err: tether_fabric::Error) -> Self {
        match err {
            tether_fabric::Error::InvalidAddress(msg) => RpcError::InvalidAddress(msg),
            other => RpcError::Transport(other),
        }
    }
}

impl From<tether_core::Error> for RpcError {
    fn from(err: tether_core::Error) -> Self {
        match err {
            tether_core::Error::InvalidAddress(msg) => RpcError::InvalidAddress(msg),
            other => RpcError::Transport(other.into()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;

/// Failure reported by a request handler
///
/// Sent back to the caller, who sees it as [`RpcError::Remote`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<String> for HandlerError {
    fn from(msg: String) -> Self {
        Self(msg)
    }
}

impl From<&str> for HandlerError {
    fn from(msg: &str) -> Self {
        Self(msg.to_string())
    }
}
