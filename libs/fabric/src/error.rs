use tether_core::Address;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Timed out waiting for a reply")]
    Timeout,

    #[error("Address already in use: {0}")]
    AddressInUse(Address),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("{0}")]
    Custom(String),
}

impl Error {
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }

    /// The transport cannot serve this kind of address
    pub fn unsupported_address(transport: &str, address: &Address) -> Self {
        Self::InvalidAddress(format!(
            "{} transport cannot use {} address {}",
            transport,
            address.kind(),
            address
        ))
    }

    /// Map a bind failure, turning `AddrInUse` into [`Error::AddressInUse`]
    pub(crate) fn bind(err: std::io::Error, address: &Address) -> Self {
        if err.kind() == std::io::ErrorKind::AddrInUse {
            Self::AddressInUse(address.clone())
        } else {
            Self::Io(err)
        }
    }
}

impl From<tether_core::Error> for Error {
    fn from(err: tether_core::Error) -> Self {
        match err {
            tether_core::Error::InvalidAddress(msg) => Self::InvalidAddress(msg),
            tether_core::Error::Custom(msg) => Self::Custom(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
