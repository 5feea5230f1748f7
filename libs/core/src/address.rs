use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

const MEMORY_SCHEME: &str = "mem://";
const TCP_SCHEME: &str = "tcp://";
const UNIX_SCHEME: &str = "unix://";

/// Endpoint a server binds to and a client connects to
///
/// The textual forms are:
///
/// - `name` or `mem://name` for the in-process transport
/// - `tcp://ip:port` (or `tcp://localhost:port`) for TCP
/// - `unix:///absolute/path` for Unix domain sockets
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Memory(String),
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl Address {
    /// Parse an address from its textual form
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();

        if let Some(name) = input.strip_prefix(MEMORY_SCHEME) {
            return Self::memory(name);
        }

        if let Some(rest) = input.strip_prefix(TCP_SCHEME) {
            return parse_socket_addr(rest).map(Address::Tcp);
        }

        if let Some(path) = input.strip_prefix(UNIX_SCHEME) {
            return Self::unix(path);
        }

        if input.contains("://") {
            return Err(Error::invalid_address(format!(
                "unsupported scheme in '{}'",
                input
            )));
        }

        Self::memory(input)
    }

    /// Build an in-process address from a symbolic name
    pub fn memory(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::invalid_address("empty in-process name"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(Error::invalid_address(format!(
                "'{}' is not a valid in-process name",
                name
            )));
        }
        Ok(Address::Memory(name))
    }

    /// Build a Unix socket address; the path must be absolute
    pub fn unix(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_absolute() {
            return Err(Error::invalid_address(format!(
                "unix socket path '{}' must be absolute",
                path.display()
            )));
        }
        Ok(Address::Unix(path.to_path_buf()))
    }

    /// Short name of the address kind, used in logs and errors
    pub fn kind(&self) -> &'static str {
        match self {
            Address::Memory(_) => "memory",
            Address::Tcp(_) => "tcp",
            Address::Unix(_) => "unix",
        }
    }
}

fn parse_socket_addr(rest: &str) -> Result<SocketAddr> {
    if let Some(port) = rest.strip_prefix("localhost:") {
        let port = port
            .parse::<u16>()
            .map_err(|e| Error::invalid_address(format!("bad port in '{}': {}", rest, e)))?;
        return Ok(SocketAddr::from((Ipv4Addr::LOCALHOST, port)));
    }

    rest.parse::<SocketAddr>()
        .map_err(|e| Error::invalid_address(format!("bad socket address '{}': {}", rest, e)))
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Memory(name) => write!(f, "{}{}", MEMORY_SCHEME, name),
            Address::Tcp(addr) => write!(f, "{}{}", TCP_SCHEME, addr),
            Address::Unix(path) => write!(f, "{}{}", UNIX_SCHEME, path.display()),
        }
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Address::parse(s)
    }
}

impl TryFrom<&str> for Address {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Address::parse(value)
    }
}

impl TryFrom<String> for Address {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Address::parse(&value)
    }
}

/// Anything a server or client can be pointed at
///
/// Lets callers pass either a parsed [`Address`] or its textual form.
pub trait IntoAddress {
    fn into_address(self) -> Result<Address>;
}

impl IntoAddress for Address {
    fn into_address(self) -> Result<Address> {
        Ok(self)
    }
}

impl IntoAddress for &Address {
    fn into_address(self) -> Result<Address> {
        Ok(self.clone())
    }
}

impl IntoAddress for &str {
    fn into_address(self) -> Result<Address> {
        Address::parse(self)
    }
}

impl IntoAddress for String {
    fn into_address(self) -> Result<Address> {
        Address::parse(&self)
    }
}

impl IntoAddress for &String {
    fn into_address(self) -> Result<Address> {
        Address::parse(self)
    }
}

impl IntoAddress for SocketAddr {
    fn into_address(self) -> Result<Address> {
        Ok(Address::Tcp(self))
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Tcp(addr)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Address::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_name_is_in_process() {
        assert_eq!(
            Address::parse("node1").unwrap(),
            Address::Memory("node1".to_string())
        );
        assert_eq!(
            Address::parse("mem://node1").unwrap(),
            Address::Memory("node1".to_string())
        );
    }

    #[test]
    fn tcp_uri() {
        let addr = Address::parse("tcp://127.0.0.1:12345").unwrap();
        assert_eq!(addr, Address::Tcp("127.0.0.1:12345".parse().unwrap()));
        assert_eq!(addr.to_string(), "tcp://127.0.0.1:12345");

        let local = Address::parse("tcp://localhost:9000").unwrap();
        assert_eq!(local, Address::Tcp("127.0.0.1:9000".parse().unwrap()));
    }

    #[test]
    fn unix_uri_requires_absolute_path() {
        assert_eq!(
            Address::parse("unix:///tmp/tether.sock").unwrap(),
            Address::Unix(PathBuf::from("/tmp/tether.sock"))
        );
        assert!(Address::parse("unix://relative.sock").is_err());
    }

    #[test]
    fn malformed_addresses_are_rejected() {
        for bad in ["", "mem://", "tcp://nowhere", "tcp://127.0.0.1", "zmq://x", "has space"] {
            match Address::parse(bad) {
                Err(Error::InvalidAddress(_)) => {}
                other => panic!("expected InvalidAddress for {:?}, got {:?}", bad, other),
            }
        }
    }

    #[test]
    fn display_parses_back() {
        for raw in ["mem://a.b-c_d", "tcp://[::1]:80", "unix:///var/run/x.sock"] {
            let addr = Address::parse(raw).unwrap();
            assert_eq!(addr.to_string(), raw);
            assert_eq!(addr.to_string().parse::<Address>().unwrap(), addr);
        }
    }
}
