use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Errors parsing an endpoint address.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("unsupported endpoint scheme in {0:?} (expected ipc:// or tcp://)")]
    UnknownScheme(String),
    #[error("invalid tcp address {0:?}")]
    InvalidTcp(String),
    #[error("empty socket path in {0:?}")]
    EmptyPath(String),
}

/// Where a backend channel listens.
///
/// Written as `ipc:///path/to/socket` for Unix domain sockets and
/// `tcp://127.0.0.1:4000` for loopback TCP.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Ipc(PathBuf),
    Tcp(SocketAddr),
}

impl Endpoint {
    pub const IPC_SCHEME: &'static str = "ipc://";
    pub const TCP_SCHEME: &'static str = "tcp://";
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Ipc(path) => write!(f, "{}{}", Self::IPC_SCHEME, path.display()),
            Endpoint::Tcp(addr) => write!(f, "{}{addr}", Self::TCP_SCHEME),
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix(Self::IPC_SCHEME) {
            if path.is_empty() {
                return Err(EndpointError::EmptyPath(s.to_string()));
            }
            Ok(Endpoint::Ipc(PathBuf::from(path)))
        } else if let Some(addr) = s.strip_prefix(Self::TCP_SCHEME) {
            addr.parse()
                .map(Endpoint::Tcp)
                .map_err(|_| EndpointError::InvalidTcp(s.to_string()))
        } else {
            Err(EndpointError::UnknownScheme(s.to_string()))
        }
    }
}

impl Serialize for Endpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
