//! Transport endpoints.
//!
//! String form: `protocol://[peerID@]IP:port[/path]`. IPv6 addresses are
//! bracketed. Host names are not resolved here; the IP must be literal.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

use crate::network::node_info::{NodeId, NodeInfoError};

/// Protocol identifier served by this transport.
pub const MCONN_PROTOCOL: &str = "mconn";

/// Port used when an endpoint leaves it unset.
pub const DEFAULT_PORT: u16 = 26657;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    #[error("unsupported protocol {0:?}")]
    UnsupportedProtocol(String),

    #[error("endpoint must have an IP address")]
    MissingIp,

    #[error("endpoint cannot have path (got {0:?})")]
    HasPath(String),

    #[error("invalid endpoint {0:?}")]
    InvalidFormat(String),

    #[error("invalid port {0:?}")]
    InvalidPort(String),

    #[error("invalid peer ID: {0}")]
    InvalidPeerId(#[from] NodeInfoError),
}

/// Where to listen or dial.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Endpoint {
    pub protocol: String,
    pub peer_id: Option<NodeId>,
    pub ip: Option<IpAddr>,
    pub port: u16,
    /// Includes the leading `/` when present.
    pub path: String,
}

impl Endpoint {
    /// An `mconn` endpoint for a socket address.
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self {
            protocol: MCONN_PROTOCOL.to_string(),
            peer_id: None,
            ip: Some(addr.ip()),
            port: addr.port(),
            path: String::new(),
        }
    }

    pub fn with_peer_id(mut self, peer_id: NodeId) -> Self {
        self.peer_id = Some(peer_id);
        self
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ip.map(|ip| SocketAddr::new(ip, self.port))
    }

    /// Validates the endpoint for this transport and fills in defaults.
    ///
    /// Normalizing an already normalized endpoint returns it unchanged.
    pub fn normalize(&self) -> Result<Endpoint, EndpointError> {
        let mut endpoint = self.clone();
        if endpoint.protocol.is_empty() {
            endpoint.protocol = MCONN_PROTOCOL.to_string();
        }
        if endpoint.protocol != MCONN_PROTOCOL {
            return Err(EndpointError::UnsupportedProtocol(endpoint.protocol));
        }
        if endpoint.ip.is_none() {
            return Err(EndpointError::MissingIp);
        }
        if !endpoint.path.is_empty() {
            return Err(EndpointError::HasPath(endpoint.path));
        }
        if endpoint.port == 0 {
            endpoint.port = DEFAULT_PORT;
        }
        Ok(endpoint)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.protocol.is_empty() {
            write!(f, "{}://", self.protocol)?;
        }
        if let Some(ref id) = self.peer_id {
            write!(f, "{}@", id)?;
        }
        match self.ip {
            Some(IpAddr::V6(ip)) => write!(f, "[{}]", ip)?,
            Some(IpAddr::V4(ip)) => write!(f, "{}", ip)?,
            None => {}
        }
        if self.port != 0 {
            write!(f, ":{}", self.port)?;
        }
        f.write_str(&self.path)
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || EndpointError::InvalidFormat(s.to_string());

        let (protocol, rest) = match s.split_once("://") {
            Some((proto, rest)) => {
                if proto.is_empty() {
                    return Err(invalid());
                }
                (proto.to_string(), rest)
            }
            None => (String::new(), s),
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], rest[idx..].to_string()),
            None => (rest, String::new()),
        };

        let (peer_id, host_port) = match authority.split_once('@') {
            Some((id, hp)) => (Some(id.parse::<NodeId>()?), hp),
            None => (None, authority),
        };

        let (host, port) = if let Some(bracketed) = host_port.strip_prefix('[') {
            let (host, after) = bracketed.split_once(']').ok_or_else(invalid)?;
            let port = match after {
                "" => None,
                p => Some(p.strip_prefix(':').ok_or_else(invalid)?),
            };
            (host, port)
        } else {
            match host_port.rsplit_once(':') {
                // A bare IPv6 address without brackets has no port.
                Some((h, _)) if h.contains(':') => (host_port, None),
                Some((h, p)) => (h, Some(p)),
                None => (host_port, None),
            }
        };

        let ip = if host.is_empty() {
            None
        } else {
            Some(host.parse::<IpAddr>().map_err(|_| invalid())?)
        };
        let port = match port {
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| EndpointError::InvalidPort(p.to_string()))?,
            None => 0,
        };

        Ok(Endpoint {
            protocol,
            peer_id,
            ip,
            port,
            path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: &str = "00112233445566778899aabbccddeeff00112233";

    #[test]
    fn test_parse_full_endpoint() {
        let ep: Endpoint = format!("mconn://{}@127.0.0.1:26656", PEER).parse().unwrap();
        assert_eq!(ep.protocol, "mconn");
        assert_eq!(ep.peer_id.as_ref().map(|id| id.as_str()), Some(PEER));
        assert_eq!(ep.ip, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(ep.port, 26656);
        assert!(ep.path.is_empty());
        assert_eq!(ep.to_string(), format!("mconn://{}@127.0.0.1:26656", PEER));
    }

    #[test]
    fn test_parse_ipv6_and_path() {
        let ep: Endpoint = "mconn://[::1]:9000/ws".parse().unwrap();
        assert_eq!(ep.ip, Some("::1".parse().unwrap()));
        assert_eq!(ep.port, 9000);
        assert_eq!(ep.path, "/ws");
        assert_eq!(ep.to_string(), "mconn://[::1]:9000/ws");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("mconn://localhost:80".parse::<Endpoint>().is_err());
        assert!("mconn://1.2.3.4:notaport".parse::<Endpoint>().is_err());
        assert!("mconn://badid@1.2.3.4:1".parse::<Endpoint>().is_err());
        assert!("://1.2.3.4:1".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_normalize_fills_defaults() {
        let ep: Endpoint = "10.0.0.5".parse().unwrap();
        let normalized = ep.normalize().unwrap();
        assert_eq!(normalized.protocol, MCONN_PROTOCOL);
        assert_eq!(normalized.port, DEFAULT_PORT);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let with_peer = format!("{}@192.168.1.1:0", PEER);
        for s in [
            "10.0.0.5",
            "mconn://10.0.0.5:1234",
            "[fe80::1]",
            with_peer.as_str(),
        ] {
            let once = s.parse::<Endpoint>().unwrap().normalize().unwrap();
            let twice = once.normalize().unwrap();
            assert_eq!(once, twice, "normalize not idempotent for {}", s);
        }
    }

    #[test]
    fn test_normalize_rejections() {
        let wrong_proto: Endpoint = "tcp://10.0.0.5:1".parse().unwrap();
        assert_eq!(
            wrong_proto.normalize(),
            Err(EndpointError::UnsupportedProtocol("tcp".to_string()))
        );

        let no_ip: Endpoint = "mconn://:1".parse().unwrap();
        assert_eq!(no_ip.normalize(), Err(EndpointError::MissingIp));

        let with_path: Endpoint = "mconn://10.0.0.5:1/x".parse().unwrap();
        assert_eq!(
            with_path.normalize(),
            Err(EndpointError::HasPath("/x".to_string()))
        );
    }
}
