use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

use crate::config::ConfigError;
use crate::network::endpoint::EndpointError;
use crate::network::node_info::NodeId;
use crate::network::node_key::NodeKeyError;

/// Why a connection was turned away during filtering or handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    Duplicate,
    Filtered,
    SelfConnect,
    Incompatible,
    InvalidNodeInfo,
    AuthFailure,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::Duplicate => "duplicate connection",
            RejectReason::Filtered => "filtered",
            RejectReason::SelfConnect => "self connection",
            RejectReason::Incompatible => "incompatible peer",
            RejectReason::InvalidNodeInfo => "invalid node info",
            RejectReason::AuthFailure => "authentication failure",
        };
        f.write_str(s)
    }
}

/// A connection rejected before it was handed to the caller.
///
/// The classification is kept so the router can decide whether to ban, retry
/// or ignore the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedError {
    reason: RejectReason,
    addr: Option<SocketAddr>,
    node_id: Option<NodeId>,
    cause: Option<String>,
}

impl RejectedError {
    pub fn new(reason: RejectReason) -> Self {
        Self {
            reason,
            addr: None,
            node_id: None,
            cause: None,
        }
    }

    pub fn duplicate(addr: SocketAddr) -> Self {
        Self::new(RejectReason::Duplicate).with_addr(addr)
    }

    pub fn filtered(addr: SocketAddr, cause: impl fmt::Display) -> Self {
        Self::new(RejectReason::Filtered)
            .with_addr(addr)
            .with_cause(cause)
    }

    pub fn auth_failure(addr: SocketAddr, cause: impl fmt::Display) -> Self {
        Self::new(RejectReason::AuthFailure)
            .with_addr(addr)
            .with_cause(cause)
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = Some(addr);
        self
    }

    pub fn with_node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    pub fn reason(&self) -> RejectReason {
        self.reason
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn node_id(&self) -> Option<&NodeId> {
        self.node_id.as_ref()
    }

    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }

    pub fn is_duplicate(&self) -> bool {
        self.reason == RejectReason::Duplicate
    }

    pub fn is_filtered(&self) -> bool {
        self.reason == RejectReason::Filtered
    }

    pub fn is_self(&self) -> bool {
        self.reason == RejectReason::SelfConnect
    }

    pub fn is_incompatible(&self) -> bool {
        self.reason == RejectReason::Incompatible
    }

    pub fn is_node_info_invalid(&self) -> bool {
        self.reason == RejectReason::InvalidNodeInfo
    }

    pub fn is_auth_failure(&self) -> bool {
        self.reason == RejectReason::AuthFailure
    }
}

impl fmt::Display for RejectedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)?;
        if let Some(addr) = self.addr {
            write!(f, " from {}", addr)?;
        }
        if let Some(ref id) = self.node_id {
            write!(f, " (node {})", id)?;
        }
        if let Some(ref cause) = self.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for RejectedError {}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection rejected: {0}")]
    Rejected(#[from] RejectedError),

    #[error("connection filters timed out")]
    FilterTimeout,

    #[error("transport has been closed")]
    TransportClosed,

    #[error("transport is already listening")]
    AlreadyListening,

    #[error("no channel descriptors configured")]
    NoChannels,

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(#[from] EndpointError),

    #[error("unknown channel {0:#04x}")]
    UnknownChannel(u16),

    #[error("dial to {0} timed out")]
    DialTimeout(SocketAddr),

    #[error("operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// The rejection carried by this error, if any.
    pub fn as_rejected(&self) -> Option<&RejectedError> {
        match self {
            TransportError::Rejected(r) => Some(r),
            _ => None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream {0:#04x} is closed")]
    Closed(u8),

    #[error("short buffer: message needs {needed} bytes, buffer has {available}")]
    ShortBuffer { needed: usize, available: usize },

    #[error("send failed on stream {0:#04x}")]
    SendFailed(u8),
}

impl StreamError {
    /// End-of-stream, as opposed to a failure on a live stream.
    pub fn is_eof(&self) -> bool {
        matches!(self, StreamError::Closed(_))
    }
}

/// Top-level daemon errors.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Node key error: {0}")]
    NodeKey(#[from] NodeKeyError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_display_includes_context() {
        let addr: SocketAddr = "10.0.0.1:26656".parse().unwrap();
        let err = RejectedError::filtered(addr, "blocked by acl");
        assert!(err.is_filtered());
        assert!(!err.is_duplicate());
        assert_eq!(err.to_string(), "filtered from 10.0.0.1:26656: blocked by acl");
    }

    #[test]
    fn test_transport_error_exposes_rejection() {
        let addr: SocketAddr = "10.0.0.1:26656".parse().unwrap();
        let err = TransportError::from(RejectedError::duplicate(addr));
        assert!(err.as_rejected().is_some_and(|r| r.is_duplicate()));
        assert!(TransportError::FilterTimeout.as_rejected().is_none());
    }

    #[test]
    fn test_stream_error_eof() {
        assert!(StreamError::Closed(1).is_eof());
        assert!(!StreamError::SendFailed(1).is_eof());
    }
}
