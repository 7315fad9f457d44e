//! Node identity descriptors exchanged during the connection handshake.

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum serialized size of a NodeInfo accepted from a peer.
pub const MAX_NODE_INFO_SIZE: usize = 10 * 1024;

/// Maximum number of channels a node may advertise.
pub const MAX_NUM_CHANNELS: usize = 16;

/// Length in bytes of the address a NodeId encodes.
pub const NODE_ID_BYTE_LENGTH: usize = 20;

/// Protocol versions advertised by this implementation.
pub const P2P_PROTOCOL_VERSION: u64 = 8;
pub const BLOCK_PROTOCOL_VERSION: u64 = 11;

const MAX_MONIKER_LEN: usize = 128;
const MAX_VERSION_LEN: usize = 64;
const MAX_RPC_ADDRESS_LEN: usize = 256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeInfoError {
    #[error("invalid node ID {0:?}: expected {len} lowercase hex characters", len = NODE_ID_BYTE_LENGTH * 2)]
    InvalidNodeId(String),

    #[error("invalid listen address {0:?}")]
    InvalidListenAddr(String),

    #[error("{field} is not printable ASCII or longer than {max} bytes")]
    InvalidText { field: &'static str, max: usize },

    #[error("moniker cannot be empty")]
    EmptyMoniker,

    #[error("too many channels: {0} (max {max})", max = MAX_NUM_CHANNELS)]
    TooManyChannels(usize),

    #[error("duplicate channel {0:#04x}")]
    DuplicateChannel(u8),

    #[error("invalid tx_index {0:?}: must be \"\", \"on\" or \"off\"")]
    InvalidTxIndex(String),

    #[error("peer is on a different block version: got {theirs}, expected {ours}")]
    BlockVersionMismatch { ours: u64, theirs: u64 },

    #[error("peer is on a different network: got {theirs:?}, expected {ours:?}")]
    NetworkMismatch { ours: String, theirs: String },

    #[error("peer has no common channels: ours {ours:?}, theirs {theirs:?}")]
    NoCommonChannels { ours: Vec<u8>, theirs: Vec<u8> },
}

/// Peer identity: hex encoded address derived from the node's public key.
///
/// Parsing checks the format. Ids decoded off the wire are not checked until
/// [`NodeInfo::validate`].
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Derives the identity bound to an ed25519 public key.
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        NodeId(hex::encode(&digest[..NODE_ID_BYTE_LENGTH]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl FromStr for NodeId {
    type Err = NodeInfoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = s.len() == NODE_ID_BYTE_LENGTH * 2
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(NodeInfoError::InvalidNodeId(s.to_string()));
        }
        Ok(NodeId(s.to_string()))
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub p2p: u64,
    pub block: u64,
    pub app: u64,
}

impl ProtocolVersion {
    pub fn current() -> Self {
        Self {
            p2p: P2P_PROTOCOL_VERSION,
            block: BLOCK_PROTOCOL_VERSION,
            app: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeInfoOther {
    pub tx_index: String,
    pub rpc_address: String,
}

/// Self-declared description of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub protocol_version: ProtocolVersion,
    pub node_id: NodeId,
    pub listen_addr: String,
    /// Chain / network identifier.
    pub network: String,
    pub version: String,
    pub channels: Vec<u8>,
    pub moniker: String,
    pub other: NodeInfoOther,
}

impl NodeInfo {
    pub fn id(&self) -> &NodeId {
        &self.node_id
    }

    /// Structural checks on a descriptor received from a peer.
    pub fn validate(&self) -> Result<(), NodeInfoError> {
        self.node_id.as_str().parse::<NodeId>()?;
        validate_listen_addr(&self.listen_addr)?;
        validate_text("version", &self.version, MAX_VERSION_LEN)?;

        if self.channels.len() > MAX_NUM_CHANNELS {
            return Err(NodeInfoError::TooManyChannels(self.channels.len()));
        }
        let mut seen = HashSet::with_capacity(self.channels.len());
        for &ch in &self.channels {
            if !seen.insert(ch) {
                return Err(NodeInfoError::DuplicateChannel(ch));
            }
        }

        if self.moniker.is_empty() {
            return Err(NodeInfoError::EmptyMoniker);
        }
        validate_text("moniker", &self.moniker, MAX_MONIKER_LEN)?;

        match self.other.tx_index.as_str() {
            "" | "on" | "off" => {}
            other => return Err(NodeInfoError::InvalidTxIndex(other.to_string())),
        }
        validate_text("rpc_address", &self.other.rpc_address, MAX_RPC_ADDRESS_LEN)?;
        Ok(())
    }

    /// Checks that a peer speaks the same protocol on the same network.
    pub fn compatible_with(&self, other: &NodeInfo) -> Result<(), NodeInfoError> {
        if self.protocol_version.block != other.protocol_version.block {
            return Err(NodeInfoError::BlockVersionMismatch {
                ours: self.protocol_version.block,
                theirs: other.protocol_version.block,
            });
        }
        if self.network != other.network {
            return Err(NodeInfoError::NetworkMismatch {
                ours: self.network.clone(),
                theirs: other.network.clone(),
            });
        }

        // A node without channels is only probing.
        if self.channels.is_empty() {
            return Ok(());
        }
        if !self.channels.iter().any(|ch| other.channels.contains(ch)) {
            return Err(NodeInfoError::NoCommonChannels {
                ours: self.channels.clone(),
                theirs: other.channels.clone(),
            });
        }
        Ok(())
    }
}

fn validate_text(field: &'static str, s: &str, max: usize) -> Result<(), NodeInfoError> {
    if s.len() > max || !s.bytes().all(|b| (0x20..0x7f).contains(&b)) {
        return Err(NodeInfoError::InvalidText { field, max });
    }
    Ok(())
}

fn validate_listen_addr(addr: &str) -> Result<(), NodeInfoError> {
    let invalid = || NodeInfoError::InvalidListenAddr(addr.to_string());
    let host_port = addr.split_once("://").map_or(addr, |(_, rest)| rest);
    let (host, port) = host_port.rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() || host.bytes().any(|b| b.is_ascii_whitespace()) {
        return Err(invalid());
    }
    port.parse::<u16>().map_err(|_| invalid())?;
    Ok(())
}
