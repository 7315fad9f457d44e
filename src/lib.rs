//! MConn peer transport: filtered, authenticated, multiplexed TCP connections.

pub mod config;
pub mod error;
pub mod logging;
pub mod network;
pub mod shutdown;

pub use error::{RejectReason, RejectedError, StreamError, TransportError};
pub use network::conn_set::{ConnectionSet, RawConnId};
pub use network::connection::Connection;
pub use network::endpoint::{Endpoint, MCONN_PROTOCOL};
pub use network::filter::{ConnFilter, ConnectionRateFilter, DuplicateIpFilter, IpBlocklistFilter};
pub use network::mconnection::{ChannelDescriptor, MConnConfig};
pub use network::node_info::{NodeId, NodeInfo};
pub use network::node_key::NodeKey;
pub use network::stream::Stream;
pub use network::transport::{Transport, TransportOptions};
