//! An authenticated, multiplexed peer connection.
//!
//! Handshake order: secret connection, concurrent node-info exchange,
//! node-info validation, identity checks (expected id, self, compatibility),
//! then one stream per channel and the multiplexer start. Everything up to the
//! identity checks runs under the handshake timeout.

use async_trait::async_trait;
use bytes::Bytes;
use ed25519_dalek::VerifyingKey;
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::OwnedSemaphorePermit;

use crate::error::{RejectReason, RejectedError, TransportError};
use crate::network::conn_set::ConnectionSet;
use crate::network::endpoint::{Endpoint, MCONN_PROTOCOL};
use crate::network::mconnection::{
    ChannelDescriptor, MConnConfig, MConnError, MConnHandler, MConnection,
};
use crate::network::node_info::{NodeId, NodeInfo, MAX_NODE_INFO_SIZE};
use crate::network::node_key::NodeKey;
use crate::network::secret_connection::{SecretConnection, SecretConnectionError};
use crate::network::stream::Stream;

/// Everything a handshake needs to know about the local node.
#[derive(Clone)]
pub(crate) struct HandshakeSetup {
    pub node_key: NodeKey,
    pub node_info: NodeInfo,
    pub channel_descs: Vec<ChannelDescriptor>,
    pub mconn_config: MConnConfig,
    pub timeout: Duration,
}

struct Inner {
    peer_info: NodeInfo,
    local_id: NodeId,
    public_key: VerifyingKey,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    mconn: MConnection,
    streams: HashMap<u8, Stream>,
    conns: Arc<ConnectionSet>,
    closed: AtomicBool,
    /// Slot in the transport's incoming connection limit, if any.
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl Inner {
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(peer = %self.peer_info.id(), addr = %self.remote_addr, "Closing connection");
        self.conns.remove_addr(self.remote_addr);
        self.mconn.stop();
        for stream in self.streams.values() {
            stream.close();
        }
        self.permit.lock().take();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.close();
    }
}

/// Routes multiplexer callbacks back to the owning connection.
struct ConnHandler {
    inner: Weak<Inner>,
}

#[async_trait]
impl MConnHandler for ConnHandler {
    async fn on_receive(&self, channel_id: u8, data: Bytes, eof: bool) -> Result<(), MConnError> {
        let stream = self
            .inner
            .upgrade()
            .ok_or(MConnError::Stopped)?
            .streams
            .get(&channel_id)
            .cloned()
            .ok_or(MConnError::UnknownChannel(channel_id))?;
        stream
            .receive(data, eof)
            .await
            .map_err(|e| MConnError::Receive(Box::new(e)))
    }

    fn on_error(&self, err: MConnError) {
        match self.inner.upgrade() {
            Some(inner) => {
                tracing::error!(peer = %inner.peer_info.id(), error = %err, "Connection failure");
                inner.close();
            }
            None => tracing::debug!(error = %err, "Error on dropped connection"),
        }
    }
}

#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Runs the full handshake over `tcp`. Panics raised while building the
    /// connection surface as authentication failures.
    pub(crate) async fn handshake(
        tcp: TcpStream,
        setup: &HandshakeSetup,
        conns: Arc<ConnectionSet>,
        expected_peer: Option<&NodeId>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<Connection, RejectedError> {
        let remote = tcp.peer_addr().ok();
        let attempt = Self::establish(tcp, setup, conns, expected_peer, permit);

        match AssertUnwindSafe(attempt).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(addr = ?remote, panic = %msg, "Recovered from panic during handshake");
                let err = RejectedError::new(RejectReason::AuthFailure)
                    .with_cause(format!("recovered from panic: {}", msg));
                Err(match remote {
                    Some(addr) => err.with_addr(addr),
                    None => err,
                })
            }
        }
    }

    async fn establish(
        tcp: TcpStream,
        setup: &HandshakeSetup,
        conns: Arc<ConnectionSet>,
        expected_peer: Option<&NodeId>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<Connection, RejectedError> {
        let remote = tcp
            .peer_addr()
            .map_err(|e| RejectedError::new(RejectReason::AuthFailure).with_cause(e))?;

        let verified = tokio::time::timeout(setup.timeout, async {
            let mut secret = SecretConnection::make(tcp, &setup.node_key)
                .await
                .map_err(|e| RejectedError::auth_failure(remote, format!("secret conn failed: {}", e)))?;

            let peer_info = exchange_node_info(&mut secret, &setup.node_info)
                .await
                .map_err(|e| RejectedError::auth_failure(remote, format!("handshake failed: {}", e)))?;

            peer_info.validate().map_err(|e| {
                RejectedError::new(RejectReason::InvalidNodeInfo)
                    .with_addr(remote)
                    .with_cause(e)
            })?;

            let peer_id = NodeId::from_public_key(secret.remote_pubkey());
            if let Some(expected) = expected_peer {
                if &peer_id != expected {
                    return Err(RejectedError::auth_failure(
                        remote,
                        format!("peer id {} does not match dialed id {}", peer_id, expected),
                    )
                    .with_node_id(peer_id));
                }
            }

            if peer_info.id() == setup.node_info.id() {
                return Err(RejectedError::new(RejectReason::SelfConnect)
                    .with_addr(remote)
                    .with_node_id(peer_info.id().clone()));
            }

            setup.node_info.compatible_with(&peer_info).map_err(|e| {
                RejectedError::new(RejectReason::Incompatible)
                    .with_addr(remote)
                    .with_node_id(peer_info.id().clone())
                    .with_cause(e)
            })?;

            Ok::<_, RejectedError>((secret, peer_info))
        })
        .await
        .map_err(|_| RejectedError::auth_failure(remote, "handshake timed out"))?;
        let (secret, peer_info) = verified?;

        let public_key = *secret.remote_pubkey();
        let local_addr = secret.local_addr();
        let mconn = MConnection::new(secret, &setup.channel_descs, setup.mconn_config.clone());
        let streams = setup
            .channel_descs
            .iter()
            .map(|desc| (desc.id, Stream::new(desc.id, mconn.sender())))
            .collect();

        let inner = Arc::new(Inner {
            peer_info,
            local_id: setup.node_info.id().clone(),
            public_key,
            local_addr,
            remote_addr: remote,
            mconn,
            streams,
            conns,
            closed: AtomicBool::new(false),
            permit: Mutex::new(permit),
        });

        let handler = Arc::new(ConnHandler {
            inner: Arc::downgrade(&inner),
        });
        inner.mconn.start(handler).map_err(|e| {
            RejectedError::auth_failure(remote, format!("mconn failed: {}", e))
        })?;

        tracing::debug!(peer = %inner.peer_info.id(), addr = %remote, "Connection established");
        Ok(Connection { inner })
    }

    /// The peer's validated node info.
    pub fn node_info(&self) -> &NodeInfo {
        &self.inner.peer_info
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.inner.public_key
    }

    pub fn local_endpoint(&self) -> Endpoint {
        Endpoint::from_socket_addr(self.inner.local_addr).with_peer_id(self.inner.local_id.clone())
    }

    pub fn remote_endpoint(&self) -> Endpoint {
        Endpoint::from_socket_addr(self.inner.remote_addr)
            .with_peer_id(self.inner.peer_info.id().clone())
    }

    /// The stream for a configured channel.
    pub fn stream(&self, id: u16) -> Result<Stream, TransportError> {
        u8::try_from(id)
            .ok()
            .and_then(|id| self.inner.streams.get(&id))
            .cloned()
            .ok_or(TransportError::UnknownChannel(id))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stops the multiplexer, closes every stream and deregisters the remote
    /// address. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("protocol", &MCONN_PROTOCOL)
            .field("peer", self.inner.peer_info.id())
            .field("remote", &self.inner.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Writes our node info while reading the peer's; fails as soon as either side does.
async fn exchange_node_info(
    secret: &mut SecretConnection,
    ours: &NodeInfo,
) -> Result<NodeInfo, SecretConnectionError> {
    let (reader, writer) = secret.halves_mut();
    let ((), theirs) = tokio::try_join!(
        writer.write_msg(ours, MAX_NODE_INFO_SIZE),
        reader.read_msg::<NodeInfo>(MAX_NODE_INFO_SIZE),
    )?;
    Ok(theirs)
}
