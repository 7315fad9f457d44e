//! TCP transport producing multiplexed connections.
//!
//! Inbound sockets are accepted in a dedicated task and each one is filtered
//! and handshaken in its own task, so a slow peer never blocks the next
//! accept. Results are handed to `accept` callers over a channel that races
//! against the transport's close signal.

use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::network::conn_set::{ConnectionSet, RawConnId};
use crate::network::connection::{Connection, HandshakeSetup};
use crate::network::endpoint::{Endpoint, EndpointError, MCONN_PROTOCOL};
use crate::network::filter::{filter_conn, ConnFilter};
use crate::network::mconnection::{ChannelDescriptor, MConnConfig};
use crate::network::node_info::NodeInfo;
use crate::network::node_key::NodeKey;

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_FILTER_TIMEOUT: Duration = Duration::from_secs(5);

type AcceptResult = Result<Connection, TransportError>;

/// Tuning knobs for a [`Transport`].
#[derive(Clone)]
pub struct TransportOptions {
    /// 0 means unlimited.
    pub max_incoming_connections: usize,
    pub filter_timeout: Duration,
    pub conn_filters: Vec<Arc<dyn ConnFilter>>,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            max_incoming_connections: 0,
            filter_timeout: DEFAULT_FILTER_TIMEOUT,
            conn_filters: Vec::new(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl TransportOptions {
    pub fn with_max_incoming_connections(mut self, max: usize) -> Self {
        self.max_incoming_connections = max;
        self
    }

    pub fn with_filter_timeout(mut self, timeout: Duration) -> Self {
        self.filter_timeout = timeout;
        self
    }

    pub fn with_conn_filters(mut self, filters: Vec<Arc<dyn ConnFilter>>) -> Self {
        self.conn_filters = filters;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

/// State shared with the accept loop and its per-socket workers.
struct Acceptor {
    setup: HandshakeSetup,
    conns: Arc<ConnectionSet>,
    filters: Vec<Arc<dyn ConnFilter>>,
    filter_timeout: Duration,
    limiter: Option<Arc<Semaphore>>,
    results: mpsc::Sender<AcceptResult>,
    close: CancellationToken,
}

impl Acceptor {
    async fn run(self: Arc<Self>, listener: TcpListener) {
        loop {
            let permit = match self.limiter.clone() {
                Some(limiter) => tokio::select! {
                    _ = self.close.cancelled() => return,
                    permit = limiter.acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => return,
                    },
                },
                None => None,
            };

            let accepted = tokio::select! {
                _ = self.close.cancelled() => return,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((tcp, addr)) => {
                    tracing::debug!(peer = %addr, "Accepted inbound connection");
                    tokio::spawn(self.clone().handle_inbound(tcp, permit));
                }
                Err(e) => {
                    tracing::error!(error = %e, "Listener failed");
                    self.deliver(Err(TransportError::Io(e))).await;
                    return;
                }
            }
        }
    }

    async fn handle_inbound(self: Arc<Self>, tcp: TcpStream, permit: Option<OwnedSemaphorePermit>) {
        let result = self.establish(tcp, permit).await;
        if let Err(ref e) = result {
            tracing::debug!(error = %e, "Rejected inbound connection");
        }
        self.deliver(result).await;
    }

    async fn establish(
        &self,
        tcp: TcpStream,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<Connection, TransportError> {
        let raw = RawConnId::from_stream(&tcp)?;
        filter_conn(&self.conns, &self.filters, raw, self.filter_timeout).await?;

        match Connection::handshake(tcp, &self.setup, self.conns.clone(), None, permit).await {
            Ok(conn) => Ok(conn),
            Err(rejected) => {
                self.conns.remove(&raw);
                Err(rejected.into())
            }
        }
    }

    /// Hands a result to `accept`, or discards it if the transport closes
    /// first. Discarded connections are closed.
    async fn deliver(&self, result: AcceptResult) {
        let conn = result.as_ref().ok().cloned();
        let delivered = tokio::select! {
            biased;
            _ = self.close.cancelled() => false,
            sent = self.results.send(result) => sent.is_ok(),
        };
        if !delivered {
            if let Some(conn) = conn {
                tracing::debug!(peer = %conn.node_info().id(), "Transport closed, dropping connection");
                conn.close();
            }
        }
    }
}

pub struct Transport {
    node_key: NodeKey,
    node_info: NodeInfo,
    mconn_config: MConnConfig,
    options: TransportOptions,
    channel_descs: RwLock<Vec<ChannelDescriptor>>,
    conns: Arc<ConnectionSet>,
    listening: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    results_tx: mpsc::Sender<AcceptResult>,
    results_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<AcceptResult>>>,
    close: CancellationToken,
}

impl Transport {
    pub fn new(
        node_key: NodeKey,
        node_info: NodeInfo,
        mconn_config: MConnConfig,
        options: TransportOptions,
    ) -> Self {
        let (results_tx, results_rx) = mpsc::channel(1);
        Self {
            node_key,
            node_info,
            mconn_config,
            options,
            channel_descs: RwLock::new(Vec::new()),
            conns: Arc::new(ConnectionSet::new()),
            listening: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            accept_task: Mutex::new(None),
            results_tx,
            results_rx: Arc::new(tokio::sync::Mutex::new(results_rx)),
            close: CancellationToken::new(),
        }
    }

    /// Channels multiplexed on every connection established after this call.
    pub fn set_channel_descriptors(&self, descs: Vec<ChannelDescriptor>) {
        *self.channel_descs.write() = descs;
    }

    pub fn protocols(&self) -> &'static [&'static str] {
        &[MCONN_PROTOCOL]
    }

    /// Registry of raw connections that passed filtering.
    pub fn conn_set(&self) -> &Arc<ConnectionSet> {
        &self.conns
    }

    fn handshake_setup(&self) -> HandshakeSetup {
        HandshakeSetup {
            node_key: self.node_key.clone(),
            node_info: self.node_info.clone(),
            channel_descs: self.channel_descs.read().clone(),
            mconn_config: self.mconn_config.clone(),
            timeout: self.options.handshake_timeout,
        }
    }

    /// Binds `endpoint` and starts accepting in the background. May succeed
    /// only once per transport.
    pub async fn listen(&self, endpoint: &Endpoint) -> Result<(), TransportError> {
        if self.close.is_cancelled() {
            return Err(TransportError::TransportClosed);
        }
        if self.listening.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyListening);
        }
        let result = self.start_listening(endpoint).await;
        if result.is_err() {
            self.listening.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn start_listening(&self, endpoint: &Endpoint) -> Result<(), TransportError> {
        let setup = self.handshake_setup();
        if setup.channel_descs.is_empty() {
            return Err(TransportError::NoChannels);
        }
        let endpoint = endpoint.normalize()?;
        let addr = endpoint.socket_addr().ok_or(EndpointError::MissingIp)?;

        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;

        let limiter = (self.options.max_incoming_connections > 0)
            .then(|| Arc::new(Semaphore::new(self.options.max_incoming_connections)));
        let acceptor = Arc::new(Acceptor {
            setup,
            conns: self.conns.clone(),
            filters: self.options.conn_filters.clone(),
            filter_timeout: self.options.filter_timeout,
            limiter,
            results: self.results_tx.clone(),
            close: self.close.clone(),
        });

        *self.local_addr.lock() = Some(local);
        *self.accept_task.lock() = Some(tokio::spawn(acceptor.run(listener)));
        tracing::info!(endpoint = %self.local_endpoint(local), "Listening for connections");
        Ok(())
    }

    /// Waits for the next inbound connection.
    ///
    /// Returns `Ok(None)` when `ctx` is cancelled, leaving any pending
    /// connection for a later call.
    pub async fn accept(&self, ctx: &CancellationToken) -> Result<Option<Connection>, TransportError> {
        let mut results = tokio::select! {
            biased;
            _ = self.close.cancelled() => return Err(TransportError::TransportClosed),
            _ = ctx.cancelled() => return Ok(None),
            results = self.results_rx.lock() => results,
        };

        let result = tokio::select! {
            biased;
            _ = self.close.cancelled() => None,
            _ = ctx.cancelled() => return Ok(None),
            result = results.recv() => result,
        };

        // Whoever holds the receiver when the transport closes drains it.
        if self.close.is_cancelled() {
            if let Some(Ok(conn)) = result {
                conn.close();
            }
            drain_results(&mut results);
            return Err(TransportError::TransportClosed);
        }
        match result {
            Some(result) => result.map(Some),
            None => Err(TransportError::TransportClosed),
        }
    }

    /// Connects to `endpoint`, verifying the peer id if the endpoint names one.
    pub async fn dial(
        &self,
        ctx: &CancellationToken,
        endpoint: &Endpoint,
    ) -> Result<Connection, TransportError> {
        if self.close.is_cancelled() {
            return Err(TransportError::TransportClosed);
        }
        let endpoint = endpoint.normalize()?;
        let addr = endpoint.socket_addr().ok_or(EndpointError::MissingIp)?;

        let tcp = tokio::select! {
            _ = ctx.cancelled() => return Err(TransportError::Cancelled),
            res = tokio::time::timeout(self.options.dial_timeout, TcpStream::connect(addr)) => {
                res.map_err(|_| TransportError::DialTimeout(addr))??
            }
        };

        let raw = RawConnId::from_stream(&tcp)?;
        tokio::select! {
            _ = ctx.cancelled() => {
                self.conns.remove(&raw);
                return Err(TransportError::Cancelled);
            }
            res = filter_conn(&self.conns, &self.options.conn_filters, raw, self.options.filter_timeout) => res?,
        }

        let setup = self.handshake_setup();
        let handshake = Connection::handshake(
            tcp,
            &setup,
            self.conns.clone(),
            endpoint.peer_id.as_ref(),
            None,
        );
        let result = tokio::select! {
            _ = ctx.cancelled() => Err(TransportError::Cancelled),
            res = handshake => res.map_err(TransportError::from),
        };
        if let Err(ref e) = result {
            tracing::debug!(peer = %addr, error = %e, "Dial failed");
            self.conns.remove(&raw);
        }
        result
    }

    /// The listening endpoint, if listening.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        let addr = *self.local_addr.lock();
        addr.map(|addr| self.local_endpoint(addr))
            .into_iter()
            .collect()
    }

    fn local_endpoint(&self, addr: SocketAddr) -> Endpoint {
        Endpoint::from_socket_addr(addr).with_peer_id(self.node_info.id().clone())
    }

    /// Stops accepting and closes the listener. Idempotent. Connections
    /// already returned to callers stay open.
    pub fn close(&self) {
        if self.close.is_cancelled() {
            return;
        }
        tracing::info!("Closing transport");
        self.close.cancel();
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }

        // Close anything that was delivered but never accepted. An in-flight
        // accept holds the receiver; drain once it lets go.
        match self.results_rx.clone().try_lock_owned() {
            Ok(mut results) => drain_results(&mut results),
            Err(_) => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let results_rx = self.results_rx.clone();
                    handle.spawn(async move {
                        drain_results(&mut *results_rx.lock().await);
                    });
                }
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }
}

fn drain_results(results: &mut mpsc::Receiver<AcceptResult>) {
    while let Ok(result) = results.try_recv() {
        if let Ok(conn) = result {
            tracing::debug!(peer = %conn.node_info().id(), "Transport closed, dropping connection");
            conn.close();
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}
