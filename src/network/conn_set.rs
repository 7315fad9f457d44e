//! Registry of raw connections that passed filtering.
//! Uses DashMap so concurrent filter and handshake tasks never contend on one lock.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use tokio::net::TcpStream;

/// Identity of a raw TCP connection: its local and remote socket addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RawConnId {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl RawConnId {
    pub fn new(local: SocketAddr, remote: SocketAddr) -> Self {
        Self { local, remote }
    }

    pub fn from_stream(stream: &TcpStream) -> std::io::Result<Self> {
        Ok(Self {
            local: stream.local_addr()?,
            remote: stream.peer_addr()?,
        })
    }
}

impl fmt::Display for RawConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.local, self.remote)
    }
}

/// Maps each live raw connection to the IPs resolved for its remote address.
#[derive(Debug, Default)]
pub struct ConnectionSet {
    conns: DashMap<RawConnId, Vec<IpAddr>>,
    /// Serializes inserts so an IP check and its insert are one step.
    insert_lock: Mutex<()>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, conn: &RawConnId) -> bool {
        self.conns.contains_key(conn)
    }

    pub fn has_ip(&self, ip: IpAddr) -> bool {
        self.conns.iter().any(|entry| entry.value().contains(&ip))
    }

    /// Registers a connection, replacing any IPs previously stored for it.
    pub fn set(&self, conn: RawConnId, ips: Vec<IpAddr>) {
        let _guard = self.insert_lock.lock();
        self.conns.insert(conn, ips);
    }

    /// Registers `conn` unless another connection already holds one of
    /// `ips`. Returns false, leaving the set untouched, in that case.
    pub fn set_if_ips_absent(&self, conn: RawConnId, ips: Vec<IpAddr>) -> bool {
        let _guard = self.insert_lock.lock();
        let taken = self
            .conns
            .iter()
            .any(|entry| *entry.key() != conn && entry.value().iter().any(|ip| ips.contains(ip)));
        if taken {
            return false;
        }
        self.conns.insert(conn, ips);
        true
    }

    pub fn remove(&self, conn: &RawConnId) {
        self.conns.remove(conn);
    }

    /// Removes every connection whose remote address is `addr`.
    pub fn remove_addr(&self, addr: SocketAddr) {
        self.conns.retain(|conn, _| conn.remote != addr);
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}
