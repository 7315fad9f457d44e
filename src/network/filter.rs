//! Connection filters.
//!
//! Every configured filter is evaluated concurrently against a freshly
//! accepted or dialed socket before any handshake I/O happens. A single
//! rejection, or the filters failing to report before the filter timeout,
//! aborts the connection.

use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{RejectedError, TransportError};
use crate::network::conn_set::{ConnectionSet, RawConnId};

/// A predicate run against every new raw connection.
#[async_trait]
pub trait ConnFilter: Send + Sync {
    async fn evaluate(
        &self,
        conns: &ConnectionSet,
        conn: &RawConnId,
        ips: &[IpAddr],
    ) -> Result<(), RejectedError>;
}

#[async_trait]
impl<F> ConnFilter for F
where
    F: Fn(&ConnectionSet, &RawConnId, &[IpAddr]) -> Result<(), RejectedError> + Send + Sync,
{
    async fn evaluate(
        &self,
        conns: &ConnectionSet,
        conn: &RawConnId,
        ips: &[IpAddr],
    ) -> Result<(), RejectedError> {
        (self)(conns, conn, ips)
    }
}

/// Refuses connections from an IP that already holds a connection.
///
/// Passing claims the IPs in the set for `conn`, so of two sockets from one
/// IP filtered at the same time only one gets through. `filter_conn` drops
/// the claim again if another filter rejects.
#[derive(Debug, Default, Clone, Copy)]
pub struct DuplicateIpFilter;

#[async_trait]
impl ConnFilter for DuplicateIpFilter {
    async fn evaluate(
        &self,
        conns: &ConnectionSet,
        conn: &RawConnId,
        ips: &[IpAddr],
    ) -> Result<(), RejectedError> {
        if conns.set_if_ips_absent(*conn, ips.to_vec()) {
            return Ok(());
        }
        let ip = ips.first().copied().unwrap_or_else(|| conn.remote.ip());
        Err(RejectedError::duplicate(conn.remote).with_cause(format!("ip<{}> already connected", ip)))
    }
}

/// Permanently or temporarily blocked IPs.
#[derive(Debug, Default)]
pub struct IpBlocklistFilter {
    permanent: RwLock<HashMap<IpAddr, String>>,
    temporary: RwLock<HashMap<IpAddr, (Instant, String)>>,
}

impl IpBlocklistFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blocked<I: IntoIterator<Item = IpAddr>>(ips: I) -> Self {
        let filter = Self::new();
        for ip in ips {
            filter.block(ip, "configured");
        }
        filter
    }

    pub fn block(&self, ip: IpAddr, reason: &str) {
        self.permanent
            .write()
            .insert(ip.to_canonical(), reason.to_string());
        self.temporary.write().remove(&ip.to_canonical());
    }

    pub fn block_for(&self, ip: IpAddr, duration: Duration, reason: &str) {
        let expiry = Instant::now() + duration;
        self.temporary
            .write()
            .insert(ip.to_canonical(), (expiry, reason.to_string()));
    }

    pub fn unblock(&self, ip: IpAddr) {
        let ip = ip.to_canonical();
        self.permanent.write().remove(&ip);
        self.temporary.write().remove(&ip);
    }

    /// Returns the block reason if `ip` is currently blocked.
    pub fn is_blocked(&self, ip: IpAddr) -> Option<String> {
        let ip = ip.to_canonical();
        if let Some(reason) = self.permanent.read().get(&ip) {
            return Some(format!("permanently blocked: {}", reason));
        }
        let now = Instant::now();
        if let Some((expiry, reason)) = self.temporary.read().get(&ip) {
            if now < *expiry {
                let remaining = expiry.duration_since(now).as_secs();
                return Some(format!("blocked for {}s: {}", remaining, reason));
            }
        }
        None
    }

    /// Drops expired temporary blocks.
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.temporary.write().retain(|_, (expiry, _)| now < *expiry);
    }
}

#[async_trait]
impl ConnFilter for IpBlocklistFilter {
    async fn evaluate(
        &self,
        _conns: &ConnectionSet,
        conn: &RawConnId,
        ips: &[IpAddr],
    ) -> Result<(), RejectedError> {
        for ip in ips {
            if let Some(reason) = self.is_blocked(*ip) {
                return Err(RejectedError::filtered(conn.remote, reason));
            }
        }
        Ok(())
    }
}

/// Limits how many new connections a single IP may open per window.
#[derive(Debug)]
pub struct ConnectionRateFilter {
    window: Duration,
    max_per_window: u32,
    state: Mutex<RateState>,
}

#[derive(Debug)]
struct RateState {
    counters: HashMap<IpAddr, (Instant, u32)>,
    last_cleanup: Instant,
}

impl ConnectionRateFilter {
    pub fn new(window: Duration, max_per_window: u32) -> Self {
        Self {
            window,
            max_per_window,
            state: Mutex::new(RateState {
                counters: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
        }
    }

    /// Records an attempt from `ip`; false once the window budget is spent.
    pub fn check(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();

        // Sweep stale counters every ten windows.
        let sweep_every = self.window * 10;
        if now.duration_since(state.last_cleanup) > sweep_every {
            let window = self.window;
            state
                .counters
                .retain(|_, (started, _)| now.duration_since(*started) < window);
            state.last_cleanup = now;
        }

        let (started, count) = state
            .counters
            .entry(ip.to_canonical())
            .or_insert((now, 0));
        if now.duration_since(*started) > self.window {
            *started = now;
            *count = 0;
        }
        if *count >= self.max_per_window {
            false
        } else {
            *count += 1;
            true
        }
    }
}

#[async_trait]
impl ConnFilter for ConnectionRateFilter {
    async fn evaluate(
        &self,
        _conns: &ConnectionSet,
        conn: &RawConnId,
        ips: &[IpAddr],
    ) -> Result<(), RejectedError> {
        for ip in ips {
            if !self.check(*ip) {
                return Err(RejectedError::filtered(
                    conn.remote,
                    format!(
                        "more than {} connections from {} within {:?}",
                        self.max_per_window, ip, self.window
                    ),
                ));
            }
        }
        Ok(())
    }
}

/// Runs the filter chain for a raw connection and registers it on success.
///
/// A connection already present in `conns` is rejected as a duplicate before
/// any filter runs. Filters that report after `timeout` are ignored and the
/// whole step fails with [`TransportError::FilterTimeout`]. On any failure
/// `conn` is left out of the set.
pub async fn filter_conn(
    conns: &Arc<ConnectionSet>,
    filters: &[Arc<dyn ConnFilter>],
    conn: RawConnId,
    timeout: Duration,
) -> Result<(), TransportError> {
    if conns.has(&conn) {
        return Err(RejectedError::duplicate(conn.remote).into());
    }

    let ips: Arc<[IpAddr]> = Arc::from(vec![conn.remote.ip().to_canonical()]);

    let mut pending: FuturesUnordered<_> = filters
        .iter()
        .map(|filter| {
            let filter = filter.clone();
            let conns = conns.clone();
            let ips = ips.clone();
            tokio::spawn(async move { filter.evaluate(&conns, &conn, &ips).await })
        })
        .collect();

    let outcome = tokio::time::timeout(timeout, async {
        while let Some(result) = pending.next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(rejected)) => return Err(rejected),
                Err(join_err) => {
                    return Err(RejectedError::filtered(
                        conn.remote,
                        format!("filter failed: {}", join_err),
                    ))
                }
            }
        }
        Ok(())
    })
    .await;

    if !matches!(outcome, Ok(Ok(()))) {
        // Stop the stragglers before dropping any claim they made.
        for task in pending.iter() {
            task.abort();
        }
        while pending.next().await.is_some() {}
        conns.remove(&conn);
    }

    match outcome {
        Err(_) => {
            tracing::debug!(peer = %conn.remote, ?timeout, "Connection filters timed out");
            Err(TransportError::FilterTimeout)
        }
        Ok(Err(rejected)) => {
            let rejected = if rejected.addr().is_none() {
                rejected.with_addr(conn.remote)
            } else {
                rejected
            };
            Err(rejected.into())
        }
        Ok(Ok(())) => {
            conns.set(conn, ips.to_vec());
            Ok(())
        }
    }
}
