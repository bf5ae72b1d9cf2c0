//! Loopback address and TCP port reservations
//!
//! A port handed out once is never handed out again by the same pool, even
//! after the server that used it has gone away. The process-wide pool
//! returned by [`PortPool::process`] lives as long as the orchestrating
//! process, so back-to-back sessions in one process never collide.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

/// Highest port considered for allocation
pub const PORT_RANGE_TOP: u16 = 64000;
/// Lowest port considered for allocation
pub const PORT_RANGE_BOTTOM: u16 = 32769;

static PROCESS_POOL: LazyLock<PortPool> = LazyLock::new(PortPool::new);

/// Set of ports promised to servers
#[derive(Debug, Clone, Default)]
pub struct PortPool {
    promised: Arc<Mutex<HashSet<u16>>>,
}

impl PortPool {
    /// Create an independent pool (mostly useful in tests)
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool shared by every session of this process
    pub fn process() -> Self {
        PROCESS_POOL.clone()
    }

    /// Pick a loopback address for a new service
    pub fn free_ip(&self) -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    /// Reserve a TCP port that is bindable on `ip` and was never promised before
    ///
    /// Ports are scanned from the top of the range downwards. Returns `None`
    /// when the range is exhausted.
    pub fn reserve_port(&self, ip: IpAddr) -> Option<u16> {
        let mut promised = self.promised.lock().unwrap_or_else(PoisonError::into_inner);
        for port in (PORT_RANGE_BOTTOM..=PORT_RANGE_TOP).rev() {
            if promised.contains(&port) {
                continue;
            }
            // The probe listener is dropped right away; the reservation
            // only lives in the promised set
            if TcpListener::bind(SocketAddr::new(ip, port)).is_ok() {
                promised.insert(port);
                return Some(port);
            }
        }
        None
    }

    /// Reserve an address and a port together
    pub fn reserve_endpoint(&self) -> Option<SocketAddr> {
        let ip = self.free_ip();
        self.reserve_port(ip).map(|port| SocketAddr::new(ip, port))
    }

    /// Whether `port` was already handed out by this pool
    pub fn is_promised(&self, port: u16) -> bool {
        self.promised
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&port)
    }
}
