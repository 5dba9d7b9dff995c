//! Local port reservations.
//!
//! Node ports and locally-bound external IPs are captured by iptables before
//! any process sees the traffic, so another process binding the same port
//! would appear to work while never receiving a packet. Holding a socket on
//! each such port keeps it out of everyone else's hands.

use std::collections::{HashMap, HashSet};
use std::net::{TcpListener, UdpSocket};
use std::sync::Arc;

use pkg_types::service::Protocol;

/// An OS-level socket reservation. Equal iff every field matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalPort {
    pub description: String,
    /// `None` binds the wildcard address.
    pub ip: Option<String>,
    pub port: u16,
    pub protocol: Protocol,
}

impl std::fmt::Display for LocalPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ip = self.ip.as_deref().unwrap_or("");
        if ip.contains(':') {
            write!(
                f,
                "\"{}\" ([{}]:{}/{})",
                self.description,
                ip,
                self.port,
                self.protocol.as_iptables()
            )
        } else {
            write!(
                f,
                "\"{}\" ({}:{}/{})",
                self.description,
                ip,
                self.port,
                self.protocol.as_iptables()
            )
        }
    }
}

/// A held socket. The reservation ends when it is dropped.
pub trait HeldSocket: Send + Sync + std::fmt::Debug {}

impl HeldSocket for TcpListener {}
impl HeldSocket for UdpSocket {}

/// Opens the socket behind a [`LocalPort`].
pub trait PortOpener: Send + Sync {
    fn open_local_port(&self, port: &LocalPort) -> std::io::Result<Box<dyn HeldSocket>>;
}

/// [`PortOpener`] that binds (and for TCP, listens on) real sockets.
#[derive(Debug, Default)]
pub struct ListenPortOpener {
    ipv6: bool,
}

impl ListenPortOpener {
    pub fn new(ipv6: bool) -> Self {
        Self { ipv6 }
    }
}

impl PortOpener for ListenPortOpener {
    fn open_local_port(&self, lp: &LocalPort) -> std::io::Result<Box<dyn HeldSocket>> {
        let wildcard = if self.ipv6 { "::" } else { "0.0.0.0" };
        let ip = lp.ip.as_deref().unwrap_or(wildcard);
        let addr = if ip.contains(':') {
            format!("[{}]:{}", ip, lp.port)
        } else {
            format!("{}:{}", ip, lp.port)
        };
        let socket: Box<dyn HeldSocket> = match lp.protocol {
            Protocol::Tcp => Box::new(TcpListener::bind(&addr)?),
            Protocol::Udp => Box::new(UdpSocket::bind(&addr)?),
        };
        tracing::info!("Opened local port {}", lp);
        Ok(socket)
    }
}

/// What [`PortReservation::claim`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// Already held from a previous sync; the same socket is kept.
    Retained,
    /// Opened during this sync.
    Opened,
}

/// The set of ports currently held open.
pub struct LocalPortSet {
    held: HashMap<LocalPort, Box<dyn HeldSocket>>,
    opener: Arc<dyn PortOpener>,
}

impl LocalPortSet {
    pub fn new(opener: Arc<dyn PortOpener>) -> Self {
        Self {
            held: HashMap::new(),
            opener,
        }
    }

    /// Start reconciling against the ports needed by one sync.
    pub fn begin(&mut self) -> PortReservation<'_> {
        PortReservation {
            set: self,
            retained: HashSet::new(),
            opened: HashMap::new(),
        }
    }

    pub fn contains(&self, port: &LocalPort) -> bool {
        self.held.contains_key(port)
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    pub fn ports(&self) -> impl Iterator<Item = &LocalPort> {
        self.held.keys()
    }
}

/// Ports claimed during one sync. Nothing changes in the owning
/// [`LocalPortSet`] until [`commit`](Self::commit); dropping the reservation
/// (or calling [`revert`](Self::revert)) closes only the newly opened ports.
pub struct PortReservation<'a> {
    set: &'a mut LocalPortSet,
    retained: HashSet<LocalPort>,
    opened: HashMap<LocalPort, Box<dyn HeldSocket>>,
}

impl PortReservation<'_> {
    /// Mark `port` as needed, opening it unless already held.
    pub fn claim(&mut self, port: &LocalPort) -> std::io::Result<Claim> {
        if self.set.held.contains_key(port) {
            self.retained.insert(port.clone());
            return Ok(Claim::Retained);
        }
        if self.opened.contains_key(port) {
            return Ok(Claim::Retained);
        }
        let socket = self.set.opener.open_local_port(port)?;
        self.opened.insert(port.clone(), socket);
        Ok(Claim::Opened)
    }

    /// Adopt the claimed ports: close held ports nobody claimed, keep the rest,
    /// add the newly opened ones. Returns the ports that were closed.
    pub fn commit(self) -> Vec<LocalPort> {
        let PortReservation {
            set,
            retained,
            opened,
        } = self;
        let stale: Vec<LocalPort> = set
            .held
            .keys()
            .filter(|p| !retained.contains(*p))
            .cloned()
            .collect();
        for port in &stale {
            set.held.remove(port);
            tracing::info!("Closed local port {}", port);
        }
        set.held.extend(opened);
        stale
    }

    /// Close everything opened during this sync and leave the held set untouched.
    pub fn revert(self) -> usize {
        let count = self.opened.len();
        for port in self.opened.keys() {
            tracing::info!("Closing local port {} after failed sync", port);
        }
        count
    }
}
