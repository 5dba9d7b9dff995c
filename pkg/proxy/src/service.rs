//! Service port snapshots and the change tracker that feeds them.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

use pkg_constants::proxy::DEFAULT_CLIENT_IP_AFFINITY_SECS;
use pkg_types::service::{Protocol, Service, ServiceType, SessionAffinity};

use crate::hasher::{ChainRole, service_chain_name};

/// `namespace/name:port` identity of one service port, shared by the
/// Service and Endpoints views.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServicePortName {
    pub namespace: String,
    pub name: String,
    pub port: String,
}

impl ServicePortName {
    pub fn new(namespace: &str, name: &str, port: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            port: port.to_string(),
        }
    }
}

impl std::fmt::Display for ServicePortName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.namespace, self.name, self.port)
    }
}

/// Everything the proxier needs to know about one service port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub cluster_ip: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    /// 0 when unset.
    pub node_port: u16,
    pub external_ips: Vec<String>,
    pub load_balancer_ingress: Vec<String>,
    pub load_balancer_source_ranges: Vec<String>,
    pub session_affinity: SessionAffinity,
    pub sticky_max_age_seconds: u32,
    pub only_node_local_endpoints: bool,

    pub name: String,
    pub service_chain: String,
    pub firewall_chain: String,
    pub xlb_chain: String,
}

impl ServiceInfo {
    fn new(port_name: &ServicePortName, cluster_ip: IpAddr, svc: &Service, index: usize) -> Self {
        let port = &svc.spec.ports[index];
        let name = port_name.to_string();
        let session_affinity = svc.spec.session_affinity;
        let sticky_max_age_seconds = match session_affinity {
            SessionAffinity::ClientIP => svc
                .spec
                .session_affinity_timeout_seconds
                .unwrap_or(DEFAULT_CLIENT_IP_AFFINITY_SECS),
            SessionAffinity::None => 0,
        };
        Self {
            cluster_ip,
            port: port.port,
            protocol: port.protocol,
            node_port: port.node_port.unwrap_or(0),
            external_ips: svc.spec.external_ips.clone(),
            load_balancer_ingress: svc
                .status
                .load_balancer_ingress
                .iter()
                .filter_map(|i| i.ip.clone())
                .filter(|ip| !ip.is_empty())
                .collect(),
            load_balancer_source_ranges: svc
                .spec
                .load_balancer_source_ranges
                .iter()
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect(),
            session_affinity,
            sticky_max_age_seconds,
            only_node_local_endpoints: svc.requests_only_local_traffic(),
            service_chain: service_chain_name(ChainRole::Service, &name, port.protocol),
            firewall_chain: service_chain_name(ChainRole::Firewall, &name, port.protocol),
            xlb_chain: service_chain_name(ChainRole::Xlb, &name, port.protocol),
            name,
        }
    }
}

/// Current service ports, keyed by identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceMap(BTreeMap<ServicePortName, ServiceInfo>);

impl ServiceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Service ports described by `svc`. Headless and ExternalName services
    /// have none.
    pub fn from_service(svc: Option<&Service>) -> Self {
        let mut map = Self::new();
        let Some(svc) = svc else {
            return map;
        };
        if svc.spec.service_type == ServiceType::ExternalName {
            debug!("Skipping ExternalName service {}", svc.key());
            return map;
        }
        let Some(ip) = svc.cluster_ip() else {
            debug!("Skipping headless service {}", svc.key());
            return map;
        };
        let cluster_ip: IpAddr = match ip.parse() {
            Ok(ip) => ip,
            Err(e) => {
                warn!("Skipping service {}: bad cluster IP {:?}: {}", svc.key(), ip, e);
                return map;
            }
        };
        for (i, port) in svc.spec.ports.iter().enumerate() {
            let name = ServicePortName::new(&svc.namespace, &svc.name, &port.name);
            let info = ServiceInfo::new(&name, cluster_ip, svc, i);
            map.0.insert(name, info);
        }
        map
    }

    pub fn get(&self, name: &ServicePortName) -> Option<&ServiceInfo> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ServicePortName, &ServiceInfo)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Drain `changes` into this map. Returns the cluster IPs of UDP service
    /// ports that went away or changed address or protocol.
    pub fn apply(&mut self, changes: &ServiceChangeTracker) -> BTreeSet<String> {
        let mut stale = BTreeSet::new();
        for (_, change) in changes.drain() {
            for (name, prev) in change.previous.0 {
                match change.current.get(&name) {
                    Some(cur) if cur.cluster_ip == prev.cluster_ip && cur.protocol == prev.protocol => {}
                    Some(_) => {
                        if prev.protocol == Protocol::Udp {
                            stale.insert(prev.cluster_ip.to_string());
                        }
                    }
                    None => match self.0.remove(&name) {
                        Some(info) if info.protocol == Protocol::Udp => {
                            stale.insert(info.cluster_ip.to_string());
                        }
                        Some(_) => {}
                        None => warn!("Service port {} does not exist", name),
                    },
                }
            }
            self.0.extend(change.current.0);
        }
        stale
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ServiceChange {
    previous: ServiceMap,
    current: ServiceMap,
}

/// Accumulates Service changes between syncs, one entry per service.
///
/// For each service the oldest state seen since the last sync is kept as
/// `previous` and the latest as `current`; an entry whose two sides are equal
/// is dropped.
#[derive(Debug, Default)]
pub struct ServiceChangeTracker {
    items: Mutex<BTreeMap<String, ServiceChange>>,
}

impl ServiceChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a create (`previous` is `None`), delete (`current` is `None`)
    /// or update. Returns whether any change is pending.
    pub fn update(&self, previous: Option<&Service>, current: Option<&Service>) -> bool {
        let Some(key) = current.or(previous).map(Service::key) else {
            return false;
        };
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        let change = items.entry(key.clone()).or_insert_with(|| ServiceChange {
            previous: ServiceMap::from_service(previous),
            current: ServiceMap::new(),
        });
        change.current = ServiceMap::from_service(current);
        if change.previous == change.current {
            items.remove(&key);
        }
        !items.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    fn drain(&self) -> BTreeMap<String, ServiceChange> {
        std::mem::take(&mut *self.items.lock().unwrap_or_else(PoisonError::into_inner))
    }
}
