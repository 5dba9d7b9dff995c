//! Endpoint snapshots and the change tracker that feeds them.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use tracing::warn;

use pkg_types::endpoint::Endpoints;
use pkg_types::service::Protocol;

use crate::hasher::endpoint_chain_name;
use crate::service::ServicePortName;

/// One backend of a service port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointInfo {
    /// `ip:port`, or `[ip]:port` for IPv6.
    pub endpoint: String,
    pub is_local: bool,
}

impl EndpointInfo {
    pub fn new(ip: IpAddr, port: u16, is_local: bool) -> Self {
        let endpoint = match ip {
            IpAddr::V4(v4) => format!("{}:{}", v4, port),
            IpAddr::V6(v6) => format!("[{}]:{}", v6, port),
        };
        Self { endpoint, is_local }
    }

    /// The address part of [`endpoint`](Self::endpoint).
    pub fn ip(&self) -> &str {
        match self.endpoint.rsplit_once(':') {
            Some((ip, _)) => ip.trim_start_matches('[').trim_end_matches(']'),
            None => &self.endpoint,
        }
    }

    /// The endpoint chain for this backend of `port_name`.
    pub fn chain_name(&self, port_name: &str, protocol: Protocol) -> String {
        endpoint_chain_name(port_name, protocol, &self.endpoint)
    }
}

/// An endpoint that stopped backing a service port.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct StaleEndpoint {
    pub endpoint: EndpointInfo,
    pub service: ServicePortName,
}

/// What [`EndpointsMap::apply`] found.
#[derive(Debug, Default)]
pub struct EndpointsUpdate {
    pub stale_endpoints: BTreeSet<StaleEndpoint>,
    /// Service ports whose endpoint list went from empty to non-empty.
    pub stale_service_names: BTreeSet<ServicePortName>,
}

/// Current endpoints, keyed by service port. Lists are never empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointsMap(BTreeMap<ServicePortName, Vec<EndpointInfo>>);

impl EndpointsMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Endpoints described by `endpoints`; locality is decided against `hostname`.
    pub fn from_endpoints(endpoints: Option<&Endpoints>, hostname: &str) -> Self {
        let mut map = Self::new();
        let Some(ep) = endpoints else {
            return map;
        };
        for subset in &ep.subsets {
            for port in &subset.ports {
                if port.port == 0 {
                    warn!("Ignoring invalid endpoint port {} of {}", port.name, ep.key());
                    continue;
                }
                let name = ServicePortName::new(&ep.namespace, &ep.name, &port.name);
                for addr in &subset.addresses {
                    if addr.ip.is_empty() {
                        warn!("Ignoring invalid endpoint address of {}", name);
                        continue;
                    }
                    let ip: IpAddr = match addr.ip.parse() {
                        Ok(ip) => ip,
                        Err(e) => {
                            warn!("Ignoring endpoint {:?} of {}: {}", addr.ip, name, e);
                            continue;
                        }
                    };
                    let is_local = addr.node_name.as_deref() == Some(hostname);
                    map.0
                        .entry(name.clone())
                        .or_default()
                        .push(EndpointInfo::new(ip, port.port, is_local));
                }
            }
        }
        map
    }

    pub fn get(&self, name: &ServicePortName) -> Option<&[EndpointInfo]> {
        self.0.get(name).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total number of endpoints across all service ports.
    pub fn endpoint_count(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    /// Drain `changes` into this map.
    pub fn apply(&mut self, changes: &EndpointChangeTracker) -> EndpointsUpdate {
        let mut update = EndpointsUpdate::default();
        for (_, change) in changes.drain() {
            for name in change.previous.0.keys() {
                self.0.remove(name);
            }
            for (name, eps) in &change.current.0 {
                self.0.insert(name.clone(), eps.clone());
            }
            detect_stale(&change.previous, &change.current, &mut update);
        }
        update
    }
}

fn detect_stale(old: &EndpointsMap, new: &EndpointsMap, update: &mut EndpointsUpdate) {
    for (name, eps) in &old.0 {
        let current = new.get(name).unwrap_or(&[]);
        for ep in eps {
            if !current.contains(ep) {
                update.stale_endpoints.insert(StaleEndpoint {
                    endpoint: ep.clone(),
                    service: name.clone(),
                });
            }
        }
    }
    for (name, eps) in &new.0 {
        if !eps.is_empty() && old.get(name).is_none_or(<[EndpointInfo]>::is_empty) {
            update.stale_service_names.insert(name.clone());
        }
    }
}

#[derive(Debug, Clone)]
struct EndpointsChange {
    previous: EndpointsMap,
    current: EndpointsMap,
}

/// Accumulates Endpoints changes between syncs, collapsing repeated updates
/// to the same object.
#[derive(Debug)]
pub struct EndpointChangeTracker {
    hostname: String,
    items: Mutex<BTreeMap<String, EndpointsChange>>,
}

impl EndpointChangeTracker {
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            items: Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns whether any change is pending.
    pub fn update(&self, previous: Option<&Endpoints>, current: Option<&Endpoints>) -> bool {
        let Some(key) = current.or(previous).map(Endpoints::key) else {
            return false;
        };
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        let change = items.entry(key.clone()).or_insert_with(|| EndpointsChange {
            previous: EndpointsMap::from_endpoints(previous, &self.hostname),
            current: EndpointsMap::new(),
        });
        change.current = EndpointsMap::from_endpoints(current, &self.hostname);
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

    fn drain(&self) -> BTreeMap<String, EndpointsChange> {
        std::mem::take(&mut *self.items.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::endpoint::{EndpointAddress, EndpointPort, EndpointSubset};

    fn endpoints(name: &str, addrs: &[(&str, Option<&str>)], ports: &[(&str, u16)]) -> Endpoints {
        Endpoints {
            name: name.to_string(),
            namespace: "default".to_string(),
            subsets: vec![EndpointSubset {
                addresses: addrs
                    .iter()
                    .map(|(ip, node)| EndpointAddress {
                        ip: ip.to_string(),
                        node_name: node.map(str::to_string),
                    })
                    .collect(),
                ports: ports
                    .iter()
                    .map(|(n, p)| EndpointPort {
                        name: n.to_string(),
                        port: *p,
                        protocol: Protocol::Tcp,
                    })
                    .collect(),
            }],
        }
    }

    fn spn(name: &str, port: &str) -> ServicePortName {
        ServicePortName::new("default", name, port)
    }

    #[test]
    fn parses_and_classifies_locality() {
        let ep = endpoints(
            "foo",
            &[("10.1.1.1", Some("node-a")), ("10.1.1.2", Some("node-b")), ("", None), ("fd00::3", None)],
            &[("http", 8080), ("bad", 0)],
        );
        let map = EndpointsMap::from_endpoints(Some(&ep), "node-a");
        assert_eq!(map.len(), 1);
        let eps = map.get(&spn("foo", "http")).unwrap();
        assert_eq!(
            eps,
            &[
                EndpointInfo {
                    endpoint: "10.1.1.1:8080".into(),
                    is_local: true
                },
                EndpointInfo {
                    endpoint: "10.1.1.2:8080".into(),
                    is_local: false
                },
                EndpointInfo {
                    endpoint: "[fd00::3]:8080".into(),
                    is_local: false
                },
            ]
        );
        assert_eq!(eps[0].ip(), "10.1.1.1");
        assert_eq!(eps[2].ip(), "fd00::3");
        assert_eq!(map.endpoint_count(), 3);
    }

    #[test]
    fn chain_name_depends_on_protocol() {
        let ep = EndpointInfo::new("10.1.1.1".parse().unwrap(), 53, false);
        assert_ne!(
            ep.chain_name("default/dns:dns", Protocol::Udp),
            ep.chain_name("default/dns:dns", Protocol::Tcp)
        );
        assert_eq!(
            ep.chain_name("default/dns:dns", Protocol::Udp),
            ep.chain_name("default/dns:dns", Protocol::Udp)
        );
    }

    #[test]
    fn apply_detects_stale_endpoints_and_new_services() {
        let tracker = EndpointChangeTracker::new("node-a");
        let mut map = EndpointsMap::new();

        let v1 = endpoints("foo", &[("10.1.1.1", None), ("10.1.1.2", None)], &[("http", 8080)]);
        assert!(tracker.update(None, Some(&v1)));
        let update = map.apply(&tracker);
        assert!(update.stale_endpoints.is_empty());
        assert_eq!(
            update.stale_service_names.into_iter().collect::<Vec<_>>(),
            vec![spn("foo", "http")]
        );

        let v2 = endpoints("foo", &[("10.1.1.2", None)], &[("http", 8080)]);
        tracker.update(Some(&v1), Some(&v2));
        let update = map.apply(&tracker);
        assert!(update.stale_service_names.is_empty());
        let stale: Vec<_> = update.stale_endpoints.into_iter().collect();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].endpoint.endpoint, "10.1.1.1:8080");
        assert_eq!(stale[0].service, spn("foo", "http"));
        assert_eq!(map.get(&spn("foo", "http")).map(<[_]>::len), Some(1));

        tracker.update(Some(&v2), None);
        let update = map.apply(&tracker);
        assert_eq!(update.stale_endpoints.len(), 1);
        assert!(map.is_empty());
    }

    #[test]
    fn repeated_updates_keep_the_oldest_previous() {
        let tracker = EndpointChangeTracker::new("node-a");
        let mut map = EndpointsMap::new();
        let v1 = endpoints("foo", &[("10.1.1.1", None)], &[("http", 8080)]);
        tracker.update(None, Some(&v1));
        map.apply(&tracker);

        let v2 = endpoints("foo", &[("10.1.1.2", None)], &[("http", 8080)]);
        let v3 = endpoints("foo", &[("10.1.1.3", None)], &[("http", 8080)]);
        tracker.update(Some(&v1), Some(&v2));
        tracker.update(Some(&v2), Some(&v3));
        let update = map.apply(&tracker);

        // v2 was never applied, so only v1's endpoint is stale.
        let stale: Vec<_> = update
            .stale_endpoints
            .iter()
            .map(|s| s.endpoint.endpoint.as_str())
            .collect();
        assert_eq!(stale, vec!["10.1.1.1:8080"]);
        assert_eq!(
            map.get(&spn("foo", "http")).unwrap()[0].endpoint,
            "10.1.1.3:8080"
        );
    }

    #[test]
    fn no_op_update_cancels() {
        let tracker = EndpointChangeTracker::new("node-a");
        let v1 = endpoints("foo", &[("10.1.1.1", None)], &[("http", 8080)]);
        assert!(!tracker.update(Some(&v1), Some(&v1)));
        assert!(tracker.is_empty());
    }
}
