use serde::{Deserialize, Serialize};

/// Transport protocol of a service port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum Protocol {
    #[default]
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP")]
    Udp,
}

impl Protocol {
    /// Lowercase form used by iptables (`-p tcp`) and conntrack.
    pub fn as_iptables(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ServiceType {
    #[default]
    ClusterIP,
    NodePort,
    LoadBalancer,
    ExternalName,
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceType::ClusterIP => write!(f, "ClusterIP"),
            ServiceType::NodePort => write!(f, "NodePort"),
            ServiceType::LoadBalancer => write!(f, "LoadBalancer"),
            ServiceType::ExternalName => write!(f, "ExternalName"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SessionAffinity {
    #[default]
    None,
    ClientIP,
}

/// Whether external traffic may be routed to endpoints on other nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ExternalTrafficPolicy {
    #[default]
    Cluster,
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub protocol: Protocol,
    pub port: u16,
    #[serde(default)]
    pub node_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServiceSpec {
    #[serde(default)]
    pub service_type: ServiceType,
    /// `None`, empty or the literal `"None"` marks a headless service.
    #[serde(default)]
    pub cluster_ip: Option<String>,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
    #[serde(default)]
    pub external_ips: Vec<String>,
    #[serde(default)]
    pub load_balancer_source_ranges: Vec<String>,
    #[serde(default)]
    pub session_affinity: SessionAffinity,
    /// ClientIP affinity timeout; defaults to three hours when unset.
    #[serde(default)]
    pub session_affinity_timeout_seconds: Option<u32>,
    #[serde(default)]
    pub external_traffic_policy: ExternalTrafficPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LoadBalancerIngress {
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServiceStatus {
    #[serde(default)]
    pub load_balancer_ingress: Vec<LoadBalancerIngress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub namespace: String,
    pub spec: ServiceSpec,
    #[serde(default)]
    pub status: ServiceStatus,
}

impl Service {
    /// `namespace/name`
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// The cluster IP, unless the service is headless.
    pub fn cluster_ip(&self) -> Option<&str> {
        match self.spec.cluster_ip.as_deref() {
            None | Some("") | Some("None") => None,
            Some(ip) => Some(ip),
        }
    }

    /// External traffic for this service must only reach endpoints on the
    /// receiving node.
    pub fn requests_only_local_traffic(&self) -> bool {
        matches!(
            self.spec.service_type,
            ServiceType::NodePort | ServiceType::LoadBalancer
        ) && self.spec.external_traffic_policy == ExternalTrafficPolicy::Local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc(service_type: ServiceType, policy: ExternalTrafficPolicy) -> Service {
        Service {
            name: "web".into(),
            namespace: "default".into(),
            spec: ServiceSpec {
                service_type,
                cluster_ip: Some("10.43.0.10".into()),
                external_traffic_policy: policy,
                ..Default::default()
            },
            status: ServiceStatus::default(),
        }
    }

    #[test]
    fn only_local_needs_external_type() {
        assert!(svc(ServiceType::NodePort, ExternalTrafficPolicy::Local).requests_only_local_traffic());
        assert!(svc(ServiceType::LoadBalancer, ExternalTrafficPolicy::Local).requests_only_local_traffic());
        assert!(!svc(ServiceType::ClusterIP, ExternalTrafficPolicy::Local).requests_only_local_traffic());
        assert!(!svc(ServiceType::NodePort, ExternalTrafficPolicy::Cluster).requests_only_local_traffic());
    }

    #[test]
    fn headless_has_no_cluster_ip() {
        let mut s = svc(ServiceType::ClusterIP, ExternalTrafficPolicy::Cluster);
        assert_eq!(s.cluster_ip(), Some("10.43.0.10"));
        s.spec.cluster_ip = Some("None".into());
        assert_eq!(s.cluster_ip(), None);
        s.spec.cluster_ip = Some(String::new());
        assert_eq!(s.cluster_ip(), None);
    }

    #[test]
    fn deserializes_minimal_json() {
        let s: Service = serde_json::from_str(
            r#"{"name":"dns","namespace":"kube-system",
                "spec":{"cluster_ip":"10.43.0.10","ports":[{"name":"dns","protocol":"UDP","port":53}]}}"#,
        )
        .unwrap();
        assert_eq!(s.spec.ports[0].protocol, Protocol::Udp);
        assert_eq!(s.spec.service_type, ServiceType::ClusterIP);
        assert_eq!(s.spec.session_affinity, SessionAffinity::None);
        assert!(s.status.load_balancer_ingress.is_empty());
    }
}
