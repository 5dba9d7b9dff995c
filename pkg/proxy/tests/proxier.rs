//! End-to-end sync scenarios against the in-memory kernel fakes.

use std::sync::Arc;

use pkg_metrics::MetricsRegistry;
use pkg_network::fake::{
    ConntrackCall, FakeConntrack, FakeIptables, FakeNodeAddresses, FakePortOpener,
};
use pkg_network::iptables::Table;
use pkg_network::ports::LocalPort;
use pkg_network::rules::{Match, Target};
use pkg_proxy::hasher::{ChainRole, endpoint_chain_name, service_chain_name};
use pkg_proxy::metrics::{PROXY_ENDPOINTS, PROXY_SERVICES, SYNC_PROXY_RULES_FAILURES};
use pkg_proxy::{KernelHandles, Proxier, ProxierConfig};
use pkg_types::endpoint::{EndpointAddress, EndpointPort, EndpointSubset, Endpoints};
use pkg_types::service::{
    ExternalTrafficPolicy, LoadBalancerIngress, Protocol, Service, ServicePort, ServiceSpec,
    ServiceStatus, ServiceType, SessionAffinity,
};

struct Harness {
    proxier: Proxier,
    ipt: Arc<FakeIptables>,
    conntrack: Arc<FakeConntrack>,
    ports: Arc<FakePortOpener>,
    metrics: Arc<MetricsRegistry>,
}

async fn harness_with(config: ProxierConfig) -> Harness {
    let ipt = Arc::new(FakeIptables::new());
    let conntrack = Arc::new(FakeConntrack::new());
    let ports = Arc::new(FakePortOpener::new());
    let metrics = Arc::new(MetricsRegistry::new());
    let proxier = Proxier::new(
        config,
        KernelHandles {
            iptables: ipt.clone(),
            conntrack: conntrack.clone(),
            ports: ports.clone(),
            node_addresses: Arc::new(FakeNodeAddresses::new(&["10.0.0.21", "203.0.113.7"])),
        },
        metrics.clone(),
    )
    .unwrap();
    proxier.on_services_synced();
    proxier.on_endpoints_synced();
    proxier.sync_proxy_rules().await;
    Harness {
        proxier,
        ipt,
        conntrack,
        ports,
        metrics,
    }
}

async fn harness() -> Harness {
    harness_with(ProxierConfig {
        hostname: "node-a".into(),
        ..Default::default()
    })
    .await
}

fn service(name: &str, cluster_ip: &str, port_name: &str, port: u16, protocol: Protocol) -> Service {
    Service {
        name: name.into(),
        namespace: "default".into(),
        spec: ServiceSpec {
            cluster_ip: Some(cluster_ip.into()),
            ports: vec![ServicePort {
                name: port_name.into(),
                protocol,
                port,
                node_port: None,
            }],
            ..Default::default()
        },
        status: ServiceStatus::default(),
    }
}

fn node_port_service(name: &str, cluster_ip: &str, port_name: &str, port: u16, node_port: u16, protocol: Protocol) -> Service {
    let mut svc = service(name, cluster_ip, port_name, port, protocol);
    svc.spec.service_type = ServiceType::NodePort;
    svc.spec.ports[0].node_port = Some(node_port);
    svc
}

fn endpoints(name: &str, port_name: &str, port: u16, protocol: Protocol, addrs: &[(&str, &str)]) -> Endpoints {
    Endpoints {
        name: name.into(),
        namespace: "default".into(),
        subsets: vec![EndpointSubset {
            addresses: addrs
                .iter()
                .map(|(ip, node)| EndpointAddress {
                    ip: ip.to_string(),
                    node_name: Some(node.to_string()),
                })
                .collect(),
            ports: vec![EndpointPort {
                name: port_name.into(),
                port,
                protocol,
            }],
        }],
    }
}

#[tokio::test]
async fn two_endpoints_split_evenly() {
    let h = harness().await;
    h.proxier
        .on_service_add(&service("foo", "10.0.0.5", "http", 80, Protocol::Tcp));
    h.proxier.on_endpoints_add(&endpoints(
        "foo",
        "http",
        8080,
        Protocol::Tcp,
        &[("10.1.1.1", "node-a"), ("10.1.1.2", "node-b")],
    ));
    h.proxier.sync_proxy_rules().await;

    let name = "default/foo:http";
    let svc_chain = service_chain_name(ChainRole::Service, name, Protocol::Tcp);
    let sep1 = endpoint_chain_name(name, Protocol::Tcp, "10.1.1.1:8080");
    let sep2 = endpoint_chain_name(name, Protocol::Tcp, "10.1.1.2:8080");

    let data = h.proxier.last_restore().await.unwrap();
    let portal: Vec<_> = data.nat.rules_in("KUBE-SERVICES").collect();
    assert_eq!(portal[0].jump_target(), Some(svc_chain.as_str()));
    assert!(portal[0].has(&Match::Destination("10.0.0.5/32".into())));
    assert!(portal[0].has(&Match::DestPort(80)));

    let balance: Vec<_> = data.nat.rules_in(&svc_chain).collect();
    assert_eq!(balance.len(), 2);
    assert_eq!(balance[0].probability(), Some("0.50000"));
    assert_eq!(balance[0].jump_target(), Some(sep1.as_str()));
    assert_eq!(balance[1].probability(), None);
    assert_eq!(balance[1].jump_target(), Some(sep2.as_str()));

    assert_eq!(
        h.ipt.rules(Table::Nat, &sep1),
        vec![
            format!("-A {} -m comment --comment \"default/foo:http\" -s 10.1.1.1/32 -j KUBE-MARK-MASQ", sep1),
            format!("-A {} -m comment --comment \"default/foo:http\" -m tcp -p tcp -j DNAT --to-destination 10.1.1.1:8080", sep1),
        ]
    );

    assert_eq!(h.metrics.gauge_value(PROXY_SERVICES), Some(1));
    assert_eq!(h.metrics.gauge_value(PROXY_ENDPOINTS), Some(2));
}

#[tokio::test]
async fn three_endpoints_use_decreasing_probabilities() {
    let h = harness().await;
    h.proxier
        .on_service_add(&service("foo", "10.0.0.5", "http", 80, Protocol::Tcp));
    h.proxier.on_endpoints_add(&endpoints(
        "foo",
        "http",
        8080,
        Protocol::Tcp,
        &[("10.1.1.1", "n"), ("10.1.1.2", "n"), ("10.1.1.3", "n")],
    ));
    h.proxier.sync_proxy_rules().await;

    let svc_chain = service_chain_name(ChainRole::Service, "default/foo:http", Protocol::Tcp);
    let data = h.proxier.last_restore().await.unwrap();
    let probabilities: Vec<_> = data.nat.rules_in(&svc_chain).map(|r| r.probability()).collect();
    assert_eq!(probabilities, vec![Some("0.33333"), Some("0.50000"), None]);
}

#[tokio::test]
async fn removed_endpoint_chain_is_deleted() {
    let h = harness().await;
    let v1 = endpoints(
        "foo",
        "http",
        8080,
        Protocol::Tcp,
        &[("10.1.1.1", "node-a"), ("10.1.1.2", "node-b")],
    );
    h.proxier
        .on_service_add(&service("foo", "10.0.0.5", "http", 80, Protocol::Tcp));
    h.proxier.on_endpoints_add(&v1);
    h.proxier.sync_proxy_rules().await;

    let name = "default/foo:http";
    let sep1 = endpoint_chain_name(name, Protocol::Tcp, "10.1.1.1:8080");
    let sep2 = endpoint_chain_name(name, Protocol::Tcp, "10.1.1.2:8080");
    assert!(h.ipt.has_chain(Table::Nat, &sep1));

    let v2 = endpoints("foo", "http", 8080, Protocol::Tcp, &[("10.1.1.2", "node-b")]);
    h.proxier.on_endpoints_update(&v1, &v2);
    h.proxier.sync_proxy_rules().await;

    assert!(!h.ipt.has_chain(Table::Nat, &sep1));
    assert!(h.ipt.has_chain(Table::Nat, &sep2));

    let svc_chain = service_chain_name(ChainRole::Service, name, Protocol::Tcp);
    let data = h.proxier.last_restore().await.unwrap();
    let balance: Vec<_> = data.nat.rules_in(&svc_chain).collect();
    assert_eq!(balance.len(), 1);
    assert_eq!(balance[0].probability(), None);
    assert_eq!(balance[0].jump_target(), Some(sep2.as_str()));
    assert_eq!(data.nat.deleted_chains().collect::<Vec<_>>(), vec![sep1.as_str()]);

    // TCP endpoints leave conntrack alone.
    assert!(h.conntrack.calls().is_empty());
}

#[tokio::test]
async fn service_without_endpoints_is_rejected() {
    let h = harness().await;
    h.proxier
        .on_service_add(&service("foo", "10.0.0.5", "http", 80, Protocol::Tcp));
    h.proxier.sync_proxy_rules().await;

    assert_eq!(
        h.ipt.rules(Table::Filter, "KUBE-SERVICES"),
        vec!["-A KUBE-SERVICES -m comment --comment \"default/foo:http has no endpoints\" -m tcp -p tcp -d 10.0.0.5/32 --dport 80 -j REJECT"]
    );
    let svc_chain = service_chain_name(ChainRole::Service, "default/foo:http", Protocol::Tcp);
    assert!(!h.ipt.has_chain(Table::Nat, &svc_chain));
}

#[tokio::test]
async fn udp_node_port_losing_endpoints() {
    let h = harness().await;
    let svc = node_port_service("dns", "10.0.0.10", "dns", 53, 30080, Protocol::Udp);
    let eps = endpoints("dns", "dns", 5353, Protocol::Udp, &[("10.1.1.1", "node-b")]);
    h.proxier.on_service_add(&svc);
    h.proxier.on_endpoints_add(&eps);
    h.proxier.sync_proxy_rules().await;

    let node_port = LocalPort {
        description: "nodePort for default/dns:dns".into(),
        ip: None,
        port: 30080,
        protocol: Protocol::Udp,
    };
    assert!(h.ports.is_open(&node_port));
    // A freshly opened UDP node port flushes stale conntrack state.
    assert!(h.conntrack.calls().contains(&ConntrackCall::Port {
        port: 30080,
        protocol: Protocol::Udp,
    }));
    assert_eq!(h.ipt.rules(Table::Nat, "KUBE-NODEPORTS").len(), 2);

    h.conntrack.clear();
    h.proxier.on_endpoints_delete(&eps);
    h.proxier.sync_proxy_rules().await;

    assert!(h.ipt.rules(Table::Nat, "KUBE-NODEPORTS").is_empty());
    assert!(h.ipt.rules(Table::Filter, "KUBE-EXTERNAL-SERVICES").contains(
        &"-A KUBE-EXTERNAL-SERVICES -m comment --comment \"default/dns:dns has no endpoints\" -m addrtype --dst-type LOCAL -m udp -p udp --dport 30080 -j REJECT".to_string()
    ));

    // The socket stays held across syncs.
    assert!(h.ports.is_open(&node_port));
    assert_eq!(h.ports.open_count(&node_port), 1);
    assert_eq!(h.proxier.held_ports().await, vec![node_port]);

    let calls = h.conntrack.calls();
    assert!(calls.contains(&ConntrackCall::Nat {
        origin: "10.0.0.10".into(),
        dest: "10.1.1.1".into(),
        protocol: Protocol::Udp,
    }));
    assert!(calls.contains(&ConntrackCall::Port {
        port: 30080,
        protocol: Protocol::Udp,
    }));
}

#[tokio::test]
async fn deleted_udp_service_flushes_its_cluster_ip() {
    let h = harness().await;
    let svc = service("dns", "10.0.0.10", "dns", 53, Protocol::Udp);
    h.proxier.on_service_add(&svc);
    h.proxier.sync_proxy_rules().await;
    h.conntrack.clear();

    h.proxier.on_service_delete(&svc);
    h.proxier.sync_proxy_rules().await;
    assert_eq!(
        h.conntrack.calls(),
        vec![ConntrackCall::Ip {
            ip: "10.0.0.10".into(),
            protocol: Protocol::Udp,
        }]
    );
    assert_eq!(h.proxier.service_count().await, 0);
}

#[tokio::test]
async fn stale_udp_ip_is_flushed_after_a_failed_restore() {
    let h = harness().await;
    let svc = service("dns", "10.0.0.10", "dns", 53, Protocol::Udp);
    h.proxier.on_service_add(&svc);
    h.proxier.sync_proxy_rules().await;
    h.conntrack.clear();

    h.proxier.on_service_delete(&svc);
    h.ipt.fail_next_restores(1);
    h.proxier.sync_proxy_rules().await;
    assert!(h.conntrack.calls().is_empty());

    h.proxier.sync_proxy_rules().await;
    assert_eq!(
        h.conntrack.calls(),
        vec![ConntrackCall::Ip {
            ip: "10.0.0.10".into(),
            protocol: Protocol::Udp,
        }]
    );

    // Flushed once, then forgotten.
    h.conntrack.clear();
    h.proxier.sync_proxy_rules().await;
    assert!(h.conntrack.calls().is_empty());
}

#[tokio::test]
async fn stale_udp_endpoint_is_flushed_after_a_failed_save() {
    let h = harness().await;
    let svc = service("dns", "10.0.0.10", "dns", 53, Protocol::Udp);
    let v1 = endpoints(
        "dns",
        "dns",
        5353,
        Protocol::Udp,
        &[("10.1.1.1", "node-b"), ("10.1.1.2", "node-b")],
    );
    let v2 = endpoints("dns", "dns", 5353, Protocol::Udp, &[("10.1.1.2", "node-b")]);
    h.proxier.on_service_add(&svc);
    h.proxier.on_endpoints_add(&v1);
    h.proxier.sync_proxy_rules().await;
    h.conntrack.clear();

    h.proxier.on_endpoints_update(&v1, &v2);
    h.ipt.set_fail_saves(true);
    h.proxier.sync_proxy_rules().await;
    assert!(h.conntrack.calls().is_empty());

    h.ipt.set_fail_saves(false);
    h.proxier.sync_proxy_rules().await;
    assert_eq!(
        h.conntrack.calls(),
        vec![ConntrackCall::Nat {
            origin: "10.0.0.10".into(),
            dest: "10.1.1.1".into(),
            protocol: Protocol::Udp,
        }]
    );
}

#[tokio::test]
async fn external_and_load_balancer_ips_without_endpoints_are_rejected() {
    let h = harness().await;
    let mut svc = service("foo", "10.0.0.5", "http", 80, Protocol::Tcp);
    svc.spec.service_type = ServiceType::LoadBalancer;
    svc.spec.external_ips = vec!["192.0.2.50".into()];
    svc.status.load_balancer_ingress = vec![LoadBalancerIngress {
        ip: Some("198.51.100.9".into()),
        hostname: None,
    }];
    h.proxier.on_service_add(&svc);
    h.proxier.sync_proxy_rules().await;

    let rejects = h.ipt.rules(Table::Filter, "KUBE-EXTERNAL-SERVICES");
    assert_eq!(
        rejects,
        vec![
            "-A KUBE-EXTERNAL-SERVICES -m comment --comment \"default/foo:http has no endpoints\" -m tcp -p tcp -d 192.0.2.50/32 --dport 80 -j REJECT",
            "-A KUBE-EXTERNAL-SERVICES -m comment --comment \"default/foo:http has no endpoints\" -m tcp -p tcp -d 198.51.100.9/32 --dport 80 -j REJECT",
        ]
    );
    // Nothing is captured in nat for either address.
    let data = h.proxier.last_restore().await.unwrap();
    for vip in ["192.0.2.50/32", "198.51.100.9/32"] {
        assert!(
            !data
                .nat
                .rules()
                .any(|r| r.has(&Match::Destination(vip.into())))
        );
    }
    let fw = service_chain_name(ChainRole::Firewall, "default/foo:http", Protocol::Tcp);
    assert!(!h.ipt.has_chain(Table::Nat, &fw));
}

#[tokio::test]
async fn resync_without_changes_is_byte_identical() {
    let h = harness().await;
    let mut svc = node_port_service("foo", "10.0.0.5", "http", 80, 30081, Protocol::Tcp);
    svc.spec.session_affinity = SessionAffinity::ClientIP;
    h.proxier.on_service_add(&svc);
    h.proxier.on_endpoints_add(&endpoints(
        "foo",
        "http",
        8080,
        Protocol::Tcp,
        &[("10.1.1.1", "node-a"), ("10.1.1.2", "node-b")],
    ));
    h.proxier.sync_proxy_rules().await;
    let nat = h.ipt.dump(Table::Nat);
    let filter = h.ipt.dump(Table::Filter);
    let first = h.ipt.last_restore();

    h.proxier.sync_proxy_rules().await;
    assert_eq!(h.ipt.dump(Table::Nat), nat);
    assert_eq!(h.ipt.dump(Table::Filter), filter);
    assert_eq!(h.ipt.last_restore(), first);
}

#[tokio::test]
async fn session_affinity_checks_recent_lists_first() {
    let h = harness().await;
    let mut svc = service("foo", "10.0.0.5", "http", 80, Protocol::Tcp);
    svc.spec.session_affinity = SessionAffinity::ClientIP;
    svc.spec.session_affinity_timeout_seconds = Some(600);
    h.proxier.on_service_add(&svc);
    h.proxier.on_endpoints_add(&endpoints(
        "foo",
        "http",
        8080,
        Protocol::Tcp,
        &[("10.1.1.1", "n"), ("10.1.1.2", "n")],
    ));
    h.proxier.sync_proxy_rules().await;

    let name = "default/foo:http";
    let svc_chain = service_chain_name(ChainRole::Service, name, Protocol::Tcp);
    let sep1 = endpoint_chain_name(name, Protocol::Tcp, "10.1.1.1:8080");
    let data = h.proxier.last_restore().await.unwrap();
    let rules: Vec<_> = data.nat.rules_in(&svc_chain).collect();
    assert_eq!(rules.len(), 4);
    assert!(rules[0].has(&Match::RecentCheck {
        name: sep1.clone(),
        seconds: 600,
    }));
    assert_eq!(rules[0].jump_target(), Some(sep1.as_str()));
    assert_eq!(rules[2].probability(), Some("0.50000"));

    let dnat = data
        .nat
        .rules_in(&sep1)
        .find(|r| matches!(r.target, Target::Dnat(_)))
        .unwrap();
    assert!(dnat.has(&Match::RecentSet { name: sep1.clone() }));
}

#[tokio::test]
async fn local_policy_without_local_endpoints_drops() {
    let h = harness().await;
    let mut svc = node_port_service("foo", "10.0.0.5", "http", 80, 30082, Protocol::Tcp);
    svc.spec.external_traffic_policy = ExternalTrafficPolicy::Local;
    h.proxier.on_service_add(&svc);
    h.proxier.on_endpoints_add(&endpoints(
        "foo",
        "http",
        8080,
        Protocol::Tcp,
        &[("10.1.1.2", "node-b")],
    ));
    h.proxier.sync_proxy_rules().await;

    let name = "default/foo:http";
    let xlb = service_chain_name(ChainRole::Xlb, name, Protocol::Tcp);
    assert_eq!(
        h.ipt.rules(Table::Nat, &xlb),
        vec![format!(
            "-A {} -m comment --comment \"default/foo:http has no local endpoints\" -j KUBE-MARK-DROP",
            xlb
        )]
    );
    let nodeports = h.ipt.rules(Table::Nat, "KUBE-NODEPORTS");
    assert_eq!(nodeports.len(), 2);
    assert!(nodeports[0].contains("-s 127.0.0.0/8"));
    assert!(nodeports[1].ends_with(&format!("-j {}", xlb)));
}

#[tokio::test]
async fn local_policy_balances_only_local_endpoints() {
    let h = harness().await;
    let mut svc = node_port_service("foo", "10.0.0.5", "http", 80, 30083, Protocol::Tcp);
    svc.spec.external_traffic_policy = ExternalTrafficPolicy::Local;
    h.proxier.on_service_add(&svc);
    h.proxier.on_endpoints_add(&endpoints(
        "foo",
        "http",
        8080,
        Protocol::Tcp,
        &[("10.1.1.1", "node-a"), ("10.1.1.2", "node-b")],
    ));
    h.proxier.sync_proxy_rules().await;

    let name = "default/foo:http";
    let xlb = service_chain_name(ChainRole::Xlb, name, Protocol::Tcp);
    let local = endpoint_chain_name(name, Protocol::Tcp, "10.1.1.1:8080");
    let data = h.proxier.last_restore().await.unwrap();
    let rules: Vec<_> = data.nat.rules_in(&xlb).collect();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].jump_target(), Some(local.as_str()));
    assert_eq!(rules[0].probability(), None);
}

#[tokio::test]
async fn load_balancer_source_ranges_gate_the_firewall_chain() {
    let h = harness_with(ProxierConfig {
        hostname: "node-a".into(),
        node_ip: Some("10.0.0.21".parse().unwrap()),
        ..Default::default()
    })
    .await;
    let mut svc = node_port_service("web", "10.0.0.6", "https", 443, 30443, Protocol::Tcp);
    svc.spec.service_type = ServiceType::LoadBalancer;
    svc.spec.load_balancer_source_ranges = vec!["10.0.0.0/24".into()];
    svc.status.load_balancer_ingress = vec![LoadBalancerIngress {
        ip: Some("198.51.100.9".into()),
        hostname: None,
    }];
    h.proxier.on_service_add(&svc);
    h.proxier.on_endpoints_add(&endpoints(
        "web",
        "https",
        8443,
        Protocol::Tcp,
        &[("10.1.1.1", "node-a")],
    ));
    h.proxier.sync_proxy_rules().await;

    let name = "default/web:https";
    let fw = service_chain_name(ChainRole::Firewall, name, Protocol::Tcp);
    let svc_chain = service_chain_name(ChainRole::Service, name, Protocol::Tcp);
    let data = h.proxier.last_restore().await.unwrap();

    assert!(
        data.nat
            .rules_in("KUBE-SERVICES")
            .any(|r| r.has(&Match::Destination("198.51.100.9/32".into()))
                && r.jump_target() == Some(fw.as_str()))
    );
    let rules: Vec<_> = data.nat.rules_in(&fw).collect();
    let targets: Vec<_> = rules.iter().map(|r| r.jump_target().unwrap()).collect();
    assert_eq!(
        targets,
        vec!["KUBE-MARK-MASQ", svc_chain.as_str(), svc_chain.as_str(), "KUBE-MARK-DROP"]
    );
    assert!(rules[1].has(&Match::Source {
        cidr: "10.0.0.0/24".into(),
        negated: false,
    }));
    // The node's own address is in range, so the VIP itself is allowed.
    assert!(rules[2].has(&Match::Source {
        cidr: "198.51.100.9/32".into(),
        negated: false,
    }));
}

#[tokio::test]
async fn local_external_ip_holds_a_socket() {
    let h = harness().await;
    let mut svc = service("foo", "10.0.0.5", "http", 80, Protocol::Tcp);
    svc.spec.external_ips = vec!["203.0.113.7".into(), "192.0.2.50".into()];
    h.proxier.on_service_add(&svc);
    h.proxier.on_endpoints_add(&endpoints(
        "foo",
        "http",
        8080,
        Protocol::Tcp,
        &[("10.1.1.1", "node-a")],
    ));
    h.proxier.sync_proxy_rules().await;

    assert_eq!(
        h.proxier.held_ports().await,
        vec![LocalPort {
            description: "externalIP for default/foo:http".into(),
            ip: Some("203.0.113.7".into()),
            port: 80,
            protocol: Protocol::Tcp,
        }]
    );
    let data = h.proxier.last_restore().await.unwrap();
    for ip in ["203.0.113.7/32", "192.0.2.50/32"] {
        let count = data
            .nat
            .rules_in("KUBE-SERVICES")
            .filter(|r| r.has(&Match::Destination(ip.into())))
            .count();
        assert_eq!(count, 3, "rules for {}", ip);
    }
}

#[tokio::test]
async fn node_port_bind_failure_skips_only_node_port_rules() {
    let h = harness().await;
    h.ports.fail_on(30084);
    h.proxier
        .on_service_add(&node_port_service("foo", "10.0.0.5", "http", 80, 30084, Protocol::Tcp));
    h.proxier.on_endpoints_add(&endpoints(
        "foo",
        "http",
        8080,
        Protocol::Tcp,
        &[("10.1.1.1", "node-a")],
    ));
    h.proxier.sync_proxy_rules().await;

    assert!(h.ipt.rules(Table::Nat, "KUBE-NODEPORTS").is_empty());
    let svc_chain = service_chain_name(ChainRole::Service, "default/foo:http", Protocol::Tcp);
    assert!(h.ipt.has_chain(Table::Nat, &svc_chain));
    assert!(h.proxier.held_ports().await.is_empty());
}

#[tokio::test]
async fn failed_restore_releases_new_ports() {
    let h = harness().await;
    h.ipt.fail_next_restores(1);
    h.proxier
        .on_service_add(&node_port_service("foo", "10.0.0.5", "http", 80, 30085, Protocol::Tcp));
    h.proxier.on_endpoints_add(&endpoints(
        "foo",
        "http",
        8080,
        Protocol::Tcp,
        &[("10.1.1.1", "node-a")],
    ));
    h.proxier.sync_proxy_rules().await;

    let node_port = LocalPort {
        description: "nodePort for default/foo:http".into(),
        ip: None,
        port: 30085,
        protocol: Protocol::Tcp,
    };
    assert!(!h.ports.is_open(&node_port));
    assert!(h.proxier.held_ports().await.is_empty());
    assert_eq!(h.metrics.counter_value(SYNC_PROXY_RULES_FAILURES), Some(1));

    h.proxier.sync_proxy_rules().await;
    assert!(h.ports.is_open(&node_port));
    assert_eq!(h.ports.open_count(&node_port), 2);
}

#[tokio::test]
async fn foreign_chains_survive_syncs() {
    let h = harness().await;
    h.ipt
        .load("*nat\n:CNI-HOSTPORT-DNAT - [3:180]\n-A CNI-HOSTPORT-DNAT -j RETURN\nCOMMIT\n")
        .unwrap();
    h.proxier
        .on_service_add(&service("foo", "10.0.0.5", "http", 80, Protocol::Tcp));
    h.proxier.sync_proxy_rules().await;

    assert_eq!(
        h.ipt.rules(Table::Nat, "CNI-HOSTPORT-DNAT"),
        vec!["-A CNI-HOSTPORT-DNAT -j RETURN"]
    );
    assert!(h.ipt.dump(Table::Nat).contains(":CNI-HOSTPORT-DNAT - [3:180]"));
}

#[tokio::test]
async fn handlers_before_sync_only_queue_changes() {
    let ipt = Arc::new(FakeIptables::new());
    let proxier = Proxier::new(
        ProxierConfig {
            hostname: "node-a".into(),
            ..Default::default()
        },
        KernelHandles {
            iptables: ipt.clone(),
            conntrack: Arc::new(FakeConntrack::new()),
            ports: Arc::new(FakePortOpener::new()),
            node_addresses: Arc::new(FakeNodeAddresses::new(&["10.0.0.21"])),
        },
        Arc::new(MetricsRegistry::new()),
    )
    .unwrap();

    proxier.on_service_add(&service("foo", "10.0.0.5", "http", 80, Protocol::Tcp));
    proxier.sync_proxy_rules().await;
    assert_eq!(ipt.restore_count(), 0);

    proxier.on_endpoints_synced();
    proxier.on_services_synced();
    assert_eq!(ipt.restore_count(), 0);
    proxier.sync_proxy_rules().await;
    assert_eq!(ipt.restore_count(), 1);
    assert_eq!(proxier.service_count().await, 1);
}
