//! The iptables rule synchronizer.
//!
//! Every sync rebuilds the proxy's complete rule set for both the `filter`
//! and `nat` tables and hands it to the kernel in one `iptables-restore
//! --noflush` call. Chains that are kept are re-declared with their saved
//! definition line so packet counters survive, chains that are no longer
//! needed are flushed and deleted, and chains outside the proxy's naming
//! scheme are never touched.

use anyhow::Context;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use ipnet::IpNet;
use pkg_constants::chains::{
    FORWARD, INPUT, KUBE_EXTERNAL_SERVICES, KUBE_FIREWALL, KUBE_FORWARD, KUBE_MARK_DROP,
    KUBE_MARK_MASQ, KUBE_NODEPORTS, KUBE_POSTROUTING, KUBE_SERVICES, OUTPUT,
    OWNED_CHAIN_PREFIXES, POSTROUTING, PREROUTING,
};
use pkg_constants::network::{DEFAULT_MASQUERADE_BIT, IPV4_LOOPBACK_CIDR, IPV6_LOOPBACK_CIDR};
use pkg_constants::proxy::{
    DEFAULT_BURST_SYNCS, DEFAULT_MIN_SYNC_PERIOD_SECS, DEFAULT_SYNC_PERIOD_SECS, SYNC_RUNNER_NAME,
};
use pkg_metrics::MetricsRegistry;
use pkg_network::addresses::{NodeAddresses, is_zero_cidr, node_port_addresses, to_cidr};
use pkg_network::conntrack::Conntrack;
use pkg_network::iptables::{FlushMode, Iptables, RestoreCounters, RulePosition, Table, chain_lines};
use pkg_network::ports::{Claim, LocalPort, LocalPortSet, PortOpener, PortReservation};
use pkg_network::rules::{Match, RestoreData, Rule, Target};
use pkg_types::endpoint::Endpoints;
use pkg_types::service::{Protocol, Service, SessionAffinity};
use pkg_types::validate::{validate_masquerade_bit, validate_sync_periods};

use crate::endpoints::{EndpointChangeTracker, EndpointInfo, EndpointsMap, StaleEndpoint};
use crate::health::HealthState;
use crate::metrics::{
    PROXY_ENDPOINTS, PROXY_SERVICES, SYNC_PROXY_RULES_DURATION, SYNC_PROXY_RULES_FAILURES,
    SYNC_PROXY_RULES_LAST_TIMESTAMP, SYNC_PROXY_RULES_TOTAL,
};
use crate::probability::ProbabilityTable;
use crate::runner::BoundedFrequencyRunner;
use crate::service::{ServiceChangeTracker, ServiceInfo, ServiceMap};

/// A jump from a built-in chain into one of the proxy's top-level chains.
#[derive(Debug, Clone, Copy)]
pub(crate) struct JumpChain {
    pub table: Table,
    pub chain: &'static str,
    pub source: &'static str,
    pub comment: Option<&'static str>,
    /// Only jump for connections in state NEW.
    pub new_only: bool,
}

impl JumpChain {
    pub fn rule(&self) -> Rule {
        let mut rule = Rule::in_chain(self.source);
        if self.new_only {
            rule = rule.with(Match::CtState("NEW"));
        }
        if let Some(comment) = self.comment {
            rule = rule.comment(comment);
        }
        rule.jump(self.chain)
    }
}

pub(crate) const JUMP_CHAINS: &[JumpChain] = &[
    JumpChain {
        table: Table::Filter,
        chain: KUBE_EXTERNAL_SERVICES,
        source: INPUT,
        comment: Some("kubernetes externally-visible service portals"),
        new_only: true,
    },
    JumpChain {
        table: Table::Filter,
        chain: KUBE_SERVICES,
        source: OUTPUT,
        comment: Some("kubernetes service portals"),
        new_only: true,
    },
    JumpChain {
        table: Table::Nat,
        chain: KUBE_SERVICES,
        source: OUTPUT,
        comment: Some("kubernetes service portals"),
        new_only: false,
    },
    JumpChain {
        table: Table::Nat,
        chain: KUBE_SERVICES,
        source: PREROUTING,
        comment: Some("kubernetes service portals"),
        new_only: false,
    },
    JumpChain {
        table: Table::Nat,
        chain: KUBE_POSTROUTING,
        source: POSTROUTING,
        comment: Some("kubernetes postrouting rules"),
        new_only: false,
    },
    JumpChain {
        table: Table::Filter,
        chain: KUBE_FORWARD,
        source: FORWARD,
        comment: Some("kubernetes forwarding rules"),
        new_only: false,
    },
    JumpChain {
        table: Table::Filter,
        chain: KUBE_FIREWALL,
        source: INPUT,
        comment: None,
        new_only: false,
    },
    JumpChain {
        table: Table::Filter,
        chain: KUBE_FIREWALL,
        source: OUTPUT,
        comment: None,
        new_only: false,
    },
];

pub(crate) const FILTER_STATIC_CHAINS: &[&str] = &[
    KUBE_SERVICES,
    KUBE_EXTERNAL_SERVICES,
    KUBE_FORWARD,
    KUBE_FIREWALL,
];

pub(crate) const NAT_STATIC_CHAINS: &[&str] = &[
    KUBE_SERVICES,
    KUBE_NODEPORTS,
    KUBE_POSTROUTING,
    KUBE_MARK_MASQ,
    KUBE_MARK_DROP,
];

const NODEPORTS_TAIL_COMMENT: &str =
    "kubernetes service nodeports; NOTE: this must be the last rule in this chain";

/// Proxier settings.
#[derive(Debug, Clone)]
pub struct ProxierConfig {
    /// Node name; endpoints on this node are local.
    pub hostname: String,
    pub node_ip: Option<IpAddr>,
    pub cluster_cidr: Option<IpNet>,
    /// SNAT all service traffic, not only traffic from outside the cluster CIDR.
    pub masquerade_all: bool,
    pub masquerade_bit: u32,
    /// Empty means every local address.
    pub nodeport_addresses: Vec<IpNet>,
    pub min_sync_period: Duration,
    pub sync_period: Duration,
    pub burst_syncs: u32,
}

impl Default for ProxierConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            node_ip: None,
            cluster_cidr: None,
            masquerade_all: false,
            masquerade_bit: DEFAULT_MASQUERADE_BIT,
            nodeport_addresses: Vec::new(),
            min_sync_period: Duration::from_secs(DEFAULT_MIN_SYNC_PERIOD_SECS),
            sync_period: Duration::from_secs(DEFAULT_SYNC_PERIOD_SECS),
            burst_syncs: DEFAULT_BURST_SYNCS,
        }
    }
}

/// Kernel-facing collaborators.
#[derive(Clone)]
pub struct KernelHandles {
    pub iptables: Arc<dyn Iptables>,
    pub conntrack: Arc<dyn Conntrack>,
    pub ports: Arc<dyn PortOpener>,
    pub node_addresses: Arc<dyn NodeAddresses>,
}

/// `0x004000/0x004000` style fwmark for `bit`.
fn mark_for_bit(bit: u32) -> String {
    let value: u32 = 1 << bit;
    format!("{:#08x}/{:#08x}", value, value)
}

fn host_cidr(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{}/32", v4),
        IpAddr::V6(v6) => format!("{}/128", v6),
    }
}

fn is_ipv6_str(ip: &str) -> bool {
    ip.split('/')
        .next()
        .and_then(|a| a.parse::<IpAddr>().ok())
        .is_some_and(|a| a.is_ipv6())
}

struct ProxierState {
    service_map: ServiceMap,
    endpoints_map: EndpointsMap,
    ports: LocalPortSet,
    probabilities: ProbabilityTable,
    last_restore: Option<RestoreData>,
    /// UDP service IPs awaiting a conntrack flush. Kept until a restore succeeds.
    stale_service_ips: BTreeSet<String>,
    stale_endpoints: BTreeSet<StaleEndpoint>,
}

/// Per-sync scratch space.
struct SyncContext<'a> {
    data: RestoreData,
    existing_nat: &'a BTreeMap<String, String>,
    active_nat_chains: HashSet<String>,
    /// Generated chain name → identity that produced it.
    chain_owners: HashMap<String, String>,
    reservation: PortReservation<'a>,
    probabilities: &'a mut ProbabilityTable,
    local_ips: Vec<IpAddr>,
    node_addresses: Option<BTreeSet<String>>,
    new_udp_node_ports: BTreeSet<u16>,
}

impl SyncContext<'_> {
    fn declare_nat_chain(&mut self, chain: &str) {
        self.data.nat.declare_chain(chain, self.existing_nat);
        self.active_nat_chains.insert(chain.to_string());
    }

    /// Record `identity` as the owner of `chain`. Fails with the previous
    /// owner if a different identity already produced the same name.
    fn claim_chain(&mut self, chain: &str, identity: &str) -> Result<(), String> {
        match self.chain_owners.get(chain) {
            Some(owner) if owner != identity => Err(owner.clone()),
            Some(_) => Ok(()),
            None => {
                self.chain_owners
                    .insert(chain.to_string(), identity.to_string());
                Ok(())
            }
        }
    }
}

/// The rule synchronizer.
pub struct Proxier {
    config: ProxierConfig,
    masquerade_mark: String,
    drop_mark: String,
    ipv6: bool,

    iptables: Arc<dyn Iptables>,
    conntrack: Arc<dyn Conntrack>,
    node_addresses: Arc<dyn NodeAddresses>,

    service_changes: ServiceChangeTracker,
    endpoint_changes: EndpointChangeTracker,
    services_synced: AtomicBool,
    endpoints_synced: AtomicBool,
    initialized: AtomicBool,

    state: Mutex<ProxierState>,
    runner: BoundedFrequencyRunner,
    metrics: Arc<MetricsRegistry>,
    health: Arc<HealthState>,
}

impl Proxier {
    pub fn new(
        config: ProxierConfig,
        kernel: KernelHandles,
        metrics: Arc<MetricsRegistry>,
    ) -> anyhow::Result<Self> {
        validate_masquerade_bit(config.masquerade_bit)?;
        validate_sync_periods(config.min_sync_period, config.sync_period)?;
        if config.hostname.is_empty() {
            anyhow::bail!("hostname must be set to classify local endpoints");
        }
        let ipv6 = kernel.iptables.is_ipv6();
        if let Some(cidr) = &config.cluster_cidr {
            if cidr.addr().is_ipv6() != ipv6 {
                warn!(
                    "Cluster CIDR {} does not match the proxier's IP family; it will be ignored for masquerading",
                    cidr
                );
            }
        } else {
            warn!("Cluster CIDR not specified, unable to distinguish between internal and external traffic");
        }

        let runner = BoundedFrequencyRunner::new(
            SYNC_RUNNER_NAME,
            config.min_sync_period,
            config.sync_period,
            config.burst_syncs,
        )?;
        crate::metrics::register(&metrics);

        info!(
            "Creating iptables proxier for {} (ipv6={})",
            config.hostname, ipv6
        );
        Ok(Self {
            masquerade_mark: mark_for_bit(config.masquerade_bit),
            drop_mark: mark_for_bit(config.masquerade_bit + 1),
            ipv6,
            iptables: kernel.iptables,
            conntrack: kernel.conntrack,
            node_addresses: kernel.node_addresses,
            service_changes: ServiceChangeTracker::new(),
            endpoint_changes: EndpointChangeTracker::new(&config.hostname),
            services_synced: AtomicBool::new(false),
            endpoints_synced: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            state: Mutex::new(ProxierState {
                service_map: ServiceMap::new(),
                endpoints_map: EndpointsMap::new(),
                ports: LocalPortSet::new(kernel.ports),
                probabilities: ProbabilityTable::new(),
                last_restore: None,
                stale_service_ips: BTreeSet::new(),
                stale_endpoints: BTreeSet::new(),
            }),
            runner,
            metrics,
            health: Arc::new(HealthState::new(config.sync_period)),
            config,
        })
    }

    pub fn health(&self) -> Arc<HealthState> {
        self.health.clone()
    }

    pub fn masquerade_mark(&self) -> &str {
        &self.masquerade_mark
    }

    /// Both the Service and the Endpoints source have delivered a full list.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    // ─── Event handlers ──────────────────────────────────────────────

    pub fn on_service_add(&self, svc: &Service) {
        self.on_service_change(None, Some(svc));
    }

    pub fn on_service_update(&self, old: &Service, new: &Service) {
        self.on_service_change(Some(old), Some(new));
    }

    pub fn on_service_delete(&self, svc: &Service) {
        self.on_service_change(Some(svc), None);
    }

    fn on_service_change(&self, old: Option<&Service>, new: Option<&Service>) {
        if self.service_changes.update(old, new) && self.is_initialized() {
            self.sync();
        }
    }

    pub fn on_services_synced(&self) {
        self.services_synced.store(true, Ordering::Release);
        self.update_initialized();
    }

    pub fn on_endpoints_add(&self, ep: &Endpoints) {
        self.on_endpoints_change(None, Some(ep));
    }

    pub fn on_endpoints_update(&self, old: &Endpoints, new: &Endpoints) {
        self.on_endpoints_change(Some(old), Some(new));
    }

    pub fn on_endpoints_delete(&self, ep: &Endpoints) {
        self.on_endpoints_change(Some(ep), None);
    }

    fn on_endpoints_change(&self, old: Option<&Endpoints>, new: Option<&Endpoints>) {
        if self.endpoint_changes.update(old, new) && self.is_initialized() {
            self.sync();
        }
    }

    pub fn on_endpoints_synced(&self) {
        self.endpoints_synced.store(true, Ordering::Release);
        self.update_initialized();
    }

    /// Once both sources have synced, queue the first sync on the runner.
    fn update_initialized(&self) {
        let ready = self.services_synced.load(Ordering::Acquire)
            && self.endpoints_synced.load(Ordering::Acquire);
        if ready && !self.initialized.swap(true, Ordering::AcqRel) {
            self.sync();
        }
    }

    /// Queue a sync through the rate limiter.
    pub fn sync(&self) {
        self.health.queued_update();
        self.runner.run();
    }

    /// Run syncs until `shutdown` is set.
    pub async fn sync_loop(&self, shutdown: watch::Receiver<bool>) {
        self.health.updated();
        self.runner
            .run_loop(|| self.sync_proxy_rules(), shutdown)
            .await;
    }

    // ─── Introspection ───────────────────────────────────────────────

    /// The structured rule set of the last restore attempt.
    pub async fn last_restore(&self) -> Option<RestoreData> {
        self.state.lock().await.last_restore.clone()
    }

    pub async fn held_ports(&self) -> Vec<LocalPort> {
        let state = self.state.lock().await;
        let mut ports: Vec<LocalPort> = state.ports.ports().cloned().collect();
        ports.sort_by(|a, b| (a.port, &a.ip, &a.description).cmp(&(b.port, &b.ip, &b.description)));
        ports
    }

    pub async fn service_count(&self) -> usize {
        self.state.lock().await.service_map.len()
    }

    // ─── Sync ────────────────────────────────────────────────────────

    /// Rebuild and apply the full rule set. A no-op until initialized.
    pub async fn sync_proxy_rules(&self) {
        let mut state = self.state.lock().await;
        if !self.is_initialized() {
            info!("Not syncing iptables until Services and Endpoints have been received");
            return;
        }

        let start = Instant::now();
        let result = self.sync_locked(&mut state).await;
        let elapsed = start.elapsed();
        self.metrics.observe(SYNC_PROXY_RULES_DURATION, elapsed);
        self.metrics.counter_inc(SYNC_PROXY_RULES_TOTAL);
        match result {
            Ok(()) => debug!("iptables sync took {:?}", elapsed),
            Err(e) => {
                self.metrics.counter_inc(SYNC_PROXY_RULES_FAILURES);
                error!("iptables sync failed after {:?}: {:#}", elapsed, e);
            }
        }
    }

    async fn sync_locked(&self, state: &mut ProxierState) -> anyhow::Result<()> {
        let ProxierState {
            service_map,
            endpoints_map,
            ports,
            probabilities,
            last_restore,
            stale_service_ips,
            stale_endpoints,
        } = state;

        stale_service_ips.extend(service_map.apply(&self.service_changes));
        let endpoints_update = endpoints_map.apply(&self.endpoint_changes);
        stale_endpoints.extend(endpoints_update.stale_endpoints);
        for name in &endpoints_update.stale_service_names {
            if let Some(info) = service_map.get(name) {
                if info.protocol == Protocol::Udp {
                    stale_service_ips.insert(info.cluster_ip.to_string());
                }
            }
        }

        self.ensure_jump_chains().await?;

        let existing_filter = chain_lines(
            Table::Filter,
            &self
                .iptables
                .save_into(Table::Filter)
                .await
                .context("failed to save filter table")?,
        );
        let existing_nat = chain_lines(
            Table::Nat,
            &self
                .iptables
                .save_into(Table::Nat)
                .await
                .context("failed to save nat table")?,
        );

        let node_addresses =
            match node_port_addresses(&self.config.nodeport_addresses, &*self.node_addresses) {
                Ok(addrs) => Some(addrs),
                Err(e) => {
                    error!("Failed to get node addresses matching nodeport CIDRs: {:#}", e);
                    None
                }
            };
        let local_ips = self.node_addresses.local_addresses().unwrap_or_else(|e| {
            warn!("Failed to list local addresses, treating external IPs as remote: {:#}", e);
            Vec::new()
        });

        let mut ctx = SyncContext {
            data: RestoreData::new(),
            existing_nat: &existing_nat,
            active_nat_chains: HashSet::new(),
            chain_owners: HashMap::new(),
            reservation: ports.begin(),
            probabilities,
            local_ips,
            node_addresses,
            new_udp_node_ports: BTreeSet::new(),
        };

        self.write_static_rules(&mut ctx, &existing_filter);

        for (name, svc) in service_map.iter() {
            if svc.cluster_ip.is_ipv6() != self.ipv6 {
                debug!("Skipping {}: cluster IP family does not match", name);
                continue;
            }
            let endpoints = endpoints_map.get(name).unwrap_or(&[]);
            self.write_service(&mut ctx, svc, endpoints);
        }

        // Flush and delete chains we own that nothing uses any more.
        for (chain, line) in &existing_nat {
            if ctx.active_nat_chains.contains(chain) {
                continue;
            }
            if OWNED_CHAIN_PREFIXES.iter().any(|p| chain.starts_with(p)) {
                debug!("Deleting stale chain {}", chain);
                ctx.data.nat.delete_chain(chain, line);
            }
        }

        self.write_nodeports_tail(&mut ctx);
        self.write_forward_rules(&mut ctx);

        let SyncContext {
            data,
            reservation,
            new_udp_node_ports,
            ..
        } = ctx;

        for port in new_udp_node_ports {
            if let Err(e) = self
                .conntrack
                .clear_entries_for_port(port, self.ipv6, Protocol::Udp)
                .await
            {
                error!("Failed to clear udp conntrack for port {}: {}", port, e);
            }
        }

        let rendered = data.render();
        debug!("Restoring iptables rules:\n{}", rendered);
        let restored = self
            .iptables
            .restore_all(rendered.as_bytes(), FlushMode::NoFlush, RestoreCounters::Restore)
            .await;
        *last_restore = Some(data);
        if let Err(e) = restored {
            let reverted = reservation.revert();
            if reverted > 0 {
                warn!("Closed {} local ports opened during the failed sync", reverted);
            }
            return Err(e).context("failed to execute iptables-restore");
        }

        for closed in reservation.commit() {
            debug!("Released {}", closed);
        }

        self.health.updated();
        self.metrics
            .gauge_set(SYNC_PROXY_RULES_LAST_TIMESTAMP, chrono::Utc::now().timestamp());
        self.metrics
            .gauge_set(PROXY_SERVICES, service_map.len() as i64);
        self.metrics
            .gauge_set(PROXY_ENDPOINTS, endpoints_map.endpoint_count() as i64);

        for ip in &std::mem::take(stale_service_ips) {
            if let Err(e) = self.conntrack.clear_entries_for_ip(ip, Protocol::Udp).await {
                error!("Failed to delete stale service IP {} connections: {}", ip, e);
            }
        }
        for stale in &std::mem::take(stale_endpoints) {
            let Some(svc) = service_map.get(&stale.service) else {
                continue;
            };
            if svc.protocol != Protocol::Udp {
                continue;
            }
            let endpoint_ip = stale.endpoint.ip();
            let origins = std::iter::once(svc.cluster_ip.to_string())
                .chain(svc.external_ips.iter().cloned())
                .chain(svc.load_balancer_ingress.iter().cloned());
            for origin in origins {
                if let Err(e) = self
                    .conntrack
                    .clear_entries_for_nat(&origin, endpoint_ip, Protocol::Udp)
                    .await
                {
                    error!(
                        "Failed to delete {} endpoint connections {} -> {}: {}",
                        stale.service, origin, endpoint_ip, e
                    );
                }
            }
            if svc.node_port != 0 {
                if let Err(e) = self
                    .conntrack
                    .clear_entries_for_port(svc.node_port, self.ipv6, Protocol::Udp)
                    .await
                {
                    error!(
                        "Failed to delete {} node port {} connections: {}",
                        stale.service, svc.node_port, e
                    );
                }
            }
        }
        Ok(())
    }

    async fn ensure_jump_chains(&self) -> anyhow::Result<()> {
        for jump in JUMP_CHAINS {
            self.iptables
                .ensure_chain(jump.table, jump.chain)
                .await
                .with_context(|| format!("failed to ensure chain {} {}", jump.table, jump.chain))?;
            self.iptables
                .ensure_rule(
                    RulePosition::Prepend,
                    jump.table,
                    jump.source,
                    &jump.rule().args(),
                )
                .await
                .with_context(|| {
                    format!(
                        "failed to ensure {} jumps to {} in {}",
                        jump.source, jump.chain, jump.table
                    )
                })?;
        }
        Ok(())
    }

    fn write_static_rules(&self, ctx: &mut SyncContext<'_>, existing_filter: &BTreeMap<String, String>) {
        for chain in FILTER_STATIC_CHAINS {
            ctx.data.filter.declare_chain(chain, existing_filter);
        }
        for chain in NAT_STATIC_CHAINS {
            ctx.declare_nat_chain(chain);
        }

        ctx.data.nat.append(
            Rule::in_chain(KUBE_POSTROUTING)
                .comment("kubernetes service traffic requiring SNAT")
                .with(Match::Mark(self.masquerade_mark.clone()))
                .to(Target::Masquerade),
        );
        ctx.data
            .nat
            .append(Rule::in_chain(KUBE_MARK_MASQ).to(Target::SetMark(self.masquerade_mark.clone())));
        ctx.data
            .nat
            .append(Rule::in_chain(KUBE_MARK_DROP).to(Target::SetMark(self.drop_mark.clone())));
        ctx.data.filter.append(
            Rule::in_chain(KUBE_FIREWALL)
                .comment("kubernetes firewall for dropping marked packets")
                .with(Match::Mark(self.drop_mark.clone()))
                .to(Target::Drop),
        );
    }

    fn cluster_cidr(&self) -> Option<String> {
        self.config
            .cluster_cidr
            .filter(|c| c.addr().is_ipv6() == self.ipv6)
            .map(|c| c.to_string())
    }

    fn write_service(&self, ctx: &mut SyncContext<'_>, svc: &ServiceInfo, endpoints: &[EndpointInfo]) {
        let name = svc.name.as_str();
        let protocol = svc.protocol;
        let identity = format!("{}{}", name, protocol.as_iptables());
        if let Err(owner) = ctx.claim_chain(&svc.service_chain, &identity) {
            error!(
                "Chain {} for {} collides with {}, skipping service port",
                svc.service_chain, name, owner
            );
            return;
        }

        // Endpoint chains that could be claimed, paired with their backend.
        let mut backends: Vec<(&EndpointInfo, String)> = Vec::with_capacity(endpoints.len());
        for ep in endpoints {
            let chain = ep.chain_name(name, protocol);
            let ep_identity = format!("{}{}", identity, ep.endpoint);
            match ctx.claim_chain(&chain, &ep_identity) {
                Ok(()) => backends.push((ep, chain)),
                Err(owner) => error!(
                    "Chain {} for endpoint {} of {} collides with {}, skipping endpoint",
                    chain, ep.endpoint, name, owner
                ),
            }
        }
        let has_endpoints = !backends.is_empty();
        let svc_chain = svc.service_chain.as_str();
        let xlb_chain = svc.xlb_chain.as_str();

        if has_endpoints {
            ctx.declare_nat_chain(svc_chain);
            if svc.only_node_local_endpoints {
                ctx.declare_nat_chain(xlb_chain);
            }
        }

        // Cluster IP.
        let cluster_ip = host_cidr(svc.cluster_ip);
        if has_endpoints {
            let base = Rule::in_chain(KUBE_SERVICES)
                .comment(format!("{} cluster IP", name))
                .protocol(protocol)
                .destination(&cluster_ip)
                .dport(svc.port);
            if self.config.masquerade_all {
                ctx.data.nat.append(base.clone().jump(KUBE_MARK_MASQ));
            } else if let Some(cidr) = self.cluster_cidr() {
                ctx.data
                    .nat
                    .append(base.clone().not_source(cidr).jump(KUBE_MARK_MASQ));
            }
            ctx.data.nat.append(base.jump(svc_chain));
        } else {
            ctx.data.filter.append(
                Rule::in_chain(KUBE_SERVICES)
                    .comment(format!("{} has no endpoints", name))
                    .protocol(protocol)
                    .destination(&cluster_ip)
                    .dport(svc.port)
                    .to(Target::Reject),
            );
        }

        self.write_external_ips(ctx, svc, has_endpoints);
        self.write_load_balancer(ctx, svc, has_endpoints);
        self.write_node_port(ctx, svc, has_endpoints);

        if !has_endpoints {
            return;
        }

        let affinity = svc.session_affinity == SessionAffinity::ClientIP;
        for (_, chain) in &backends {
            ctx.declare_nat_chain(chain);
        }
        if affinity {
            for (_, chain) in &backends {
                ctx.data.nat.append(
                    Rule::in_chain(svc_chain)
                        .comment(name)
                        .with(Match::RecentCheck {
                            name: chain.clone(),
                            seconds: svc.sticky_max_age_seconds,
                        })
                        .jump(chain),
                );
            }
        }

        let n = backends.len();
        for (i, (ep, chain)) in backends.iter().enumerate() {
            let mut balance = Rule::in_chain(svc_chain).comment(name);
            if i + 1 < n {
                balance = balance.with(Match::Probability(ctx.probabilities.get(n - i).to_string()));
            }
            ctx.data.nat.append(balance.jump(chain));

            let base = Rule::in_chain(chain).comment(name);
            match to_cidr(ep.ip()) {
                Some(ep_cidr) => ctx.data.nat.append(base.clone().source(ep_cidr).jump(KUBE_MARK_MASQ)),
                None => warn!("Endpoint {} of {} has no usable IP for hairpin masquerade", ep.endpoint, name),
            }
            let mut dnat = base;
            if affinity {
                dnat = dnat.with(Match::RecentSet { name: chain.clone() });
            }
            ctx.data
                .nat
                .append(dnat.protocol(protocol).to(Target::Dnat(ep.endpoint.clone())));
        }

        if svc.only_node_local_endpoints {
            self.write_xlb(ctx, svc, &backends);
        }
    }

    fn write_external_ips(&self, ctx: &mut SyncContext<'_>, svc: &ServiceInfo, has_endpoints: bool) {
        let name = svc.name.as_str();
        for external_ip in &svc.external_ips {
            let Some(dest) = to_cidr(external_ip) else {
                warn!("Skipping invalid external IP {:?} of {}", external_ip, name);
                continue;
            };
            if is_ipv6_str(external_ip) != self.ipv6 {
                continue;
            }
            let is_local = external_ip
                .trim()
                .parse::<IpAddr>()
                .is_ok_and(|ip| ctx.local_ips.contains(&ip));
            if is_local {
                let lp = LocalPort {
                    description: format!("externalIP for {}", name),
                    ip: Some(external_ip.trim().to_string()),
                    port: svc.port,
                    protocol: svc.protocol,
                };
                if let Err(e) = ctx.reservation.claim(&lp) {
                    error!("Can't open {}, skipping this external IP: {}", lp, e);
                    continue;
                }
            }

            if has_endpoints {
                let base = Rule::in_chain(KUBE_SERVICES)
                    .comment(format!("{} external IP", name))
                    .protocol(svc.protocol)
                    .destination(&dest)
                    .dport(svc.port);
                ctx.data.nat.append(base.clone().jump(KUBE_MARK_MASQ));
                // Off-node traffic that is not bridged in.
                ctx.data.nat.append(
                    base.clone()
                        .with(Match::NotPhysdevIsIn)
                        .with(Match::NotSrcTypeLocal)
                        .jump(&svc.service_chain),
                );
                // Traffic that resolves to a local route.
                ctx.data
                    .nat
                    .append(base.with(Match::DstTypeLocal).jump(&svc.service_chain));
            } else {
                ctx.data.filter.append(
                    Rule::in_chain(KUBE_EXTERNAL_SERVICES)
                        .comment(format!("{} has no endpoints", name))
                        .protocol(svc.protocol)
                        .destination(&dest)
                        .dport(svc.port)
                        .to(Target::Reject),
                );
            }
        }
    }

    fn write_load_balancer(&self, ctx: &mut SyncContext<'_>, svc: &ServiceInfo, has_endpoints: bool) {
        let name = svc.name.as_str();
        for ingress in &svc.load_balancer_ingress {
            let Some(dest) = to_cidr(ingress) else {
                warn!("Skipping invalid load balancer ingress {:?} of {}", ingress, name);
                continue;
            };
            if is_ipv6_str(ingress) != self.ipv6 {
                continue;
            }
            if !has_endpoints {
                ctx.data.filter.append(
                    Rule::in_chain(KUBE_EXTERNAL_SERVICES)
                        .comment(format!("{} has no endpoints", name))
                        .protocol(svc.protocol)
                        .destination(&dest)
                        .dport(svc.port)
                        .to(Target::Reject),
                );
                continue;
            }

            let fw_chain = svc.firewall_chain.as_str();
            ctx.declare_nat_chain(fw_chain);
            ctx.data.nat.append(
                Rule::in_chain(KUBE_SERVICES)
                    .comment(format!("{} loadbalancer IP", name))
                    .protocol(svc.protocol)
                    .destination(&dest)
                    .dport(svc.port)
                    .jump(fw_chain),
            );

            let comment = format!("{} loadbalancer IP", name);
            let chosen = if svc.only_node_local_endpoints {
                svc.xlb_chain.as_str()
            } else {
                // Traffic may leave the node.
                ctx.data.nat.append(
                    Rule::in_chain(fw_chain)
                        .comment(comment.as_str())
                        .jump(KUBE_MARK_MASQ),
                );
                svc.service_chain.as_str()
            };

            if svc.load_balancer_source_ranges.is_empty() {
                ctx.data
                    .nat
                    .append(Rule::in_chain(fw_chain).comment(comment.as_str()).jump(chosen));
            } else {
                let mut allow_from_node = false;
                for range in &svc.load_balancer_source_ranges {
                    let net: IpNet = match range.parse() {
                        Ok(net) => net,
                        Err(e) => {
                            warn!("Skipping invalid source range {:?} of {}: {}", range, name, e);
                            continue;
                        }
                    };
                    ctx.data.nat.append(
                        Rule::in_chain(fw_chain)
                            .comment(comment.as_str())
                            .source(net.to_string())
                            .jump(chosen),
                    );
                    if self.config.node_ip.is_some_and(|ip| net.contains(&ip)) {
                        allow_from_node = true;
                    }
                }
                // Hairpin through the VIP arrives with the VIP as source.
                if allow_from_node {
                    ctx.data.nat.append(
                        Rule::in_chain(fw_chain)
                            .comment(comment.as_str())
                            .source(dest.as_str())
                            .jump(chosen),
                    );
                }
            }

            // Anything still here did not match an allowed source.
            ctx.data
                .nat
                .append(Rule::in_chain(fw_chain).comment(comment).jump(KUBE_MARK_DROP));
        }
    }

    fn write_node_port(&self, ctx: &mut SyncContext<'_>, svc: &ServiceInfo, has_endpoints: bool) {
        if svc.node_port == 0 {
            return;
        }
        let name = svc.name.as_str();
        let Some(addresses) = ctx.node_addresses.clone() else {
            error!("No node addresses for node port {} of {}, skipping", svc.node_port, name);
            return;
        };

        let mut claims = Vec::new();
        for address in &addresses {
            let zero = is_zero_cidr(address);
            if !zero && is_ipv6_str(address) != self.ipv6 {
                continue;
            }
            claims.push(LocalPort {
                description: format!("nodePort for {}", name),
                ip: if zero { None } else { Some(address.clone()) },
                port: svc.node_port,
                protocol: svc.protocol,
            });
            // A wildcard socket covers every address.
            if zero {
                break;
            }
        }

        let mut bound = true;
        for lp in &claims {
            match ctx.reservation.claim(lp) {
                Ok(Claim::Opened) if lp.protocol == Protocol::Udp => {
                    ctx.new_udp_node_ports.insert(lp.port);
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Can't open {}, skipping this node port: {}", lp, e);
                    bound = false;
                }
            }
        }
        if !bound {
            return;
        }

        if has_endpoints {
            let base = Rule::in_chain(KUBE_NODEPORTS)
                .comment(name)
                .protocol(svc.protocol)
                .dport(svc.node_port);
            if svc.only_node_local_endpoints {
                // Loopback sources must be masqueraded or the kernel drops
                // the reply as martian.
                let loopback = if self.ipv6 {
                    IPV6_LOOPBACK_CIDR
                } else {
                    IPV4_LOOPBACK_CIDR
                };
                ctx.data
                    .nat
                    .append(base.clone().source(loopback).jump(KUBE_MARK_MASQ));
                ctx.data.nat.append(base.jump(&svc.xlb_chain));
            } else {
                ctx.data.nat.append(base.clone().jump(KUBE_MARK_MASQ));
                ctx.data.nat.append(base.jump(&svc.service_chain));
            }
        } else {
            ctx.data.filter.append(
                Rule::in_chain(KUBE_EXTERNAL_SERVICES)
                    .comment(format!("{} has no endpoints", name))
                    .with(Match::DstTypeLocal)
                    .protocol(svc.protocol)
                    .dport(svc.node_port)
                    .to(Target::Reject),
            );
        }
    }

    fn write_xlb(&self, ctx: &mut SyncContext<'_>, svc: &ServiceInfo, backends: &[(&EndpointInfo, String)]) {
        let name = svc.name.as_str();
        let xlb_chain = svc.xlb_chain.as_str();

        if let Some(cidr) = self.cluster_cidr() {
            ctx.data.nat.append(
                Rule::in_chain(xlb_chain)
                    .comment("Redirect pods trying to reach external loadbalancer VIP to clusterIP")
                    .source(cidr)
                    .jump(&svc.service_chain),
            );
        }

        let local: Vec<&str> = backends
            .iter()
            .filter(|(ep, _)| ep.is_local)
            .map(|(_, chain)| chain.as_str())
            .collect();
        if local.is_empty() {
            ctx.data.nat.append(
                Rule::in_chain(xlb_chain)
                    .comment(format!("{} has no local endpoints", name))
                    .jump(KUBE_MARK_DROP),
            );
            return;
        }

        if svc.session_affinity == SessionAffinity::ClientIP {
            for chain in &local {
                ctx.data.nat.append(
                    Rule::in_chain(xlb_chain)
                        .comment(name)
                        .with(Match::RecentCheck {
                            name: chain.to_string(),
                            seconds: svc.sticky_max_age_seconds,
                        })
                        .jump(chain),
                );
            }
        }

        let n = local.len();
        for (i, chain) in local.iter().enumerate() {
            let mut rule = Rule::in_chain(xlb_chain).comment(format!("Balancing rule {} for {}", i, name));
            if i + 1 < n {
                rule = rule.with(Match::Probability(ctx.probabilities.get(n - i).to_string()));
            }
            ctx.data.nat.append(rule.jump(chain));
        }
    }

    /// The catch-all jump into KUBE-NODEPORTS; always the last rule of KUBE-SERVICES.
    fn write_nodeports_tail(&self, ctx: &mut SyncContext<'_>) {
        let Some(addresses) = ctx.node_addresses.clone() else {
            return;
        };
        for address in &addresses {
            let base = Rule::in_chain(KUBE_SERVICES).comment(NODEPORTS_TAIL_COMMENT);
            if is_zero_cidr(address) {
                ctx.data
                    .nat
                    .append(base.with(Match::DstTypeLocal).jump(KUBE_NODEPORTS));
                break;
            }
            if is_ipv6_str(address) != self.ipv6 {
                continue;
            }
            ctx.data
                .nat
                .append(base.destination(address.as_str()).jump(KUBE_NODEPORTS));
        }
    }

    /// Let service traffic through even when the FORWARD policy is DROP.
    fn write_forward_rules(&self, ctx: &mut SyncContext<'_>) {
        ctx.data.filter.append(
            Rule::in_chain(KUBE_FORWARD)
                .comment("kubernetes forwarding rules")
                .with(Match::Mark(self.masquerade_mark.clone()))
                .to(Target::Accept),
        );
        if let Some(cidr) = self.cluster_cidr() {
            ctx.data.filter.append(
                Rule::in_chain(KUBE_FORWARD)
                    .source(cidr.as_str())
                    .comment("kubernetes forwarding conntrack pod source rule")
                    .with(Match::CtState("RELATED,ESTABLISHED"))
                    .to(Target::Accept),
            );
            ctx.data.filter.append(
                Rule::in_chain(KUBE_FORWARD)
                    .comment("kubernetes forwarding conntrack pod destination rule")
                    .destination(cidr)
                    .with(Match::CtState("RELATED,ESTABLISHED"))
                    .to(Target::Accept),
            );
        }
    }
}
