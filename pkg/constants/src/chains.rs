//! iptables chain names owned by the proxy.
//!
//! Per-service chains are not listed here: they are derived by hashing
//! the service port identity and carry one of the `*_PREFIX` role tags.

// ─── Static chains ────────────────────────────────────────────────────────

/// Top-level service portal chain (exists in both `filter` and `nat`).
pub const KUBE_SERVICES: &str = "KUBE-SERVICES";

/// Filter chain for externally-visible service portals (external IPs, node ports).
pub const KUBE_EXTERNAL_SERVICES: &str = "KUBE-EXTERNAL-SERVICES";

/// Nat chain holding the node port capture rules.
pub const KUBE_NODEPORTS: &str = "KUBE-NODEPORTS";

/// Nat chain masquerading marked traffic on the way out.
pub const KUBE_POSTROUTING: &str = "KUBE-POSTROUTING";

/// Nat chain that sets the masquerade mark.
pub const KUBE_MARK_MASQ: &str = "KUBE-MARK-MASQ";

/// Nat chain that sets the drop mark.
pub const KUBE_MARK_DROP: &str = "KUBE-MARK-DROP";

/// Filter chain accepting forwarded service traffic.
pub const KUBE_FORWARD: &str = "KUBE-FORWARD";

/// Filter chain dropping packets that carry the drop mark.
pub const KUBE_FIREWALL: &str = "KUBE-FIREWALL";

// ─── Built-in anchor chains ───────────────────────────────────────────────

pub const INPUT: &str = "INPUT";
pub const OUTPUT: &str = "OUTPUT";
pub const FORWARD: &str = "FORWARD";
pub const PREROUTING: &str = "PREROUTING";
pub const POSTROUTING: &str = "POSTROUTING";

// ─── Per-service chain role tags ──────────────────────────────────────────

/// Service port load-balancing chain.
pub const SERVICE_CHAIN_PREFIX: &str = "KUBE-SVC-";

/// Per-endpoint DNAT chain.
pub const ENDPOINT_CHAIN_PREFIX: &str = "KUBE-SEP-";

/// Load-balancer source-range firewall chain.
pub const FIREWALL_CHAIN_PREFIX: &str = "KUBE-FW-";

/// Node-local ("external load balancer") routing chain.
pub const XLB_CHAIN_PREFIX: &str = "KUBE-XLB-";

/// Every role tag the synchronizer and the cleanup utility consider theirs.
pub const OWNED_CHAIN_PREFIXES: &[&str] = &[
    SERVICE_CHAIN_PREFIX,
    ENDPOINT_CHAIN_PREFIX,
    FIREWALL_CHAIN_PREFIX,
    XLB_CHAIN_PREFIX,
];

/// Number of base32 characters of the identity hash kept in a chain name.
pub const CHAIN_HASH_LEN: usize = 16;

/// iptables refuses chain names longer than this.
pub const MAX_CHAIN_NAME_LEN: usize = 28;
