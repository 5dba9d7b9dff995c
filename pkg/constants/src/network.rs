//! Network-related constants.

/// Default address for the health / metrics endpoint.
pub const DEFAULT_HEALTH_BIND_ADDR: &str = "0.0.0.0:10256";

/// Default API server address the event source polls.
pub const DEFAULT_API_ADDR: &str = "http://127.0.0.1:6443";

/// Default fwmark bit used to tag traffic needing SNAT.
/// The drop mark uses the next bit up.
pub const DEFAULT_MASQUERADE_BIT: u32 = 14;

/// Source range used to catch loopback traffic to node-local node ports.
pub const IPV4_LOOPBACK_CIDR: &str = "127.0.0.0/8";

/// IPv6 counterpart of [`IPV4_LOOPBACK_CIDR`].
pub const IPV6_LOOPBACK_CIDR: &str = "::1/128";

/// Zero CIDRs: "every local address" in `nodeport-addresses`.
pub const IPV4_ZERO_CIDR: &str = "0.0.0.0/0";
pub const IPV6_ZERO_CIDR: &str = "::/0";
