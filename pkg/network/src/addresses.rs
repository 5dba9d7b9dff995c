//! Node address discovery.

use anyhow::Result;
use ipnet::IpNet;
use std::collections::BTreeSet;
use std::net::IpAddr;

use pkg_constants::network::{IPV4_ZERO_CIDR, IPV6_ZERO_CIDR};

/// Source of the addresses assigned to this node's interfaces.
pub trait NodeAddresses: Send + Sync {
    fn local_addresses(&self) -> Result<Vec<IpAddr>>;
}

/// [`NodeAddresses`] read from the kernel with `getifaddrs(3)`.
#[derive(Debug, Default)]
pub struct InterfaceAddresses;

impl NodeAddresses for InterfaceAddresses {
    fn local_addresses(&self) -> Result<Vec<IpAddr>> {
        let mut out = Vec::new();
        for ifaddr in nix::ifaddrs::getifaddrs()? {
            let Some(addr) = ifaddr.address else {
                continue;
            };
            if let Some(v4) = addr.as_sockaddr_in() {
                out.push(IpAddr::V4(v4.ip()));
            } else if let Some(v6) = addr.as_sockaddr_in6() {
                out.push(IpAddr::V6(v6.ip()));
            }
        }
        Ok(out)
    }
}

pub fn is_zero_cidr(cidr: &str) -> bool {
    cidr == IPV4_ZERO_CIDR || cidr == IPV6_ZERO_CIDR
}

/// `ip/32` or `ip/128`; `None` if `ip` does not parse.
pub fn to_cidr(ip: &str) -> Option<String> {
    match ip.trim().parse::<IpAddr>().ok()? {
        IpAddr::V4(v4) => Some(format!("{}/32", v4)),
        IpAddr::V6(v6) => Some(format!("{}/128", v6)),
    }
}

/// Resolve the configured node-port CIDRs to concrete addresses.
///
/// No CIDRs means every address (both zero CIDRs). A zero CIDR in the list
/// suppresses individual addresses of its family.
pub fn node_port_addresses(cidrs: &[IpNet], addrs: &dyn NodeAddresses) -> Result<BTreeSet<String>> {
    let mut unique = BTreeSet::new();
    if cidrs.is_empty() {
        unique.insert(IPV4_ZERO_CIDR.to_string());
        unique.insert(IPV6_ZERO_CIDR.to_string());
        return Ok(unique);
    }

    for cidr in cidrs {
        if is_zero_cidr(&cidr.to_string()) {
            unique.insert(cidr.to_string());
        }
    }

    let mut local = None;
    for cidr in cidrs {
        if is_zero_cidr(&cidr.to_string()) {
            continue;
        }
        let local = match &local {
            Some(l) => l,
            None => local.insert(addrs.local_addresses()?),
        };
        for ip in local.iter().filter(|ip| cidr.contains(*ip)) {
            let zero = if ip.is_ipv6() {
                IPV6_ZERO_CIDR
            } else {
                IPV4_ZERO_CIDR
            };
            if !unique.contains(zero) {
                unique.insert(ip.to_string());
            }
        }
    }

    if unique.is_empty() {
        anyhow::bail!(
            "no addresses found for cidrs {}",
            cidrs
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(",")
        );
    }
    Ok(unique)
}
