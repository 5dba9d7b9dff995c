//! Deterministic per-service and per-endpoint chain names.
//!
//! Names are `<prefix><first 16 base32 chars of sha256(identity)>`, so the
//! proxier recognises the chains it created before a restart.

use data_encoding::BASE32;
use sha2::{Digest, Sha256};

use pkg_constants::chains::{
    CHAIN_HASH_LEN, ENDPOINT_CHAIN_PREFIX, FIREWALL_CHAIN_PREFIX, SERVICE_CHAIN_PREFIX,
    XLB_CHAIN_PREFIX,
};
use pkg_types::service::Protocol;

/// The per-service-port chain kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainRole {
    Service,
    Firewall,
    Xlb,
}

impl ChainRole {
    pub fn prefix(&self) -> &'static str {
        match self {
            ChainRole::Service => SERVICE_CHAIN_PREFIX,
            ChainRole::Firewall => FIREWALL_CHAIN_PREFIX,
            ChainRole::Xlb => XLB_CHAIN_PREFIX,
        }
    }
}

fn hash_suffix(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    let mut encoded = BASE32.encode(&hasher.finalize());
    encoded.truncate(CHAIN_HASH_LEN);
    encoded
}

/// Chain for a service port in the given role.
pub fn service_chain_name(role: ChainRole, port_name: &str, protocol: Protocol) -> String {
    format!(
        "{}{}",
        role.prefix(),
        hash_suffix(&[port_name, protocol.as_iptables()])
    )
}

/// Chain for one endpoint (`ip:port`) of a service port.
pub fn endpoint_chain_name(port_name: &str, protocol: Protocol, endpoint: &str) -> String {
    format!(
        "{}{}",
        ENDPOINT_CHAIN_PREFIX,
        hash_suffix(&[port_name, protocol.as_iptables(), endpoint])
    )
}
