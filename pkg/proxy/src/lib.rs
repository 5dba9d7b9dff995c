//! iptables-mode service proxy.
//!
//! Watches Services and Endpoints and keeps the node's `filter` and `nat`
//! tables programmed so that traffic to a service's virtual IPs, node ports
//! and load balancer addresses is DNAT'ed to one of its endpoints.

pub mod cleanup;
pub mod endpoints;
pub mod hasher;
pub mod health;
pub mod metrics;
pub mod probability;
pub mod proxier;
pub mod runner;
pub mod service;

pub use proxier::{KernelHandles, Proxier, ProxierConfig};
