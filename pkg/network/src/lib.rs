//! Kernel-facing plumbing for the service proxy: iptables save/restore,
//! conntrack flushes, local port reservations and node address lookup.
//!
//! Every kernel interaction sits behind a trait so the synchronizer can be
//! driven against the in-memory implementations in [`fake`].

pub mod addresses;
pub mod conntrack;
pub mod fake;
pub mod iptables;
pub mod ports;
pub mod rules;
