//! Centralized constants for the iptables service proxy.
//!
//! All project-wide constant values live here.
//! Change a value in one place and it applies everywhere.

pub mod chains;
pub mod network;
pub mod paths;
pub mod proxy;
