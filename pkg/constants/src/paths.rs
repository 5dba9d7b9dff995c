//! Filesystem paths and external binaries.

/// Default config file path for the proxy.
pub const DEFAULT_PROXY_CONFIG: &str = "/etc/iptables-proxy/config.yaml";

/// iptables front-end used for chain / rule checks.
pub const IPTABLES_BIN: &str = "iptables";

/// Dumps a table in restore format.
pub const IPTABLES_SAVE_BIN: &str = "iptables-save";

/// Applies a restore-format buffer atomically.
pub const IPTABLES_RESTORE_BIN: &str = "iptables-restore";

/// IPv6 variants of the above.
pub const IP6TABLES_BIN: &str = "ip6tables";
pub const IP6TABLES_SAVE_BIN: &str = "ip6tables-save";
pub const IP6TABLES_RESTORE_BIN: &str = "ip6tables-restore";

/// conntrack-tools CLI.
pub const CONNTRACK_BIN: &str = "conntrack";
