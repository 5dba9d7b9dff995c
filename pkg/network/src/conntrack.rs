//! Connection-tracking flushes via the `conntrack` CLI.
//!
//! UDP has no teardown, so entries created before a service or endpoint
//! changed keep steering packets to the old destination until they expire.

use async_trait::async_trait;
use std::net::IpAddr;
use tracing::debug;

use pkg_constants::paths::CONNTRACK_BIN;
use pkg_types::service::Protocol;

/// Printed (with exit status 1) when a delete matched nothing.
const NO_CONNECTION_TO_DELETE: &str = "0 flow entries have been deleted";

#[derive(Debug, thiserror::Error)]
pub enum ConntrackError {
    #[error("failed to run conntrack: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("conntrack {args} failed: {output}")]
    Failed { args: String, output: String },
    #[error("invalid port {0}")]
    InvalidPort(u16),
}

#[async_trait]
pub trait Conntrack: Send + Sync {
    /// Drop entries whose original destination is `ip`.
    async fn clear_entries_for_ip(&self, ip: &str, protocol: Protocol) -> Result<(), ConntrackError>;

    /// Drop entries whose destination port is `port`.
    async fn clear_entries_for_port(
        &self,
        port: u16,
        ipv6: bool,
        protocol: Protocol,
    ) -> Result<(), ConntrackError>;

    /// Drop entries for traffic to `origin` that was DNATed to `dest`.
    async fn clear_entries_for_nat(
        &self,
        origin: &str,
        dest: &str,
        protocol: Protocol,
    ) -> Result<(), ConntrackError>;
}

/// [`Conntrack`] backed by the conntrack-tools binary.
#[derive(Debug, Default)]
pub struct ConntrackRunner;

impl ConntrackRunner {
    pub fn new() -> Self {
        Self
    }

    async fn exec(&self, args: Vec<String>) -> Result<(), ConntrackError> {
        debug!("running {} {}", CONNTRACK_BIN, args.join(" "));
        let output = tokio::process::Command::new(CONNTRACK_BIN)
            .args(&args)
            .output()
            .await?;
        if output.status.success() {
            return Ok(());
        }
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        if combined.contains(NO_CONNECTION_TO_DELETE) {
            return Ok(());
        }
        Err(ConntrackError::Failed {
            args: args.join(" "),
            output: combined.trim().to_string(),
        })
    }
}

/// Builds `conntrack -D ...` arguments, appending `-f ipv6` for IPv6 targets.
fn delete_args(ipv6: bool, params: &[&str]) -> Vec<String> {
    let mut args = vec!["-D".to_string()];
    args.extend(params.iter().map(|p| p.to_string()));
    if ipv6 {
        args.push("-f".to_string());
        args.push("ipv6".to_string());
    }
    args
}

fn is_ipv6(ip: &str) -> bool {
    matches!(ip.parse::<IpAddr>(), Ok(IpAddr::V6(_)))
}

#[async_trait]
impl Conntrack for ConntrackRunner {
    async fn clear_entries_for_ip(&self, ip: &str, protocol: Protocol) -> Result<(), ConntrackError> {
        self.exec(delete_args(
            is_ipv6(ip),
            &["--orig-dst", ip, "-p", protocol.as_iptables()],
        ))
        .await
    }

    async fn clear_entries_for_port(
        &self,
        port: u16,
        ipv6: bool,
        protocol: Protocol,
    ) -> Result<(), ConntrackError> {
        if port == 0 {
            return Err(ConntrackError::InvalidPort(port));
        }
        self.exec(delete_args(
            ipv6,
            &["-p", protocol.as_iptables(), "--dport", &port.to_string()],
        ))
        .await
    }

    async fn clear_entries_for_nat(
        &self,
        origin: &str,
        dest: &str,
        protocol: Protocol,
    ) -> Result<(), ConntrackError> {
        self.exec(delete_args(
            is_ipv6(origin),
            &[
                "--orig-dst",
                origin,
                "--dst-nat",
                dest,
                "-p",
                protocol.as_iptables(),
            ],
        ))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_args_have_no_family() {
        assert_eq!(
            delete_args(is_ipv6("10.0.0.5"), &["--orig-dst", "10.0.0.5", "-p", "udp"]),
            vec!["-D", "--orig-dst", "10.0.0.5", "-p", "udp"]
        );
    }

    #[test]
    fn ipv6_args_select_family() {
        assert_eq!(
            delete_args(is_ipv6("fd00::5"), &["--orig-dst", "fd00::5", "-p", "udp"]),
            vec!["-D", "--orig-dst", "fd00::5", "-p", "udp", "-f", "ipv6"]
        );
    }

    #[tokio::test]
    async fn zero_port_is_rejected() {
        let ct = ConntrackRunner::new();
        let err = ct
            .clear_entries_for_port(0, false, Protocol::Udp)
            .await
            .unwrap_err();
        assert!(matches!(err, ConntrackError::InvalidPort(0)));
    }
}
