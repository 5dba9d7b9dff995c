use anyhow::{Result, bail};
use ipnet::IpNet;
use std::net::IpAddr;
use std::time::Duration;

/// Validate a CIDR such as `10.42.0.0/16`.
pub fn validate_cidr(cidr: &str) -> Result<IpNet> {
    cidr.trim()
        .parse::<IpNet>()
        .map_err(|e| anyhow::anyhow!("invalid CIDR '{}': {}", cidr, e))
}

/// Validate a bare IP address.
pub fn validate_ip(ip: &str) -> Result<IpAddr> {
    ip.parse::<IpAddr>()
        .map_err(|e| anyhow::anyhow!("invalid IP '{}': {}", ip, e))
}

/// The masquerade mark uses `bit`, the drop mark `bit + 1`; both must fit in 32 bits.
pub fn validate_masquerade_bit(bit: u32) -> Result<()> {
    if bit > 30 {
        bail!("masquerade bit {} out of range [0, 30]", bit);
    }
    Ok(())
}

/// The forced resync period can't be shorter than the minimum period.
pub fn validate_sync_periods(min: Duration, max: Duration) -> Result<()> {
    if max < min {
        bail!(
            "sync period ({:?}) must not be shorter than min sync period ({:?})",
            max,
            min
        );
    }
    if max.is_zero() {
        bail!("sync period must be greater than zero");
    }
    Ok(())
}
