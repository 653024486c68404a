use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum MatcherError {
    #[error("invalid CIDR range: {0}")]
    InvalidCidr(String),
}

/// Classification of a blacklist range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeKind {
    Malicious,
    Bot,
    Datacenter,
    Proxy,
    Custom,
}

impl RangeKind {
    /// Parses the store's string form. Unrecognised kinds become
    /// `Custom` so a new classification in the store never breaks
    /// loading.
    pub fn from_store(kind: &str) -> Self {
        match kind {
            "malicious" => Self::Malicious,
            "bot" => Self::Bot,
            "datacenter" => Self::Datacenter,
            "proxy" => Self::Proxy,
            _ => Self::Custom,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Malicious => "malicious",
            Self::Bot => "bot",
            Self::Datacenter => "datacenter",
            Self::Proxy => "proxy",
            Self::Custom => "custom",
        }
    }
}

/// A normalised, immutable range rule inside a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeRule {
    pub rule_id: i64,
    /// Inclusive range bounds as host-order u32.
    pub ip_start: u32,
    pub ip_end: u32,
    pub kind: RangeKind,
    pub category: String,
    pub name: String,
    /// The original CIDR text, kept for audit detail.
    pub cidr: String,
}

impl RangeRule {
    /// Returns `true` if `ip` falls inside the range, bounds included.
    pub fn covers(&self, ip: u32) -> bool {
        self.ip_start <= ip && ip <= self.ip_end
    }
}

/// Expands a CIDR block (or a bare IPv4 address) into an inclusive
/// `(start, end)` pair of host-order u32 values.
pub fn parse_cidr(cidr: &str) -> Result<(u32, u32), MatcherError> {
    let (ip_text, bits) = match cidr.split_once('/') {
        Some((ip, bits)) => {
            let bits: u32 = bits
                .parse()
                .map_err(|_| MatcherError::InvalidCidr(cidr.to_string()))?;
            if bits > 32 {
                return Err(MatcherError::InvalidCidr(cidr.to_string()));
            }
            (ip, bits)
        }
        None => (cidr, 32),
    };

    let ip: Ipv4Addr = ip_text
        .parse()
        .map_err(|_| MatcherError::InvalidCidr(cidr.to_string()))?;
    let ip = u32::from(ip);

    let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
    let start = ip & mask;
    let end = start | !mask;
    Ok((start, end))
}

/// Normalises an IPv4 address string to its u32 form. Non-IPv4 input
/// yields `None`; such addresses are simply not covered by any rule.
pub fn parse_ipv4(ip: &str) -> Option<u32> {
    ip.parse::<Ipv4Addr>().ok().map(u32::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_address_is_degenerate_range() {
        let (start, end) = parse_cidr("192.0.2.7").unwrap();
        assert_eq!(start, end);
        assert_eq!(start, u32::from(Ipv4Addr::new(192, 0, 2, 7)));
    }

    #[test]
    fn slash_24_masks_host_bits() {
        let (start, end) = parse_cidr("192.0.2.77/24").unwrap();
        assert_eq!(start, u32::from(Ipv4Addr::new(192, 0, 2, 0)));
        assert_eq!(end, u32::from(Ipv4Addr::new(192, 0, 2, 255)));
    }

    #[test]
    fn slash_32_is_single_host() {
        let (start, end) = parse_cidr("10.1.2.3/32").unwrap();
        assert_eq!(start, end);
    }

    #[test]
    fn slash_zero_covers_everything() {
        let (start, end) = parse_cidr("0.0.0.0/0").unwrap();
        assert_eq!(start, 0);
        assert_eq!(end, u32::MAX);
    }

    #[test]
    fn invalid_inputs_rejected() {
        assert!(parse_cidr("not-an-ip").is_err());
        assert!(parse_cidr("10.0.0.0/33").is_err());
        assert!(parse_cidr("10.0.0.0/abc").is_err());
        assert!(parse_cidr("300.0.0.1/8").is_err());
    }

    #[test]
    fn kind_parsing_defaults_to_custom() {
        assert_eq!(RangeKind::from_store("malicious"), RangeKind::Malicious);
        assert_eq!(RangeKind::from_store("datacenter"), RangeKind::Datacenter);
        assert_eq!(RangeKind::from_store("something-new"), RangeKind::Custom);
    }

    #[test]
    fn ipv6_is_not_covered() {
        assert!(parse_ipv4("::1").is_none());
        assert!(parse_ipv4("garbage").is_none());
    }
}
