//! Address and network matching for `ip4`, `ip6`, `a` and `mx`

use ipnet::{Ipv4Net, Ipv6Net};
use regex::Regex;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::OnceLock;
use thiserror::Error;

/// Errors in address or prefix literals
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CidrError {
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    #[error("invalid prefix length: {0}")]
    InvalidPrefix(String),
}

/// Prefix lengths applied to the addresses an `a` or `mx` lookup returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DualCidr {
    pub v4: u8,
    pub v6: u8,
}

impl Default for DualCidr {
    fn default() -> Self {
        Self { v4: 32, v6: 128 }
    }
}

impl DualCidr {
    /// Whether `client` lies in the network of `candidate` under the prefix
    /// for their shared address family
    ///
    /// Addresses of different families never match.
    pub fn matches(&self, client: IpAddr, candidate: IpAddr) -> bool {
        match (client, candidate) {
            (IpAddr::V4(client), IpAddr::V4(candidate)) => Ipv4Net::new(candidate, self.v4)
                .map(|net| net.contains(&client))
                .unwrap_or(false),
            (IpAddr::V6(client), IpAddr::V6(candidate)) => Ipv6Net::new(candidate, self.v6)
                .map(|net| net.contains(&client))
                .unwrap_or(false),
            _ => false,
        }
    }
}

fn parse_prefix(s: &str, max: u8) -> Result<u8, CidrError> {
    // No sign, no leading zeros beyond a lone "0"
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) || (s.len() > 1 && s.starts_with('0')) {
        return Err(CidrError::InvalidPrefix(s.to_string()));
    }
    match s.parse::<u8>() {
        Ok(len) if len <= max => Ok(len),
        _ => Err(CidrError::InvalidPrefix(s.to_string())),
    }
}

/// Parse the argument of `ip4:`, e.g. `192.0.2.0/24`
pub fn parse_ip4_network(arg: &str) -> Result<Ipv4Net, CidrError> {
    let (addr, prefix) = match arg.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (arg, None),
    };
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| CidrError::InvalidAddress(addr.to_string()))?;
    let prefix = prefix.map(|p| parse_prefix(p, 32)).transpose()?.unwrap_or(32);

    Ipv4Net::new(addr, prefix).map_err(|_| CidrError::InvalidPrefix(prefix.to_string()))
}

/// Parse the argument of `ip6:`, e.g. `2001:db8::/32`
pub fn parse_ip6_network(arg: &str) -> Result<Ipv6Net, CidrError> {
    // IPv6 literals contain ':' but never '/', so the first '/' starts the prefix
    let (addr, prefix) = match arg.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (arg, None),
    };
    let addr: Ipv6Addr = addr
        .parse()
        .map_err(|_| CidrError::InvalidAddress(addr.to_string()))?;
    let prefix = prefix.map(|p| parse_prefix(p, 128)).transpose()?.unwrap_or(128);

    Ipv6Net::new(addr, prefix).map_err(|_| CidrError::InvalidPrefix(prefix.to_string()))
}

fn dual_cidr_suffix() -> &'static Regex {
    static SUFFIX: OnceLock<Regex> = OnceLock::new();
    SUFFIX.get_or_init(|| {
        Regex::new(r"(?:/([0-9]+))?(?://([0-9]+))?$").expect("dual-cidr pattern is valid")
    })
}

/// Split a trailing `/n`, `//m` or `/n//m` off an `a`/`mx` argument
///
/// Returns the remaining domain part (possibly empty) and the prefixes.
pub fn parse_dual_cidr(arg: &str) -> Result<(&str, DualCidr), CidrError> {
    let mut cidr = DualCidr::default();
    let Some(captures) = dual_cidr_suffix().captures(arg) else {
        return Ok((arg, cidr));
    };

    if let Some(v4) = captures.get(1) {
        cidr.v4 = parse_prefix(v4.as_str(), 32)?;
    }
    if let Some(v6) = captures.get(2) {
        cidr.v6 = parse_prefix(v6.as_str(), 128)?;
    }

    let start = captures.get(0).map_or(arg.len(), |m| m.start());
    let rest = &arg[..start];
    if rest.ends_with('/') {
        // e.g. "example.com///24"
        return Err(CidrError::InvalidPrefix(arg[start.saturating_sub(1)..].to_string()));
    }

    Ok((rest, cidr))
}
