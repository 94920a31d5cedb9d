//! DNS access for SPF evaluation
//!
//! The evaluator only talks to the [`DnsResolver`] trait. Failures are
//! classified as [`DnsError::NotFound`] (NXDOMAIN or an empty answer) or
//! [`DnsError::Failure`] (anything transient); each mechanism decides what
//! those mean for its result.

use async_trait::async_trait;
use mailgate_common::config::DnsConfig;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use trust_dns_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::{ResolveError, ResolveErrorKind};
use trust_dns_resolver::TokioAsyncResolver;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DnsError {
    /// NXDOMAIN or no records of the requested type
    #[error("no such record")]
    NotFound,

    /// Timeout, SERVFAIL, refused, or any other failure
    #[error("DNS failure: {0}")]
    Failure(String),
}

impl From<ResolveError> for DnsError {
    fn from(e: ResolveError) -> Self {
        match e.kind() {
            ResolveErrorKind::NoRecordsFound { .. } => DnsError::NotFound,
            _ => DnsError::Failure(e.to_string()),
        }
    }
}

/// The lookups SPF evaluation needs
///
/// Returned names never carry a trailing dot.
#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// TXT records, each with its character-strings concatenated
    async fn txt(&self, name: &str) -> Result<Vec<String>, DnsError>;

    async fn a(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError>;

    async fn aaaa(&self, name: &str) -> Result<Vec<Ipv6Addr>, DnsError>;

    /// Exchange host names of the MX records
    async fn mx(&self, name: &str) -> Result<Vec<String>, DnsError>;

    /// Names from the reverse (PTR) zone of `ip`
    async fn ptr(&self, ip: IpAddr) -> Result<Vec<String>, DnsError>;

    /// A or AAAA records, whichever matches the family of `like`
    async fn addrs(&self, name: &str, like: IpAddr) -> Result<Vec<IpAddr>, DnsError> {
        match like {
            IpAddr::V4(_) => Ok(self.a(name).await?.into_iter().map(IpAddr::V4).collect()),
            IpAddr::V6(_) => Ok(self.aaaa(name).await?.into_iter().map(IpAddr::V6).collect()),
        }
    }
}

/// Production resolver backed by trust-dns
pub struct TrustDnsResolver {
    resolver: TokioAsyncResolver,
}

impl TrustDnsResolver {
    /// Build a resolver from the `[dns]` configuration section
    pub fn from_config(config: &DnsConfig) -> mailgate_common::Result<Self> {
        let (resolver_config, mut opts) = if config.use_system_conf {
            trust_dns_resolver::system_conf::read_system_conf().map_err(|e| {
                mailgate_common::Error::Dns(format!("Failed to read system resolver config: {}", e))
            })?
        } else {
            if config.nameservers.is_empty() {
                return Err(mailgate_common::Error::Config(
                    "dns.nameservers is empty and use_system_conf is off".to_string(),
                ));
            }
            let mut group = NameServerConfigGroup::new();
            for ns in &config.nameservers {
                let addr = parse_nameserver(ns)?;
                group.merge(NameServerConfigGroup::from_ips_clear(&[addr.ip()], addr.port(), true));
            }
            (ResolverConfig::from_parts(None, vec![], group), ResolverOpts::default())
        };

        opts.timeout = Duration::from_millis(config.timeout_ms);
        opts.attempts = config.attempts;

        debug!(
            "DNS resolver: system_conf={}, timeout={}ms, attempts={}",
            config.use_system_conf, config.timeout_ms, config.attempts
        );

        Ok(Self::with_resolver(TokioAsyncResolver::tokio(resolver_config, opts)))
    }

    /// Wrap an existing resolver
    pub fn with_resolver(resolver: TokioAsyncResolver) -> Self {
        Self { resolver }
    }
}

fn parse_nameserver(s: &str) -> mailgate_common::Result<SocketAddr> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    s.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, 53))
        .map_err(|_| mailgate_common::Error::Config(format!("Invalid nameserver address: {}", s)))
}

/// Query names as absolute so no search domain gets appended
fn fqdn(name: &str) -> String {
    format!("{}.", name.trim_end_matches('.'))
}

fn strip_root(name: String) -> String {
    match name.strip_suffix('.') {
        Some(stripped) => stripped.to_string(),
        None => name,
    }
}

#[async_trait]
impl DnsResolver for TrustDnsResolver {
    async fn txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        let lookup = self.resolver.txt_lookup(fqdn(name)).await?;
        Ok(lookup
            .iter()
            .map(|record| {
                record
                    .txt_data()
                    .iter()
                    .map(|d| String::from_utf8_lossy(d))
                    .collect::<String>()
            })
            .collect())
    }

    async fn a(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
        let lookup = self.resolver.ipv4_lookup(fqdn(name)).await?;
        Ok(lookup.iter().map(|record| record.0).collect())
    }

    async fn aaaa(&self, name: &str) -> Result<Vec<Ipv6Addr>, DnsError> {
        let lookup = self.resolver.ipv6_lookup(fqdn(name)).await?;
        Ok(lookup.iter().map(|record| record.0).collect())
    }

    async fn mx(&self, name: &str) -> Result<Vec<String>, DnsError> {
        let lookup = self.resolver.mx_lookup(fqdn(name)).await?;
        Ok(lookup
            .iter()
            .map(|mx| strip_root(mx.exchange().to_utf8()))
            .collect())
    }

    async fn ptr(&self, ip: IpAddr) -> Result<Vec<String>, DnsError> {
        let lookup = self.resolver.reverse_lookup(ip).await?;
        Ok(lookup.iter().map(|ptr| strip_root(ptr.0.to_utf8())).collect())
    }
}
