//! Mechanism evaluation
//!
//! Each mechanism yields its qualifier's result on a match and
//! [`SpfResult::None`] otherwise, so the caller moves on to the next one.

use super::check::{check_domain, EvaluationContext};
use super::cidr::DualCidr;
use super::dns::DnsError;
use super::parser::{Mechanism, MechanismKind};
use super::result::{Qualifier, SpfResult};
use futures::future::join_all;
use ipnet::{Ipv4Net, Ipv6Net};
use std::net::IpAddr;
use tracing::{debug, warn};

/// Most MX or PTR names one mechanism may look at (RFC 4408 §10.1)
pub const MAX_NAME_LOOKUPS: usize = 10;

/// Evaluate `mechanism` as found in the record of `domain`
pub async fn evaluate(mechanism: &Mechanism, ctx: &mut EvaluationContext, domain: &str) -> SpfResult {
    let qualifier = mechanism.qualifier;
    match &mechanism.kind {
        MechanismKind::All => all(qualifier),
        MechanismKind::Ip4(network) => ip4(qualifier, network, ctx.ip),
        MechanismKind::Ip6(network) => ip6(qualifier, network, ctx.ip),
        MechanismKind::A { domain: target, cidr } => {
            a(qualifier, ctx, target.as_deref().unwrap_or(domain), cidr).await
        }
        MechanismKind::Mx { domain: target, cidr } => {
            mx(qualifier, ctx, target.as_deref().unwrap_or(domain), cidr).await
        }
        MechanismKind::Ptr { domain: target } => ptr(qualifier, ctx, target.as_deref().unwrap_or(domain)).await,
        MechanismKind::Include(target) => include(ctx, target).await,
        MechanismKind::Exists(target) => exists(qualifier, ctx, target).await,
    }
}

pub fn all(qualifier: Qualifier) -> SpfResult {
    qualifier.result()
}

pub fn ip4(qualifier: Qualifier, network: &Ipv4Net, client: IpAddr) -> SpfResult {
    match client {
        IpAddr::V4(ip) if network.contains(&ip) => qualifier.result(),
        _ => SpfResult::None,
    }
}

pub fn ip6(qualifier: Qualifier, network: &Ipv6Net, client: IpAddr) -> SpfResult {
    match client {
        IpAddr::V6(ip) if network.contains(&ip) => qualifier.result(),
        _ => SpfResult::None,
    }
}

pub async fn a(qualifier: Qualifier, ctx: &mut EvaluationContext, target: &str, cidr: &DualCidr) -> SpfResult {
    if let Err(result) = ctx.count_lookup() {
        return result;
    }

    match ctx.resolver().addrs(target, ctx.ip).await {
        Ok(addrs) if addrs.iter().any(|addr| cidr.matches(ctx.ip, *addr)) => qualifier.result(),
        Ok(_) | Err(DnsError::NotFound) => SpfResult::None,
        Err(DnsError::Failure(e)) => {
            warn!("Address lookup failed for {}: {}", target, e);
            SpfResult::TempError
        }
    }
}

pub async fn mx(qualifier: Qualifier, ctx: &mut EvaluationContext, target: &str, cidr: &DualCidr) -> SpfResult {
    if let Err(result) = ctx.count_lookup() {
        return result;
    }

    let resolver = ctx.resolver();
    let ip = ctx.ip;
    let exchanges = match resolver.mx(target).await {
        Ok(exchanges) => exchanges,
        Err(DnsError::NotFound) => return SpfResult::None,
        Err(DnsError::Failure(e)) => {
            warn!("MX lookup failed for {}: {}", target, e);
            return SpfResult::TempError;
        }
    };

    if exchanges.len() > MAX_NAME_LOOKUPS {
        warn!("{} has {} MX records, more than {}", target, exchanges.len(), MAX_NAME_LOOKUPS);
        return SpfResult::PermError;
    }

    let answers = join_all(exchanges.iter().map(|host| resolver.addrs(host, ip))).await;

    let mut temp_error = false;
    for (host, answer) in exchanges.iter().zip(answers) {
        match answer {
            Ok(addrs) if addrs.iter().any(|addr| cidr.matches(ip, *addr)) => {
                debug!("{} matches MX host {} of {}", ip, host, target);
                return qualifier.result();
            }
            Ok(_) | Err(DnsError::NotFound) => {}
            Err(DnsError::Failure(e)) => {
                warn!("Address lookup failed for MX host {}: {}", host, e);
                temp_error = true;
            }
        }
    }

    if temp_error {
        SpfResult::TempError
    } else {
        SpfResult::None
    }
}

pub async fn ptr(qualifier: Qualifier, ctx: &mut EvaluationContext, target: &str) -> SpfResult {
    if let Err(result) = ctx.count_lookup() {
        return result;
    }

    let resolver = ctx.resolver();
    let ip = ctx.ip;
    let names = match resolver.ptr(ip).await {
        Ok(names) => names,
        Err(e) => {
            debug!("Reverse lookup of {} failed: {}", ip, e);
            return SpfResult::None;
        }
    };

    if names.len() > MAX_NAME_LOOKUPS {
        warn!("{} has {} PTR names, more than {}", ip, names.len(), MAX_NAME_LOOKUPS);
        return SpfResult::PermError;
    }

    // Forward-confirm every name, then look for one under the target domain
    let confirmed = join_all(names.iter().map(|name| async move {
        match resolver.addrs(name, ip).await {
            Ok(addrs) if addrs.contains(&ip) => Some(name.as_str()),
            _ => None,
        }
    }))
    .await;

    if confirmed.into_iter().flatten().any(|name| is_within_domain(name, target)) {
        qualifier.result()
    } else {
        SpfResult::None
    }
}

/// Whether `name` equals `domain` or is a subdomain of it
fn is_within_domain(name: &str, domain: &str) -> bool {
    let name = name.trim_end_matches('.');
    let domain = domain.trim_end_matches('.');
    if name.len() < domain.len() {
        return false;
    }
    let (head, tail) = name.split_at(name.len() - domain.len());
    tail.eq_ignore_ascii_case(domain) && (head.is_empty() || head.ends_with('.'))
}

/// Unlike the other mechanisms, the include's own qualifier plays no part in
/// the result
pub async fn include(ctx: &mut EvaluationContext, target: &str) -> SpfResult {
    if !ctx.enter(target) {
        debug!("Not including {} again", target);
        return SpfResult::None;
    }
    if let Err(result) = ctx.count_lookup() {
        return result;
    }

    let result = check_domain(ctx, target).await;
    debug!("include:{} evaluated to {}", target, result);
    match result {
        SpfResult::Pass => SpfResult::Pass,
        SpfResult::Fail | SpfResult::SoftFail | SpfResult::Neutral => SpfResult::None,
        SpfResult::TempError => SpfResult::TempError,
        SpfResult::PermError | SpfResult::None => SpfResult::PermError,
    }
}

pub async fn exists(qualifier: Qualifier, ctx: &mut EvaluationContext, target: &str) -> SpfResult {
    if let Err(result) = ctx.count_lookup() {
        return result;
    }

    match ctx.resolver().a(target).await {
        Ok(addrs) if !addrs.is_empty() => qualifier.result(),
        Ok(_) | Err(DnsError::NotFound) => SpfResult::None,
        Err(DnsError::Failure(e)) => {
            warn!("A lookup failed for {}: {}", target, e);
            SpfResult::TempError
        }
    }
}
