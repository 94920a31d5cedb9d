//! check_host: SPF evaluation of one (ip, domain, sender) triple

use super::dns::DnsResolver;
use super::macros::MacroContext;
use super::parser::PolicyRecord;
use super::result::SpfResult;
use super::{mechanisms, modifiers, record, SpfError};
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};

/// Most DNS-querying terms one evaluation may process (RFC 4408 §10.1)
pub const LIMIT: usize = 10;

/// State shared by every level of one evaluation
///
/// A context belongs to a single top-level check. `include` and `redirect`
/// pass it down by mutable reference, so the lookup counter and the set of
/// visited domains cover the whole tree.
pub struct EvaluationContext {
    resolver: Arc<dyn DnsResolver>,
    pub ip: IpAddr,
    pub sender: String,
    local_part: String,
    sender_domain: String,
    pub helo: String,
    lookups: usize,
    been_there: HashSet<String>,
    record: Option<String>,
}

impl EvaluationContext {
    /// `sender` must already be in `local@domain` form
    pub fn new(resolver: Arc<dyn DnsResolver>, ip: IpAddr, domain: &str, sender: &str, helo: &str) -> Self {
        let (local_part, sender_domain) = sender.rsplit_once('@').unwrap_or(("postmaster", domain));
        Self {
            resolver,
            ip,
            sender: sender.to_string(),
            local_part: local_part.to_string(),
            sender_domain: sender_domain.to_string(),
            helo: helo.to_string(),
            lookups: 0,
            been_there: HashSet::from([domain.to_string()]),
            record: None,
        }
    }

    pub fn resolver(&self) -> &dyn DnsResolver {
        self.resolver.as_ref()
    }

    /// DNS-querying terms processed so far
    pub fn lookups(&self) -> usize {
        self.lookups
    }

    /// Macro bindings with `domain` as the current domain
    pub fn macro_context<'a>(&'a self, domain: &'a str) -> MacroContext<'a> {
        MacroContext {
            sender: &self.sender,
            local_part: &self.local_part,
            sender_domain: &self.sender_domain,
            domain,
            ip: self.ip,
            helo: &self.helo,
        }
    }

    /// Account for one more DNS-querying term
    ///
    /// Fails with `PermError` once [`LIMIT`] terms have been processed.
    pub fn count_lookup(&mut self) -> Result<(), SpfResult> {
        if self.lookups >= LIMIT {
            warn!("DNS lookup limit of {} exceeded", LIMIT);
            return Err(SpfResult::PermError);
        }
        self.lookups += 1;
        Ok(())
    }

    /// Mark `domain` visited; false if it already was
    pub fn enter(&mut self, domain: &str) -> bool {
        self.been_there.insert(domain.to_ascii_lowercase())
    }
}

/// Evaluate the record published by `domain`
///
/// Boxed because `include` and `redirect` recurse into it.
pub(crate) fn check_domain<'a>(
    ctx: &'a mut EvaluationContext,
    domain: &'a str,
) -> Pin<Box<dyn Future<Output = SpfResult> + Send + 'a>> {
    Box::pin(async move {
        let text = match record::fetch_record(ctx.resolver(), domain).await {
            Ok(text) => text,
            Err(result) => return result,
        };
        if ctx.record.is_none() {
            ctx.record = Some(text.clone());
        }

        let policy = match PolicyRecord::parse(&text, &ctx.macro_context(domain)) {
            Ok(policy) => policy,
            Err(e) => {
                warn!("Invalid SPF record for {}: {}", domain, e);
                return SpfResult::PermError;
            }
        };

        for mechanism in &policy.mechanisms {
            let result = mechanisms::evaluate(mechanism, ctx, domain).await;
            debug!(
                "{}{} in {} -> {}",
                mechanism.qualifier.as_char(),
                mechanism.kind.name(),
                domain,
                result
            );
            if result != SpfResult::None {
                return result;
            }
        }

        for modifier in &policy.modifiers {
            let result = modifiers::evaluate(modifier, ctx, domain).await;
            if result != SpfResult::None {
                return result;
            }
        }

        SpfResult::Neutral
    })
}

/// The result of a top-level check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpfOutcome {
    pub result: SpfResult,
    /// The domain checked, normalized
    pub domain: String,
    /// The normalized sender the macros saw
    pub sender: String,
    /// The SPF record of `domain`, if one was found
    pub record: Option<String>,
    /// DNS-querying terms processed
    pub lookups: usize,
}

/// SPF evaluator
pub struct SpfEvaluator {
    resolver: Arc<dyn DnsResolver>,
    helo: Option<String>,
}

impl SpfEvaluator {
    pub fn new(resolver: Arc<dyn DnsResolver>) -> Self {
        Self { resolver, helo: None }
    }

    /// Set the HELO/EHLO name bound to `%{h}`
    pub fn with_helo(mut self, helo: impl Into<String>) -> Self {
        self.helo = Some(helo.into());
        self
    }

    /// Check whether `ip` may send mail for `domain`
    ///
    /// An unparseable `ip` or empty `domain` is a caller error, reported as
    /// [`SpfError`] rather than a result.
    pub async fn check_host(&self, ip: &str, domain: &str, sender: Option<&str>) -> Result<SpfOutcome, SpfError> {
        let ip: IpAddr = ip
            .trim()
            .parse()
            .map_err(|_| SpfError::InvalidIp(ip.to_string()))?;
        self.check_addr(ip, domain, sender).await
    }

    /// [`check_host`](Self::check_host) for an already parsed address
    pub async fn check_addr(&self, ip: IpAddr, domain: &str, sender: Option<&str>) -> Result<SpfOutcome, SpfError> {
        let ip = canonical_ip(ip);
        let domain = normalize_domain(domain).ok_or_else(|| SpfError::InvalidDomain(domain.to_string()))?;
        let sender = normalize_sender(sender, &domain);
        let helo = self.helo.as_deref().unwrap_or(&domain).to_ascii_lowercase();

        let span = info_span!("spf_check", %ip, domain = %domain, sender = %sender);
        let outcome = async move {
            let mut ctx = EvaluationContext::new(self.resolver.clone(), ip, &domain, &sender, &helo);
            let result = check_domain(&mut ctx, &domain).await;
            info!("SPF {} for {} from {} ({} lookups)", result, domain, ip, ctx.lookups);

            SpfOutcome {
                result,
                record: ctx.record.take(),
                lookups: ctx.lookups,
                domain,
                sender,
            }
        }
        .instrument(span)
        .await;

        Ok(outcome)
    }
}

/// IPv4-mapped IPv6 addresses are checked as IPv4
fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        IpAddr::V4(_) => ip,
    }
}

fn normalize_domain(domain: &str) -> Option<String> {
    let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    if domain.is_empty() {
        None
    } else {
        Some(domain)
    }
}

/// Lowercase the sender and fill in a missing local part or address
fn normalize_sender(sender: Option<&str>, domain: &str) -> String {
    let sender = sender
        .map(|s| s.trim().trim_start_matches('<').trim_end_matches('>').to_ascii_lowercase())
        .unwrap_or_default();

    match sender.rsplit_once('@') {
        _ if sender.is_empty() => format!("postmaster@{}", domain),
        None => format!("postmaster@{}", sender),
        Some((local, sender_domain)) => {
            let local = if local.is_empty() { "postmaster" } else { local };
            let sender_domain = if sender_domain.is_empty() { domain } else { sender_domain };
            format!("{}@{}", local, sender_domain)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spf::dns::mock::MockResolver;
    use pretty_assertions::assert_eq;

    async fn check(dns: MockResolver, ip: &str, domain: &str) -> SpfResult {
        SpfEvaluator::new(Arc::new(dns))
            .check_host(ip, domain, None)
            .await
            .unwrap()
            .result
    }

    fn single(domain: &str, record: &str) -> MockResolver {
        MockResolver::new().with_txt(domain, record)
    }

    #[tokio::test]
    async fn test_qualifier_all_constants() {
        for (record, expected) in [
            ("v=spf1 all", SpfResult::Pass),
            ("v=spf1 +all", SpfResult::Pass),
            ("v=spf1 -all", SpfResult::Fail),
            ("v=spf1 ~all", SpfResult::SoftFail),
            ("v=spf1 ?all", SpfResult::Neutral),
            ("v=spf1 ip4:192.0.2.0/24 -all", SpfResult::Fail),
        ] {
            for ip in ["198.51.100.7", "2001:db8::7"] {
                assert_eq!(check(single("example.com", record), ip, "example.com").await, expected, "{} / {}", record, ip);
            }
        }
    }

    #[tokio::test]
    async fn test_no_record() {
        assert_eq!(check(MockResolver::new(), "192.0.2.1", "example.com").await, SpfResult::None);
        let dns = single("example.com", "not an spf record");
        assert_eq!(check(dns, "192.0.2.1", "example.com").await, SpfResult::None);
    }

    #[tokio::test]
    async fn test_multiple_records() {
        let dns = MockResolver::new()
            .with_txt("example.com", "v=spf1 -all")
            .with_txt("example.com", "v=spf1 +all");
        assert_eq!(check(dns, "192.0.2.1", "example.com").await, SpfResult::PermError);
    }

    #[tokio::test]
    async fn test_lookup_failure() {
        let dns = MockResolver::new().with_failure("example.com");
        assert_eq!(check(dns, "192.0.2.1", "example.com").await, SpfResult::TempError);
    }

    #[tokio::test]
    async fn test_ip4_network() {
        let record = "v=spf1 ip4:203.0.113.0/24 -all";
        assert_eq!(check(single("example.com", record), "203.0.113.5", "example.com").await, SpfResult::Pass);
        assert_eq!(check(single("example.com", record), "198.51.100.9", "example.com").await, SpfResult::Fail);
    }

    #[tokio::test]
    async fn test_a_mechanism() {
        let dns = || single("example.com", "v=spf1 a -all").with_a("example.com", "203.0.113.5");
        assert_eq!(check(dns(), "203.0.113.5", "example.com").await, SpfResult::Pass);
        assert_eq!(check(dns(), "203.0.113.6", "example.com").await, SpfResult::Fail);
    }

    #[tokio::test]
    async fn test_include() {
        let dns = MockResolver::new()
            .with_txt("example.com", "v=spf1 include:_spf.example.net ~all")
            .with_txt("_spf.example.net", "v=spf1 ip4:10.0.0.0/8 +all");
        assert_eq!(check(dns, "10.1.2.3", "example.com").await, SpfResult::Pass);

        // The included record ends in +all, so any address passes through it
        let dns = MockResolver::new()
            .with_txt("example.com", "v=spf1 include:_spf.example.net ~all")
            .with_txt("_spf.example.net", "v=spf1 ip4:10.0.0.0/8 +all");
        assert_eq!(check(dns, "192.0.2.1", "example.com").await, SpfResult::Pass);

        // Without the trailing +all the included record no longer passes
        // everything, so an outside address falls through to ~all
        let dns = MockResolver::new()
            .with_txt("example.com", "v=spf1 include:_spf.example.net ~all")
            .with_txt("_spf.example.net", "v=spf1 ip4:10.0.0.0/8 -all");
        assert_eq!(check(dns, "192.0.2.1", "example.com").await, SpfResult::SoftFail);
    }

    #[tokio::test]
    async fn test_qualified_include_passes() {
        let dns = MockResolver::new()
            .with_txt("example.com", "v=spf1 -include:_spf.example.net ~all")
            .with_txt("_spf.example.net", "v=spf1 +all");
        assert_eq!(check(dns, "192.0.2.1", "example.com").await, SpfResult::Pass);
    }

    #[tokio::test]
    async fn test_self_include_terminates() {
        let dns = single("example.com", "v=spf1 include:example.com -all");
        assert_eq!(check(dns, "192.0.2.1", "example.com").await, SpfResult::Fail);

        let dns = single("example.com", "v=spf1 include:example.com");
        assert_eq!(check(dns, "192.0.2.1", "example.com").await, SpfResult::Neutral);
    }

    #[tokio::test]
    async fn test_mutual_include_terminates() {
        let dns = MockResolver::new()
            .with_txt("a.example", "v=spf1 include:b.example ~all")
            .with_txt("b.example", "v=spf1 include:a.example");
        let evaluator = SpfEvaluator::new(Arc::new(dns));
        let outcome = evaluator.check_host("192.0.2.1", "a.example", None).await.unwrap();
        assert_eq!(outcome.result, SpfResult::SoftFail);
        assert_eq!(outcome.lookups, 1);
    }

    #[tokio::test]
    async fn test_redirect_loop_terminates() {
        let dns = MockResolver::new()
            .with_txt("a.example", "v=spf1 redirect=b.example")
            .with_txt("b.example", "v=spf1 redirect=a.example");
        // b's redirect back to a is skipped, so b ends in the default
        assert_eq!(check(dns, "192.0.2.1", "a.example").await, SpfResult::Neutral);
    }

    #[tokio::test]
    async fn test_lookup_limit() {
        let names: Vec<String> = (1..=11).map(|i| format!("a:h{}.example.com", i)).collect();

        let ten = format!("v=spf1 {} -all", names[..10].join(" "));
        let dns = Arc::new(single("example.com", &ten));
        let outcome = SpfEvaluator::new(dns).check_host("192.0.2.1", "example.com", None).await.unwrap();
        assert_eq!(outcome.result, SpfResult::Fail);
        assert_eq!(outcome.lookups, 10);

        let eleven = format!("v=spf1 {} -all", names.join(" "));
        let dns = Arc::new(single("example.com", &eleven));
        let outcome = SpfEvaluator::new(dns.clone())
            .check_host("192.0.2.1", "example.com", None)
            .await
            .unwrap();
        assert_eq!(outcome.result, SpfResult::PermError);
        // The TXT query plus ten address queries; the eleventh is never sent
        assert_eq!(dns.queries(), 11);
    }

    #[tokio::test]
    async fn test_lookup_limit_spans_includes() {
        // Each level costs one include; the chain is longer than the limit
        let dns = (0..12).fold(MockResolver::new(), |dns, i| {
            dns.with_txt(&format!("l{}.example", i), &format!("v=spf1 include:l{}.example", i + 1))
        });
        assert_eq!(check(dns, "192.0.2.1", "l0.example").await, SpfResult::PermError);
    }

    #[tokio::test]
    async fn test_invalid_literal_before_dns() {
        let dns = Arc::new(single("example.com", "v=spf1 a:mail.example.com ip4:bad -all"));
        let outcome = SpfEvaluator::new(dns.clone())
            .check_host("192.0.2.1", "example.com", None)
            .await
            .unwrap();
        assert_eq!(outcome.result, SpfResult::PermError);
        assert_eq!(outcome.lookups, 0);
        // Only the TXT query
        assert_eq!(dns.queries(), 1);
    }

    #[tokio::test]
    async fn test_redirect() {
        let dns = MockResolver::new()
            .with_txt("example.com", "v=spf1 ip4:192.0.2.1 redirect=_spf.example.com")
            .with_txt("_spf.example.com", "v=spf1 ip4:198.51.100.0/24 ~all");
        let evaluator = SpfEvaluator::new(Arc::new(dns));
        for (ip, expected) in [
            ("192.0.2.1", SpfResult::Pass),
            ("198.51.100.3", SpfResult::Pass),
            ("203.0.113.1", SpfResult::SoftFail),
        ] {
            let outcome = evaluator.check_host(ip, "example.com", None).await.unwrap();
            assert_eq!(outcome.result, expected, "{}", ip);
        }
    }

    #[tokio::test]
    async fn test_redirect_ignored_after_all() {
        let dns = MockResolver::new()
            .with_txt("example.com", "v=spf1 -all redirect=_spf.example.com")
            .with_txt("_spf.example.com", "v=spf1 +all");
        assert_eq!(check(dns, "192.0.2.1", "example.com").await, SpfResult::Fail);
    }

    #[tokio::test]
    async fn test_default_neutral() {
        let dns = single("example.com", "v=spf1 ip4:192.0.2.1 exp=explain.example.com unknown=x");
        assert_eq!(check(dns, "198.51.100.1", "example.com").await, SpfResult::Neutral);
    }

    #[tokio::test]
    async fn test_exists_with_macros() {
        let dns = single("example.com", "v=spf1 exists:%{l}.%{ir}.senders.%{d} -all")
            .with_a("alice.1.2.0.192.senders.example.com", "127.0.0.2");
        let evaluator = SpfEvaluator::new(Arc::new(dns));

        let outcome = evaluator.check_host("192.0.2.1", "example.com", Some("Alice@Example.com")).await.unwrap();
        assert_eq!(outcome.result, SpfResult::Pass);
        assert_eq!(outcome.sender, "alice@example.com");

        let outcome = evaluator.check_host("192.0.2.1", "example.com", Some("bob@example.com")).await.unwrap();
        assert_eq!(outcome.result, SpfResult::Fail);
    }

    #[tokio::test]
    async fn test_helo_macro() {
        let dns = single("example.com", "v=spf1 exists:%{h}.allowed.example.com -all")
            .with_a("relay.example.org.allowed.example.com", "127.0.0.2");
        let evaluator = SpfEvaluator::new(Arc::new(dns)).with_helo("relay.example.org");
        let outcome = evaluator.check_host("192.0.2.1", "example.com", None).await.unwrap();
        assert_eq!(outcome.result, SpfResult::Pass);
    }

    #[tokio::test]
    async fn test_ipv4_mapped_client() {
        let dns = single("example.com", "v=spf1 ip4:192.0.2.0/24 -all");
        assert_eq!(check(dns, "::ffff:192.0.2.10", "example.com").await, SpfResult::Pass);
    }

    #[tokio::test]
    async fn test_outcome() {
        let dns = single("example.com", "V=SPF1  ip4:192.0.2.0/24   -ALL");
        let outcome = SpfEvaluator::new(Arc::new(dns))
            .check_host("192.0.2.9", "Example.com.", None)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SpfOutcome {
                result: SpfResult::Pass,
                domain: "example.com".to_string(),
                sender: "postmaster@example.com".to_string(),
                record: Some("v=spf1 ip4:192.0.2.0/24 -all".to_string()),
                lookups: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_idempotent() {
        let dns = MockResolver::new()
            .with_txt("example.com", "v=spf1 mx include:_spf.example.net -all")
            .with_mx("example.com", "mx.example.com")
            .with_a("mx.example.com", "192.0.2.25")
            .with_txt("_spf.example.net", "v=spf1 ip4:198.51.100.0/24 -all");
        let evaluator = SpfEvaluator::new(Arc::new(dns));

        for ip in ["192.0.2.25", "198.51.100.4", "203.0.113.1"] {
            let first = evaluator.check_host(ip, "example.com", Some("user@example.com")).await.unwrap();
            let second = evaluator.check_host(ip, "example.com", Some("user@example.com")).await.unwrap();
            assert_eq!(first, second);
        }
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let evaluator = SpfEvaluator::new(Arc::new(MockResolver::new()));
        assert!(matches!(
            evaluator.check_host("not-an-ip", "example.com", None).await,
            Err(SpfError::InvalidIp(_))
        ));
        assert!(matches!(
            evaluator.check_host("192.0.2.1", " . ", None).await,
            Err(SpfError::InvalidDomain(_))
        ));
    }

    #[test]
    fn test_normalize_sender() {
        assert_eq!(normalize_sender(None, "example.com"), "postmaster@example.com");
        assert_eq!(normalize_sender(Some(""), "example.com"), "postmaster@example.com");
        assert_eq!(normalize_sender(Some("<>"), "example.com"), "postmaster@example.com");
        assert_eq!(normalize_sender(Some("User@Example.COM"), "example.com"), "user@example.com");
        assert_eq!(normalize_sender(Some("mail.example.org"), "example.com"), "postmaster@mail.example.org");
        assert_eq!(normalize_sender(Some("@example.org"), "example.com"), "postmaster@example.org");
    }

    #[test]
    fn test_canonical_ip() {
        assert_eq!(canonical_ip("::ffff:192.0.2.1".parse().unwrap()), "192.0.2.1".parse::<IpAddr>().unwrap());
        assert_eq!(canonical_ip("2001:db8::1".parse().unwrap()), "2001:db8::1".parse::<IpAddr>().unwrap());
    }
}
