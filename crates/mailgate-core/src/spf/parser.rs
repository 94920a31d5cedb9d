//! SPF record parsing
//!
//! A record is parsed in one pass over its whitespace-separated terms. The
//! first malformed term fails the whole record. Domain-spec arguments of
//! mechanisms are macro-expanded here, against the domain the record was
//! published under, so evaluation only sees concrete names.

use super::cidr::{self, CidrError, DualCidr};
use super::macros::{self, MacroContext, MacroError};
use super::result::Qualifier;
use ipnet::{Ipv4Net, Ipv6Net};
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::debug;

const VERSION: &str = "v=spf1";

/// Reasons a record is rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("record does not start with v=spf1")]
    NotSpf,

    #[error("unrecognized term: {0}")]
    UnknownTerm(String),

    #[error("{0} requires an argument")]
    MissingArgument(&'static str),

    #[error("{0} takes no argument")]
    UnexpectedArgument(&'static str),

    #[error("invalid network in {term}: {source}")]
    Network { term: String, source: CidrError },

    #[error("invalid macro in {term}: {source}")]
    Macro { term: String, source: MacroError },

    #[error("duplicate {0} modifier")]
    DuplicateModifier(&'static str),
}

/// What a mechanism tests, with its argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MechanismKind {
    All,
    /// `domain` is `None` when the current domain applies
    A { domain: Option<String>, cidr: DualCidr },
    Mx { domain: Option<String>, cidr: DualCidr },
    Ptr { domain: Option<String> },
    Ip4(Ipv4Net),
    Ip6(Ipv6Net),
    Include(String),
    Exists(String),
}

impl MechanismKind {
    pub fn name(&self) -> &'static str {
        match self {
            MechanismKind::All => "all",
            MechanismKind::A { .. } => "a",
            MechanismKind::Mx { .. } => "mx",
            MechanismKind::Ptr { .. } => "ptr",
            MechanismKind::Ip4(_) => "ip4",
            MechanismKind::Ip6(_) => "ip6",
            MechanismKind::Include(_) => "include",
            MechanismKind::Exists(_) => "exists",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mechanism {
    pub qualifier: Qualifier,
    pub kind: MechanismKind,
}

/// A `name=value` term
///
/// Values are kept unexpanded; `redirect` is expanded when it is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modifier {
    Redirect(String),
    Explanation(String),
    Unknown { name: String, value: String },
}

/// A parsed SPF record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRecord {
    /// The record as published (after normalization)
    pub text: String,
    pub mechanisms: Vec<Mechanism>,
    pub modifiers: Vec<Modifier>,
}

fn modifier_pattern() -> &'static Regex {
    static MODIFIER: OnceLock<Regex> = OnceLock::new();
    MODIFIER.get_or_init(|| {
        Regex::new(r"^([A-Za-z][A-Za-z0-9._-]*)=(.*)$").expect("modifier pattern is valid")
    })
}

const MECHANISM_NAMES: [&str; 8] = ["all", "include", "a", "mx", "ptr", "ip4", "ip6", "exists"];

impl PolicyRecord {
    /// Parse `text`, expanding mechanism arguments with `ctx`
    pub fn parse(text: &str, ctx: &MacroContext<'_>) -> Result<Self, ParseError> {
        let mut terms = text.split_ascii_whitespace();
        match terms.next() {
            Some(version) if version.eq_ignore_ascii_case(VERSION) => {}
            _ => return Err(ParseError::NotSpf),
        }

        let mut mechanisms = Vec::new();
        let mut modifiers = Vec::new();
        let mut have_redirect = false;
        let mut have_exp = false;

        for term in terms {
            if let Some(captures) = modifier_pattern().captures(term) {
                let name = captures.get(1).map_or("", |m| m.as_str());
                let value = captures.get(2).map_or("", |m| m.as_str());
                let modifier = parse_modifier(term, name, value)?;
                match &modifier {
                    Modifier::Redirect(_) if have_redirect => {
                        return Err(ParseError::DuplicateModifier("redirect"))
                    }
                    Modifier::Redirect(_) => have_redirect = true,
                    Modifier::Explanation(_) if have_exp => return Err(ParseError::DuplicateModifier("exp")),
                    Modifier::Explanation(_) => have_exp = true,
                    Modifier::Unknown { name, .. } => debug!("Ignoring unknown modifier {}", name),
                }
                modifiers.push(modifier);
            } else {
                let mechanism = parse_mechanism(term, ctx)?;
                debug!("Parsed {}{} from {}", mechanism.qualifier.as_char(), mechanism.kind.name(), term);
                mechanisms.push(mechanism);
            }
        }

        Ok(Self {
            text: text.to_string(),
            mechanisms,
            modifiers,
        })
    }
}

fn parse_modifier(term: &str, name: &str, value: &str) -> Result<Modifier, ParseError> {
    let name = name.to_ascii_lowercase();
    if MECHANISM_NAMES.contains(&name.as_str()) {
        return Err(ParseError::UnknownTerm(term.to_string()));
    }

    let macro_error = |source: MacroError| ParseError::Macro {
        term: term.to_string(),
        source,
    };
    match name.as_str() {
        "redirect" => {
            if value.is_empty() {
                return Err(ParseError::MissingArgument("redirect"));
            }
            macros::validate(value).map_err(macro_error)?;
            Ok(Modifier::Redirect(value.to_string()))
        }
        "exp" => {
            if value.is_empty() {
                return Err(ParseError::MissingArgument("exp"));
            }
            Ok(Modifier::Explanation(value.to_string()))
        }
        _ => Ok(Modifier::Unknown {
            name,
            value: value.to_string(),
        }),
    }
}

fn parse_mechanism(term: &str, ctx: &MacroContext<'_>) -> Result<Mechanism, ParseError> {
    let (qualifier, body) = match term.chars().next().and_then(Qualifier::from_char) {
        Some(qualifier) => (qualifier, &term[1..]),
        None => (Qualifier::default(), term),
    };

    let split = body.find(&[':', '/'][..]).unwrap_or(body.len());
    let (name, rest) = body.split_at(split);
    let name = name.to_ascii_lowercase();

    let network_error = |source: CidrError| ParseError::Network {
        term: term.to_string(),
        source,
    };
    let expand = |spec: &str| {
        macros::expand_domain(spec, ctx).map_err(|source| ParseError::Macro {
            term: term.to_string(),
            source,
        })
    };
    // `:domain-spec`, required and non-empty
    let required_domain = |mechanism: &'static str| match rest.strip_prefix(':') {
        Some(spec) if !spec.is_empty() => expand(spec),
        Some(_) => Err(ParseError::MissingArgument(mechanism)),
        None if rest.is_empty() => Err(ParseError::MissingArgument(mechanism)),
        None => Err(ParseError::UnknownTerm(term.to_string())),
    };
    // `[:domain-spec][dual-cidr]`
    let domain_and_cidr = || -> Result<(Option<String>, DualCidr), ParseError> {
        let (spec, cidr) = match rest.strip_prefix(':') {
            Some(arg) => {
                let (spec, cidr) = cidr::parse_dual_cidr(arg).map_err(network_error)?;
                if spec.is_empty() {
                    return Err(ParseError::UnknownTerm(term.to_string()));
                }
                (Some(spec), cidr)
            }
            None => {
                let (spec, cidr) = cidr::parse_dual_cidr(rest).map_err(network_error)?;
                if !spec.is_empty() {
                    return Err(ParseError::UnknownTerm(term.to_string()));
                }
                (None, cidr)
            }
        };
        Ok((spec.map(expand).transpose()?, cidr))
    };

    let kind = match name.as_str() {
        "all" => {
            if !rest.is_empty() {
                return Err(ParseError::UnexpectedArgument("all"));
            }
            MechanismKind::All
        }
        "include" => MechanismKind::Include(required_domain("include")?),
        "exists" => MechanismKind::Exists(required_domain("exists")?),
        "a" => {
            let (domain, cidr) = domain_and_cidr()?;
            MechanismKind::A { domain, cidr }
        }
        "mx" => {
            let (domain, cidr) = domain_and_cidr()?;
            MechanismKind::Mx { domain, cidr }
        }
        "ptr" => {
            let domain = if rest.is_empty() {
                None
            } else {
                Some(required_domain("ptr")?)
            };
            MechanismKind::Ptr { domain }
        }
        "ip4" => match rest.strip_prefix(':') {
            Some(arg) => MechanismKind::Ip4(cidr::parse_ip4_network(arg).map_err(network_error)?),
            None => return Err(ParseError::MissingArgument("ip4")),
        },
        "ip6" => match rest.strip_prefix(':') {
            Some(arg) => MechanismKind::Ip6(cidr::parse_ip6_network(arg).map_err(network_error)?),
            None => return Err(ParseError::MissingArgument("ip6")),
        },
        _ => return Err(ParseError::UnknownTerm(term.to_string())),
    };

    Ok(Mechanism { qualifier, kind })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ctx() -> MacroContext<'static> {
        MacroContext {
            sender: "user@example.com",
            local_part: "user",
            sender_domain: "example.com",
            domain: "example.com",
            ip: "192.0.2.3".parse().unwrap(),
            helo: "mx.example.com",
        }
    }

    fn parse(text: &str) -> Result<PolicyRecord, ParseError> {
        PolicyRecord::parse(text, &ctx())
    }

    fn mechanism(qualifier: Qualifier, kind: MechanismKind) -> Mechanism {
        Mechanism { qualifier, kind }
    }

    #[test]
    fn test_parse_typical_record() {
        let record = parse("v=spf1 ip4:192.0.2.0/24 ip6:2001:db8::/32 a mx:mail.example.com/28 include:_spf.example.net ~all").unwrap();
        assert_eq!(
            record.mechanisms,
            vec![
                mechanism(Qualifier::Pass, MechanismKind::Ip4("192.0.2.0/24".parse().unwrap())),
                mechanism(Qualifier::Pass, MechanismKind::Ip6("2001:db8::/32".parse().unwrap())),
                mechanism(
                    Qualifier::Pass,
                    MechanismKind::A {
                        domain: None,
                        cidr: DualCidr::default()
                    }
                ),
                mechanism(
                    Qualifier::Pass,
                    MechanismKind::Mx {
                        domain: Some("mail.example.com".to_string()),
                        cidr: DualCidr { v4: 28, v6: 128 }
                    }
                ),
                mechanism(Qualifier::Pass, MechanismKind::Include("_spf.example.net".to_string())),
                mechanism(Qualifier::SoftFail, MechanismKind::All),
            ]
        );
        assert!(record.modifiers.is_empty());
    }

    #[test]
    fn test_qualifiers() {
        let record = parse("v=spf1 +a -mx ?ptr ~exists:example.com").unwrap();
        let qualifiers: Vec<_> = record.mechanisms.iter().map(|m| m.qualifier).collect();
        assert_eq!(
            qualifiers,
            vec![Qualifier::Pass, Qualifier::Fail, Qualifier::Neutral, Qualifier::SoftFail]
        );
    }

    #[test]
    fn test_cidr_without_domain() {
        let record = parse("v=spf1 a/24 mx//64 a/24//64").unwrap();
        assert_eq!(
            record.mechanisms[0].kind,
            MechanismKind::A {
                domain: None,
                cidr: DualCidr { v4: 24, v6: 128 }
            }
        );
        assert_eq!(
            record.mechanisms[1].kind,
            MechanismKind::Mx {
                domain: None,
                cidr: DualCidr { v4: 32, v6: 64 }
            }
        );
        assert_eq!(
            record.mechanisms[2].kind,
            MechanismKind::A {
                domain: None,
                cidr: DualCidr { v4: 24, v6: 64 }
            }
        );
    }

    #[test]
    fn test_macros_expanded_at_parse() {
        let record = parse("v=spf1 exists:%{ir}.%{l}._spf.%{d} include:%{d2}").unwrap();
        assert_eq!(
            record.mechanisms[0].kind,
            MechanismKind::Exists("3.2.0.192.user._spf.example.com".to_string())
        );
        assert_eq!(record.mechanisms[1].kind, MechanismKind::Include("example.com".to_string()));
    }

    #[test]
    fn test_modifiers() {
        let record = parse("v=spf1 -ip4:192.0.2.1 redirect=_spf.%{d} exp=explain.%{d} foo=bar").unwrap();
        assert_eq!(
            record.modifiers,
            vec![
                Modifier::Redirect("_spf.%{d}".to_string()),
                Modifier::Explanation("explain.%{d}".to_string()),
                Modifier::Unknown {
                    name: "foo".to_string(),
                    value: "bar".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_rejects_malformed_terms() {
        assert_eq!(parse("v=spf1 ip4:bad").unwrap_err().to_string(), "invalid network in ip4:bad: invalid IP address: bad");
        assert!(matches!(parse("v=spf1 ip4:192.0.2.0/33"), Err(ParseError::Network { .. })));
        assert!(matches!(parse("v=spf1 ip6:192.0.2.1"), Err(ParseError::Network { .. })));
        assert!(matches!(parse("v=spf1 ip4"), Err(ParseError::MissingArgument("ip4"))));
        assert!(matches!(parse("v=spf1 include"), Err(ParseError::MissingArgument("include"))));
        assert!(matches!(parse("v=spf1 include:"), Err(ParseError::MissingArgument("include"))));
        assert!(matches!(parse("v=spf1 all:foo"), Err(ParseError::UnexpectedArgument("all"))));
        assert!(matches!(parse("v=spf1 foo"), Err(ParseError::UnknownTerm(_))));
        assert!(matches!(parse("v=spf1 -foo:bar"), Err(ParseError::UnknownTerm(_))));
        assert!(matches!(parse("v=spf1 a:/24"), Err(ParseError::UnknownTerm(_))));
        assert!(matches!(parse("v=spf1 include=foo"), Err(ParseError::UnknownTerm(_))));
        assert!(matches!(parse("v=spf1 exists:%{x}"), Err(ParseError::Macro { .. })));
        assert!(matches!(parse("v=spf1 a:foo%bar"), Err(ParseError::Macro { .. })));
        assert!(matches!(parse("v=spf1 redirect=%{d"), Err(ParseError::Macro { .. })));
        assert!(matches!(parse("spf2.0/pra -all"), Err(ParseError::NotSpf)));
    }

    #[test]
    fn test_duplicate_modifiers() {
        assert_eq!(
            parse("v=spf1 redirect=a.example redirect=b.example"),
            Err(ParseError::DuplicateModifier("redirect"))
        );
        assert_eq!(
            parse("v=spf1 exp=a.example exp=b.example"),
            Err(ParseError::DuplicateModifier("exp"))
        );
    }

    #[test]
    fn test_bare_version() {
        let record = parse("v=spf1").unwrap();
        assert!(record.mechanisms.is_empty());
        assert!(record.modifiers.is_empty());
        assert_eq!(record.text, "v=spf1");
    }
}
