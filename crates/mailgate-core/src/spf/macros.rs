//! Macro expansion for domain-specs (RFC 4408 §8)
//!
//! A domain-spec is literal text interleaved with `%{...}` expansions and the
//! escapes `%%`, `%_` and `%-`. Expansion needs only the evaluation context,
//! never DNS.

use std::net::IpAddr;
use thiserror::Error;

/// Longest domain name we hand to the resolver
pub const MAX_DOMAIN_LEN: usize = 253;

const DELIMITERS: &str = ".-+,/_=";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MacroError {
    #[error("'%' not followed by '{{', '%', '_' or '-'")]
    IsolatedPercent,

    #[error("unterminated macro expansion")]
    Unterminated,

    #[error("empty macro expansion")]
    Empty,

    #[error("unknown macro letter '{0}'")]
    UnknownLetter(char),

    #[error("invalid label count in macro")]
    InvalidCount,

    #[error("invalid macro transformer '{0}'")]
    InvalidTransformer(char),
}

/// Values the macro letters are bound to
#[derive(Debug, Clone, Copy)]
pub struct MacroContext<'a> {
    /// `s`: the full sender, `local@domain`
    pub sender: &'a str,
    /// `l`
    pub local_part: &'a str,
    /// `o`
    pub sender_domain: &'a str,
    /// `d`: the domain currently being evaluated
    pub domain: &'a str,
    /// `i` and `v`
    pub ip: IpAddr,
    /// `h`
    pub helo: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Letter {
    Sender,
    LocalPart,
    SenderDomain,
    Domain,
    Ip,
    Ptr,
    Version,
    Helo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Expansion<'s> {
    letter: Letter,
    keep: Option<usize>,
    reverse: bool,
    delimiters: &'s str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'s> {
    Literal(&'s str),
    Expand(Expansion<'s>),
}

/// Iterator over the tokens of a macro string
struct Tokens<'s> {
    rest: &'s str,
}

impl<'s> Iterator for Tokens<'s> {
    type Item = Result<Token<'s>, MacroError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }

        let Some(percent) = self.rest.find('%') else {
            return Some(Ok(Token::Literal(std::mem::take(&mut self.rest))));
        };
        if percent > 0 {
            let (literal, rest) = self.rest.split_at(percent);
            self.rest = rest;
            return Some(Ok(Token::Literal(literal)));
        }

        let after = &self.rest[1..];
        let token = match after.chars().next() {
            Some('%') => Ok(Token::Literal("%")),
            Some('_') => Ok(Token::Literal(" ")),
            Some('-') => Ok(Token::Literal("%20")),
            Some('{') => {
                let Some((body, rest)) = after[1..].split_once('}') else {
                    self.rest = "";
                    return Some(Err(MacroError::Unterminated));
                };
                self.rest = rest;
                return Some(parse_expansion(body).map(Token::Expand));
            }
            _ => Err(MacroError::IsolatedPercent),
        };

        match token {
            Ok(_) => self.rest = &after[1..],
            Err(_) => self.rest = "",
        }
        Some(token)
    }
}

fn tokens(spec: &str) -> Tokens<'_> {
    Tokens { rest: spec }
}

/// Parse the inside of `%{...}`: letter, optional count, optional `r`,
/// optional delimiters
fn parse_expansion(body: &str) -> Result<Expansion<'_>, MacroError> {
    let mut chars = body.chars();
    let letter = match chars.next().map(|c| c.to_ascii_lowercase()) {
        None => return Err(MacroError::Empty),
        Some('s') => Letter::Sender,
        Some('l') => Letter::LocalPart,
        Some('o') => Letter::SenderDomain,
        Some('d') => Letter::Domain,
        Some('i') => Letter::Ip,
        Some('p') => Letter::Ptr,
        Some('v') => Letter::Version,
        Some('h') => Letter::Helo,
        Some(c) => return Err(MacroError::UnknownLetter(c)),
    };

    let mut rest = chars.as_str();
    let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    let keep = if digits > 0 {
        let count = rest[..digits]
            .parse::<usize>()
            .map_err(|_| MacroError::InvalidCount)?;
        if count == 0 {
            return Err(MacroError::InvalidCount);
        }
        rest = &rest[digits..];
        Some(count)
    } else {
        None
    };

    let reverse = match rest.strip_prefix(&['r', 'R'][..]) {
        Some(after) => {
            rest = after;
            true
        }
        None => false,
    };

    if let Some(bad) = rest.chars().find(|c| !DELIMITERS.contains(*c)) {
        return Err(MacroError::InvalidTransformer(bad));
    }

    Ok(Expansion {
        letter,
        keep,
        reverse,
        delimiters: rest,
    })
}

/// Check that every `%` in `spec` starts a well-formed macro or escape
pub fn validate(spec: &str) -> Result<(), MacroError> {
    tokens(spec).try_for_each(|token| token.map(|_| ()))
}

/// Expand every macro and escape in `spec`
pub fn expand(spec: &str, ctx: &MacroContext<'_>) -> Result<String, MacroError> {
    let mut out = String::with_capacity(spec.len());
    for token in tokens(spec) {
        match token? {
            Token::Literal(text) => out.push_str(text),
            Token::Expand(expansion) => {
                let value = value_of(expansion.letter, ctx);
                out.push_str(&transform(&value, &expansion));
            }
        }
    }
    Ok(out)
}

/// Expand a domain-spec and shorten the result to a usable domain name
pub fn expand_domain(spec: &str, ctx: &MacroContext<'_>) -> Result<String, MacroError> {
    expand(spec, ctx).map(|domain| truncate_domain(&domain).to_string())
}

/// Drop leftmost labels until the name fits in [`MAX_DOMAIN_LEN`] octets
pub fn truncate_domain(domain: &str) -> &str {
    let mut domain = domain.trim_end_matches('.');
    while domain.len() > MAX_DOMAIN_LEN {
        match domain.split_once('.') {
            Some((_, rest)) => domain = rest,
            None => break,
        }
    }
    domain
}

fn value_of(letter: Letter, ctx: &MacroContext<'_>) -> String {
    match letter {
        Letter::Sender => ctx.sender.to_string(),
        Letter::LocalPart => ctx.local_part.to_string(),
        Letter::SenderDomain => ctx.sender_domain.to_string(),
        Letter::Domain => ctx.domain.to_string(),
        Letter::Ip => match ctx.ip {
            IpAddr::V4(ip) => ip.to_string(),
            IpAddr::V6(ip) => dotted_nibbles(&ip.octets()),
        },
        // Validated PTR names are not looked up for macros
        Letter::Ptr => "unknown".to_string(),
        Letter::Version => match ctx.ip {
            IpAddr::V4(_) => "in-addr".to_string(),
            IpAddr::V6(_) => "ip6".to_string(),
        },
        Letter::Helo => ctx.helo.to_string(),
    }
}

fn dotted_nibbles(octets: &[u8; 16]) -> String {
    octets
        .iter()
        .flat_map(|b| [b >> 4, b & 0xf])
        .map(|nibble| format!("{:x}", nibble))
        .collect::<Vec<_>>()
        .join(".")
}

/// Split on the delimiters, keep the rightmost labels, optionally reverse,
/// rejoin with '.'
fn transform(value: &str, expansion: &Expansion<'_>) -> String {
    if expansion.keep.is_none() && !expansion.reverse && expansion.delimiters.is_empty() {
        return value.to_string();
    }

    let delimiters = if expansion.delimiters.is_empty() {
        "."
    } else {
        expansion.delimiters
    };
    let mut labels: Vec<&str> = value.split(|c: char| delimiters.contains(c)).collect();
    if let Some(keep) = expansion.keep {
        if keep < labels.len() {
            labels.drain(..labels.len() - keep);
        }
    }
    if expansion.reverse {
        labels.reverse();
    }
    labels.join(".")
}
