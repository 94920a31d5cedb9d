//! SPF (Sender Policy Framework) evaluation
//!
//! Implements `check_host()` from RFC 4408: fetch the sender domain's policy
//! record, parse it, and evaluate its mechanisms and modifiers against the
//! client address until one produces a result.

pub mod check;
pub mod cidr;
pub mod dns;
pub mod macros;
pub mod mechanisms;
pub mod modifiers;
pub mod parser;
pub mod record;
pub mod result;

pub use check::{EvaluationContext, SpfEvaluator, SpfOutcome, LIMIT};
pub use dns::{DnsError, DnsResolver, TrustDnsResolver};
pub use parser::{Mechanism, MechanismKind, Modifier, PolicyRecord};
pub use result::{Qualifier, SpfResult};

use thiserror::Error;

/// Invalid arguments to [`SpfEvaluator::check_host`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpfError {
    #[error("invalid client IP address: {0:?}")]
    InvalidIp(String),

    #[error("invalid domain: {0:?}")]
    InvalidDomain(String),
}

impl From<SpfError> for mailgate_common::Error {
    fn from(e: SpfError) -> Self {
        mailgate_common::Error::Validation(e.to_string())
    }
}
