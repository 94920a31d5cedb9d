//! Mailgate Core - SPF policy evaluation for the SMTP hook chain
//!
//! This crate provides the RFC 4408 `check_host()` evaluator and the hook
//! that runs it at the HELO and MAIL FROM stages.

pub mod hooks;
pub mod spf;

pub use hooks::{received_spf_header, SpfHook};
pub use spf::{DnsResolver, SpfError, SpfEvaluator, SpfOutcome, SpfResult, TrustDnsResolver};
