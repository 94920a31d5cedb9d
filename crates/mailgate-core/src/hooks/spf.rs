//! SPF hook for the HELO and MAIL FROM stages

use crate::spf::{DnsResolver, SpfEvaluator, SpfOutcome, SpfResult};
use mailgate_common::config::SpfConfig;
use mailgate_common::types::{ConnectionInfo, EmailAddress, HookAction, HookResult, HookType};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Plugin id reported in hook results
pub const PLUGIN_ID: &str = "spf";

/// Name of the trace header this hook adds
pub const RECEIVED_SPF: &str = "Received-SPF";

/// Runs SPF checks for an SMTP session and turns results into hook actions
pub struct SpfHook {
    config: SpfConfig,
    resolver: Arc<dyn DnsResolver>,
    /// Our host name, for trace headers
    receiver: String,
}

impl SpfHook {
    pub fn new(config: SpfConfig, resolver: Arc<dyn DnsResolver>, receiver: impl Into<String>) -> Self {
        Self {
            config,
            resolver,
            receiver: receiver.into(),
        }
    }

    /// Check the HELO identity
    ///
    /// Address literals and missing HELO names are not checked.
    pub async fn check_helo(&self, conn: &ConnectionInfo) -> HookResult {
        if !self.config.enabled || !self.config.check_helo {
            return HookResult::allow(PLUGIN_ID, HookType::Helo);
        }
        let Some(helo) = conn.helo_domain() else {
            debug!("No HELO domain to check for {}", conn.client_ip);
            return HookResult::allow(PLUGIN_ID, HookType::Helo);
        };

        let sender = format!("postmaster@{}", helo);
        self.run(HookType::Helo, conn, helo, &sender, "helo").await
    }

    /// Check the MAIL FROM identity
    ///
    /// A null reverse-path is checked against the HELO domain instead.
    pub async fn check_mail_from(&self, conn: &ConnectionInfo, sender: &str) -> HookResult {
        if !self.config.enabled {
            return HookResult::allow(PLUGIN_ID, HookType::MailFrom);
        }

        match EmailAddress::parse(sender) {
            Some(address) => {
                let sender = address.to_string();
                self.run(HookType::MailFrom, conn, &address.domain, &sender, "mailfrom")
                    .await
            }
            None => match conn.helo_domain() {
                Some(helo) => {
                    let sender = format!("postmaster@{}", helo);
                    self.run(HookType::MailFrom, conn, helo, &sender, "helo").await
                }
                None => {
                    debug!("Null sender and no HELO domain from {}", conn.client_ip);
                    HookResult::allow(PLUGIN_ID, HookType::MailFrom)
                }
            },
        }
    }

    async fn run(
        &self,
        hook_type: HookType,
        conn: &ConnectionInfo,
        domain: &str,
        sender: &str,
        identity: &str,
    ) -> HookResult {
        let mut evaluator = SpfEvaluator::new(self.resolver.clone());
        if let Some(helo) = conn.helo.as_deref() {
            evaluator = evaluator.with_helo(helo);
        }

        let deadline = Duration::from_millis(self.config.timeout_ms);
        let check = evaluator.check_addr(conn.client_ip, domain, Some(sender));
        let outcome = match tokio::time::timeout(deadline, check).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!("SPF check of {} skipped: {}", domain, e);
                return HookResult::allow(PLUGIN_ID, hook_type);
            }
            Err(_) => {
                warn!("SPF check of {} timed out after {}ms", domain, self.config.timeout_ms);
                return HookResult::allow(PLUGIN_ID, hook_type);
            }
        };

        info!("SPF {} result for {}: {}", hook_type, domain, outcome.result);

        let mut result = self.decide(hook_type, outcome.result);
        if self.config.add_header && matches!(result.action, HookAction::Allow | HookAction::Tag) {
            let header = received_spf_header(&outcome, conn, &self.receiver, identity);
            result.headers.push((RECEIVED_SPF.to_string(), header));
        }
        result
    }

    /// Map a result to a hook action according to the configured policy
    pub fn decide(&self, hook_type: HookType, spf: SpfResult) -> HookResult {
        let mut result = HookResult::allow(PLUGIN_ID, hook_type);
        result.tags.push(format!("spf:{}", spf.as_header_value()));

        let reject = |result: &mut HookResult, code: u16, message: &str| {
            result.action = HookAction::Reject;
            result.smtp_code = Some(code);
            result.smtp_message = Some(message.to_string());
        };

        match spf {
            SpfResult::Fail if self.config.reject_fail => {
                reject(&mut result, 550, "5.7.23 SPF validation failed");
            }
            SpfResult::SoftFail if self.config.reject_softfail => {
                reject(&mut result, 550, "5.7.23 SPF validation failed");
            }
            SpfResult::PermError if self.config.reject_permerror => {
                reject(&mut result, 550, "5.5.2 SPF record of sender domain is invalid");
            }
            SpfResult::TempError if self.config.defer_temperror => {
                result.action = HookAction::Tempfail;
                result.smtp_code = Some(451);
                result.smtp_message = Some("4.4.3 Temporary error checking SPF, try again later".to_string());
            }
            SpfResult::Fail | SpfResult::SoftFail | SpfResult::PermError | SpfResult::TempError => {
                result.action = HookAction::Tag;
            }
            SpfResult::Pass | SpfResult::Neutral | SpfResult::None => {}
        }

        result
    }
}

/// Compose a `Received-SPF` header value (RFC 4408 §7)
pub fn received_spf_header(outcome: &SpfOutcome, conn: &ConnectionInfo, receiver: &str, identity: &str) -> String {
    let ip = conn.client_ip;
    let sender = &outcome.sender;
    let comment = match outcome.result {
        SpfResult::Pass => format!("domain of {} designates {} as permitted sender", sender, ip),
        SpfResult::Fail => format!("domain of {} does not designate {} as permitted sender", sender, ip),
        SpfResult::SoftFail => format!(
            "transitioning domain of {} does not designate {} as permitted sender",
            sender, ip
        ),
        SpfResult::Neutral => format!("{} is neither permitted nor denied by domain of {}", ip, sender),
        SpfResult::None => format!("domain of {} does not publish an SPF record", outcome.domain),
        SpfResult::TempError => format!("error in processing during lookup of {}", outcome.domain),
        SpfResult::PermError => format!("domain of {} has an invalid SPF record", outcome.domain),
    };

    let mut header = format!(
        "{} ({}: {}) client-ip={}; envelope-from=\"{}\";",
        outcome.result.as_header_value(),
        receiver,
        comment,
        ip,
        sender
    );
    if let Some(helo) = conn.helo.as_deref() {
        header.push_str(&format!(" helo={};", helo));
    }
    header.push_str(&format!(" receiver={}; identity={}", receiver, identity));
    header
}
