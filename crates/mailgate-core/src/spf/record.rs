//! Fetching a domain's SPF record

use super::dns::{DnsError, DnsResolver};
use super::result::SpfResult;
use tracing::{debug, warn};

/// Whether a TXT string is an SPF version 1 record
pub fn is_spf_record(txt: &str) -> bool {
    let txt = txt.trim_start();
    match txt.get(..6) {
        Some(version) if version.eq_ignore_ascii_case("v=spf1") => {
            txt[6..].is_empty() || txt[6..].starts_with(|c: char| c.is_ascii_whitespace())
        }
        _ => false,
    }
}

/// Lowercase and collapse runs of whitespace to single spaces
pub fn normalize_record(txt: &str) -> String {
    txt.split_ascii_whitespace()
        .map(str::to_ascii_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Look up the unique SPF record of `domain`
///
/// Any outcome other than exactly one record is returned as the result it
/// implies: no record or no such domain is `None`, several records are
/// `PermError`, and a failed lookup is `TempError`.
pub async fn fetch_record(resolver: &dyn DnsResolver, domain: &str) -> Result<String, SpfResult> {
    let answers = match resolver.txt(domain).await {
        Ok(answers) => answers,
        Err(DnsError::NotFound) => {
            debug!("No TXT records for {}", domain);
            return Err(SpfResult::None);
        }
        Err(DnsError::Failure(e)) => {
            warn!("TXT lookup failed for {}: {}", domain, e);
            return Err(SpfResult::TempError);
        }
    };

    let mut records = answers.iter().filter(|txt| is_spf_record(txt));
    match (records.next(), records.next()) {
        (None, _) => {
            debug!("No SPF record for {}", domain);
            Err(SpfResult::None)
        }
        (Some(record), None) => {
            debug!("Found SPF record for {}: {}", domain, record);
            Ok(normalize_record(record))
        }
        (Some(_), Some(_)) => {
            warn!("Multiple SPF records for {}", domain);
            Err(SpfResult::PermError)
        }
    }
}
