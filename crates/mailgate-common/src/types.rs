//! Common types for Mailgate

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Unique identifier for plugins
pub type PluginId = String;

/// Email address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress {
    pub local: String,
    pub domain: String,
}

impl EmailAddress {
    /// Create a new email address
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            domain: domain.into(),
        }
    }

    /// Parse an email address from a string
    ///
    /// Surrounding angle brackets are stripped. The domain is everything after
    /// the last `@`, so quoted local parts containing `@` survive.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().trim_start_matches('<').trim_end_matches('>');
        let (local, domain) = s.rsplit_once('@')?;
        if local.is_empty() || domain.is_empty() {
            return None;
        }
        Some(Self::new(local, domain))
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

impl std::str::FromStr for EmailAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| crate::Error::Validation("Invalid email address".to_string()))
    }
}

/// What is known about an SMTP client when a hook runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Client IP address, as seen on the socket
    pub client_ip: IpAddr,

    /// HELO/EHLO argument
    pub helo: Option<String>,
}

impl ConnectionInfo {
    /// Create connection info for a client
    pub fn new(client_ip: IpAddr) -> Self {
        Self {
            client_ip,
            helo: None,
        }
    }

    /// Set the HELO/EHLO argument
    pub fn with_helo(mut self, helo: Option<String>) -> Self {
        self.helo = helo;
        self
    }

    /// The HELO argument if it names a domain rather than an address literal
    pub fn helo_domain(&self) -> Option<&str> {
        let helo = self.helo.as_deref()?.trim();
        if helo.is_empty() || helo.starts_with('[') || helo.parse::<IpAddr>().is_ok() {
            return None;
        }
        Some(helo)
    }
}

/// Hook types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookType {
    Helo,
    MailFrom,
}

impl std::fmt::Display for HookType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HookType::Helo => write!(f, "helo"),
            HookType::MailFrom => write!(f, "mail_from"),
        }
    }
}

/// Hook action results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookAction {
    Allow,
    Reject,
    Tempfail,
    Tag,
}

/// Hook execution result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookResult {
    pub plugin_id: PluginId,
    pub hook_type: HookType,
    pub action: HookAction,
    #[serde(default)]
    pub tags: Vec<String>,
    pub smtp_code: Option<u16>,
    pub smtp_message: Option<String>,
    /// Trace headers the caller should prepend to the message
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

impl HookResult {
    /// A result that lets the transaction continue untouched
    pub fn allow(plugin_id: impl Into<PluginId>, hook_type: HookType) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            hook_type,
            action: HookAction::Allow,
            tags: Vec::new(),
            smtp_code: None,
            smtp_message: None,
            headers: Vec::new(),
        }
    }
}
