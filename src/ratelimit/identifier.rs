//! Client identifier derivation.
//!
//! An identifier is the apparent client address joined with a short
//! fingerprint of the declared user agent, so that different browsers behind
//! one NAT are throttled independently.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Placeholder used for any missing piece of request metadata.
pub const UNKNOWN: &str = "unknown";

/// Separator between the address and the agent fingerprint.
pub const DELIMITER: char = '|';

/// Length of the agent fingerprint in characters.
pub const FINGERPRINT_LEN: usize = 10;

/// Origin metadata of an inbound request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMeta {
    /// Forwarded address chain, client first
    pub forwarded_for: Vec<String>,
    /// Address of the directly connected peer
    pub peer_addr: Option<String>,
    /// Declared user agent
    pub user_agent: Option<String>,
}

impl RequestMeta {
    /// Metadata with only a direct peer address.
    pub fn from_peer(peer: impl Into<String>) -> Self {
        Self {
            peer_addr: Some(peer.into()),
            ..Self::default()
        }
    }

    /// Set the user agent.
    pub fn with_user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    /// Parse and set a comma-separated forwarded address list.
    pub fn with_forwarded_for(mut self, header: &str) -> Self {
        self.forwarded_for = parse_forwarded_list(header);
        self
    }

    /// The address the request appears to originate from.
    fn origin(&self) -> &str {
        self.forwarded_for
            .iter()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
            .or_else(|| non_blank(self.peer_addr.as_deref()))
            .unwrap_or(UNKNOWN)
    }
}

/// A stable throttling key for one client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier(String);

impl Identifier {
    /// Derive the identifier for a request. Never fails.
    pub fn derive(meta: &RequestMeta) -> Self {
        let agent = non_blank(meta.user_agent.as_deref()).unwrap_or(UNKNOWN);
        Self(format!("{}{}{}", meta.origin(), DELIMITER, fingerprint(agent)))
    }

    /// Namespace the identifier under a route class.
    pub fn scoped(&self, scope: &str) -> String {
        format!("{}/{}", scope, self.0)
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Short, fixed-length fingerprint of a user agent string.
///
/// Not a security boundary: collisions only merge two clients' budgets.
pub fn fingerprint(agent: &str) -> String {
    let digest = Sha256::digest(agent.as_bytes());
    let mut encoded = URL_SAFE_NO_PAD.encode(digest);
    encoded.truncate(FINGERPRINT_LEN);
    encoded
}

/// Split a forwarded-for header into its non-empty, trimmed entries.
pub fn parse_forwarded_list(header: &str) -> Vec<String> {
    header
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}
