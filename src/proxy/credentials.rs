//! Credential matcher (spec §4.6, §3 "Credentials entry").
//!
//! Immutable after construction; longest-prefix match on `host:port` with
//! glob wildcards on either side, first-registered-wins on ties (spec §9
//! resolves the "mixed wildcard credentials tie" open question this way).
//! Host matching uses the `wildcard` crate, the same glob matcher the
//! teacher's own `UriMatcher::wildcard` uses for request matching, so a
//! host pattern is not limited to the bare `"*"` literal — `"*.example.com"`
//! matches any subdomain the same way it would in a `UriMatcher`.

use rama::net::user::Basic;
use serde::Deserialize;
use std::fmt;
use wildcard::Wildcard;

/// One configured `{host, port, username, password}` entry. `host`/`port`
/// may be the literal wildcard string `"*"`.
#[derive(Clone, Deserialize)]
pub struct CredentialEntry {
    pub host: String,
    pub port: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for CredentialEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialEntry")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl CredentialEntry {
    /// A pattern containing glob metacharacters is less specific than a
    /// literal one, regardless of whether it happens to be the bare `"*"`.
    fn is_glob_host(&self) -> bool {
        self.host.contains(['*', '?'])
    }

    fn specificity(&self) -> u8 {
        match (self.is_glob_host(), self.port == "*") {
            (false, false) => 3, // exact host + exact port
            (false, true) => 2,  // exact host + wildcard port
            (true, false) => 1,  // glob host + exact port
            (true, true) => 0,   // glob host + wildcard port
        }
    }

    fn matches(&self, host: &str, port: u16) -> bool {
        let host_matches = match Wildcard::new(self.host.to_ascii_lowercase().as_bytes()) {
            Ok(pattern) => pattern.is_match(host.to_ascii_lowercase().as_bytes()),
            Err(_) => self.host.eq_ignore_ascii_case(host),
        };
        host_matches && (self.port == "*" || self.port.parse::<u16>().ok() == Some(port))
    }

    fn to_basic(&self) -> Basic {
        Basic::new(self.username.clone(), self.password.clone())
    }
}

/// Read-only table mapping `host:port` patterns to basic-auth credentials.
#[derive(Debug, Default)]
pub struct CredentialMatcher {
    entries: Vec<CredentialEntry>,
}

impl CredentialMatcher {
    pub fn new(entries: Vec<CredentialEntry>) -> Self {
        Self { entries }
    }

    /// Returns at most one credential for `host:port`, per the longest-prefix
    /// rule: exact host+port beats exact host+wildcard port beats wildcard
    /// host+exact port beats double wildcard; ties keep the first
    /// registered entry (stable sort over insertion order).
    pub fn lookup(&self, host: &str, port: u16) -> Option<Basic> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.matches(host, port))
            .max_by_key(|(idx, e)| (e.specificity(), std::cmp::Reverse(*idx)))
            .map(|(_, e)| e.to_basic())
    }
}
