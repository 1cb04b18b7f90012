//! Ordered positive/negative domain matcher (spec §3 "Domain matcher").
//!
//! Used identically by `deny_domains`, `direct_domains` and the MITM-domain
//! inclusion list: a list of regex entries, each either a positive match or
//! a negative (excluding) one, evaluated in order. First match wins; if
//! only negative entries match, that is treated as no match at all.

use regex::Regex;
use serde::Deserialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Polarity {
    Positive,
    Negative,
}

struct Entry {
    regex: Regex,
    polarity: Polarity,
}

/// An ordered list of domain-matching rules.
///
/// Construct from the textual form used in config: a `-` prefix marks a
/// negative (excluding) entry, e.g. `["httpbin", "google", "-httpbin"]`.
/// Under first-match-wins, a later negative entry only ever excludes hosts
/// that no earlier entry already matched — so in that example `httpbin`
/// still matches the first (positive) entry, and the trailing `-httpbin`
/// is unreachable for it. Ordering the exclusion first,
/// `["-httpbin", "httpbin", "google"]`, is what actually excludes it.
pub struct DomainMatcher {
    entries: Vec<Entry>,
}

impl DomainMatcher {
    pub fn empty() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn compile(patterns: &[String]) -> Result<Self, regex::Error> {
        let entries = patterns
            .iter()
            .map(|raw| {
                let (polarity, pattern) = match raw.strip_prefix('-') {
                    Some(rest) => (Polarity::Negative, rest),
                    None => (Polarity::Positive, raw.as_str()),
                };
                Regex::new(pattern).map(|regex| Entry { regex, polarity })
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { entries })
    }

    /// Returns `true` if `host` matches this domain list under the
    /// first-match-wins, negative-only-is-no-match rule.
    pub fn matches(&self, host: &str) -> bool {
        for entry in &self.entries {
            if entry.regex.is_match(host) {
                return entry.polarity == Polarity::Positive;
            }
        }
        false
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for DomainMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainMatcher")
            .field("len", &self.entries.len())
            .finish()
    }
}

impl Default for DomainMatcher {
    fn default() -> Self {
        Self::empty()
    }
}
/// Raw, serde-friendly form of a [`DomainMatcher`] as it appears in config.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct DomainMatcherConfig(pub Vec<String>);

impl DomainMatcherConfig {
    pub fn compile(&self) -> Result<DomainMatcher, regex::Error> {
        DomainMatcher::compile(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_match_wins_in_order() {
        let m = DomainMatcher::compile(&[
            r"httpbin".to_owned(),
            r"google".to_owned(),
            r"-httpbin".to_owned(),
        ])
        .unwrap();
        // "httpbin" matches the first (positive) entry before the later
        // negative one is ever consulted.
        assert!(m.matches("httpbin"));
        assert!(m.matches("google.com"));
        assert!(!m.matches("example.org"));
    }

    #[test]
    fn negative_only_match_is_no_match() {
        let m = DomainMatcher::compile(&[r"-\.internal$".to_owned()]).unwrap();
        assert!(!m.matches("svc.internal"));
    }

    #[test]
    fn deny_domains_precedence_scenario() {
        // spec §8 scenario 5
        let m = DomainMatcher::compile(&[r"\.com$".to_owned()]).unwrap();
        assert!(m.matches("example.com"));
        assert!(!m.matches("example.org"));
    }
}
