//! Upstream resolver and decision engine (spec §4.4, §3 "Upstream Decision").

use super::domain::DomainMatcher;
use super::error::ProxyError;
use super::pac::{PacCandidate, PacResolver};
use rama::net::address::{Authority, Host};
use rama::net::user::Basic;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalhostPolicy {
    #[default]
    Deny,
    Allow,
    Direct,
}

/// The sum type described in spec §3: what to do with a given request.
#[derive(Debug, Clone)]
pub enum UpstreamDecision {
    Direct,
    Proxy {
        authority: Authority,
        credential: Option<Basic>,
    },
    Deny,
    Block,
}

/// Immutable, shared configuration the resolver consults in the order
/// defined by spec §4.4.
#[derive(Debug, Default)]
pub struct UpstreamResolverConfig {
    pub localhost_policy: LocalhostPolicy,
    pub deny_domains: DomainMatcher,
    pub direct_domains: DomainMatcher,
    pub fixed_upstream: Option<Authority>,
    pub fixed_upstream_credential: Option<Basic>,
}

pub struct UpstreamResolver {
    config: UpstreamResolverConfig,
    pac: Option<Arc<dyn PacResolver>>,
}

impl UpstreamResolver {
    pub fn new(config: UpstreamResolverConfig, pac: Option<Arc<dyn PacResolver>>) -> Self {
        Self { config, pac }
    }

    /// Resolve the [`UpstreamDecision`] for `host:port` (spec §4.4). The
    /// decision is computed exactly once per request and is never
    /// re-evaluated on retry (spec §3 invariants) — callers must cache the
    /// return value for the lifetime of the request.
    pub fn resolve(&self, host: &Host, port: u16, url: &str) -> Result<UpstreamDecision, ProxyError> {
        let host_str = host.to_string();

        if is_localhost(host) {
            match self.config.localhost_policy {
                LocalhostPolicy::Deny => return Ok(UpstreamDecision::Deny),
                LocalhostPolicy::Allow => {
                    // fall through to the remaining rules as if not localhost
                }
                LocalhostPolicy::Direct => return Ok(UpstreamDecision::Direct),
            }
        }

        if self.config.deny_domains.matches(&host_str) {
            return Ok(UpstreamDecision::Deny);
        }

        if self.config.direct_domains.matches(&host_str) {
            return Ok(UpstreamDecision::Direct);
        }

        if let Some(pac) = &self.pac {
            let candidates = pac
                .find_proxy_for_url(url, &host_str)
                .map_err(|err| ProxyError::internal(format!("PAC resolution failed: {err}")))?;
            return Ok(decision_from_candidates(&candidates));
        }

        if let Some(authority) = &self.config.fixed_upstream {
            return Ok(UpstreamDecision::Proxy {
                authority: authority.clone(),
                credential: self.config.fixed_upstream_credential.clone(),
            });
        }

        Ok(UpstreamDecision::Direct)
    }

    /// The full ordered candidate list for PAC-selected upstreams, so the
    /// HTTP client core can fall back to the next candidate on a dial
    /// failure of the primary (spec §4.4 step 4, §4.8).
    pub fn pac_fallbacks(&self, url: &str, host: &Host) -> Vec<PacCandidate> {
        let Some(pac) = &self.pac else {
            return Vec::new();
        };
        pac.find_proxy_for_url(url, &host.to_string())
            .unwrap_or_default()
    }
}

fn decision_from_candidates(candidates: &[PacCandidate]) -> UpstreamDecision {
    match candidates.first() {
        None | Some(PacCandidate::Direct) => UpstreamDecision::Direct,
        Some(PacCandidate::Proxy { host, port } | PacCandidate::Socks { host, port }) => {
            match Authority::try_from(format!("{host}:{port}")) {
                Ok(authority) => UpstreamDecision::Proxy {
                    authority,
                    credential: None,
                },
                Err(_) => UpstreamDecision::Block,
            }
        }
    }
}

fn is_localhost(host: &Host) -> bool {
    match host {
        Host::Name(domain) => domain.as_str().eq_ignore_ascii_case("localhost"),
        Host::Address(ip) => ip.is_loopback(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::pac::StaticPacResolver;

    fn host(s: &str) -> Host {
        s.parse().unwrap()
    }

    #[test]
    fn localhost_deny_by_default() {
        let resolver = UpstreamResolver::new(UpstreamResolverConfig::default(), None);
        let decision = resolver
            .resolve(&host("localhost"), 10000, "http://localhost:10000/version")
            .unwrap();
        assert!(matches!(decision, UpstreamDecision::Deny));
    }

    #[test]
    fn localhost_allow_falls_through() {
        let config = UpstreamResolverConfig {
            localhost_policy: LocalhostPolicy::Allow,
            ..Default::default()
        };
        let resolver = UpstreamResolver::new(config, None);
        let decision = resolver
            .resolve(&host("127.0.0.1"), 10000, "http://127.0.0.1:10000/version")
            .unwrap();
        assert!(matches!(decision, UpstreamDecision::Direct));
    }

    #[test]
    fn deny_domains_take_precedence_over_direct() {
        let config = UpstreamResolverConfig {
            deny_domains: DomainMatcher::compile(&[r"\.com$".to_owned()]).unwrap(),
            direct_domains: DomainMatcher::compile(&[r".*".to_owned()]).unwrap(),
            ..Default::default()
        };
        let resolver = UpstreamResolver::new(config, None);
        assert!(matches!(
            resolver
                .resolve(&host("example.com"), 443, "https://example.com")
                .unwrap(),
            UpstreamDecision::Deny
        ));
        assert!(matches!(
            resolver
                .resolve(&host("example.org"), 443, "https://example.org")
                .unwrap(),
            UpstreamDecision::Direct
        ));
    }

    #[test]
    fn pac_first_candidate_wins() {
        let pac = Arc::new(
            StaticPacResolver::from_script_result("PROXY up1:3128; DIRECT").unwrap(),
        );
        let resolver = UpstreamResolver::new(UpstreamResolverConfig::default(), Some(pac));
        let decision = resolver
            .resolve(&host("origin"), 80, "http://origin/")
            .unwrap();
        match decision {
            UpstreamDecision::Proxy { authority, .. } => {
                assert_eq!(authority.host().to_string(), "up1");
                assert_eq!(authority.port(), 3128);
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn no_config_defaults_to_direct() {
        let resolver = UpstreamResolver::new(UpstreamResolverConfig::default(), None);
        let decision = resolver
            .resolve(&host("origin"), 80, "http://origin/")
            .unwrap();
        assert!(matches!(decision, UpstreamDecision::Direct));
    }
}
