//! Effective configuration (ambient stack: Configuration, SPEC_FULL.md).
//!
//! One typed, `serde`-deserializable `ProxyConfig` aggregates every
//! sub-config in `src/proxy/*`, loaded from a config file and overlaid with
//! a thin `clap` CLI surface the way the teacher's `CliCommandProxy`
//! (`src/cmd/serve/proxy/mod.rs`) overlays its own small set of flags —
//! generalized here to a full file-backed config since this crate's surface
//! is far larger than the teacher subcommand's four flags.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

use crate::proxy::client::ClientConfig;
use crate::proxy::credentials::CredentialEntry;
use crate::proxy::dns::DnsOverrideConfig;
use crate::proxy::domain::DomainMatcherConfig;
use crate::proxy::haproxy::ProxyProtocolMode;
use crate::proxy::modifiers::ModifierPipeline;
use crate::proxy::supervisor::SupervisorConfig;
use crate::proxy::upstream::LocalhostPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    pub bind: SocketAddr,
    #[serde(default)]
    pub proxy_protocol: ProxyProtocolMode,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundAuthConfig {
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub localhost_policy: LocalhostPolicy,
    #[serde(default)]
    pub deny_domains: DomainMatcherConfig,
    #[serde(default)]
    pub direct_domains: DomainMatcherConfig,
    pub fixed_upstream: Option<String>,
    pub fixed_upstream_username: Option<String>,
    pub fixed_upstream_password: Option<String>,
    pub pac_script_path: Option<String>,
    pub pac_script_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MitmConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub domains: DomainMatcherConfig,
    pub ca_cert_path: Option<String>,
    pub ca_key_path: Option<String>,
    #[serde(default = "default_ca_validity_hours")]
    pub ca_validity_hours: u64,
}

fn default_ca_validity_hours() -> u64 {
    24
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdminConfig {
    pub bind: Option<SocketAddr>,
}

fn default_via_name() -> String {
    "ramafwd".to_owned()
}

/// The full effective configuration, aggregated from a config file (TOML
/// or JSON, per serde's format-agnostic `Deserialize`) and the CLI.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    pub listen: ListenConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub inbound_auth: InboundAuthConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub credentials: Vec<CredentialEntry>,
    #[serde(default)]
    pub modifiers: ModifierPipeline,
    #[serde(default)]
    pub mitm: MitmConfig,
    #[serde(default)]
    pub dns: DnsOverrideConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// The `<name>` in the `Via: 1.1 <name>-<random>` header appended to
    /// every forwarded request and response (spec §6).
    #[serde(default = "default_via_name")]
    pub via_name: String,
}

impl ProxyConfig {
    pub fn from_file(path: &Path) -> Result<Self, rama::error::OpaqueError> {
        use rama::error::ErrorContext;
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&raw).context("parse JSON config"),
            _ => toml::from_str(&raw).context("parse TOML config"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml_config_parses() {
        let raw = r#"
            [listen]
            bind = "127.0.0.1:8080"
        "#;
        let config: ProxyConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.listen.bind.port(), 8080);
        assert!(!config.mitm.enabled);
        assert_eq!(config.credentials.len(), 0);
    }
}
