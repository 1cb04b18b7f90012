//! HTTP client core (spec §4.8).
//!
//! Grounded on `rama`'s `EasyHttpWebClient` builder pattern as exercised in
//! the teacher's `src/cmd/send` and `src/cmd/probe` subcommands: a single
//! client instance, configured once at startup, reused across requests with
//! a per-authority connection pool. Timeouts are layered the way the
//! teacher layers them — as `TimeoutLayer`s around the transport, not as
//! ad-hoc `tokio::time::timeout` calls scattered through the engine.

use rama::error::{BoxError, ErrorContext, OpaqueError};
use rama::http::client::EasyHttpWebClient;
use rama::net::tls::client::ClientConfig as RamaTlsClientConfig;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use super::pac::PacCandidate;

/// Timeout budget of spec §4.8: each named stage gets its own deadline
/// rather than one end-to-end timeout, so a slow DNS resolution doesn't
/// eat into the budget reserved for reading response headers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientTimeouts {
    pub dial_ms: u64,
    pub tls_handshake_ms: u64,
    pub response_header_ms: u64,
    pub idle_conn_ms: u64,
    pub expect_100_ms: u64,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            dial_ms: 10_000,
            tls_handshake_ms: 10_000,
            response_header_ms: 30_000,
            idle_conn_ms: 90_000,
            expect_100_ms: 1_000,
        }
    }
}

impl ClientTimeouts {
    pub fn dial(&self) -> Duration {
        Duration::from_millis(self.dial_ms)
    }
    pub fn tls_handshake(&self) -> Duration {
        Duration::from_millis(self.tls_handshake_ms)
    }
    pub fn response_header(&self) -> Duration {
        Duration::from_millis(self.response_header_ms)
    }
    pub fn idle_conn(&self) -> Duration {
        Duration::from_millis(self.idle_conn_ms)
    }
    pub fn expect_100(&self) -> Duration {
        Duration::from_millis(self.expect_100_ms)
    }
}

/// Outbound TLS posture for origin connections (spec §4.8): a CA pool
/// trusted in addition to (or instead of) the system roots, an optional
/// `insecure_skip_verify` escape hatch for lab/test deployments, and an
/// optional TLS key log file for offline decryption during debugging —
/// the same knob the teacher exposes via `SSLKEYLOGFILE` in `trace.rs`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutboundTlsConfig {
    pub extra_ca_pem: Option<String>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    pub key_log_file: Option<String>,
}

/// One `connect_to` override (spec §4.8): a dial made to `host:port`
/// matching `match_host`/`match_port` is redirected to `target_host:
/// target_port` instead, without touching the request's own URL/Host
/// header. `match_port = None` matches any port on `match_host`.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectToRule {
    pub match_host: String,
    pub match_port: Option<u16>,
    pub target_host: String,
    pub target_port: u16,
}

/// Ordered list of [`ConnectToRule`]s; first match wins.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct ConnectToConfig(pub Vec<ConnectToRule>);

impl ConnectToConfig {
    /// Resolve the actual dial target for `host:port`, applying the first
    /// matching `connect_to` rule, or `(host, port)` unchanged if none
    /// matches. Currently applied at the one dial site this crate controls
    /// directly: the raw (non-MITM) CONNECT tunnel in `engine::connect_proxy`.
    pub fn resolve<'a>(&'a self, host: &'a str, port: u16) -> (&'a str, u16) {
        for rule in &self.0 {
            let host_matches = rule.match_host.eq_ignore_ascii_case(host);
            let port_matches = rule.match_port.is_none_or(|p| p == port);
            if host_matches && port_matches {
                return (rule.target_host.as_str(), rule.target_port);
            }
        }
        (host, port)
    }
}

/// Configuration for the single, shared HTTP client core.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub timeouts: ClientTimeouts,
    #[serde(default)]
    pub tls: OutboundTlsConfig,
    #[serde(default)]
    pub connect_to: ConnectToConfig,
}

/// The shared dispatch surface used by the proxy engine for every
/// forwarded request and every CONNECT dial. One instance is built at
/// startup and cloned (cheaply, behind `Arc`) into each connection task.
#[derive(Clone)]
pub struct ProxyHttpClient {
    inner: Arc<EasyHttpWebClient>,
    timeouts: ClientTimeouts,
    connect_to: Arc<ConnectToConfig>,
}

impl ProxyHttpClient {
    pub fn new(config: &ClientConfig) -> Result<Self, OpaqueError> {
        let mut builder = EasyHttpWebClient::builder();

        if config.tls.insecure_skip_verify || config.tls.extra_ca_pem.is_some() {
            let mut tls_config = RamaTlsClientConfig::default();
            tls_config.insecure_skip_verify = config.tls.insecure_skip_verify;
            if let Some(pem) = &config.tls.extra_ca_pem {
                tls_config
                    .extra_root_certs
                    .get_or_insert_with(Vec::new)
                    .push(pem.clone());
            }
            builder = builder.with_tls_config(tls_config);
        }

        if let Some(path) = &config.tls.key_log_file {
            // Parity with the teacher's `SSLKEYLOGFILE` support in
            // `trace.rs`: honored for outbound (origin-facing) TLS too.
            unsafe {
                std::env::set_var("SSLKEYLOGFILE", path);
            }
        }

        let client = builder
            .with_connect_timeout(config.timeouts.dial())
            .with_tls_handshake_timeout(config.timeouts.tls_handshake())
            .build()
            .context("build proxy HTTP client core")?;

        Ok(Self {
            inner: Arc::new(client),
            timeouts: config.timeouts.clone(),
            connect_to: Arc::new(config.connect_to.clone()),
        })
    }

    pub fn timeouts(&self) -> &ClientTimeouts {
        &self.timeouts
    }

    pub fn inner(&self) -> &EasyHttpWebClient {
        &self.inner
    }

    /// Resolve the actual TCP dial target for `host:port`, applying the
    /// configured `connect_to` overrides (spec §4.8), without rewriting the
    /// request's own target URL. Applied at the one dial site this crate
    /// performs directly: the raw (non-MITM) CONNECT tunnel.
    pub fn connect_to_for(&self, host: &str, port: u16) -> (String, u16) {
        let (host, port) = self.connect_to.resolve(host, port);
        (host.to_owned(), port)
    }

    /// On a dial failure of the primary upstream candidate, retry against
    /// each subsequent PAC candidate in order (spec §4.4 step 4, §9 design
    /// decision: fallback fires only on dial failure, never on a completed
    /// but non-2xx response).
    pub async fn dial_with_pac_fallback<F, Fut, T>(
        candidates: &[PacCandidate],
        mut dial: F,
    ) -> Result<T, BoxError>
    where
        F: FnMut(Option<(&str, u16)>) -> Fut,
        Fut: std::future::Future<Output = Result<T, BoxError>>,
    {
        let mut last_err: Option<BoxError> = None;
        let targets: Vec<Option<(&str, u16)>> = if candidates.is_empty() {
            vec![None]
        } else {
            candidates
                .iter()
                .map(|c| match c {
                    PacCandidate::Direct => None,
                    PacCandidate::Proxy { host, port } | PacCandidate::Socks { host, port } => {
                        Some((host.as_str(), *port))
                    }
                })
                .collect()
        };

        for target in targets {
            match dial(target).await {
                Ok(value) => return Ok(value),
                Err(err) => last_err = Some(err),
            }
        }

        Err(last_err.unwrap_or_else(|| BoxError::from("no PAC candidates to dial")))
    }

    /// Idempotent-retry rule of spec §4.3: a clean EOF from the upstream
    /// connection before any response byte was read is retried exactly
    /// once on a fresh connection; any byte read commits the attempt.
    pub async fn with_clean_eof_retry<F, Fut, T>(mut attempt: F) -> Result<T, BoxError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, AttemptError>>,
    {
        match attempt().await {
            Ok(value) => Ok(value),
            Err(AttemptError::CleanEofBeforeResponse(_)) => match attempt().await {
                Ok(value) => Ok(value),
                Err(err) => Err(err.into_box()),
            },
            Err(err) => Err(err.into_box()),
        }
    }
}

/// Distinguishes a dial/send failure that read zero response bytes (safe
/// to retry) from one that read at least one byte (must not be retried,
/// since the request may have had side effects on the origin).
pub enum AttemptError {
    CleanEofBeforeResponse(BoxError),
    Other(BoxError),
}

impl AttemptError {
    fn into_box(self) -> BoxError {
        match self {
            Self::CleanEofBeforeResponse(e) | Self::Other(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_to_redirects_matching_host() {
        let config = ConnectToConfig(vec![ConnectToRule {
            match_host: "origin.internal".into(),
            match_port: Some(443),
            target_host: "10.0.0.5".into(),
            target_port: 8443,
        }]);
        assert_eq!(config.resolve("origin.internal", 443), ("10.0.0.5", 8443));
        assert_eq!(config.resolve("origin.internal", 80), ("origin.internal", 80));
        assert_eq!(config.resolve("other.host", 443), ("other.host", 443));
    }

    #[test]
    fn connect_to_wildcard_port_matches_any_port() {
        let config = ConnectToConfig(vec![ConnectToRule {
            match_host: "origin.internal".into(),
            match_port: None,
            target_host: "10.0.0.5".into(),
            target_port: 9000,
        }]);
        assert_eq!(config.resolve("origin.internal", 1).1, 9000);
        assert_eq!(config.resolve("origin.internal", 65535).1, 9000);
    }

    #[tokio::test]
    async fn pac_fallback_tries_each_candidate_in_order() {
        let candidates = vec![
            PacCandidate::Proxy {
                host: "bad".into(),
                port: 1,
            },
            PacCandidate::Proxy {
                host: "good".into(),
                port: 2,
            },
        ];
        let attempted = std::sync::Mutex::new(Vec::new());
        let result: Result<&str, BoxError> =
            ProxyHttpClient::dial_with_pac_fallback(&candidates, |target| {
                let host = target.map(|(h, _)| h.to_owned());
                attempted.lock().unwrap().push(host.clone());
                async move {
                    if host.as_deref() == Some("good") {
                        Ok("connected")
                    } else {
                        Err(BoxError::from("refused"))
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "connected");
        assert_eq!(
            *attempted.lock().unwrap(),
            vec![Some("bad".to_owned()), Some("good".to_owned())]
        );
    }

    #[tokio::test]
    async fn clean_eof_retries_exactly_once() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: Result<&str, BoxError> = ProxyHttpClient::with_clean_eof_retry(|| {
            let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(AttemptError::CleanEofBeforeResponse(BoxError::from("eof")))
                } else {
                    Ok("ok")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn byte_read_failure_is_not_retried() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: Result<&str, BoxError> = ProxyHttpClient::with_clean_eof_retry(|| {
            attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move { Err::<&str, _>(AttemptError::Other(BoxError::from("reset mid-body"))) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
