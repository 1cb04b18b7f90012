//! The `proxy` subcommand: a forward HTTP/HTTPS proxy with upstream
//! chaining, PAC-based upstream selection, MITM interception and
//! credential injection (spec §1 OVERVIEW).
//!
//! Wiring follows the teacher's own `CONNECT`-splitting shape (`UpgradeLayer`
//! routing CONNECT away from plain requests, `BodyLimitLayer` around the
//! whole listener, `rama::graceful::Shutdown` for the top-level task group)
//! generalized with the upstream/credential/modifier/MITM stages this crate
//! adds in front of dispatch.

pub mod admin;
pub mod client;
pub mod credentials;
pub mod dns;
pub mod domain;
pub mod engine;
pub mod error;
pub mod haproxy;
pub mod mitm;
pub mod modifiers;
pub mod pac;
pub mod supervisor;
pub mod upstream;

use clap::Args;
use rama::error::{BoxError, ErrorContext};
use rama::http::HeaderValue;
use rama::http::layer::{
    remove_header::{RemoveRequestHeaderLayer, RemoveResponseHeaderLayer},
    trace::TraceLayer,
    upgrade::UpgradeLayer,
};
use rama::http::matcher::MethodMatcher;
use rama::http::server::HttpServer;
use rama::net::user::Basic;
use rama::rt::Executor;
use rama::service::layer::TimeoutLayer;
use rama::service::{service_fn, ServiceBuilder};
use rama::stream::layer::http::BodyLimitLayer;
use rama::tcp::server::TcpListener;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ProxyConfig;
use crate::metrics::Metrics;

use admin::AdminState;
use client::ProxyHttpClient;
use credentials::CredentialMatcher;
use dns::DnsOverride;
use engine::ProxyState;
use haproxy::build_layer as build_haproxy_layer;
use mitm::MitmAuthority;
use pac::{PacResolver, StaticPacResolver};
use upstream::{UpstreamResolver, UpstreamResolverConfig};

/// The CLI surface overlaid on top of an optional config file: most
/// deployments are expected to run from `--config`, with these flags
/// available for quick, config-less smoke runs (parity with the teacher's
/// `CliCommandProxy`, which is entirely flag-driven).
#[derive(Debug, Args)]
pub struct CliCommandProxy {
    /// path to a TOML or JSON configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// the address to listen on for the data plane, when no config file is given
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    /// the address to listen on for the admin API, when no config file is given
    #[arg(long)]
    pub admin_listen: Option<SocketAddr>,
}

impl CliCommandProxy {
    fn load_config(&self) -> Result<ProxyConfig, BoxError> {
        if let Some(path) = &self.config {
            return ProxyConfig::from_file(path).map_err(BoxError::from);
        }
        let raw = format!(
            "[listen]\nbind = \"{}\"\n{}",
            self.listen,
            self.admin_listen
                .map(|addr| format!("[admin]\nbind = \"{addr}\"\n"))
                .unwrap_or_default(),
        );
        toml::from_str(&raw)
            .context("build default proxy config from CLI flags")
            .map_err(BoxError::from)
    }
}

pub async fn run(cfg: CliCommandProxy) -> Result<(), BoxError> {
    crate::trace::init_tracing("info".parse().context("parse default log directive")?);

    let config = cfg.load_config()?;

    let upstream_config = UpstreamResolverConfig {
        localhost_policy: config.upstream.localhost_policy,
        deny_domains: config
            .upstream
            .deny_domains
            .compile()
            .context("compile deny_domains")?,
        direct_domains: config
            .upstream
            .direct_domains
            .compile()
            .context("compile direct_domains")?,
        fixed_upstream: config
            .upstream
            .fixed_upstream
            .as_deref()
            .map(str::parse)
            .transpose()
            .context("parse fixed_upstream")?,
        fixed_upstream_credential: match (
            &config.upstream.fixed_upstream_username,
            &config.upstream.fixed_upstream_password,
        ) {
            (Some(u), Some(p)) => Some(Basic::new(u.clone(), p.clone())),
            _ => None,
        },
    };

    let pac_resolver: Option<Arc<dyn PacResolver>> = load_pac_resolver(&config)?;

    let upstream = Arc::new(UpstreamResolver::new(upstream_config, pac_resolver));
    let credentials = Arc::new(CredentialMatcher::new(config.credentials.clone()));
    let modifiers = Arc::new(config.modifiers.clone());
    let client = ProxyHttpClient::new(&config.client).context("build HTTP client core")?;

    // Consulted at the raw dial sites this crate controls directly (the
    // opaque/chained CONNECT tunnel in `engine::connect_proxy`); the
    // forward path's dispatch through `EasyHttpWebClient`'s own internal
    // connector is unaffected, same documented scope as `connect_to` in
    // `client.rs` (spec §4.9).
    let dns = Arc::new(DnsOverride::new(&config.dns));
    if dns.is_active() {
        tracing::info!("DNS override active for outbound resolution");
    }

    let via_suffix: u32 = rand::random();
    let via = Arc::new(
        HeaderValue::from_str(&format!("1.1 {}-{:08x}", config.via_name, via_suffix))
            .context("build Via header value from configured via_name")?,
    );

    let inbound_auth = match (&config.inbound_auth.username, &config.inbound_auth.password) {
        (Some(u), Some(p)) => Some(Arc::new(Basic::new(u.clone(), p.clone()))),
        _ => None,
    };

    let (mitm_domains, mitm_authority) = if config.mitm.enabled {
        let domains = Arc::new(config.mitm.domains.compile().context("compile mitm domains")?);
        let authority = Arc::new(build_mitm_authority(&config)?);
        (Some(domains), Some(authority))
    } else {
        (None, None)
    };

    let metrics = Arc::new(Metrics::default());
    let serving = Arc::new(AtomicBool::new(false));

    let state = ProxyState {
        upstream,
        credentials,
        modifiers,
        client,
        inbound_auth,
        mitm_domains,
        mitm_authority: mitm_authority.clone(),
        metrics: metrics.clone(),
        dns,
        via,
    };

    let graceful = rama::graceful::Shutdown::default();

    if let Some(admin_bind) = config.admin.bind {
        let admin_state = AdminState {
            serving: serving.clone(),
            version: env!("CARGO_PKG_VERSION"),
            effective_config: Arc::from(format!("{config:#?}")),
            pac_script: None,
            mitm_authority,
            metrics: Arc::new({
                let metrics = metrics.clone();
                move || metrics.render()
            }),
        };
        graceful.spawn_task_fn(move |guard| async move {
            let router = admin::router(admin_state);
            let exec = Executor::graceful(guard.clone());
            let http_service = HttpServer::auto(exec).service(router);
            match TcpListener::build().bind(admin_bind).await {
                Ok(listener) => listener.serve_graceful(guard, http_service).await,
                Err(err) => tracing::error!(error = %err, "failed to bind admin API listener"),
            }
        });
    }

    let data_plane_bind = config.listen.bind;
    let proxy_protocol_mode = config.listen.proxy_protocol;
    let supervisor_config = config.supervisor.clone();

    graceful.spawn_task_fn(move |guard| async move {
        let listener = match TcpListener::build().bind(data_plane_bind).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::error!(error = %err, addr = %data_plane_bind, "failed to bind data plane listener");
                return;
            }
        };

        tracing::info!(addr = %data_plane_bind, "ramafwd data plane listening");
        serving.store(true, Ordering::Relaxed);

        let exec = Executor::graceful(guard.clone());
        let http_service = HttpServer::auto(exec)
            .service(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(UpgradeLayer::new(
                        MethodMatcher::CONNECT,
                        service_fn(engine::connect_accept),
                        service_fn(engine::connect_proxy),
                    ))
                    .service(
                        ServiceBuilder::new()
                            .layer(RemoveResponseHeaderLayer::hop_by_hop())
                            .layer(RemoveRequestHeaderLayer::hop_by_hop())
                            .service_fn(engine::plain_proxy),
                    ),
            )
            .with_state(state);

        // spec §4.2: one supervised deadline per connection, covering both
        // the read-header wait (PROXY header + first request line) and the
        // keep-alive idle gap between requests. `rama`'s `HttpServer::auto`
        // multiplexes both phases over the same connection task the way the
        // teacher's single `cfg.timeout` flag does (src/proxy/mod.rs), so
        // one `TimeoutLayer` at this level covers both; the read-header- and
        // idle-specific helpers in `supervisor.rs` exist for a future split
        // once a lower-level accept hook exposes the two phases separately.
        let body_limited = ServiceBuilder::new()
            .layer(BodyLimitLayer::symmetric(16 * 1024 * 1024))
            .layer(TimeoutLayer::new(supervisor_config.idle_timeout()))
            .service(http_service);

        match build_haproxy_layer(proxy_protocol_mode) {
            Some(haproxy_layer) => {
                listener
                    .serve_graceful(guard, haproxy_layer.into_layer(body_limited))
                    .await
            }
            None => listener.serve_graceful(guard, body_limited).await,
        }
    });

    graceful.shutdown_with_limit(Duration::from_secs(30)).await?;
    Ok(())
}

fn build_mitm_authority(config: &ProxyConfig) -> Result<MitmAuthority, BoxError> {
    let validity = Duration::from_secs(config.mitm.ca_validity_hours * 3600);
    match (&config.mitm.ca_cert_path, &config.mitm.ca_key_path) {
        (Some(cert_path), Some(key_path)) => {
            let cert_pem = std::fs::read_to_string(cert_path).context("read MITM CA cert")?;
            let key_pem = std::fs::read_to_string(key_path).context("read MITM CA key")?;
            MitmAuthority::load(&cert_pem, &key_pem, Some(validity)).map_err(BoxError::from)
        }
        _ => MitmAuthority::generate(Some(validity)).map_err(BoxError::from),
    }
}

fn load_pac_resolver(config: &ProxyConfig) -> Result<Option<Arc<dyn PacResolver>>, BoxError> {
    let script = match (&config.upstream.pac_script_path, &config.upstream.pac_script_url) {
        (Some(path), _) => Some(std::fs::read_to_string(path).context("read PAC script file")?),
        (None, Some(_url)) => {
            // Fetching a remote PAC script requires the HTTP client core,
            // which is built after this resolver; deployments that need a
            // remote PAC URL fetch it out-of-band and point pac_script_path
            // at the cached result instead.
            return Err(BoxError::from(
                "pac_script_url is not fetched automatically; use pac_script_path",
            ));
        }
        (None, None) => None,
    };

    let Some(script) = script else {
        return Ok(None);
    };

    #[cfg(feature = "pac-js")]
    {
        let resolver = pac::BoaPacResolver::new(script)?;
        Ok(Some(Arc::new(resolver) as Arc<dyn PacResolver>))
    }

    #[cfg(not(feature = "pac-js"))]
    {
        let resolver = StaticPacResolver::from_script_result(&script).map_err(BoxError::from)?;
        Ok(Some(Arc::new(resolver) as Arc<dyn PacResolver>))
    }
}
