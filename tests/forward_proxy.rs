//! End-to-end exercise of the forward-proxy data path (spec §8 scenario 1:
//! "plain HTTP request through the proxy, no auth, no MITM, reaches the
//! origin and the origin's response is returned unmodified").
//!
//! Grounded on the teacher's `tests/integration/examples/example_tests/
//! http_connect_proxy.rs` shape: spin up a tiny JSON-echoing origin with
//! `HttpServer::auto`, drive a request through the proxy with a `rama`
//! client, and assert on the decoded body — adapted to call this crate's
//! own service stack in-process instead of spawning a compiled example
//! binary.

use ramafwd::proxy::client::ClientConfig;
use ramafwd::proxy::credentials::CredentialMatcher;
use ramafwd::proxy::dns::{DnsOverride, DnsOverrideConfig};
use ramafwd::proxy::domain::DomainMatcher;
use ramafwd::proxy::engine::{plain_proxy, ProxyState};
use ramafwd::proxy::modifiers::ModifierPipeline;
use ramafwd::metrics::Metrics;
use ramafwd::proxy::upstream::{LocalhostPolicy, UpstreamResolver, UpstreamResolverConfig};

use rama::http::service::web::response::Json;
use rama::http::{server::HttpServer, BodyExtractExt, HeaderValue, Request};
use rama::rt::Executor;
use rama::service::{service_fn, Context};
use serde_json::{json, Value};

fn test_via() -> std::sync::Arc<HeaderValue> {
    std::sync::Arc::new(HeaderValue::from_static("1.1 test-proxy-00000000"))
}

fn build_state() -> ProxyState {
    let upstream_config = UpstreamResolverConfig {
        // localhost is the origin in this test, so route it directly.
        localhost_policy: LocalhostPolicy::Direct,
        deny_domains: DomainMatcher::empty(),
        direct_domains: DomainMatcher::empty(),
        fixed_upstream: None,
        fixed_upstream_credential: None,
    };

    ProxyState {
        upstream: std::sync::Arc::new(UpstreamResolver::new(upstream_config, None)),
        credentials: std::sync::Arc::new(CredentialMatcher::new(Vec::new())),
        modifiers: std::sync::Arc::new(ModifierPipeline::default()),
        client: ramafwd::proxy::client::ProxyHttpClient::new(&ClientConfig::default()).unwrap(),
        inbound_auth: None,
        mitm_domains: None,
        mitm_authority: None,
        metrics: std::sync::Arc::new(Metrics::default()),
        dns: std::sync::Arc::new(DnsOverride::new(&DnsOverrideConfig::default())),
        via: test_via(),
    }
}

#[tokio::test]
async fn plain_request_reaches_origin_unmodified() {
    tokio::spawn(async {
        HttpServer::auto(Executor::default())
            .listen(
                "127.0.0.1:63101",
                service_fn(async |req: Request| {
                    Ok(Json(json!({
                        "method": req.method().as_str(),
                        "path": req.uri().path(),
                    })))
                }),
            )
            .await
            .unwrap();
    });

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let state = build_state();
    let ctx = Context::with_state(state);
    let req = Request::get("http://127.0.0.1:63101/foo/bar")
        .body(rama::http::Body::empty())
        .unwrap();

    let resp = plain_proxy(ctx, req).await.unwrap();
    let value: Value = resp.try_into_json().await.unwrap();
    assert_eq!(value, json!({"method": "GET", "path": "/foo/bar"}));
}

#[tokio::test]
async fn denied_domain_short_circuits_before_dispatch() {
    let upstream_config = UpstreamResolverConfig {
        localhost_policy: LocalhostPolicy::Deny,
        deny_domains: DomainMatcher::compile(&[r".*".to_owned()]).unwrap(),
        direct_domains: DomainMatcher::empty(),
        fixed_upstream: None,
        fixed_upstream_credential: None,
    };

    let state = ProxyState {
        upstream: std::sync::Arc::new(UpstreamResolver::new(upstream_config, None)),
        credentials: std::sync::Arc::new(CredentialMatcher::new(Vec::new())),
        modifiers: std::sync::Arc::new(ModifierPipeline::default()),
        client: ramafwd::proxy::client::ProxyHttpClient::new(&ClientConfig::default()).unwrap(),
        inbound_auth: None,
        mitm_domains: None,
        mitm_authority: None,
        metrics: std::sync::Arc::new(Metrics::default()),
        dns: std::sync::Arc::new(DnsOverride::new(&DnsOverrideConfig::default())),
        via: test_via(),
    };

    let ctx = Context::with_state(state);
    let req = Request::get("http://example.invalid/anything")
        .body(rama::http::Body::empty())
        .unwrap();

    let resp = plain_proxy(ctx, req).await.unwrap();
    assert_eq!(resp.status(), rama::http::StatusCode::FORBIDDEN);
}
