//! The proxy engine (spec §4.3): request classification, the forward path,
//! the CONNECT path, and the per-request state machine.
//!
//! Grounded on the teacher's `CONNECT` handling in `src/proxy/mod.rs`
//! (`UpgradeLayer` splitting CONNECT from plain requests, `RequestContext`
//! carrying the parsed target host, `tokio::io::copy_bidirectional` for the
//! opaque tunnel) generalized with an upstream-resolution, credential and
//! header-modifier stage in front of dispatch, and a MITM branch added to
//! the CONNECT path.

use rama::error::BoxError;
use rama::http::header::{HOST, PROXY_AUTHORIZATION, VIA};
use rama::http::layer::upgrade::Upgraded;
use rama::http::{HeaderMap, HeaderValue, IntoResponse, Request, RequestContext, Response, StatusCode};
use rama::net::address::{Host, HostWithPort, ProxyAddress};
use rama::net::user::{Basic, ProxyCredential};
use rama::net::Protocol;
use rama::service::{Context, Layer, Service};
use rama::tcp::utils::is_connection_error;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::client::ProxyHttpClient;
use super::credentials::CredentialMatcher;
use super::dns::DnsOverride;
use super::domain::DomainMatcher;
use super::error::{ProxyError, ProxyErrorKind};
use super::mitm::{mitm_tls_acceptor_data, MitmAuthority};
use super::modifiers::ModifierPipeline;
use super::upstream::{UpstreamDecision, UpstreamResolver};
use crate::metrics::Metrics;

/// State threaded through the forward/CONNECT pipeline for one connection
/// (spec §4.2/§4.3). Cheap to clone — everything behind it is `Arc`'d.
#[derive(Clone)]
pub struct ProxyState {
    pub upstream: Arc<UpstreamResolver>,
    pub credentials: Arc<CredentialMatcher>,
    pub modifiers: Arc<ModifierPipeline>,
    pub client: ProxyHttpClient,
    pub inbound_auth: Option<Arc<Basic>>,
    pub mitm_domains: Option<Arc<DomainMatcher>>,
    pub mitm_authority: Option<Arc<MitmAuthority>>,
    pub metrics: Arc<Metrics>,
    pub dns: Arc<DnsOverride>,
    /// The `Via: 1.1 <name>-<random>` value appended to every forwarded
    /// request and response (spec §6); computed once at startup.
    pub via: Arc<HeaderValue>,
}

/// The named states of spec §4.3: `Accepted -> Parsed -> Classified ->
/// Resolved -> (Authorized|407) -> ModifiersApplied -> Dispatched ->
/// ResponseReceived -> Streaming -> Done`, collapsed here into the points
/// where the pipeline can fail rather than kept as an explicit enum —
/// each stage function below corresponds 1:1 to a named state transition.
pub struct RequestOutcome {
    pub response: Response,
}

/// Inbound proxy-authorization guard (spec §4.6): when `inbound_auth` is
/// configured, every request must carry a matching `Proxy-Authorization:
/// Basic` header or receive a `407`.
fn check_inbound_auth(state: &ProxyState, req: &Request) -> Result<(), ProxyError> {
    let Some(expected) = &state.inbound_auth else {
        return Ok(());
    };

    let header = req
        .headers()
        .get(rama::http::header::PROXY_AUTHORIZATION)
        .ok_or_else(|| ProxyError::auth("missing Proxy-Authorization header"))?;
    let credential = ProxyCredential::try_from(header.clone())
        .map_err(|_| ProxyError::auth("malformed Proxy-Authorization header"))?;

    match credential {
        ProxyCredential::Basic(basic) if &basic == expected.as_ref() => Ok(()),
        _ => Err(ProxyError::auth("invalid proxy credentials")),
    }
}

fn target_host_port(req: &Request) -> Result<(Host, u16), ProxyError> {
    let ctx = RequestContext::from(req);
    let authority = ctx
        .authority
        .ok_or_else(|| ProxyError::bad_request("request target has no authority"))?;
    Ok((authority.host().clone(), authority.port()))
}

/// `UpgradeLayer`'s accept hook for CONNECT requests (state `Accepted ->
/// Parsed -> Classified`). Resolves the upstream decision up front so a
/// denied/blocked target never gets a tunnel established.
pub async fn connect_accept(
    mut ctx: Context<ProxyState>,
    req: Request,
) -> Result<(Response, Context<ProxyState>, Request), Response> {
    let state = ctx.state().clone();
    state.metrics.record_request();
    state.metrics.record_connect();

    if let Err(err) = check_inbound_auth(&state, &req) {
        return Err(err.log_and_count(&state.metrics).into_response());
    }

    let (host, port) = match target_host_port(&req) {
        Ok(pair) => pair,
        Err(err) => return Err(err.log_and_count(&state.metrics).into_response()),
    };

    let url = format!("https://{host}:{port}/");
    let decision = match state.upstream.resolve(&host, port, &url) {
        Ok(decision) => decision,
        Err(err) => return Err(err.log_and_count(&state.metrics).into_response()),
    };

    if matches!(decision, UpstreamDecision::Deny | UpstreamDecision::Block) {
        return Err(ProxyError::policy_deny("target is denied by policy")
            .log_and_count(&state.metrics)
            .into_response());
    }

    ctx.insert(ConnectTarget { host, port, decision });

    Ok((StatusCode::OK.into_response(), ctx, req))
}

#[derive(Clone)]
struct ConnectTarget {
    host: Host,
    port: u16,
    decision: UpstreamDecision,
}

/// `UpgradeLayer`'s post-accept hook: splice the tunnel. Either a raw
/// bidirectional byte copy (spec §4.3 CONNECT path default) or, when the
/// target matches `mitm_domains`, TLS termination followed by re-entry
/// into the forward-proxy pipeline over the now-plaintext stream (spec
/// §4.5).
pub async fn connect_proxy(
    ctx: Context<ProxyState>,
    mut upgraded: Upgraded,
) -> Result<(), Infallible> {
    let state = ctx.state().clone();
    let target = match ctx.get::<ConnectTarget>().cloned() {
        Some(target) => target,
        None => {
            tracing::error!("connect_proxy invoked without a resolved ConnectTarget");
            return Ok(());
        }
    };

    let should_mitm = match (&state.mitm_domains, &state.mitm_authority) {
        (Some(domains), Some(_)) => domains.matches(&target.host.to_string()),
        _ => false,
    };

    if should_mitm {
        state.metrics.record_mitm();
        if let Err(err) = splice_mitm(&state, &target, upgraded).await {
            tracing::warn!(error = %err, host = %target.host, "MITM splice failed, connection dropped");
        }
        return Ok(());
    }

    let (dial_host, dial_port) = match &target.decision {
        UpstreamDecision::Proxy { authority, .. } => {
            (authority.host().to_string(), authority.port())
        }
        _ => (target.host.to_string(), target.port),
    };
    // spec §4.8 "connect_to mapping": redirect the dial without rewriting
    // the CONNECT target itself (credential/MITM-domain decisions above
    // already used the unredirected `target`).
    let (dial_host, dial_port) = state.client.connect_to_for(&dial_host, dial_port);

    let mut stream = match dial_tcp(&state.dns, &dial_host, dial_port).await {
        Ok(stream) => stream,
        Err(err) => {
            tracing::error!(error = %err, target = %format!("{dial_host}:{dial_port}"), "CONNECT dial failed");
            return Ok(());
        }
    };

    // spec §4.3 CONNECT step 1: a `Proxy` decision means this CONNECT is
    // itself chained through an upstream proxy, which requires its own
    // CONNECT handshake (upstream credentials + `connect_headers`) before
    // the tunnel can be spliced — the upstream must not receive the
    // client's raw TLS ClientHello as its first byte.
    if let UpstreamDecision::Proxy { credential, .. } = &target.decision {
        if let Err(err) =
            perform_upstream_connect(&mut stream, &target, credential.as_ref(), &state).await
        {
            tracing::error!(error = %err, host = %target.host, "upstream CONNECT handshake failed");
            return Ok(());
        }
    }

    if let Err(err) = tokio::io::copy_bidirectional(&mut upgraded, &mut stream).await {
        if !is_connection_error(&err) {
            tracing::error!(error = %err, "error copying CONNECT tunnel data");
        }
    }
    Ok(())
}

/// Resolve `host:port` through the configured DNS override (if active) and
/// connect; otherwise fall back to the OS resolver via `TcpStream::connect`
/// (spec §4.9). Applied at the one dial site this crate controls directly,
/// the same scope `connect_to` is limited to (see `client.rs`).
async fn dial_tcp(
    dns: &DnsOverride,
    host: &str,
    port: u16,
) -> Result<tokio::net::TcpStream, BoxError> {
    if !dns.is_active() {
        return tokio::net::TcpStream::connect((host, port))
            .await
            .map_err(BoxError::from);
    }

    let candidates = dns.lookup_ip(host).await?;
    let mut last_err: Option<BoxError> = None;
    for ip in candidates {
        match tokio::net::TcpStream::connect((ip, port)).await {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(BoxError::from(err)),
        }
    }
    Err(last_err.unwrap_or_else(|| BoxError::from("DNS override returned no addresses")))
}

/// Issue a `CONNECT host:port HTTP/1.1` request over an already-dialed
/// upstream proxy connection (spec §4.3 CONNECT step 1), carrying upstream
/// credentials as `Proxy-Authorization`, the configured `connect_headers`,
/// and the outgoing `Via` entry. Grounded on the request shape rama's own
/// client-side `InnerHttpProxyConnector` builds (method `CONNECT`, `Host`
/// header) — that type is private to `rama-http-backend`, so the wire bytes
/// are assembled directly here instead.
async fn perform_upstream_connect(
    stream: &mut tokio::net::TcpStream,
    target: &ConnectTarget,
    credential: Option<&Basic>,
    state: &ProxyState,
) -> Result<(), BoxError> {
    let authority = format!("{}:{}", target.host, target.port);

    let mut headers = HeaderMap::new();
    headers.insert(HOST, HeaderValue::from_str(&authority)?);
    headers.append(VIA, (*state.via).clone());
    if let Some(credential) = credential {
        headers.insert(
            PROXY_AUTHORIZATION,
            HeaderValue::from_str(&credential.to_header_value())?,
        );
    }
    state.modifiers.connect_headers.apply(&mut headers);

    let mut request = format!("CONNECT {authority} HTTP/1.1\r\n").into_bytes();
    for (name, value) in headers.iter() {
        request.extend_from_slice(name.as_str().as_bytes());
        request.extend_from_slice(b": ");
        request.extend_from_slice(value.as_bytes());
        request.extend_from_slice(b"\r\n");
    }
    request.extend_from_slice(b"\r\n");
    stream.write_all(&request).await?;

    let mut response = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(BoxError::from(
                "upstream proxy closed the connection during the CONNECT handshake",
            ));
        }
        response.extend_from_slice(&chunk[..n]);
        if response.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if response.len() > 8 * 1024 {
            return Err(BoxError::from("upstream CONNECT response headers too large"));
        }
    }

    let status_line = response
        .split(|&b| b == b'\n')
        .next()
        .map(|line| String::from_utf8_lossy(line).into_owned())
        .unwrap_or_default();
    if !status_line.contains(" 200") {
        return Err(BoxError::from(format!(
            "upstream proxy rejected CONNECT: {}",
            status_line.trim()
        )));
    }
    Ok(())
}

async fn splice_mitm(
    state: &ProxyState,
    target: &ConnectTarget,
    upgraded: Upgraded,
) -> Result<(), BoxError> {
    let authority = state
        .mitm_authority
        .clone()
        .ok_or_else(|| BoxError::from("splice_mitm called without mitm_authority configured"))?;
    let domains = state
        .mitm_domains
        .clone()
        .ok_or_else(|| BoxError::from("splice_mitm called without mitm_domains configured"))?;
    let acceptor = mitm_tls_acceptor_data(authority, domains, &target.host.to_string())?;

    let state = state.clone();
    let target = target.clone();

    // The client now believes it is speaking TLS directly to the origin.
    // Re-enter the forward-proxy pipeline behind a TLS-terminating layer,
    // the same `TlsAcceptorLayer::into_layer(service)` composition the
    // teacher uses over a fresh `TcpListener` accept, applied here to the
    // already-upgraded CONNECT stream instead (spec §4.5 step 4, and the
    // HTTP/1.1-only MITM constraint of spec §3).
    let exec = rama::rt::Executor::default();
    let http_service = rama::http::server::HttpServer::http1(exec).service(rama::service::service_fn(
        move |_ctx: Context<()>, req: Request| {
            let state = state.clone();
            let target = target.clone();
            async move { forward(state, target, req).await }
        },
    ));
    let tls_wrapped = rama::tls::rustls::server::TlsAcceptorLayer::new(acceptor)
        .into_layer(http_service);
    tls_wrapped
        .serve(Context::with_state(()), upgraded)
        .await
        .map_err(BoxError::from)?;
    Ok(())
}

impl Clone for ConnectTarget {
    fn clone(&self) -> Self {
        Self {
            host: self.host.clone(),
            port: self.port,
            decision: self.decision.clone(),
        }
    }
}

/// The forward path (spec §4.3): plain (non-CONNECT) requests and
/// MITM-terminated requests both funnel through here.
async fn forward(
    state: ProxyState,
    target: ConnectTarget,
    mut req: Request,
) -> Result<Response, Infallible> {
    if let Err(err) = check_inbound_auth(&state, &req) {
        return Ok(err.log_and_count(&state.metrics).into_response());
    }

    state.modifiers.request_headers.apply(req.headers_mut());
    req.headers_mut().append(VIA, (*state.via).clone());

    if let Some(credential) = state.credentials.lookup(&target.host.to_string(), target.port) {
        inject_credential(&mut req, &credential, &target.decision);
    }

    let mut resp = match dispatch(&state, &target, req).await {
        Ok(resp) => resp,
        Err(err) => return Ok(err.log_and_count(&state.metrics).into_response()),
    };

    state.modifiers.response_headers.apply(resp.headers_mut());
    resp.headers_mut().append(VIA, (*state.via).clone());
    Ok(resp)
}

/// Entry point for plain (non-CONNECT) HTTP requests on the outer listener
/// (the `UpgradeLayer`'s "else" branch).
pub async fn plain_proxy(
    ctx: Context<ProxyState>,
    req: Request,
) -> Result<Response, Infallible> {
    let state = ctx.state().clone();
    state.metrics.record_request();

    let (host, port) = match target_host_port(&req) {
        Ok(pair) => pair,
        Err(err) => return Ok(err.log_and_count(&state.metrics).into_response()),
    };

    let url = req.uri().to_string();
    let decision = match state.upstream.resolve(&host, port, &url) {
        Ok(decision) => decision,
        Err(err) => return Ok(err.log_and_count(&state.metrics).into_response()),
    };

    if matches!(decision, UpstreamDecision::Deny | UpstreamDecision::Block) {
        return Ok(ProxyError::policy_deny("target is denied by policy")
            .log_and_count(&state.metrics)
            .into_response());
    }

    let target = ConnectTarget { host, port, decision };
    forward(state, target, req).await
}

/// §4.6 credential injection: sets `Proxy-Authorization` (chained-proxy
/// auth) or `Authorization` (origin basic auth) depending on the decision.
fn inject_credential(req: &mut Request, credential: &Basic, decision: &UpstreamDecision) {
    let header_name = match decision {
        UpstreamDecision::Proxy { .. } => rama::http::header::PROXY_AUTHORIZATION,
        _ => rama::http::header::AUTHORIZATION,
    };
    let encoded = credential.to_header_value();
    if let Ok(value) = HeaderValue::from_str(&encoded) {
        req.headers_mut().insert(header_name, value);
    }
}

async fn dispatch(
    state: &ProxyState,
    target: &ConnectTarget,
    req: Request,
) -> Result<Response, ProxyError> {
    let fallbacks = state
        .upstream
        .pac_fallbacks(&req.uri().to_string(), &target.host);

    let proxy_address = match &target.decision {
        UpstreamDecision::Proxy { authority, credential } => Some(ProxyAddress {
            protocol: Some(Protocol::HTTP),
            address: HostWithPort::new(authority.host().clone(), authority.port()),
            credential: credential.clone().map(ProxyCredential::Basic),
        }),
        _ => None,
    };

    let attempt = {
        let state = state.clone();
        let req = Arc::new(tokio::sync::Mutex::new(Some(req)));
        let proxy_address = proxy_address.clone();
        move |_candidate: Option<(&str, u16)>| {
            let state = state.clone();
            let req = req.clone();
            let proxy_address = proxy_address.clone();
            async move {
                let req = req
                    .lock()
                    .await
                    .take()
                    .ok_or_else(|| BoxError::from("request already consumed by a prior attempt"))?;
                let mut ctx = Context::with_state(state.clone());
                // spec §4.3 forward step 6: when the decision is `Proxy`,
                // `rama`'s `EasyHttpWebClient` only dials through the
                // upstream when it finds a `ProxyAddress` in the context
                // (see `rama-http-backend`'s `HttpProxyConnector::serve`,
                // which reads `ctx.get::<ProxyAddress>()`); without it the
                // client would dial the origin directly.
                if let Some(proxy_address) = proxy_address {
                    ctx.insert(proxy_address);
                }
                state
                    .client
                    .inner()
                    .serve(ctx, req)
                    .await
                    .map_err(BoxError::from)
            }
        }
    };

    match ProxyHttpClient::dial_with_pac_fallback(&fallbacks, attempt).await {
        Ok(resp) => Ok(resp),
        Err(err) => Err(classify_dispatch_error(err)),
    }
}

fn classify_dispatch_error(err: BoxError) -> ProxyError {
    let message = err.to_string();
    if message.contains("timed out") || message.contains("timeout") {
        ProxyError::upstream_timeout(message)
    } else if message.contains("tls") || message.contains("certificate") {
        ProxyError::tls(message)
    } else {
        ProxyError::upstream_dial(message)
    }
}

/// spec §9 open question, decided: non-101 informational (1xx) responses
/// from the origin are dropped silently rather than forwarded; a `101`
/// response instead switches this connection into opaque tunnel mode,
/// identical to a CONNECT tunnel from this point on.
pub fn should_forward_informational(status: StatusCode) -> bool {
    status == StatusCode::SWITCHING_PROTOCOLS
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::client::ClientConfig;
    use super::super::modifiers::{HeaderRule, ModifierList};
    use super::super::upstream::UpstreamResolverConfig;

    fn test_state() -> ProxyState {
        ProxyState {
            upstream: Arc::new(UpstreamResolver::new(UpstreamResolverConfig::default(), None)),
            credentials: Arc::new(CredentialMatcher::new(Vec::new())),
            modifiers: Arc::new(ModifierPipeline::default()),
            client: ProxyHttpClient::new(&ClientConfig::default()).unwrap(),
            inbound_auth: None,
            mitm_domains: None,
            mitm_authority: None,
            metrics: Arc::new(Metrics::default()),
            dns: Arc::new(DnsOverride::new(&Default::default())),
            via: Arc::new(HeaderValue::from_static("1.1 test-proxy-deadbeef")),
        }
    }

    #[tokio::test]
    async fn upstream_connect_sends_auth_via_and_connect_headers() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accepted = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = conn.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).into_owned();
            conn.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            request
        });

        let mut client_stream = tokio::net::TcpStream::connect(addr).await.unwrap();

        let mut state = test_state();
        state.modifiers = Arc::new(ModifierPipeline {
            connect_headers: ModifierList(vec![HeaderRule::Add {
                name: "x-hop".into(),
                value: "yes".into(),
            }]),
            ..ModifierPipeline::default()
        });

        let target = ConnectTarget {
            host: Host::Name("origin.internal".parse().unwrap()),
            port: 443,
            decision: UpstreamDecision::Direct,
        };
        let credential = Basic::new("alice", "s3cret");

        perform_upstream_connect(&mut client_stream, &target, Some(&credential), &state)
            .await
            .unwrap();

        let request = accepted.await.unwrap();
        assert!(request.starts_with("CONNECT origin.internal:443 HTTP/1.1\r\n"));
        assert!(request.to_ascii_lowercase().contains("proxy-authorization: basic"));
        assert!(request.to_ascii_lowercase().contains("via: 1.1 test-proxy-deadbeef"));
        assert!(request.to_ascii_lowercase().contains("x-hop: yes"));
    }

    #[tokio::test]
    async fn upstream_connect_rejects_non_200_status() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = conn.read(&mut buf).await.unwrap();
            conn.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let mut client_stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let state = test_state();
        let target = ConnectTarget {
            host: Host::Name("origin.internal".parse().unwrap()),
            port: 443,
            decision: UpstreamDecision::Direct,
        };

        let err = perform_upstream_connect(&mut client_stream, &target, None, &state)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("407"));
    }

    #[test]
    fn only_switching_protocols_is_forwarded() {
        assert!(should_forward_informational(StatusCode::SWITCHING_PROTOCOLS));
        assert!(!should_forward_informational(StatusCode::CONTINUE));
        assert!(!should_forward_informational(StatusCode::PROCESSING));
    }

    #[test]
    fn dispatch_error_classification() {
        assert!(matches!(
            classify_dispatch_error(BoxError::from("dial timed out after 10s")).kind,
            ProxyErrorKind::UpstreamTimeout
        ));
        assert!(matches!(
            classify_dispatch_error(BoxError::from("tls handshake failed: bad certificate")).kind,
            ProxyErrorKind::Tls
        ));
        assert!(matches!(
            classify_dispatch_error(BoxError::from("connection refused")).kind,
            ProxyErrorKind::UpstreamDial
        ));
    }
}
