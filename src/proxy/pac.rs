//! PAC (Proxy Auto-Configuration) resolution (spec §4.4, §9, GLOSSARY).
//!
//! PAC script *execution* is treated as an external collaborator: the core
//! only calls [`PacResolver::find_proxy_for_url`] and parses the resulting
//! `FindProxyForURL`-style candidate string. This mirrors the teacher
//! ecosystem's own split: `rama-pac` wraps a JS engine (`boa`) behind a
//! narrow surface so the core proxy crate never needs to know which JS
//! runtime, if any, backs it.

use rama::error::{BoxError, OpaqueError};
use std::fmt;

/// One entry of the ordered candidate list a PAC script returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacCandidate {
    Direct,
    Proxy { host: String, port: u16 },
    Socks { host: String, port: u16 },
}

/// External collaborator interface the core consumes (spec §9 design note).
///
/// Implementations may wrap a JavaScript engine (see [`BoaPacResolver`] when
/// built with the `pac-js` feature) or a static, pre-resolved script.
pub trait PacResolver: Send + Sync + fmt::Debug {
    /// Evaluate `FindProxyForURL(url, host)` and return the ordered
    /// candidate list. The first candidate is used; the rest are only
    /// tried by the HTTP client on dial failure of the primary (spec §4.8,
    /// §4.4 step 4, §9 open question: dial-failure-only fallback).
    fn find_proxy_for_url(&self, url: &str, host: &str) -> Result<Vec<PacCandidate>, BoxError>;
}

/// Parse a raw `FindProxyForURL` return value, e.g.
/// `"PROXY up1:3128; SOCKS5 s:1080; DIRECT"`, into its ordered candidates.
pub fn parse_candidates(raw: &str) -> Result<Vec<PacCandidate>, OpaqueError> {
    raw.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|directive| {
            let mut parts = directive.split_whitespace();
            let kind = parts
                .next()
                .ok_or_else(|| OpaqueError::from_display("empty PAC directive"))?;
            match kind.to_ascii_uppercase().as_str() {
                "DIRECT" => Ok(PacCandidate::Direct),
                "PROXY" | "SOCKS5" | "SOCKS" => {
                    let addr = parts
                        .next()
                        .ok_or_else(|| OpaqueError::from_display("PAC directive missing address"))?;
                    let (host, port) = addr
                        .rsplit_once(':')
                        .ok_or_else(|| OpaqueError::from_display("PAC address missing port"))?;
                    let port: u16 = port
                        .parse()
                        .map_err(|_| OpaqueError::from_display("PAC address has invalid port"))?;
                    if kind.eq_ignore_ascii_case("PROXY") {
                        Ok(PacCandidate::Proxy {
                            host: host.to_owned(),
                            port,
                        })
                    } else {
                        Ok(PacCandidate::Socks {
                            host: host.to_owned(),
                            port,
                        })
                    }
                }
                other => Err(OpaqueError::from_display(format!(
                    "unknown PAC directive: {other}"
                ))),
            }
        })
        .collect()
}

/// A [`PacResolver`] backed by a single, unconditional candidate list —
/// useful for tests and for deployments that pin a fixed PAC outcome
/// without running any JavaScript at all.
#[derive(Debug, Clone)]
pub struct StaticPacResolver {
    candidates: Vec<PacCandidate>,
}

impl StaticPacResolver {
    pub fn new(candidates: Vec<PacCandidate>) -> Self {
        Self { candidates }
    }

    pub fn from_script_result(raw: &str) -> Result<Self, OpaqueError> {
        Ok(Self::new(parse_candidates(raw)?))
    }
}

impl PacResolver for StaticPacResolver {
    fn find_proxy_for_url(&self, _url: &str, _host: &str) -> Result<Vec<PacCandidate>, BoxError> {
        Ok(self.candidates.clone())
    }
}

#[cfg(feature = "pac-js")]
pub use boa_backed::BoaPacResolver;

#[cfg(feature = "pac-js")]
mod boa_backed {
    use super::{BoxError, PacCandidate, PacResolver, parse_candidates};
    use boa_engine::{Context as JsContext, NativeFunction, Source, js_string};
    use boa_runtime::Console;
    use rama::error::ErrorContext;
    use std::sync::Mutex;

    /// A [`PacResolver`] that evaluates a real PAC script's
    /// `FindProxyForURL(url, host)` function via an embedded JS engine.
    ///
    /// Scripts are not re-entrant in `boa`'s `Context`, so evaluation is
    /// serialized behind a mutex; this is acceptable because minting
    /// candidates from a PAC script is expected to be cheap and infrequent
    /// relative to the requests it gates (the upstream decision is computed
    /// once per request and never re-evaluated on retry, spec §3 invariants).
    pub struct BoaPacResolver {
        script: String,
        ctx: Mutex<JsContext>,
    }

    impl std::fmt::Debug for BoaPacResolver {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("BoaPacResolver").finish_non_exhaustive()
        }
    }

    impl BoaPacResolver {
        pub fn new(script: impl Into<String>) -> Result<Self, BoxError> {
            let script = script.into();
            let mut ctx = JsContext::default();
            let console = Console::init(&mut ctx);
            ctx.register_global_property(js_string!("console"), console, Default::default())
                .context("register console global")?;
            register_dns_stubs(&mut ctx)?;
            ctx.eval(Source::from_bytes(script.as_bytes()))
                .map_err(|err| BoxError::from(err.to_string()))
                .context("evaluate PAC script")?;
            Ok(Self {
                script,
                ctx: Mutex::new(ctx),
            })
        }
    }

    impl PacResolver for BoaPacResolver {
        fn find_proxy_for_url(
            &self,
            url: &str,
            host: &str,
        ) -> Result<Vec<PacCandidate>, BoxError> {
            let mut ctx = self.ctx.lock().map_err(|_| BoxError::from("PAC context poisoned"))?;
            let call = format!(
                "FindProxyForURL({}, {})",
                js_string_literal(url),
                js_string_literal(host)
            );
            let result = ctx
                .eval(Source::from_bytes(call.as_bytes()))
                .map_err(|err| BoxError::from(err.to_string()))?;
            let raw = result
                .to_string(&mut ctx)
                .map_err(|err| BoxError::from(err.to_string()))?
                .to_std_string_escaped();
            parse_candidates(&raw).map_err(BoxError::from)
        }
    }

    fn js_string_literal(s: &str) -> String {
        format!("{:?}", s)
    }

    /// PAC scripts commonly call `dnsResolve`/`myIpAddress`/`isResolvable`;
    /// stub them out so scripts that probe DNS for routing decisions do not
    /// panic on a missing global. A full implementation would back these
    /// with the configured [`crate::proxy::dns::DnsOverride`] resolver.
    fn register_dns_stubs(ctx: &mut JsContext) -> Result<(), BoxError> {
        ctx.register_global_builtin_callable(
            js_string!("dnsResolve"),
            1,
            NativeFunction::from_fn_ptr(|_, args, _| {
                Ok(args.first().cloned().unwrap_or_default())
            }),
        )
        .map_err(|err| BoxError::from(err.to_string()))?;
        ctx.register_global_builtin_callable(
            js_string!("myIpAddress"),
            0,
            NativeFunction::from_fn_ptr(|_, _, _| Ok(js_string!("127.0.0.1").into())),
        )
        .map_err(|err| BoxError::from(err.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_directive_list() {
        let candidates = parse_candidates("PROXY up1:3128 ; DIRECT").unwrap();
        assert_eq!(
            candidates,
            vec![
                PacCandidate::Proxy {
                    host: "up1".into(),
                    port: 3128
                },
                PacCandidate::Direct,
            ]
        );
    }

    #[test]
    fn rejects_unknown_directive() {
        assert!(parse_candidates("BOGUS foo").is_err());
    }

    #[test]
    fn static_resolver_returns_fixed_list() {
        let resolver = StaticPacResolver::from_script_result("DIRECT").unwrap();
        let candidates = resolver.find_proxy_for_url("http://x/", "x").unwrap();
        assert_eq!(candidates, vec![PacCandidate::Direct]);
    }
}
