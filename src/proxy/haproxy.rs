//! PROXY protocol front-end (spec §4.1, GLOSSARY "PROXY protocol").
//!
//! Reused, not reimplemented: `rama-haproxy` already ships a server-side
//! `HaProxyLayer` that peeks the v1/v2 header off the accepted stream and
//! overrides the peer address seen by everything downstream. This module
//! is a thin config/wiring layer, consistent with how the wider pack treats
//! PROXY protocol as a solved problem at the `rama` ecosystem level.

use rama::net::forwarded::Forwarded;
use rama::proxy::haproxy::server::HaProxyLayer;
use serde::Deserialize;

/// Whether inbound connections are expected to be prefixed with a PROXY
/// protocol header, and how strictly that is enforced.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyProtocolMode {
    /// No PROXY protocol header is read; the TCP peer address is used as-is.
    #[default]
    Off,
    /// A PROXY protocol header is required on every connection; connections
    /// that don't present one are rejected.
    Required,
    /// A PROXY protocol header is read if present, otherwise the TCP peer
    /// address is used unchanged.
    Optional,
}

/// Build the `HaProxyLayer` for the configured mode. `None` means "don't
/// wrap the listener with a PROXY protocol peek at all" (the `Off` case),
/// which keeps the accept hot path free of the extra read when disabled.
pub fn build_layer(mode: ProxyProtocolMode) -> Option<HaProxyLayer> {
    match mode {
        ProxyProtocolMode::Off => None,
        ProxyProtocolMode::Required => Some(HaProxyLayer::new()),
        ProxyProtocolMode::Optional => Some(HaProxyLayer::new().optional()),
    }
}

/// Peer address as overridden by a decoded PROXY protocol header, when one
/// was presented (spec §4.1: downstream logging/metrics/ACLs all observe
/// the original client address, not the immediate TCP peer, once this is
/// present in the request context).
pub fn forwarded_peer(forwarded: &Forwarded) -> Option<std::net::SocketAddr> {
    forwarded
        .client_socket_addr()
        .map(|el| el.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn off_mode_builds_no_layer() {
        assert!(build_layer(ProxyProtocolMode::Off).is_none());
    }

    #[test]
    fn required_and_optional_build_a_layer() {
        assert!(build_layer(ProxyProtocolMode::Required).is_some());
        assert!(build_layer(ProxyProtocolMode::Optional).is_some());
    }
}
