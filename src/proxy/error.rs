//! Error kinds for the proxy data path (spec §7).
//!
//! Every stage of the forward/CONNECT pipeline returns `Result<_, ProxyError>`.
//! A `ProxyError` knows its own status code, its `X-Forwarder-Error` text and
//! the metric label it increments, so call sites never hand-roll any of the
//! three in more than one place.

use rama::http::{IntoResponse, Response, StatusCode, header::HeaderValue};
use std::fmt;

/// One entry per error kind named in spec §7.
#[derive(Debug)]
pub enum ProxyErrorKind {
    BadRequest,
    Auth,
    PolicyDeny,
    UpstreamDial,
    UpstreamTimeout,
    Tls,
    ClientGone,
    Internal,
}

impl ProxyErrorKind {
    /// Metric label, stable across releases (used as a counter label, never
    /// as free text, so it is safe to expose without redaction).
    pub const fn metric_label(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::Auth => "auth",
            Self::PolicyDeny => "policy_deny",
            Self::UpstreamDial => "upstream_dial",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::Tls => "tls",
            Self::ClientGone => "client_gone",
            Self::Internal => "internal",
        }
    }

    const fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::Auth => StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            Self::PolicyDeny => StatusCode::FORBIDDEN,
            Self::UpstreamDial => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Tls => StatusCode::BAD_GATEWAY,
            // ClientGone never reaches IntoResponse: the client is already gone.
            Self::ClientGone => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// An error produced while serving a single proxied request.
///
/// `detail` is the short, already-redacted message that becomes the
/// `X-Forwarder-Error` header value; it must never contain a credential.
pub struct ProxyError {
    pub kind: ProxyErrorKind,
    pub detail: String,
}

impl ProxyError {
    pub fn new(kind: ProxyErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: redact(detail.into()),
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(ProxyErrorKind::BadRequest, detail)
    }

    pub fn auth(detail: impl Into<String>) -> Self {
        Self::new(ProxyErrorKind::Auth, detail)
    }

    pub fn policy_deny(detail: impl Into<String>) -> Self {
        Self::new(ProxyErrorKind::PolicyDeny, detail)
    }

    pub fn upstream_dial(detail: impl Into<String>) -> Self {
        Self::new(ProxyErrorKind::UpstreamDial, detail)
    }

    pub fn upstream_timeout(detail: impl Into<String>) -> Self {
        Self::new(ProxyErrorKind::UpstreamTimeout, detail)
    }

    pub fn tls(detail: impl Into<String>) -> Self {
        Self::new(ProxyErrorKind::Tls, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ProxyErrorKind::Internal, detail)
    }

    /// Emit the single log line and single metric increment spec §7
    /// requires per error, keyed on error kind: `warn` for policy/auth
    /// rejections, `error` for upstream/TLS/internal failures.
    pub fn log_and_count(self, metrics: &crate::metrics::Metrics) -> Self {
        match self.kind {
            ProxyErrorKind::PolicyDeny | ProxyErrorKind::Auth => {
                tracing::warn!(kind = self.kind.metric_label(), detail = %self.detail, "request rejected");
            }
            ProxyErrorKind::BadRequest => {
                tracing::warn!(kind = self.kind.metric_label(), detail = %self.detail, "bad request");
            }
            _ => {
                tracing::error!(kind = self.kind.metric_label(), detail = %self.detail, "request failed");
            }
        }
        metrics.record_error(self.kind.metric_label());
        self
    }
}

impl fmt::Debug for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyError")
            .field("kind", &self.kind)
            .field("detail", &self.detail)
            .finish()
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.metric_label(), self.detail)
    }
}

impl std::error::Error for ProxyError {}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.kind.status();
        let mut resp = status.into_response();
        if let Ok(value) = HeaderValue::from_str(&self.detail) {
            resp.headers_mut().insert("x-forwarder-error", value);
        }
        resp
    }
}

/// Best-effort redaction of `user:password@` style credentials that might
/// have leaked into an error message built from a dial address or URI.
fn redact(mut s: String) -> String {
    if let Some(at) = s.find('@') {
        if let Some(start) = s[..at].rfind(|c: char| c == '/' || c == ' ') {
            s.replace_range(start + 1..at, "***:***");
        } else {
            s.replace_range(..at, "***:***");
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_basic_auth_in_uri() {
        let err = ProxyError::upstream_dial("dial tcp http://user:hunter2@up:3128: refused");
        assert!(!err.detail.contains("hunter2"));
        assert!(err.detail.contains("dial tcp"));
    }

    #[test]
    fn status_codes_match_spec() {
        assert_eq!(
            ProxyError::policy_deny("x").kind.status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ProxyError::upstream_dial("x").kind.status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::upstream_timeout("x").kind.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(ProxyError::auth("x").kind.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
    }
}
