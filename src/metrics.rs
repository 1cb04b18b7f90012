//! Metrics registry (ambient stack: SPEC_FULL.md, spec §5 shared-resources
//! notes: "lock-free where the hot path touches it").
//!
//! A fixed, pre-validated set of counters/histograms built once at startup
//! — label sets are not dynamic, so there is no unbounded-cardinality risk
//! from, say, echoing an arbitrary header value into a label. Rendered in
//! Prometheus text exposition format for the `/metrics` admin endpoint
//! (spec §6).

use std::sync::atomic::{AtomicU64, Ordering};

/// One monotonic counter per [`super::proxy::error::ProxyErrorKind`] label,
/// plus a handful of pipeline-wide counters.
#[derive(Default)]
pub struct Metrics {
    requests_total: AtomicU64,
    connect_total: AtomicU64,
    mitm_total: AtomicU64,
    errors_bad_request: AtomicU64,
    errors_auth: AtomicU64,
    errors_policy_deny: AtomicU64,
    errors_upstream_dial: AtomicU64,
    errors_upstream_timeout: AtomicU64,
    errors_tls: AtomicU64,
    errors_client_gone: AtomicU64,
    errors_internal: AtomicU64,
}

impl Metrics {
    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect(&self) {
        self.connect_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mitm(&self) {
        self.mitm_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the counter for `label`, which must be one of
    /// [`super::proxy::error::ProxyErrorKind::metric_label`]'s values.
    pub fn record_error(&self, label: &str) {
        let counter = match label {
            "bad_request" => &self.errors_bad_request,
            "auth" => &self.errors_auth,
            "policy_deny" => &self.errors_policy_deny,
            "upstream_dial" => &self.errors_upstream_dial,
            "upstream_timeout" => &self.errors_upstream_timeout,
            "tls" => &self.errors_tls,
            "client_gone" => &self.errors_client_gone,
            _ => &self.errors_internal,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Prometheus text exposition of this registry's current values.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("# TYPE ramafwd_requests_total counter\n");
        out.push_str(&format!(
            "ramafwd_requests_total {}\n",
            self.requests_total.load(Ordering::Relaxed)
        ));
        out.push_str("# TYPE ramafwd_connect_total counter\n");
        out.push_str(&format!(
            "ramafwd_connect_total {}\n",
            self.connect_total.load(Ordering::Relaxed)
        ));
        out.push_str("# TYPE ramafwd_mitm_total counter\n");
        out.push_str(&format!(
            "ramafwd_mitm_total {}\n",
            self.mitm_total.load(Ordering::Relaxed)
        ));
        out.push_str("# TYPE ramafwd_errors_total counter\n");
        for (label, counter) in [
            ("bad_request", &self.errors_bad_request),
            ("auth", &self.errors_auth),
            ("policy_deny", &self.errors_policy_deny),
            ("upstream_dial", &self.errors_upstream_dial),
            ("upstream_timeout", &self.errors_upstream_timeout),
            ("tls", &self.errors_tls),
            ("client_gone", &self.errors_client_gone),
            ("internal", &self.errors_internal),
        ] {
            out.push_str(&format!(
                "ramafwd_errors_total{{kind=\"{label}\"}} {}\n",
                counter.load(Ordering::Relaxed)
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_renders_counters() {
        let metrics = Metrics::default();
        metrics.record_request();
        metrics.record_request();
        metrics.record_error("upstream_dial");
        let rendered = metrics.render();
        assert!(rendered.contains("ramafwd_requests_total 2"));
        assert!(rendered.contains("kind=\"upstream_dial\"} 1"));
    }

    #[test]
    fn unknown_label_falls_back_to_internal() {
        let metrics = Metrics::default();
        metrics.record_error("something_unexpected");
        assert!(metrics.render().contains("kind=\"internal\"} 1"));
    }
}
