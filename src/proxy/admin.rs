//! Admin HTTP API (spec §6).
//!
//! Grounded on the `Router::new_with_state(..).with_get(..)` pattern used by
//! the teacher's `src/cmd/serve/fp/mod.rs` for its own control-plane-style
//! routes. Served on its own bind address, independent of the data plane
//! listener, so `/readyz` stays reachable even when the data plane is
//! draining.

use rama::http::service::web::{response::Json, Router};
use rama::http::{IntoResponse, StatusCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::mitm::MitmAuthority;

/// Shared state visible to every admin endpoint.
#[derive(Clone)]
pub struct AdminState {
    pub serving: Arc<AtomicBool>,
    pub version: &'static str,
    pub effective_config: Arc<str>,
    pub pac_script: Option<Arc<str>>,
    pub mitm_authority: Option<Arc<MitmAuthority>>,
    pub metrics: Arc<dyn Fn() -> String + Send + Sync>,
}

pub fn router(state: AdminState) -> Router<AdminState> {
    Router::new_with_state(state)
        .with_get("/readyz", readyz)
        .with_get("/metrics", metrics)
        .with_get("/version", version)
        .with_get("/configz", configz)
        .with_get("/pac", pac)
        .with_get("/cacert", cacert)
        .with_not_found(async || StatusCode::NOT_FOUND)
}

async fn readyz(ctx: rama::service::Context<AdminState>) -> impl IntoResponse {
    if ctx.state().serving.load(Ordering::Relaxed) {
        StatusCode::OK.into_response()
    } else {
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    }
}

async fn metrics(ctx: rama::service::Context<AdminState>) -> impl IntoResponse {
    (StatusCode::OK, (ctx.state().metrics)())
}

async fn version(ctx: rama::service::Context<AdminState>) -> impl IntoResponse {
    Json(serde_json::json!({ "version": ctx.state().version }))
}

async fn configz(ctx: rama::service::Context<AdminState>) -> impl IntoResponse {
    (StatusCode::OK, ctx.state().effective_config.to_string())
}

async fn pac(ctx: rama::service::Context<AdminState>) -> impl IntoResponse {
    match &ctx.state().pac_script {
        Some(script) => (StatusCode::OK, script.to_string()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn cacert(ctx: rama::service::Context<AdminState>) -> impl IntoResponse {
    match &ctx.state().mitm_authority {
        Some(authority) => (
            [("content-type", "application/x-pem-file")],
            authority.ca_cert_pem(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_state() -> AdminState {
        AdminState {
            serving: Arc::new(AtomicBool::new(false)),
            version: "0.1.0-test",
            effective_config: Arc::from("{}"),
            pac_script: None,
            mitm_authority: None,
            metrics: Arc::new(|| String::new()),
        }
    }

    #[tokio::test]
    async fn readyz_reflects_serving_flag() {
        let state = base_state();
        let ctx = rama::service::Context::with_state(state.clone());
        let resp = readyz(ctx).await.into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.serving.store(true, Ordering::Relaxed);
        let ctx = rama::service::Context::with_state(state);
        let resp = readyz(ctx).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn pac_and_cacert_404_when_unconfigured() {
        let ctx = rama::service::Context::with_state(base_state());
        assert_eq!(pac(ctx).await.into_response().status(), StatusCode::NOT_FOUND);
        let ctx = rama::service::Context::with_state(base_state());
        assert_eq!(
            cacert(ctx).await.into_response().status(),
            StatusCode::NOT_FOUND
        );
    }
}
