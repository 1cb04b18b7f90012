//! Connection supervisor (spec §4.2).
//!
//! Owns the lifetime of one accepted TCP connection: a deadline on reading
//! the first bytes (covering both an optional PROXY protocol header and the
//! first HTTP request line, per the byte-level peek discipline noted in
//! spec §9), an idle timeout between requests on a keep-alive connection,
//! and graceful drain-then-abort on shutdown. Grounded on the teacher's
//! `TimeoutLayer`/`Either<A,B>` conditional-layer pattern in `src/proxy/mod.rs`
//! and its `rama::graceful::Shutdown` usage in `src/main.rs`.

use rama::error::BoxError;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub read_header_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub drain_timeout_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            read_header_timeout_ms: 10_000,
            idle_timeout_ms: 90_000,
            drain_timeout_ms: 30_000,
        }
    }
}

impl SupervisorConfig {
    pub fn read_header_timeout(&self) -> Duration {
        Duration::from_millis(self.read_header_timeout_ms)
    }
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Races `fut` against the read-header deadline. Used both for the PROXY
/// protocol peek and, separately, for the first request line of an
/// HTTP/1.1 connection — each accepted connection gets exactly one such
/// race before the peer is considered unresponsive and dropped.
pub async fn with_read_header_deadline<F, T>(
    config: &SupervisorConfig,
    fut: F,
) -> Result<T, BoxError>
where
    F: std::future::Future<Output = Result<T, BoxError>>,
{
    tokio::time::timeout(config.read_header_timeout(), fut)
        .await
        .map_err(|_| BoxError::from("timed out waiting for connection header"))?
}

/// Races `fut` (one HTTP exchange on a keep-alive connection) against the
/// idle timeout; a connection that produces no new request within the
/// window is closed rather than held open indefinitely.
pub async fn with_idle_deadline<F, T>(config: &SupervisorConfig, fut: F) -> Option<T>
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(config.idle_timeout(), fut).await.ok()
}

/// Graceful drain: give in-flight requests on a connection up to
/// `drain_timeout` to finish after a shutdown signal before the connection
/// task is aborted outright. HTTP/2 connections multiplex many requests
/// over the same supervised task; draining applies to the whole
/// connection, not per-stream (spec §4.2 note on H2 multiplexing).
pub async fn drain_or_abort<F>(config: &SupervisorConfig, fut: F)
where
    F: std::future::Future<Output = ()>,
{
    if tokio::time::timeout(config.drain_timeout(), fut).await.is_err() {
        tracing::warn!("connection did not drain within the grace period, aborting");
    }
}
