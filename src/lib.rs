//! `ramafwd` library surface: the forward HTTP/HTTPS proxy engine, split
//! out from `main.rs` so integration tests in `tests/` can drive the
//! pipeline in-process without spawning the compiled binary.

pub mod config;
pub mod error;
pub mod metrics;
pub mod proxy;
pub mod trace;
