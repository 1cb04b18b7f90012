//! Modifier pipeline (spec §4.7, §9 design note).
//!
//! Modeled, per the §9 design note, as a tagged variant owned by the proxy
//! engine rather than as polymorphic `ModifyRequest`/`ModifyResponse`
//! objects (the source's approach). Three ordered lists — `connect_headers`,
//! `request_headers`, `response_headers` — each a `Vec<HeaderRule>` applied
//! sequentially and idempotently before any byte of the body is streamed.

use rama::http::HeaderMap;
use rama::http::header::{HeaderName, HeaderValue};
use serde::Deserialize;
use std::str::FromStr;

/// One rule of spec §3 "Header rule". Names are canonicalised by
/// [`HeaderName`]; values are rejected by construction if they contain
/// CR/LF (the `http` crate's [`HeaderValue`] already enforces this).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum HeaderRule {
    Add { name: String, value: String },
    Set { name: String, value: String },
    SetEmpty { name: String },
    Remove { name: String },
    RemovePrefix { prefix: String },
}

/// Header names whose modification is honored but logged at debug level
/// (spec §4.7: "A modifier that sets a Connection-class header ... is
/// honored but is logged at debug").
const CONNECTION_CLASS_HEADERS: &[&str] = &["connection", "transfer-encoding", "upgrade", "host"];

impl HeaderRule {
    fn apply(&self, headers: &mut HeaderMap) -> Result<(), rama::error::OpaqueError> {
        use rama::error::ErrorContext;

        match self {
            Self::Add { name, value } => {
                let name = HeaderName::from_str(name).context("parse header name")?;
                let value = HeaderValue::from_str(value).context("parse header value")?;
                log_if_connection_class(&name);
                headers.append(name, value);
            }
            Self::Set { name, value } => {
                let name = HeaderName::from_str(name).context("parse header name")?;
                let value = HeaderValue::from_str(value).context("parse header value")?;
                log_if_connection_class(&name);
                headers.insert(name, value);
            }
            Self::SetEmpty { name } => {
                let name = HeaderName::from_str(name).context("parse header name")?;
                log_if_connection_class(&name);
                headers.insert(name, HeaderValue::from_static(""));
            }
            Self::Remove { name } => {
                let name = HeaderName::from_str(name).context("parse header name")?;
                log_if_connection_class(&name);
                headers.remove(&name);
            }
            Self::RemovePrefix { prefix } => {
                let prefix = prefix.to_ascii_lowercase();
                let to_remove: Vec<HeaderName> = headers
                    .keys()
                    .filter(|name| name.as_str().starts_with(&prefix))
                    .cloned()
                    .collect();
                for name in to_remove {
                    log_if_connection_class(&name);
                    headers.remove(&name);
                }
            }
        }
        Ok(())
    }
}

fn log_if_connection_class(name: &HeaderName) {
    if CONNECTION_CLASS_HEADERS.contains(&name.as_str()) {
        tracing::debug!(header = %name, "modifier touches a connection-class header");
    }
}

/// Applies an ordered list of [`HeaderRule`]s to a header set. Rules run in
/// the order given by config and complete before any byte is dispatched
/// (spec §5 ordering guarantees).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct ModifierList(pub Vec<HeaderRule>);

impl ModifierList {
    pub fn apply(&self, headers: &mut HeaderMap) {
        for rule in &self.0 {
            if let Err(err) = rule.apply(headers) {
                tracing::warn!(error = %err, rule = ?rule, "skipping invalid header rule");
            }
        }
    }
}

/// The three ordered lists of spec §4.7.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModifierPipeline {
    #[serde(default)]
    pub connect_headers: ModifierList,
    #[serde(default)]
    pub request_headers: ModifierList,
    #[serde(default)]
    pub response_headers: ModifierList,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_appends_without_removing_existing() {
        let mut headers = HeaderMap::new();
        headers.append("x-test", HeaderValue::from_static("a"));
        let list = ModifierList(vec![HeaderRule::Add {
            name: "x-test".into(),
            value: "b".into(),
        }]);
        list.apply(&mut headers);
        let values: Vec<_> = headers.get_all("x-test").iter().collect();
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn set_replaces_existing() {
        let mut headers = HeaderMap::new();
        headers.append("x-test", HeaderValue::from_static("a"));
        let list = ModifierList(vec![HeaderRule::Set {
            name: "x-test".into(),
            value: "b".into(),
        }]);
        list.apply(&mut headers);
        assert_eq!(headers.get("x-test").unwrap(), "b");
    }

    #[test]
    fn remove_prefix_clears_matching_headers() {
        let mut headers = HeaderMap::new();
        headers.append("x-debug-a", HeaderValue::from_static("1"));
        headers.append("x-debug-b", HeaderValue::from_static("2"));
        headers.append("x-keep", HeaderValue::from_static("3"));
        let list = ModifierList(vec![HeaderRule::RemovePrefix {
            prefix: "x-debug".into(),
        }]);
        list.apply(&mut headers);
        assert!(headers.get("x-debug-a").is_none());
        assert!(headers.get("x-debug-b").is_none());
        assert!(headers.get("x-keep").is_some());
    }

    #[test]
    fn response_header_injection_scenario() {
        // spec §8 boundary behavior: a response-header modifier that adds
        // `test-resp-add: test-resp-value` is observable by the client.
        let mut headers = HeaderMap::new();
        let list = ModifierList(vec![HeaderRule::Add {
            name: "test-resp-add".into(),
            value: "test-resp-value".into(),
        }]);
        list.apply(&mut headers);
        assert_eq!(headers.get("test-resp-add").unwrap(), "test-resp-value");
    }
}
