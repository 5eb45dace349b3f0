//! Per-request context shared with admission stages.
//!
//! [`RequestContext`] is built once per request, before the pipeline runs,
//! and is read-only afterwards. [`AdmissionReport`] is the explicit side
//! channel carrying warnings and captured validation errors from the request
//! rewriter to the response rewriter; it lives exactly as long as the request
//! and replaces any notion of request-scoped global state.

use std::net::SocketAddr;

use http::HeaderMap;
use serde::Serialize;

use crate::admission::AdmissionError;
use crate::nomad::AclToken;

/// Who is submitting the job, as far as the proxy can tell.
///
/// Serialized into webhook payloads with Nomad's field casing.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestContext {
    #[serde(rename = "ClientIP")]
    pub client_ip: String,

    #[serde(rename = "AccessorID")]
    pub accessor_id: String,

    #[serde(rename = "TokenInfo")]
    pub token_info: Option<AclToken>,
}

impl RequestContext {
    pub fn new(client_ip: String) -> Self {
        Self {
            client_ip,
            ..Self::default()
        }
    }

    /// Attach a resolved token descriptor.
    pub fn with_token(mut self, token: AclToken) -> Self {
        self.accessor_id = token.accessor_id.clone();
        self.token_info = Some(token);
        self
    }
}

/// The client address: first hop of `X-Forwarded-For` when present,
/// otherwise the peer's host.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return forwarded
            .split(',')
            .next()
            .unwrap_or(forwarded)
            .to_string();
    }
    peer.ip().to_string()
}

/// Pipeline outputs stashed by the request rewriter for the response
/// rewriter. Single writer, single reader, request lifetime.
#[derive(Debug, Default)]
pub struct AdmissionReport {
    /// Warnings gathered from mutators and validators, in stage order.
    pub warnings: Vec<String>,

    /// A validator rejection on the validate route, reported in-band
    /// instead of failing the forward.
    pub validation_error: Option<AdmissionError>,
}

impl AdmissionReport {
    /// Whether the upstream response needs rewriting at all.
    pub fn requires_rewrite(&self) -> bool {
        !self.warnings.is_empty() || self.validation_error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn peer() -> SocketAddr {
        "10.9.8.7:51234".parse().unwrap()
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9".parse().unwrap());
        assert_eq!(client_ip(&headers, peer()), "203.0.113.9");
    }

    #[test]
    fn test_client_ip_takes_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            "203.0.113.9,198.51.100.2".parse().unwrap(),
        );
        assert_eq!(client_ip(&headers, peer()), "203.0.113.9");
    }

    #[test]
    fn test_client_ip_falls_back_to_peer_host() {
        assert_eq!(client_ip(&HeaderMap::new(), peer()), "10.9.8.7");
    }

    #[test]
    fn test_empty_forwarded_for_falls_back() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "".parse().unwrap());
        assert_eq!(client_ip(&headers, peer()), "10.9.8.7");
    }

    #[test]
    fn test_context_serializes_with_nomad_casing() {
        let ctx = RequestContext::new("203.0.113.9".to_string());
        let value = serde_json::to_value(&ctx).unwrap();
        assert_eq!(
            value,
            json!({
                "ClientIP": "203.0.113.9",
                "AccessorID": "",
                "TokenInfo": null,
            })
        );
    }

    #[test]
    fn test_with_token_populates_accessor() {
        let token: AclToken =
            serde_json::from_value(json!({"AccessorID": "abc-123"})).unwrap();
        let ctx = RequestContext::new("203.0.113.9".to_string()).with_token(token);
        assert_eq!(ctx.accessor_id, "abc-123");
        assert!(ctx.token_info.is_some());
    }

    #[test]
    fn test_report_requires_rewrite() {
        let mut report = AdmissionReport::default();
        assert!(!report.requires_rewrite());
        report.warnings.push("cpu low".to_string());
        assert!(report.requires_rewrite());
    }
}
