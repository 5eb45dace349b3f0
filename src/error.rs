//! Request-level error handling.
//!
//! Runtime errors never terminate the process; they become HTTP replies.
//! Admission rejections and malformed client bodies answer with 500 and the
//! error text, failures talking to or rewriting the upstream answer with
//! 502.

use bytes::Bytes;
use http::{Response, StatusCode};
use http_body_util::Full;

use crate::admission::AdmissionError;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The client sent a body that does not decode as the route's envelope.
    #[error("failed decoding job request: {0}")]
    DecodeRequest(String),

    /// The rewritten envelope failed to serialize.
    #[error("failed encoding job request: {0}")]
    EncodeRequest(String),

    /// A stage returned a hard error on a route where that stops the
    /// forward.
    #[error("admission controllers rejected the request: {0}")]
    Admission(#[from] AdmissionError),

    /// Reading the client request body failed.
    #[error("failed reading request body: {0}")]
    Body(String),

    /// The upstream call failed or the reply could not be relayed.
    #[error("upstream request failed: {0}")]
    Upstream(String),

    /// The upstream reply could not be decoded or re-encoded while merging
    /// warnings or validation errors.
    #[error("failed rewriting upstream response: {0}")]
    RewriteResponse(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Upstream(_) | ProxyError::RewriteResponse(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Render the error as the HTTP reply sent to the client.
    pub fn to_response(&self) -> Response<Full<Bytes>> {
        Response::builder()
            .status(self.status())
            .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(Full::new(Bytes::from(self.to_string())))
            .unwrap_or_else(|_| {
                let mut response = Response::new(Full::new(Bytes::from("internal error")));
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            })
    }
}
