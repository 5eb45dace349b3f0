//! Classification of incoming requests.
//!
//! Only three Nomad endpoints carry a mutable job payload. Everything else
//! is proxied untouched. The Nomad CLI submits with PUT while the web UI
//! uses POST, so both methods are accepted.

use std::sync::LazyLock;

use http::Method;
use regex::Regex;

static JOB_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/v1/job/[A-Za-z][A-Za-z0-9-]*$").expect("valid regex"));

static JOB_PLAN_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/v1/job/[A-Za-z][A-Za-z0-9-]*/plan$").expect("valid regex"));

/// What the proxy does with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    /// Job submission: `/v1/jobs` or `/v1/job/{id}`.
    Register,
    /// Dry-run planning: `/v1/job/{id}/plan`.
    Plan,
    /// Syntax/semantics check: `/v1/validate/job`.
    Validate,
    /// Any other endpoint; forwarded without inspection.
    Passthrough,
}

impl RouteClass {
    /// Whether the request body carries a job the pipeline should see.
    pub fn is_intercepted(&self) -> bool {
        !matches!(self, RouteClass::Passthrough)
    }
}

/// Map `(method, path)` to a [`RouteClass`].
///
/// Total and side-effect free; the same input always yields the same label.
pub fn classify(method: &Method, path: &str) -> RouteClass {
    if !matches!(*method, Method::PUT | Method::POST) {
        return RouteClass::Passthrough;
    }
    if path == "/v1/jobs" || JOB_PATH.is_match(path) {
        RouteClass::Register
    } else if JOB_PLAN_PATH.is_match(path) {
        RouteClass::Plan
    } else if path == "/v1/validate/job" {
        RouteClass::Validate
    } else {
        RouteClass::Passthrough
    }
}
