//! jobgate - Admission-control reverse proxy for Nomad job submissions.
//!
//! jobgate sits between Nomad clients and the Nomad HTTP API. Job register,
//! plan and validate requests are intercepted, the embedded job specification
//! is run through a configured pipeline of mutators (which may rewrite the
//! job) and validators (which may reject it or attach warnings), and the
//! possibly-rewritten request is forwarded upstream. On the way back, locally
//! produced warnings and validation errors are merged into the upstream reply
//! so clients see a single answer in Nomad's native format. Everything else
//! passes through untouched.
//!
//! # Request flow
//!
//! - **Register / Plan**: a hard error from any stage stops the request with
//!   a 500; otherwise the mutated job is forwarded and warnings are merged
//!   into the upstream `Warnings` field.
//! - **Validate**: mutators run first and may still fail the request, but a
//!   validator rejection is reported in-band through the upstream reply's
//!   `ValidationErrors` / `Error` fields while the forward proceeds.
//! - **Everything else**: streamed through unmodified.

use std::time::Duration;

/// Timeout applied to every outbound call: upstream forwards, webhook
/// stages, token resolution and registry lookups. Matches Nomad's own
/// blocking-query ceiling (300 s) with headroom.
pub const TRANSPORT_TIMEOUT: Duration = Duration::from_secs(310);

pub mod admission;
pub mod config;
pub mod context;
pub mod error;
pub mod multierror;
pub mod nomad;
pub mod proxy;
pub mod rewrite;
pub mod routes;
pub mod tls;
pub mod token;
