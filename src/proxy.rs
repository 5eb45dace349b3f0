//! The reverse-proxy host.
//!
//! Every request is classified, given a request context (with optional
//! token resolution), and forwarded to the configured Nomad address.
//! Intercepted routes are buffered through the admission pipeline on the
//! way in and through the response rewriter on the way out; passthrough
//! traffic streams in both directions without copying.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::TryStreamExt;
use http::header::HeaderName;
use http::{HeaderMap, Request, Response, StatusCode, Uri};
use http_body::{Body as _, Frame};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyDataStream, BodyExt, Full, StreamBody};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};
use url::Url;

use crate::admission::Pipeline;
use crate::config::{Config, ConfigError, NomadTlsConfig};
use crate::context::{client_ip, RequestContext};
use crate::error::ProxyError;
use crate::rewrite::{admit_request, rewrite_response};
use crate::routes::{classify, RouteClass};
use crate::token::TokenResolver;
use crate::TRANSPORT_TIMEOUT;

/// Response body type: buffered replies and streamed upstream bodies share
/// one boxed representation.
pub type ProxyBody = UnsyncBoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

/// Hop-by-hop headers are not forwarded in either direction. Framing is
/// re-established per hop, so `transfer-encoding` stays local too.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Build the upstream transport, including Nomad-side TLS material.
/// Shared by request forwarding and token resolution.
fn build_upstream_client(tls: Option<&NomadTlsConfig>) -> Result<reqwest::Client, ConfigError> {
    let client_err = |reason: String| ConfigError::Tls { reason };

    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .timeout(TRANSPORT_TIMEOUT)
        .connect_timeout(TRANSPORT_TIMEOUT)
        .tcp_keepalive(TRANSPORT_TIMEOUT)
        .pool_max_idle_per_host(32)
        .pool_idle_timeout(TRANSPORT_TIMEOUT)
        .tcp_nodelay(true)
        .redirect(reqwest::redirect::Policy::none());

    if let Some(tls) = tls {
        if let Some(ca_file) = &tls.ca_file {
            let pem = std::fs::read(ca_file)
                .map_err(|e| client_err(format!("reading {ca_file}: {e}")))?;
            let certificate = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| client_err(format!("parsing {ca_file}: {e}")))?;
            builder = builder.add_root_certificate(certificate);
        }

        if let (Some(cert_file), Some(key_file)) = (&tls.cert_file, &tls.key_file) {
            let mut pem = std::fs::read(cert_file)
                .map_err(|e| client_err(format!("reading {cert_file}: {e}")))?;
            pem.extend(
                std::fs::read(key_file)
                    .map_err(|e| client_err(format!("reading {key_file}: {e}")))?,
            );
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| client_err(format!("assembling client identity: {e}")))?;
            builder = builder.identity(identity);
        }

        if tls.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
    }

    builder
        .build()
        .map_err(|e| client_err(format!("building upstream client: {e}")))
}

/// The proxy service: one instance shared by every connection.
pub struct ProxyService {
    upstream: Url,
    client: reqwest::Client,
    pipeline: Pipeline,
    resolver: TokenResolver,
}

impl ProxyService {
    pub fn new(config: &Config, pipeline: Pipeline) -> Result<Self, ConfigError> {
        let upstream = Url::parse(&config.nomad.address).map_err(|e| ConfigError::InvalidUrl {
            url: config.nomad.address.clone(),
            reason: e.to_string(),
        })?;

        let client = build_upstream_client(config.nomad.tls.as_ref())?;
        let resolver = TokenResolver::new(client.clone(), upstream.clone());

        Ok(Self {
            upstream,
            client,
            pipeline,
            resolver,
        })
    }

    /// Handle one request. Errors are rendered into replies here so the
    /// connection layer stays infallible.
    pub async fn handle(&self, request: Request<Incoming>, peer: SocketAddr) -> Response<ProxyBody> {
        match self.dispatch(request, peer).await {
            Ok(response) => response,
            Err(error) => {
                warn!(%error, "error applying admission controllers");
                error.to_response().map(|body| {
                    body.map_err(|never: Infallible| match never {})
                        .boxed_unsync()
                })
            }
        }
    }

    async fn dispatch(
        &self,
        request: Request<Incoming>,
        peer: SocketAddr,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let route = classify(request.method(), request.uri().path());
        let context = self.request_context(&request, peer).await;

        if context.token_info.is_some() {
            info!(
                path = %request.uri().path(),
                method = %request.method(),
                client_ip = %context.client_ip,
                accessor_id = %context.accessor_id,
                "request received"
            );
        } else {
            info!(
                path = %request.uri().path(),
                method = %request.method(),
                client_ip = %context.client_ip,
                "request received"
            );
        }

        if !route.is_intercepted() {
            return self.forward_streaming(request).await;
        }

        let (parts, body) = request.into_parts();
        let bytes = body
            .collect()
            .await
            .map_err(|e| ProxyError::Body(e.to_string()))?
            .to_bytes();

        let (data, report) = admit_request(route, &bytes, context, &self.pipeline).await?;
        let response = self.forward_buffered(&parts, data).await?;

        if !report.requires_rewrite() {
            return streaming_response(response);
        }

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| ProxyError::RewriteResponse(e.to_string()))?;
        let rewritten = rewrite_response(route, &report, &headers, &body)?;
        buffered_response(status, &headers, rewritten)
    }

    /// Build the request context; token resolution failures only log.
    async fn request_context(&self, request: &Request<Incoming>, peer: SocketAddr) -> RequestContext {
        let mut context = RequestContext::new(client_ip(request.headers(), peer));

        if self.pipeline.resolve_token() {
            let token = request
                .headers()
                .get("x-nomad-token")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");

            // The initial bootstrap call legitimately carries no token, so
            // an unresolvable one must not fail the request.
            if !token.is_empty() {
                match self.resolver.resolve(token).await {
                    Ok(token_info) => context = context.with_token(token_info),
                    Err(error) => error!(%error, "resolving token failed"),
                }
            }
        }

        context
    }

    fn upstream_url(&self, uri: &Uri) -> Result<Url, ProxyError> {
        let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        format!(
            "{}{}",
            self.upstream.as_str().trim_end_matches('/'),
            path_and_query
        )
        .parse()
        .map_err(|e| ProxyError::Upstream(format!("building upstream URL: {e}")))
    }

    /// Forward without touching the body in either direction.
    async fn forward_streaming(
        &self,
        request: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let (parts, body) = request.into_parts();
        let url = self.upstream_url(&parts.uri)?;

        let mut builder = self.client.request(parts.method.clone(), url);
        builder = copy_request_headers(builder, &parts.headers);

        let request = if body.size_hint().exact() == Some(0) {
            builder.body(Vec::new())
        } else {
            builder.body(reqwest::Body::wrap_stream(BodyDataStream::new(body)))
        };

        let response = request
            .send()
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;

        streaming_response(response)
    }

    /// Forward an already-buffered (rewritten) body.
    async fn forward_buffered(
        &self,
        parts: &http::request::Parts,
        body: Vec<u8>,
    ) -> Result<reqwest::Response, ProxyError> {
        let url = self.upstream_url(&parts.uri)?;

        let mut builder = self.client.request(parts.method.clone(), url);
        builder = copy_request_headers(builder, &parts.headers);

        builder
            .body(body)
            .send()
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))
    }
}

fn copy_request_headers(
    mut builder: reqwest::RequestBuilder,
    headers: &HeaderMap,
) -> reqwest::RequestBuilder {
    for (name, value) in headers {
        // Host follows the upstream URL; the transport recomputes length
        // and framing.
        if is_hop_by_hop(name)
            || *name == http::header::HOST
            || *name == http::header::CONTENT_LENGTH
        {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
}

/// Relay an upstream reply as-is, streaming the body.
fn streaming_response(response: reqwest::Response) -> Result<Response<ProxyBody>, ProxyError> {
    let status = response.status();
    let headers = response.headers().clone();

    let mut builder = Response::builder().status(status);
    for (name, value) in &headers {
        if !is_hop_by_hop(name) {
            builder = builder.header(name, value);
        }
    }

    let stream = response
        .bytes_stream()
        .map_ok(Frame::data)
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>);

    builder
        .body(StreamBody::new(stream).boxed_unsync())
        .map_err(|e| ProxyError::Upstream(e.to_string()))
}

/// Relay a rewritten reply with a corrected `Content-Length`.
fn buffered_response(
    status: StatusCode,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response<ProxyBody>, ProxyError> {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        if !is_hop_by_hop(name) && *name != http::header::CONTENT_LENGTH {
            builder = builder.header(name, value);
        }
    }
    builder = builder.header(http::header::CONTENT_LENGTH, body.len());

    builder
        .body(
            Full::new(body)
                .map_err(|never: Infallible| match never {})
                .boxed_unsync(),
        )
        .map_err(|e| ProxyError::Upstream(e.to_string()))
}

/// Accept loop: one task per connection, optional TLS termination.
///
/// Accept errors are logged and the loop keeps serving; callers race this
/// future against their shutdown signal.
pub async fn serve(listener: TcpListener, tls: Option<TlsAcceptor>, service: Arc<ProxyService>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "failed to accept connection");
                continue;
            }
        };

        let service = service.clone();
        let tls = tls.clone();

        tokio::spawn(async move {
            let served = match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => serve_connection(TokioIo::new(tls_stream), peer, service).await,
                    Err(e) => {
                        warn!(error = %e, peer = %peer, "tls handshake failed");
                        return;
                    }
                },
                None => serve_connection(TokioIo::new(stream), peer, service).await,
            };

            if let Err(e) = served {
                error!(error = %e, peer = %peer, "connection error");
            }
        });
    }
}

async fn serve_connection<I>(
    io: I,
    peer: SocketAddr,
    service: Arc<ProxyService>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let svc = hyper::service::service_fn(move |request| {
        let service = service.clone();
        async move { Ok::<_, Infallible>(service.handle(request, peer).await) }
    });

    auto::Builder::new(TokioExecutor::new())
        .serve_connection(io, svc)
        .await
}
