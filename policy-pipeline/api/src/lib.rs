#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The HTTP surface enforcement points and authors talk to.
//!
//! * `GET /v1/distributions/{id}` serves an enforcement point's current
//!   distribution. The response `ETag` is the revision; a request whose
//!   `If-None-Match` names the current revision gets `304 Not Modified`, or,
//!   with `?wait=<seconds>`, is held until a new revision is published.
//! * `POST /v1/validate` validates the request body as a policy document.
//! * `POST /v1/format` returns the canonically formatted document.

mod metrics;


pub use self::metrics::HttpMetrics;

use bytes::Bytes;
use futures::{future, prelude::*};
use http::{header, HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, Limited};
use hyper::{body::Incoming, server::conn::http1};
use hyper_util::{rt::TokioIo, service::TowerToHyperService};
use policy_pipeline_core::distribution::{DiscoverDistribution, Distribution, EnforcementPointId};
use policy_pipeline_validator::{Validator, ValidatorError};
use serde::Serialize;
use std::{convert::Infallible, net::SocketAddr, sync::Arc, task, time::Duration};
use tokio::{net::TcpListener, time};
use tracing::{debug, debug_span, info, instrument, warn, Instrument};

pub type Body = Full<Bytes>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Request bodies beyond this size are refused before reaching the
/// validator, which applies its own, lower limit.
const MAX_BODY: usize = 4 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    /// Requests that take longer are answered with `503`.
    pub request_timeout: Duration,

    /// Upper bound on how long a distribution request may be held.
    pub max_wait: Duration,
}

pub struct Api<D> {
    inner: Arc<Inner<D>>,
}

struct Inner<D> {
    discover: D,
    validator: Validator,
    config: ApiConfig,
    metrics: HttpMetrics,
    drain: drain::Watch,
}

#[derive(Debug, PartialEq, Eq)]
enum Route {
    Distribution(EnforcementPointId),
    Validate,
    Format,
    BadId,
    MethodNotAllowed(&'static str),
    NotFound,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

// === impl Api ===

impl<D> Clone for Api<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D> Api<D>
where
    D: DiscoverDistribution + Send + Sync + 'static,
{
    pub fn new(
        discover: D,
        validator: Validator,
        config: ApiConfig,
        metrics: HttpMetrics,
        drain: drain::Watch,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                discover,
                validator,
                config,
                metrics,
                drain,
            }),
        }
    }

    async fn handle<B>(self, req: Request<B>) -> Response<Body>
    where
        B: http_body::Body,
        B::Error: Into<BoxError>,
    {
        let route = Route::of(req.method(), req.uri().path());
        let handle = self.inner.metrics.start(route.name());
        let rsp = match time::timeout(self.inner.config.request_timeout, self.dispatch(route, req))
            .await
        {
            Ok(rsp) => rsp,
            Err(_) => {
                warn!(timeout = ?self.inner.config.request_timeout, "Request timed out");
                error_response(StatusCode::SERVICE_UNAVAILABLE, "request timed out")
            }
        };
        handle.end(rsp.status());
        rsp
    }

    async fn dispatch<B>(&self, route: Route, req: Request<B>) -> Response<Body>
    where
        B: http_body::Body,
        B::Error: Into<BoxError>,
    {
        match route {
            Route::Distribution(id) => {
                let wait = match parse_wait(req.uri().query()) {
                    Ok(wait) => wait.map(|w| w.min(self.inner.config.max_wait)),
                    Err(msg) => return error_response(StatusCode::BAD_REQUEST, msg),
                };
                self.get_distribution(id, req.headers(), wait).await
            }
            Route::Validate => match read_text(req.into_body()).await {
                Ok(content) => {
                    let result = self.inner.validator.validate(&content).await;
                    json_response(StatusCode::OK, &result)
                }
                Err(rsp) => rsp,
            },
            Route::Format => match read_text(req.into_body()).await {
                Ok(content) => self.format(&content).await,
                Err(rsp) => rsp,
            },
            Route::BadId => error_response(StatusCode::BAD_REQUEST, "invalid enforcement point id"),
            Route::MethodNotAllowed(allow) => Response::builder()
                .status(StatusCode::METHOD_NOT_ALLOWED)
                .header(header::ALLOW, allow)
                .body(Body::default())
                .expect("method not allowed response must be valid"),
            Route::NotFound => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::default())
                .expect("not found response must be valid"),
        }
    }

    #[instrument(skip(self, headers), fields(enforcement_point = %id))]
    async fn get_distribution(
        &self,
        id: EnforcementPointId,
        headers: &HeaderMap,
        wait: Option<Duration>,
    ) -> Response<Body> {
        let mut distribution = match self.inner.discover.get_distribution(id).await {
            Ok(Some(distribution)) => distribution,
            Ok(None) => return error_response(StatusCode::NOT_FOUND, "unknown enforcement point"),
            Err(error) => {
                warn!(%error, "Failed to look up distribution");
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, "lookup failed");
            }
        };

        let known = if_none_match(headers);
        if known == Some(distribution.revision) {
            if let Some(wait) = wait {
                distribution = self.wait_for_update(distribution, wait).await;
            }
        }

        // Serving a revision means the enforcement point has observed it.
        if let Err(error) = self
            .inner
            .discover
            .acknowledge(id, distribution.revision)
            .await
        {
            warn!(%error, revision = distribution.revision, "Failed to record acknowledgement");
        }

        if known == Some(distribution.revision) {
            return Response::builder()
                .status(StatusCode::NOT_MODIFIED)
                .header(header::ETAG, etag(distribution.revision))
                .body(Body::default())
                .expect("not modified response must be valid");
        }

        debug!(revision = distribution.revision, policies = distribution.policies.len(), "Serving distribution");
        let mut rsp = json_response(StatusCode::OK, &distribution);
        if let Ok(value) = etag(distribution.revision).parse() {
            rsp.headers_mut().insert(header::ETAG, value);
        }
        rsp
    }

    /// Holds a request until the distribution moves past `current`, the wait
    /// elapses or the server begins shutting down.
    async fn wait_for_update(&self, current: Distribution, wait: Duration) -> Distribution {
        let id = current.enforcement_point;
        let mut updates = match self.inner.discover.watch_distribution(id).await {
            Ok(Some(updates)) => updates,
            Ok(None) => return current,
            Err(error) => {
                warn!(%error, "Failed to watch distribution");
                return current;
            }
        };

        let shutdown = self.inner.drain.clone().signaled();
        let deadline = time::sleep(wait);
        tokio::pin!(shutdown, deadline);

        loop {
            tokio::select! {
                next = updates.next() => match next {
                    Some(d) if d.revision != current.revision => return d,
                    Some(_) => {}
                    None => return current,
                },
                _ = (&mut deadline) => return current,
                _ = (&mut shutdown) => return current,
            }
        }
    }

    async fn format(&self, content: &str) -> Response<Body> {
        match self.inner.validator.format(content).await {
            Ok(formatted) => Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
                .body(Body::from(formatted))
                .expect("format response must be valid"),
            Err(error) => {
                let status = match error {
                    ValidatorError::Rejected(_) | ValidatorError::Tool(_) => {
                        StatusCode::UNPROCESSABLE_ENTITY
                    }
                    ValidatorError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                    ValidatorError::Closed => StatusCode::SERVICE_UNAVAILABLE,
                    ValidatorError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                debug!(%error, "Formatting failed");
                error_response(status, &error.to_string())
            }
        }
    }
}

impl<D, B> tower::Service<Request<B>> for Api<D>
where
    D: DiscoverDistribution + Send + Sync + 'static,
    B: http_body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut task::Context<'_>) -> task::Poll<Result<(), Infallible>> {
        task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let api = self.clone();
        Box::pin(api.handle(req).map(Ok))
    }
}

/// Serves HTTP/1 on `addr` until shutdown is signaled. In-flight requests
/// are allowed to complete.
#[instrument(skip_all, fields(%addr))]
pub async fn serve<S>(addr: SocketAddr, svc: S, drain: drain::Watch) -> anyhow::Result<()>
where
    S: tower::Service<Request<Incoming>, Response = Response<Body>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "HTTP server listening");

    tokio::pin! {
        let shutdown = drain.clone().signaled();
    }

    loop {
        let (io, peer) = tokio::select! {
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(error) => {
                    warn!(%error, "Failed to accept connection");
                    continue;
                }
            },
            _ = (&mut shutdown) => {
                debug!("No longer accepting connections");
                return Ok(());
            }
        };

        let svc = TowerToHyperService::new(svc.clone());
        let drain = drain.clone();
        tokio::spawn(
            async move {
                let conn = http1::Builder::new().serve_connection(TokioIo::new(io), svc);
                tokio::pin!(conn);
                let res = tokio::select! {
                    res = conn.as_mut() => res,
                    handle = drain.signaled() => {
                        conn.as_mut().graceful_shutdown();
                        handle.release_after(conn).await
                    }
                };
                if let Err(error) = res {
                    debug!(%error, "Connection closed with error");
                }
            }
            .instrument(debug_span!("conn", %peer)),
        );
    }
}

// === impl Route ===

impl Route {
    fn of(method: &Method, path: &str) -> Self {
        let path = path.trim_end_matches('/');
        if let Some(id) = path.strip_prefix("/v1/distributions/") {
            if method != Method::GET && method != Method::HEAD {
                return Self::MethodNotAllowed("GET, HEAD");
            }
            return id.parse().map_or(Self::BadId, Self::Distribution);
        }
        match path {
            "/v1/validate" | "/v1/format" if method != Method::POST => {
                Self::MethodNotAllowed("POST")
            }
            "/v1/validate" => Self::Validate,
            "/v1/format" => Self::Format,
            _ => Self::NotFound,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Distribution(_) | Self::BadId => "distribution",
            Self::Validate => "validate",
            Self::Format => "format",
            Self::MethodNotAllowed(_) | Self::NotFound => "other",
        }
    }
}

fn etag(revision: u64) -> String {
    format!("\"{revision}\"")
}

/// Extracts the revision named by an `If-None-Match` header, if any.
fn if_none_match(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(header::IF_NONE_MATCH)?.to_str().ok()?;
    value.split(',').find_map(|tag| {
        let tag = tag.trim();
        let tag = tag.strip_prefix("W/").unwrap_or(tag);
        tag.trim_matches('"').parse().ok()
    })
}

fn parse_wait(query: Option<&str>) -> Result<Option<Duration>, &'static str> {
    let Some(query) = query else {
        return Ok(None);
    };
    for pair in query.split('&') {
        if let Some(secs) = pair.strip_prefix("wait=") {
            return secs
                .parse::<u64>()
                .map(|s| Some(Duration::from_secs(s)))
                .map_err(|_| "wait must be a number of seconds");
        }
    }
    Ok(None)
}

/// Reads a bounded UTF-8 request body, or the response refusing it.
pub async fn read_text<B>(body: B) -> Result<String, Response<Body>>
where
    B: http_body::Body,
    B::Error: Into<BoxError>,
{
    let bytes = match Limited::new(body, MAX_BODY).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(error) => {
            debug!(%error, "Failed to read request body");
            return Err(error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "request body could not be read within the size limit",
            ));
        }
    };
    String::from_utf8(bytes.to_vec())
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, "policy content must be UTF-8"))
}

pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    match serde_json::to_vec(body) {
        Ok(bytes) => Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(bytes))
            .expect("json response must be valid"),
        Err(error) => {
            warn!(%error, "Failed to encode response");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::default())
                .expect("error response must be valid")
        }
    }
}

pub fn error_response(status: StatusCode, error: &str) -> Response<Body> {
    json_response(status, &ErrorBody { error })
}
