//! The operator-facing HTTP server: probes, metrics, validator health and
//! the authoring routes.

use crate::authoring::{AuthoringPipeline, PipelineError, Stage};
use futures::{future, prelude::*};
use http::{header, Method, Request, Response, StatusCode};
use policy_pipeline_api::{error_response, json_response, read_text, Body};
use policy_pipeline_core::{LifecycleStage, PolicyId};
use policy_pipeline_validator::Validator;
use prometheus_client::{encoding::text::encode, registry::Registry};
use serde::Serialize;
use std::{
    convert::Infallible,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task,
};
use tracing::{debug, warn};


type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone)]
pub struct Admin {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Registry,
    ready: AtomicBool,
    validator: Validator,
    authoring: AuthoringPipeline,
}

#[derive(Debug, PartialEq, Eq)]
enum Route {
    Live,
    Ready,
    Metrics,
    Health,
    Submit(PolicyId),
    Transition(PolicyId, LifecycleStage),
    Promote(PolicyId),
    Remove(PolicyId),
    NotFound,
}

#[derive(Serialize)]
struct PipelineFailure<'a> {
    error: String,
    stage: Stage,

    #[serde(skip_serializing_if = "Option::is_none")]
    validation: Option<&'a policy_pipeline_validator::ValidationResult>,
}

// === impl Admin ===

impl Admin {
    pub fn new(registry: Registry, validator: Validator, authoring: AuthoringPipeline) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                ready: AtomicBool::new(false),
                validator,
                authoring,
            }),
        }
    }

    /// Marks start-up as complete.
    pub fn set_ready(&self) {
        self.inner.ready.store(true, Ordering::Release);
    }

    async fn handle<B>(self, req: Request<B>) -> Response<Body>
    where
        B: http_body::Body,
        B::Error: Into<BoxError>,
    {
        match Route::of(req.method(), req.uri().path()) {
            Route::Live => text(StatusCode::OK, "live\n"),
            Route::Ready if self.inner.ready.load(Ordering::Acquire) => {
                text(StatusCode::OK, "ready\n")
            }
            Route::Ready => text(StatusCode::SERVICE_UNAVAILABLE, "not ready\n"),
            Route::Metrics => self.metrics(),
            Route::Health => {
                let report = self.inner.validator.health().await;
                let status = if report.healthy {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                json_response(status, &report)
            }
            Route::Submit(id) => match read_text(req.into_body()).await {
                Ok(content) => respond(self.inner.authoring.submit(id, content).await),
                Err(rsp) => rsp,
            },
            Route::Transition(id, stage) => {
                respond(self.inner.authoring.transition(id, stage).await)
            }
            Route::Promote(id) => respond(self.inner.authoring.promote(id).await),
            Route::Remove(id) => respond(self.inner.authoring.remove(id).await),
            Route::NotFound => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::default())
                .expect("not found response must be valid"),
        }
    }

    fn metrics(&self) -> Response<Body> {
        let mut buf = String::new();
        if let Err(error) = encode(&mut buf, &self.inner.registry) {
            warn!(%error, "Failed to encode metrics");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics");
        }
        Response::builder()
            .status(StatusCode::OK)
            .header(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )
            .body(Body::from(buf))
            .expect("metrics response must be valid")
    }
}

impl<B> tower::Service<Request<B>> for Admin
where
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
        Box::pin(self.clone().handle(req).map(Ok))
    }
}

// === impl Route ===

impl Route {
    fn of(method: &Method, path: &str) -> Self {
        let segments = path
            .trim_matches('/')
            .split('/')
            .collect::<Vec<_>>();
        match (method, &segments[..]) {
            (&Method::GET, ["live"]) => Self::Live,
            (&Method::GET, ["ready"]) => Self::Ready,
            (&Method::GET, ["metrics"]) => Self::Metrics,
            (&Method::GET, ["health"]) => Self::Health,
            (&Method::PUT, ["policies", id, "content"]) => Self::policy(id, Self::Submit),
            (&Method::POST, ["policies", id, "stage", stage]) => match stage.parse() {
                Ok(stage) => Self::policy(id, |id| Self::Transition(id, stage)),
                Err(_) => Self::NotFound,
            },
            (&Method::POST, ["policies", id, "promote"]) => Self::policy(id, Self::Promote),
            (&Method::DELETE, ["policies", id]) => Self::policy(id, Self::Remove),
            _ => Self::NotFound,
        }
    }

    fn policy(id: &str, route: impl FnOnce(PolicyId) -> Self) -> Self {
        id.parse().map_or(Self::NotFound, route)
    }
}

fn respond<T: Serialize>(res: Result<T, PipelineError>) -> Response<Body> {
    match res {
        Ok(done) => json_response(StatusCode::OK, &done),
        Err(error) => {
            let status = if error.is_unknown_policy() {
                StatusCode::NOT_FOUND
            } else {
                match error.stage {
                    Stage::Validate => StatusCode::UNPROCESSABLE_ENTITY,
                    Stage::Commit | Stage::Move | Stage::Delete => StatusCode::BAD_GATEWAY,
                    Stage::Catalog => StatusCode::INTERNAL_SERVER_ERROR,
                }
            };
            debug!(%error, %status, "Authoring request failed");
            json_response(
                status,
                &PipelineFailure {
                    error: format!("{:#}", error.source),
                    stage: error.stage,
                    validation: error.rejection(),
                },
            )
        }
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(body))
        .expect("text response must be valid")
}
