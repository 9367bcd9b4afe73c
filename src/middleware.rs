//! Tower middleware enforcing a limiter before the wrapped service runs.
//!
//! - [`RateLimitLayer`] works for any request type and reports rejections as
//!   [`ResilienceError::RateLimited`].
//! - [`HttpRateLimitLayer`] wraps `http` services and answers rejected
//!   requests itself with `429 Too Many Requests`.
//!
//! Both ask an [`Admission`] whether a request may proceed. The wrapped
//! service is never called for a rejected request.

use crate::error::{AcquireError, ResilienceError};
use crate::keyed::KeyedRateLimiter;
use crate::limiter::RateLimiter;
use crate::store::TokenStore;
use crate::telemetry::TelemetrySink;
use futures::future::BoxFuture;
use http::{header, HeaderValue, Request, Response, StatusCode};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower_layer::Layer;
use tower_service::Service;

/// Decides whether a request may proceed.
pub trait Admission<Req>: Send + Sync + 'static {
    /// Spend a token on behalf of `req`. Anything needed from the request is
    /// read before the returned future is created.
    fn admit<'a>(&'a self, req: &Req) -> BoxFuture<'a, Result<(), AcquireError>>;
}

/// Every request draws from one limiter.
#[derive(Debug)]
pub struct GlobalAdmission<L>(Arc<L>);

impl<L, Req> Admission<Req> for GlobalAdmission<L>
where
    L: RateLimiter + 'static,
{
    fn admit<'a>(&'a self, _req: &Req) -> BoxFuture<'a, Result<(), AcquireError>> {
        self.0.acquire()
    }
}

/// Each request draws from the bucket named by `extract(req)`.
pub struct KeyedAdmission<S, T, F> {
    limiter: Arc<KeyedRateLimiter<S, T>>,
    extract: F,
}

impl<S, T, F, Req> Admission<Req> for KeyedAdmission<S, T, F>
where
    S: TokenStore + 'static,
    T: TelemetrySink,
    T::Future: Send,
    F: Fn(&Req) -> String + Send + Sync + 'static,
{
    fn admit<'a>(&'a self, req: &Req) -> BoxFuture<'a, Result<(), AcquireError>> {
        let key = (self.extract)(req);
        Box::pin(async move { self.limiter.acquire(&key).await })
    }
}

/// A layer that enforces rate limits using an [`Admission`].
#[derive(Debug)]
pub struct RateLimitLayer<A> {
    admission: Arc<A>,
}

impl<A> Clone for RateLimitLayer<A> {
    fn clone(&self) -> Self {
        Self { admission: self.admission.clone() }
    }
}

impl<L> RateLimitLayer<GlobalAdmission<L>> {
    /// Create a new rate limit layer drawing from one shared limiter.
    pub fn new(limiter: Arc<L>) -> Self {
        Self { admission: Arc::new(GlobalAdmission(limiter)) }
    }
}

impl<S, T, F> RateLimitLayer<KeyedAdmission<S, T, F>> {
    /// Create a layer that picks a bucket per request with `extract`.
    pub fn keyed(limiter: Arc<KeyedRateLimiter<S, T>>, extract: F) -> Self {
        Self { admission: Arc::new(KeyedAdmission { limiter, extract }) }
    }
}

impl<S, A> Layer<S> for RateLimitLayer<A> {
    type Service = RateLimitService<S, A>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService { inner: service, admission: self.admission.clone() }
    }
}

/// Middleware service that enforces rate limits.
#[derive(Debug)]
pub struct RateLimitService<S, A> {
    inner: S,
    admission: Arc<A>,
}

impl<S: Clone, A> Clone for RateLimitService<S, A> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), admission: self.admission.clone() }
    }
}

impl<S, A, Req> Service<Req> for RateLimitService<S, A>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    A: Admission<Req>,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = ResilienceError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(ResilienceError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let admission = self.admission.clone();
        // Keep the service that was driven to readiness for this request.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            // Bound separately so no borrow of `req` is held across the await.
            let admitted = admission.admit(&req);
            admitted.await?;
            inner.call(req).await.map_err(ResilienceError::Inner)
        })
    }
}

/// Like [`RateLimitLayer`] but answers rejected HTTP requests with a status code.
///
/// - throttled: `429 Too Many Requests`, a `Retry-After` header in whole
///   seconds and a short plain-text body;
/// - limiter store unreachable: `503 Service Unavailable`.
#[derive(Debug)]
pub struct HttpRateLimitLayer<A> {
    admission: Arc<A>,
}

impl<A> Clone for HttpRateLimitLayer<A> {
    fn clone(&self) -> Self {
        Self { admission: self.admission.clone() }
    }
}

impl<L> HttpRateLimitLayer<GlobalAdmission<L>> {
    /// Every route behind this layer shares `limiter`.
    pub fn new(limiter: Arc<L>) -> Self {
        Self { admission: Arc::new(GlobalAdmission(limiter)) }
    }
}

impl<S, T, F> HttpRateLimitLayer<KeyedAdmission<S, T, F>> {
    /// Requests are limited per `extract(req)`, e.g. client address or API key.
    pub fn keyed(limiter: Arc<KeyedRateLimiter<S, T>>, extract: F) -> Self {
        Self { admission: Arc::new(KeyedAdmission { limiter, extract }) }
    }
}

impl<S, A> Layer<S> for HttpRateLimitLayer<A> {
    type Service = HttpRateLimitService<S, A>;

    fn layer(&self, service: S) -> Self::Service {
        HttpRateLimitService { inner: service, admission: self.admission.clone() }
    }
}

/// Service produced by [`HttpRateLimitLayer`].
#[derive(Debug)]
pub struct HttpRateLimitService<S, A> {
    inner: S,
    admission: Arc<A>,
}

impl<S: Clone, A> Clone for HttpRateLimitService<S, A> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), admission: self.admission.clone() }
    }
}

impl<S, A, ReqBody, ResBody> Service<Request<ReqBody>> for HttpRateLimitService<S, A>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    A: Admission<Request<ReqBody>>,
    ReqBody: Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let admission = self.admission.clone();
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let admitted = admission.admit(&req);
            match admitted.await {
                Ok(()) => inner.call(req).await,
                Err(AcquireError::Exceeded(exceeded)) => {
                    tracing::debug!(
                        target: "bucketeer::http",
                        method = %req.method(),
                        path = req.uri().path(),
                        wait = ?exceeded.wait,
                        "request throttled"
                    );
                    Ok(too_many_requests(exceeded.wait))
                }
                Err(AcquireError::Store(err)) => {
                    tracing::error!(target: "bucketeer::http", error = %err, "rate limiter store failed");
                    Ok(plain(StatusCode::SERVICE_UNAVAILABLE, "Rate limiter unavailable"))
                }
            }
        })
    }
}

/// `Retry-After` value for `wait`: whole seconds, rounded up, at least one.
pub fn retry_after_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    secs.max(1)
}

fn too_many_requests<B: From<String>>(wait: Duration) -> Response<B> {
    let mut response = plain(StatusCode::TOO_MANY_REQUESTS, "Too Many Requests");
    response.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs(wait)));
    response
}

fn plain<B: From<String>>(status: StatusCode, message: &str) -> Response<B> {
    let mut response = Response::new(B::from(message.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}
