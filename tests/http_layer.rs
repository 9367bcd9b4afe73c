//! HTTP middleware behaviour seen from the outside.
use bucketeer::{
    ClockSleeper, HttpRateLimitLayer, KeyedRateLimiter, ManualClock, RateLimitLayer,
    TokenBucketLimiter,
};
use futures::future::Ready;
use http::{header, Request, Response, StatusCode};
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::{service_fn, Layer, Service, ServiceBuilder, ServiceExt};

/// Answers every request and counts how often it ran.
#[derive(Clone)]
struct CountingHandler {
    calls: Arc<AtomicUsize>,
}

impl CountingHandler {
    fn new(calls: Arc<AtomicUsize>) -> Self {
        Self { calls }
    }
}

impl Service<Request<()>> for CountingHandler {
    type Response = Response<String>;
    type Error = Infallible;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: Request<()>) -> Self::Future {
        self.calls.fetch_add(1, Ordering::SeqCst);
        futures::future::ready(Ok(Response::new(String::from("handled"))))
    }
}

#[tokio::test]
async fn rejected_requests_never_reach_the_handler() {
    let clock = ManualClock::new();
    let limiter = Arc::new(
        TokenBucketLimiter::builder()
            .requests_per_second(2.0)
            .burst_size(3.0)
            .max_retries(0)
            .with_clock(clock.clone())
            .build()
            .unwrap(),
    );
    let calls = Arc::new(AtomicUsize::new(0));
    let svc = ServiceBuilder::new()
        .layer(HttpRateLimitLayer::new(limiter))
        .service(CountingHandler::new(calls.clone()));

    let mut statuses = Vec::new();
    for _ in 0..5 {
        statuses.push(svc.clone().oneshot(Request::new(())).await.unwrap().status());
    }
    assert_eq!(
        statuses,
        vec![
            StatusCode::OK,
            StatusCode::OK,
            StatusCode::OK,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::TOO_MANY_REQUESTS,
        ]
    );
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // Half a second buys one token at 2/s.
    clock.advance(Duration::from_millis(500));
    let response = svc.oneshot(Request::new(())).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.body(), "handled");
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn throttled_response_carries_retry_after() {
    let limiter = Arc::new(
        TokenBucketLimiter::builder()
            .requests_per_second(0.25)
            .burst_size(1.0)
            .max_retries(0)
            .with_clock(ManualClock::new())
            .build()
            .unwrap(),
    );
    let handler = CountingHandler::new(Arc::new(AtomicUsize::new(0)));
    let svc = HttpRateLimitLayer::new(limiter).layer(handler);

    svc.clone().oneshot(Request::new(())).await.unwrap();
    let limited = svc.oneshot(Request::new(())).await.unwrap();

    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    // One token every four seconds.
    assert_eq!(limited.headers()[header::RETRY_AFTER], "4");
    assert_eq!(limited.headers()[header::CONTENT_TYPE], "text/plain; charset=utf-8");
    assert_eq!(limited.body(), "Too Many Requests");
}

#[tokio::test]
async fn waiting_request_is_served_after_refill() {
    let clock = ManualClock::new();
    let sleeper = ClockSleeper::advancing(clock.clone());
    let limiter = Arc::new(
        TokenBucketLimiter::builder()
            .requests_per_second(10.0)
            .burst_size(1.0)
            .max_retries(2)
            .with_clock(clock)
            .with_sleeper(sleeper.clone())
            .build()
            .unwrap(),
    );
    let handler = CountingHandler::new(Arc::new(AtomicUsize::new(0)));
    let svc = HttpRateLimitLayer::new(limiter).layer(handler);

    assert_eq!(svc.clone().oneshot(Request::new(())).await.unwrap().status(), StatusCode::OK);
    assert_eq!(svc.oneshot(Request::new(())).await.unwrap().status(), StatusCode::OK);
    assert_eq!(sleeper.calls(), vec![Duration::from_millis(100)]);
}

#[tokio::test]
async fn keyed_layer_isolates_api_keys() {
    let limiter = Arc::new(
        KeyedRateLimiter::builder()
            .requests_per_second(1.0)
            .burst_size(2.0)
            .max_retries(0)
            .with_clock(ManualClock::new())
            .build_keyed()
            .unwrap(),
    );
    let api_key = |req: &Request<()>| {
        req.headers()
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("anonymous")
            .to_string()
    };
    let svc = ServiceBuilder::new()
        .layer(HttpRateLimitLayer::keyed(limiter.clone(), api_key))
        .service(CountingHandler::new(Arc::new(AtomicUsize::new(0))));
    let with_key =
        |key: &'static str| Request::builder().header("x-api-key", key).body(()).unwrap();

    for _ in 0..2 {
        assert_eq!(svc.clone().oneshot(with_key("alpha")).await.unwrap().status(), StatusCode::OK);
    }
    assert_eq!(
        svc.clone().oneshot(with_key("alpha")).await.unwrap().status(),
        StatusCode::TOO_MANY_REQUESTS
    );
    assert_eq!(svc.clone().oneshot(with_key("beta")).await.unwrap().status(), StatusCode::OK);
    assert_eq!(svc.oneshot(Request::new(())).await.unwrap().status(), StatusCode::OK);

    assert_eq!(limiter.len().await.unwrap(), 3);
    assert_eq!(limiter.tokens("alpha").await.unwrap(), 0.0);
}

#[tokio::test]
async fn generic_layer_composes_with_service_builder() {
    let limiter = Arc::new(
        TokenBucketLimiter::builder()
            .requests_per_second(1.0)
            .burst_size(1.0)
            .max_retries(0)
            .with_clock(ManualClock::new())
            .build()
            .unwrap(),
    );
    let svc = ServiceBuilder::new()
        .layer(RateLimitLayer::new(limiter))
        .service(service_fn(|n: u32| async move { Ok::<_, Infallible>(n * 2) }));

    assert_eq!(svc.clone().oneshot(21).await.unwrap(), 42);
    let err = svc.oneshot(1).await.unwrap_err();
    assert!(err.is_rate_limited());
    assert_eq!(err.to_string(), "rate limited (retry after 1s)");
}
