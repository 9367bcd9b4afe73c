//! Compile-time prelude coverage test.
use bucketeer::prelude::*;
use std::sync::Arc;
use tower::service_fn;
use tower_layer::Layer;
use tower_service::Service;

#[tokio::test]
async fn prelude_reexports_core_types() {
    let config = RateLimiterConfig::new(100.0, 10.0, 0).expect("valid config");
    let limiter = Arc::new(TokenBucketLimiter::new(config));
    let layer = RateLimitLayer::new(limiter.clone());

    let mut svc = layer.layer(service_fn(|_req: ()| async { Ok::<_, std::io::Error>(()) }));
    svc.call(()).await.expect("service call failed");

    let shared: Arc<dyn RateLimiter> = limiter;
    assert!(shared.tokens().await.expect("in-memory store") <= 10.0);

    let _keyed: KeyedRateLimiter =
        KeyedRateLimiter::builder().build_keyed().expect("defaults are valid");
    let _store = InMemoryTokenStore::new();
    let _sink = MemorySink::new();
    let _ = HttpRateLimitLayer::new(Arc::new(TokenBucketLimiter::new(config)));
}
