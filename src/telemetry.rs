//! Telemetry for rate limiting decisions.
//!
//! Every `acquire` emits [`RateLimitEvent`]s to a [`TelemetrySink`], which is
//! a `tower::Service<RateLimitEvent>` so sinks compose with ordinary tower
//! combinators. Emission is best-effort: a sink that is not ready or fails
//! never affects the admission decision.
//!
//! ```rust
//! use bucketeer::telemetry::{MemorySink, RateLimitEvent};
//! use std::time::Duration;
//!
//! let sink = MemorySink::with_capacity(100);
//! let event = RateLimitEvent::Waiting { key: "global".into(), retry: 1, wait: Duration::from_millis(100) };
//! assert!(event.to_string().contains("waiting"));
//! # let _ = sink;
//! ```

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::Service;

/// Events emitted by a limiter.
#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitEvent {
    /// A token was spent.
    Admitted {
        /// Bucket identifier.
        key: String,
        /// Tokens left afterwards.
        remaining: f64,
        /// Wait-and-retry cycles it took.
        retries: u32,
    },
    /// The bucket was short; the caller is about to sleep.
    Waiting {
        /// Bucket identifier.
        key: String,
        /// 1-indexed retry about to be made.
        retry: u32,
        /// Sleep before the retry.
        wait: Duration,
    },
    /// The retry budget ran out.
    Rejected {
        /// Bucket identifier.
        key: String,
        /// Wait-and-retry cycles performed.
        retries: u32,
        /// Time until a token would have been available.
        wait: Duration,
    },
}

impl fmt::Display for RateLimitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Admitted { key, remaining, retries } => {
                write!(f, "admitted[{}] remaining={:.3} retries={}", key, remaining, retries)
            }
            Self::Waiting { key, retry, wait } => {
                write!(f, "waiting[{}] retry={} wait={:?}", key, retry, wait)
            }
            Self::Rejected { key, retries, wait } => {
                write!(f, "rejected[{}] retries={} next_token_in={:?}", key, retries, wait)
            }
        }
    }
}

/// A telemetry sink that consumes limiter events.
pub trait TelemetrySink:
    Service<RateLimitEvent, Response = (), Error = Self::SinkError> + Clone + Send + Sync + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: RateLimitEvent)
where
    S: Service<RateLimitEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

type SinkFuture = Pin<Box<dyn Future<Output = Result<(), Infallible>> + Send>>;

/// A no-op telemetry sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<RateLimitEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: RateLimitEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// A telemetry sink that logs events using the `tracing` crate.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<RateLimitEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: RateLimitEvent) -> Self::Future {
        tracing::info!(target: "bucketeer::telemetry", event = %event, "rate_limit_event");
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// A telemetry sink that keeps the most recent events in memory.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<RateLimitEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<RateLimitEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events dropped because the buffer was full.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Count of `Rejected` events currently buffered.
    pub fn rejections(&self) -> usize {
        self.events().iter().filter(|e| matches!(e, RateLimitEvent::Rejected { .. })).count()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<RateLimitEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: RateLimitEvent) -> Self::Future {
        let mut guard = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admitted(n: u32) -> RateLimitEvent {
        RateLimitEvent::Admitted { key: "k".into(), remaining: 1.0, retries: n }
    }

    #[tokio::test]
    async fn memory_sink_is_bounded() {
        let sink = MemorySink::with_capacity(2);
        for n in 0..3 {
            emit_best_effort(sink.clone(), admitted(n)).await;
        }
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.evicted(), 1);
        assert_eq!(sink.events()[0], admitted(1));
    }

    #[tokio::test]
    async fn memory_sink_counts_rejections() {
        let sink = MemorySink::new();
        emit_best_effort(sink.clone(), admitted(0)).await;
        emit_best_effort(
            sink.clone(),
            RateLimitEvent::Rejected { key: "k".into(), retries: 2, wait: Duration::from_millis(5) },
        )
        .await;
        assert_eq!(sink.rejections(), 1);
    }

    #[tokio::test]
    async fn null_and_log_sinks_accept_everything() {
        emit_best_effort(NullSink, admitted(0)).await;
        emit_best_effort(LogSink, admitted(1)).await;
    }

    #[test]
    fn display_is_compact() {
        let event = RateLimitEvent::Rejected {
            key: "10.0.0.1".into(),
            retries: 5,
            wait: Duration::from_millis(100),
        };
        assert_eq!(event.to_string(), "rejected[10.0.0.1] retries=5 next_token_in=100ms");
    }
}
